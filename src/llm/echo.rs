use super::*;
use futures::stream::{self, StreamExt};

/// Offline provider that streams the prompt back word by word.
/// Handy for exercising the gateway without model credentials.
pub struct EchoProvider {
    name: String,
    delay: Duration,
}

impl Default for EchoProvider {
    fn default() -> Self {
        Self::new("echo", Duration::from_millis(25))
    }
}

impl EchoProvider {
    pub fn new(name: impl Into<String>, delay: Duration) -> Self {
        Self {
            name: name.into(),
            delay,
        }
    }
}

#[async_trait]
impl LlmProvider for EchoProvider {
    async fn invoke(&self, request: InvokeRequest) -> LlmResult<TokenStream> {
        let words: Vec<String> = request
            .prompt
            .split_inclusive(' ')
            .take(request.max_tokens as usize)
            .map(str::to_string)
            .collect();
        let delay = self.delay;

        let tokens = stream::iter(words).then(move |word| async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            Ok(StreamEvent::Token(word))
        });

        Ok(Box::pin(
            tokens.chain(stream::once(async { Ok(StreamEvent::Complete) })),
        ))
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn default_model(&self) -> &str {
        "echo"
    }
}
