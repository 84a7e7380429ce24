use super::*;
use async_openai::{
    config::OpenAIConfig,
    types::{
        ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
        CreateChatCompletionRequestArgs, CreateChatCompletionStreamResponse,
    },
    Client,
};
use futures::stream::{self, StreamExt};

const SYSTEM_PROMPT: &str = "You are a helpful assistant. Answer concisely.";

/// OpenAI provider implementation
pub struct OpenAiProvider {
    client: Client<OpenAIConfig>,
    model: String,
}

impl OpenAiProvider {
    /// Create a new OpenAI provider with the given API key and model
    pub fn new(api_key: String, model: String) -> Self {
        let config = OpenAIConfig::new().with_api_key(api_key);
        let client = Client::with_config(config);

        Self { client, model }
    }
}

/// Text carried by one streamed chunk (empty for role/finish-only chunks)
fn chunk_text(chunk: &CreateChatCompletionStreamResponse) -> String {
    chunk
        .choices
        .first()
        .and_then(|choice| choice.delta.content.clone())
        .unwrap_or_default()
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    async fn invoke(&self, request: InvokeRequest) -> LlmResult<TokenStream> {
        // Use model override if provided, otherwise use configured model
        let model = request
            .model_override
            .clone()
            .unwrap_or_else(|| self.model.clone());

        let chat_request = CreateChatCompletionRequestArgs::default()
            .model(&model)
            .messages([
                ChatCompletionRequestSystemMessageArgs::default()
                    .content(SYSTEM_PROMPT)
                    .build()
                    .map_err(|e| LlmError::ApiError(e.to_string()))?
                    .into(),
                ChatCompletionRequestUserMessageArgs::default()
                    .content(request.prompt.clone())
                    .build()
                    .map_err(|e| LlmError::ApiError(e.to_string()))?
                    .into(),
            ])
            .max_tokens(request.max_tokens)
            .temperature(request.temperature)
            .build()
            .map_err(|e| LlmError::ApiError(e.to_string()))?;

        // Timeout covers opening the stream only
        let upstream = tokio::time::timeout(
            request.timeout,
            self.client.chat().create_stream(chat_request),
        )
        .await
        .map_err(|_| LlmError::Timeout(request.timeout))?
        .map_err(|e| LlmError::ApiError(e.to_string()))?;

        let tokens = upstream.map(|item| match item {
            Ok(chunk) => Ok(StreamEvent::Token(chunk_text(&chunk))),
            Err(e) => Err(LlmError::ApiError(e.to_string())),
        });

        Ok(Box::pin(
            tokens.chain(stream::once(async { Ok(StreamEvent::Complete) })),
        ))
    }

    fn name(&self) -> &str {
        "openai"
    }

    fn default_model(&self) -> &str {
        &self.model
    }
}
