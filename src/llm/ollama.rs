use super::*;
use futures::stream::StreamExt;
use serde::{Deserialize, Serialize};

/// Ollama provider implementation
pub struct OllamaProvider {
    base_url: String,
    model: String,
    client: reqwest::Client,
}

impl OllamaProvider {
    /// Create a new Ollama provider with the given base URL and model
    pub fn new(base_url: String, model: String) -> LlmResult<Self> {
        // No overall timeout: a stream may legitimately run for minutes
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| LlmError::ConfigError(e.to_string()))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
            client,
        })
    }
}

#[derive(Debug, Serialize)]
struct OllamaGenerateRequest {
    model: String,
    prompt: String,
    stream: bool,
    options: OllamaOptions,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    num_predict: u32,
    temperature: f32,
}

/// One NDJSON line of a streaming `/api/generate` response
#[derive(Debug, Deserialize)]
struct OllamaStreamChunk {
    #[serde(default)]
    response: String,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

/// Map one NDJSON line to a stream event
fn parse_chunk(line: &str) -> LlmResult<StreamEvent> {
    let chunk: OllamaStreamChunk =
        serde_json::from_str(line).map_err(|e| LlmError::ParseError(e.to_string()))?;
    if let Some(error) = chunk.error {
        return Err(LlmError::ApiError(error));
    }
    if chunk.done {
        Ok(StreamEvent::Complete)
    } else {
        Ok(StreamEvent::Token(chunk.response))
    }
}

#[async_trait]
impl LlmProvider for OllamaProvider {
    async fn invoke(&self, request: InvokeRequest) -> LlmResult<TokenStream> {
        let model = request
            .model_override
            .clone()
            .unwrap_or_else(|| self.model.clone());

        let ollama_request = OllamaGenerateRequest {
            model,
            prompt: request.prompt,
            stream: true,
            options: OllamaOptions {
                num_predict: request.max_tokens,
                temperature: request.temperature,
            },
        };

        let url = format!("{}/api/generate", self.base_url);

        // Timeout covers opening the stream only
        let response = tokio::time::timeout(
            request.timeout,
            self.client.post(&url).json(&ollama_request).send(),
        )
        .await
        .map_err(|_| LlmError::Timeout(request.timeout))?
        .map_err(|e| LlmError::ApiError(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(LlmError::RateLimit);
        }
        if !status.is_success() {
            return Err(LlmError::ApiError(format!(
                "Ollama API returned status: {}",
                status
            )));
        }

        let events = ndjson_lines(response.bytes_stream())
            .map(|line| line.and_then(|l| parse_chunk(&l)));
        Ok(Box::pin(events))
    }

    fn name(&self) -> &str {
        "ollama"
    }

    fn default_model(&self) -> &str {
        &self.model
    }
}

#[derive(Debug, Deserialize)]
struct OllamaTags {
    models: Vec<OllamaModelTag>,
}

#[derive(Debug, Deserialize)]
struct OllamaModelTag {
    name: String,
}

/// Query the models pulled into a local Ollama instance
pub async fn list_local_models(base_url: &str) -> LlmResult<Vec<String>> {
    let url = format!("{}/api/tags", base_url.trim_end_matches('/'));
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
        .map_err(|e| LlmError::ConfigError(e.to_string()))?;

    let response = client
        .get(&url)
        .send()
        .await
        .map_err(|e| LlmError::ApiError(e.to_string()))?;

    if !response.status().is_success() {
        return Err(LlmError::ApiError(format!(
            "Ollama API returned status: {}",
            response.status()
        )));
    }

    let tags: OllamaTags = response
        .json()
        .await
        .map_err(|e| LlmError::ParseError(e.to_string()))?;
    Ok(tags.models.into_iter().map(|m| m.name).collect())
}
