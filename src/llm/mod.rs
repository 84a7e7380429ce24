mod echo;
mod ndjson;
mod ollama;
mod openai;

use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;
use std::time::Duration;

pub use echo::EchoProvider;
pub use ndjson::ndjson_lines;
pub use ollama::{list_local_models, OllamaProvider};
pub use openai::OpenAiProvider;

/// Result type for LLM operations
pub type LlmResult<T> = Result<T, LlmError>;

/// Errors that can occur during LLM operations
#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum LlmError {
    #[error("API request failed: {0}")]
    ApiError(String),

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Invalid configuration: {0}")]
    ConfigError(String),

    #[error("Rate limit exceeded")]
    RateLimit,

    #[error("Response parsing failed: {0}")]
    ParseError(String),

    #[error("Model does not support streaming: {0}")]
    UnsupportedModel(String),
}

impl LlmError {
    /// Stable code forwarded to clients in place of provider diagnostics
    pub fn code(&self) -> &'static str {
        match self {
            LlmError::ApiError(_) => "provider_error",
            LlmError::Timeout(_) => "provider_timeout",
            LlmError::ConfigError(_) => "provider_unavailable",
            LlmError::RateLimit => "rate_limited",
            LlmError::ParseError(_) => "bad_provider_response",
            LlmError::UnsupportedModel(_) => "unsupported_model",
        }
    }
}

/// One item of a provider's token stream
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Token(String),
    Complete,
}

/// Finite, non-restartable lazy sequence of tokens. An `Err` item ends it.
pub type TokenStream = Pin<Box<dyn Stream<Item = LlmResult<StreamEvent>> + Send>>;

/// Request to stream a model answer
#[derive(Debug, Clone)]
pub struct InvokeRequest {
    pub prompt: String,
    pub max_tokens: u32,
    pub temperature: f32,
    /// Timeout for opening the stream (first byte)
    pub timeout: Duration,
    /// Model to use instead of the provider's configured one
    pub model_override: Option<String>,
}

/// Trait that all LLM providers must implement
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Open a token stream for the given prompt
    async fn invoke(&self, request: InvokeRequest) -> LlmResult<TokenStream>;

    /// Get the name of this provider
    fn name(&self) -> &str;

    /// Model used when the request has no override
    fn default_model(&self) -> &str;
}

/// Manager for multiple LLM providers
pub struct LlmManager {
    pub providers: Vec<Box<dyn LlmProvider>>,
    /// Model id used when a request names none ("provider:model" or bare model)
    pub default_model_id: Option<String>,
    /// When non-empty, only these model ids may be streamed
    pub streaming_models: Vec<String>,
}

impl LlmManager {
    /// Create a new LLM manager with the given providers
    pub fn new(providers: Vec<Box<dyn LlmProvider>>) -> Self {
        Self {
            providers,
            default_model_id: None,
            streaming_models: Vec::new(),
        }
    }

    pub fn with_default_model(mut self, model_id: Option<String>) -> Self {
        self.default_model_id = model_id;
        self
    }

    pub fn with_streaming_models(mut self, models: Vec<String>) -> Self {
        self.streaming_models = models;
        self
    }

    /// Resolve a model id to a provider and optional model override.
    ///
    /// `provider:model` picks the named provider. Anything else (including
    /// ids with colons such as `llama3.2:latest`) goes to the first provider.
    pub fn resolve<'a>(
        &'a self,
        model_id: Option<&str>,
    ) -> LlmResult<(&'a dyn LlmProvider, Option<String>)> {
        let model_id = model_id.or(self.default_model_id.as_deref());

        if let Some(id) = model_id {
            if let Some((prefix, model)) = id.split_once(':') {
                if let Some(provider) = self.providers.iter().find(|p| p.name() == prefix) {
                    let model = (!model.is_empty()).then(|| model.to_string());
                    return Ok((provider.as_ref(), model));
                }
            }
        }

        let provider = self.providers.first().ok_or_else(|| {
            LlmError::ConfigError("No LLM providers configured".to_string())
        })?;
        Ok((provider.as_ref(), model_id.map(str::to_string)))
    }

    fn check_streaming_allowed(&self, provider: &dyn LlmProvider, model: &str) -> LlmResult<()> {
        if self.streaming_models.is_empty() {
            return Ok(());
        }
        let qualified = format!("{}:{}", provider.name(), model);
        if self
            .streaming_models
            .iter()
            .any(|m| m == model || *m == qualified)
        {
            Ok(())
        } else {
            Err(LlmError::UnsupportedModel(qualified))
        }
    }

    /// Open a token stream on the provider the model id resolves to
    pub async fn invoke(
        &self,
        model_id: Option<&str>,
        request: InvokeRequest,
    ) -> LlmResult<TokenStream> {
        let (provider, model_override) = self.resolve(model_id)?;
        let model = model_override
            .clone()
            .unwrap_or_else(|| provider.default_model().to_string());
        self.check_streaming_allowed(provider, &model)?;

        tracing::info!("Invoking {}:{}", provider.name(), model);
        provider
            .invoke(InvokeRequest {
                model_override,
                ..request
            })
            .await
    }
}

/// Configuration for LLM providers
#[derive(Debug, Clone)]
pub struct LlmConfig {
    /// OpenAI API key
    pub openai_api_key: Option<String>,
    /// OpenAI model to use
    pub openai_model: String,
    /// Ollama base URL
    pub ollama_base_url: Option<String>,
    /// Ollama model to use
    pub ollama_model: String,
    /// Offline provider that streams the prompt back
    pub echo_enabled: bool,
    /// Model id used when a message names none
    pub default_model_id: Option<String>,
    /// Allowlist of streamable model ids (empty = any)
    pub streaming_models: Vec<String>,
    /// Default timeout for opening a stream
    pub default_timeout: Duration,
    /// Default max tokens for responses
    pub default_max_tokens: u32,
    pub default_temperature: f32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            openai_api_key: None,
            openai_model: "gpt-4o-mini".to_string(),
            ollama_base_url: Some("http://localhost:11434".to_string()),
            ollama_model: "llama3.2".to_string(),
            echo_enabled: false,
            default_model_id: None,
            streaming_models: Vec::new(),
            default_timeout: Duration::from_secs(30),
            default_max_tokens: 256,
            default_temperature: 0.0,
        }
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    })
}

impl LlmConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let ollama_base_url = match std::env::var("OLLAMA_BASE_URL") {
            Ok(url) => {
                let trimmed = url.trim();
                (!trimmed.is_empty()).then(|| trimmed.to_string())
            }
            Err(_) => Some("http://localhost:11434".to_string()),
        };

        let streaming_models = std::env::var("STREAMING_MODELS")
            .map(|list| {
                list.split(',')
                    .map(|m| m.trim().to_string())
                    .filter(|m| !m.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        Self {
            openai_api_key: non_empty_env("OPENAI_API_KEY"),
            openai_model: non_empty_env("OPENAI_MODEL")
                .unwrap_or_else(|| "gpt-4o-mini".to_string()),
            ollama_base_url,
            ollama_model: non_empty_env("OLLAMA_MODEL").unwrap_or_else(|| "llama3.2".to_string()),
            echo_enabled: std::env::var("ECHO_PROVIDER")
                .map(|v| v != "0" && v.to_lowercase() != "false")
                .unwrap_or(false),
            default_model_id: non_empty_env("DEFAULT_MODEL_ID"),
            streaming_models,
            default_timeout: std::env::var("LLM_TIMEOUT")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(Duration::from_secs(30)),
            default_max_tokens: std::env::var("DEFAULT_MAX_TOKENS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(256),
            default_temperature: std::env::var("DEFAULT_TEMPERATURE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(0.0),
        }
    }

    /// Build an LlmManager with all configured providers
    pub fn build_manager(&self) -> LlmResult<LlmManager> {
        let mut providers: Vec<Box<dyn LlmProvider>> = Vec::new();

        // Add OpenAI if API key is available
        if let Some(api_key) = &self.openai_api_key {
            providers.push(Box::new(OpenAiProvider::new(
                api_key.clone(),
                self.openai_model.clone(),
            )));
        }

        // Add Ollama if base URL is available
        if let Some(base_url) = &self.ollama_base_url {
            providers.push(Box::new(OllamaProvider::new(
                base_url.clone(),
                self.ollama_model.clone(),
            )?));
        }

        if self.echo_enabled {
            providers.push(Box::new(EchoProvider::default()));
        }

        if providers.is_empty() {
            return Err(LlmError::ConfigError(
                "No LLM providers configured. Set OPENAI_API_KEY, OLLAMA_BASE_URL or ECHO_PROVIDER"
                    .to_string(),
            ));
        }

        Ok(LlmManager::new(providers)
            .with_default_model(self.default_model_id.clone())
            .with_streaming_models(self.streaming_models.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn request(prompt: &str) -> InvokeRequest {
        InvokeRequest {
            prompt: prompt.to_string(),
            max_tokens: 16,
            temperature: 0.0,
            timeout: Duration::from_secs(1),
            model_override: None,
        }
    }

    fn manager() -> LlmManager {
        LlmManager::new(vec![
            Box::new(EchoProvider::new("first", Duration::ZERO)),
            Box::new(EchoProvider::new("echo", Duration::ZERO)),
        ])
    }

    #[test]
    fn test_default_config() {
        let config = LlmConfig::default();
        assert_eq!(config.openai_model, "gpt-4o-mini");
        assert_eq!(config.ollama_model, "llama3.2");
        assert_eq!(config.default_timeout, Duration::from_secs(30));
        assert_eq!(config.default_max_tokens, 256);
        assert_eq!(config.default_temperature, 0.0);
    }

    #[test]
    fn test_resolve_by_provider_prefix() {
        let manager = manager();
        let (provider, model) = manager.resolve(Some("echo:parrot")).unwrap();
        assert_eq!(provider.name(), "echo");
        assert_eq!(model.as_deref(), Some("parrot"));
    }

    #[test]
    fn test_resolve_bare_model_goes_to_first_provider() {
        let manager = manager();
        let (provider, model) = manager.resolve(Some("llama3.2:latest")).unwrap();
        assert_eq!(provider.name(), "first");
        assert_eq!(model.as_deref(), Some("llama3.2:latest"));

        let (provider, model) = manager.resolve(None).unwrap();
        assert_eq!(provider.name(), "first");
        assert!(model.is_none());
    }

    #[test]
    fn test_resolve_uses_default_model_id() {
        let manager = manager().with_default_model(Some("echo:parrot".to_string()));
        let (provider, model) = manager.resolve(None).unwrap();
        assert_eq!(provider.name(), "echo");
        assert_eq!(model.as_deref(), Some("parrot"));
    }

    #[test]
    fn test_resolve_without_providers() {
        let manager = LlmManager::new(Vec::new());
        assert!(matches!(manager.resolve(None), Err(LlmError::ConfigError(_))));
    }

    #[tokio::test]
    async fn test_streaming_allowlist() {
        let manager = manager().with_streaming_models(vec!["echo:parrot".to_string()]);

        let denied = manager.invoke(Some("echo:other"), request("hi")).await;
        assert_eq!(
            denied.err(),
            Some(LlmError::UnsupportedModel("echo:other".to_string()))
        );

        let mut stream = manager
            .invoke(Some("echo:parrot"), request("hi"))
            .await
            .unwrap();
        assert_eq!(
            stream.next().await,
            Some(Ok(StreamEvent::Token("hi".to_string())))
        );
    }

    #[test]
    fn test_error_codes_hide_details() {
        let err = LlmError::ApiError("secret upstream body".to_string());
        assert_eq!(err.code(), "provider_error");
        assert!(!err.code().contains("secret"));
        assert_eq!(LlmError::Timeout(Duration::from_secs(1)).code(), "provider_timeout");
    }
}
