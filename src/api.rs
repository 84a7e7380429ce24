//! HTTP API endpoints.
//!
//! Read-only views for operators: which models can be streamed and how busy
//! the gateway currently is.

use axum::{extract::State, Json};
use serde::Serialize;

use crate::llm::{list_local_models, LlmConfig};
use crate::ws::ServerState;

/// Response structure for available models
#[derive(Debug, Clone, Serialize)]
pub struct AvailableModelsResponse {
    pub openai_models: Vec<ModelInfo>,
    pub ollama_models: Vec<ModelInfo>,
    pub echo_models: Vec<ModelInfo>,
    pub default_model: Option<String>,
}

/// Information about a single model
#[derive(Debug, Clone, Serialize)]
pub struct ModelInfo {
    /// Unique identifier in format "provider:model" (e.g., "openai:gpt-4o-mini")
    pub id: String,
    pub name: String,
    /// False when a streaming allowlist is set and this model is not on it
    pub streamable: bool,
}

/// Static list of OpenAI models to offer
const OPENAI_MODELS: &[&str] = &[
    "gpt-4o-mini",
    "gpt-4o",
    "gpt-4.1",
    "gpt-4.1-mini",
    "gpt-3.5-turbo",
];

fn model_info(config: &LlmConfig, provider: &str, name: &str) -> ModelInfo {
    let id = format!("{}:{}", provider, name);
    let streamable = config.streaming_models.is_empty()
        || config
            .streaming_models
            .iter()
            .any(|m| *m == id || m == name);
    ModelInfo {
        id,
        name: name.to_string(),
        streamable,
    }
}

/// List available AI models.
///
/// GET /api/models
///
/// OpenAI models come from a static list, Ollama models from its /api/tags.
pub async fn list_available_models(
    State(server): State<ServerState>,
) -> Json<AvailableModelsResponse> {
    let config = &server.dispatcher.state().llm_config;

    let openai_models: Vec<ModelInfo> = if config.openai_api_key.is_some() {
        let mut names: Vec<&str> = OPENAI_MODELS.to_vec();
        if !names.contains(&config.openai_model.as_str()) {
            names.insert(0, &config.openai_model);
        }
        names
            .into_iter()
            .map(|name| model_info(config, "openai", name))
            .collect()
    } else {
        vec![]
    };

    let ollama_models: Vec<ModelInfo> = if let Some(ref base_url) = config.ollama_base_url {
        match list_local_models(base_url).await {
            Ok(models) => models
                .iter()
                .map(|name| model_info(config, "ollama", name))
                .collect(),
            Err(e) => {
                tracing::warn!("Failed to list Ollama models: {}", e);
                vec![]
            }
        }
    } else {
        vec![]
    };

    let echo_models = if config.echo_enabled {
        vec![model_info(config, "echo", "echo")]
    } else {
        vec![]
    };

    Json(AvailableModelsResponse {
        openai_models,
        ollama_models,
        echo_models,
        default_model: determine_default_model(config),
    })
}

/// The model a message without `parameters.modelId` is streamed from
fn determine_default_model(config: &LlmConfig) -> Option<String> {
    if let Some(ref id) = config.default_model_id {
        return Some(id.clone());
    }
    if config.openai_api_key.is_some() {
        return Some(format!("openai:{}", config.openai_model));
    }
    if config.ollama_base_url.is_some() {
        return Some(format!("ollama:{}", config.ollama_model));
    }
    config.echo_enabled.then(|| "echo:echo".to_string())
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusResponse {
    /// Rows in the connection table
    pub connections: usize,
    /// Sockets attached to this process
    pub sockets: usize,
    pub active_sessions: usize,
    pub llm_available: bool,
}

/// Gateway load.
///
/// GET /api/status
pub async fn status(State(server): State<ServerState>) -> Json<StatusResponse> {
    let state = server.dispatcher.state();
    let connections = match state.connections.count().await {
        Ok(count) => count,
        Err(e) => {
            tracing::warn!("Couldn't count connections: {}", e);
            0
        }
    };

    Json(StatusResponse {
        connections,
        sockets: server.sockets.len().await,
        active_sessions: state.sessions.active_count().await,
        llm_available: state.llm.is_some(),
    })
}
