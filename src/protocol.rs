use crate::types::RequestId;
use serde::{Deserialize, Serialize};

/// End-of-stream marker appended to the End frame payload for plain-text clients
pub const END_SENTINEL: &str = "<End of LLM response>";

/// Routes a client may address through the `action` field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    InvokeModel,
    /// Alias of `InvokeModel`; tool calling is not wired in
    ChatAgent,
    Cancel,
}

impl Action {
    pub fn parse(action: &str) -> Option<Self> {
        match action {
            "invokeModel" => Some(Action::InvokeModel),
            "chatAgent" => Some(Action::ChatAgent),
            "cancel" => Some(Action::Cancel),
            _ => None,
        }
    }
}

/// Inbound client envelope.
///
/// `action` stays a plain string so unknown routes can be reported back to
/// the sender instead of failing deserialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundMessage {
    pub action: String,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub parameters: ModelParameters,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ModelParameters {
    #[serde(default)]
    pub model_id: Option<String>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f32>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FrameKind {
    Token,
    Error,
    End,
}

/// One unit of outbound data for a client
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Frame {
    pub request_id: RequestId,
    pub sequence: u64,
    pub kind: FrameKind,
    pub payload: String,
}

impl Frame {
    pub fn token(request_id: &str, sequence: u64, payload: impl Into<String>) -> Self {
        Self {
            request_id: request_id.to_string(),
            sequence,
            kind: FrameKind::Token,
            payload: payload.into(),
        }
    }

    /// Error frames carry a sanitized code, never raw provider text
    pub fn error(request_id: &str, sequence: u64, code: impl Into<String>) -> Self {
        Self {
            request_id: request_id.to_string(),
            sequence,
            kind: FrameKind::Error,
            payload: code.into(),
        }
    }

    pub fn end(request_id: &str, sequence: u64, sentinel: &str) -> Self {
        Self {
            request_id: request_id.to_string(),
            sequence,
            kind: FrameKind::End,
            payload: sentinel.to_string(),
        }
    }

    /// Token frames are the only ones followed by more frames of the same request
    pub fn is_final(&self) -> bool {
        self.kind != FrameKind::Token
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_envelope() {
        let raw = r#"{
            "action": "invokeModel",
            "prompt": "Hello! Can you tell me a short joke?",
            "parameters": {"modelId": "openai:gpt-4o-mini", "maxTokens": 100, "temperature": 0.7}
        }"#;
        let msg: InboundMessage = serde_json::from_str(raw).unwrap();
        assert_eq!(Action::parse(&msg.action), Some(Action::InvokeModel));
        assert_eq!(msg.prompt.as_deref(), Some("Hello! Can you tell me a short joke?"));
        assert_eq!(msg.parameters.model_id.as_deref(), Some("openai:gpt-4o-mini"));
        assert_eq!(msg.parameters.max_tokens, Some(100));
        assert_eq!(msg.parameters.temperature, Some(0.7));
    }

    #[test]
    fn test_parameters_are_optional() {
        let msg: InboundMessage = serde_json::from_str(r#"{"action":"cancel"}"#).unwrap();
        assert_eq!(Action::parse(&msg.action), Some(Action::Cancel));
        assert!(msg.prompt.is_none());
        assert_eq!(msg.parameters, ModelParameters::default());
    }

    #[test]
    fn test_unknown_action_still_parses() {
        let msg: InboundMessage = serde_json::from_str(r#"{"action":"dance"}"#).unwrap();
        assert_eq!(Action::parse(&msg.action), None);
    }

    #[test]
    fn test_frame_wire_format() {
        let frame = Frame::token("01HZX", 3, "llo");
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "requestId": "01HZX",
                "sequence": 3,
                "kind": "token",
                "payload": "llo"
            })
        );

        let end = Frame::end("01HZX", 4, END_SENTINEL);
        let json = serde_json::to_value(&end).unwrap();
        assert_eq!(json["kind"], "end");
        assert_eq!(json["payload"], "<End of LLM response>");
        assert!(end.is_final());
        assert!(!frame.is_final());
    }
}
