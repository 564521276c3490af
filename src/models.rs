use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::GatewayError;

// Chat message; deepchat clients send `text` where OpenAI uses `content`
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct Message {
    pub role: String,
    #[serde(alias = "text")]
    pub content: Value,
    // name, tool_call_id, tool_calls and anything newer
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

// Inbound completion request
#[derive(Deserialize, Serialize, Clone, Debug, Default)]
pub struct CompletionRequest {
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    // any other generation parameter goes to the upstream as-is
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl CompletionRequest {
    pub fn parse(body: &[u8]) -> Result<Self, GatewayError> {
        if body.is_empty() {
            return Err(GatewayError::Validation("Missing body".to_string()));
        }
        let request: CompletionRequest = serde_json::from_slice(body)
            .map_err(|e| GatewayError::Validation(format!("Invalid request body: {e}")))?;
        request.validate()?;
        Ok(request)
    }

    pub fn validate(&self) -> Result<(), GatewayError> {
        if self.messages.is_empty() {
            return Err(GatewayError::Validation(
                "messages must contain at least one message".to_string(),
            ));
        }
        if let Some(i) = self.messages.iter().position(|m| m.role.trim().is_empty()) {
            return Err(GatewayError::Validation(format!(
                "messages[{i}].role must not be empty"
            )));
        }
        Ok(())
    }

    pub fn is_stream(&self) -> bool {
        self.stream.unwrap_or(false)
    }

    /// Upstream body: this request with the route's model name and the stream flag pinned.
    pub fn upstream_body(&self, model: &str, stream: bool) -> Value {
        let mut body = self.extra.clone();
        // the route decides the model, never the caller
        body.remove("model");
        let mut value = serde_json::to_value(CompletionRequest {
            extra: body,
            stream: Some(stream),
            ..self.clone()
        })
        .unwrap_or(Value::Null);
        if let Value::Object(map) = &mut value {
            map.insert("model".to_string(), Value::String(model.to_string()));
        }
        value
    }
}

/// Client-facing completion; `text` mirrors choices[0].message.content.
///
/// Only `choices` is typed. `id`, `created`, `model`, `usage` and every
/// other upstream field stay in `extra` exactly as sent, nulls included.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct NormalizedResponse {
    #[serde(default)]
    pub choices: Vec<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
    #[serde(default)]
    pub text: String,
}

impl NormalizedResponse {
    pub fn id(&self) -> Option<&Value> {
        self.extra.get("id")
    }

    pub fn created(&self) -> Option<&Value> {
        self.extra.get("created")
    }

    pub fn model(&self) -> Option<&Value> {
        self.extra.get("model")
    }

    pub fn usage(&self) -> Option<&Value> {
        self.extra.get("usage")
    }
}

// One transcoded unit of a streaming completion
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
pub struct StreamChunk {
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}
