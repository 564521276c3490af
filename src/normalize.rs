use serde_json::Value;

use crate::error::GatewayError;
use crate::models::NormalizedResponse;

/// Reshapes an OpenAI-style chat completion into the gateway's response,
/// copying every field and mirroring `choices[0].message.content` into `text`.
pub fn normalize(body: Value) -> Result<NormalizedResponse, GatewayError> {
    if !body.is_object() {
        return Err(GatewayError::MalformedUpstream(format!(
            "expected a JSON object, got {}",
            json_kind(&body)
        )));
    }

    let mut response: NormalizedResponse = serde_json::from_value(body)
        .map_err(|e| GatewayError::MalformedUpstream(format!("unexpected field type: {e}")))?;

    let first = response
        .choices
        .first()
        .ok_or_else(|| GatewayError::MalformedUpstream("missing or empty choices".to_string()))?;
    let message = first
        .get("message")
        .and_then(Value::as_object)
        .ok_or_else(|| GatewayError::MalformedUpstream("choices[0].message missing".to_string()))?;

    response.text = match message.get("content") {
        Some(Value::String(text)) => text.clone(),
        // tool-call replies carry a null content
        None | Some(Value::Null) => String::new(),
        Some(other) => {
            return Err(GatewayError::MalformedUpstream(format!(
                "choices[0].message.content is {}",
                json_kind(other)
            )));
        }
    };
    Ok(response)
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn copies_content_into_text_and_keeps_everything_else() {
        let upstream = json!({
            "id": "chatcmpl-1",
            "object": "chat.completion",
            "created": 1_700_000_000,
            "model": "gpt-4o-mini",
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": "hi"},
                "finish_reason": "stop"
            }],
            "usage": {"prompt_tokens": 3, "completion_tokens": 1, "total_tokens": 4},
            "system_fingerprint": "fp_1"
        });

        let normalized = normalize(upstream.clone()).unwrap();
        assert_eq!(normalized.text, "hi");

        let mut round_trip = serde_json::to_value(&normalized).unwrap();
        let text = round_trip.as_object_mut().unwrap().remove("text");
        assert_eq!(text, Some(json!("hi")));
        assert_eq!(round_trip, upstream);
    }

    #[test]
    fn odd_typed_and_null_fields_pass_through() {
        let upstream = json!({
            "id": 12345,
            "created": 1.7e9,
            "model": null,
            "usage": null,
            "choices": [{"message": {"content": "hi"}}]
        });

        let normalized = normalize(upstream.clone()).unwrap();
        assert_eq!(normalized.id(), Some(&json!(12345)));
        assert_eq!(normalized.usage(), Some(&Value::Null));

        let mut round_trip = serde_json::to_value(&normalized).unwrap();
        round_trip.as_object_mut().unwrap().remove("text");
        assert_eq!(round_trip, upstream);
    }

    #[test]
    fn upstream_text_field_is_overwritten() {
        let upstream = json!({
            "text": "stale",
            "choices": [{"message": {"content": "fresh"}}]
        });
        assert_eq!(normalize(upstream).unwrap().text, "fresh");
    }

    #[test]
    fn missing_or_empty_choices_is_malformed() {
        for body in [json!({"id": "x"}), json!({"choices": []}), json!(["x"])] {
            let err = normalize(body).unwrap_err();
            assert!(matches!(err, GatewayError::MalformedUpstream(_)), "{err}");
        }
    }

    #[test]
    fn null_content_becomes_empty_text() {
        let body = json!({"choices": [{"message": {"role": "assistant", "content": null}}]});
        assert_eq!(normalize(body).unwrap().text, "");

        let body = json!({"choices": [{"message": {"content": 5}}]});
        assert!(normalize(body).is_err());
    }
}
