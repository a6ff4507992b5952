use serde_json::{Value, json};
use uuid::Uuid;

/// Turns a complete Gemini generateContent response into a Claude Messages
/// response body. Never fails: a response with no candidate is synthesized
/// into a valid (possibly empty) message.
pub fn decode_response(gemini: &Value, model: &str) -> Value {
    let actual = unwrap_envelope(gemini);

    let synthesized;
    let candidate = match actual.get("candidates").and_then(|c| c.get(0)) {
        Some(candidate) => candidate,
        None => {
            synthesized = synthesize_candidate(&actual, gemini);
            &synthesized
        }
    };

    let mut content: Vec<Value> = Vec::new();
    let parts = candidate
        .pointer("/content/parts")
        .and_then(|p| p.as_array())
        .cloned()
        .unwrap_or_default();

    for part in &parts {
        if let Some(block) = decode_part(part) {
            content.push(block);
        }
    }

    let finish_reason = candidate
        .get("finishReason")
        .and_then(|v| v.as_str())
        .unwrap_or("");
    let (mut stop_reason, stop_sequence) = map_finish_reason(finish_reason);
    if content.is_empty() {
        if let Some(text) = blocked_placeholder(finish_reason) {
            content.push(json!({ "type": "text", "text": text }));
        }
    }
    if content.iter().any(|b| b["type"] == "tool_use") {
        stop_reason = "tool_use";
    }

    // PA responses carry usage on the envelope, not the inner response.
    let usage = actual
        .get("usageMetadata")
        .or_else(|| gemini.get("usageMetadata"));

    json!({
        "id": format!("msg_{}", Uuid::new_v4()),
        "type": "message",
        "role": "assistant",
        "model": model,
        "content": content,
        "stop_reason": stop_reason,
        "stop_sequence": stop_sequence,
        "usage": decode_usage(usage)
    })
}

/// The PA API wraps the real response under a `response` key, sometimes as a
/// JSON string, sometimes doubly nested.
fn unwrap_envelope(gemini: &Value) -> Value {
    match gemini.get("response") {
        Some(inner) if inner.is_object() => inner.clone(),
        Some(Value::String(raw)) => match serde_json::from_str::<Value>(raw) {
            Ok(parsed) => match parsed.get("response") {
                Some(inner) if inner.is_object() => inner.clone(),
                _ => parsed,
            },
            Err(_) => gemini.clone(),
        },
        _ => gemini.clone(),
    }
}

fn synthesize_candidate(actual: &Value, raw: &Value) -> Value {
    if let Some(reason) = actual
        .pointer("/promptFeedback/blockReason")
        .and_then(|v| v.as_str())
    {
        return json!({
            "content": { "parts": [{ "text": format!("[Request blocked by Gemini: {reason}]") }] },
            "finishReason": "SAFETY"
        });
    }
    tracing::warn!(response = %raw, "gemini response carried no candidates");
    json!({
        "content": { "parts": [{ "text": "" }] },
        "finishReason": "STOP"
    })
}

fn decode_part(part: &Value) -> Option<Value> {
    let signature = part
        .get("thoughtSignature")
        .or_else(|| part.get("thought_signature"))
        .and_then(|v| v.as_str());
    let text = part.get("text").and_then(|v| v.as_str());
    // A signed text part is thinking even without the thought flag; PA
    // responses sometimes omit it.
    let is_thought = part.get("thought") == Some(&Value::Bool(true))
        || (signature.is_some() && text.is_some());

    if let Some(text) = text {
        if is_thought {
            return Some(json!({
                "type": "thinking",
                "thinking": text,
                "signature": signature
            }));
        }
        return Some(json!({ "type": "text", "text": text }));
    }
    if let Some(call) = part.get("functionCall") {
        return Some(json!({
            "type": "tool_use",
            "id": tool_use_id(),
            "name": call.get("name").and_then(|v| v.as_str()).unwrap_or(""),
            "input": call.get("args").cloned().unwrap_or_else(|| json!({}))
        }));
    }
    None
}

pub(crate) fn tool_use_id() -> String {
    format!("toolu_{}", &Uuid::new_v4().simple().to_string()[..8])
}

pub(crate) fn map_finish_reason(finish_reason: &str) -> (&'static str, Value) {
    match finish_reason {
        "MAX_TOKENS" => ("max_tokens", Value::Null),
        "SAFETY" => ("stop_sequence", Value::String("SAFETY".to_string())),
        "RECITATION" => ("stop_sequence", Value::String("RECITATION".to_string())),
        _ => ("end_turn", Value::Null),
    }
}

fn blocked_placeholder(finish_reason: &str) -> Option<&'static str> {
    match finish_reason {
        "SAFETY" => Some("[Content blocked by Gemini Safety Filters]"),
        "RECITATION" => Some("[Content blocked by Gemini Recitation Checks]"),
        _ => None,
    }
}

pub(crate) fn decode_usage(usage: Option<&Value>) -> Value {
    let count = |key: &str| {
        usage
            .and_then(|u| u.get(key))
            .and_then(|v| v.as_u64())
            .unwrap_or(0)
    };
    json!({
        "input_tokens": count("promptTokenCount"),
        "output_tokens": count("candidatesTokenCount"),
        "cache_read_input_tokens": count("cachedContentTokenCount")
    })
}
