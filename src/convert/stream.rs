use crate::convert::response::{map_finish_reason, tool_use_id};
use base64::Engine;
use serde_json::{Value, json};
use uuid::Uuid;

/// Per-stream reconstruction state. One instance per logical response,
/// threaded by `&mut` through every `convert_chunk` call and discarded after
/// the terminal chunk.
#[derive(Debug, Default)]
pub struct StreamState {
    block_index: u64,
    open_block: Option<OpenBlock>,
    has_tool_use: bool,
    has_text: bool,
    has_thinking: bool,
    has_thinking_delta: bool,
    /// Plain text that arrived while an unsigned thinking block held the
    /// channel; flushed when the signature lands.
    pending_text: String,
    signature_sent: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpenBlock {
    Text,
    Thinking,
}

impl StreamState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_tool_use(&self) -> bool {
        self.has_tool_use
    }

    fn close_open_block(&mut self, out: &mut Vec<Value>) {
        if self.open_block.take().is_some() {
            out.push(json!({ "type": "content_block_stop", "index": self.block_index }));
            self.block_index += 1;
        }
    }

    fn ensure_block(&mut self, kind: OpenBlock, out: &mut Vec<Value>) {
        if self.open_block == Some(kind) {
            return;
        }
        self.close_open_block(out);
        self.open_block = Some(kind);
        let content_block = match kind {
            OpenBlock::Text => json!({ "type": "text", "text": "" }),
            OpenBlock::Thinking => json!({ "type": "thinking", "thinking": "" }),
        };
        out.push(json!({
            "type": "content_block_start",
            "index": self.block_index,
            "content_block": content_block
        }));
    }

    /// Signs and closes the thinking context, then flushes any text that was
    /// buffered behind it. Opens a bare thinking block first if the signature
    /// arrived before any thinking part; a block cannot be signed while
    /// visually empty, so an empty one gets a placeholder delta.
    fn sign_and_close_thinking(&mut self, signature: &str, out: &mut Vec<Value>) {
        self.has_thinking = true;
        self.ensure_block(OpenBlock::Thinking, out);
        if !self.has_thinking_delta {
            out.push(json!({
                "type": "content_block_delta",
                "index": self.block_index,
                "delta": { "type": "thinking_delta", "thinking": "(no content)" }
            }));
        }
        out.push(json!({
            "type": "content_block_delta",
            "index": self.block_index,
            "delta": { "type": "signature_delta", "signature": signature }
        }));
        self.signature_sent = true;
        self.close_open_block(out);

        if !self.pending_text.is_empty() {
            let cleaned = self.pending_text.trim_start().to_string();
            self.pending_text.clear();
            if !cleaned.is_empty() {
                self.emit_text(&cleaned, out);
            }
        }
    }

    /// Gemini 2.x sometimes finishes thinking without ever signing it. A text
    /// or tool_use block must not follow unsigned thinking, so fabricate a
    /// valid-base64 signature and close the block.
    fn auto_sign_if_unsigned(&mut self, out: &mut Vec<Value>) {
        if self.has_thinking && !self.signature_sent {
            tracing::info!("thinking stream ended without a signature, synthesizing one");
            let sig = base64::engine::general_purpose::STANDARD
                .encode(format!("auto_sig_{}", chrono::Utc::now().timestamp_millis()));
            self.sign_and_close_thinking(&sig, out);
        }
    }

    fn emit_text(&mut self, text: &str, out: &mut Vec<Value>) {
        self.has_text = true;
        self.ensure_block(OpenBlock::Text, out);
        out.push(json!({
            "type": "content_block_delta",
            "index": self.block_index,
            "delta": { "type": "text_delta", "text": text }
        }));
    }
}

/// Converts one streamed Gemini chunk into zero or more Claude stream events.
/// `message_start` is the caller's job; everything else comes from here.
pub fn convert_chunk(chunk: &Value, state: &mut StreamState) -> Vec<Value> {
    let actual = chunk.get("response").filter(|r| r.is_object()).unwrap_or(chunk);
    let candidate = actual.get("candidates").and_then(|c| c.get(0));
    let usage = actual
        .get("usageMetadata")
        .or_else(|| chunk.get("usageMetadata"));

    let mut out = Vec::new();
    let parts = candidate
        .and_then(|c| c.pointer("/content/parts"))
        .and_then(|p| p.as_array())
        .cloned()
        .unwrap_or_default();

    for (part_index, part) in parts.iter().enumerate() {
        let signature = part
            .get("thoughtSignature")
            .or_else(|| part.get("thought_signature"))
            .and_then(|v| v.as_str());
        let text = part.get("text").and_then(|v| v.as_str());
        let explicit_thought = part.get("thought") == Some(&Value::Bool(true));

        if explicit_thought {
            if let Some(text) = text.filter(|t| !t.is_empty()) {
                if state.has_text {
                    // A thought fragment arriving after visible text cannot
                    // open a thinking block anymore; degrade it to a text
                    // continuation instead of dropping it.
                    tracing::warn!("thinking part arrived after text content, degrading to text");
                    state.emit_text(&format!("\n{text}"), &mut out);
                } else {
                    state.has_thinking = true;
                    state.ensure_block(OpenBlock::Thinking, &mut out);
                    state.has_thinking_delta = true;
                    out.push(json!({
                        "type": "content_block_delta",
                        "index": state.block_index,
                        "delta": { "type": "thinking_delta", "thinking": text }
                    }));
                }
            }
        }

        if let Some(signature) = signature {
            let in_thinking_context = state.open_block == Some(OpenBlock::Thinking)
                || state.has_thinking
                || !state.has_text;
            if state.signature_sent {
                tracing::debug!("duplicate thought signature, ignoring");
            } else if in_thinking_context {
                state.sign_and_close_thinking(signature, &mut out);
            }
        }

        if !explicit_thought {
            if let Some(text) = text.filter(|t| !t.is_empty()) {
                if state.open_block == Some(OpenBlock::Thinking) && !state.signature_sent {
                    // Text must not interleave into an open thinking block;
                    // hold it until the signature closes the block.
                    state.pending_text.push_str(text);
                } else {
                    state.auto_sign_if_unsigned(&mut out);
                    state.emit_text(text, &mut out);
                }
            }
        }

        if let Some(call) = part.get("functionCall") {
            state.has_tool_use = true;
            state.auto_sign_if_unsigned(&mut out);
            state.close_open_block(&mut out);
            out.push(json!({
                "type": "content_block_start",
                "index": state.block_index,
                "content_block": {
                    "type": "tool_use",
                    "id": tool_use_id(),
                    "name": call.get("name").and_then(|v| v.as_str()).unwrap_or(""),
                    "input": {}
                }
            }));
            let args = call.get("args").cloned().unwrap_or_else(|| json!({}));
            out.push(json!({
                "type": "content_block_delta",
                "index": state.block_index,
                "delta": { "type": "input_json_delta", "partial_json": args.to_string() }
            }));
            out.push(json!({ "type": "content_block_stop", "index": state.block_index }));
            state.block_index += 1;
        }

        // Grounding metadata sits on the candidate, not the part; emitting
        // it inside the part loop without gating would duplicate it once per
        // part.
        if part_index + 1 == parts.len() {
            if let Some(grounding) = candidate
                .and_then(|c| c.pointer("/groundingMetadata/groundingChunks"))
                .and_then(|g| g.as_array())
                .filter(|g| !g.is_empty())
            {
                state.close_open_block(&mut out);
                let results: Vec<Value> = grounding
                    .iter()
                    .map(|entry| {
                        json!({
                            "type": "web_search_result",
                            "title": entry.pointer("/web/title").and_then(|v| v.as_str()).unwrap_or(""),
                            "url": entry.pointer("/web/uri").and_then(|v| v.as_str()).unwrap_or("")
                        })
                    })
                    .collect();
                out.push(json!({
                    "type": "content_block_start",
                    "index": state.block_index,
                    "content_block": {
                        "type": "web_search_tool_result",
                        "tool_use_id": format!("srvtoolu_{}", &Uuid::new_v4().simple().to_string()[..8]),
                        "content": results
                    }
                }));
                out.push(json!({ "type": "content_block_stop", "index": state.block_index }));
                state.block_index += 1;
            }
        }
    }

    if let Some(finish_reason) = candidate
        .and_then(|c| c.get("finishReason"))
        .and_then(|v| v.as_str())
    {
        state.auto_sign_if_unsigned(&mut out);
        state.close_open_block(&mut out);

        if !state.pending_text.is_empty() {
            let cleaned = state.pending_text.trim_start().to_string();
            state.pending_text.clear();
            if !cleaned.is_empty() {
                state.emit_text(&cleaned, &mut out);
                state.close_open_block(&mut out);
            }
        }

        // A stream that only ever thought would render as nothing in clients
        // that display text and tool blocks only.
        if state.has_thinking && !state.has_text && !state.has_tool_use {
            state.emit_text("[thinking complete]", &mut out);
            state.close_open_block(&mut out);
        }

        let (mut stop_reason, stop_sequence) = map_finish_reason(finish_reason);
        if state.has_tool_use {
            stop_reason = "tool_use";
        }

        let output_tokens = usage
            .and_then(|u| u.get("candidatesTokenCount"))
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        out.push(json!({
            "type": "message_delta",
            "delta": { "stop_reason": stop_reason, "stop_sequence": stop_sequence },
            "usage": { "output_tokens": output_tokens }
        }));
        out.push(json!({ "type": "message_stop" }));
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn chunk(parts: Value, finish: Option<&str>) -> Value {
        let mut candidate = json!({ "content": { "parts": parts } });
        if let Some(reason) = finish {
            candidate["finishReason"] = json!(reason);
        }
        json!({ "candidates": [candidate] })
    }

    fn types(events: &[Value]) -> Vec<String> {
        events
            .iter()
            .map(|e| {
                let t = e["type"].as_str().unwrap().to_string();
                match e.pointer("/delta/type").and_then(|v| v.as_str()) {
                    Some(d) => format!("{t}:{d}"),
                    None => t,
                }
            })
            .collect()
    }

    #[test]
    fn plain_text_stream() {
        let mut state = StreamState::new();
        let first = convert_chunk(&chunk(json!([{ "text": "hel" }]), None), &mut state);
        assert_eq!(
            types(&first),
            ["content_block_start", "content_block_delta:text_delta"]
        );
        let second = convert_chunk(&chunk(json!([{ "text": "lo" }]), Some("STOP")), &mut state);
        assert_eq!(
            types(&second),
            [
                "content_block_delta:text_delta",
                "content_block_stop",
                "message_delta",
                "message_stop"
            ]
        );
        assert_eq!(second[2]["delta"]["stop_reason"], "end_turn");
    }

    #[test]
    fn thinking_then_signature_then_text() {
        let mut state = StreamState::new();
        let events = convert_chunk(
            &chunk(
                json!([
                    { "text": "pondering", "thought": true },
                    { "text": "", "thought": true, "thoughtSignature": "sig==" },
                    { "text": "answer" }
                ]),
                Some("STOP"),
            ),
            &mut state,
        );
        assert_eq!(
            types(&events),
            [
                "content_block_start",
                "content_block_delta:thinking_delta",
                "content_block_delta:signature_delta",
                "content_block_stop",
                "content_block_start",
                "content_block_delta:text_delta",
                "content_block_stop",
                "message_delta",
                "message_stop"
            ]
        );
        assert_eq!(events[2]["delta"]["signature"], "sig==");
        assert_eq!(events[5]["delta"]["text"], "answer");
        // Block indexes advance across closes.
        assert_eq!(events[0]["index"], 0);
        assert_eq!(events[4]["index"], 1);
    }

    #[test]
    fn duplicate_signature_is_ignored() {
        let mut state = StreamState::new();
        convert_chunk(
            &chunk(
                json!([{ "text": "t", "thought": true, "thoughtSignature": "one" }]),
                None,
            ),
            &mut state,
        );
        let replay = convert_chunk(
            &chunk(
                json!([{ "text": "", "thought": true, "thoughtSignature": "one" }]),
                None,
            ),
            &mut state,
        );
        assert!(
            !replay
                .iter()
                .any(|e| e.pointer("/delta/type") == Some(&json!("signature_delta")))
        );
    }

    #[test]
    fn signature_without_thinking_delta_gets_placeholder() {
        let mut state = StreamState::new();
        let events = convert_chunk(
            &chunk(json!([{ "thoughtSignature": "sig", "text": "" }]), None),
            &mut state,
        );
        assert_eq!(events[1]["delta"]["thinking"], "(no content)");
        assert_eq!(events[2]["delta"]["signature"], "sig");
    }

    #[test]
    fn text_buffered_behind_unsigned_thinking_flushes_on_signature() {
        let mut state = StreamState::new();
        let opened = convert_chunk(
            &chunk(
                json!([{ "text": "hm", "thought": true }, { "text": "\n\nearly" }]),
                None,
            ),
            &mut state,
        );
        // The plain text is held, not interleaved into the thinking block.
        assert!(
            !opened
                .iter()
                .any(|e| e.pointer("/delta/type") == Some(&json!("text_delta")))
        );
        let signed = convert_chunk(
            &chunk(json!([{ "thought": true, "thoughtSignature": "s", "text": "" }]), None),
            &mut state,
        );
        let text_event = signed
            .iter()
            .find(|e| e.pointer("/delta/type") == Some(&json!("text_delta")))
            .unwrap();
        assert_eq!(text_event["delta"]["text"], "early");
    }

    #[test]
    fn unsigned_thinking_gets_auto_signature_before_function_call() {
        let mut state = StreamState::new();
        convert_chunk(&chunk(json!([{ "text": "hm", "thought": true }]), None), &mut state);
        // The upstream jumps straight to a tool call without ever signing.
        let events = convert_chunk(
            &chunk(json!([{ "functionCall": { "name": "lookup", "args": {} } }]), None),
            &mut state,
        );
        let sig = events
            .iter()
            .find(|e| e.pointer("/delta/type") == Some(&json!("signature_delta")))
            .unwrap();
        let raw = base64::engine::general_purpose::STANDARD
            .decode(sig["delta"]["signature"].as_str().unwrap())
            .unwrap();
        assert!(String::from_utf8(raw).unwrap().starts_with("auto_sig_"));
        // Signature closes thinking before the tool_use block opens.
        let sig_pos = types(&events)
            .iter()
            .position(|t| t == "content_block_delta:signature_delta")
            .unwrap();
        let tool_pos = events
            .iter()
            .position(|e| e.pointer("/content_block/type") == Some(&json!("tool_use")))
            .unwrap();
        assert!(sig_pos < tool_pos);
    }

    #[test]
    fn late_thinking_after_text_degrades_to_text() {
        let mut state = StreamState::new();
        convert_chunk(&chunk(json!([{ "text": "visible" }]), None), &mut state);
        let events = convert_chunk(
            &chunk(json!([{ "text": "afterthought", "thought": true }]), None),
            &mut state,
        );
        assert_eq!(types(&events), ["content_block_delta:text_delta"]);
        assert_eq!(events[0]["delta"]["text"], "\nafterthought");
    }

    #[test]
    fn function_call_is_self_contained_and_forces_tool_use_stop() {
        let mut state = StreamState::new();
        let events = convert_chunk(
            &chunk(
                json!([
                    { "text": "checking" },
                    { "functionCall": { "name": "lookup", "args": { "q": "rust" } } }
                ]),
                Some("STOP"),
            ),
            &mut state,
        );
        assert_eq!(
            types(&events),
            [
                "content_block_start",
                "content_block_delta:text_delta",
                "content_block_stop",
                "content_block_start",
                "content_block_delta:input_json_delta",
                "content_block_stop",
                "message_delta",
                "message_stop"
            ]
        );
        assert_eq!(events[3]["content_block"]["type"], "tool_use");
        assert_eq!(events[3]["content_block"]["name"], "lookup");
        assert_eq!(
            events[4]["delta"]["partial_json"],
            json!({ "q": "rust" }).to_string()
        );
        assert_eq!(events[6]["delta"]["stop_reason"], "tool_use");
    }

    #[test]
    fn grounding_emitted_once_for_multi_part_chunk() {
        let mut state = StreamState::new();
        let chunk = json!({
            "candidates": [{
                "content": { "parts": [{ "text": "a" }, { "text": "b" }] },
                "groundingMetadata": {
                    "groundingChunks": [
                        { "web": { "title": "Rust", "uri": "https://rust-lang.org" } }
                    ]
                }
            }]
        });
        let events = convert_chunk(&chunk, &mut state);
        let grounding: Vec<_> = events
            .iter()
            .filter(|e| e.pointer("/content_block/type") == Some(&json!("web_search_tool_result")))
            .collect();
        assert_eq!(grounding.len(), 1);
        assert_eq!(
            grounding[0]["content_block"]["content"][0]["url"],
            "https://rust-lang.org"
        );
        assert!(
            grounding[0]["content_block"]["tool_use_id"]
                .as_str()
                .unwrap()
                .starts_with("srvtoolu_")
        );
    }

    #[test]
    fn thinking_only_stream_gets_visible_placeholder() {
        let mut state = StreamState::new();
        let events = convert_chunk(
            &chunk(
                json!([{ "text": "hm", "thought": true, "thoughtSignature": "s" }]),
                Some("STOP"),
            ),
            &mut state,
        );
        let placeholder = events
            .iter()
            .find(|e| e.pointer("/delta/type") == Some(&json!("text_delta")))
            .unwrap();
        assert_eq!(placeholder["delta"]["text"], "[thinking complete]");
    }

    #[test]
    fn terminal_chunk_reports_usage_and_safety_mapping() {
        let mut state = StreamState::new();
        let chunk = json!({
            "candidates": [{
                "content": { "parts": [{ "text": "x" }] },
                "finishReason": "SAFETY"
            }],
            "usageMetadata": { "candidatesTokenCount": 7 }
        });
        let events = convert_chunk(&chunk, &mut state);
        let delta = events
            .iter()
            .find(|e| e["type"] == "message_delta")
            .unwrap();
        assert_eq!(delta["delta"]["stop_reason"], "stop_sequence");
        assert_eq!(delta["delta"]["stop_sequence"], "SAFETY");
        assert_eq!(delta["usage"]["output_tokens"], 7);
    }

    #[test]
    fn pa_envelope_chunk_unwraps() {
        let mut state = StreamState::new();
        let chunk = json!({
            "response": {
                "candidates": [{ "content": { "parts": [{ "text": "hi" }] } }]
            }
        });
        let events = convert_chunk(&chunk, &mut state);
        assert_eq!(events[1]["delta"]["text"], "hi");
    }
}
