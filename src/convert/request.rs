use crate::claude::{
    ContentBlock, InboundMessage, MessageContent, MessagesRequest, OverridePosition, Role,
    SystemPromptOverride, ToolChoice,
};
use crate::config::{ModelCapabilities, ThinkingStyle};
use crate::convert::schema::sanitize_schema;
use serde_json::{Map, Value, json};

const WEB_SEARCH_TOOL: &str = "web_search";
const MAX_THINKING_BUDGET: u64 = 32_768;

/// Builds a Gemini generateContent body from a Claude Messages request.
pub fn encode_request(
    req: &MessagesRequest,
    system_override: Option<&SystemPromptOverride>,
    target_model: &str,
    capabilities: &ModelCapabilities,
) -> Value {
    let system_instruction = resolve_system_instruction(req, system_override);
    let contents = encode_messages(&req.messages);

    let mut generation_config = Map::new();
    if let Some(temperature) = req.temperature {
        generation_config.insert("temperature".to_string(), Value::from(temperature));
    }
    if let Some(top_p) = req.top_p {
        generation_config.insert("topP".to_string(), Value::from(top_p));
    }
    if let Some(top_k) = req.top_k {
        generation_config.insert("topK".to_string(), Value::from(top_k));
    }
    if let Some(max_tokens) = req.max_tokens {
        generation_config.insert("maxOutputTokens".to_string(), Value::from(max_tokens));
    }
    if let Some(stops) = &req.stop_sequences {
        if !stops.is_empty() {
            generation_config.insert("stopSequences".to_string(), json!(stops));
        }
    }
    if let Some(thinking_config) = encode_thinking_config(req, target_model, capabilities) {
        generation_config.insert("thinkingConfig".to_string(), thinking_config);
    }

    let mut body = json!({
        "contents": contents,
        "generationConfig": generation_config,
        "safetySettings": [
            { "category": "HARM_CATEGORY_HARASSMENT", "threshold": "BLOCK_NONE" },
            { "category": "HARM_CATEGORY_HATE_SPEECH", "threshold": "BLOCK_NONE" },
            { "category": "HARM_CATEGORY_SEXUALLY_EXPLICIT", "threshold": "BLOCK_NONE" },
            { "category": "HARM_CATEGORY_DANGEROUS_CONTENT", "threshold": "BLOCK_NONE" }
        ]
    });
    let obj = body.as_object_mut().expect("gemini request object");

    if let Some((tools, tool_config)) = encode_tools(req) {
        if !tools.is_empty() {
            obj.insert("tools".to_string(), Value::Array(tools));
        }
        if let Some(tool_config) = tool_config {
            obj.insert("toolConfig".to_string(), tool_config);
        }
    }

    if !system_instruction.is_empty() {
        obj.insert(
            "systemInstruction".to_string(),
            json!({ "parts": [{ "text": system_instruction }] }),
        );
    }

    body
}

fn resolve_system_instruction(
    req: &MessagesRequest,
    system_override: Option<&SystemPromptOverride>,
) -> String {
    let base = req
        .system
        .as_ref()
        .map(|s| s.flatten())
        .unwrap_or_default();

    let Some(over) = system_override.filter(|o| !o.prompt.is_empty()) else {
        return base;
    };
    if base.is_empty() {
        return over.prompt.clone();
    }
    match over.position {
        OverridePosition::Prepend => format!("{}\n\n{}", over.prompt, base),
        OverridePosition::Append => format!("{}\n\n{}", base, over.prompt),
    }
}

/// Maps Claude messages onto alternating Gemini contents. Consecutive turns
/// that map to the same role are merged; an emitted turn never has zero
/// parts (the API rejects an empty parts array).
fn encode_messages(messages: &[InboundMessage]) -> Vec<Value> {
    let mut contents: Vec<Value> = Vec::new();

    for (index, message) in messages.iter().enumerate() {
        let parts = encode_message_parts(message, &messages[..index]);

        let role = match message.role {
            Role::Assistant => "model",
            Role::User => "user",
        };

        match contents.last_mut() {
            Some(prev) if prev["role"] == role => {
                if let Some(prev_parts) = prev["parts"].as_array_mut() {
                    prev_parts.extend(parts);
                }
            }
            _ => {
                let parts = if parts.is_empty() {
                    vec![json!({ "text": "" })]
                } else {
                    parts
                };
                contents.push(json!({ "role": role, "parts": parts }));
            }
        }
    }

    contents
}

/// Converts one message's blocks. A thinking block is invisible in the
/// output: only its signature survives, pinned to the next emitted text or
/// functionCall part of the same message. Every functionCall carries a
/// thoughtSignature field — the upstream rejects calls without one — so a
/// call with nothing pending falls back to the previous part's signature or
/// an empty string.
fn encode_message_parts(message: &InboundMessage, earlier: &[InboundMessage]) -> Vec<Value> {
    let mut parts: Vec<Value> = Vec::new();

    let blocks = match &message.content {
        MessageContent::Text(text) => {
            parts.push(json!({ "text": text }));
            return parts;
        }
        MessageContent::Blocks(blocks) => blocks,
    };

    let mut pending_signature: Option<String> = None;

    for block in blocks {
        match block {
            ContentBlock::Text { text } => {
                let mut part = json!({ "text": text });
                if let Some(sig) = pending_signature.take() {
                    part["thoughtSignature"] = Value::String(sig);
                }
                parts.push(part);
            }
            ContentBlock::Thinking { signature, .. } => {
                if let Some(sig) = signature {
                    pending_signature = Some(sig.clone());
                }
            }
            ContentBlock::ToolUse { name, input, .. } => {
                let signature = pending_signature
                    .take()
                    .or_else(|| previous_part_signature(&parts))
                    .unwrap_or_default();
                parts.push(json!({
                    "functionCall": { "name": name, "args": input },
                    "thoughtSignature": signature
                }));
            }
            ContentBlock::Image { source } | ContentBlock::Document { source } => {
                parts.push(json!({
                    "inlineData": { "mimeType": source.media_type, "data": source.data }
                }));
            }
            ContentBlock::ToolResult {
                tool_use_id,
                content,
            } => {
                parts.push(json!({
                    "functionResponse": {
                        "name": find_tool_name(earlier, tool_use_id),
                        "response": { "result": content }
                    }
                }));
            }
            ContentBlock::Other => {}
        }
    }

    parts
}

fn previous_part_signature(parts: &[Value]) -> Option<String> {
    parts
        .last()
        .and_then(|p| p.get("thoughtSignature"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

/// Claude tool_result blocks reference a tool_use id; Gemini wants the
/// function name. Scan prior assistant turns, most recent first.
fn find_tool_name(earlier: &[InboundMessage], tool_use_id: &str) -> String {
    for message in earlier.iter().rev() {
        if message.role != Role::Assistant {
            continue;
        }
        let MessageContent::Blocks(blocks) = &message.content else {
            continue;
        };
        for block in blocks {
            if let ContentBlock::ToolUse { id, name, .. } = block {
                if id == tool_use_id {
                    return name.clone();
                }
            }
        }
    }
    "unknown_tool".to_string()
}

fn encode_tools(req: &MessagesRequest) -> Option<(Vec<Value>, Option<Value>)> {
    let tools = req.tools.as_ref().filter(|t| !t.is_empty())?;

    let function_tools: Vec<_> = tools.iter().filter(|t| t.name != WEB_SEARCH_TOOL).collect();
    let has_web_search = tools.iter().any(|t| t.name == WEB_SEARCH_TOOL);

    let mut out = Vec::new();
    if !function_tools.is_empty() {
        let declarations: Vec<Value> = function_tools
            .iter()
            .map(|tool| {
                let mut decl = json!({ "name": tool.name });
                if let Some(description) = &tool.description {
                    decl["description"] = Value::String(description.clone());
                }
                if let Some(schema) = &tool.input_schema {
                    decl["parametersJsonSchema"] = sanitize_schema(schema);
                }
                decl
            })
            .collect();
        out.push(json!({ "functionDeclarations": declarations }));
    }
    if has_web_search {
        out.push(json!({ "googleSearch": {} }));
    }

    // No explicit tool_choice means no toolConfig; the upstream default is
    // not ours to second-guess.
    let tool_config = req.tool_choice.as_ref().map(|choice| match choice {
        ToolChoice::Auto => json!({ "functionCallingConfig": { "mode": "auto" } }),
        ToolChoice::Any => {
            let names: Vec<&str> = function_tools.iter().map(|t| t.name.as_str()).collect();
            json!({ "functionCallingConfig": { "mode": "any", "allowedFunctionNames": names } })
        }
        ToolChoice::Tool { name } => {
            json!({ "functionCallingConfig": { "mode": "any", "allowedFunctionNames": [name] } })
        }
        ToolChoice::None => json!({ "functionCallingConfig": { "mode": "none" } }),
    });

    Some((out, tool_config))
}

fn encode_thinking_config(
    req: &MessagesRequest,
    target_model: &str,
    capabilities: &ModelCapabilities,
) -> Option<Value> {
    let style = capabilities.thinking_style(target_model);
    if style == ThinkingStyle::Unsupported {
        return None;
    }

    let effort = req.reasoning.as_ref().and_then(|r| r.effort.as_deref());
    let budget = req.thinking.as_ref().and_then(|t| t.budget_tokens);
    let requested = req.thinking.is_some() || effort.is_some();
    let mandatory = capabilities.requires_thinking(target_model);
    if !requested && !mandatory {
        return None;
    }

    let mut config = json!({ "includeThoughts": true });
    match style {
        ThinkingStyle::Level => {
            if let Some(level) = effort.map(effort_to_level).or(budget.map(budget_to_level)) {
                config["thinkingLevel"] = Value::String(level.to_string());
            }
        }
        ThinkingStyle::Budget => {
            if let Some(budget) = budget {
                config["thinkingBudget"] = Value::from(budget.min(MAX_THINKING_BUDGET));
            } else if mandatory {
                // No explicit budget but the model cannot run without
                // thinking: -1 asks for an unbounded budget.
                config["thinkingBudget"] = Value::from(-1);
            }
        }
        ThinkingStyle::Unsupported => unreachable!(),
    }
    Some(config)
}

fn effort_to_level(effort: &str) -> &'static str {
    match effort.to_ascii_lowercase().as_str() {
        "low" => "LOW",
        "medium" => "MEDIUM",
        _ => "HIGH",
    }
}

fn budget_to_level(budget: u64) -> &'static str {
    if budget <= 1024 {
        "LOW"
    } else if budget <= 8192 {
        "MEDIUM"
    } else {
        "HIGH"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(body: Value) -> MessagesRequest {
        serde_json::from_value(body).unwrap()
    }

    fn caps() -> ModelCapabilities {
        ModelCapabilities::default()
    }

    #[test]
    fn minimal_request() {
        let req = request(json!({
            "model": "claude-sonnet-4",
            "messages": [{ "role": "user", "content": "Hi" }],
            "max_tokens": 100
        }));
        let body = encode_request(&req, None, "gemini-2.5-pro", &caps());
        assert_eq!(
            body["contents"],
            json!([{ "role": "user", "parts": [{ "text": "Hi" }] }])
        );
        assert_eq!(body["generationConfig"]["maxOutputTokens"], 100);
        assert!(body.get("tools").is_none());
        assert!(body["generationConfig"].get("thinkingConfig").is_none());
        assert!(body.get("systemInstruction").is_none());
    }

    #[test]
    fn consecutive_same_role_turns_merge() {
        let req = request(json!({
            "model": "m",
            "messages": [
                { "role": "user", "content": "a" },
                { "role": "user", "content": "b" },
                { "role": "assistant", "content": "c" }
            ]
        }));
        let body = encode_request(&req, None, "gemini-2.5-pro", &caps());
        let contents = body["contents"].as_array().unwrap();
        assert_eq!(contents.len(), 2);
        assert_eq!(contents[0]["parts"], json!([{ "text": "a" }, { "text": "b" }]));
        assert_eq!(contents[1]["role"], "model");
    }

    #[test]
    fn thinking_block_is_invisible_but_signature_moves_to_next_part() {
        let req = request(json!({
            "model": "m",
            "messages": [{
                "role": "assistant",
                "content": [
                    { "type": "thinking", "thinking": "secret chain", "signature": "sig==" },
                    { "type": "text", "text": "answer" }
                ]
            }]
        }));
        let body = encode_request(&req, None, "gemini-2.5-pro", &caps());
        let parts = body["contents"][0]["parts"].as_array().unwrap();
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0]["text"], "answer");
        assert_eq!(parts[0]["thoughtSignature"], "sig==");
        // The thinking text itself must not appear anywhere.
        assert!(!body.to_string().contains("secret chain"));
    }

    #[test]
    fn tool_use_without_signature_gets_empty_string() {
        let req = request(json!({
            "model": "m",
            "messages": [{
                "role": "assistant",
                "content": [
                    { "type": "tool_use", "id": "t1", "name": "lookup", "input": { "q": "x" } }
                ]
            }]
        }));
        let body = encode_request(&req, None, "gemini-2.5-pro", &caps());
        let part = &body["contents"][0]["parts"][0];
        assert_eq!(part["functionCall"]["name"], "lookup");
        assert_eq!(part["thoughtSignature"], "");
    }

    #[test]
    fn tool_use_consumes_pending_signature() {
        let req = request(json!({
            "model": "m",
            "messages": [{
                "role": "assistant",
                "content": [
                    { "type": "thinking", "thinking": "t", "signature": "abc" },
                    { "type": "tool_use", "id": "t1", "name": "lookup", "input": {} }
                ]
            }]
        }));
        let body = encode_request(&req, None, "gemini-2.5-pro", &caps());
        assert_eq!(body["contents"][0]["parts"][0]["thoughtSignature"], "abc");
    }

    #[test]
    fn tool_result_resolves_name_from_prior_assistant_turn() {
        let req = request(json!({
            "model": "m",
            "messages": [
                {
                    "role": "assistant",
                    "content": [{ "type": "tool_use", "id": "call_9", "name": "search", "input": {} }]
                },
                {
                    "role": "user",
                    "content": [{ "type": "tool_result", "tool_use_id": "call_9", "content": "ok" }]
                }
            ]
        }));
        let body = encode_request(&req, None, "gemini-2.5-pro", &caps());
        let fr = &body["contents"][1]["parts"][0]["functionResponse"];
        assert_eq!(fr["name"], "search");
        assert_eq!(fr["response"]["result"], "ok");
    }

    #[test]
    fn unresolvable_tool_result_maps_to_unknown_tool() {
        let req = request(json!({
            "model": "m",
            "messages": [{
                "role": "user",
                "content": [{ "type": "tool_result", "tool_use_id": "nope", "content": "x" }]
            }]
        }));
        let body = encode_request(&req, None, "gemini-2.5-pro", &caps());
        assert_eq!(
            body["contents"][0]["parts"][0]["functionResponse"]["name"],
            "unknown_tool"
        );
    }

    #[test]
    fn system_array_joins_and_override_appends() {
        let req = request(json!({
            "model": "m",
            "messages": [{ "role": "user", "content": "hi" }],
            "system": [{ "type": "text", "text": "one" }, { "type": "text", "text": "two" }]
        }));
        let over = SystemPromptOverride {
            prompt: "extra".to_string(),
            position: OverridePosition::Append,
        };
        let body = encode_request(&req, Some(&over), "gemini-2.5-pro", &caps());
        assert_eq!(
            body["systemInstruction"]["parts"][0]["text"],
            "one\ntwo\n\nextra"
        );
    }

    #[test]
    fn override_prepends() {
        let req = request(json!({
            "model": "m",
            "messages": [{ "role": "user", "content": "hi" }],
            "system": "base"
        }));
        let over = SystemPromptOverride {
            prompt: "first".to_string(),
            position: OverridePosition::Prepend,
        };
        let body = encode_request(&req, Some(&over), "gemini-2.5-pro", &caps());
        assert_eq!(body["systemInstruction"]["parts"][0]["text"], "first\n\nbase");
    }

    #[test]
    fn web_search_tool_splits_from_function_tools() {
        let req = request(json!({
            "model": "m",
            "messages": [{ "role": "user", "content": "hi" }],
            "tools": [
                { "name": "lookup", "input_schema": { "type": "object" } },
                { "name": "web_search" }
            ],
            "tool_choice": { "type": "any" }
        }));
        let body = encode_request(&req, None, "gemini-2.5-pro", &caps());
        let tools = body["tools"].as_array().unwrap();
        assert_eq!(tools.len(), 2);
        assert_eq!(tools[0]["functionDeclarations"][0]["name"], "lookup");
        assert_eq!(
            tools[0]["functionDeclarations"][0]["parametersJsonSchema"]["type"],
            "OBJECT"
        );
        assert_eq!(tools[1], json!({ "googleSearch": {} }));
        // "any" lists only function tools, never the built-in search.
        assert_eq!(
            body["toolConfig"]["functionCallingConfig"]["allowedFunctionNames"],
            json!(["lookup"])
        );
    }

    #[test]
    fn named_tool_choice_restricts_to_one_name() {
        let req = request(json!({
            "model": "m",
            "messages": [{ "role": "user", "content": "hi" }],
            "tools": [{ "name": "a" }, { "name": "b" }],
            "tool_choice": { "type": "tool", "name": "b" }
        }));
        let body = encode_request(&req, None, "gemini-2.5-pro", &caps());
        let cfg = &body["toolConfig"]["functionCallingConfig"];
        assert_eq!(cfg["mode"], "any");
        assert_eq!(cfg["allowedFunctionNames"], json!(["b"]));
    }

    #[test]
    fn budget_family_caps_thinking_budget() {
        let req = request(json!({
            "model": "m",
            "messages": [{ "role": "user", "content": "hi" }],
            "thinking": { "budget_tokens": 100000 }
        }));
        let body = encode_request(&req, None, "gemini-2.5-flash", &caps());
        let cfg = &body["generationConfig"]["thinkingConfig"];
        assert_eq!(cfg["includeThoughts"], true);
        assert_eq!(cfg["thinkingBudget"], 32768);
    }

    #[test]
    fn level_family_buckets_budget() {
        let base = json!({
            "model": "m",
            "messages": [{ "role": "user", "content": "hi" }]
        });
        for (budget, level) in [(512, "LOW"), (4096, "MEDIUM"), (20000, "HIGH")] {
            let mut body = base.clone();
            body["thinking"] = json!({ "budget_tokens": budget });
            let req = request(body);
            let out = encode_request(&req, None, "gemini-3-pro", &caps());
            assert_eq!(
                out["generationConfig"]["thinkingConfig"]["thinkingLevel"],
                level
            );
        }
    }

    #[test]
    fn effort_label_wins_over_budget_for_level_family() {
        let req = request(json!({
            "model": "m",
            "messages": [{ "role": "user", "content": "hi" }],
            "thinking": { "budget_tokens": 100 },
            "reasoning": { "effort": "high" }
        }));
        let body = encode_request(&req, None, "gemini-3-pro", &caps());
        assert_eq!(
            body["generationConfig"]["thinkingConfig"]["thinkingLevel"],
            "HIGH"
        );
    }

    #[test]
    fn mandatory_thinking_model_gets_config_without_directive() {
        let req = request(json!({
            "model": "m",
            "messages": [{ "role": "user", "content": "hi" }]
        }));
        let body = encode_request(&req, None, "gemini-3-pro", &caps());
        assert_eq!(
            body["generationConfig"]["thinkingConfig"]["includeThoughts"],
            true
        );
    }

    #[test]
    fn unsupported_family_never_gets_thinking_config() {
        let req = request(json!({
            "model": "m",
            "messages": [{ "role": "user", "content": "hi" }],
            "thinking": { "budget_tokens": 2048 }
        }));
        let body = encode_request(&req, None, "gemini-1.5-pro", &caps());
        assert!(body["generationConfig"].get("thinkingConfig").is_none());
    }

    #[test]
    fn unknown_blocks_are_dropped_and_empty_turn_gets_placeholder() {
        let req = request(json!({
            "model": "m",
            "messages": [{
                "role": "user",
                "content": [{ "type": "mystery_block", "data": 1 }]
            }]
        }));
        let body = encode_request(&req, None, "gemini-2.5-pro", &caps());
        assert_eq!(body["contents"][0]["parts"], json!([{ "text": "" }]));
    }
}
