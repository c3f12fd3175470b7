use crate::chat::{
    ChatCompletionRequest, ChatCompletionResponse, Choice, FunctionCall, Message, StreamChunk,
    Tool, ToolCall,
};
use chrono::Utc;
use serde_json::Value;

/// Parsed shape of a compat upstream reply: exactly one of
/// `{"tool_call":{...}}` or `{"final":"..."}`.
#[derive(Debug, PartialEq)]
pub enum CompatOutput {
    ToolCall { name: String, arguments: String },
    Final(String),
    Unparsed,
}

/// Builds the outbound request for an upstream without native tool
/// support: a synthesized system message carries the tool schemas, all
/// tool fields are stripped, and the upstream call is forced non-stream
/// (the client stream, if any, is synthesized locally).
pub fn build_compat_request(
    original: &ChatCompletionRequest,
    translated: &ChatCompletionRequest,
) -> Result<ChatCompletionRequest, String> {
    let tools = collect_compat_tools(original);
    if tools.is_empty() {
        return Err("no tools to adapt".to_string());
    }

    let mut compat = translated.clone();
    compat.stream = false;
    compat.strip_tool_fields();

    let mut messages = Vec::with_capacity(compat.messages.len() + 1);
    messages.push(Message {
        role: "system".to_string(),
        content: Value::String(build_compat_system_prompt(&tools)),
        ..Message::default()
    });
    messages.extend(normalize_compat_messages(compat.messages));
    compat.messages = messages;

    Ok(compat)
}

/// Modern tools win; legacy functions are wrapped into the modern shape.
pub fn collect_compat_tools(req: &ChatCompletionRequest) -> Vec<Tool> {
    if !req.tools.is_empty() {
        return req.tools.clone();
    }
    req.functions
        .iter()
        .map(|f| Tool {
            tool_type: "function".to_string(),
            function: f.clone(),
        })
        .collect()
}

fn build_compat_system_prompt(tools: &[Tool]) -> String {
    let tool_json = serde_json::to_string(tools).unwrap_or_else(|_| "[]".to_string());
    format!(
        "You are the apimux function-calling compatibility layer.\n\
         The upstream model does not support native tools/function_call.\n\
         Available tools(JSON schema):\n{tool_json}\n\
         Return ONLY one JSON object, no markdown/code fence.\n\
         If a tool should be called, output:\n\
         {{\"tool_call\":{{\"name\":\"<tool_name>\",\"arguments\":{{...}}}}}}\n\
         If no tool call is needed, output:\n\
         {{\"final\":\"<assistant_response>\"}}"
    )
}

/// Flattens tool-protocol messages into plain dialogue so upstreams
/// ignorant of the protocol still see a coherent conversation: `tool`
/// results become prefixed user messages, assistant tool invocations
/// become descriptive text.
pub fn normalize_compat_messages(messages: Vec<Message>) -> Vec<Message> {
    messages
        .into_iter()
        .map(|mut msg| {
            if msg.role == "tool" {
                let content = extract_content_text(&msg.content);
                let content = match msg.tool_call_id.as_deref().filter(|id| !id.is_empty()) {
                    Some(id) => format!("Tool result ({id}): {content}"),
                    None => format!("Tool result: {content}"),
                };
                return Message {
                    role: "user".to_string(),
                    content: Value::String(content),
                    ..Message::default()
                };
            }

            if msg.role == "assistant"
                && (!msg.tool_calls.is_empty() || msg.function_call.is_some())
            {
                let mut text = extract_content_text(&msg.content);
                if !text.is_empty() {
                    text.push('\n');
                }
                for call in &msg.tool_calls {
                    text.push_str(&format!(
                        "Assistant tool call: name={} arguments={}\n",
                        call.function.name, call.function.arguments
                    ));
                }
                if let Some(call) = &msg.function_call {
                    text.push_str(&format!(
                        "Assistant function call: name={} arguments={}",
                        call.name, call.arguments
                    ));
                }
                msg.content = Value::String(text.trim().to_string());
                msg.tool_calls.clear();
                msg.function_call = None;
            }

            msg
        })
        .collect()
}

/// Projects the compat upstream reply back into the standard tool-calling
/// shape. Parse failures fall back to returning the raw text as assistant
/// content rather than failing the request.
pub fn build_compat_response(upstream: &ChatCompletionResponse) -> ChatCompletionResponse {
    let text = extract_response_text(upstream);

    let (message, finish_reason) = match parse_compat_output(&text) {
        CompatOutput::ToolCall { name, arguments } => (
            Message {
                role: "assistant".to_string(),
                content: Value::String(String::new()),
                tool_calls: vec![ToolCall {
                    id: format!("call_{}", uuid::Uuid::new_v4().simple()),
                    call_type: "function".to_string(),
                    function: FunctionCall { name, arguments },
                }],
                ..Message::default()
            },
            "tool_calls",
        ),
        CompatOutput::Final(final_text) => (assistant_text(final_text), "stop"),
        CompatOutput::Unparsed => (assistant_text(text), "stop"),
    };

    ChatCompletionResponse {
        id: fallback_id(upstream),
        object: fallback_object(upstream),
        created: fallback_created(upstream),
        model: upstream.model.clone(),
        usage: upstream.usage.clone(),
        choices: vec![Choice {
            index: 0,
            message: Some(message),
            delta: None,
            finish_reason: Some(finish_reason.to_string()),
        }],
        system_fingerprint: None,
    }
}

fn assistant_text(text: String) -> Message {
    let content = if text.is_empty() {
        "(empty response)".to_string()
    } else {
        text
    };
    Message {
        role: "assistant".to_string(),
        content: Value::String(content),
        ..Message::default()
    }
}

pub fn parse_compat_output(text: &str) -> CompatOutput {
    let clean = strip_code_fence(text);
    if clean.is_empty() {
        return CompatOutput::Unparsed;
    }

    let Ok(payload) = serde_json::from_str::<Value>(&clean) else {
        return CompatOutput::Unparsed;
    };

    if let Some(call) = payload.get("tool_call") {
        let name = call
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or("")
            .trim()
            .to_string();
        if !name.is_empty() {
            return CompatOutput::ToolCall {
                name,
                arguments: canonicalize_arguments(call.get("arguments")),
            };
        }
    }

    if let Some(final_text) = payload
        .get("final")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
    {
        return CompatOutput::Final(final_text.to_string());
    }

    CompatOutput::Unparsed
}

/// Missing or null arguments become `{}`; a non-JSON string is wrapped as
/// `{"input": <original>}`; anything else serializes as-is.
fn canonicalize_arguments(arguments: Option<&Value>) -> String {
    match arguments {
        None | Some(Value::Null) => "{}".to_string(),
        Some(Value::String(s)) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                return "{}".to_string();
            }
            if serde_json::from_str::<Value>(trimmed).is_ok() {
                trimmed.to_string()
            } else {
                serde_json::json!({ "input": trimmed }).to_string()
            }
        }
        Some(other) => other.to_string(),
    }
}

/// Trims an optional ``` fence (with or without a `json` info string).
pub fn strip_code_fence(text: &str) -> String {
    let s = text.trim();
    if !s.starts_with("```") {
        return s.to_string();
    }
    let s = s
        .strip_prefix("```json")
        .or_else(|| s.strip_prefix("```JSON"))
        .or_else(|| s.strip_prefix("```"))
        .unwrap_or(s);
    let s = match s.rfind("```") {
        Some(idx) => &s[..idx],
        None => s,
    };
    s.trim().to_string()
}

pub fn extract_response_text(resp: &ChatCompletionResponse) -> String {
    resp.choices
        .first()
        .and_then(|c| c.message.as_ref())
        .map(|m| extract_content_text(&m.content).trim().to_string())
        .unwrap_or_default()
}

/// Collapses string-or-parts message content into plain text.
pub fn extract_content_text(content: &Value) -> String {
    match content {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Array(parts) => {
            let texts: Vec<&str> = parts
                .iter()
                .filter(|p| p.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|p| p.get("text").and_then(Value::as_str))
                .filter(|t| !t.is_empty())
                .collect();
            if !texts.is_empty() {
                return texts.join("\n");
            }
            content.to_string()
        }
        Value::Object(map) => {
            if let Some(text) = map.get("text").and_then(Value::as_str) {
                return text.to_string();
            }
            content.to_string()
        }
        other => other.to_string(),
    }
}

/// The synthesized client stream: one chunk carrying the role and either
/// tool calls or content, one closing chunk with the finish reason. No
/// attempt is made to tokenize the text further.
pub fn compat_stream_chunks(resp: &ChatCompletionResponse) -> Vec<StreamChunk> {
    let Some(message) = resp.choices.first().and_then(|c| c.message.as_ref()) else {
        return Vec::new();
    };

    let mut first_delta = Message {
        role: "assistant".to_string(),
        ..Message::default()
    };
    if !message.tool_calls.is_empty() {
        first_delta.tool_calls = message.tool_calls.clone();
        first_delta.content = Value::String(String::new());
    } else {
        first_delta.content = message.content.clone();
    }

    let created = Utc::now().timestamp();
    let first = StreamChunk {
        id: resp.id.clone(),
        object: "chat.completion.chunk".to_string(),
        created,
        model: resp.model.clone(),
        choices: vec![Choice {
            index: 0,
            delta: Some(first_delta),
            ..Choice::default()
        }],
    };
    let closing = StreamChunk {
        id: resp.id.clone(),
        object: "chat.completion.chunk".to_string(),
        created,
        model: resp.model.clone(),
        choices: vec![Choice {
            index: 0,
            finish_reason: resp.choices[0].finish_reason.clone(),
            ..Choice::default()
        }],
    };
    vec![first, closing]
}

fn fallback_id(resp: &ChatCompletionResponse) -> String {
    if !resp.id.trim().is_empty() {
        return resp.id.clone();
    }
    format!("chatcmpl-apimux-{}", uuid::Uuid::new_v4().simple())
}

fn fallback_object(resp: &ChatCompletionResponse) -> String {
    if !resp.object.trim().is_empty() {
        return resp.object.clone();
    }
    "chat.completion".to_string()
}

fn fallback_created(resp: &ChatCompletionResponse) -> i64 {
    if resp.created > 0 {
        return resp.created;
    }
    Utc::now().timestamp()
}
