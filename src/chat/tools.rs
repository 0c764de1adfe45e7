//! Tool protocol (C5): the two-stage helpfulness/emission probe that may
//! short-circuit the main completion with a synthesized `tool_calls` message.
//!
//! Grounded in `pkg/llamacpp/handletools.go`. All five steps from the
//! distilled spec are implemented; unlike the original, a malformed
//! tool-call string surfaces as a real `BadRequest` and an unrecognized tool
//! name is logged and treated as "no tool used" rather than silently
//! propagated as an opaque error (see DESIGN.md).

use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;

use super::template::ChatTemplate;
use super::types::{ChatCompletionMessage, Message, Tool, ToolCall};
use crate::connector::BackendConnector;
use crate::error::MiddlewareError;
use crate::expiring_map::ExpiringMap;
use crate::ids::nanosecond_hex_id;
use crate::llama::{run_single_completion, LlamaRequest};

static FUNCTION_CALL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\w+)\((.*)\)").unwrap());
static ARG_SPLIT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"\w+=\[[^\[\]]*\]|\w+="[^"]*"|\w+=[^,]+"#).unwrap());

/// What the tool pipeline decided. `None` means "proceed to a normal
/// completion"; `Some` carries the already-built response message plus the
/// fixed `"tool_call"` finish reason.
pub type ToolOutcome = Option<ChatCompletionMessage>;

pub struct ToolContext<'a> {
    pub connector: &'a Arc<BackendConnector>,
    pub endpoint_url: &'a str,
    pub slot_index: usize,
    pub template: &'a ChatTemplate,
    pub stop: &'a [String],
    pub tool_calls: &'a ExpiringMap,
}

/// Entry point mirroring `handleTools`. Returns `Ok(None)` for every path
/// that should fall through to the normal completion, `Ok(Some(..))` when a
/// tool call was emitted, and `Err` only for a malformed emission (§7.3).
pub async fn handle_tools(
    ctx: &ToolContext<'_>,
    messages: &[Message],
    tools: &[Tool],
    tool_choice: &str,
) -> Result<ToolOutcome, MiddlewareError> {
    if tools.is_empty() || tool_choice == "none" {
        return Ok(None);
    }

    let last_tool = get_last_tool(messages, ctx.tool_calls).await;
    let Some(tool_prompt) = tools_to_prompt(tools, last_tool.as_deref()) else {
        return Ok(None);
    };

    if tool_choice != "required"
        && !check_if_tool_helpful(ctx, messages, &tool_prompt).await
    {
        return Ok(None);
    }

    let Some(raw_call) = generate_tool_call(ctx, messages, &tool_prompt).await else {
        return Ok(None);
    };
    let (name, arguments) = match parse_function(&raw_call) {
        Some(parsed) => parsed,
        None => return Err(MiddlewareError::BadRequest("invalid input format".into())),
    };

    let Some(tool) = tools.iter().find(|t| t.function.name == name) else {
        tracing::warn!(tool = %name, "generated tool call names an unknown tool, falling through");
        return Ok(None);
    };

    let (message, tool_call_id) = create_tool_chatcompletion_message(tool, &arguments);
    ctx.tool_calls.set(tool_call_id, name).await;
    Ok(Some(message))
}

async fn get_last_tool(messages: &[Message], tool_calls: &ExpiringMap) -> Option<String> {
    let last = messages.last()?;
    if last.role != "tool" {
        return None;
    }
    let id = last.tool_call_id.as_deref()?;
    tool_calls.get(id).await
}

fn tools_to_prompt(tools: &[Tool], ignore: Option<&str>) -> Option<String> {
    let rendered: Vec<String> = tools
        .iter()
        .filter(|t| Some(t.function.name.as_str()) != ignore)
        .map(tool_to_prompt)
        .collect();
    if rendered.is_empty() {
        None
    } else {
        Some(rendered.join("\n"))
    }
}

fn tool_to_prompt(tool: &Tool) -> String {
    let mut parameters = Vec::new();
    let mut descriptions = Vec::new();
    for (name, prop) in &tool.function.parameters.properties {
        let ty = if prop.property_type == "integer" {
            "int"
        } else {
            "str"
        };
        parameters.push(format!("{name}: {ty}"));
        descriptions.push(format!(
            "{name}: {} {}",
            prop.description,
            prop.enum_values.join(", ")
        ));
    }
    format!(
        "{}({}) # {} ({})",
        tool.function.name,
        parameters.join(", "),
        tool.function.description,
        descriptions.join(", "),
    )
}

fn last_user_message(messages: &[Message]) -> Option<&Message> {
    messages.iter().rev().find(|m| m.role == "user")
}

async fn check_if_tool_helpful(ctx: &ToolContext<'_>, messages: &[Message], tools: &str) -> bool {
    let Some(user_msg) = last_user_message(messages) else {
        return false;
    };

    let mut probe_messages = messages.to_vec();
    probe_messages.push(Message {
        role: "user".to_string(),
        content: super::types::Content::Text(format!(
            "Decide if it would be helpful to execute one of the functions to answer \
             the user question. Only consider the question between \
             \"<user-question></user-question>\". Decide now: <functions>\n{tools}</functions> \
             <user-question>{}</user-question> Answer HELPFUL or NOT HELPFUL, nothing else. \
             If in doubt, choose NOT HELPFUL.",
            user_msg.content.flatten(),
        )),
        name: None,
        tool_call_id: None,
        tool_calls: None,
    });

    let Ok(prompt) = ctx.template.render(&probe_messages) else {
        return false;
    };

    let req = LlamaRequest {
        prompt,
        temperature: Some(0.01),
        n_predict: 1,
        stream: false,
        stop: Some(ctx.stop.to_vec()),
        cache_prompt: true,
        logit_bias: vec![(382, -0.3)],
        ..Default::default()
    };

    match run_single_completion(ctx.connector, ctx.endpoint_url, ctx.slot_index, req).await {
        Ok(resp) => resp.content.trim() == "H",
        Err(_) => false,
    }
}

/// Runs the emission probe and returns the raw `CALL: ...` text, or `None` on
/// any of its three failure modes (no last user message, template render
/// error, backend I/O error). Like `check_if_tool_helpful`, failures here are
/// logged and treated as "no tool call" rather than propagated — the original
/// `NewLlamacppChatHandler` only logs `handleTools`'s error and unconditionally
/// falls through to a normal completion (see DESIGN.md).
async fn generate_tool_call(
    ctx: &ToolContext<'_>,
    messages: &[Message],
    tools: &str,
) -> Option<String> {
    let Some(user_msg) = last_user_message(messages) else {
        tracing::warn!("tool emission probe skipped: no user message found");
        return None;
    };

    let mut probe_messages = messages.to_vec();
    probe_messages.push(Message {
        role: "user".to_string(),
        content: super::types::Content::Text(format!(
            "Use one of the following functions to answer the user question. \
             <functions>\n{tools}</functions> <user-question>{}</user-question> \
             Generate the function call. example: CALL: height(building=\"Empire State Building\")",
            user_msg.content.flatten(),
        )),
        name: None,
        tool_call_id: None,
        tool_calls: None,
    });

    let prompt = match ctx.template.render(&probe_messages) {
        Ok(prompt) => prompt,
        Err(err) => {
            tracing::warn!(error = %err, "tool emission probe template render failed");
            return None;
        }
    };

    let req = LlamaRequest {
        prompt,
        temperature: Some(0.01),
        n_predict: 90,
        stream: false,
        stop: Some(ctx.stop.to_vec()),
        cache_prompt: true,
        ..Default::default()
    };

    let resp = match run_single_completion(ctx.connector, ctx.endpoint_url, ctx.slot_index, req).await {
        Ok(resp) => resp,
        Err(err) => {
            tracing::warn!(error = %err, "tool emission probe backend call failed");
            return None;
        }
    };
    let content = resp.content.trim().strip_prefix("CALL: ").unwrap_or(resp.content.trim());
    Some(content.replace("\\_", "_"))
}

/// Parses `name(arg1="x", arg2=2)` into `(name, {arg: raw_value})`. Values
/// keep their surrounding quotes stripped but are otherwise untyped strings;
/// typing happens against the tool's declared schema at emission time.
fn parse_function(input: &str) -> Option<(String, Vec<(String, String)>)> {
    let caps = FUNCTION_CALL_RE.captures(input)?;
    let name = caps.get(1)?.as_str().to_string();
    let arg_list = caps.get(2)?.as_str();

    let mut args = Vec::new();
    for piece in ARG_SPLIT_RE.find_iter(arg_list) {
        let (key, value) = piece.as_str().split_once('=')?;
        let key = key.trim().to_string();
        let mut value = value.trim().to_string();
        if value.starts_with('"') && value.ends_with('"') && value.len() >= 2 {
            value = value[1..value.len() - 1].to_string();
        }
        args.push((key, value));
    }
    Some((name, args))
}

fn create_tool_chatcompletion_message(
    tool: &Tool,
    arguments: &[(String, String)],
) -> (ChatCompletionMessage, String) {
    let mut parts = Vec::new();
    for (key, value) in arguments {
        if let Some(prop) = tool.function.parameters.properties.get(key) {
            let key_json = serde_json::to_string(key).unwrap_or_else(|_| format!("\"{key}\""));
            if prop.property_type == "string" {
                let value_json =
                    serde_json::to_string(value).unwrap_or_else(|_| format!("\"{value}\""));
                parts.push(format!("{key_json}:{value_json}"));
            } else {
                parts.push(format!("{key_json}:{value}"));
            }
        }
    }
    let tool_call_id = nanosecond_hex_id();
    let message = ChatCompletionMessage {
        role: "assistant".to_string(),
        content: None,
        tool_calls: vec![ToolCall {
            id: tool_call_id.clone(),
            call_type: "function".to_string(),
            function: super::types::ChatCompletionFunction {
                name: tool.function.name.clone(),
                arguments: format!("{{{}}}", parts.join(",")),
            },
        }],
    };
    (message, tool_call_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_call_with_mixed_argument_types() {
        let (name, args) = parse_function(r#"height(building="Empire State Building", floors=102)"#).unwrap();
        assert_eq!(name, "height");
        assert_eq!(
            args,
            vec![
                ("building".to_string(), "Empire State Building".to_string()),
                ("floors".to_string(), "102".to_string()),
            ]
        );
    }

    #[test]
    fn malformed_call_fails_to_parse() {
        assert!(parse_function("not a call").is_none());
    }

    #[test]
    fn tool_to_prompt_renders_signature_and_description() {
        let tool: Tool = serde_json::from_str(
            r#"{"type":"function","function":{"name":"height","description":"get height",
                "parameters":{"type":"object","required":["building"],
                "properties":{"building":{"type":"string","description":"name"}}}}}"#,
        )
        .unwrap();
        let rendered = tool_to_prompt(&tool);
        assert!(rendered.starts_with("height(building: str) # get height"));
    }

    #[test]
    fn emits_string_args_json_stringified_and_others_raw() {
        let tool: Tool = serde_json::from_str(
            r#"{"type":"function","function":{"name":"height","description":"get height",
                "parameters":{"type":"object","required":["building","floors"],
                "properties":{"building":{"type":"string","description":"name"},
                "floors":{"type":"integer","description":"count"}}}}}"#,
        )
        .unwrap();
        let args = vec![
            ("building".to_string(), "Empire State Building".to_string()),
            ("floors".to_string(), "102".to_string()),
        ];
        let (message, tool_call_id) = create_tool_chatcompletion_message(&tool, &args);
        assert_eq!(message.tool_calls.len(), 1);
        let call = &message.tool_calls[0];
        assert_eq!(call.id, tool_call_id);
        assert_eq!(call.call_type, "function");
        assert_eq!(call.function.name, "height");
        assert_eq!(
            call.function.arguments,
            r#"{"building":"Empire State Building","floors":102}"#
        );
    }
}
