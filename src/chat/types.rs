//! OpenAI-compatible chat wire types.
//!
//! `Content` mirrors the original's custom `UnmarshalJSON`: a message body is
//! either a plain string or an array of `{type, text}` blocks, and both forms
//! flatten to the same prompt text.

use serde::de::{self, Deserializer, SeqAccess, Visitor};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Default)]
pub enum Content {
    #[default]
    Empty,
    Text(String),
    Blocks(Vec<ContentBlock>),
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContentBlock {
    #[serde(rename = "type")]
    pub block_type: String,
    #[serde(default)]
    pub text: String,
}

impl Content {
    /// Joins every `type == "text"` block with newlines; a plain string is
    /// returned unchanged. Non-text blocks are dropped.
    pub fn flatten(&self) -> String {
        match self {
            Content::Empty => String::new(),
            Content::Text(s) => s.clone(),
            Content::Blocks(blocks) => blocks
                .iter()
                .filter(|b| b.block_type == "text")
                .map(|b| b.text.as_str())
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

impl<'de> Deserialize<'de> for Content {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct ContentVisitor;

        impl<'de> Visitor<'de> for ContentVisitor {
            type Value = Content;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a string or an array of content blocks")
            }

            fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                Ok(Content::Text(v.to_string()))
            }

            fn visit_string<E>(self, v: String) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                Ok(Content::Text(v))
            }

            fn visit_unit<E>(self) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                Ok(Content::Empty)
            }

            fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
            where
                A: SeqAccess<'de>,
            {
                let mut blocks = Vec::new();
                while let Some(block) = seq.next_element::<ContentBlock>()? {
                    blocks.push(block);
                }
                Ok(Content::Blocks(blocks))
            }
        }

        deserializer.deserialize_any(ContentVisitor)
    }
}

impl Serialize for Content {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.flatten())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Message {
    pub role: String,
    #[serde(default)]
    pub content: Content,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub tool_call_id: Option<String>,
    #[serde(default)]
    pub tool_calls: Option<Vec<ToolCall>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Tool {
    #[serde(rename = "type")]
    pub tool_type: String,
    pub function: Function,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Function {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub parameters: Parameters,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Parameters {
    #[serde(rename = "type", default)]
    pub param_type: String,
    #[serde(default)]
    pub required: Vec<String>,
    #[serde(default)]
    pub properties: std::collections::BTreeMap<String, Property>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Property {
    #[serde(rename = "type", default)]
    pub property_type: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub enum_values: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatRequest {
    pub messages: Vec<Message>,
    #[serde(default)]
    pub tools: Vec<Tool>,
    #[serde(default)]
    pub tool_choice: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub max_tokens: i64,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub top_p: Option<f32>,
    /// The optional per-session sub-slot identifier (the original's
    /// `req.Slot`, reused on the llama.cpp request as the `id_slot` affinity
    /// key before the scheduler overwrites it).
    #[serde(default)]
    pub slot: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatCompletionMessage {
    pub role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub call_type: String,
    pub function: ChatCompletionFunction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionFunction {
    pub name: String,
    pub arguments: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct StreamChatResponse {
    pub id: String,
    pub object: &'static str,
    pub created: i64,
    pub model: String,
    pub choices: Vec<StreamChatResponseChoice>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StreamChatResponseChoice {
    pub index: u32,
    pub delta: ChatCompletionMessage,
    pub logprobs: Option<()>,
    pub finish_reason: Option<&'static str>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatResponse {
    pub id: String,
    pub object: &'static str,
    pub created: i64,
    pub model: String,
    pub choices: Vec<ChatResponseChoice>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatResponseChoice {
    pub index: u32,
    pub message: ChatCompletionMessage,
    pub logprobs: Option<()>,
    pub finish_reason: Option<&'static str>,
}

/// Builds the OpenAI frame (streaming chunk or non-streaming completion) for
/// one backend line, matching `createChatCompletionResponse`.
pub fn build_completion_frame(
    stream: bool,
    request_id: &str,
    model: &str,
    message: ChatCompletionMessage,
    finish_reason: Option<&'static str>,
) -> serde_json::Value {
    let created = crate::ids::now_unix_seconds() as i64;
    if stream {
        serde_json::to_value(StreamChatResponse {
            id: request_id.to_string(),
            object: "chat.completion.chunk",
            created,
            model: model.to_string(),
            choices: vec![StreamChatResponseChoice {
                index: 0,
                delta: message,
                logprobs: None,
                finish_reason,
            }],
        })
        .expect("completion frame always serializes")
    } else {
        serde_json::to_value(ChatResponse {
            id: request_id.to_string(),
            object: "chat.completion",
            created,
            model: model.to_string(),
            choices: vec![ChatResponseChoice {
                index: 0,
                message,
                logprobs: None,
                finish_reason,
            }],
        })
        .expect("completion frame always serializes")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_string_content_flattens_unchanged() {
        let msg: Message = serde_json::from_str(r#"{"role":"user","content":"hi"}"#).unwrap();
        assert_eq!(msg.content.flatten(), "hi");
    }

    #[test]
    fn block_array_content_joins_text_blocks_with_newlines() {
        let msg: Message = serde_json::from_str(
            r#"{"role":"user","content":[{"type":"text","text":"hi"},{"type":"image","text":"ignored"},{"type":"text","text":"there"}]}"#,
        )
        .unwrap();
        assert_eq!(msg.content.flatten(), "hi\nthere");
    }

    #[test]
    fn string_and_single_text_block_are_byte_identical() {
        let a: Message = serde_json::from_str(r#"{"role":"user","content":"hi"}"#).unwrap();
        let b: Message =
            serde_json::from_str(r#"{"role":"user","content":[{"type":"text","text":"hi"}]}"#)
                .unwrap();
        assert_eq!(a.content.flatten(), b.content.flatten());
    }
}
