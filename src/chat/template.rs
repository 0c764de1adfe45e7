//! Chat prompt rendering: a configured Handlebars template flattens the
//! message list into the single prompt string the backend expects.
//!
//! Grounded in the original's `text/template`-based `prepareChatPrompt`;
//! `handlebars` plays the same pure `Messages -> String` collaborator role.

use handlebars::Handlebars;

use super::types::Message;
use crate::error::MiddlewareError;

const TEMPLATE_NAME: &str = "chat";

pub struct ChatTemplate {
    engine: Handlebars<'static>,
}

impl ChatTemplate {
    /// Compiles `source` once at startup. A bad template is a fatal
    /// configuration error, not a per-request one — callers surface this
    /// with `anyhow` before the server starts accepting connections.
    pub fn compile(source: &str) -> Result<Self, handlebars::TemplateError> {
        let mut engine = Handlebars::new();
        engine.set_strict_mode(false);
        engine.register_template_string(TEMPLATE_NAME, source)?;
        Ok(Self { engine })
    }

    pub fn render(&self, messages: &[Message]) -> Result<String, MiddlewareError> {
        self.engine
            .render(TEMPLATE_NAME, &messages)
            .map_err(MiddlewareError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_role_and_content_pairs() {
        let template = ChatTemplate::compile(
            "{{#each this}}{{this.role}}: {{this.content}}\n{{/each}}",
        )
        .unwrap();
        let messages: Vec<Message> =
            serde_json::from_str(r#"[{"role":"user","content":"hi"}]"#).unwrap();
        let rendered = template.render(&messages).unwrap();
        assert_eq!(rendered, "user: hi\n");
    }

    #[test]
    fn bad_template_syntax_fails_to_compile() {
        assert!(ChatTemplate::compile("{{#each this}}{{/if}}").is_err());
    }
}
