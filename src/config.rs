//! Config loader (C8, SPEC_FULL §4.8): parses the TOML config surface of
//! SPEC_FULL §6 and merges it with CLI overrides via `clap`.
//!
//! Grounded in the teacher's own `Args`/config-struct pattern
//! (`crates/service/src/main.rs`, `crates/agent/src/config.rs`); template
//! compile failure at load time is a fatal startup error per §7.6, matching
//! the original's `panic(err)` in `NewLlamacppChatHandler`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;

use crate::passthrough::PassthroughConfig;
use crate::queue::EndpointConfig;

#[derive(Parser, Debug)]
#[command(author, version, about = "Slot-affinity streaming middleware for llama.cpp backends")]
pub struct Args {
    /// Path to the TOML config file.
    #[arg(long, default_value = "config.toml")]
    pub config: PathBuf,
    /// Overrides `addr` from the config file.
    #[arg(long)]
    pub addr: Option<String>,
    /// Overrides `auth_key` from the config file.
    #[arg(long)]
    pub auth_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EndpointSection {
    pub url: String,
    pub parallel: usize,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PassthroughSection {
    pub url: Option<String>,
    pub auth_token: Option<String>,
    pub max_tokens: Option<i64>,
    pub model_override: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionSection {
    #[serde(default = "default_token_concurrency_limit")]
    pub default_token_concurrency_limit: usize,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            default_token_concurrency_limit: default_token_concurrency_limit(),
        }
    }
}

fn default_token_concurrency_limit() -> usize {
    4
}

#[derive(Debug, Clone, Copy, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UsageBackend {
    #[default]
    Default,
    LlamaCpp,
    Ollama,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UsageSection {
    #[serde(default)]
    pub backend: UsageBackend,
}

fn default_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_logit_bias() -> Vec<(i64, f64)> {
    vec![(523, -10.0), (28789, -10.0), (6647, -10.0)]
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_addr")]
    pub addr: String,
    #[serde(default)]
    pub line_by_line: bool,
    #[serde(default)]
    pub auth_key: Option<String>,
    pub chat_template: String,
    #[serde(default)]
    pub stop: Vec<String>,
    #[serde(default = "default_logit_bias")]
    pub logit_bias: Vec<(i64, f64)>,
    #[serde(default)]
    pub endpoints: Vec<EndpointSection>,
    #[serde(default)]
    pub passthrough: PassthroughSection,
    #[serde(default)]
    pub session: SessionSection,
    #[serde(default)]
    pub usage: UsageSection,
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config: AppConfig =
            toml::from_str(&raw).with_context(|| format!("parsing config file {}", path.display()))?;
        Ok(config)
    }

    pub fn apply_overrides(mut self, args: &Args) -> Self {
        if let Some(addr) = &args.addr {
            self.addr = addr.clone();
        }
        if let Some(auth_key) = &args.auth_key {
            self.auth_key = Some(auth_key.clone());
        }
        self
    }

    pub fn endpoint_configs(&self) -> Vec<EndpointConfig> {
        self.endpoints
            .iter()
            .map(|e| EndpointConfig {
                url: e.url.clone(),
                parallel: e.parallel,
            })
            .collect()
    }

    pub fn passthrough_config(&self) -> Option<PassthroughConfig> {
        let url = self.passthrough.url.clone()?;
        Some(PassthroughConfig {
            url,
            auth_token: self.passthrough.auth_token.clone(),
            max_tokens: self.passthrough.max_tokens,
            model_override: self.passthrough.model_override.clone(),
            line_by_line: self.line_by_line,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_parses_with_defaults() {
        let toml = r#"
            chat_template = "{{#each this}}{{this.role}}: {{this.content}}\n{{/each}}"

            [[endpoints]]
            url = "http://127.0.0.1:8081/completion"
            parallel = 2
        "#;
        let config: AppConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.addr, "0.0.0.0:8080");
        assert_eq!(config.session.default_token_concurrency_limit, 4);
        assert_eq!(config.logit_bias, vec![(523, -10.0), (28789, -10.0), (6647, -10.0)]);
        assert_eq!(config.endpoints.len(), 1);
        assert!(config.passthrough_config().is_none());
    }

    #[test]
    fn passthrough_section_populates_optional_config() {
        let toml = r#"
            chat_template = "x"

            [passthrough]
            url = "http://127.0.0.1:9000/v1/chat/completions"
            auth_token = "sk-test"
            max_tokens = 500
            model_override = "/tmp/models/zephyr/"
        "#;
        let config: AppConfig = toml::from_str(toml).unwrap();
        let passthrough = config.passthrough_config().unwrap();
        assert_eq!(passthrough.max_tokens, Some(500));
        assert_eq!(passthrough.auth_token.as_deref(), Some("sk-test"));
    }
}
