//! Entry point: loads config, compiles the chat template, builds the slot
//! pool, and serves the OpenAI-compatible chat endpoint plus the raw
//! llama.cpp completion and passthrough routes.
//!
//! Grounded in the teacher's own service binaries
//! (`crates/service/src/main.rs`, `crates/querymt-service/src/main.rs`):
//! `clap::Parser` args, `tracing_subscriber` with an `EnvFilter`, a plain
//! `axum::Router` built with `tower_http::cors::CorsLayer`.

mod chat;
mod completion;
mod config;
mod connector;
mod error;
mod expiring_map;
mod ids;
mod llama;
mod passthrough;
mod queue;
mod session;
mod streaming;
mod usage;

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use clap::Parser;
use tower_http::cors::CorsLayer;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use chat::template::ChatTemplate;
use config::{Args, AppConfig, UsageBackend};
use connector::BackendConnector;
use expiring_map::ExpiringMap;
use passthrough::PassthroughConfig;
use queue::SlotQueue;
use session::{BearerTokenSessionProvider, SessionProvider, TokenLimiter};
use usage::{DefaultUsageUpdater, LlamaCppUsageUpdater, OllamaUsageUpdater, UsageUpdater};

pub struct AppState {
    pub queue: Arc<SlotQueue>,
    pub connector: Arc<BackendConnector>,
    pub template: ChatTemplate,
    pub stop: Vec<String>,
    pub default_logit_bias: Vec<(i64, f64)>,
    pub tool_calls: Arc<ExpiringMap>,
    pub session_provider: Arc<dyn SessionProvider>,
    pub token_limiter: TokenLimiter,
    pub usage_updater: Arc<dyn UsageUpdater>,
    pub passthrough: Option<PassthroughConfig>,
    pub line_by_line: bool,
}

async fn healthz() -> &'static str {
    "OK"
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("llama_slot_gateway=info,tower_http=info"));
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    let args = Args::parse();
    let config = AppConfig::load(&args.config)
        .context("loading config")?
        .apply_overrides(&args);

    // Template parse failure is a fatal startup error (§7.6) — refuse to
    // start rather than fail every request at runtime.
    let template = ChatTemplate::compile(&config.chat_template).context("compiling chat_template")?;

    let queue = Arc::new(SlotQueue::new(&config.endpoint_configs()));
    let connector = Arc::new(BackendConnector::new());
    let tool_calls = ExpiringMap::new();

    let session_provider: Arc<dyn SessionProvider> = Arc::new(BearerTokenSessionProvider {
        auth_key: config.auth_key.clone(),
        default_token_concurrency_limit: config.session.default_token_concurrency_limit,
    });

    let usage_updater: Arc<dyn UsageUpdater> = match config.usage.backend {
        UsageBackend::LlamaCpp => Arc::new(LlamaCppUsageUpdater),
        UsageBackend::Ollama => Arc::new(OllamaUsageUpdater),
        UsageBackend::Default => Arc::new(DefaultUsageUpdater),
    };

    let state = Arc::new(AppState {
        queue,
        connector,
        template,
        stop: config.stop.clone(),
        default_logit_bias: config.logit_bias.clone(),
        tool_calls,
        session_provider,
        token_limiter: TokenLimiter::new(),
        usage_updater,
        passthrough: config.passthrough_config(),
        line_by_line: config.line_by_line,
    });

    info_startup(&config);

    let api_routes = Router::new()
        .route("/v1/chat/completions", post(chat::pipeline::chat_completions))
        .route("/completion", post(completion::completion))
        .route("/passthrough", post(passthrough::passthrough))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            session::token_limiter_middleware,
        ))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            session::session_middleware,
        ))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            usage::usage_middleware,
        ));

    let app = Router::new()
        .route("/healthz", get(healthz))
        .merge(api_routes)
        .layer(CorsLayer::permissive())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&config.addr)
        .await
        .with_context(|| format!("binding {}", config.addr))?;
    tracing::info!(addr = %config.addr, "listening");
    axum::serve(listener, app).await?;

    Ok(())
}

fn info_startup(config: &AppConfig) {
    tracing::info!(
        addr = %config.addr,
        endpoints = config.endpoints.len(),
        line_by_line = config.line_by_line,
        auth = %config.auth_key.as_ref().map(|_| "enabled").unwrap_or("disabled"),
        passthrough = %config.passthrough.url.as_ref().map(|_| "enabled").unwrap_or("disabled"),
        "starting llama-slot-gateway"
    );
}
