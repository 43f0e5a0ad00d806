//! HTTP server assembly
//!
//! Declarative route registration for every inbound dialect surface plus
//! the per-key reporting endpoints. All handlers receive the root service
//! context through axum state.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;

use crate::{config, forward, AppState};

pub fn app(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::permissive();
    Router::new()
        // Health check
        .route("/health", get(forward::api_health))
        // ============================================
        // Anthropic messages dialect
        // ============================================
        .route("/v1/messages", post(forward::anthropic_messages))
        .route("/messages", post(forward::anthropic_messages))
        // ============================================
        // OpenAI chat completions (native or Gemini bridge)
        // ============================================
        .route("/v1/chat/completions", post(forward::chat_completions))
        // ============================================
        // Codex responses dialect
        // ============================================
        .route("/responses", post(forward::codex_responses))
        .route("/v1/responses", post(forward::codex_responses))
        .route("/responses/compact", post(forward::codex_responses_compact))
        .route(
            "/v1/responses/compact",
            post(forward::codex_responses_compact),
        )
        // ============================================
        // Gemini standard dialect
        // ============================================
        .route("/v1beta/models", get(forward::gemini_models))
        .route("/v1beta/models/:model_action", post(forward::gemini_generate))
        // ============================================
        // Models listing (OpenAI shape)
        // ============================================
        .route("/v1/models", get(forward::list_models))
        .route("/models", get(forward::list_models))
        // ============================================
        // Per-key reporting
        // ============================================
        .route("/usage", get(forward::usage_report))
        .route("/key-info", get(forward::key_info))
        // ============================================
        // Gemini v1internal dialect (single root segment `v1internal:<action>`)
        // ============================================
        .route("/:segment", post(forward::v1internal_entry))
        .layer(cors)
        .with_state(state)
}

pub async fn serve(state: Arc<AppState>) {
    let cfg = config::load();
    let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port)
        .parse()
        .expect("valid bind address");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("bind listener");
    crate::logger::info("server", &format!("Relay gateway listening on {}", addr));
    axum::serve(listener, app(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            crate::logger::info("server", "Shutdown signal received");
        })
        .await
        .expect("server run");
}
