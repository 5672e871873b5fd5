//! Confab Chat Server
//!
//! A WebSocket group-chat server with WebRTC call signaling:
//!
//! 1. **Group chat**: messages, emotes, reactions, private messages, and file
//!    posts, fanned out to every connected browser. Public traffic persists to
//!    SQLite and replays as history on connect.
//!
//! 2. **Call rooms**: individual and group calls are coordinated through
//!    server-side rooms; media never touches the server. SDP offers/answers
//!    and ICE candidates are relayed verbatim between room members.
//!
//! Identity is connection-scoped: each WebSocket gets a placeholder user that
//! can be renamed, and a session id that addresses it in call signaling.

mod handler;
mod protocol;
mod state;
mod store;

use std::time::Duration;

use axum::{
    extract::{State, WebSocketUpgrade},
    http::Method,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use clap::Parser;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use state::{now_ms, AppState, ServerConfig};
use store::Store;

// ── CLI Arguments ─────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "confab-server", version, about = "Confab group-chat server")]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value_t = 8080, env = "CONFAB_PORT")]
    port: u16,

    /// SQLite database path
    #[arg(long, default_value = "confab.db", env = "CONFAB_DB")]
    db: String,

    /// Number of messages replayed as history on connect
    #[arg(long, default_value_t = 50, env = "HISTORY_LIMIT")]
    history_limit: usize,

    /// Age in seconds after which an open session row with no live
    /// connection is swept
    #[arg(long, default_value_t = 3600, env = "SESSION_STALE_SECS")]
    session_stale_secs: i64,

    /// Call room TTL in hours
    #[arg(long, default_value_t = 4, env = "ROOM_TTL_HOURS")]
    room_ttl_hours: i64,

    /// Cleanup interval in seconds
    #[arg(long, default_value_t = 600, env = "CLEANUP_INTERVAL_SECS")]
    cleanup_interval_secs: u64,
}

// ── Entry Point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "confab_server=info,tower_http=info".into()),
        )
        .init();

    let args = Args::parse();

    let config = ServerConfig {
        port: args.port,
        db_path: args.db,
        history_limit: args.history_limit,
        session_stale_secs: args.session_stale_secs,
        room_ttl_secs: args.room_ttl_hours * 3600,
        cleanup_interval_secs: args.cleanup_interval_secs,
    };

    let store = Store::open(&config.db_path).expect("Failed to open database");
    tracing::info!(db_path = config.db_path.as_str(), "Database open");

    // Sessions left open by an unclean shutdown would pollute the roster
    match store.end_all_open_sessions(now_ms()) {
        Ok(0) => {}
        Ok(n) => tracing::info!(count = n, "Closed session rows from previous run"),
        Err(e) => tracing::warn!(error = %e, "Failed to sweep stale session rows"),
    }

    let state = AppState::new(config, store);

    // Spawn periodic cleanup task
    let cleanup_state = state.clone();
    let cleanup_interval = cleanup_state.config.cleanup_interval_secs;
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(cleanup_interval));
        loop {
            interval.tick().await;
            cleanup_state.cleanup_expired();
        }
    });

    // Build router
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any);

    let app = Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = format!("0.0.0.0:{}", args.port);
    tracing::info!("Confab chat server starting on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("Failed to bind address");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("Server error");
}

/// Resolve when the process is asked to stop.
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");

    tokio::select! {
        _ = sigint.recv() => tracing::info!("Received SIGINT - shutting down"),
        _ = sigterm.recv() => tracing::info!("Received SIGTERM - shutting down"),
    }
}

// ── Route Handlers ────────────────────────────────────────────────────────────

/// WebSocket upgrade handler for client connections.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handler::handle_websocket(socket, state))
}

/// Health check endpoint.
async fn health_handler() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "confab-server",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Statistics endpoint.
async fn stats_handler(State(state): State<AppState>) -> impl IntoResponse {
    let messages = state.store.message_count().unwrap_or(-1);
    Json(json!({
        "connections": state.session_count(),
        "online_users": state.online_user_count(),
        "active_rooms": state.room_count(),
        "messages_stored": messages,
    }))
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_json_structure() {
        let json_val = json!({
            "status": "ok",
            "service": "confab-server",
            "version": env!("CARGO_PKG_VERSION"),
        });
        assert_eq!(json_val["status"], "ok");
        assert_eq!(json_val["service"], "confab-server");
    }

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 8080);
        assert_eq!(config.db_path, "confab.db");
        assert_eq!(config.history_limit, 50);
        assert_eq!(config.session_stale_secs, 3600);
        assert_eq!(config.room_ttl_secs, 4 * 3600);
    }

    #[tokio::test]
    async fn test_state_creation() {
        let state = AppState::new(ServerConfig::default(), Store::open_memory().unwrap());
        assert_eq!(state.session_count(), 0);
        assert_eq!(state.room_count(), 0);
        assert_eq!(state.store.message_count().unwrap(), 0);
    }
}
