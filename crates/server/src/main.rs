mod auth;
mod config;
mod consent;
mod error;
mod frames;
mod presence;
mod sessions;
mod store;
mod web;

use std::net::SocketAddr;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing::Level;
use tracing_subscriber::EnvFilter;

use crate::frames::{FrameRouter, ViewerGate};
use crate::sessions::SessionRegistry;
use crate::store::Store;
use crate::web::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut hub_config = config::load_config_from_env();

    if hub_config.jwt_secret.is_empty() {
        hub_config.jwt_secret = auth::generate_secret().context("failed to generate JWT secret")?;
        tracing::warn!("JWT_SECRET not set; generated an ephemeral secret for this process only");
    }

    if let Err(issues) = hub_config.validate() {
        let has_errors = issues.iter().any(|i| i.starts_with("ERROR:"));
        for issue in &issues {
            if issue.starts_with("ERROR:") {
                tracing::error!("{issue}");
            } else {
                tracing::warn!("{issue}");
            }
        }
        if has_errors {
            tracing::error!("Configuration has {} issue(s). Fix the ERROR(s) above and restart.", issues.len());
            std::process::exit(1);
        }
    }

    if !std::path::Path::new(&hub_config.web_root).is_dir() {
        tracing::warn!(
            "web root '{}' does not exist — the admin console will not load until it is built",
            hub_config.web_root
        );
    }

    let bind_addr: SocketAddr = format!("{}:{}", hub_config.bind, hub_config.port)
        .parse()
        .context("invalid bind address")?;

    let store = Arc::new(
        Store::load(&hub_config.data_dir, hub_config.log_capacity)
            .await
            .context("failed to load store from data_dir")?,
    );
    let sessions = Arc::new(SessionRegistry::new());
    let frames = Arc::new(FrameRouter::new(hub_config.min_frame_interval_ms));
    let viewers = Arc::new(ViewerGate::new());

    let state = Arc::new(AppState {
        config: hub_config,
        store: Arc::clone(&store),
        sessions: Arc::clone(&sessions),
        frames: Arc::clone(&frames),
        viewers,
        login_limiter: web::LoginRateLimiter::new(5, 60),
        started_at: std::time::Instant::now(),
        metrics_logins_attempted: AtomicU64::new(0),
        metrics_logins_failed: AtomicU64::new(0),
        metrics_frames_accepted: AtomicU64::new(0),
        metrics_frames_dropped: AtomicU64::new(0),
    });

    tokio::spawn(presence::run(
        Arc::clone(&store),
        Arc::clone(&sessions),
        state.config.presence_ttl_secs,
        state.config.presence_sweep_secs,
    ));

    let app = web::build_router(Arc::clone(&state))
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &axum::http::Request<_>| {
                    let request_id = request
                        .headers()
                        .get("x-request-id")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("-");
                    tracing::info_span!(
                        "request",
                        method = %request.method(),
                        path = %request.uri().path(),
                        request_id = %request_id,
                    )
                })
                .on_request(|_request: &axum::http::Request<_>, _span: &tracing::Span| {
                    tracing::event!(Level::INFO, "started");
                })
                .on_response(
                    |response: &axum::http::Response<_>, latency: std::time::Duration, _span: &tracing::Span| {
                        tracing::event!(
                            Level::INFO,
                            status = %response.status().as_u16(),
                            duration_ms = %latency.as_millis(),
                            "completed"
                        );
                    },
                ),
        )
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid));

    tracing::info!("===========================================");
    tracing::info!("  Lookout fleet hub v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("  Listening on http://{bind_addr}");
    tracing::info!("===========================================");

    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind to {bind_addr}"))?;

    tracing::info!("server ready, accepting connections");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    tracing::info!(
        agent_sessions = sessions.agent_count().await,
        "Lookout hub shut down cleanly"
    );

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received SIGINT, shutting down"),
        _ = terminate => tracing::info!("received SIGTERM, shutting down"),
    }
}
