use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::cli::Args;

/// Shared context for the agent's WebSocket connection to the hub.
pub(crate) struct SignalingCtx<'a> {
    pub args: &'a Args,
    pub streaming: Arc<AtomicBool>,
    pub outbox_tx: mpsc::Sender<Message>,
}

/// Run the agent's connection to the hub with reconnect-on-failure.
///
/// `outbox_rx` receives outgoing frames (pings, demo screen frames, consent
/// replies) from the other tasks spawned in `main`.
pub(crate) async fn run(ctx: &SignalingCtx<'_>, outbox_rx: &mut mpsc::Receiver<Message>) {
    let mut backoff = Duration::from_secs(2);
    let max_backoff = Duration::from_secs(30);
    loop {
        info!(url = %connect_url(ctx.args), "connecting to hub");

        match connect_and_handle(ctx, outbox_rx).await {
            Ok(()) => {
                info!("hub connection closed cleanly");
                break;
            }
            Err(e) => {
                warn!("hub connection error: {e:#}");
                info!("reconnecting in {}s", backoff.as_secs());
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(max_backoff);
            }
        }
    }
}

fn connect_url(args: &Args) -> String {
    let mut url = format!(
        "{}/?role=agent&deviceId={}&v={}",
        args.server_url.trim_end_matches('/'),
        args.device_id,
        args.agent_version
    );
    if let Some(tenant) = &args.tenant {
        url.push_str(&format!("&tenant={tenant}"));
    }
    if let Some(token) = &args.token {
        url.push_str(&format!("&token={token}"));
    }
    url
}

async fn connect_and_handle(
    ctx: &SignalingCtx<'_>,
    outbox_rx: &mut mpsc::Receiver<Message>,
) -> anyhow::Result<()> {
    use futures_util::{SinkExt, StreamExt};

    let url = connect_url(ctx.args);
    let (ws_stream, _) = tokio_tungstenite::connect_async(&url)
        .await
        .context("websocket connect failed")?;
    info!("connected to hub");
    ctx.streaming.store(false, Ordering::Relaxed);

    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    loop {
        tokio::select! {
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => handle_server_text(ctx, &text),
                    Some(Ok(Message::Close(frame))) => {
                        info!(?frame, "hub closed the connection");
                        return Ok(());
                    }
                    Some(Ok(_)) => {} // hub never sends binary/ping frames to agents
                    Some(Err(e)) => return Err(e).context("websocket read error"),
                    None => return Ok(()),
                }
            }
            outgoing = outbox_rx.recv() => {
                match outgoing {
                    Some(msg) => {
                        if let Err(e) = ws_tx.send(msg).await {
                            return Err(e).context("websocket write error");
                        }
                    }
                    None => return Ok(()), // all senders dropped, shutting down
                }
            }
        }
    }
}

/// Dispatch a JSON control message from the hub. The hub only ever sends a
/// handful of verbs to an agent, so this matches on the raw `type` field
/// rather than pulling in a dedicated inbound enum for a one-shot demo client.
fn handle_server_text(ctx: &SignalingCtx<'_>, text: &str) {
    let value: serde_json::Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            warn!("malformed message from hub, ignoring: {e}");
            return;
        }
    };

    match value.get("type").and_then(|t| t.as_str()) {
        Some("pong") => debug!("received pong"),
        Some("consent_request") => {
            let admin = value.get("admin").and_then(|a| a.as_str()).unwrap_or("?");
            info!(admin, "consent requested, auto-accepting (demo agent)");
            let reply = Message::Text(r#"{"type":"consent_response","accepted":true}"#.to_string().into());
            if ctx.outbox_tx.try_send(reply).is_err() {
                warn!("outbox full, dropped consent_response");
            }
        }
        Some("stream-enable" | "stream_enable") => {
            ctx.streaming.store(true, Ordering::Relaxed);
            info!("streaming enabled by hub");
        }
        Some("stream-disable" | "stream_disable") => {
            ctx.streaming.store(false, Ordering::Relaxed);
            info!("streaming disabled by hub");
        }
        other => debug!(?other, "unhandled message type from hub"),
    }
}
