mod cli;
mod signaling;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use lookout_protocol::RawFrame;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::info;
use tracing_subscriber::EnvFilter;

use signaling::SignalingCtx;

const OUTBOX_CAPACITY: usize = 32;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = cli::parse_args()?;
    info!(device_id = %args.device_id, server = %args.server_url, "starting lookout-agent");

    let (outbox_tx, mut outbox_rx) = mpsc::channel::<Message>(OUTBOX_CAPACITY);
    let streaming = Arc::new(AtomicBool::new(false));

    tokio::spawn(run_heartbeat(outbox_tx.clone(), args.ping_interval_secs));
    tokio::spawn(run_frame_generator(
        outbox_tx.clone(),
        Arc::clone(&streaming),
        args.frame_interval_secs,
    ));

    let ctx = SignalingCtx {
        args: &args,
        streaming,
        outbox_tx,
    };
    signaling::run(&ctx, &mut outbox_rx).await;

    Ok(())
}

/// Sends a `{"type":"ping"}` heartbeat on a fixed interval. The hub replies
/// with `pong` and bumps the device's last-seen timestamp on receipt.
async fn run_heartbeat(outbox_tx: mpsc::Sender<Message>, interval_secs: u64) {
    let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
    loop {
        ticker.tick().await;
        let ping = Message::Text(r#"{"type":"ping"}"#.to_string().into());
        if outbox_tx.send(ping).await.is_err() {
            return;
        }
    }
}

/// Emits a synthetic JPEG-shaped frame on a fixed interval while the hub has
/// streaming enabled for this device (i.e. at least one admin is viewing).
///
/// Alternates between the two wire forms the hub accepts (a raw binary
/// frame, and a JSON `frame{jpegBase64}` message) so both code paths get
/// exercised against a live hub.
async fn run_frame_generator(outbox_tx: mpsc::Sender<Message>, streaming: Arc<AtomicBool>, interval_secs: u64) {
    let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
    let mut sequence: u64 = 0;
    loop {
        ticker.tick().await;
        if !streaming.load(Ordering::Relaxed) {
            continue;
        }
        sequence += 1;
        let frame = synthetic_jpeg(sequence);
        let msg = if sequence % 2 == 0 {
            Message::Binary(frame.bytes.into())
        } else {
            Message::Text(encode_frame_json(&frame).into())
        };
        if outbox_tx.send(msg).await.is_err() {
            return;
        }
    }
}

/// Builds a [`RawFrame`] shaped like a minimal JPEG (SOI/EOI markers around a
/// counter payload) so downstream code exercising the frame path has
/// something JPEG-ish to store, without depending on an actual encoder.
fn synthetic_jpeg(sequence: u64) -> RawFrame {
    let mut bytes = vec![0xFF, 0xD8]; // SOI
    bytes.extend_from_slice(&sequence.to_be_bytes());
    bytes.extend_from_slice(b"lookout-demo-frame");
    bytes.extend_from_slice(&[0xFF, 0xD9]); // EOI
    RawFrame::jpeg(bytes)
}

fn encode_frame_json(frame: &RawFrame) -> String {
    use base64::Engine;
    let encoded = base64::engine::general_purpose::STANDARD.encode(&frame.bytes);
    serde_json::json!({"type": "frame", "jpegBase64": encoded}).to_string()
}
