use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use lookout_protocol::{AgentOutbound, RawFrame};
use tokio::sync::RwLock;

use crate::sessions::SessionRegistry;
use crate::store::now_millis;

struct FrameSlot {
    bytes: Arc<Vec<u8>>,
    mime: &'static str,
    at: u64,
}

/// Holds the single latest frame per device and throttles how often a new one may
/// replace it. Frames are never buffered for replay — a viewer that attaches mid-stream
/// only ever sees whatever is current at its next tick.
pub struct FrameRouter {
    slots: RwLock<HashMap<String, FrameSlot>>,
    min_interval_ms: u64,
}

impl FrameRouter {
    pub fn new(min_interval_ms: u64) -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
            min_interval_ms,
        }
    }

    /// Accepts a frame for `device_id`. Returns `true` if it was stored, `false` if it
    /// was discarded by the throttle. Discarded frames never reach the byte buffer, so
    /// they cost nothing beyond the decode that already happened.
    pub async fn accept(&self, device_id: &str, frame: RawFrame) -> bool {
        let now = now_millis();
        let mut slots = self.slots.write().await;
        if let Some(existing) = slots.get(device_id) {
            if now.saturating_sub(existing.at) < self.min_interval_ms {
                return false;
            }
        }
        slots.insert(
            device_id.to_string(),
            FrameSlot {
                bytes: Arc::new(frame.bytes),
                mime: frame.mime,
                at: now,
            },
        );
        true
    }

    /// Current frame for `device_id`, if any has ever been accepted.
    pub async fn latest(&self, device_id: &str) -> Option<(Arc<Vec<u8>>, &'static str)> {
        self.slots
            .read()
            .await
            .get(device_id)
            .map(|s| (Arc::clone(&s.bytes), s.mime))
    }
}

/// Reference-counts open viewer attachments per device. Transitions between zero and
/// nonzero drive `stream-enable`/`stream-disable` to the agent; every other count change
/// is silent.
pub struct ViewerGate {
    counts: RwLock<HashMap<String, u32>>,
}

impl ViewerGate {
    pub fn new() -> Self {
        Self {
            counts: RwLock::new(HashMap::new()),
        }
    }

    /// Opens a viewer attachment for `device_id`, sending `stream-enable` to the agent
    /// (if active) on the 0->1 transition. Returns a guard that decrements the count
    /// and sends `stream-disable` on drop.
    pub async fn attach(self: &Arc<Self>, device_id: &str, registry: &Arc<SessionRegistry>) -> ViewerAttachment {
        let became_active = {
            let mut counts = self.counts.write().await;
            let count = counts.entry(device_id.to_string()).or_insert(0);
            *count += 1;
            *count == 1
        };
        if became_active {
            registry.send_to_agent(device_id, &AgentOutbound::StreamEnable).await;
        }
        ViewerAttachment {
            device_id: device_id.to_string(),
            gate: Arc::clone(self),
            registry: Arc::clone(registry),
            released: AtomicU32::new(0),
        }
    }

    async fn release(&self, device_id: &str) -> bool {
        let mut counts = self.counts.write().await;
        let Some(count) = counts.get_mut(device_id) else {
            return false;
        };
        *count = count.saturating_sub(1);
        if *count == 0 {
            counts.remove(device_id);
            true
        } else {
            false
        }
    }
}

impl Default for ViewerGate {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII handle for an open viewer attachment. Its `Drop` impl is synchronous, so the
/// actual gate release (and any resulting `stream-disable`) is spawned onto the runtime
/// rather than awaited in place.
pub struct ViewerAttachment {
    device_id: String,
    gate: Arc<ViewerGate>,
    registry: Arc<SessionRegistry>,
    released: AtomicU32,
}

impl Drop for ViewerAttachment {
    fn drop(&mut self) {
        if self.released.swap(1, Ordering::SeqCst) == 1 {
            return;
        }
        let device_id = self.device_id.clone();
        let gate = Arc::clone(&self.gate);
        let registry = Arc::clone(&self.registry);
        tokio::spawn(async move {
            if gate.release(&device_id).await {
                registry.send_to_agent(&device_id, &AgentOutbound::StreamDisable).await;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lookout_protocol::Tenant;

    #[tokio::test]
    async fn throttle_discards_frames_within_interval() {
        let router = FrameRouter::new(250);
        assert!(router.accept("dev-1", RawFrame::jpeg(vec![1])).await);
        assert!(!router.accept("dev-1", RawFrame::jpeg(vec![2])).await);
        let (bytes, _) = router.latest("dev-1").await.unwrap();
        assert_eq!(*bytes, vec![1]);
    }

    #[tokio::test]
    async fn unknown_device_has_no_frame() {
        let router = FrameRouter::new(250);
        assert!(router.latest("dev-missing").await.is_none());
    }

    #[tokio::test]
    async fn first_attach_enables_stream_on_active_agent() {
        let registry = Arc::new(SessionRegistry::new());
        let (mut agent_handle, _id) = registry.admit_agent("dev-1", Tenant::new("CLA1")).await;
        let gate = Arc::new(ViewerGate::new());

        let attachment = gate.attach("dev-1", &registry).await;
        let frame = agent_handle.rx.recv().await.unwrap();
        assert!(frame.contains("stream-enable") || frame.contains("stream_enable"));
        drop(attachment);
    }

    #[tokio::test]
    async fn second_attach_does_not_resend_enable() {
        let registry = Arc::new(SessionRegistry::new());
        let (mut agent_handle, _id) = registry.admit_agent("dev-1", Tenant::new("CLA1")).await;
        let gate = Arc::new(ViewerGate::new());

        let first = gate.attach("dev-1", &registry).await;
        let _ = agent_handle.rx.recv().await.unwrap();
        let _ = agent_handle.rx.recv().await.unwrap();
        let second = gate.attach("dev-1", &registry).await;

        assert!(agent_handle.rx.try_recv().is_err());
        drop(first);
        drop(second);
    }

    #[tokio::test]
    async fn last_detach_disables_stream() {
        let registry = Arc::new(SessionRegistry::new());
        let (mut agent_handle, _id) = registry.admit_agent("dev-1", Tenant::new("CLA1")).await;
        let gate = Arc::new(ViewerGate::new());

        let attachment = gate.attach("dev-1", &registry).await;
        let _ = agent_handle.rx.recv().await.unwrap();
        drop(attachment);

        let frame = agent_handle.rx.recv().await.unwrap();
        assert!(frame.contains("stream-disable") || frame.contains("stream_disable"));
    }
}
