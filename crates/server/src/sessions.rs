use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use lookout_protocol::{can_access_tenant, AdminOutbound, AgentOutbound, AllowedTenants, Tenant};
use tokio::sync::{mpsc, Notify, RwLock};
use uuid::Uuid;

/// Outbound mailbox capacity per session. Bounded so a session that stops draining its
/// mailbox (a stalled client, a dead TCP peer the kernel hasn't noticed yet) gets closed
/// rather than accumulating unbounded backlog.
const MAILBOX_CAPACITY: usize = 64;

struct AgentEntry {
    identity: u64,
    tenant: Tenant,
    tx: mpsc::Sender<String>,
    kill: Arc<Notify>,
}

struct AdminEntry {
    allowed_tenants: AllowedTenants,
    tx: mpsc::Sender<String>,
    kill: Arc<Notify>,
}

/// Handed to a freshly admitted session's receive loop. `rx` is the mailbox the loop
/// drains and writes to the socket — the one and only writer for that socket. `kill`
/// fires when the registry wants this session torn down (supplanted, or a send that
/// could not be delivered within the mailbox's bounded capacity).
pub struct SessionHandle {
    pub rx: mpsc::Receiver<String>,
    pub kill: Arc<Notify>,
}

/// Tracks live admin sessions and live agent sessions keyed by device id. Enforces
/// one-agent-per-device: a new agent connection supplants and force-closes the prior
/// one before taking its place in the map.
pub struct SessionRegistry {
    agents: RwLock<HashMap<String, AgentEntry>>,
    admins: RwLock<HashMap<Uuid, AdminEntry>>,
    next_identity: AtomicU64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            agents: RwLock::new(HashMap::new()),
            admins: RwLock::new(HashMap::new()),
            next_identity: AtomicU64::new(1),
        }
    }

    /// Admits an agent session for `device_id`. If one already exists it is force-closed
    /// (SUPPLANTED -> CLOSED) before the new one is inserted. Returns the new session's
    /// mailbox plus an opaque identity used by [`Self::remove_agent`] to avoid a stale
    /// session removing a newer one that has since supplanted it.
    pub async fn admit_agent(&self, device_id: &str, tenant: Tenant) -> (SessionHandle, u64) {
        let identity = self.next_identity.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
        let kill = Arc::new(Notify::new());
        let entry = AgentEntry {
            identity,
            tenant,
            tx,
            kill: Arc::clone(&kill),
        };

        let mut agents = self.agents.write().await;
        if let Some(old) = agents.remove(device_id) {
            tracing::info!(device_id, "Agent session supplanted by new connection");
            old.kill.notify_one();
        }
        agents.insert(device_id.to_string(), entry);
        (SessionHandle { rx, kill }, identity)
    }

    /// Removes the agent session for `device_id`, but only if `identity` still matches
    /// the one currently registered — a session that lost a supplant race must not
    /// clobber the session that replaced it. Returns whether this identity was in fact
    /// the current session (and so was actually removed); callers use this to decide
    /// whether the device's `connected` flag should flip to `false`, since a stale,
    /// supplanted session must never do that to the session that replaced it.
    pub async fn remove_agent(&self, device_id: &str, identity: u64) -> bool {
        let mut agents = self.agents.write().await;
        if agents.get(device_id).is_some_and(|e| e.identity == identity) {
            agents.remove(device_id);
            true
        } else {
            false
        }
    }

    /// Whether `identity` is still the current agent session for `device_id`, without
    /// removing it. Used to decide whether a closing session is entitled to broadcast
    /// a presence-offline notice before it actually removes itself from the registry.
    pub async fn is_current_agent(&self, device_id: &str, identity: u64) -> bool {
        self.agents
            .read()
            .await
            .get(device_id)
            .is_some_and(|e| e.identity == identity)
    }

    pub async fn is_agent_active(&self, device_id: &str) -> bool {
        self.agents.read().await.contains_key(device_id)
    }

    /// Writes every wire frame of `msg` into the agent's mailbox. If any frame cannot
    /// be enqueued (mailbox full, or the session is already gone), the session is
    /// killed rather than left to grow its backlog unbounded.
    pub async fn send_to_agent(&self, device_id: &str, msg: &AgentOutbound) {
        let agents = self.agents.read().await;
        let Some(entry) = agents.get(device_id) else {
            return;
        };
        let mut failed = false;
        for frame in msg.to_wire_frames() {
            if entry.tx.try_send(frame).is_err() {
                failed = true;
            }
        }
        if failed {
            tracing::warn!(device_id, "Agent mailbox overflowed, closing session");
            entry.kill.notify_one();
        }
    }

    pub async fn admit_admin(&self, username: String, allowed_tenants: AllowedTenants) -> (Uuid, SessionHandle) {
        let session_id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
        let kill = Arc::new(Notify::new());
        let entry = AdminEntry {
            allowed_tenants,
            tx,
            kill: Arc::clone(&kill),
        };
        self.admins.write().await.insert(session_id, entry);
        tracing::debug!(%session_id, username, "Admin session admitted");
        (session_id, SessionHandle { rx, kill })
    }

    pub async fn remove_admin(&self, session_id: Uuid) {
        self.admins.write().await.remove(&session_id);
    }

    pub async fn send_to_admin(&self, session_id: Uuid, msg: &AdminOutbound) {
        let admins = self.admins.read().await;
        let Some(entry) = admins.get(&session_id) else {
            return;
        };
        if entry.tx.try_send(msg.to_json()).is_err() {
            tracing::warn!(%session_id, "Admin mailbox overflowed, closing session");
            entry.kill.notify_one();
        }
    }

    /// Broadcasts `msg` to every admin whose `allowedTenants` cover `tenant`. Per-send
    /// failures are logged and close only that session; a slow or wedged admin never
    /// blocks delivery to the rest, and broadcast failures are never retried.
    pub async fn broadcast_to_tenant(&self, tenant: &Tenant, msg: &AdminOutbound) {
        let admins = self.admins.read().await;
        let payload = msg.to_json();
        for (session_id, entry) in admins.iter() {
            if !can_access_tenant(&entry.allowed_tenants, tenant) {
                continue;
            }
            if entry.tx.try_send(payload.clone()).is_err() {
                tracing::warn!(%session_id, "Admin mailbox overflowed during broadcast, closing session");
                entry.kill.notify_one();
            }
        }
    }

    /// Same as [`Self::broadcast_to_tenant`] but for a device whose tenant may not be
    /// known yet; an unknown tenant means nobody — including wildcard admins — can see
    /// it, matching `canAccessDevice`'s "no recorded tenant" rule.
    pub async fn broadcast_to_device_tenant(&self, tenant: Option<&Tenant>, msg: &AdminOutbound) {
        if let Some(tenant) = tenant {
            self.broadcast_to_tenant(tenant, msg).await;
        }
    }

    pub async fn agent_count(&self) -> usize {
        self.agents.read().await.len()
    }

    pub async fn admin_count(&self) -> usize {
        self.admins.read().await.len()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn supplant_kills_prior_agent_session() {
        let registry = SessionRegistry::new();
        let (first, _id1) = registry.admit_agent("dev-1", Tenant::new("CLA1")).await;
        let (_second, _id2) = registry.admit_agent("dev-1", Tenant::new("CLA1")).await;

        tokio::time::timeout(std::time::Duration::from_millis(100), first.kill.notified())
            .await
            .expect("prior session should be killed on supplant");
    }

    #[tokio::test]
    async fn stale_identity_does_not_remove_newer_session() {
        let registry = SessionRegistry::new();
        let (_first, id1) = registry.admit_agent("dev-1", Tenant::new("CLA1")).await;
        let (_second, _id2) = registry.admit_agent("dev-1", Tenant::new("CLA1")).await;

        let removed = registry.remove_agent("dev-1", id1).await;
        assert!(!removed);
        assert!(registry.is_agent_active("dev-1").await);
    }

    #[tokio::test]
    async fn is_current_agent_is_false_once_supplanted() {
        let registry = SessionRegistry::new();
        let (_first, id1) = registry.admit_agent("dev-1", Tenant::new("CLA1")).await;
        let (_second, id2) = registry.admit_agent("dev-1", Tenant::new("CLA1")).await;

        assert!(!registry.is_current_agent("dev-1", id1).await);
        assert!(registry.is_current_agent("dev-1", id2).await);
    }

    #[tokio::test]
    async fn current_identity_removes_session() {
        let registry = SessionRegistry::new();
        let (_handle, id) = registry.admit_agent("dev-1", Tenant::new("CLA1")).await;
        let removed = registry.remove_agent("dev-1", id).await;
        assert!(removed);
        assert!(!registry.is_agent_active("dev-1").await);
    }

    #[tokio::test]
    async fn broadcast_respects_tenant_scope() {
        let registry = SessionRegistry::new();
        let (_id_a, mut handle_a) = {
            let (id, h) = registry
                .admit_admin("adminCLA".into(), AllowedTenants(vec!["CLA1".into()]))
                .await;
            (id, h)
        };
        let (_id_b, mut handle_b) = {
            let (id, h) = registry
                .admit_admin("adminDLA".into(), AllowedTenants(vec!["DLA1".into()]))
                .await;
            (id, h)
        };

        registry
            .broadcast_to_tenant(
                &Tenant::new("CLA1"),
                &AdminOutbound::DevicePresence {
                    device_id: "dev-1".into(),
                    online: true,
                    last_seen: None,
                    agent_version: None,
                },
            )
            .await;

        let received = handle_a.rx.try_recv();
        assert!(received.is_ok());
        assert!(handle_b.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn wildcard_admin_sees_every_tenant_broadcast() {
        let registry = SessionRegistry::new();
        let (_id, mut handle) = registry
            .admit_admin("adminRoot".into(), AllowedTenants::wildcard())
            .await;

        registry
            .broadcast_to_tenant(
                &Tenant::new("DLA2"),
                &AdminOutbound::ConsentStatus {
                    device_id: "dev-9".into(),
                    status: "sent_to_agent".into(),
                },
            )
            .await;

        assert!(handle.rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn broadcast_to_device_with_unknown_tenant_reaches_nobody() {
        let registry = SessionRegistry::new();
        let (_id, mut handle) = registry
            .admit_admin("adminRoot".into(), AllowedTenants::wildcard())
            .await;

        registry
            .broadcast_to_device_tenant(
                None,
                &AdminOutbound::DevicePresence {
                    device_id: "dev-1".into(),
                    online: true,
                    last_seen: None,
                    agent_version: None,
                },
            )
            .await;

        assert!(handle.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn send_to_agent_is_noop_when_offline() {
        let registry = SessionRegistry::new();
        // No panics, no send target — just a silent no-op.
        registry
            .send_to_agent("dev-missing", &AgentOutbound::StreamEnable)
            .await;
    }
}
