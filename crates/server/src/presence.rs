use std::sync::Arc;
use std::time::Duration;

use lookout_protocol::AdminOutbound;

use crate::sessions::SessionRegistry;
use crate::store::{now_millis, Store};

/// Periodically sweeps the store for devices that have gone quiet past the presence
/// TTL and broadcasts `device_presence` offline notices to the tenants that can see
/// them. Marking a device offline never touches its underlying socket — a lingering
/// agent connection that resumes sending will simply flip it back online on its next
/// heartbeat or frame.
pub async fn run(store: Arc<Store>, registry: Arc<SessionRegistry>, ttl_secs: u64, sweep_secs: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(sweep_secs.max(1)));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        interval.tick().await;
        let now_secs = now_millis() / 1000;
        let newly_offline = store.sweep_presence(ttl_secs, now_secs).await;
        for (device_id, tenant) in newly_offline {
            tracing::info!(device_id, "Device marked offline by presence sweep");
            store
                .append_log(
                    "info",
                    "device marked offline by presence sweep",
                    Some(serde_json::json!({"deviceId": device_id})),
                )
                .await;
            registry
                .broadcast_to_device_tenant(
                    tenant.as_ref(),
                    &AdminOutbound::DevicePresence {
                        device_id,
                        online: false,
                        last_seen: None,
                        agent_version: None,
                    },
                )
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_store() -> Store {
        let dir = tempfile::tempdir().unwrap();
        Store::load(dir.path(), 100).await.unwrap()
    }

    #[tokio::test]
    async fn sweep_marks_stale_device_offline_and_broadcasts() {
        let store = Arc::new(test_store().await);
        let registry = Arc::new(SessionRegistry::new());

        store
            .upsert_device("dev-42", Some(&lookout_protocol::Tenant::new("CLA1")))
            .await
            .unwrap();
        store.set_connected("dev-42", true, Some(0)).await;

        let (_admin_id, mut handle) = registry
            .admit_admin(
                "adminCLA".into(),
                lookout_protocol::AllowedTenants(vec!["CLA1".into()]),
            )
            .await;

        let newly_offline = store.sweep_presence(15, 1000).await;
        assert_eq!(newly_offline.len(), 1);
        registry
            .broadcast_to_device_tenant(
                newly_offline[0].1.as_ref(),
                &AdminOutbound::DevicePresence {
                    device_id: newly_offline[0].0.clone(),
                    online: false,
                    last_seen: None,
                    agent_version: None,
                },
            )
            .await;

        let msg = handle.rx.try_recv().unwrap();
        assert!(msg.contains(r#""online":false"#));
    }
}
