use std::sync::Arc;

use lookout_protocol::{can_access_device, AdminOutbound, AgentOutbound, AllowedTenants, Tenant};

use crate::sessions::SessionRegistry;
use crate::store::Store;

/// Outcome of handling `request_remote_access`, returned to the caller so the admin
/// WS handler can reply on the same connection that asked.
pub enum RequestOutcome {
    /// Admin is not permitted to see this device's tenant (including an unknown tenant).
    Forbidden,
    /// No live agent session for this device; the admin is told immediately.
    AgentOffline,
    /// Forwarded to the agent; the admin gets an acknowledgement, not a final answer.
    SentToAgent,
}

/// `request_remote_access{deviceId}` from an admin. Checks tenant scope, then either
/// forwards to the agent or synthesizes an offline reply. Does not reply to the admin
/// itself — the caller uses the returned outcome to do that on the requesting
/// connection.
pub async fn request_remote_access(
    store: &Store,
    registry: &SessionRegistry,
    allowed_tenants: &AllowedTenants,
    device_id: &str,
) -> RequestOutcome {
    let device_tenant = store.device_tenant(device_id).await;
    if !can_access_device(allowed_tenants, device_tenant.as_ref()) {
        return RequestOutcome::Forbidden;
    }

    if !registry.is_agent_active(device_id).await {
        return RequestOutcome::AgentOffline;
    }

    RequestOutcome::SentToAgent
}

/// Sends `consent_request{admin}` to the device's active agent session. Only call this
/// after [`request_remote_access`] returned [`RequestOutcome::SentToAgent`].
pub async fn forward_to_agent(registry: &SessionRegistry, device_id: &str, admin_username: &str) {
    registry
        .send_to_agent(
            device_id,
            &AgentOutbound::ConsentRequest {
                admin: admin_username.to_string(),
            },
        )
        .await;
}

/// Agent's `consent_response{accepted}`, broadcast to every admin whose `allowedTenants`
/// cover the device's tenant. The hub does not persist this across reconnects — it is a
/// one-shot relay.
pub async fn broadcast_consent_response(
    store: &Store,
    registry: &SessionRegistry,
    device_id: &str,
    accepted: bool,
) {
    let device_tenant = store.device_tenant(device_id).await;
    let reason = if accepted { None } else { Some("declined".to_string()) };
    registry
        .broadcast_to_device_tenant(
            device_tenant.as_ref(),
            &AdminOutbound::ConsentResponse {
                device_id: device_id.to_string(),
                accepted,
                reason,
            },
        )
        .await;
}
