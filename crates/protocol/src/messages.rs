use serde::{Deserialize, Serialize};

use crate::tenant::AllowedTenants;

/// `POST /api/login` request body.
#[derive(Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for LoginRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoginRequest")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginUser {
    pub id: String,
    pub username: String,
    pub allowed_tenants: AllowedTenants,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub token: String,
    pub user: LoginUser,
}

/// One row of `GET /api/devices`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceDto {
    pub id: String,
    pub device_id: String,
    pub name: String,
    pub tenant: String,
    pub connected: bool,
    pub online: bool,
    pub last_seen: Option<u64>,
    pub agent_version: Option<String>,
    pub compliance_flag: bool,
    pub compliance_count: u64,
    pub compliance_last_at: Option<u64>,
    pub compliance_last_severity: Option<String>,
}

/// One entry of `GET /api/device-aliases`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AliasDto {
    pub label: String,
    pub updated_at: u64,
}

/// `PUT /api/device-aliases/{id}` request body.
#[derive(Debug, Deserialize)]
pub struct PutAliasRequest {
    pub label: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PutAliasResponse {
    pub ok: bool,
    pub device_id: String,
    pub label: String,
    pub updated_at: u64,
}

/// One `GET /api/compliance/events` row.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComplianceEventDto {
    pub id: String,
    pub device_id: String,
    pub author: String,
    pub context: String,
    pub timestamp: u64,
    pub content: String,
    #[serde(default)]
    pub matches: Vec<String>,
    pub severity: Option<Severity>,
    #[serde(default)]
    pub suspicious: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

/// One `GET /api/logs` row.
#[derive(Debug, Clone, Serialize)]
pub struct LogEntryDto {
    pub ts: u64,
    pub level: String,
    pub msg: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<serde_json::Value>,
}

/// Raw frame payload normalized from either wire form (binary WS message, or JSON
/// `{type:"frame"|"screen_frame", jpegBase64|jpeg}`). Everywhere in the hub past the
/// point of decoding, only this normalized shape is used.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub bytes: Vec<u8>,
    pub mime: &'static str,
}

impl RawFrame {
    pub const DEFAULT_MIME: &'static str = "image/jpeg";

    pub fn jpeg(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            mime: Self::DEFAULT_MIME,
        }
    }

    /// Decode a JSON frame's embedded payload string, which is either raw base64 or a
    /// `data:image/...;base64,` URL.
    pub fn decode_embedded(payload: &str) -> Result<Self, base64::DecodeError> {
        use base64::Engine;

        let raw = match payload.split_once(";base64,") {
            Some((_, data)) => data,
            None => payload,
        };
        let bytes = base64::engine::general_purpose::STANDARD.decode(raw)?;
        Ok(Self::jpeg(bytes))
    }
}

/// Wire shape accepted from an agent's JSON message. Only used at deserialization time;
/// everything downstream works with [`AgentInbound`].
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AgentInboundWire {
    Ping,
    ConsentResponse {
        accepted: bool,
    },
    Frame {
        #[serde(rename = "jpegBase64", alias = "jpeg")]
        payload: String,
    },
    ScreenFrame {
        #[serde(rename = "jpegBase64", alias = "jpeg")]
        payload: String,
    },
}

/// Normalized sum type for every message an agent can send, decoded once at the wire
/// boundary. Dispatch elsewhere in the hub always matches on this, never on a raw
/// string `type` field.
#[derive(Debug)]
pub enum AgentInbound {
    Ping,
    ConsentResponse { accepted: bool },
    Frame { payload: String },
}

impl AgentInbound {
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        let wire: AgentInboundWire = serde_json::from_str(text)?;
        Ok(match wire {
            AgentInboundWire::Ping => AgentInbound::Ping,
            AgentInboundWire::ConsentResponse { accepted } => {
                AgentInbound::ConsentResponse { accepted }
            }
            AgentInboundWire::Frame { payload } | AgentInboundWire::ScreenFrame { payload } => {
                AgentInbound::Frame { payload }
            }
        })
    }
}

/// Messages the hub sends to an agent. `StreamEnable`/`StreamDisable` are emitted as two
/// separate wire frames (hyphenated and underscored control verbs) for backward
/// compatibility with older agents; that duplication happens only at serialization time,
/// in [`AgentOutbound::to_wire_frames`].
#[derive(Debug, Clone)]
pub enum AgentOutbound {
    Pong,
    ConsentRequest { admin: String },
    StreamEnable,
    StreamDisable,
}

impl AgentOutbound {
    /// One or more raw JSON text frames to write to the agent's socket, in order.
    pub fn to_wire_frames(&self) -> Vec<String> {
        match self {
            AgentOutbound::Pong => vec![r#"{"type":"pong"}"#.to_string()],
            AgentOutbound::ConsentRequest { admin } => {
                vec![serde_json::json!({"type": "consent_request", "admin": admin}).to_string()]
            }
            AgentOutbound::StreamEnable => vec![
                r#"{"type":"stream-enable"}"#.to_string(),
                r#"{"type":"stream_enable"}"#.to_string(),
            ],
            AgentOutbound::StreamDisable => vec![
                r#"{"type":"stream-disable"}"#.to_string(),
                r#"{"type":"stream_disable"}"#.to_string(),
            ],
        }
    }
}

/// Messages an admin can send over the WebSocket.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AdminInbound {
    RequestRemoteAccess {
        #[serde(rename = "deviceId")]
        device_id: String,
    },
}

/// Messages the hub sends to an admin.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AdminOutbound {
    DevicesSnapshot {
        devices: Vec<DeviceDto>,
    },
    #[serde(rename_all = "camelCase")]
    DevicePresence {
        device_id: String,
        online: bool,
        last_seen: Option<u64>,
        agent_version: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    ConsentResponse {
        device_id: String,
        accepted: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    ConsentStatus {
        device_id: String,
        status: String,
    },
    #[serde(rename_all = "camelCase")]
    ComplianceEvent {
        device_id: String,
        count: u64,
        severity: Option<Severity>,
        ts: u64,
    },
    Error {
        message: String,
    },
}

impl AdminOutbound {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("AdminOutbound is always representable as JSON")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_inbound_ping() {
        let msg = AgentInbound::from_json(r#"{"type":"ping"}"#).unwrap();
        assert!(matches!(msg, AgentInbound::Ping));
    }

    #[test]
    fn agent_inbound_consent_response() {
        let msg =
            AgentInbound::from_json(r#"{"type":"consent_response","accepted":true}"#).unwrap();
        assert!(matches!(
            msg,
            AgentInbound::ConsentResponse { accepted: true }
        ));
    }

    #[test]
    fn agent_inbound_frame_jpeg_base64_field() {
        let msg = AgentInbound::from_json(r#"{"type":"frame","jpegBase64":"Zm9v"}"#).unwrap();
        match msg {
            AgentInbound::Frame { payload } => assert_eq!(payload, "Zm9v"),
            _ => panic!("expected Frame"),
        }
    }

    #[test]
    fn agent_inbound_screen_frame_jpeg_alias_field() {
        let msg = AgentInbound::from_json(r#"{"type":"screen_frame","jpeg":"Zm9v"}"#).unwrap();
        match msg {
            AgentInbound::Frame { payload } => assert_eq!(payload, "Zm9v"),
            _ => panic!("expected Frame"),
        }
    }

    #[test]
    fn agent_inbound_rejects_unknown_type() {
        assert!(AgentInbound::from_json(r#"{"type":"bogus"}"#).is_err());
    }

    #[test]
    fn agent_outbound_stream_enable_emits_both_verbs() {
        let frames = AgentOutbound::StreamEnable.to_wire_frames();
        assert_eq!(frames.len(), 2);
        assert!(frames[0].contains("stream-enable"));
        assert!(frames[1].contains("stream_enable"));
    }

    #[test]
    fn agent_outbound_stream_disable_emits_both_verbs() {
        let frames = AgentOutbound::StreamDisable.to_wire_frames();
        assert_eq!(frames.len(), 2);
        assert!(frames[0].contains("stream-disable"));
        assert!(frames[1].contains("stream_disable"));
    }

    #[test]
    fn agent_outbound_consent_request_shape() {
        let frames = AgentOutbound::ConsentRequest {
            admin: "adminCLA".to_string(),
        }
        .to_wire_frames();
        assert_eq!(frames.len(), 1);
        assert!(frames[0].contains(r#""type":"consent_request""#));
        assert!(frames[0].contains(r#""admin":"adminCLA""#));
    }

    #[test]
    fn admin_inbound_request_remote_access() {
        let msg: AdminInbound =
            serde_json::from_str(r#"{"type":"request_remote_access","deviceId":"dev-42"}"#)
                .unwrap();
        match msg {
            AdminInbound::RequestRemoteAccess { device_id } => assert_eq!(device_id, "dev-42"),
        }
    }

    #[test]
    fn admin_outbound_device_presence_wire_shape() {
        let msg = AdminOutbound::DevicePresence {
            device_id: "dev-42".to_string(),
            online: true,
            last_seen: Some(1000),
            agent_version: Some("1.0.5".to_string()),
        };
        let json = msg.to_json();
        assert!(json.contains(r#""type":"device_presence""#));
        assert!(json.contains(r#""deviceId":"dev-42""#));
        assert!(json.contains(r#""lastSeen":1000"#));
        assert!(json.contains(r#""agentVersion":"1.0.5""#));
    }

    #[test]
    fn admin_outbound_consent_response_wire_shape() {
        let msg = AdminOutbound::ConsentResponse {
            device_id: "dev-42".to_string(),
            accepted: false,
            reason: Some("agent_offline".to_string()),
        };
        let json = msg.to_json();
        assert!(json.contains(r#""type":"consent_response""#));
        assert!(json.contains(r#""reason":"agent_offline""#));
    }

    #[test]
    fn admin_outbound_consent_response_omits_absent_reason() {
        let msg = AdminOutbound::ConsentResponse {
            device_id: "dev-42".to_string(),
            accepted: true,
            reason: None,
        };
        assert!(!msg.to_json().contains("reason"));
    }

    #[test]
    fn raw_frame_decodes_plain_base64() {
        let frame = RawFrame::decode_embedded("aGVsbG8=").unwrap();
        assert_eq!(frame.bytes, b"hello");
        assert_eq!(frame.mime, "image/jpeg");
    }

    #[test]
    fn raw_frame_decodes_data_url() {
        let frame = RawFrame::decode_embedded("data:image/jpeg;base64,aGVsbG8=").unwrap();
        assert_eq!(frame.bytes, b"hello");
    }

    #[test]
    fn login_request_password_redacted_in_debug() {
        let req = LoginRequest {
            username: "adminCLA".to_string(),
            password: "@ims1234!".to_string(),
        };
        let debug = format!("{:?}", req);
        assert!(debug.contains("adminCLA"));
        assert!(debug.contains("[REDACTED]"));
        assert!(!debug.contains("@ims1234!"));
    }
}
