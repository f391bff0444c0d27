use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use lookout_protocol::{AliasDto, ComplianceEventDto, DeviceDto, LogEntryDto, Severity, Tenant};
use tokio::sync::RwLock;

use crate::error::HubError;

pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// In-memory record of a managed machine. Created lazily on first agent connection;
/// never destroyed, so devices survive across agent reconnects and presence flaps.
#[derive(Debug, Clone)]
pub struct DeviceRecord {
    pub id: String,
    pub tenant: Option<Tenant>,
    pub connected: bool,
    pub last_seen: Option<u64>,
    pub agent_version: Option<String>,
}

impl DeviceRecord {
    fn new(id: String) -> Self {
        Self {
            id,
            tenant: None,
            connected: false,
            last_seen: None,
            agent_version: None,
        }
    }
}

/// Derived aggregate kept per device, recomputed from the compliance log at startup
/// rather than trusted from a separately persisted file (section 11, open question 3).
#[derive(Debug, Clone, Default)]
struct ComplianceAggregate {
    count: u64,
    last_at: Option<u64>,
    last_severity: Option<Severity>,
}

struct StoreInner {
    devices: HashMap<String, DeviceRecord>,
    aliases: HashMap<String, AliasDto>,
    compliance: Vec<ComplianceEventDto>,
    aggregates: HashMap<String, ComplianceAggregate>,
    logs: VecDeque<LogEntryDto>,
    log_capacity: usize,
}

/// Tenant mismatch on a device whose home tenant is already pinned (section 9,
/// "device-first tenant binding").
#[derive(Debug, thiserror::Error)]
#[error("device {device_id} is bound to tenant {existing}, got {attempted}")]
pub struct TenantMismatch {
    pub device_id: String,
    pub existing: String,
    pub attempted: String,
}

/// Devices map, alias map, compliance log, and operational log ring buffer. All
/// mutating operations funnel through this single `RwLock`, giving the single-writer
/// discipline the spec requires; reads take a snapshot copy so callers never observe a
/// partially-applied mutation.
pub struct Store {
    inner: RwLock<StoreInner>,
    data_dir: PathBuf,
}

impl Store {
    /// Load persisted aliases and compliance events from `data_dir`, recomputing
    /// aggregates from the replayed log. Missing files are treated as empty, not an
    /// error — a fresh deployment has no prior state.
    pub async fn load(data_dir: impl AsRef<Path>, log_capacity: usize) -> anyhow::Result<Self> {
        let data_dir = data_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&data_dir)?;

        let aliases = load_json_or_default::<HashMap<String, AliasDto>>(
            &data_dir.join("device-aliases.json"),
        )?;
        let compliance = load_json_or_default::<Vec<ComplianceEventDto>>(
            &data_dir.join("compliance-events.json"),
        )?;

        let mut devices = HashMap::new();
        for device_id in aliases.keys() {
            devices
                .entry(device_id.clone())
                .or_insert_with(|| DeviceRecord::new(device_id.clone()));
        }

        let mut aggregates: HashMap<String, ComplianceAggregate> = HashMap::new();
        for evt in &compliance {
            devices
                .entry(evt.device_id.clone())
                .or_insert_with(|| DeviceRecord::new(evt.device_id.clone()));
            let agg = aggregates.entry(evt.device_id.clone()).or_default();
            agg.count += 1;
            agg.last_at = Some(agg.last_at.map_or(evt.timestamp, |t| t.max(evt.timestamp)));
            if agg.last_at == Some(evt.timestamp) {
                agg.last_severity = evt.severity;
            }
        }

        tracing::info!(
            devices = devices.len(),
            aliases = aliases.len(),
            compliance_events = compliance.len(),
            "Store loaded from disk"
        );

        Ok(Self {
            inner: RwLock::new(StoreInner {
                devices,
                aliases,
                compliance,
                aggregates,
                logs: VecDeque::with_capacity(log_capacity),
                log_capacity,
            }),
            data_dir,
        })
    }

    /// `upsertDevice(id, tenant?)`. If the device is new, creates it (binding the
    /// tenant if given). If it already has a pinned tenant and a different one is
    /// asserted, returns [`TenantMismatch`] without mutating anything — the caller
    /// (the agent WS handler) is responsible for refusing the connection.
    pub async fn upsert_device(
        &self,
        id: &str,
        tenant: Option<&Tenant>,
    ) -> Result<(), TenantMismatch> {
        let mut inner = self.inner.write().await;
        let record = inner
            .devices
            .entry(id.to_string())
            .or_insert_with(|| DeviceRecord::new(id.to_string()));

        match (&record.tenant, tenant) {
            (Some(existing), Some(attempted)) if existing != attempted => {
                return Err(TenantMismatch {
                    device_id: id.to_string(),
                    existing: existing.as_str().to_string(),
                    attempted: attempted.as_str().to_string(),
                });
            }
            (None, Some(attempted)) => record.tenant = Some(attempted.clone()),
            _ => {}
        }
        Ok(())
    }

    /// `setConnected(id, bool, lastSeen?)`. `lastSeen` is monotonic non-decreasing
    /// while connected; a `None` leaves the existing timestamp untouched.
    pub async fn set_connected(&self, id: &str, connected: bool, last_seen: Option<u64>) {
        let mut inner = self.inner.write().await;
        let record = inner
            .devices
            .entry(id.to_string())
            .or_insert_with(|| DeviceRecord::new(id.to_string()));
        record.connected = connected;
        if let Some(ts) = last_seen {
            record.last_seen = Some(record.last_seen.map_or(ts, |prev| prev.max(ts)));
        }
    }

    pub async fn set_agent_version(&self, id: &str, version: Option<String>) {
        let mut inner = self.inner.write().await;
        if let Some(record) = inner.devices.get_mut(id) {
            record.agent_version = version;
        }
    }

    pub async fn touch_last_seen(&self, id: &str, ts: u64) {
        let mut inner = self.inner.write().await;
        if let Some(record) = inner.devices.get_mut(id) {
            record.last_seen = Some(record.last_seen.map_or(ts, |prev| prev.max(ts)));
        }
    }

    pub async fn device_tenant(&self, id: &str) -> Option<Tenant> {
        self.inner.read().await.devices.get(id).and_then(|d| d.tenant.clone())
    }

    pub async fn get_device(&self, id: &str) -> Option<DeviceRecord> {
        self.inner.read().await.devices.get(id).cloned()
    }

    /// Sweep devices for presence timeout; returns the ids newly marked offline, each
    /// paired with their home tenant (for the presence-monitor's broadcast filter).
    pub async fn sweep_presence(&self, ttl_secs: u64, now_secs: u64) -> Vec<(String, Option<Tenant>)> {
        let mut inner = self.inner.write().await;
        let ttl_ms = ttl_secs.saturating_mul(1000);
        let mut newly_offline = Vec::new();
        for record in inner.devices.values_mut() {
            if !record.connected {
                continue;
            }
            let age_ms = record
                .last_seen
                .map(|seen| now_secs.saturating_mul(1000).saturating_sub(seen));
            if age_ms.is_none_or(|age| age > ttl_ms) {
                record.connected = false;
                newly_offline.push((record.id.clone(), record.tenant.clone()));
            }
        }
        newly_offline
    }

    pub async fn get_devices(&self) -> Vec<DeviceDto> {
        let inner = self.inner.read().await;
        let mut out: Vec<DeviceDto> = inner
            .devices
            .values()
            .map(|d| {
                let agg = inner.aggregates.get(&d.id);
                let alias = inner.aliases.get(&d.id);
                DeviceDto {
                    id: d.id.clone(),
                    device_id: d.id.clone(),
                    name: alias
                        .map(|a| a.label.clone())
                        .filter(|l| !l.is_empty())
                        .unwrap_or_else(|| d.id.clone()),
                    tenant: d
                        .tenant
                        .as_ref()
                        .map(|t| t.as_str().to_string())
                        .unwrap_or_default(),
                    connected: d.connected,
                    online: d.connected,
                    last_seen: d.last_seen,
                    agent_version: d.agent_version.clone(),
                    compliance_flag: agg.is_some_and(|a| a.count > 0),
                    compliance_count: agg.map(|a| a.count).unwrap_or(0),
                    compliance_last_at: agg.and_then(|a| a.last_at),
                    compliance_last_severity: agg
                        .and_then(|a| a.last_severity)
                        .map(severity_str),
                }
            })
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    pub async fn get_alias(&self, id: &str) -> Option<AliasDto> {
        self.inner.read().await.aliases.get(id).cloned()
    }

    pub async fn list_aliases(&self) -> HashMap<String, AliasDto> {
        self.inner.read().await.aliases.clone()
    }

    /// `putAlias(id, label)`. An empty label deletes the entry. Persists the whole
    /// alias map atomically; on persistence failure the in-memory mutation is rolled
    /// back and the caller receives [`HubError::Persistence`].
    pub async fn put_alias(&self, id: &str, label: &str, now: u64) -> Result<AliasDto, HubError> {
        let mut inner = self.inner.write().await;
        let previous = inner.aliases.get(id).cloned();

        let result = if label.is_empty() {
            inner.aliases.remove(id);
            AliasDto {
                label: String::new(),
                updated_at: now,
            }
        } else {
            let dto = AliasDto {
                label: label.to_string(),
                updated_at: now,
            };
            inner.aliases.insert(id.to_string(), dto.clone());
            dto
        };

        let snapshot = inner.aliases.clone();
        drop(inner);

        if let Err(e) = write_json_atomic(&self.data_dir.join("device-aliases.json"), &snapshot) {
            let mut inner = self.inner.write().await;
            match previous {
                Some(prev) => {
                    inner.aliases.insert(id.to_string(), prev);
                }
                None => {
                    inner.aliases.remove(id);
                }
            }
            return Err(HubError::Persistence(e.to_string()));
        }

        Ok(result)
    }

    pub async fn list_compliance(&self, device_id: Option<&str>) -> Vec<ComplianceEventDto> {
        let inner = self.inner.read().await;
        let mut events: Vec<ComplianceEventDto> = inner
            .compliance
            .iter()
            .filter(|e| device_id.is_none_or(|d| e.device_id == d))
            .cloned()
            .collect();
        events.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        events
    }

    /// `appendCompliance(evt)`. Upserts the device if it doesn't exist yet (the
    /// invariant that every compliance event refers to a known device), persists the
    /// whole log atomically, and updates the aggregate incrementally on success.
    pub async fn append_compliance(&self, evt: ComplianceEventDto) -> Result<(), HubError> {
        let mut inner = self.inner.write().await;
        inner
            .devices
            .entry(evt.device_id.clone())
            .or_insert_with(|| DeviceRecord::new(evt.device_id.clone()));

        inner.compliance.push(evt.clone());
        let snapshot = inner.compliance.clone();
        drop(inner);

        if let Err(e) = write_json_atomic(&self.data_dir.join("compliance-events.json"), &snapshot) {
            let mut inner = self.inner.write().await;
            inner.compliance.pop();
            return Err(HubError::Persistence(e.to_string()));
        }

        let mut inner = self.inner.write().await;
        let agg = inner.aggregates.entry(evt.device_id.clone()).or_default();
        agg.count += 1;
        agg.last_at = Some(evt.timestamp);
        agg.last_severity = evt.severity;
        Ok(())
    }

    pub async fn append_log(&self, level: &str, msg: &str, meta: Option<serde_json::Value>) {
        let mut inner = self.inner.write().await;
        let cap = inner.log_capacity;
        let entry = LogEntryDto {
            ts: now_millis(),
            level: level.to_string(),
            msg: msg.to_string(),
            meta,
        };
        if inner.logs.len() >= cap {
            inner.logs.pop_front();
        }
        inner.logs.push_back(entry);
    }

    pub async fn list_logs(&self) -> Vec<LogEntryDto> {
        self.inner.read().await.logs.iter().cloned().collect()
    }
}

fn severity_str(s: Severity) -> String {
    match s {
        Severity::Low => "low",
        Severity::Medium => "medium",
        Severity::High => "high",
    }
    .to_string()
}

fn load_json_or_default<T>(path: &Path) -> anyhow::Result<T>
where
    T: serde::de::DeserializeOwned + Default,
{
    match std::fs::read_to_string(path) {
        Ok(contents) => Ok(serde_json::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
        Err(e) => Err(e.into()),
    }
}

/// Write-to-temp-then-rename, with owner-only permissions, matching the teacher's
/// persistence idiom for anything that carries sensitive or authoritative state.
fn write_json_atomic<T: serde::Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    let tmp_path = path.with_extension("json.tmp");
    let data = serde_json::to_string_pretty(value)?;

    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&tmp_path)?;
        file.write_all(data.as_bytes())?;
    }
    #[cfg(not(unix))]
    {
        std::fs::write(&tmp_path, &data)?;
    }

    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_store() -> (Store, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::load(dir.path(), 500).await.unwrap();
        (store, dir)
    }

    #[tokio::test]
    async fn upsert_binds_tenant_on_first_connection() {
        let (store, _dir) = test_store().await;
        store
            .upsert_device("dev-1", Some(&Tenant::new("CLA1")))
            .await
            .unwrap();
        assert_eq!(store.device_tenant("dev-1").await, Some(Tenant::new("CLA1")));
    }

    #[tokio::test]
    async fn reconnect_with_different_tenant_is_rejected() {
        let (store, _dir) = test_store().await;
        store
            .upsert_device("dev-1", Some(&Tenant::new("CLA1")))
            .await
            .unwrap();
        let err = store
            .upsert_device("dev-1", Some(&Tenant::new("DLA1")))
            .await
            .unwrap_err();
        assert_eq!(err.existing, "CLA1");
        assert_eq!(err.attempted, "DLA1");
    }

    #[tokio::test]
    async fn reconnect_with_no_tenant_keeps_pinned_tenant() {
        let (store, _dir) = test_store().await;
        store
            .upsert_device("dev-1", Some(&Tenant::new("CLA1")))
            .await
            .unwrap();
        store.upsert_device("dev-1", None).await.unwrap();
        assert_eq!(store.device_tenant("dev-1").await, Some(Tenant::new("CLA1")));
    }

    #[tokio::test]
    async fn put_empty_alias_deletes_entry() {
        let (store, _dir) = test_store().await;
        store.put_alias("dev-1", "Front Desk", 100).await.unwrap();
        assert!(store.get_alias("dev-1").await.is_some());
        store.put_alias("dev-1", "", 200).await.unwrap();
        assert!(store.get_alias("dev-1").await.is_none());
    }

    #[tokio::test]
    async fn put_alias_twice_is_idempotent_except_timestamp() {
        let (store, _dir) = test_store().await;
        store.put_alias("dev-1", "Front Desk", 100).await.unwrap();
        let second = store.put_alias("dev-1", "Front Desk", 200).await.unwrap();
        assert_eq!(second.label, "Front Desk");
        assert_eq!(second.updated_at, 200);
    }

    #[tokio::test]
    async fn alias_survives_reload_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = Store::load(dir.path(), 500).await.unwrap();
            store.put_alias("dev-1", "Front Desk", 100).await.unwrap();
        }
        let reloaded = Store::load(dir.path(), 500).await.unwrap();
        assert_eq!(reloaded.get_alias("dev-1").await.unwrap().label, "Front Desk");
    }

    #[tokio::test]
    async fn deleted_alias_does_not_survive_restart() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = Store::load(dir.path(), 500).await.unwrap();
            store.put_alias("dev-1", "Front Desk", 100).await.unwrap();
            store.put_alias("dev-1", "", 200).await.unwrap();
        }
        let reloaded = Store::load(dir.path(), 500).await.unwrap();
        assert!(reloaded.get_alias("dev-1").await.is_none());
    }

    #[tokio::test]
    async fn compliance_append_upserts_unknown_device() {
        let (store, _dir) = test_store().await;
        store
            .append_compliance(ComplianceEventDto {
                id: "evt-1".into(),
                device_id: "dev-unknown".into(),
                author: "agent".into(),
                context: "clipboard".into(),
                timestamp: 1000,
                content: "ssn leak".into(),
                matches: vec!["ssn".into()],
                severity: Some(Severity::High),
                suspicious: true,
            })
            .await
            .unwrap();
        assert!(store.get_device("dev-unknown").await.is_some());
    }

    #[tokio::test]
    async fn compliance_aggregate_increases_by_exactly_one_and_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = Store::load(dir.path(), 500).await.unwrap();
            store
                .append_compliance(ComplianceEventDto {
                    id: "evt-1".into(),
                    device_id: "dev-1".into(),
                    author: "agent".into(),
                    context: "ctx".into(),
                    timestamp: 1000,
                    content: "c".into(),
                    matches: vec![],
                    severity: Some(Severity::Low),
                    suspicious: false,
                })
                .await
                .unwrap();
        }
        let reloaded = Store::load(dir.path(), 500).await.unwrap();
        let devices = reloaded.get_devices().await;
        let dev = devices.iter().find(|d| d.id == "dev-1").unwrap();
        assert_eq!(dev.compliance_count, 1);
    }

    #[tokio::test]
    async fn presence_sweep_marks_stale_devices_offline() {
        let (store, _dir) = test_store().await;
        store
            .upsert_device("dev-1", Some(&Tenant::new("CLA1")))
            .await
            .unwrap();
        store.set_connected("dev-1", true, Some(0)).await;
        let offline = store.sweep_presence(15, 20).await;
        assert_eq!(offline.len(), 1);
        assert_eq!(offline[0].0, "dev-1");
        assert!(!store.get_device("dev-1").await.unwrap().connected);
    }

    #[tokio::test]
    async fn presence_sweep_leaves_fresh_devices_connected() {
        let (store, _dir) = test_store().await;
        store
            .upsert_device("dev-1", Some(&Tenant::new("CLA1")))
            .await
            .unwrap();
        store.set_connected("dev-1", true, Some(10_000)).await;
        let offline = store.sweep_presence(15, 12).await;
        assert!(offline.is_empty());
        assert!(store.get_device("dev-1").await.unwrap().connected);
    }

    #[tokio::test]
    async fn log_ring_buffer_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::load(dir.path(), 3).await.unwrap();
        for i in 0..5 {
            store.append_log("info", &format!("entry {i}"), None).await;
        }
        let logs = store.list_logs().await;
        assert_eq!(logs.len(), 3);
        assert_eq!(logs[0].msg, "entry 2");
        assert_eq!(logs[2].msg, "entry 4");
    }
}
