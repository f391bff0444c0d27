use serde::{Deserialize, Serialize};

fn default_port() -> u16 {
    3001
}
fn default_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_data_dir() -> String {
    "./data".to_string()
}
fn default_web_root() -> String {
    "./web/dist".to_string()
}
fn default_presence_ttl_secs() -> u64 {
    15
}
fn default_presence_sweep_secs() -> u64 {
    3
}
fn default_min_frame_interval_ms() -> u64 {
    250
}
fn default_token_ttl_secs() -> u64 {
    3600
}
fn default_log_capacity() -> usize {
    500
}

/// Hub-wide configuration. Normally populated from environment variables (see
/// [`crate::config`] loader conventions used by the server binary), but kept as a plain
/// serde-deserializable struct so it can equally be loaded from a TOML file for local
/// development, matching how every other service in this codebase structures config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default = "default_web_root")]
    pub web_root: String,
    /// HS256 signing secret for bearer tokens. Empty string means "not yet generated";
    /// the server binary generates and persists one on first run.
    #[serde(default)]
    pub jwt_secret: String,
    /// Tenant assigned to an agent connection that omits `tenant` on its WS upgrade.
    #[serde(default)]
    pub default_tenant: Option<String>,
    #[serde(default = "default_presence_ttl_secs")]
    pub presence_ttl_secs: u64,
    #[serde(default = "default_presence_sweep_secs")]
    pub presence_sweep_secs: u64,
    #[serde(default = "default_min_frame_interval_ms")]
    pub min_frame_interval_ms: u64,
    #[serde(default = "default_token_ttl_secs")]
    pub token_ttl_secs: u64,
    #[serde(default = "default_log_capacity")]
    pub log_capacity: usize,
    #[serde(default)]
    pub metrics_require_auth: bool,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind: default_bind(),
            data_dir: default_data_dir(),
            web_root: default_web_root(),
            jwt_secret: String::new(),
            default_tenant: None,
            presence_ttl_secs: default_presence_ttl_secs(),
            presence_sweep_secs: default_presence_sweep_secs(),
            min_frame_interval_ms: default_min_frame_interval_ms(),
            token_ttl_secs: default_token_ttl_secs(),
            log_capacity: default_log_capacity(),
            metrics_require_auth: false,
        }
    }
}

impl HubConfig {
    /// Validate ranges and report both hard errors and soft warnings, in the same
    /// `"ERROR: ..."` / `"WARNING: ..."` string convention used across this codebase's
    /// config validators so startup failure reporting looks the same everywhere.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut issues = Vec::new();

        if self.port == 0 {
            issues.push("ERROR: port must be nonzero".to_string());
        }
        if self.jwt_secret.is_empty() {
            issues.push("WARNING: jwt_secret is empty, one will be generated at startup".to_string());
        } else if self.jwt_secret.len() < 32 {
            issues.push("WARNING: jwt_secret is shorter than 32 characters".to_string());
        }
        if self.presence_ttl_secs == 0 {
            issues.push("ERROR: presence_ttl_secs must be nonzero".to_string());
        }
        if self.presence_sweep_secs == 0 {
            issues.push("ERROR: presence_sweep_secs must be nonzero".to_string());
        }
        if self.presence_sweep_secs >= self.presence_ttl_secs {
            issues.push(
                "WARNING: presence_sweep_secs should be smaller than presence_ttl_secs for timely offline detection"
                    .to_string(),
            );
        }
        if self.min_frame_interval_ms == 0 {
            issues.push("WARNING: min_frame_interval_ms is 0, frame throttling is disabled".to_string());
        }
        if self.token_ttl_secs == 0 {
            issues.push("ERROR: token_ttl_secs must be nonzero".to_string());
        }
        if let Some(t) = &self.default_tenant {
            if !crate::tenant::Tenant::new(t.clone()).is_known() {
                issues.push(format!("WARNING: default_tenant '{t}' is not a known tenant code"));
            }
        }

        if issues.iter().any(|i| i.starts_with("ERROR")) {
            Err(issues)
        } else if issues.is_empty() {
            Ok(())
        } else {
            // Warnings alone do not block startup but are still returned so the caller
            // can log them.
            Err(issues)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_literals() {
        let config = HubConfig::default();
        assert_eq!(config.port, 3001);
        assert_eq!(config.presence_ttl_secs, 15);
        assert_eq!(config.presence_sweep_secs, 3);
        assert_eq!(config.min_frame_interval_ms, 250);
        assert_eq!(config.token_ttl_secs, 3600);
    }

    #[test]
    fn toml_partial_override_keeps_other_defaults() {
        let config: HubConfig = toml::from_str("port = 9000\n").unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.presence_ttl_secs, 15);
    }

    #[test]
    fn zero_port_is_an_error() {
        let mut config = HubConfig::default();
        config.port = 0;
        config.jwt_secret = "a".repeat(40);
        let issues = config.validate().unwrap_err();
        assert!(issues.iter().any(|i| i.starts_with("ERROR") && i.contains("port")));
    }

    #[test]
    fn empty_secret_is_a_warning_not_an_error() {
        let mut config = HubConfig::default();
        config.jwt_secret.clear();
        let issues = config.validate().unwrap_err();
        assert!(issues.iter().all(|i| !i.starts_with("ERROR")));
    }

    #[test]
    fn sweep_not_smaller_than_ttl_warns() {
        let mut config = HubConfig::default();
        config.jwt_secret = "a".repeat(40);
        config.presence_sweep_secs = 20;
        config.presence_ttl_secs = 15;
        let issues = config.validate().unwrap_err();
        assert!(issues.iter().any(|i| i.contains("presence_sweep_secs")));
    }

    #[test]
    fn fully_valid_config_passes() {
        let mut config = HubConfig::default();
        config.jwt_secret = "a".repeat(40);
        assert!(config.validate().is_ok());
    }
}
