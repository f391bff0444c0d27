use lookout_protocol::HubConfig;

/// Load [`HubConfig`] from environment variables, per the hub's configuration contract.
/// Every field has a default, so a completely empty environment is a valid (if minimal)
/// configuration; `validate()` is the caller's job once this returns.
pub fn load_config_from_env() -> HubConfig {
    let mut config = HubConfig::default();

    if let Ok(v) = std::env::var("PORT") {
        match v.parse() {
            Ok(port) => config.port = port,
            Err(_) => tracing::warn!("PORT='{v}' is not a valid u16, keeping default"),
        }
    }
    if let Ok(v) = std::env::var("BIND") {
        config.bind = v;
    }
    if let Ok(v) = std::env::var("DATA_DIR") {
        config.data_dir = v;
    }
    if let Ok(v) = std::env::var("WEB_ROOT") {
        config.web_root = v;
    }
    if let Ok(v) = std::env::var("JWT_SECRET") {
        config.jwt_secret = v;
    }
    if let Ok(v) = std::env::var("LOOKOUT_DEFAULT_TENANT") {
        config.default_tenant = Some(v);
    }
    if let Ok(v) = std::env::var("PRESENCE_TTL_SECS") {
        parse_into(&v, &mut config.presence_ttl_secs, "PRESENCE_TTL_SECS");
    }
    if let Ok(v) = std::env::var("PRESENCE_SWEEP_SECS") {
        parse_into(&v, &mut config.presence_sweep_secs, "PRESENCE_SWEEP_SECS");
    }
    if let Ok(v) = std::env::var("MIN_FRAME_INTERVAL_MS") {
        parse_into(&v, &mut config.min_frame_interval_ms, "MIN_FRAME_INTERVAL_MS");
    }
    if let Ok(v) = std::env::var("TOKEN_TTL_SECS") {
        parse_into(&v, &mut config.token_ttl_secs, "TOKEN_TTL_SECS");
    }
    if let Ok(v) = std::env::var("METRICS_REQUIRE_AUTH") {
        config.metrics_require_auth = matches!(v.trim(), "1" | "true" | "TRUE" | "yes");
    }

    config
}

fn parse_into(raw: &str, field: &mut u64, name: &str) {
    match raw.parse() {
        Ok(v) => *field = v,
        Err(_) => tracing::warn!("{name}='{raw}' is not a valid integer, keeping default"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_any_env() {
        let config = HubConfig::default();
        assert_eq!(config.port, 3001);
        assert_eq!(config.bind, "0.0.0.0");
    }
}
