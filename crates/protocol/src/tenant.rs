use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A tenant code. The set is closed for the devices actually seen in the wild, but the
/// wire and storage layers keep the raw string too so an unrecognized code round-trips
/// instead of being silently dropped.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Tenant(String);

impl Tenant {
    pub const KNOWN: &'static [&'static str] = &["CLA1", "CLA2", "DLA1", "DLA2"];

    pub fn new(code: impl Into<String>) -> Self {
        Self(code.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_known(&self) -> bool {
        Self::KNOWN.contains(&self.0.as_str())
    }
}

impl FromStr for Tenant {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Tenant(s.to_string()))
    }
}

impl fmt::Display for Tenant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Tenant {
    fn from(s: &str) -> Self {
        Tenant(s.to_string())
    }
}

/// Wildcard marker meaning "every tenant".
pub const TENANT_WILDCARD: &str = "*";

/// The set of tenants an admin may act on. Either every tenant (`*`) or an explicit list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AllowedTenants(pub Vec<String>);

impl AllowedTenants {
    pub fn wildcard() -> Self {
        Self(vec![TENANT_WILDCARD.to_string()])
    }

    pub fn is_wildcard(&self) -> bool {
        self.0.iter().any(|t| t == TENANT_WILDCARD)
    }

    pub fn contains(&self, tenant: &Tenant) -> bool {
        self.is_wildcard() || self.0.iter().any(|t| t == tenant.as_str())
    }
}

/// `canAccessTenant(allowed, tenant)`: pure, no I/O, no locking.
pub fn can_access_tenant(allowed: &AllowedTenants, tenant: &Tenant) -> bool {
    allowed.contains(tenant)
}

/// `canAccessDevice(allowed, deviceTenant)`: a device with no recorded tenant yet is
/// never accessible, regardless of `allowed`.
pub fn can_access_device(allowed: &AllowedTenants, device_tenant: Option<&Tenant>) -> bool {
    match device_tenant {
        Some(t) => can_access_tenant(allowed, t),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_sees_everything() {
        let allowed = AllowedTenants::wildcard();
        assert!(can_access_tenant(&allowed, &Tenant::new("CLA1")));
        assert!(can_access_tenant(&allowed, &Tenant::new("ZZZ9")));
    }

    #[test]
    fn explicit_list_is_exact() {
        let allowed = AllowedTenants(vec!["CLA1".into(), "CLA2".into()]);
        assert!(can_access_tenant(&allowed, &Tenant::new("CLA1")));
        assert!(!can_access_tenant(&allowed, &Tenant::new("DLA1")));
    }

    #[test]
    fn unknown_device_tenant_is_never_accessible() {
        let allowed = AllowedTenants::wildcard();
        assert!(!can_access_device(&allowed, None));
    }

    #[test]
    fn known_tenant_accessible_with_matching_scope() {
        let allowed = AllowedTenants(vec!["DLA2".into()]);
        assert!(can_access_device(&allowed, Some(&Tenant::new("DLA2"))));
        assert!(!can_access_device(&allowed, Some(&Tenant::new("DLA1"))));
    }

    #[test]
    fn known_tenant_codes() {
        assert!(Tenant::new("CLA1").is_known());
        assert!(!Tenant::new("XYZ9").is_known());
    }
}
