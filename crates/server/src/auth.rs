use anyhow::{Context, Result};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, TokenData, Validation};
use lookout_protocol::AllowedTenants;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::HubError;

/// JWT claims for authenticated admin sessions. `allowed_tenants` travels with the
/// token rather than being re-looked-up per request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub allowed_tenants: Vec<String>,
    pub exp: u64,
    pub iat: u64,
}

/// One compiled-in administrator. There is no external identity provider and no
/// password database — persistent identity and password issuance are explicitly out of
/// scope for this hub. Passwords are never stored or compared in plaintext;
/// `password_sha256` is the lowercase hex digest.
struct SeedAdmin {
    username: &'static str,
    password_sha256: &'static str,
    allowed_tenants: &'static [&'static str],
}

const SEED_ADMINS: &[SeedAdmin] = &[
    SeedAdmin {
        username: "adminCLA",
        password_sha256: "719959f3af470504600c8f3ef6f9cc8d2776d81a58d58a82446de8857bac3f19",
        allowed_tenants: &["CLA1", "CLA2"],
    },
    SeedAdmin {
        username: "adminDLA",
        password_sha256: "ed3ed937f1da615704fd965e6a8938d5d43dbc5f2b14186398efc704ed8e34f7",
        allowed_tenants: &["DLA1", "DLA2"],
    },
    SeedAdmin {
        username: "adminRoot",
        password_sha256: "b9f6855a9ae05832fdc3755d39dd5057464e38f450a1851037a180cafa563806",
        allowed_tenants: &["*"],
    },
];

fn sha256_hex(input: &str) -> String {
    use std::fmt::Write;
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        write!(out, "{byte:02x}").unwrap();
    }
    out
}

/// Constant-time comparison, to avoid leaking password-length or prefix information
/// through timing.
fn constant_time_eq(a: &str, b: &str) -> bool {
    let (a, b) = (a.as_bytes(), b.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    let mut diff: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

fn find_seed_admin(username: &str) -> Option<&'static SeedAdmin> {
    SEED_ADMINS.iter().find(|a| a.username == username)
}

/// `issue(username, password) → allowedTenants | error("invalid credentials")`. The
/// caller wraps the returned scope into a signed token via [`generate_jwt`].
pub fn authenticate(username: &str, password: &str) -> Result<AllowedTenants, HubError> {
    let admin = find_seed_admin(username).ok_or(HubError::InvalidCredentials)?;
    let candidate = sha256_hex(password);
    if constant_time_eq(&candidate, admin.password_sha256) {
        Ok(AllowedTenants(
            admin
                .allowed_tenants
                .iter()
                .map(|t| t.to_string())
                .collect(),
        ))
    } else {
        Err(HubError::InvalidCredentials)
    }
}

pub fn generate_jwt(
    username: &str,
    allowed_tenants: &AllowedTenants,
    secret: &str,
    ttl_secs: u64,
) -> Result<String> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system clock error")?
        .as_secs();

    let claims = Claims {
        sub: username.to_string(),
        allowed_tenants: allowed_tenants.0.clone(),
        iat: now,
        exp: now + ttl_secs,
    };

    jsonwebtoken::encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .context("failed to encode JWT")
}

/// `verify(token) → {username, allowedTenants} | error("invalid token")`. Used
/// identically whether the token arrived as an `Authorization: Bearer` header or a
/// `?token=` query parameter — the hub never defines a second token type.
pub fn validate_jwt(token: &str, secret: &str) -> Result<Claims> {
    let validation = Validation::new(Algorithm::HS256);
    let token_data: TokenData<Claims> = jsonwebtoken::decode(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )
    .context("invalid or expired token")?;
    Ok(token_data.claims)
}

/// Generate a cryptographically secure random signing secret: 32 bytes from
/// `/dev/urandom`, hex-encoded.
pub fn generate_secret() -> Result<String> {
    use std::fmt::Write;
    use std::io::Read;
    let mut bytes = [0u8; 32];
    let f = std::fs::File::open("/dev/urandom").context("failed to open /dev/urandom")?;
    (&f).read_exact(&mut bytes)
        .context("failed to read random bytes")?;
    let mut hex = String::with_capacity(64);
    for b in &bytes {
        write!(hex, "{b:02x}").unwrap();
    }
    Ok(hex)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_login_matches_spec_scenario() {
        let allowed = authenticate("adminCLA", "@ims1234!").unwrap();
        assert_eq!(allowed.0, vec!["CLA1".to_string(), "CLA2".to_string()]);
    }

    #[test]
    fn wrong_password_is_invalid_credentials() {
        let err = authenticate("adminCLA", "wrong").unwrap_err();
        assert!(matches!(err, HubError::InvalidCredentials));
    }

    #[test]
    fn unknown_username_is_invalid_credentials() {
        let err = authenticate("nobody", "@ims1234!").unwrap_err();
        assert!(matches!(err, HubError::InvalidCredentials));
    }

    #[test]
    fn wildcard_admin_gets_star_scope() {
        let allowed = authenticate("adminRoot", "root-pass-0000").unwrap();
        assert!(allowed.is_wildcard());
    }

    #[test]
    fn jwt_roundtrip() {
        let allowed = AllowedTenants(vec!["CLA1".into(), "CLA2".into()]);
        let token = generate_jwt("adminCLA", &allowed, "test-secret", 3600).unwrap();
        let claims = validate_jwt(&token, "test-secret").unwrap();
        assert_eq!(claims.sub, "adminCLA");
        assert_eq!(claims.allowed_tenants, vec!["CLA1".to_string(), "CLA2".to_string()]);
        assert_eq!(claims.exp - claims.iat, 3600);
    }

    #[test]
    fn jwt_rejects_wrong_secret() {
        let allowed = AllowedTenants(vec!["CLA1".into()]);
        let token = generate_jwt("adminCLA", &allowed, "correct-secret", 3600).unwrap();
        assert!(validate_jwt(&token, "wrong-secret").is_err());
    }

    #[test]
    fn jwt_rejects_garbage() {
        assert!(validate_jwt("not.a.token", "secret").is_err());
    }

    #[test]
    fn generated_secret_is_64_hex_chars_and_unique() {
        let a = generate_secret().unwrap();
        let b = generate_secret().unwrap();
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[test]
    fn constant_time_eq_respects_equal_and_unequal() {
        assert!(constant_time_eq("abc", "abc"));
        assert!(!constant_time_eq("abc", "abd"));
        assert!(!constant_time_eq("abc", "abcd"));
    }
}
