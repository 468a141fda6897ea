//! Access gate: resolves the caller behind a bearer token to a principal
//! and role.
//!
//! API keys are hashed at load time and compared in constant time. When no
//! keys are configured authentication is disabled and every caller is
//! treated as an anonymous administrator.

use actix_web::{http::header, HttpRequest};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::config::ConfigError;
use crate::error::{GatewayError, GatewayResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Signed up but not yet approved; may not use the gateway.
    Pending,
    /// Standard access to inference and retrieval.
    #[default]
    User,
    /// Standard access plus model management and configuration.
    Admin,
}

impl Role {
    pub fn is_admin(&self) -> bool {
        matches!(self, Role::Admin)
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Role::User | Role::Admin)
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Pending => write!(f, "pending"),
            Role::User => write!(f, "user"),
            Role::Admin => write!(f, "admin"),
        }
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(Role::Pending),
            "user" => Ok(Role::User),
            "admin" => Ok(Role::Admin),
            _ => Err(format!(
                "Invalid role: {}. Valid roles: admin, user, pending",
                s
            )),
        }
    }
}

fn hash_api_key(key: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    hasher.finalize().into()
}

/// API key with its assigned role. Only the SHA-256 hash is kept.
#[derive(Clone, Serialize, Deserialize)]
pub struct ApiKeyEntry {
    pub id: String,
    #[serde(skip)]
    key_hash: [u8; 32],
    #[serde(default)]
    pub role: Role,
}

impl std::fmt::Debug for ApiKeyEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiKeyEntry")
            .field("id", &self.id)
            .field("key_hash", &"[REDACTED]")
            .field("role", &self.role)
            .finish()
    }
}

impl ApiKeyEntry {
    pub fn new(id: impl Into<String>, key: impl Into<String>, role: Role) -> Self {
        Self {
            id: id.into(),
            key_hash: hash_api_key(&key.into()),
            role,
        }
    }

    /// Parses the `<role>:<key>` command line form.
    pub fn parse(id: impl Into<String>, arg: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidValue {
            field: "api_key".to_string(),
            value: "[REDACTED]".to_string(),
            reason: reason.to_string(),
        };

        let (role, key) = arg
            .split_once(':')
            .ok_or_else(|| invalid("Expected <role>:<key>"))?;
        let role = role.parse::<Role>().map_err(|e| invalid(&e))?;
        if key.is_empty() {
            return Err(invalid("Key must not be empty"));
        }
        Ok(Self::new(id, key, role))
    }

    pub fn verify(&self, key: &str) -> bool {
        let provided_hash = hash_api_key(key);
        self.key_hash.ct_eq(&provided_hash).into()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub api_keys: Vec<ApiKeyEntry>,
}

impl AuthConfig {
    pub fn is_enabled(&self) -> bool {
        !self.api_keys.is_empty()
    }

    pub fn find_api_key(&self, key: &str) -> Option<&ApiKeyEntry> {
        // No early exit, so lookup time does not reveal which entry matched.
        let mut found = None;
        for entry in &self.api_keys {
            if entry.verify(key) {
                found = Some(entry);
            }
        }
        found
    }
}

/// Authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub id: String,
    pub role: Role,
}

impl Principal {
    pub fn new(id: impl Into<String>, role: Role) -> Self {
        Self {
            id: id.into(),
            role,
        }
    }

    pub fn anonymous() -> Self {
        Self::new("anonymous", Role::Admin)
    }
}

/// Resolves inbound credentials. `None` means unauthenticated.
pub trait AccessGate: Send + Sync {
    fn identify(&self, bearer_token: Option<&str>) -> Option<Principal>;
}

#[derive(Debug, Clone, Default)]
pub struct ApiKeyGate {
    config: AuthConfig,
}

impl ApiKeyGate {
    pub fn new(config: AuthConfig) -> Self {
        Self { config }
    }

    pub fn is_auth_required(&self) -> bool {
        self.config.is_enabled()
    }
}

impl AccessGate for ApiKeyGate {
    fn identify(&self, bearer_token: Option<&str>) -> Option<Principal> {
        if !self.is_auth_required() {
            return Some(Principal::anonymous());
        }
        let entry = self.config.find_api_key(bearer_token?)?;
        Some(Principal::new(entry.id.clone(), entry.role))
    }
}

pub fn bearer_token(req: &HttpRequest) -> Option<&str> {
    req.headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
}

/// Admits any approved caller.
pub fn require_user(principal: Option<Principal>) -> GatewayResult<Principal> {
    match principal {
        Some(principal) if principal.role.is_active() => Ok(principal),
        _ => Err(GatewayError::access_prohibited()),
    }
}

pub fn require_admin(principal: Option<Principal>) -> GatewayResult<Principal> {
    match principal {
        Some(principal) if principal.role.is_admin() => Ok(principal),
        _ => Err(GatewayError::access_prohibited()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate() -> ApiKeyGate {
        ApiKeyGate::new(AuthConfig {
            api_keys: vec![
                ApiKeyEntry::new("admin-1", "sk-admin", Role::Admin),
                ApiKeyEntry::new("user-1", "sk-user", Role::User),
                ApiKeyEntry::new("pending-1", "sk-pending", Role::Pending),
            ],
        })
    }

    #[test]
    fn test_role_parsing() {
        assert_eq!("admin".parse::<Role>().unwrap(), Role::Admin);
        assert_eq!("USER".parse::<Role>().unwrap(), Role::User);
        assert_eq!("pending".parse::<Role>().unwrap(), Role::Pending);
        assert!("root".parse::<Role>().is_err());
    }

    #[test]
    fn test_identify_by_key() {
        let gate = gate();
        assert_eq!(
            gate.identify(Some("sk-admin")),
            Some(Principal::new("admin-1", Role::Admin))
        );
        assert_eq!(
            gate.identify(Some("sk-user")),
            Some(Principal::new("user-1", Role::User))
        );
        assert_eq!(gate.identify(Some("sk-wrong")), None);
        assert_eq!(gate.identify(None), None);
    }

    #[test]
    fn test_no_keys_disables_auth() {
        let gate = ApiKeyGate::default();
        assert!(!gate.is_auth_required());
        assert_eq!(gate.identify(None), Some(Principal::anonymous()));
    }

    #[test]
    fn test_require_user_rejects_pending_and_anonymous() {
        let gate = gate();
        assert!(require_user(gate.identify(Some("sk-user"))).is_ok());
        assert!(require_user(gate.identify(Some("sk-admin"))).is_ok());
        assert!(require_user(gate.identify(Some("sk-pending"))).is_err());
        assert!(require_user(gate.identify(None)).is_err());
    }

    #[test]
    fn test_require_admin() {
        let gate = gate();
        assert!(require_admin(gate.identify(Some("sk-admin"))).is_ok());
        assert!(require_admin(gate.identify(Some("sk-user"))).is_err());
    }

    #[test]
    fn test_parse_api_key_spec() {
        let entry = ApiKeyEntry::parse("key-0", "admin:sk-secret").unwrap();
        assert_eq!(entry.role, Role::Admin);
        assert!(entry.verify("sk-secret"));

        // Keys may themselves contain colons.
        let entry = ApiKeyEntry::parse("key-1", "user:a:b").unwrap();
        assert!(entry.verify("a:b"));

        assert!(ApiKeyEntry::parse("key-2", "sk-secret").is_err());
        assert!(ApiKeyEntry::parse("key-3", "owner:sk").is_err());
        assert!(ApiKeyEntry::parse("key-4", "user:").is_err());
    }

    #[test]
    fn test_api_key_debug_redacts_hash() {
        let entry = ApiKeyEntry::new("test", "secret", Role::Admin);
        let debug_str = format!("{:?}", entry);
        assert!(debug_str.contains("[REDACTED]"));
        assert!(!debug_str.contains("secret"));
    }
}
