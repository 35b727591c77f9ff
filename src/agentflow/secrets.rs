//! Process-wide secret store.
//!
//! Populated once at boot, frozen thereafter, the same two-phase
//! lifecycle as the callback registry. Lookups consult the environment
//! first (`PLATFORM_{NAME_UPPER}`) so deployments can override packaged
//! values without touching code, then fall back to the in-process map.

use lazy_static::lazy_static;
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::sync::RwLock;

/// Env-var prefix for secret overrides.
pub const ENV_PREFIX: &str = "PLATFORM_";

/// Secret store failures.
#[derive(Debug, Clone)]
pub enum SecretError {
    /// Writes after boot are not permitted.
    Frozen,
    /// Registration with an empty name.
    EmptyName,
}

impl fmt::Display for SecretError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SecretError::Frozen => write!(f, "secret store is frozen; writes happen at boot"),
            SecretError::EmptyName => write!(f, "secret name must be non-empty"),
        }
    }
}

impl Error for SecretError {}

struct Store {
    values: HashMap<String, String>,
    frozen: bool,
}

lazy_static! {
    static ref SECRETS: RwLock<Store> = RwLock::new(Store {
        values: HashMap::new(),
        frozen: false,
    });
}

/// Store a secret. Boot-time only.
pub fn set_secret(name: &str, value: impl Into<String>) -> Result<(), SecretError> {
    if name.trim().is_empty() {
        return Err(SecretError::EmptyName);
    }
    let mut guard = SECRETS.write().unwrap_or_else(|e| e.into_inner());
    if guard.frozen {
        return Err(SecretError::Frozen);
    }
    guard.values.insert(name.to_string(), value.into());
    Ok(())
}

/// Look up a secret: `PLATFORM_{NAME_UPPER}` from the environment first,
/// then the in-process map.
pub fn get_secret(name: &str) -> Option<String> {
    let env_key = format!(
        "{}{}",
        ENV_PREFIX,
        name.to_ascii_uppercase().replace('-', "_")
    );
    if let Ok(value) = std::env::var(&env_key) {
        return Some(value);
    }
    SECRETS
        .read()
        .unwrap_or_else(|e| e.into_inner())
        .values
        .get(name)
        .cloned()
}

/// Freeze the store. Called once when boot completes.
pub fn freeze() {
    SECRETS.write().unwrap_or_else(|e| e.into_inner()).frozen = true;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_wins_over_the_map() {
        set_secret("api-token", "from-map").unwrap();
        assert_eq!(get_secret("api-token").as_deref(), Some("from-map"));

        std::env::set_var("PLATFORM_API_TOKEN", "from-env");
        assert_eq!(get_secret("api-token").as_deref(), Some("from-env"));
        std::env::remove_var("PLATFORM_API_TOKEN");
    }

    #[test]
    fn unknown_secret_is_none() {
        assert!(get_secret("never-registered-anywhere").is_none());
    }
}
