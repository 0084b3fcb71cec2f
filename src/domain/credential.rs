//! Long-term credential store
//!
//! Maps a username (scoped to a realm) to the long-term key used to verify
//! MESSAGE-INTEGRITY. The key is `MD5(username ":" realm ":" password)`.

use super::shared::{RelayError, Result};
use std::collections::HashMap;

/// Long-term authentication key
pub type AuthKey = [u8; 16];

/// Derive the long-term key for a username/realm/password triple
pub fn generate_auth_key(username: &str, realm: &str, password: &str) -> AuthKey {
    md5::compute(format!("{}:{}:{}", username, realm, password)).0
}

/// Credential lookup used by request authentication
#[cfg_attr(test, mockall::automock)]
pub trait CredentialStore: Send + Sync {
    /// Look up the key for `username` in `realm`; `None` when unknown
    fn lookup(&self, username: &str, realm: &str) -> Option<AuthKey>;
}

/// In-memory credential store for a single realm
#[derive(Debug, Clone)]
pub struct StaticCredentialStore {
    realm: String,
    keys: HashMap<String, AuthKey>,
}

impl StaticCredentialStore {
    pub fn new(realm: impl Into<String>) -> Self {
        Self {
            realm: realm.into(),
            keys: HashMap::new(),
        }
    }

    /// Build a store from a `user=pass` list separated by commas, semicolons or whitespace
    pub fn from_users(realm: impl Into<String>, users: &str) -> Result<Self> {
        let mut store = Self::new(realm);
        for (username, password) in parse_user_pairs(users)? {
            store.add_user(username, password);
        }
        Ok(store)
    }

    pub fn add_user(&mut self, username: &str, password: &str) {
        let key = generate_auth_key(username, &self.realm, password);
        self.keys.insert(username.to_string(), key);
    }

    pub fn realm(&self) -> &str {
        &self.realm
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl CredentialStore for StaticCredentialStore {
    fn lookup(&self, username: &str, realm: &str) -> Option<AuthKey> {
        if realm != self.realm {
            return None;
        }
        self.keys.get(username).copied()
    }
}

/// Split a `user=pass` list into pairs
pub fn parse_user_pairs(users: &str) -> Result<Vec<(&str, &str)>> {
    users
        .split(|c: char| c == ',' || c == ';' || c.is_whitespace())
        .filter(|entry| !entry.is_empty())
        .map(|entry| match entry.split_once('=') {
            Some((user, pass)) if !user.is_empty() && !pass.is_empty() => Ok((user, pass)),
            _ => Err(RelayError::BadRequest(format!(
                "malformed user entry '{}', expected user=pass",
                entry
            ))),
        })
        .collect()
}
