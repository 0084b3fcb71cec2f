//! Long-term credential authentication of TURN requests

use super::message::Challenge;
use crate::domain::credential::{AuthKey, CredentialStore};
use crate::domain::shared::{RelayError, Result};
use crate::infrastructure::protocols::stun::StunMessage;
use dashmap::DashMap;
use rand::Rng;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Issued nonces and their expiry
pub struct NonceManager {
    nonces: DashMap<String, Instant>,
    lifetime: Duration,
}

impl NonceManager {
    pub fn new(lifetime: Duration) -> Self {
        Self {
            nonces: DashMap::new(),
            lifetime,
        }
    }

    /// Generate and remember a random nonce
    pub fn issue(&self) -> String {
        self.issue_at(Instant::now())
    }

    pub fn issue_at(&self, now: Instant) -> String {
        let mut rng = rand::thread_rng();
        let random_bytes: [u8; 16] = rng.gen();
        let nonce = hex::encode(random_bytes);
        self.nonces.insert(nonce.clone(), now + self.lifetime);
        nonce
    }

    pub fn is_valid(&self, nonce: &str) -> bool {
        self.is_valid_at(nonce, Instant::now())
    }

    pub fn is_valid_at(&self, nonce: &str, now: Instant) -> bool {
        self.nonces
            .get(nonce)
            .map_or(false, |expires_at| *expires_at > now)
    }

    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    pub fn sweep_at(&self, now: Instant) -> usize {
        let before = self.nonces.len();
        self.nonces.retain(|_, expires_at| *expires_at > now);
        before - self.nonces.len()
    }

    pub fn len(&self) -> usize {
        self.nonces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nonces.is_empty()
    }
}

/// An authenticated requester
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub username: String,
    pub key: AuthKey,
}

/// Verifies USERNAME, REALM, NONCE and MESSAGE-INTEGRITY of requests
pub struct Authenticator {
    realm: String,
    credentials: Arc<dyn CredentialStore>,
    nonces: NonceManager,
}

impl Authenticator {
    pub fn new(realm: impl Into<String>, credentials: Arc<dyn CredentialStore>, nonce_lifetime: Duration) -> Self {
        Self {
            realm: realm.into(),
            credentials,
            nonces: NonceManager::new(nonce_lifetime),
        }
    }

    pub fn realm(&self) -> &str {
        &self.realm
    }

    pub fn nonces(&self) -> &NonceManager {
        &self.nonces
    }

    /// Fresh REALM and NONCE for a 401 or 438 response
    pub fn challenge(&self) -> Challenge {
        Challenge {
            realm: self.realm.clone(),
            nonce: self.nonces.issue(),
        }
    }

    /// Authenticate a request; errors map to 400, 401 or 438
    pub fn authenticate(&self, message: &StunMessage) -> Result<Identity> {
        if !message.has_integrity() {
            return Err(RelayError::Unauthorized("missing MESSAGE-INTEGRITY".to_string()));
        }

        let (username, realm, nonce) = match (message.get_username(), message.get_realm(), message.get_nonce()) {
            (Some(username), Some(realm), Some(nonce)) => (username, realm, nonce),
            _ => {
                return Err(RelayError::BadRequest(
                    "MESSAGE-INTEGRITY without USERNAME, REALM and NONCE".to_string(),
                ))
            }
        };

        if !self.nonces.is_valid(nonce) {
            debug!("Stale nonce from {}", username);
            return Err(RelayError::StaleNonce);
        }

        let key = self
            .credentials
            .lookup(username, realm)
            .ok_or_else(|| RelayError::Unauthorized(format!("unknown user {}", username)))?;

        if !message.verify_integrity(&key) {
            debug!("Integrity check failed for {}", username);
            return Err(RelayError::Unauthorized("integrity check failed".to_string()));
        }

        Ok(Identity {
            username: username.to_string(),
            key,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::credential::{generate_auth_key, MockCredentialStore};
    use crate::infrastructure::protocols::stun::{Attribute, Method};
    use mockall::predicate::eq;

    const REALM: &str = "example.org";

    fn authenticator(store: MockCredentialStore) -> Authenticator {
        Authenticator::new(REALM, Arc::new(store), Duration::from_secs(3600))
    }

    fn signed_request(username: &str, nonce: &str, password: &str) -> StunMessage {
        let key = generate_auth_key(username, REALM, password);
        let bytes = StunMessage::new_request(Method::Allocate)
            .with(Attribute::RequestedTransport(17))
            .with(Attribute::Username(username.to_string()))
            .with(Attribute::Realm(REALM.to_string()))
            .with(Attribute::Nonce(nonce.to_string()))
            .encode(Some(&key))
            .unwrap();
        StunMessage::from_bytes(&bytes).unwrap()
    }

    #[test]
    fn test_authenticate_success() {
        let mut store = MockCredentialStore::new();
        store
            .expect_lookup()
            .with(eq("alice"), eq(REALM))
            .times(1)
            .returning(|_, _| Some(generate_auth_key("alice", REALM, "secret")));
        let auth = authenticator(store);
        let nonce = auth.challenge().nonce;

        let identity = auth.authenticate(&signed_request("alice", &nonce, "secret")).unwrap();
        assert_eq!(identity.username, "alice");
        assert_eq!(identity.key, generate_auth_key("alice", REALM, "secret"));
    }

    #[test]
    fn test_missing_integrity_is_unauthorized() {
        let auth = authenticator(MockCredentialStore::new());
        let bytes = StunMessage::new_request(Method::Allocate).encode(None).unwrap();
        let message = StunMessage::from_bytes(&bytes).unwrap();

        assert!(matches!(auth.authenticate(&message), Err(RelayError::Unauthorized(_))));
    }

    #[test]
    fn test_unknown_nonce_is_stale() {
        let auth = authenticator(MockCredentialStore::new());
        let message = signed_request("alice", "not-issued", "secret");
        assert_eq!(auth.authenticate(&message), Err(RelayError::StaleNonce));
    }

    #[test]
    fn test_wrong_password_and_unknown_user() {
        let mut store = MockCredentialStore::new();
        store
            .expect_lookup()
            .returning(|username, _| match username {
                "alice" => Some(generate_auth_key("alice", REALM, "secret")),
                _ => None,
            });
        let auth = authenticator(store);
        let nonce = auth.challenge().nonce;

        assert!(matches!(
            auth.authenticate(&signed_request("alice", &nonce, "guess")),
            Err(RelayError::Unauthorized(_))
        ));
        assert!(matches!(
            auth.authenticate(&signed_request("mallory", &nonce, "secret")),
            Err(RelayError::Unauthorized(_))
        ));
    }

    #[test]
    fn test_nonce_expiry_and_sweep() {
        let nonces = NonceManager::new(Duration::from_secs(10));
        let now = Instant::now();
        let nonce = nonces.issue_at(now);

        assert!(nonces.is_valid_at(&nonce, now + Duration::from_secs(9)));
        assert!(!nonces.is_valid_at(&nonce, now + Duration::from_secs(10)));
        assert_eq!(nonces.sweep_at(now + Duration::from_secs(10)), 1);
        assert!(nonces.is_empty());
    }
}
