//! Login credential checks.

use std::collections::HashMap;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha256};

use parley_core::ids::UserId;

#[async_trait]
pub trait AuthVerifier: Send + Sync {
    async fn verify(&self, user: &UserId, token: &str) -> bool;
}

/// Accepts every login.
#[derive(Clone, Copy, Debug, Default)]
pub struct AllowAll;

#[async_trait]
impl AuthVerifier for AllowAll {
    async fn verify(&self, _user: &UserId, _token: &str) -> bool {
        true
    }
}

/// Fixed user -> token table. Users missing from the table are rejected.
pub struct TokenTable {
    tokens: HashMap<UserId, SecretString>,
}

impl TokenTable {
    pub fn new(tokens: impl IntoIterator<Item = (UserId, SecretString)>) -> Self {
        Self {
            tokens: tokens.into_iter().collect(),
        }
    }
}

#[async_trait]
impl AuthVerifier for TokenTable {
    async fn verify(&self, user: &UserId, token: &str) -> bool {
        let Some(expected) = self.tokens.get(user) else {
            return false;
        };
        // Compare fixed-size digests rather than the raw strings.
        Sha256::digest(expected.expose_secret().as_bytes()) == Sha256::digest(token.as_bytes())
    }
}
