//! Handshake credentials.
//!
//! The hub asks a [`CredentialValidator`] whether the first text frame of a
//! connection is acceptable. [`TokenStore`] issues single-use one-time
//! passwords that expire after a fixed lifetime.

use std::time::{Duration, Instant};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use dashmap::DashMap;
use rand::RngCore;

/// Default OTP lifetime.
pub const OTP_TTL: Duration = Duration::from_secs(10 * 60);

const OTP_BYTES: usize = 16;

pub trait CredentialValidator: Send + Sync {
    /// Whether `token` admits a connection. May consume the token.
    fn validate(&self, token: &str) -> bool;
}

/// Single-use OTPs, keyed by token, valued by expiry.
pub struct TokenStore {
    tokens: DashMap<String, Instant>,
    ttl: Duration,
}

impl TokenStore {
    pub fn new() -> Self {
        Self::with_ttl(OTP_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            tokens: DashMap::new(),
            ttl,
        }
    }

    /// Issue a fresh OTP: 16 random bytes, URL-safe base64.
    pub fn issue_otp(&self) -> String {
        let mut raw = [0u8; OTP_BYTES];
        rand::thread_rng().fill_bytes(&mut raw);
        let token = URL_SAFE_NO_PAD.encode(raw);
        self.tokens.insert(token.clone(), Instant::now() + self.ttl);
        tracing::debug!(outstanding = self.tokens.len(), "otp issued");
        token
    }

    /// Drop expired tokens. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.tokens.len();
        self.tokens.retain(|_, expires| *expires > now);
        before - self.tokens.len()
    }

    pub fn outstanding(&self) -> usize {
        self.tokens.len()
    }
}

impl Default for TokenStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialValidator for TokenStore {
    fn validate(&self, token: &str) -> bool {
        match self.tokens.remove(token) {
            Some((_, expires)) => expires > Instant::now(),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn otp_is_single_use() {
        let store = TokenStore::new();
        let otp = store.issue_otp();
        assert_eq!(otp.len(), 22);
        assert!(store.validate(&otp));
        assert!(!store.validate(&otp));
    }

    #[test]
    fn unknown_token_rejected() {
        let store = TokenStore::new();
        store.issue_otp();
        assert!(!store.validate("not-a-token"));
        assert!(!store.validate(""));
        assert_eq!(store.outstanding(), 1);
    }

    #[test]
    fn expired_token_rejected_and_purged() {
        let store = TokenStore::with_ttl(Duration::ZERO);
        let a = store.issue_otp();
        store.issue_otp();
        std::thread::sleep(Duration::from_millis(5));
        assert!(!store.validate(&a));
        assert_eq!(store.purge_expired(), 1);
        assert_eq!(store.outstanding(), 0);
    }

    #[test]
    fn otps_are_distinct() {
        let store = TokenStore::new();
        let a = store.issue_otp();
        let b = store.issue_otp();
        assert_ne!(a, b);
    }
}
