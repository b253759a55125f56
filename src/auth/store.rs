//! In-memory token store
//!
//! Tokens are short-lived and few, so a single keyed map behind one mutex is
//! sufficient; every operation is atomic with respect to the others. A
//! periodic sweeper purges entries one minute past expiry so the map stays
//! bounded even when tokens are never presented.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use rand::RngCore;
use tokio::time::Instant;

use super::token::PublishToken;
use crate::error::AuthError;
use crate::registry::StreamKey;

/// Extra lifetime past expiry before a token is purged from memory
const PURGE_GRACE: Duration = Duration::from_secs(60);

/// Sweeper cadence
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Token entropy in bytes (hex-encoded to 64 characters)
const TOKEN_BYTES: usize = 32;

/// Token store configuration
#[derive(Debug, Clone)]
pub struct TokenStoreConfig {
    /// TTL used when the request does not specify one
    pub default_ttl: Duration,
    /// Hard cap on requested TTLs
    pub max_ttl: Duration,
    /// Reject publishers whose address differs from the requesting one
    pub bind_publisher_ip: bool,
}

impl Default for TokenStoreConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(3600),
            max_ttl: Duration::from_secs(24 * 3600),
            bind_publisher_ip: false,
        }
    }
}

/// Issues, validates, and consumes publish tokens
pub struct TokenStore {
    tokens: Mutex<HashMap<String, PublishToken>>,
    config: TokenStoreConfig,
}

impl TokenStore {
    pub fn new(config: TokenStoreConfig) -> Self {
        Self {
            tokens: Mutex::new(HashMap::new()),
            config,
        }
    }

    /// Mint a token for `stream_key`.
    ///
    /// A zero `requested_ttl` (or `None`) selects the default TTL; anything
    /// longer than the configured maximum is clamped down to it.
    pub fn issue(
        &self,
        stream_key: StreamKey,
        requested_ttl: Option<Duration>,
        publisher_hint: Option<IpAddr>,
    ) -> Result<PublishToken, AuthError> {
        let ttl = match requested_ttl {
            Some(ttl) if !ttl.is_zero() => ttl.min(self.config.max_ttl),
            _ => self.config.default_ttl,
        };

        let mut raw = [0u8; TOKEN_BYTES];
        rand::rngs::OsRng
            .try_fill_bytes(&mut raw)
            .map_err(|_| AuthError::TokenGeneration)?;

        let now = Utc::now();
        let token = PublishToken {
            token: hex::encode(raw),
            stream_key,
            created_at: now,
            expires_at: now + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::zero()),
            deadline: Instant::now() + ttl,
            publisher_hint,
            consumed: false,
        };

        let mut tokens = self.tokens.lock().unwrap();
        tokens.insert(token.token.clone(), token.clone());

        tracing::info!(
            stream = %token.stream_key,
            ttl_secs = ttl.as_secs(),
            "publish token issued"
        );
        Ok(token)
    }

    /// Check a token without consuming it.
    pub fn validate(
        &self,
        token: &str,
        stream_key: &StreamKey,
        publisher_addr: Option<IpAddr>,
    ) -> Result<(), AuthError> {
        let tokens = self.tokens.lock().unwrap();
        self.check(&tokens, token, stream_key, publisher_addr)
            .map(|_| ())
    }

    /// Atomically validate and consume: at most one caller ever succeeds for
    /// a given token, even under concurrent admission attempts.
    pub fn validate_and_consume(
        &self,
        token: &str,
        stream_key: &StreamKey,
        publisher_addr: Option<IpAddr>,
    ) -> Result<(), AuthError> {
        let mut tokens = self.tokens.lock().unwrap();
        self.check(&tokens, token, stream_key, publisher_addr)?;
        if let Some(entry) = tokens.get_mut(token) {
            entry.consumed = true;
        }
        Ok(())
    }

    /// Mark a token used without validating the binding.
    pub fn consume(&self, token: &str) {
        let mut tokens = self.tokens.lock().unwrap();
        if let Some(entry) = tokens.get_mut(token) {
            entry.consumed = true;
        }
    }

    /// Purge every token one minute past its expiry. Returns the number
    /// removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut tokens = self.tokens.lock().unwrap();
        let before = tokens.len();
        tokens.retain(|_, t| now < t.deadline + PURGE_GRACE);
        before - tokens.len()
    }

    /// Number of tokens currently held
    pub fn len(&self) -> usize {
        self.tokens.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Spawn the periodic sweeper.
    pub fn spawn_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                ticker.tick().await;
                let purged = store.sweep();
                if purged > 0 {
                    tracing::debug!(purged, "expired tokens swept");
                }
            }
        })
    }

    fn check(
        &self,
        tokens: &HashMap<String, PublishToken>,
        token: &str,
        stream_key: &StreamKey,
        publisher_addr: Option<IpAddr>,
    ) -> Result<(), AuthError> {
        let entry = tokens.get(token).ok_or(AuthError::UnknownToken)?;

        if entry.consumed {
            return Err(AuthError::AlreadyUsed);
        }
        if !entry.is_valid(Instant::now()) {
            return Err(AuthError::Expired);
        }
        if &entry.stream_key != stream_key {
            return Err(AuthError::WrongStream);
        }
        if self.config.bind_publisher_ip {
            if let (Some(hint), Some(addr)) = (entry.publisher_hint, publisher_addr) {
                if hint != addr {
                    return Err(AuthError::WrongPublisher);
                }
            }
        }
        Ok(())
    }
}
