//! Publish token model

use std::net::IpAddr;

use chrono::{DateTime, Utc};
use tokio::time::Instant;

use crate::registry::StreamKey;

/// A single-use publish token bound to one stream key
#[derive(Debug, Clone)]
pub struct PublishToken {
    /// Opaque token string: 32 random bytes, hex-encoded (256 bits)
    pub token: String,
    /// Stream key this token authorizes
    pub stream_key: StreamKey,
    pub created_at: DateTime<Utc>,
    /// Wall-clock expiry, reported to API clients
    pub expires_at: DateTime<Utc>,
    /// Monotonic expiry used for validation
    pub(super) deadline: Instant,
    /// Address that requested the token; checked only when IP binding is on
    pub publisher_hint: Option<IpAddr>,
    pub(super) consumed: bool,
}

impl PublishToken {
    /// Valid means not consumed and not past its deadline.
    pub(super) fn is_valid(&self, now: Instant) -> bool {
        !self.consumed && now < self.deadline
    }
}
