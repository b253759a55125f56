//! Server configuration
//!
//! All knobs load from environment variables with sensible defaults, so the
//! binary runs with no arguments. Durations accept bare seconds (`90`) or a
//! unit suffix (`90s`, `2m`, `1h`).

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Complete server configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP bind address (control API + playback)
    pub http_addr: SocketAddr,

    /// RTMP bind address (ingest)
    pub rtmp_addr: SocketAddr,

    /// Public RTMP URL base advertised in publish responses
    pub rtmp_ingest_url: String,

    /// Accepted RTMP application name
    pub rtmp_app: String,

    /// Local storage root for segments
    pub storage_dir: PathBuf,

    /// Closing-tick period for the segmenter
    pub segment_duration: Duration,

    /// Sliding-window size (segments kept per stream)
    pub max_segments: usize,

    /// Token TTL when the publish request does not specify one
    pub default_token_ttl: Duration,

    /// Hard cap on requested token TTLs
    pub max_token_ttl: Duration,

    /// Reject publishes that present no token
    pub require_publish_token: bool,

    /// Maximum concurrent ingest connections (0 = unlimited)
    pub max_concurrent_streams: usize,

    /// Maximum subscribers per stream
    pub max_viewers_per_stream: usize,

    /// Per-subscriber frame channel capacity
    pub subscriber_buffer: usize,

    /// Chunk size announced to RTMP peers
    pub chunk_size: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_addr: "0.0.0.0:8080".parse().unwrap(),
            rtmp_addr: "0.0.0.0:1935".parse().unwrap(),
            rtmp_ingest_url: "rtmp://localhost:1935".into(),
            rtmp_app: "live".into(),
            storage_dir: "./data/streams".into(),
            segment_duration: Duration::from_secs(2),
            max_segments: 10,
            default_token_ttl: Duration::from_secs(3600),
            max_token_ttl: Duration::from_secs(24 * 3600),
            require_publish_token: true,
            max_concurrent_streams: 100,
            max_viewers_per_stream: 1000,
            subscriber_buffer: 1000,
            chunk_size: 4096,
        }
    }
}

impl Config {
    /// Load configuration from the environment, falling back to defaults
    /// for unset or unparseable variables.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            http_addr: env_parse("HTTP_ADDR", d.http_addr),
            rtmp_addr: env_parse("RTMP_ADDR", d.rtmp_addr),
            rtmp_ingest_url: env_string("RTMP_INGEST_URL", &d.rtmp_ingest_url),
            rtmp_app: env_string("RTMP_APP", &d.rtmp_app),
            storage_dir: env_string("STORAGE_DIR", "./data/streams").into(),
            segment_duration: env_duration("HLS_SEGMENT_DURATION", d.segment_duration),
            max_segments: env_parse("HLS_MAX_SEGMENTS", d.max_segments),
            default_token_ttl: env_duration("DEFAULT_TOKEN_TTL", d.default_token_ttl),
            max_token_ttl: env_duration("MAX_TOKEN_TTL", d.max_token_ttl),
            require_publish_token: env_parse("REQUIRE_PUBLISH_TOKEN", d.require_publish_token),
            max_concurrent_streams: env_parse("MAX_CONCURRENT_STREAMS", d.max_concurrent_streams),
            max_viewers_per_stream: env_parse("MAX_VIEWERS_PER_STREAM", d.max_viewers_per_stream),
            subscriber_buffer: env_parse("SUBSCRIBER_BUFFER", d.subscriber_buffer),
            chunk_size: env_parse("RTMP_CHUNK_SIZE", d.chunk_size),
        }
    }
}

fn env_string(key: &str, default: &str) -> String {
    match std::env::var(key) {
        Ok(v) if !v.is_empty() => v,
        _ => default.to_string(),
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(v) => v.parse().unwrap_or(default),
        Err(_) => default,
    }
}

fn env_duration(key: &str, default: Duration) -> Duration {
    match std::env::var(key) {
        Ok(v) => parse_duration(&v).unwrap_or(default),
        Err(_) => default,
    }
}

/// Parse `"90"`, `"90s"`, `"2m"`, or `"1h"` into a [`Duration`].
fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    let (digits, unit) = match s.find(|c: char| !c.is_ascii_digit()) {
        Some(idx) => s.split_at(idx),
        None => (s, ""),
    };
    let value: u64 = digits.parse().ok()?;
    let secs = match unit {
        "" | "s" => value,
        "m" => value * 60,
        "h" => value * 3600,
        _ => return None,
    };
    Some(Duration::from_secs(secs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.rtmp_addr.port(), 1935);
        assert_eq!(config.http_addr.port(), 8080);
        assert_eq!(config.segment_duration, Duration::from_secs(2));
        assert_eq!(config.max_segments, 10);
        assert!(config.require_publish_token);
    }

    #[test]
    fn test_parse_duration_units() {
        assert_eq!(parse_duration("90"), Some(Duration::from_secs(90)));
        assert_eq!(parse_duration("90s"), Some(Duration::from_secs(90)));
        assert_eq!(parse_duration("2m"), Some(Duration::from_secs(120)));
        assert_eq!(parse_duration("1h"), Some(Duration::from_secs(3600)));
        assert_eq!(parse_duration("abc"), None);
        assert_eq!(parse_duration("5d"), None);
    }
}
