use crate::error::{SessionError, SessionResult};
use chrono::Duration as ChronoDuration;
use serde::Deserialize;
use std::time::Duration;

/// Minimum accepted secret key length, in bytes.
pub const MIN_SECRET_KEY_LEN: usize = 32;

/// Upper bound for every duration setting (100 years).
pub const MAX_DURATION_SECS: u64 = 100 * 365 * 24 * 60 * 60;

/// Process-wide session configuration.
///
/// Built once at startup and shared read-only (`Arc<SessionConfig>`) with every
/// component.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// Key used to authenticate stored payloads. `None` disables authentication.
    #[serde(default)]
    pub secret_key: Option<String>,
    /// Maximum idle time since the last write before a session is stale.
    #[serde(default = "default_max_age_secs")]
    pub max_age_secs: u64,
    /// Maximum total lifetime since creation, regardless of activity.
    #[serde(default)]
    pub max_stale_secs: Option<u64>,
    /// Reject stale or unknown sessions instead of issuing a new one.
    #[serde(default)]
    pub strict_staleness: bool,
    /// Keyspace prefix for session records.
    #[serde(default = "default_namespace", alias = "table_name")]
    pub namespace: String,
    /// Extra commit attempts after a version conflict or ID collision.
    #[serde(default = "default_retry_bound")]
    pub retry_bound: u32,
    /// Overall store deadline per request.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Re-write read-only sessions whose last write is older than this.
    #[serde(default)]
    pub refresh_after_secs: Option<u64>,
    /// Interval of the background garbage collection sweep. `0` disables it.
    #[serde(default = "default_gc_interval_secs")]
    pub gc_interval_secs: u64,
    /// Session cookie attributes.
    #[serde(default)]
    pub cookie: CookieConfig,
}

/// `SameSite` cookie attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SameSitePolicy {
    /// `SameSite=Strict`
    Strict,
    /// `SameSite=Lax`
    Lax,
    /// `SameSite=None`
    None,
}

/// Attributes of the session cookie.
#[derive(Debug, Clone, Deserialize)]
pub struct CookieConfig {
    /// Cookie name.
    #[serde(default = "default_cookie_name")]
    pub name: String,
    /// Emit the `Secure` attribute.
    #[serde(default = "default_true")]
    pub secure: bool,
    /// `SameSite` attribute.
    #[serde(default = "default_same_site")]
    pub same_site: SameSitePolicy,
    /// `Path` attribute.
    #[serde(default = "default_cookie_path")]
    pub path: String,
    /// Optional `Domain` attribute.
    #[serde(default)]
    pub domain: Option<String>,
}

impl Default for CookieConfig {
    fn default() -> Self {
        Self {
            name: default_cookie_name(),
            secure: true,
            same_site: default_same_site(),
            path: default_cookie_path(),
            domain: None,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            secret_key: None,
            max_age_secs: default_max_age_secs(),
            max_stale_secs: None,
            strict_staleness: false,
            namespace: default_namespace(),
            retry_bound: default_retry_bound(),
            request_timeout_ms: default_request_timeout_ms(),
            refresh_after_secs: None,
            gc_interval_secs: default_gc_interval_secs(),
            cookie: CookieConfig::default(),
        }
    }
}

fn default_max_age_secs() -> u64 {
    24 * 60 * 60
}
fn default_namespace() -> String {
    "sessions".to_string()
}
fn default_retry_bound() -> u32 {
    3
}
fn default_request_timeout_ms() -> u64 {
    5_000
}
fn default_gc_interval_secs() -> u64 {
    300
}
fn default_cookie_name() -> String {
    "session_id".to_string()
}
fn default_true() -> bool {
    true
}
fn default_same_site() -> SameSitePolicy {
    SameSitePolicy::Lax
}
fn default_cookie_path() -> String {
    "/".to_string()
}

impl SessionConfig {
    /// Check the configuration for values no deployment can run with.
    pub fn validate(&self) -> SessionResult<()> {
        if self.max_age_secs == 0 {
            return Err(SessionError::Config("max_age_secs must be > 0".into()));
        }
        if self.request_timeout_ms == 0 {
            return Err(SessionError::Config("request_timeout_ms must be > 0".into()));
        }
        let durations = [
            Some(self.max_age_secs),
            self.max_stale_secs,
            self.refresh_after_secs,
        ];
        if durations.iter().flatten().any(|secs| *secs > MAX_DURATION_SECS) {
            return Err(SessionError::Config(format!(
                "durations must not exceed {MAX_DURATION_SECS} seconds"
            )));
        }
        if let Some(max_stale) = self.max_stale_secs {
            if max_stale < self.max_age_secs {
                return Err(SessionError::Config(format!(
                    "max_stale_secs ({max_stale}) must be >= max_age_secs ({})",
                    self.max_age_secs
                )));
            }
        }
        if let Some(key) = &self.secret_key {
            if key.len() < MIN_SECRET_KEY_LEN {
                return Err(SessionError::Config(format!(
                    "secret_key must be at least {MIN_SECRET_KEY_LEN} bytes"
                )));
            }
        }
        if self.namespace.is_empty() {
            return Err(SessionError::Config("namespace must not be empty".into()));
        }
        if self.cookie.name.is_empty() {
            return Err(SessionError::Config("cookie.name must not be empty".into()));
        }
        if self.cookie.same_site == SameSitePolicy::None && !self.cookie.secure {
            return Err(SessionError::Config(
                "cookie.same_site = \"none\" requires cookie.secure = true".into(),
            ));
        }
        Ok(())
    }

    /// Idle lifetime as a chrono duration.
    pub fn max_age(&self) -> ChronoDuration {
        ChronoDuration::seconds(clamp_secs(self.max_age_secs))
    }

    /// Absolute lifetime, if configured.
    pub fn max_stale(&self) -> Option<ChronoDuration> {
        self.max_stale_secs
            .map(|secs| ChronoDuration::seconds(clamp_secs(secs)))
    }

    /// Rolling refresh threshold, if configured.
    pub fn refresh_after(&self) -> Option<ChronoDuration> {
        self.refresh_after_secs
            .map(|secs| ChronoDuration::seconds(clamp_secs(secs)))
    }

    /// Per-request store deadline.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Number of commit attempts, the first one included.
    pub fn max_attempts(&self) -> u32 {
        self.retry_bound.saturating_add(1)
    }
}

fn clamp_secs(secs: u64) -> i64 {
    i64::try_from(secs.min(MAX_DURATION_SECS)).unwrap_or(i64::MAX / 1_000)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = SessionConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.cookie.name, "session_id");
        assert_eq!(config.retry_bound, 3);
        assert_eq!(config.max_attempts(), 4);
        assert!(!config.strict_staleness);
    }

    #[test]
    fn test_deserialize_with_legacy_table_name() {
        let config: SessionConfig = toml::from_str(
            r#"
            table_name = "web_sessions"
            max_age_secs = 600
            strict_staleness = true

            [cookie]
            same_site = "strict"
            secure = false
            "#,
        )
        .unwrap();
        assert_eq!(config.namespace, "web_sessions");
        assert_eq!(config.max_age_secs, 600);
        assert!(config.strict_staleness);
        assert_eq!(config.cookie.same_site, SameSitePolicy::Strict);
        assert!(!config.cookie.secure);
        assert_eq!(config.cookie.path, "/");
    }

    #[test]
    fn test_rejects_short_secret() {
        let config = SessionConfig {
            secret_key: Some("too-short".into()),
            ..SessionConfig::default()
        };
        assert!(matches!(config.validate(), Err(SessionError::Config(_))));
    }

    #[test]
    fn test_same_site_none_requires_secure() {
        let mut config = SessionConfig::default();
        config.cookie.same_site = SameSitePolicy::None;
        assert!(config.validate().is_ok());

        config.cookie.secure = false;
        assert!(matches!(config.validate(), Err(SessionError::Config(_))));

        config.cookie.same_site = SameSitePolicy::Lax;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_max_stale_below_max_age() {
        let config = SessionConfig {
            max_age_secs: 600,
            max_stale_secs: Some(60),
            ..SessionConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_durations() {
        let zero_age = SessionConfig {
            max_age_secs: 0,
            ..SessionConfig::default()
        };
        assert!(zero_age.validate().is_err());

        let zero_timeout = SessionConfig {
            request_timeout_ms: 0,
            ..SessionConfig::default()
        };
        assert!(zero_timeout.validate().is_err());
    }

    #[test]
    fn test_retry_bound_zero_means_single_attempt() {
        let config = SessionConfig {
            retry_bound: 0,
            ..SessionConfig::default()
        };
        assert_eq!(config.max_attempts(), 1);
    }
}
