use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::messages::Locale;

pub const DEFAULT_AVATAR_BASE_URL: &str = "https://api.dicebear.com/7.x/avataaars/svg";

#[derive(Clone, Debug)]
pub struct Config {
    pub backend_url: String,
    pub backend_anon_key: String,
    pub session_file: PathBuf,
    pub request_timeout: Duration,
    pub retry: RetryPolicy,
    pub avatar_base_url: String,
    pub locale: Locale,
}

impl Config {
    pub fn from_env() -> Result<Self, env::VarError> {
        dotenvy::dotenv().ok();

        let defaults = RetryPolicy::default();

        Ok(Config {
            backend_url: env::var("BACKEND_URL")?,
            backend_anon_key: env::var("BACKEND_ANON_KEY")?,
            session_file: env::var("SESSION_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(".family-space/session.json")),
            request_timeout: millis_var("REQUEST_TIMEOUT_MS", 10_000),
            retry: RetryPolicy {
                max_attempts: env::var("PROFILE_RETRY_MAX_ATTEMPTS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(defaults.max_attempts),
                base_delay: millis_var("PROFILE_RETRY_BASE_DELAY_MS", 2_000),
                max_delay: millis_var("PROFILE_RETRY_MAX_DELAY_MS", 2_000),
            },
            avatar_base_url: env::var("AVATAR_BASE_URL")
                .unwrap_or_else(|_| DEFAULT_AVATAR_BASE_URL.to_string()),
            locale: env::var("APP_LOCALE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or_default(),
        })
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            request_timeout: self.request_timeout,
            retry: self.retry,
            avatar_base_url: self.avatar_base_url.clone(),
        }
    }
}

fn millis_var(key: &str, default: u64) -> Duration {
    let ms = env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default);
    Duration::from_millis(ms)
}

/// Backoff for profile fetches while the server-side trigger catches up.
///
/// Retry `n` (0-based) waits `min(base_delay * 2^n, max_delay)`. With the
/// defaults the cap equals the base, which gives a fixed 2s delay.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total fetch attempts, including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// The subset of [`Config`] the session components need.
#[derive(Clone, Debug)]
pub struct SessionSettings {
    pub request_timeout: Duration,
    pub retry: RetryPolicy,
    pub avatar_base_url: String,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            retry: RetryPolicy::default(),
            avatar_base_url: DEFAULT_AVATAR_BASE_URL.to_string(),
        }
    }
}
