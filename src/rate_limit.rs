use std::collections::HashMap;
use std::env;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Configurable per-user token buckets. All read from environment variables
/// with sensible defaults.
///
/// Environment variables:
/// - `RATE_LIMIT_MESSAGES` — messages per minute (default: 60)
/// - `RATE_LIMIT_AUTH` — login/register attempts per minute per IP (default: 10)
/// - `RATE_LIMIT_DMS` — direct messages per minute (default: 60)
/// - `RATE_LIMIT_UPLOADS` — uploads per minute (default: 10)
/// - `RATE_LIMIT_SERVERS` — server creations per hour (default: 5)
pub struct RateLimitConfig {
    pub messages_max: usize,
    pub messages_window_secs: u64,
    pub auth_max: usize,
    pub auth_window_secs: u64,
    pub dms_max: usize,
    pub dms_window_secs: u64,
    pub uploads_max: usize,
    pub uploads_window_secs: u64,
    pub servers_max: usize,
    pub servers_window_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            messages_max: 60,
            messages_window_secs: 60,
            auth_max: 10,
            auth_window_secs: 60,
            dms_max: 60,
            dms_window_secs: 60,
            uploads_max: 10,
            uploads_window_secs: 60,
            servers_max: 5,
            servers_window_secs: 3600,
        }
    }
}

impl RateLimitConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(val) = env::var("RATE_LIMIT_MESSAGES")
            && let Ok(n) = val.parse::<usize>()
        {
            config.messages_max = n;
        }
        if let Ok(val) = env::var("RATE_LIMIT_AUTH")
            && let Ok(n) = val.parse::<usize>()
        {
            config.auth_max = n;
        }
        if let Ok(val) = env::var("RATE_LIMIT_DMS")
            && let Ok(n) = val.parse::<usize>()
        {
            config.dms_max = n;
        }
        if let Ok(val) = env::var("RATE_LIMIT_UPLOADS")
            && let Ok(n) = val.parse::<usize>()
        {
            config.uploads_max = n;
        }
        if let Ok(val) = env::var("RATE_LIMIT_SERVERS")
            && let Ok(n) = val.parse::<usize>()
        {
            config.servers_max = n;
        }
        config
    }
}

/// Sliding-window limiter. Keys are `"action:user_id"` (or `"action:ip"`
/// for unauthenticated routes).
pub struct RateLimiter {
    limits: Mutex<HashMap<String, Vec<Instant>>>,
}

#[derive(Debug, Clone)]
pub struct RateLimitInfo {
    pub allowed: bool,
    pub limit: usize,
    pub remaining: usize,
    /// Seconds until the oldest entry in the window expires; 0 when there is
    /// remaining capacity.
    pub retry_after_secs: u64,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter {
    pub fn new() -> Self {
        RateLimiter {
            limits: Mutex::new(HashMap::new()),
        }
    }

    pub fn check(&self, key: &str, max: usize, window_secs: u64) -> RateLimitInfo {
        let mut limits = self.limits.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        let window = Duration::from_secs(window_secs);

        let entries = limits.entry(key.to_string()).or_default();
        entries.retain(|t| now.duration_since(*t) < window);

        if entries.len() >= max {
            let retry_after = match entries.iter().min() {
                Some(oldest) => {
                    let elapsed = now.duration_since(*oldest);
                    if elapsed < window {
                        (window - elapsed).as_secs() + 1
                    } else {
                        1
                    }
                }
                None => 1,
            };
            return RateLimitInfo {
                allowed: false,
                limit: max,
                remaining: 0,
                retry_after_secs: retry_after,
            };
        }

        entries.push(now);
        RateLimitInfo {
            allowed: true,
            limit: max,
            remaining: max - entries.len(),
            retry_after_secs: 0,
        }
    }
}
