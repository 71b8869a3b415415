use std::collections::HashMap;
use chrono::TimeDelta;
use rocket::http::CookieJar;
use rocket::request::{self, FromRequest};
use rocket::tokio::sync::Mutex;
use rocket::Request;
use serde::Deserialize;
use crate::auth::STUDIO_SESSION_ID;
use crate::datetime::StudioDateTime;
use crate::error::{ApiError, RateLimitInfo};

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct RateLimitConfig {
    pub max_requests: u32,
    pub window_secs: u64,
}
impl Default for RateLimitConfig {
    fn default() -> Self {
        Self { max_requests: 10, window_secs: 60 }
    }
}

#[derive(Debug, Clone)]
struct Window {
    started: StudioDateTime,
    count: u32,
}

const MAX_TRACKED_CLIENTS: usize = 10_000;

/// Fixed window request counter per client key.
#[derive(Default)]
pub struct RateLimiter {
    windows: Mutex<HashMap<String, Window>>,
}

impl RateLimiter {
    /// Counts one request of `key`, returns the requests left in the current window.
    pub async fn check(&self, key: &str, cfg: &RateLimitConfig, now: StudioDateTime) -> Result<u32, ApiError> {
        let window_len = TimeDelta::seconds(cfg.window_secs as i64);
        let mut lock = self.windows.lock().await;
        if lock.len() > MAX_TRACKED_CLIENTS {
            lock.retain(|_, w| w.started.0 + window_len > now.0);
        }
        let window = lock.entry(key.to_string()).or_insert_with(|| Window { started: now, count: 0 });
        if window.started.0 + window_len <= now.0 {
            window.started = now;
            window.count = 0;
        }
        let reset_time = StudioDateTime(window.started.0 + window_len);
        if window.count >= cfg.max_requests {
            let retry_after_secs = reset_time.0.signed_duration_since(now.0).num_seconds().max(1) as u64;
            return Err(ApiError::RateLimitExceeded(RateLimitInfo {
                limit: cfg.max_requests,
                remaining: 0,
                reset_time,
                retry_after_secs,
            }));
        }
        window.count += 1;
        Ok(cfg.max_requests - window.count)
    }
}

/// Identifies the client for rate limiting: the session if there is one, otherwise the address.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientKey(pub String);

#[rocket::async_trait]
impl<'r> FromRequest<'r> for ClientKey {
    type Error = ();
    async fn from_request(request: &'r Request<'_>) -> request::Outcome<ClientKey, ()> {
        if let request::Outcome::Success(cookies) = request.guard::<&CookieJar<'_>>().await {
            if let Some(cookie) = cookies.get_private(STUDIO_SESSION_ID) {
                return request::Outcome::Success(ClientKey(format!("session:{}", cookie.value())));
            }
        }
        let forwarded = request.headers().get_one("x-forwarded-for")
            .and_then(|s| s.split(',').next())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        let addr = forwarded
            .or_else(|| request.client_ip().map(|ip| ip.to_string()))
            .unwrap_or_else(|| "unknown".to_string());
        request::Outcome::Success(ClientKey(format!("ip:{addr}")))
    }
}
