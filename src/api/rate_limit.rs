// =============================================================================
// HTTP Rate Limiting — per-endpoint-class sliding windows per client
// =============================================================================
//
// Reads get 60 requests/minute, mutations 10/minute, counted per client IP
// in a sliding window. Exceeding the budget yields 429 with a
// `Retry-After` hint. This protects the engine (and the vendor behind it)
// from a runaway dashboard, not from adversaries.
// =============================================================================

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{Method, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use parking_lot::Mutex;
use tracing::warn;

use crate::app_state::AppState;

/// Read-class budget per window.
pub const READ_LIMIT: u32 = 60;
/// Mutation-class budget per window.
pub const MUTATION_LIMIT: u32 = 10;
const WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum RequestClass {
    Read,
    Mutation,
}

struct WindowEntry {
    count: u32,
    window_start: Instant,
}

pub struct HttpRateLimiter {
    windows: Mutex<HashMap<(IpAddr, RequestClass), WindowEntry>>,
    read_limit: u32,
    mutation_limit: u32,
    window: Duration,
}

impl HttpRateLimiter {
    pub fn with_defaults() -> Self {
        Self::new(READ_LIMIT, MUTATION_LIMIT, WINDOW)
    }

    pub fn new(read_limit: u32, mutation_limit: u32, window: Duration) -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
            read_limit,
            mutation_limit,
            window,
        }
    }

    /// `Ok(())` to admit, `Err(retry_after)` to refuse.
    fn check(&self, ip: IpAddr, class: RequestClass) -> Result<(), Duration> {
        let limit = match class {
            RequestClass::Read => self.read_limit,
            RequestClass::Mutation => self.mutation_limit,
        };

        let mut windows = self.windows.lock();
        let now = Instant::now();
        let entry = windows.entry((ip, class)).or_insert(WindowEntry {
            count: 0,
            window_start: now,
        });

        if now.duration_since(entry.window_start) >= self.window {
            entry.count = 0;
            entry.window_start = now;
        }

        entry.count += 1;
        if entry.count > limit {
            let reset_at = entry.window_start + self.window;
            Err(reset_at.saturating_duration_since(now))
        } else {
            Ok(())
        }
    }

    /// Drop windows that have gone quiet (periodic housekeeping).
    pub fn cleanup(&self) {
        let now = Instant::now();
        let window = self.window;
        self.windows
            .lock()
            .retain(|_, e| now.duration_since(e.window_start) < window * 2);
    }
}

/// Axum middleware applying the limiter to every `/api` request.
pub async fn rate_limit_middleware(
    State(state): State<Arc<AppState>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let ip = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip())
        .unwrap_or(IpAddr::from([127, 0, 0, 1]));

    let class = if matches!(
        *request.method(),
        Method::GET | Method::HEAD | Method::OPTIONS
    ) {
        RequestClass::Read
    } else {
        RequestClass::Mutation
    };

    match state.http_limiter.check(ip, class) {
        Ok(()) => next.run(request).await,
        Err(retry_after) => {
            let secs = retry_after.as_secs().max(1);
            warn!(ip = %ip, retry_after_secs = secs, "http rate limit exceeded");
            let body = serde_json::json!({
                "error": {
                    "code": "rate-limited",
                    "message": format!("too many requests, retry in {secs}s"),
                }
            });
            (
                StatusCode::TOO_MANY_REQUESTS,
                [("Retry-After", secs.to_string())],
                axum::Json(body),
            )
                .into_response()
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn ip() -> IpAddr {
        IpAddr::from([10, 0, 0, 1])
    }

    #[test]
    fn reads_allowed_up_to_limit() {
        let limiter = HttpRateLimiter::new(5, 2, Duration::from_secs(60));
        for _ in 0..5 {
            assert!(limiter.check(ip(), RequestClass::Read).is_ok());
        }
        let retry = limiter.check(ip(), RequestClass::Read).unwrap_err();
        assert!(retry <= Duration::from_secs(60));
    }

    #[test]
    fn classes_have_independent_budgets() {
        let limiter = HttpRateLimiter::new(5, 2, Duration::from_secs(60));
        assert!(limiter.check(ip(), RequestClass::Mutation).is_ok());
        assert!(limiter.check(ip(), RequestClass::Mutation).is_ok());
        assert!(limiter.check(ip(), RequestClass::Mutation).is_err());
        // Reads still pass after mutations are exhausted.
        assert!(limiter.check(ip(), RequestClass::Read).is_ok());
    }

    #[test]
    fn clients_are_isolated() {
        let limiter = HttpRateLimiter::new(1, 1, Duration::from_secs(60));
        let other = IpAddr::from([10, 0, 0, 2]);
        assert!(limiter.check(ip(), RequestClass::Read).is_ok());
        assert!(limiter.check(ip(), RequestClass::Read).is_err());
        assert!(limiter.check(other, RequestClass::Read).is_ok());
    }

    #[test]
    fn window_resets() {
        let limiter = HttpRateLimiter::new(1, 1, Duration::from_millis(10));
        assert!(limiter.check(ip(), RequestClass::Read).is_ok());
        assert!(limiter.check(ip(), RequestClass::Read).is_err());
        std::thread::sleep(Duration::from_millis(15));
        assert!(limiter.check(ip(), RequestClass::Read).is_ok());
    }

    #[test]
    fn cleanup_drops_stale_windows() {
        let limiter = HttpRateLimiter::new(1, 1, Duration::from_millis(5));
        limiter.check(ip(), RequestClass::Read).ok();
        std::thread::sleep(Duration::from_millis(20));
        limiter.cleanup();
        assert!(limiter.windows.lock().is_empty());
    }
}
