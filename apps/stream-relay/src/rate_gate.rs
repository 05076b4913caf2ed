use std::{sync::Arc, time::Instant};

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};
use parking_lot::Mutex;
use tracing::debug;

use crate::{routes::ApiError, state::AppState};

/// Process-wide token bucket guarding the stream routes.
///
/// Starts full. Refill is computed lazily from elapsed time on each check, so
/// admissions over any window never exceed `burst + rate * elapsed`.
#[derive(Debug)]
pub struct RateGate {
    rate: f64,
    burst: f64,
    bucket: Mutex<Bucket>,
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl RateGate {
    pub fn new(rate_per_sec: f64, burst: u32) -> Self {
        Self::starting_at(rate_per_sec, burst, Instant::now())
    }

    fn starting_at(rate_per_sec: f64, burst: u32, now: Instant) -> Self {
        let burst = f64::from(burst.max(1));
        Self {
            rate: rate_per_sec.max(0.0),
            burst,
            bucket: Mutex::new(Bucket {
                tokens: burst,
                last_refill: now,
            }),
        }
    }

    pub fn allow(&self) -> bool {
        self.allow_at(Instant::now())
    }

    pub fn allow_at(&self, now: Instant) -> bool {
        let mut bucket = self.bucket.lock();
        self.refill(&mut bucket, now);
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Whole tokens currently available.
    pub fn available(&self) -> u32 {
        let mut bucket = self.bucket.lock();
        self.refill(&mut bucket, Instant::now());
        bucket.tokens.floor() as u32
    }

    fn refill(&self, bucket: &mut Bucket, now: Instant) {
        // Out-of-order timestamps from concurrent callers add nothing.
        let elapsed = now.saturating_duration_since(bucket.last_refill);
        if elapsed.is_zero() {
            return;
        }
        bucket.tokens = (bucket.tokens + elapsed.as_secs_f64() * self.rate).min(self.burst);
        bucket.last_refill = now;
    }
}

pub async fn enforce(State(state): State<Arc<AppState>>, request: Request, next: Next) -> Response {
    if !state.rate_gate.allow() {
        debug!(path = %request.uri().path(), "request rejected by rate gate");
        return ApiError::RateLimited.into_response();
    }
    next.run(request).await
}
