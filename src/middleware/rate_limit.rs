use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use governor::{state::InMemoryState, state::NotKeyed, Quota, RateLimiter};
use std::num::NonZeroU32;
use std::sync::Arc;
use tracing::warn;

use crate::error::ErrorResponse;

#[derive(Clone)]
pub struct RateLimitLayer {
    limiter: Arc<RateLimiter<NotKeyed, InMemoryState, governor::clock::DefaultClock>>,
}

impl RateLimitLayer {
    pub fn per_minute(requests: NonZeroU32) -> Self {
        RateLimitLayer {
            limiter: Arc::new(RateLimiter::direct(Quota::per_minute(requests))),
        }
    }

    pub fn check(&self) -> Result<(), Response> {
        match self.limiter.check() {
            Ok(_) => Ok(()),
            Err(_) => {
                warn!("⏳ Rate limit exceeded");
                let body = Json(ErrorResponse {
                    success: false,
                    error: "Rate limit exceeded. Please try again later.".to_string(),
                    error_code: "RATE_LIMITED".to_string(),
                    timestamp: Utc::now(),
                });
                Err((StatusCode::TOO_MANY_REQUESTS, body).into_response())
            }
        }
    }
}

// Rate limiting middleware for the /api/v1 routes
pub async fn rate_limit_middleware(
    State(limiter): State<RateLimitLayer>,
    req: Request,
    next: Next,
) -> Result<Response, Response> {
    limiter.check()?;
    Ok(next.run(req).await)
}
