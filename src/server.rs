use axum::{
    http::{HeaderName, HeaderValue},
    middleware::from_fn_with_state,
    routing::{get, post},
    Router,
};
use std::num::NonZeroU32;
use tower_http::{
    compression::CompressionLayer, cors::CorsLayer, set_header::SetResponseHeaderLayer,
    trace::TraceLayer,
};
use tracing::info;

use crate::{
    api::{
        cron::{auto_release_escrow, process_payouts, reconcile_payments},
        handler::{health_check, AppState},
        orders::{confirm_delivery, get_order, list_flagged_payments, open_dispute},
        payouts::{create_payout, get_payout, get_seller_balance, retry_payout},
    },
    middleware::{rate_limit_middleware, RateLimitLayer},
};

pub fn create_app(state: AppState) -> Router {
    info!("⚙️ Setting up HTTP routes...");

    let rate_limit = RateLimitLayer::per_minute(
        NonZeroU32::new(state.config.rate_limit_per_minute).unwrap_or(NonZeroU32::MIN),
    );

    let app = Router::new()
        // Public health check endpoint
        .route("/health", get(health_check))
        // Scheduled triggers, guarded by the shared secret
        .route(
            "/cron/auto-release-escrow",
            get(auto_release_escrow).post(auto_release_escrow),
        )
        .route("/cron/process-payouts", get(process_payouts).post(process_payouts))
        .route(
            "/cron/reconcile-payments",
            get(reconcile_payments).post(reconcile_payments),
        )
        // API v1 routes with rate limiting
        .nest(
            "/api/v1",
            Router::new()
                // Payout endpoints
                .route("/payouts", post(create_payout))
                .route("/payouts/:id", get(get_payout))
                .route("/payouts/:id/retry", post(retry_payout))
                .route("/sellers/:seller_id/balance", get(get_seller_balance))
                // Order endpoints
                .route("/orders/:id", get(get_order))
                .route("/orders/:id/confirm-delivery", post(confirm_delivery))
                .route("/orders/:id/dispute", post(open_dispute))
                // Admin endpoints
                .route("/admin/payments/flagged", get(list_flagged_payments))
                .route_layer(from_fn_with_state(rate_limit, rate_limit_middleware)),
        )
        .layer(CompressionLayer::new())
        .layer(SetResponseHeaderLayer::if_not_present(
            HeaderName::from_static("x-content-type-options"),
            HeaderValue::from_static("nosniff"),
        ))
        .layer(CorsLayer::very_permissive())
        // Add request tracing
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    info!("✓ HTTP routes configured");
    app
}

pub async fn run_server(app: Router, bind_address: &str) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind_address).await?;
    info!("🌐 Server listening on: {}", bind_address);

    axum::serve(listener, app).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::api::testing::{send, TestApp};
    use axum::http::{Method, StatusCode};

    #[tokio::test]
    async fn test_health() {
        let app = TestApp::new(None);
        let (status, body) = send(&app.router, Method::GET, "/health", None).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["store"], "memory");
        assert_eq!(body["cron_secret_configured"], false);
    }

    #[tokio::test]
    async fn test_unknown_route_is_404() {
        let app = TestApp::new(None);
        let (status, _) = send(&app.router, Method::GET, "/cron/unknown", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
