use axum::{extract::State, Json};
use std::sync::Arc;
use tracing::error;

use super::models::HealthResponse;
use crate::{
    clock::Clock, config::Config, gateway::PaymentGateway, ledger::LedgerStore,
    settlement::SharedSettlement,
};

#[derive(Clone)]
pub struct AppState {
    pub ledger: Arc<dyn LedgerStore>,
    pub gateway: Arc<dyn PaymentGateway>,
    pub settlement: SharedSettlement,
    pub config: Arc<Config>,
    pub clock: Arc<dyn Clock>,
}

/// Health check
/// GET /health
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let status = match state.ledger.ping().await {
        Ok(()) => "healthy",
        Err(e) => {
            error!("❌ Store health check failed: {}", e);
            "degraded"
        }
    };

    Json(HealthResponse {
        status: status.to_string(),
        store: state.ledger.name().to_string(),
        gateway: state.gateway.name().to_string(),
        cron_secret_configured: state.config.cron_secret().is_some(),
        timestamp: state.clock.now(),
    })
}
