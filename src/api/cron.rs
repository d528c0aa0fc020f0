// Scheduled trigger endpoints
//
// GET|POST /cron/<job>?secret=<token>
// The secret is checked before anything runs. With no secret configured the
// endpoints are open and every call logs a warning.

use axum::{
    extract::{Query, State},
    Json,
};
use sha2::{Digest, Sha256};
use tracing::{error, info, warn};

use super::handler::AppState;
use super::models::*;
use crate::config::Config;
use crate::error::{AppError, AppResult};

fn authorize(config: &Config, supplied: Option<&str>, job: &str) -> AppResult<()> {
    let Some(expected) = config.cron_secret() else {
        warn!("⚠️ CRON_SECRET not configured, {} endpoint is open", job);
        return Ok(());
    };

    match supplied {
        Some(secret) if secrets_match(expected, secret) => Ok(()),
        Some(_) => {
            warn!("🚫 Rejected {} trigger: secret mismatch", job);
            Err(AppError::Unauthorized)
        }
        None => {
            warn!("🚫 Rejected {} trigger: secret missing", job);
            Err(AppError::Unauthorized)
        }
    }
}

/// Compare digests so the comparison time does not depend on the secret
fn secrets_match(expected: &str, supplied: &str) -> bool {
    Sha256::digest(expected.as_bytes()) == Sha256::digest(supplied.as_bytes())
}

/// Job-level failures surface as 500; overlap stays 409
fn job_failed(job: &str, e: AppError) -> AppError {
    match e {
        AppError::Conflict(_) => e,
        other => {
            error!("❌ {} failed: {}", job, other);
            AppError::Internal(other.to_string())
        }
    }
}

/// GET|POST /cron/auto-release-escrow
pub async fn auto_release_escrow(
    State(state): State<AppState>,
    Query(query): Query<CronQuery>,
) -> AppResult<Json<EscrowReleaseResponse>> {
    const JOB: &str = "escrow release";
    authorize(&state.config, query.secret.as_deref(), JOB)?;
    info!("⏰ Cron trigger: {}", JOB);

    let report = state
        .settlement
        .release_escrow()
        .await
        .map_err(|e| job_failed(JOB, e))?;

    Ok(Json(EscrowReleaseResponse::new(report, state.clock.now())))
}

/// GET|POST /cron/process-payouts
pub async fn process_payouts(
    State(state): State<AppState>,
    Query(query): Query<CronQuery>,
) -> AppResult<Json<PayoutBatchResponse>> {
    const JOB: &str = "payout batch";
    authorize(&state.config, query.secret.as_deref(), JOB)?;
    info!("⏰ Cron trigger: {}", JOB);

    let report = state
        .settlement
        .process_payouts()
        .await
        .map_err(|e| job_failed(JOB, e))?;

    Ok(Json(PayoutBatchResponse::new(report, state.clock.now())))
}

/// GET|POST /cron/reconcile-payments
pub async fn reconcile_payments(
    State(state): State<AppState>,
    Query(query): Query<CronQuery>,
) -> AppResult<Json<ReconciliationResponse>> {
    const JOB: &str = "payment reconciliation";
    authorize(&state.config, query.secret.as_deref(), JOB)?;
    info!("⏰ Cron trigger: {}", JOB);

    let report = state
        .settlement
        .reconcile_payments()
        .await
        .map_err(|e| job_failed(JOB, e))?;

    Ok(Json(ReconciliationResponse::new(report, state.clock.now())))
}
