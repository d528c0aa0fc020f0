use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use rust_decimal::Decimal;
use tracing::info;
use uuid::Uuid;

use super::handler::AppState;
use super::models::*;
use crate::error::{AppError, AppResult};
use crate::ledger::models::{PayoutRequest, PayoutStatus};
use crate::middleware::ValidatedJson;

/// Amount must meet the configured minimum, use at most two decimal places
/// and be covered by the seller's available balance right now
async fn check_amount(state: &AppState, seller_id: Uuid, amount: Decimal) -> AppResult<()> {
    if amount < state.config.min_payout_amount {
        return Err(AppError::InvalidInput(format!(
            "amount must be at least {}",
            state.config.min_payout_amount
        )));
    }
    if amount.round_dp(2) != amount {
        return Err(AppError::InvalidInput(
            "amount must have at most two decimal places".to_string(),
        ));
    }

    let balance = state.ledger.seller_balance(seller_id).await?;
    if !balance.covers(amount) {
        return Err(AppError::InsufficientBalance {
            required: amount.to_string(),
            available: balance.available.to_string(),
        });
    }
    Ok(())
}

/// Request a payout
/// POST /api/v1/payouts
pub async fn create_payout(
    State(state): State<AppState>,
    ValidatedJson(request): ValidatedJson<CreatePayoutRequest>,
) -> AppResult<(StatusCode, Json<PayoutResponse>)> {
    check_amount(&state, request.seller_id, request.amount).await?;

    let now = state.clock.now();
    let payout = PayoutRequest::new(
        request.seller_id,
        request.amount,
        request.recipient_code.trim().to_string(),
        request.scheduled_for.unwrap_or(now),
        None,
        now,
    );
    state.ledger.insert_payout(&payout).await?;

    info!(
        "💸 Payout {} requested: {} for seller {} (scheduled {})",
        payout.id, payout.amount, payout.seller_id, payout.scheduled_for
    );
    Ok((StatusCode::CREATED, Json(payout.into())))
}

/// GET /api/v1/payouts/:id
pub async fn get_payout(
    State(state): State<AppState>,
    Path(payout_id): Path<Uuid>,
) -> AppResult<Json<PayoutResponse>> {
    let payout = state
        .ledger
        .get_payout(payout_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Payout {} not found", payout_id)))?;
    Ok(Json(payout.into()))
}

/// Re-trigger a failed payout as a new pending request
/// POST /api/v1/payouts/:id/retry
pub async fn retry_payout(
    State(state): State<AppState>,
    Path(payout_id): Path<Uuid>,
) -> AppResult<(StatusCode, Json<PayoutResponse>)> {
    let failed = state
        .ledger
        .get_payout(payout_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Payout {} not found", payout_id)))?;

    if failed.status != PayoutStatus::Failed {
        return Err(AppError::Conflict(format!(
            "Payout {} is {}, only failed payouts can be retried",
            payout_id, failed.status
        )));
    }

    check_amount(&state, failed.seller_id, failed.amount).await?;

    let retry = failed.retry(state.clock.now());
    state.ledger.insert_payout(&retry).await?;

    info!("🔁 Payout {} re-triggered as {}", failed.id, retry.id);
    Ok((StatusCode::CREATED, Json(retry.into())))
}

/// GET /api/v1/sellers/:seller_id/balance
pub async fn get_seller_balance(
    State(state): State<AppState>,
    Path(seller_id): Path<Uuid>,
) -> AppResult<Json<BalanceResponse>> {
    let balance = state.ledger.seller_balance(seller_id).await?;
    Ok(Json(balance.into()))
}
