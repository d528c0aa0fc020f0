use crate::ledger::models::*;
use crate::settlement::{EscrowReleaseReport, ItemFailure, PayoutBatchReport, ReconciliationReport};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

// ========== REQUEST MODELS ==========

/// Seller request to withdraw part of the available balance
#[derive(Debug, Deserialize, Validate)]
pub struct CreatePayoutRequest {
    pub seller_id: Uuid,
    pub amount: Decimal,
    /// Gateway transfer recipient for the seller's bank account
    #[validate(length(min = 1, max = 100, message = "recipient_code is required"))]
    pub recipient_code: String,
    /// Defaults to now
    pub scheduled_for: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct DisputeRequest {
    #[validate(length(min = 3, max = 1000, message = "reason must be 3-1000 characters"))]
    pub reason: String,
}

/// `?secret=` on the cron endpoints
#[derive(Debug, Default, Deserialize)]
pub struct CronQuery {
    pub secret: Option<String>,
}

// ========== RESPONSE MODELS ==========

#[derive(Debug, Serialize)]
pub struct PayoutResponse {
    pub payout_id: Uuid,
    pub seller_id: Uuid,
    pub amount: Decimal,
    pub recipient_code: String,
    pub status: PayoutStatus,
    pub scheduled_for: DateTime<Utc>,
    pub transfer_reference: String,
    pub gateway_reference: Option<String>,
    pub error_detail: Option<String>,
    pub retry_of: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl From<PayoutRequest> for PayoutResponse {
    fn from(payout: PayoutRequest) -> Self {
        Self {
            payout_id: payout.id,
            seller_id: payout.seller_id,
            amount: payout.amount,
            recipient_code: payout.recipient_code,
            status: payout.status,
            scheduled_for: payout.scheduled_for,
            transfer_reference: payout.transfer_reference,
            gateway_reference: payout.gateway_reference,
            error_detail: payout.error_detail,
            retry_of: payout.retry_of,
            created_at: payout.created_at,
            processed_at: payout.processed_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct BalanceResponse {
    pub seller_id: Uuid,
    pub available: Decimal,
    pub lifetime_released: Decimal,
    pub updated_at: DateTime<Utc>,
}

impl From<SellerBalance> for BalanceResponse {
    fn from(balance: SellerBalance) -> Self {
        Self {
            seller_id: balance.seller_id,
            available: balance.available,
            lifetime_released: balance.lifetime_released,
            updated_at: balance.updated_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct OrderResponse {
    pub order: Order,
    pub history: Vec<OrderStatusChange>,
}

#[derive(Debug, Serialize)]
pub struct FlaggedPaymentsResponse {
    pub count: usize,
    pub payments: Vec<PaymentRecord>,
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub store: String,
    pub gateway: String,
    pub cron_secret_configured: bool,
    pub timestamp: DateTime<Utc>,
}

// ========== CRON RESPONSES ==========

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EscrowReleaseResponse {
    pub success: bool,
    pub message: String,
    pub released: usize,
    pub failed: usize,
    pub failed_details: Vec<ItemFailure>,
    pub timestamp: DateTime<Utc>,
}

impl EscrowReleaseResponse {
    pub fn new(report: EscrowReleaseReport, timestamp: DateTime<Utc>) -> Self {
        Self {
            success: true,
            message: format!("Released escrow for {} order(s)", report.released),
            released: report.released,
            failed: report.failures.len(),
            failed_details: report.failures,
            timestamp,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PayoutBatchResponse {
    pub success: bool,
    pub message: String,
    pub processed: usize,
    pub failed: usize,
    pub processed_ids: Vec<Uuid>,
    pub failed_details: Vec<ItemFailure>,
    pub timestamp: DateTime<Utc>,
}

impl PayoutBatchResponse {
    pub fn new(report: PayoutBatchReport, timestamp: DateTime<Utc>) -> Self {
        Self {
            success: true,
            message: format!(
                "Processed {} payout(s), {} failed, {} skipped",
                report.processed, report.failed, report.skipped
            ),
            processed: report.processed,
            failed: report.failed,
            processed_ids: report.processed_ids,
            failed_details: report.failed_details,
            timestamp,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconciliationResponse {
    pub success: bool,
    pub message: String,
    pub checked: usize,
    pub issues_found: usize,
    pub timestamp: DateTime<Utc>,
}

impl ReconciliationResponse {
    pub fn new(report: ReconciliationReport, timestamp: DateTime<Utc>) -> Self {
        Self {
            success: true,
            message: format!(
                "Checked {} payment(s), {} new issue(s)",
                report.checked, report.issues_found
            ),
            checked: report.checked,
            issues_found: report.issues_found,
            timestamp,
        }
    }
}
