pub mod paystack;
#[cfg(test)]
pub mod testing;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::GatewayError;
use crate::ledger::models::PaymentStatus;

pub use paystack::PaystackGateway;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferRequest {
    /// Idempotency key; the gateway refuses a second transfer with it
    pub reference: String,
    pub recipient_code: String,
    pub amount: Decimal,
    pub currency: String,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferStatus {
    Pending,
    Success,
    Failed,
    Reversed,
}

impl TransferStatus {
    pub fn from_gateway(status: &str) -> Self {
        match status.to_ascii_lowercase().as_str() {
            "success" => TransferStatus::Success,
            "failed" | "rejected" | "abandoned" => TransferStatus::Failed,
            "reversed" => TransferStatus::Reversed,
            _ => TransferStatus::Pending,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, TransferStatus::Failed | TransferStatus::Reversed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferReceipt {
    pub reference: String,
    /// Gateway-side identifier of the transfer
    pub transfer_code: String,
    pub status: TransferStatus,
}

/// Entry in the gateway's authoritative transaction log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayTransaction {
    pub reference: String,
    pub amount: Decimal,
    pub status: PaymentStatus,
    pub paid_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    fn name(&self) -> &'static str;

    async fn initiate_transfer(
        &self,
        request: &TransferRequest,
    ) -> Result<TransferReceipt, GatewayError>;

    /// Look up a transfer by our reference. `None` when the gateway has no record of it.
    async fn fetch_transfer(&self, reference: &str)
        -> Result<Option<TransferReceipt>, GatewayError>;

    async fn list_transactions(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<GatewayTransaction>, GatewayError>;
}
