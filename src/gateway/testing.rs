use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};

use super::{GatewayTransaction, PaymentGateway, TransferReceipt, TransferRequest, TransferStatus};
use crate::error::GatewayError;

/// Scripted in-memory gateway
#[derive(Default)]
pub struct ScriptedGateway {
    transfers: Mutex<HashMap<String, TransferReceipt>>,
    rejected_recipients: Mutex<HashSet<String>>,
    unreachable: Mutex<bool>,
    transactions: Mutex<Vec<GatewayTransaction>>,
    transfer_calls: Mutex<Vec<String>>,
}

impl ScriptedGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reject_recipient(&self, recipient_code: &str) {
        self.rejected_recipients.lock().insert(recipient_code.to_string());
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        *self.unreachable.lock() = unreachable;
    }

    /// Pretend a transfer already went through on the gateway side
    pub fn seed_transfer(&self, reference: &str, status: TransferStatus) {
        self.transfers.lock().insert(
            reference.to_string(),
            TransferReceipt {
                reference: reference.to_string(),
                transfer_code: format!("TRF_{}", reference),
                status,
            },
        );
    }

    pub fn add_transaction(&self, transaction: GatewayTransaction) {
        self.transactions.lock().push(transaction);
    }

    /// References passed to `initiate_transfer`, in call order
    pub fn transfer_calls(&self) -> Vec<String> {
        self.transfer_calls.lock().clone()
    }

    fn check_reachable(&self) -> Result<(), GatewayError> {
        if *self.unreachable.lock() {
            return Err(GatewayError::Rejected {
                status: 503,
                message: "gateway unavailable".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl PaymentGateway for ScriptedGateway {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn initiate_transfer(
        &self,
        request: &TransferRequest,
    ) -> Result<TransferReceipt, GatewayError> {
        self.transfer_calls.lock().push(request.reference.clone());
        self.check_reachable()?;

        if self.rejected_recipients.lock().contains(&request.recipient_code) {
            return Err(GatewayError::Rejected {
                status: 400,
                message: "Recipient account is invalid".to_string(),
            });
        }

        let mut transfers = self.transfers.lock();
        if transfers.contains_key(&request.reference) {
            return Err(GatewayError::Rejected {
                status: 400,
                message: "Duplicate Transfer Reference".to_string(),
            });
        }

        let receipt = TransferReceipt {
            reference: request.reference.clone(),
            transfer_code: format!("TRF_{}", request.reference),
            status: TransferStatus::Success,
        };
        transfers.insert(request.reference.clone(), receipt.clone());
        Ok(receipt)
    }

    async fn fetch_transfer(
        &self,
        reference: &str,
    ) -> Result<Option<TransferReceipt>, GatewayError> {
        self.check_reachable()?;
        Ok(self.transfers.lock().get(reference).cloned())
    }

    async fn list_transactions(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<GatewayTransaction>, GatewayError> {
        self.check_reachable()?;
        // Entries without a payment time are always listed
        Ok(self
            .transactions
            .lock()
            .iter()
            .filter(|tx| tx.paid_at.map_or(true, |at| at >= from && at <= to))
            .cloned()
            .collect())
    }
}
