// Payout batch:
// 1. Resolve payouts left in processing by an earlier run (by transfer reference)
// 2. Claim each due pending payout (reserves the seller balance)
// 3. Transfer through the gateway
// 4. Mark completed, or failed with the balance returned

use chrono::Duration;
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::ItemFailure;
use crate::clock::Clock;
use crate::error::AppResult;
use crate::gateway::{PaymentGateway, TransferReceipt, TransferRequest};
use crate::ledger::models::{ClaimOutcome, PayoutRequest};
use crate::ledger::store::LedgerStore;

#[derive(Debug, Clone, Default, Serialize)]
pub struct PayoutBatchReport {
    pub processed: usize,
    pub processed_ids: Vec<Uuid>,
    pub failed: usize,
    pub failed_details: Vec<ItemFailure>,
    /// Left pending: balance short, or already taken by another run
    pub skipped: usize,
    /// Stale processing payouts settled by this run
    pub recovered: usize,
}

#[derive(Debug)]
enum Outcome {
    Completed,
    Failed(String),
    Skipped,
    /// The payout is still processing and needs a later recovery pass
    Unresolved(String),
}

pub struct PayoutBatchJob {
    ledger: Arc<dyn LedgerStore>,
    gateway: Arc<dyn PaymentGateway>,
    clock: Arc<dyn Clock>,
    currency: String,
    stale_after: Duration,
}

impl PayoutBatchJob {
    pub fn new(
        ledger: Arc<dyn LedgerStore>,
        gateway: Arc<dyn PaymentGateway>,
        clock: Arc<dyn Clock>,
        currency: String,
        stale_after: Duration,
    ) -> Self {
        Self {
            ledger,
            gateway,
            clock,
            currency,
            stale_after,
        }
    }

    pub async fn run(&self) -> AppResult<PayoutBatchReport> {
        let now = self.clock.now();
        let mut report = PayoutBatchReport::default();

        let stale = self
            .ledger
            .stale_processing_payouts(now - self.stale_after)
            .await?;
        if !stale.is_empty() {
            warn!("🔁 Recovering {} stale processing payout(s)", stale.len());
        }
        for payout in stale {
            let outcome = self.recover(&payout).await;
            if matches!(outcome, Outcome::Completed | Outcome::Failed(_)) {
                report.recovered += 1;
            }
            Self::record(&mut report, payout.id, outcome);
        }

        let due = self.ledger.due_payouts(now).await?;
        if due.is_empty() && report.recovered == 0 {
            info!("✓ No payouts due");
            return Ok(report);
        }

        info!("🔄 Processing {} due payout(s) via {}", due.len(), self.gateway.name());

        for payout in due {
            let outcome = self.process(&payout).await;
            Self::record(&mut report, payout.id, outcome);
        }

        info!(
            "✓ Payout batch finished: {} processed, {} failed, {} skipped, {} recovered",
            report.processed, report.failed, report.skipped, report.recovered
        );
        Ok(report)
    }

    fn record(report: &mut PayoutBatchReport, payout_id: Uuid, outcome: Outcome) {
        match outcome {
            Outcome::Completed => {
                report.processed += 1;
                report.processed_ids.push(payout_id);
            }
            Outcome::Failed(message) | Outcome::Unresolved(message) => {
                report.failed += 1;
                report.failed_details.push(ItemFailure::new(payout_id, message));
            }
            Outcome::Skipped => report.skipped += 1,
        }
    }

    async fn process(&self, payout: &PayoutRequest) -> Outcome {
        let balance = match self.ledger.seller_balance(payout.seller_id).await {
            Ok(balance) => balance,
            Err(e) => {
                error!("❌ Could not load balance for payout {}: {}", payout.id, e);
                return Outcome::Unresolved(e.to_string());
            }
        };

        if !balance.covers(payout.amount) {
            warn!(
                "⏭️ Payout {} skipped: requested {} but seller {} has {}",
                payout.id, payout.amount, payout.seller_id, balance.available
            );
            return Outcome::Skipped;
        }

        match self.ledger.claim_payout(payout.id, self.clock.now()).await {
            Ok(ClaimOutcome::Claimed) => {}
            Ok(ClaimOutcome::NotPending) => {
                info!("⏭️ Payout {} already taken by another run", payout.id);
                return Outcome::Skipped;
            }
            Ok(ClaimOutcome::InsufficientBalance) => {
                warn!("⏭️ Payout {} skipped: balance changed before claim", payout.id);
                return Outcome::Skipped;
            }
            Err(e) => {
                error!("❌ Could not claim payout {}: {}", payout.id, e);
                return Outcome::Unresolved(e.to_string());
            }
        }

        self.transfer(payout).await
    }

    /// Send the transfer for a claimed payout and settle its status
    async fn transfer(&self, payout: &PayoutRequest) -> Outcome {
        let request = TransferRequest {
            reference: payout.transfer_reference.clone(),
            recipient_code: payout.recipient_code.clone(),
            amount: payout.amount,
            currency: self.currency.clone(),
            reason: format!("Marketplace payout {}", payout.id),
        };

        match self.gateway.initiate_transfer(&request).await {
            Ok(receipt) => self.settle(payout, receipt).await,
            Err(e) if e.is_definitive() => {
                warn!("❌ Gateway rejected payout {}: {}", payout.id, e);
                self.fail(payout, &e.to_string()).await
            }
            Err(e) => {
                error!(
                    "⚠️ Transfer outcome unknown for payout {} ({}), left for recovery",
                    payout.id, e
                );
                Outcome::Unresolved(format!("transfer outcome unknown: {}", e))
            }
        }
    }

    async fn settle(&self, payout: &PayoutRequest, receipt: TransferReceipt) -> Outcome {
        if receipt.status.is_failure() {
            let message = format!("transfer {} reported {:?}", receipt.transfer_code, receipt.status);
            return self.fail(payout, &message).await;
        }

        match self
            .ledger
            .complete_payout(payout.id, &receipt.transfer_code, self.clock.now())
            .await
        {
            Ok(true) => {
                info!(
                    "✓ Payout {} completed: {} to {} (transfer {})",
                    payout.id, payout.amount, payout.recipient_code, receipt.transfer_code
                );
                Outcome::Completed
            }
            Ok(false) => Outcome::Unresolved(format!(
                "transfer {} sent but payout no longer processing",
                receipt.transfer_code
            )),
            Err(e) => {
                error!(
                    "🚨 Transfer {} sent but payout {} not persisted: {}",
                    receipt.transfer_code, payout.id, e
                );
                Outcome::Unresolved(format!(
                    "transfer {} sent but completion not persisted: {}",
                    receipt.transfer_code, e
                ))
            }
        }
    }

    async fn fail(&self, payout: &PayoutRequest, message: &str) -> Outcome {
        match self.ledger.fail_payout(payout.id, message, self.clock.now()).await {
            Ok(_) => Outcome::Failed(message.to_string()),
            Err(e) => {
                error!("❌ Could not mark payout {} failed: {}", payout.id, e);
                Outcome::Unresolved(format!("{} (not persisted: {})", message, e))
            }
        }
    }

    /// Settle a payout stuck in processing from what the gateway knows
    async fn recover(&self, payout: &PayoutRequest) -> Outcome {
        match self.gateway.fetch_transfer(&payout.transfer_reference).await {
            Ok(Some(receipt)) => {
                info!(
                    "🔎 Gateway has transfer {} for stale payout {} ({:?})",
                    receipt.transfer_code, payout.id, receipt.status
                );
                self.settle(payout, receipt).await
            }
            Ok(None) => {
                info!("🔁 No transfer found for stale payout {}, re-sending", payout.id);
                self.transfer(payout).await
            }
            Err(e) => {
                error!("❌ Could not look up transfer for payout {}: {}", payout.id, e);
                Outcome::Unresolved(format!("transfer lookup failed: {}", e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::gateway::testing::ScriptedGateway;
    use crate::gateway::TransferStatus;
    use crate::ledger::memory::MemoryLedger;
    use crate::ledger::models::PayoutStatus;
    use chrono::{DateTime, TimeZone, Utc};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 10, 12, 0, 0).unwrap()
    }

    struct Fixture {
        ledger: Arc<MemoryLedger>,
        gateway: Arc<ScriptedGateway>,
        clock: Arc<ManualClock>,
        job: PayoutBatchJob,
    }

    fn setup() -> Fixture {
        let ledger = Arc::new(MemoryLedger::new());
        let gateway = Arc::new(ScriptedGateway::new());
        let clock = Arc::new(ManualClock::new(now()));
        let job = PayoutBatchJob::new(
            ledger.clone(),
            gateway.clone(),
            clock.clone(),
            "NGN".to_string(),
            Duration::minutes(60),
        );
        Fixture { ledger, gateway, clock, job }
    }

    async fn seed_payout(
        ledger: &MemoryLedger,
        seller_id: Uuid,
        amount: Decimal,
        recipient: &str,
    ) -> PayoutRequest {
        let payout = PayoutRequest::new(
            seller_id,
            amount,
            recipient.to_string(),
            now() - Duration::hours(1),
            None,
            now() - Duration::days(1),
        );
        ledger.insert_payout(&payout).await.unwrap();
        payout
    }

    async fn status_of(ledger: &MemoryLedger, id: Uuid) -> PayoutStatus {
        ledger.get_payout(id).await.unwrap().unwrap().status
    }

    #[tokio::test]
    async fn test_completes_covered_payout() {
        let f = setup();
        let seller = Uuid::new_v4();
        f.ledger.set_balance(seller, dec!(8000));
        let payout = seed_payout(&f.ledger, seller, dec!(5000), "RCP_ok").await;

        let report = f.job.run().await.unwrap();

        assert_eq!(report.processed, 1);
        assert_eq!(report.processed_ids, vec![payout.id]);
        assert_eq!(report.failed, 0);
        let stored = f.ledger.get_payout(payout.id).await.unwrap().unwrap();
        assert_eq!(stored.status, PayoutStatus::Completed);
        assert_eq!(
            stored.gateway_reference,
            Some(format!("TRF_{}", payout.transfer_reference))
        );
        assert_eq!(f.ledger.seller_balance(seller).await.unwrap().available, dec!(3000));
    }

    #[tokio::test]
    async fn test_skips_when_balance_short() {
        let f = setup();
        let seller = Uuid::new_v4();
        f.ledger.set_balance(seller, dec!(3000));
        let payout = seed_payout(&f.ledger, seller, dec!(5000), "RCP_ok").await;

        let report = f.job.run().await.unwrap();

        assert_eq!(report.skipped, 1);
        assert_eq!(report.processed, 0);
        assert_eq!(status_of(&f.ledger, payout.id).await, PayoutStatus::Pending);
        assert!(f.gateway.transfer_calls().is_empty());
        assert_eq!(f.ledger.seller_balance(seller).await.unwrap().available, dec!(3000));
    }

    #[tokio::test]
    async fn test_rejected_transfer_fails_and_refunds() {
        let f = setup();
        let seller = Uuid::new_v4();
        f.ledger.set_balance(seller, dec!(6000));
        f.gateway.reject_recipient("RCP_bad");
        let payout = seed_payout(&f.ledger, seller, dec!(5000), "RCP_bad").await;

        let report = f.job.run().await.unwrap();

        assert_eq!(report.failed, 1);
        assert_eq!(report.failed_details[0].id, payout.id);
        assert!(report.failed_details[0].error.contains("Recipient account is invalid"));
        let stored = f.ledger.get_payout(payout.id).await.unwrap().unwrap();
        assert_eq!(stored.status, PayoutStatus::Failed);
        assert!(stored.error_detail.is_some());
        assert_eq!(f.ledger.seller_balance(seller).await.unwrap().available, dec!(6000));

        // Failed requests are not picked up again
        let rerun = f.job.run().await.unwrap();
        assert_eq!(rerun.processed + rerun.failed + rerun.skipped, 0);
        assert_eq!(f.gateway.transfer_calls().len(), 1);
    }

    #[tokio::test]
    async fn test_completed_payout_never_reprocessed() {
        let f = setup();
        let seller = Uuid::new_v4();
        f.ledger.set_balance(seller, dec!(20000));
        let payout = seed_payout(&f.ledger, seller, dec!(5000), "RCP_ok").await;

        f.job.run().await.unwrap();
        f.clock.advance(Duration::days(1));
        let rerun = f.job.run().await.unwrap();

        assert_eq!(rerun.processed, 0);
        assert_eq!(status_of(&f.ledger, payout.id).await, PayoutStatus::Completed);
        assert_eq!(f.gateway.transfer_calls().len(), 1);
        assert_eq!(f.ledger.seller_balance(seller).await.unwrap().available, dec!(15000));
    }

    #[tokio::test]
    async fn test_future_payout_not_due() {
        let f = setup();
        let seller = Uuid::new_v4();
        f.ledger.set_balance(seller, dec!(20000));
        let payout = PayoutRequest::new(
            seller,
            dec!(5000),
            "RCP_ok".into(),
            now() + Duration::days(2),
            None,
            now(),
        );
        f.ledger.insert_payout(&payout).await.unwrap();

        let report = f.job.run().await.unwrap();
        assert_eq!(report.processed, 0);
        assert_eq!(status_of(&f.ledger, payout.id).await, PayoutStatus::Pending);
    }

    #[tokio::test]
    async fn test_processing_payout_is_not_taken_twice() {
        let f = setup();
        let seller = Uuid::new_v4();
        f.ledger.set_balance(seller, dec!(20000));
        let payout = seed_payout(&f.ledger, seller, dec!(5000), "RCP_ok").await;

        // Another run claimed it moments ago
        f.ledger.claim_payout(payout.id, now()).await.unwrap();

        let report = f.job.run().await.unwrap();
        assert_eq!(report.processed, 0);
        assert_eq!(report.recovered, 0);
        assert!(f.gateway.transfer_calls().is_empty());
        assert_eq!(status_of(&f.ledger, payout.id).await, PayoutStatus::Processing);
    }

    #[tokio::test]
    async fn test_unknown_outcome_left_processing() {
        let f = setup();
        let seller = Uuid::new_v4();
        f.ledger.set_balance(seller, dec!(20000));
        f.gateway.set_unreachable(true);
        let payout = seed_payout(&f.ledger, seller, dec!(5000), "RCP_ok").await;

        let report = f.job.run().await.unwrap();

        assert_eq!(report.failed, 1);
        assert_eq!(status_of(&f.ledger, payout.id).await, PayoutStatus::Processing);
        // Reservation held until the outcome is known
        assert_eq!(f.ledger.seller_balance(seller).await.unwrap().available, dec!(15000));
    }

    #[tokio::test]
    async fn test_recovers_transfer_sent_but_not_persisted() {
        let f = setup();
        let seller = Uuid::new_v4();
        f.ledger.set_balance(seller, dec!(20000));
        let payout = seed_payout(&f.ledger, seller, dec!(5000), "RCP_ok").await;

        // Claimed and sent by a run that died before recording completion
        f.ledger.claim_payout(payout.id, now()).await.unwrap();
        f.gateway.seed_transfer(&payout.transfer_reference, TransferStatus::Success);

        // Not stale yet
        let early = f.job.run().await.unwrap();
        assert_eq!(early.recovered, 0);

        f.clock.advance(Duration::minutes(61));
        let report = f.job.run().await.unwrap();

        assert_eq!(report.recovered, 1);
        assert_eq!(report.processed_ids, vec![payout.id]);
        assert_eq!(status_of(&f.ledger, payout.id).await, PayoutStatus::Completed);
        // Nothing re-sent
        assert!(f.gateway.transfer_calls().is_empty());
        assert_eq!(f.ledger.seller_balance(seller).await.unwrap().available, dec!(15000));
    }

    #[tokio::test]
    async fn test_recovery_resends_when_gateway_has_no_record() {
        let f = setup();
        let seller = Uuid::new_v4();
        f.ledger.set_balance(seller, dec!(20000));
        let payout = seed_payout(&f.ledger, seller, dec!(5000), "RCP_ok").await;
        f.ledger.claim_payout(payout.id, now()).await.unwrap();

        f.clock.advance(Duration::hours(2));
        let report = f.job.run().await.unwrap();

        assert_eq!(report.recovered, 1);
        assert_eq!(f.gateway.transfer_calls(), vec![payout.transfer_reference.clone()]);
        assert_eq!(status_of(&f.ledger, payout.id).await, PayoutStatus::Completed);
    }

    #[tokio::test]
    async fn test_recovery_fails_reversed_transfer() {
        let f = setup();
        let seller = Uuid::new_v4();
        f.ledger.set_balance(seller, dec!(20000));
        let payout = seed_payout(&f.ledger, seller, dec!(5000), "RCP_ok").await;
        f.ledger.claim_payout(payout.id, now()).await.unwrap();
        f.gateway.seed_transfer(&payout.transfer_reference, TransferStatus::Reversed);

        f.clock.advance(Duration::hours(2));
        let report = f.job.run().await.unwrap();

        assert_eq!(report.recovered, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(status_of(&f.ledger, payout.id).await, PayoutStatus::Failed);
        assert_eq!(f.ledger.seller_balance(seller).await.unwrap().available, dec!(20000));
    }
}
