// Settlement jobs: escrow release, payout batching, reconciliation
pub mod escrow;
pub mod payouts;
pub mod reconciliation;
pub mod scheduler;

use rust_decimal::{Decimal, RoundingStrategy};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

use crate::cache::TtlCache;
use crate::error::{AppError, AppResult};

pub use escrow::{EscrowReleaseJob, EscrowReleaseReport};
pub use payouts::{PayoutBatchJob, PayoutBatchReport};
pub use reconciliation::{ReconciliationJob, ReconciliationReport};

/// Platform commission taken from the gross order amount on release
#[derive(Debug, Clone, Copy)]
pub struct Commission {
    rate: Decimal,
}

impl Commission {
    pub fn new(rate: Decimal) -> Self {
        Self { rate }
    }

    /// Split a gross amount into (commission, net), commission rounded to 2dp
    pub fn split(&self, gross: Decimal) -> (Decimal, Decimal) {
        let commission =
            (gross * self.rate).round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);
        (commission, gross - commission)
    }
}

/// Per-item failure collected during a batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemFailure {
    pub id: Uuid,
    pub error: String,
}

impl ItemFailure {
    pub fn new(id: Uuid, error: impl fmt::Display) -> Self {
        Self { id, error: error.to_string() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobKind {
    EscrowRelease,
    PayoutBatch,
    Reconciliation,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::EscrowRelease => "escrow release",
            JobKind::PayoutBatch => "payout batch",
            JobKind::Reconciliation => "payment reconciliation",
        }
    }
}

/// Marks a job as in flight until dropped. Only clears the marker while it
/// still carries this run's token.
struct RunGuard<'a> {
    in_flight: &'a TtlCache<JobKind, Uuid>,
    kind: JobKind,
    token: Uuid,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        if !self.in_flight.remove_if_eq(&self.kind, &self.token) {
            warn!(
                "⏱️ {} outlived its lock, marker left to the newer run",
                self.kind.as_str()
            );
        }
    }
}

/// The three settlement jobs behind one entry point.
///
/// Overlapping triggers of the same job are refused while a run is in
/// flight. The in-flight marker expires after its TTL so a run that never
/// returned does not block later triggers.
pub struct Settlement {
    escrow: EscrowReleaseJob,
    payouts: PayoutBatchJob,
    reconciliation: ReconciliationJob,
    in_flight: TtlCache<JobKind, Uuid>,
}

impl Settlement {
    pub fn new(
        escrow: EscrowReleaseJob,
        payouts: PayoutBatchJob,
        reconciliation: ReconciliationJob,
        in_flight: TtlCache<JobKind, Uuid>,
    ) -> Self {
        Self {
            escrow,
            payouts,
            reconciliation,
            in_flight,
        }
    }

    fn acquire(&self, kind: JobKind) -> AppResult<RunGuard<'_>> {
        let token = Uuid::new_v4();
        if !self.in_flight.insert_if_absent(kind, token) {
            warn!("⏭️ {} already in progress, trigger ignored", kind.as_str());
            return Err(AppError::Conflict(format!("{} already in progress", kind.as_str())));
        }
        Ok(RunGuard {
            in_flight: &self.in_flight,
            kind,
            token,
        })
    }

    /// Drop in-flight markers whose TTL has lapsed
    pub fn purge_stale_locks(&self) -> usize {
        self.in_flight.purge_expired()
    }

    pub async fn release_escrow(&self) -> AppResult<EscrowReleaseReport> {
        let _guard = self.acquire(JobKind::EscrowRelease)?;
        self.escrow.run().await
    }

    pub async fn process_payouts(&self) -> AppResult<PayoutBatchReport> {
        let _guard = self.acquire(JobKind::PayoutBatch)?;
        self.payouts.run().await
    }

    pub async fn reconcile_payments(&self) -> AppResult<ReconciliationReport> {
        let _guard = self.acquire(JobKind::Reconciliation)?;
        self.reconciliation.run().await
    }
}

pub type SharedSettlement = Arc<Settlement>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::gateway::testing::ScriptedGateway;
    use crate::ledger::MemoryLedger;
    use chrono::{Duration, TimeZone, Utc};
    use rust_decimal_macros::dec;

    fn settlement(clock: Arc<ManualClock>) -> Settlement {
        let ledger = Arc::new(MemoryLedger::new());
        let gateway = Arc::new(ScriptedGateway::new());
        let clock: Arc<dyn Clock> = clock;
        Settlement::new(
            EscrowReleaseJob::new(
                ledger.clone(),
                clock.clone(),
                Commission::new(dec!(0.05)),
                Duration::days(7),
            ),
            PayoutBatchJob::new(
                ledger.clone(),
                gateway.clone(),
                clock.clone(),
                "NGN".into(),
                Duration::minutes(60),
            ),
            ReconciliationJob::new(
                ledger,
                gateway,
                clock.clone(),
                Duration::hours(48),
                Duration::minutes(30),
            ),
            TtlCache::new(Duration::minutes(15), clock),
        )
    }

    #[tokio::test]
    async fn test_overlapping_trigger_refused() {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 3, 10, 2, 0, 0).unwrap()));
        let settlement = settlement(clock.clone());

        let guard = settlement.acquire(JobKind::PayoutBatch).unwrap();
        assert!(matches!(settlement.process_payouts().await, Err(AppError::Conflict(_))));
        // Other jobs are independent
        assert!(settlement.release_escrow().await.is_ok());

        drop(guard);
        assert!(settlement.process_payouts().await.is_ok());
    }

    #[tokio::test]
    async fn test_stale_lock_expires() {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 3, 10, 2, 0, 0).unwrap()));
        let settlement = settlement(clock.clone());

        let guard = settlement.acquire(JobKind::Reconciliation).unwrap();
        std::mem::forget(guard);
        assert!(settlement.reconcile_payments().await.is_err());

        clock.advance(Duration::minutes(16));
        assert_eq!(settlement.purge_stale_locks(), 1);
        assert!(settlement.reconcile_payments().await.is_ok());
    }

    #[tokio::test]
    async fn test_overrun_keeps_newer_lock() {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 3, 10, 2, 0, 0).unwrap()));
        let settlement = settlement(clock.clone());

        let slow = settlement.acquire(JobKind::PayoutBatch).unwrap();
        clock.advance(Duration::minutes(16));
        let current = settlement.acquire(JobKind::PayoutBatch).unwrap();

        // The overrunning run finishing must not unlock the current one
        drop(slow);
        assert!(matches!(settlement.process_payouts().await, Err(AppError::Conflict(_))));

        drop(current);
        assert!(settlement.process_payouts().await.is_ok());
    }

    #[tokio::test]
    async fn test_lock_ttl_follows_injected_clock() {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 3, 10, 2, 0, 0).unwrap()));
        let settlement = settlement(clock.clone());

        let guard = settlement.acquire(JobKind::EscrowRelease).unwrap();
        clock.advance(Duration::minutes(14));
        assert_eq!(settlement.purge_stale_locks(), 0);
        assert!(settlement.acquire(JobKind::EscrowRelease).is_err());

        clock.advance(Duration::minutes(2));
        assert_eq!(settlement.purge_stale_locks(), 1);
        drop(guard);
    }

    #[test]
    fn test_commission_split() {
        let commission = Commission::new(dec!(0.05));
        assert_eq!(commission.split(dec!(10000)), (dec!(500), dec!(9500)));
        assert_eq!(commission.split(dec!(0)), (dec!(0), dec!(0)));
    }

    #[test]
    fn test_commission_rounds_half_up() {
        let commission = Commission::new(dec!(0.075));
        // 0.075 * 99.90 = 7.4925 -> 7.49
        assert_eq!(commission.split(dec!(99.90)), (dec!(7.49), dec!(92.41)));
        // 0.075 * 10.10 = 0.7575 -> 0.76
        assert_eq!(commission.split(dec!(10.10)), (dec!(0.76), dec!(9.34)));
    }

    #[test]
    fn test_commission_parts_sum_to_gross() {
        let commission = Commission::new(dec!(0.0333));
        for gross in [dec!(1), dec!(12.34), dec!(999.99), dec!(150000)] {
            let (fee, net) = commission.split(gross);
            assert_eq!(fee + net, gross);
        }
    }
}
