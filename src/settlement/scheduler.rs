// Settlement Scheduler - in-process daily trigger for the settlement jobs
//
// Daily cycle at the configured UTC hour (off-peak):
// - Escrow release first, so fresh balances can cover due payouts
// - Payout batch
// - Reconciliation
//
// External cron hitting /cron/* remains the primary trigger; both paths share
// the in-flight guard so they never overlap.

use chrono::{DateTime, TimeZone, Utc};
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{error, info};

use crate::settlement::SharedSettlement;

/// Runs the settlement jobs once a day
pub struct SettlementScheduler {
    execution_hour: u32,
    settlement: SharedSettlement,
}

impl SettlementScheduler {
    pub fn new(execution_hour: u32, settlement: SharedSettlement) -> Self {
        Self {
            execution_hour,
            settlement,
        }
    }

    /// Start the settlement scheduler (runs in background)
    pub fn start(&self) -> JoinHandle<()> {
        let execution_hour = self.execution_hour;
        let settlement = self.settlement.clone();

        tokio::spawn(async move { Self::run_daily_scheduler(execution_hour, &settlement).await })
    }

    async fn run_daily_scheduler(execution_hour: u32, settlement: &SharedSettlement) {
        loop {
            let now = Utc::now();
            let Some(next_execution) = Self::calculate_next_daily_execution(now, execution_hour)
            else {
                error!("❌ Invalid settlement hour {}, scheduler stopped", execution_hour);
                return;
            };
            let duration_until_execution = next_execution.signed_duration_since(now);

            if duration_until_execution.num_seconds() > 0 {
                info!(
                    "⏰ Next settlement cycle scheduled for: {} UTC",
                    next_execution.format("%Y-%m-%d %H:%M:%S")
                );

                tokio::time::sleep(Duration::from_secs(
                    duration_until_execution.num_seconds() as u64,
                ))
                .await;
            }

            Self::run_cycle(settlement).await;
        }
    }

    async fn run_cycle(settlement: &SharedSettlement) {
        info!("🔄 Starting daily settlement cycle");

        match settlement.release_escrow().await {
            Ok(report) => info!("✓ Escrow release: {} released", report.released),
            Err(e) => error!("❌ Escrow release failed: {}", e),
        }

        match settlement.process_payouts().await {
            Ok(report) => info!(
                "✓ Payout batch: {} processed, {} failed",
                report.processed, report.failed
            ),
            Err(e) => error!("❌ Payout batch failed: {}", e),
        }

        match settlement.reconcile_payments().await {
            Ok(report) => info!(
                "✓ Reconciliation: {} checked, {} issue(s)",
                report.checked, report.issues_found
            ),
            Err(e) => error!("❌ Reconciliation failed: {}", e),
        }

        info!("✓ Settlement cycle completed");
    }

    /// Calculate next daily execution time
    fn calculate_next_daily_execution(
        now: DateTime<Utc>,
        execution_hour: u32,
    ) -> Option<DateTime<Utc>> {
        let today = Utc.from_utc_datetime(&now.date_naive().and_hms_opt(execution_hour, 0, 0)?);

        // If execution time has passed today, schedule for tomorrow
        if today <= now {
            let tomorrow = (now.date_naive() + chrono::Duration::days(1))
                .and_hms_opt(execution_hour, 0, 0)?;
            Some(Utc.from_utc_datetime(&tomorrow))
        } else {
            Some(today)
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Datelike, Timelike};

    use super::*;

    #[test]
    fn test_calculate_next_daily_execution() {
        // Current time: 2024-01-01 10:00:00 UTC
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap();

        // Execution hour: 14:00 (today)
        let next = SettlementScheduler::calculate_next_daily_execution(now, 14).unwrap();
        assert_eq!(next.hour(), 14);
        assert_eq!(next.day(), 1);

        // Execution hour: 09:00 (already passed, so tomorrow)
        let next = SettlementScheduler::calculate_next_daily_execution(now, 9).unwrap();
        assert_eq!(next.hour(), 9);
        assert_eq!(next.day(), 2);

        // Exactly on the hour runs tomorrow
        let next = SettlementScheduler::calculate_next_daily_execution(now, 10).unwrap();
        assert_eq!(next.day(), 2);
    }

    #[test]
    fn test_rolls_over_month_end() {
        let now = Utc.with_ymd_and_hms(2024, 1, 31, 23, 30, 0).unwrap();
        let next = SettlementScheduler::calculate_next_daily_execution(now, 2).unwrap();
        assert_eq!((next.month(), next.day(), next.hour()), (2, 1, 2));
    }

    #[test]
    fn test_invalid_hour() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap();
        assert!(SettlementScheduler::calculate_next_daily_execution(now, 24).is_none());
    }
}
