use chrono::Duration;
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::{Commission, ItemFailure};
use crate::clock::Clock;
use crate::error::AppResult;
use crate::ledger::models::EscrowRelease;
use crate::ledger::store::LedgerStore;

#[derive(Debug, Clone, Default, Serialize)]
pub struct EscrowReleaseReport {
    pub released: usize,
    pub released_ids: Vec<Uuid>,
    /// Orders that changed status between the scan and the update
    pub skipped: usize,
    pub failures: Vec<ItemFailure>,
}

/// Releases escrowed funds of delivered orders whose holding period elapsed
pub struct EscrowReleaseJob {
    ledger: Arc<dyn LedgerStore>,
    clock: Arc<dyn Clock>,
    commission: Commission,
    holding_period: Duration,
}

impl EscrowReleaseJob {
    pub fn new(
        ledger: Arc<dyn LedgerStore>,
        clock: Arc<dyn Clock>,
        commission: Commission,
        holding_period: Duration,
    ) -> Self {
        Self {
            ledger,
            clock,
            commission,
            holding_period,
        }
    }

    pub async fn run(&self) -> AppResult<EscrowReleaseReport> {
        let now = self.clock.now();
        let due: Vec<_> = self
            .ledger
            .orders_due_for_release(now - self.holding_period)
            .await?
            .into_iter()
            .filter(|order| order.is_release_due(now, self.holding_period))
            .collect();

        if due.is_empty() {
            info!("✓ No orders due for escrow release");
            return Ok(EscrowReleaseReport::default());
        }

        info!("🔄 Releasing escrow for {} order(s)", due.len());

        let mut report = EscrowReleaseReport::default();

        for order in due {
            let (commission, net) = self.commission.split(order.total_amount);
            let release = EscrowRelease {
                order_id: order.id,
                seller_id: order.seller_id,
                expected_status: order.status,
                gross: order.total_amount,
                commission,
                net,
                released_at: now,
            };

            match self.ledger.release_escrow(&release).await {
                Ok(true) => {
                    info!(
                        "✓ Released order {}: gross {} commission {} net {} to seller {}",
                        order.id, release.gross, commission, net, order.seller_id
                    );
                    report.released += 1;
                    report.released_ids.push(order.id);
                }
                Ok(false) => {
                    warn!("⏭️ Order {} changed state before release, skipped", order.id);
                    report.skipped += 1;
                }
                Err(e) => {
                    error!("❌ Escrow release failed for order {}: {}", order.id, e);
                    report.failures.push(ItemFailure::new(order.id, e));
                }
            }
        }

        info!(
            "✓ Escrow release finished: {} released, {} skipped, {} failed",
            report.released,
            report.skipped,
            report.failures.len()
        );
        Ok(report)
    }
}
