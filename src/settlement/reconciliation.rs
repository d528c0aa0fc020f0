use chrono::Duration;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::ItemFailure;
use crate::clock::Clock;
use crate::error::AppResult;
use crate::gateway::{GatewayTransaction, PaymentGateway};
use crate::ledger::models::{Discrepancy, DiscrepancyKind, PaymentRecord, PaymentStatus};
use crate::ledger::store::LedgerStore;

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconciliationReport {
    pub checked: usize,
    /// Discrepancies written by this run
    pub issues_found: usize,
    /// Discrepancies already annotated identically by an earlier run
    pub already_flagged: usize,
    /// Earlier annotations cleared because the record now matches
    pub resolved: usize,
    /// Gateway transactions with no local record in the window
    pub unmatched_gateway: usize,
    pub errors: Vec<ItemFailure>,
}

/// Cross-checks local payment records against the gateway transaction log.
/// Only annotates local records; amounts and statuses are never rewritten.
pub struct ReconciliationJob {
    ledger: Arc<dyn LedgerStore>,
    gateway: Arc<dyn PaymentGateway>,
    clock: Arc<dyn Clock>,
    window: Duration,
    gateway_slack: Duration,
}

impl ReconciliationJob {
    pub fn new(
        ledger: Arc<dyn LedgerStore>,
        gateway: Arc<dyn PaymentGateway>,
        clock: Arc<dyn Clock>,
        window: Duration,
        gateway_slack: Duration,
    ) -> Self {
        Self {
            ledger,
            gateway,
            clock,
            window,
            gateway_slack,
        }
    }

    pub async fn run(&self) -> AppResult<ReconciliationReport> {
        let now = self.clock.now();
        let from = now - self.window;

        let local = self.ledger.payments_between(from, now).await?;
        let remote = self
            .gateway
            .list_transactions(from - self.gateway_slack, now)
            .await?;

        info!(
            "🔄 Reconciling {} local payment(s) against {} {} transaction(s)",
            local.len(),
            remote.len(),
            self.gateway.name()
        );

        let by_reference: HashMap<&str, &GatewayTransaction> =
            remote.iter().map(|tx| (tx.reference.as_str(), tx)).collect();

        let mut report = ReconciliationReport::default();

        for payment in &local {
            report.checked += 1;
            let found = compare(payment, by_reference.get(payment.gateway_reference.as_str()).copied());

            match self
                .ledger
                .record_reconciliation(payment.id, found.as_ref(), now)
                .await
            {
                Ok(true) => {
                    warn!(
                        "🚩 Payment {} ({}) flagged: {:?}",
                        payment.id,
                        payment.gateway_reference,
                        found.as_ref().map(|d| &d.kinds)
                    );
                    report.issues_found += 1;
                }
                Ok(false) if found.is_some() => {
                    debug!("Payment {} already flagged", payment.id);
                    report.already_flagged += 1;
                }
                Ok(false) if payment.discrepancy.is_some() => {
                    info!("✅ Payment {} now matches the gateway, flag cleared", payment.id);
                    report.resolved += 1;
                }
                Ok(false) => {}
                Err(e) => {
                    error!("❌ Could not record reconciliation for payment {}: {}", payment.id, e);
                    report.errors.push(ItemFailure::new(payment.id, e));
                }
            }
        }

        let known: HashSet<&str> = local.iter().map(|p| p.gateway_reference.as_str()).collect();
        // Strays from the slack lookback fall outside the window and are not counted
        let in_window = |tx: &&GatewayTransaction| tx.paid_at.map_or(true, |at| at >= from);
        for tx in remote
            .iter()
            .filter(in_window)
            .filter(|tx| !known.contains(tx.reference.as_str()))
        {
            info!("🔎 Gateway transaction {} has no local payment record", tx.reference);
            report.unmatched_gateway += 1;
        }

        info!(
            "✓ Reconciliation finished: {} checked, {} new issue(s), {} already flagged, {} resolved, {} unmatched",
            report.checked,
            report.issues_found,
            report.already_flagged,
            report.resolved,
            report.unmatched_gateway
        );
        Ok(report)
    }
}

fn compare(payment: &PaymentRecord, remote: Option<&GatewayTransaction>) -> Option<Discrepancy> {
    let Some(tx) = remote else {
        // Pending payments may not have reached the gateway log yet
        if payment.status == PaymentStatus::Pending {
            return None;
        }
        return Some(Discrepancy {
            kinds: vec![DiscrepancyKind::MissingAtGateway],
            local_amount: payment.amount,
            gateway_amount: None,
            local_status: payment.status,
            gateway_status: None,
        });
    };

    let mut kinds = Vec::new();
    if tx.amount != payment.amount {
        kinds.push(DiscrepancyKind::AmountMismatch);
    }
    if tx.status != payment.status {
        kinds.push(DiscrepancyKind::StatusMismatch);
    }
    if kinds.is_empty() {
        return None;
    }

    Some(Discrepancy {
        kinds,
        local_amount: payment.amount,
        gateway_amount: Some(tx.amount),
        local_status: payment.status,
        gateway_status: Some(tx.status),
    })
}
