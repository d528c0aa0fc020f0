use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

use super::models::*;
use super::store::LedgerStore;
use crate::error::{AppError, AppResult};

#[derive(Default)]
struct LedgerState {
    orders: HashMap<Uuid, Order>,
    history: HashMap<Uuid, Vec<OrderStatusChange>>,
    balances: HashMap<Uuid, SellerBalance>,
    payouts: HashMap<Uuid, PayoutRequest>,
    payments: HashMap<Uuid, PaymentRecord>,
}

/// In-process ledger. All state sits behind one lock, so each trait call
/// is atomic in the same way a database transaction would be.
#[derive(Default)]
pub struct MemoryLedger {
    state: Mutex<LedgerState>,
    /// Ids whose mutations fail, for exercising per-item error paths
    faults: Mutex<HashSet<Uuid>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn fail_on(&self, id: Uuid) {
        self.faults.lock().insert(id);
    }

    #[cfg(test)]
    pub fn clear_faults(&self) {
        self.faults.lock().clear();
    }

    #[cfg(test)]
    pub fn set_balance(&self, seller_id: Uuid, available: rust_decimal::Decimal) {
        let mut state = self.state.lock();
        let balance = state
            .balances
            .entry(seller_id)
            .or_insert_with(|| SellerBalance::empty(seller_id, Utc::now()));
        balance.available = available;
    }

    fn check_fault(&self, id: Uuid) -> AppResult<()> {
        if self.faults.lock().contains(&id) {
            return Err(AppError::Internal(format!("injected fault for {}", id)));
        }
        Ok(())
    }
}

impl LedgerState {
    fn balance_mut(&mut self, seller_id: Uuid, at: DateTime<Utc>) -> &mut SellerBalance {
        self.balances
            .entry(seller_id)
            .or_insert_with(|| SellerBalance::empty(seller_id, at))
    }
}

#[async_trait]
impl LedgerStore for MemoryLedger {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn ping(&self) -> AppResult<()> {
        Ok(())
    }

    async fn insert_order(&self, order: &Order) -> AppResult<()> {
        let mut state = self.state.lock();
        if state.orders.contains_key(&order.id) {
            return Err(AppError::Conflict(format!("Order {} already exists", order.id)));
        }
        state.history.entry(order.id).or_default().push(OrderStatusChange {
            order_id: order.id,
            from_status: None,
            to_status: order.status,
            note: None,
            changed_at: order.created_at,
        });
        state.orders.insert(order.id, order.clone());
        Ok(())
    }

    async fn get_order(&self, order_id: Uuid) -> AppResult<Option<Order>> {
        Ok(self.state.lock().orders.get(&order_id).cloned())
    }

    async fn order_history(&self, order_id: Uuid) -> AppResult<Vec<OrderStatusChange>> {
        Ok(self
            .state
            .lock()
            .history
            .get(&order_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn transition_order(
        &self,
        order_id: Uuid,
        from: OrderStatus,
        to: OrderStatus,
        note: Option<String>,
        at: DateTime<Utc>,
    ) -> AppResult<bool> {
        if !from.can_transition_to(to) {
            return Err(AppError::InvalidTransition {
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        self.check_fault(order_id)?;

        let mut state = self.state.lock();
        let order = state
            .orders
            .get_mut(&order_id)
            .ok_or_else(|| AppError::NotFound(format!("Order {} not found", order_id)))?;

        if order.status != from {
            return Ok(false);
        }

        order.status = to;
        order.updated_at = at;
        match to {
            OrderStatus::Shipped => order.shipped_at = Some(at),
            OrderStatus::Delivered => order.delivered_at = Some(at),
            _ => {}
        }

        state.history.entry(order_id).or_default().push(OrderStatusChange {
            order_id,
            from_status: Some(from),
            to_status: to,
            note,
            changed_at: at,
        });
        Ok(true)
    }

    async fn orders_due_for_release(
        &self,
        delivered_before: DateTime<Utc>,
    ) -> AppResult<Vec<Order>> {
        let state = self.state.lock();
        let mut due: Vec<Order> = state
            .orders
            .values()
            .filter(|o| OrderStatus::awaiting_release().contains(&o.status))
            .filter(|o| o.delivered_at.map(|d| d <= delivered_before).unwrap_or(false))
            .cloned()
            .collect();
        due.sort_by_key(|o| o.delivered_at);
        Ok(due)
    }

    async fn release_escrow(&self, release: &EscrowRelease) -> AppResult<bool> {
        self.check_fault(release.order_id)?;

        let mut state = self.state.lock();
        let Some(order) = state.orders.get_mut(&release.order_id) else {
            return Ok(false);
        };
        if order.status != release.expected_status {
            return Ok(false);
        }

        order.status = OrderStatus::Released;
        order.commission_amount = Some(release.commission);
        order.net_amount = Some(release.net);
        order.released_at = Some(release.released_at);
        order.updated_at = release.released_at;

        state
            .history
            .entry(release.order_id)
            .or_default()
            .push(OrderStatusChange {
                order_id: release.order_id,
                from_status: Some(release.expected_status),
                to_status: OrderStatus::Released,
                note: Some(format!("escrow released: net {}", release.net)),
                changed_at: release.released_at,
            });

        let balance = state.balance_mut(release.seller_id, release.released_at);
        balance.available += release.net;
        balance.lifetime_released += release.net;
        balance.updated_at = release.released_at;
        Ok(true)
    }

    async fn seller_balance(&self, seller_id: Uuid) -> AppResult<SellerBalance> {
        Ok(self
            .state
            .lock()
            .balances
            .get(&seller_id)
            .cloned()
            .unwrap_or_else(|| SellerBalance::empty(seller_id, Utc::now())))
    }

    async fn insert_payout(&self, payout: &PayoutRequest) -> AppResult<()> {
        let mut state = self.state.lock();
        if state.payouts.contains_key(&payout.id) {
            return Err(AppError::Conflict(format!("Payout {} already exists", payout.id)));
        }
        state.payouts.insert(payout.id, payout.clone());
        Ok(())
    }

    async fn get_payout(&self, payout_id: Uuid) -> AppResult<Option<PayoutRequest>> {
        Ok(self.state.lock().payouts.get(&payout_id).cloned())
    }

    async fn due_payouts(&self, now: DateTime<Utc>) -> AppResult<Vec<PayoutRequest>> {
        let state = self.state.lock();
        let mut due: Vec<PayoutRequest> = state
            .payouts
            .values()
            .filter(|p| p.is_due(now))
            .cloned()
            .collect();
        due.sort_by_key(|p| (p.scheduled_for, p.created_at));
        Ok(due)
    }

    async fn stale_processing_payouts(
        &self,
        claimed_before: DateTime<Utc>,
    ) -> AppResult<Vec<PayoutRequest>> {
        let state = self.state.lock();
        let mut stale: Vec<PayoutRequest> = state
            .payouts
            .values()
            .filter(|p| p.status == PayoutStatus::Processing)
            .filter(|p| p.claimed_at.map(|c| c < claimed_before).unwrap_or(true))
            .cloned()
            .collect();
        stale.sort_by_key(|p| p.claimed_at);
        Ok(stale)
    }

    async fn claim_payout(&self, payout_id: Uuid, at: DateTime<Utc>) -> AppResult<ClaimOutcome> {
        self.check_fault(payout_id)?;

        let mut state = self.state.lock();
        let (seller_id, amount) = match state.payouts.get(&payout_id) {
            Some(p) if p.status.can_transition_to(PayoutStatus::Processing) => {
                (p.seller_id, p.amount)
            }
            Some(_) => return Ok(ClaimOutcome::NotPending),
            None => return Err(AppError::NotFound(format!("Payout {} not found", payout_id))),
        };

        let balance = state.balance_mut(seller_id, at);
        if !balance.covers(amount) {
            return Ok(ClaimOutcome::InsufficientBalance);
        }
        balance.available -= amount;
        balance.updated_at = at;

        if let Some(payout) = state.payouts.get_mut(&payout_id) {
            payout.status = PayoutStatus::Processing;
            payout.claimed_at = Some(at);
            payout.updated_at = at;
        }
        Ok(ClaimOutcome::Claimed)
    }

    async fn complete_payout(
        &self,
        payout_id: Uuid,
        gateway_reference: &str,
        at: DateTime<Utc>,
    ) -> AppResult<bool> {
        self.check_fault(payout_id)?;

        let mut state = self.state.lock();
        let Some(payout) = state.payouts.get_mut(&payout_id) else {
            return Ok(false);
        };
        if !payout.status.can_transition_to(PayoutStatus::Completed) {
            return Ok(false);
        }

        payout.status = PayoutStatus::Completed;
        payout.gateway_reference = Some(gateway_reference.to_string());
        payout.processed_at = Some(at);
        payout.updated_at = at;
        Ok(true)
    }

    async fn fail_payout(&self, payout_id: Uuid, error: &str, at: DateTime<Utc>)
        -> AppResult<bool> {
        self.check_fault(payout_id)?;

        let mut state = self.state.lock();
        let (seller_id, amount) = match state.payouts.get_mut(&payout_id) {
            Some(payout) if payout.status.can_transition_to(PayoutStatus::Failed) => {
                payout.status = PayoutStatus::Failed;
                payout.error_detail = Some(error.to_string());
                payout.processed_at = Some(at);
                payout.updated_at = at;
                (payout.seller_id, payout.amount)
            }
            _ => return Ok(false),
        };

        let balance = state.balance_mut(seller_id, at);
        balance.available += amount;
        balance.updated_at = at;
        Ok(true)
    }

    async fn insert_payment(&self, payment: &PaymentRecord) -> AppResult<()> {
        let mut state = self.state.lock();
        if state.payments.contains_key(&payment.id) {
            return Err(AppError::Conflict(format!("Payment {} already exists", payment.id)));
        }
        state.payments.insert(payment.id, payment.clone());
        Ok(())
    }

    async fn get_payment(&self, payment_id: Uuid) -> AppResult<Option<PaymentRecord>> {
        Ok(self.state.lock().payments.get(&payment_id).cloned())
    }

    async fn payments_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> AppResult<Vec<PaymentRecord>> {
        let state = self.state.lock();
        let mut payments: Vec<PaymentRecord> = state
            .payments
            .values()
            .filter(|p| p.created_at >= from && p.created_at <= to)
            .cloned()
            .collect();
        payments.sort_by_key(|p| p.created_at);
        Ok(payments)
    }

    async fn record_reconciliation(
        &self,
        payment_id: Uuid,
        discrepancy: Option<&Discrepancy>,
        at: DateTime<Utc>,
    ) -> AppResult<bool> {
        self.check_fault(payment_id)?;

        let mut state = self.state.lock();
        let payment = state
            .payments
            .get_mut(&payment_id)
            .ok_or_else(|| AppError::NotFound(format!("Payment {} not found", payment_id)))?;

        payment.reconciled_at = Some(at);
        payment.updated_at = at;

        match discrepancy {
            Some(found) if payment.discrepancy.as_ref() != Some(found) => {
                payment.discrepancy = Some(found.clone());
                payment.flagged_at = Some(at);
                Ok(true)
            }
            Some(_) => Ok(false),
            None => {
                // Clean comparison resolves any earlier annotation
                payment.discrepancy = None;
                payment.flagged_at = None;
                Ok(false)
            }
        }
    }

    async fn flagged_payments(&self) -> AppResult<Vec<PaymentRecord>> {
        let state = self.state.lock();
        let mut flagged: Vec<PaymentRecord> = state
            .payments
            .values()
            .filter(|p| p.discrepancy.is_some())
            .cloned()
            .collect();
        flagged.sort_by(|a, b| b.flagged_at.cmp(&a.flagged_at));
        Ok(flagged)
    }
}
