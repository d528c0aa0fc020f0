use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::models::*;
use crate::error::AppResult;

/// Persistence seam for the settlement jobs.
///
/// Every mutating call is a conditional update: it only applies when the
/// record is still in the status the caller expects, and reports whether
/// it applied. Implementations must make each call atomic, since the jobs
/// rely on this alone for safety under overlapping invocations.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    fn name(&self) -> &'static str;

    /// Cheap reachability check for the health endpoint
    async fn ping(&self) -> AppResult<()>;

    // ========== ORDERS ==========

    async fn insert_order(&self, order: &Order) -> AppResult<()>;

    async fn get_order(&self, order_id: Uuid) -> AppResult<Option<Order>>;

    async fn order_history(&self, order_id: Uuid) -> AppResult<Vec<OrderStatusChange>>;

    /// Move an order from `from` to `to` if it is still in `from`.
    /// Stamps `shipped_at` / `delivered_at` when entering those states and
    /// appends a history entry.
    async fn transition_order(
        &self,
        order_id: Uuid,
        from: OrderStatus,
        to: OrderStatus,
        note: Option<String>,
        at: DateTime<Utc>,
    ) -> AppResult<bool>;

    /// Orders awaiting release that were delivered at or before `delivered_before`
    async fn orders_due_for_release(
        &self,
        delivered_before: DateTime<Utc>,
    ) -> AppResult<Vec<Order>>;

    /// Mark the order released and credit the seller in one step.
    /// Returns false when the order is no longer in `expected_status`.
    async fn release_escrow(&self, release: &EscrowRelease) -> AppResult<bool>;

    // ========== BALANCES ==========

    async fn seller_balance(&self, seller_id: Uuid) -> AppResult<SellerBalance>;

    // ========== PAYOUTS ==========

    async fn insert_payout(&self, payout: &PayoutRequest) -> AppResult<()>;

    async fn get_payout(&self, payout_id: Uuid) -> AppResult<Option<PayoutRequest>>;

    /// Pending requests scheduled at or before `now`, oldest first
    async fn due_payouts(&self, now: DateTime<Utc>) -> AppResult<Vec<PayoutRequest>>;

    /// Processing requests claimed before `claimed_before`
    async fn stale_processing_payouts(
        &self,
        claimed_before: DateTime<Utc>,
    ) -> AppResult<Vec<PayoutRequest>>;

    /// Pending → processing, reserving the amount from the seller balance
    async fn claim_payout(&self, payout_id: Uuid, at: DateTime<Utc>) -> AppResult<ClaimOutcome>;

    /// Processing → completed
    async fn complete_payout(
        &self,
        payout_id: Uuid,
        gateway_reference: &str,
        at: DateTime<Utc>,
    ) -> AppResult<bool>;

    /// Processing → failed, returning the reserved amount to the seller
    async fn fail_payout(&self, payout_id: Uuid, error: &str, at: DateTime<Utc>)
        -> AppResult<bool>;

    // ========== PAYMENTS ==========

    async fn insert_payment(&self, payment: &PaymentRecord) -> AppResult<()>;

    async fn get_payment(&self, payment_id: Uuid) -> AppResult<Option<PaymentRecord>>;

    async fn payments_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> AppResult<Vec<PaymentRecord>>;

    /// Stamp `reconciled_at` and, when given, write the discrepancy.
    /// `None` clears any earlier annotation.
    /// Returns true only when a discrepancy was written that differs from
    /// the one already on the record.
    async fn record_reconciliation(
        &self,
        payment_id: Uuid,
        discrepancy: Option<&Discrepancy>,
        at: DateTime<Utc>,
    ) -> AppResult<bool>;

    /// Payments carrying an open discrepancy, most recently flagged first
    async fn flagged_payments(&self) -> AppResult<Vec<PaymentRecord>>;
}
