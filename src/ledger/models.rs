use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::{prelude::FromRow, Type};
use std::fmt;
use uuid::Uuid;

/// Order lifecycle status
///
/// Released and refunded are terminal. An order is eligible for escrow
/// release only from delivered or escrow_held.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[sqlx(type_name = "order_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Placed,
    Paid,
    Shipped,
    Delivered,
    EscrowHeld,
    Released,
    Disputed,
    Refunded,
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Placed => "placed",
            OrderStatus::Paid => "paid",
            OrderStatus::Shipped => "shipped",
            OrderStatus::Delivered => "delivered",
            OrderStatus::EscrowHeld => "escrow_held",
            OrderStatus::Released => "released",
            OrderStatus::Disputed => "disputed",
            OrderStatus::Refunded => "refunded",
        }
    }

    /// Statuses the escrow release job picks up
    pub fn awaiting_release() -> &'static [OrderStatus] {
        &[OrderStatus::Delivered, OrderStatus::EscrowHeld]
    }

    /// Valid transitions:
    /// - Placed → Paid, Refunded
    /// - Paid → Shipped, EscrowHeld, Disputed, Refunded
    /// - Shipped → Delivered, Disputed
    /// - Delivered → EscrowHeld, Released, Disputed
    /// - EscrowHeld → Released, Disputed
    /// - Disputed → Released, Refunded
    /// - Terminal states (Released, Refunded) → NO TRANSITIONS ALLOWED
    pub fn allowed_next(&self) -> &'static [OrderStatus] {
        use OrderStatus::*;
        match self {
            Placed => &[Paid, Refunded],
            Paid => &[Shipped, EscrowHeld, Disputed, Refunded],
            Shipped => &[Delivered, Disputed],
            Delivered => &[EscrowHeld, Released, Disputed],
            EscrowHeld => &[Released, Disputed],
            Disputed => &[Released, Refunded],
            Released | Refunded => &[],
        }
    }

    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        self.allowed_next().contains(&next)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    pub product_id: String,
    pub quantity: u32,
    pub unit_price: Decimal,
}

impl LineItem {
    pub fn subtotal(&self) -> Decimal {
        self.unit_price * Decimal::from(self.quantity)
    }
}

/// Order entity
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Order {
    pub id: Uuid,
    pub buyer_id: Uuid,
    pub seller_id: Uuid,
    #[sqlx(json)]
    pub line_items: Vec<LineItem>,
    pub status: OrderStatus,
    pub payment_reference: Option<String>,
    pub total_amount: Decimal,
    /// Set when escrow is released
    pub commission_amount: Option<Decimal>,
    pub net_amount: Option<Decimal>,
    pub created_at: DateTime<Utc>,
    pub shipped_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub released_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    /// New order as created on checkout completion
    pub fn new(
        buyer_id: Uuid,
        seller_id: Uuid,
        line_items: Vec<LineItem>,
        payment_reference: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        let total_amount = line_items.iter().map(LineItem::subtotal).sum();
        Self {
            id: Uuid::new_v4(),
            buyer_id,
            seller_id,
            line_items,
            status: OrderStatus::Placed,
            payment_reference,
            total_amount,
            commission_amount: None,
            net_amount: None,
            created_at: now,
            shipped_at: None,
            delivered_at: None,
            released_at: None,
            updated_at: now,
        }
    }

    /// Check whether the holding period since delivery has elapsed
    pub fn is_release_due(&self, now: DateTime<Utc>, holding_period: Duration) -> bool {
        OrderStatus::awaiting_release().contains(&self.status)
            && self
                .delivered_at
                .map(|delivered| delivered + holding_period <= now)
                .unwrap_or(false)
    }
}

/// Append-only order status history entry
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct OrderStatusChange {
    pub order_id: Uuid,
    pub from_status: Option<OrderStatus>,
    pub to_status: OrderStatus,
    pub note: Option<String>,
    pub changed_at: DateTime<Utc>,
}

/// Escrow release to apply atomically
#[derive(Debug, Clone)]
pub struct EscrowRelease {
    pub order_id: Uuid,
    pub seller_id: Uuid,
    /// Status observed by the scan; the update is conditional on it
    pub expected_status: OrderStatus,
    pub gross: Decimal,
    pub commission: Decimal,
    pub net: Decimal,
    pub released_at: DateTime<Utc>,
}

/// Seller balance
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SellerBalance {
    pub seller_id: Uuid,
    pub available: Decimal,
    pub lifetime_released: Decimal,
    pub updated_at: DateTime<Utc>,
}

impl SellerBalance {
    pub fn empty(seller_id: Uuid, now: DateTime<Utc>) -> Self {
        Self {
            seller_id,
            available: Decimal::ZERO,
            lifetime_released: Decimal::ZERO,
            updated_at: now,
        }
    }

    pub fn covers(&self, amount: Decimal) -> bool {
        self.available >= amount
    }
}

/// Payout request status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[sqlx(type_name = "payout_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PayoutStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl fmt::Display for PayoutStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PayoutStatus::Pending => "pending",
            PayoutStatus::Processing => "processing",
            PayoutStatus::Completed => "completed",
            PayoutStatus::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

impl PayoutStatus {
    /// Payouts only move forward: Pending → Processing → {Completed, Failed}
    pub fn can_transition_to(&self, next: PayoutStatus) -> bool {
        matches!(
            (self, next),
            (PayoutStatus::Pending, PayoutStatus::Processing)
                | (PayoutStatus::Processing, PayoutStatus::Completed)
                | (PayoutStatus::Processing, PayoutStatus::Failed)
        )
    }
}

/// Seller-initiated withdrawal
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PayoutRequest {
    pub id: Uuid,
    pub seller_id: Uuid,
    pub amount: Decimal,
    /// Gateway transfer recipient for the seller's account
    pub recipient_code: String,
    pub status: PayoutStatus,
    pub scheduled_for: DateTime<Utc>,
    /// Idempotency key sent to the gateway, fixed at creation
    pub transfer_reference: String,
    pub gateway_reference: Option<String>,
    pub error_detail: Option<String>,
    /// Failed request this one re-triggers
    pub retry_of: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub processed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl PayoutRequest {
    pub fn new(
        seller_id: Uuid,
        amount: Decimal,
        recipient_code: String,
        scheduled_for: DateTime<Utc>,
        retry_of: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> Self {
        let id = Uuid::new_v4();
        Self {
            id,
            seller_id,
            amount,
            recipient_code,
            status: PayoutStatus::Pending,
            scheduled_for,
            transfer_reference: format!("payout-{}", id.simple()),
            gateway_reference: None,
            error_detail: None,
            retry_of,
            created_at: now,
            claimed_at: None,
            processed_at: None,
            updated_at: now,
        }
    }

    /// Fresh pending request re-triggering a failed one
    pub fn retry(&self, now: DateTime<Utc>) -> Self {
        Self::new(
            self.seller_id,
            self.amount,
            self.recipient_code.clone(),
            now,
            Some(self.id),
            now,
        )
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == PayoutStatus::Pending && self.scheduled_for <= now
    }
}

/// Result of trying to move a payout from pending to processing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    Claimed,
    /// Already processing or terminal
    NotPending,
    InsufficientBalance,
}

/// Payment status mirrored from the gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[sqlx(type_name = "payment_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Pending,
    Success,
    Failed,
    Reversed,
    Abandoned,
}

impl PaymentStatus {
    /// Map a gateway status string; unknown in-flight states are pending
    pub fn from_gateway(status: &str) -> Self {
        match status.to_ascii_lowercase().as_str() {
            "success" | "successful" | "completed" => PaymentStatus::Success,
            "failed" | "error" => PaymentStatus::Failed,
            "reversed" | "refunded" => PaymentStatus::Reversed,
            "abandoned" => PaymentStatus::Abandoned,
            _ => PaymentStatus::Pending,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscrepancyKind {
    AmountMismatch,
    StatusMismatch,
    MissingAtGateway,
}

/// Reconciliation annotation on a payment record.
///
/// Compared structurally: writing an identical annotation again is not a
/// new issue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Discrepancy {
    pub kinds: Vec<DiscrepancyKind>,
    pub local_amount: Decimal,
    pub gateway_amount: Option<Decimal>,
    pub local_status: PaymentStatus,
    pub gateway_status: Option<PaymentStatus>,
}

/// Local payment record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentRecord {
    pub id: Uuid,
    pub order_id: Uuid,
    pub gateway_reference: String,
    pub amount: Decimal,
    pub status: PaymentStatus,
    pub discrepancy: Option<Discrepancy>,
    pub flagged_at: Option<DateTime<Utc>>,
    pub reconciled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PaymentRecord {
    pub fn new(
        order_id: Uuid,
        gateway_reference: String,
        amount: Decimal,
        status: PaymentStatus,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            order_id,
            gateway_reference,
            amount,
            status,
            discrepancy: None,
            flagged_at: None,
            reconciled_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 10, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_order_total_from_line_items() {
        let order = Order::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            vec![
                LineItem { product_id: "p1".into(), quantity: 2, unit_price: dec!(1500) },
                LineItem { product_id: "p2".into(), quantity: 1, unit_price: dec!(250.50) },
            ],
            None,
            now(),
        );
        assert_eq!(order.total_amount, dec!(3250.50));
        assert_eq!(order.status, OrderStatus::Placed);
    }

    #[test]
    fn test_order_terminal_states() {
        assert!(OrderStatus::Released.allowed_next().is_empty());
        assert!(OrderStatus::Refunded.allowed_next().is_empty());
        assert!(!OrderStatus::Released.can_transition_to(OrderStatus::Released));
        assert!(!OrderStatus::Disputed.can_transition_to(OrderStatus::Delivered));
        assert!(OrderStatus::Shipped.can_transition_to(OrderStatus::Delivered));
        assert!(OrderStatus::Delivered.can_transition_to(OrderStatus::Released));
    }

    #[test]
    fn test_release_due_requires_elapsed_window() {
        let mut order = Order::new(Uuid::new_v4(), Uuid::new_v4(), vec![], None, now());
        order.status = OrderStatus::Delivered;
        order.delivered_at = Some(now() - Duration::days(8));
        assert!(order.is_release_due(now(), Duration::days(7)));

        order.delivered_at = Some(now() - Duration::days(6));
        assert!(!order.is_release_due(now(), Duration::days(7)));

        // Escrow-held without a delivery confirmation never releases
        order.status = OrderStatus::EscrowHeld;
        order.delivered_at = None;
        assert!(!order.is_release_due(now(), Duration::days(7)));

        order.status = OrderStatus::Disputed;
        order.delivered_at = Some(now() - Duration::days(30));
        assert!(!order.is_release_due(now(), Duration::days(7)));
    }

    #[test]
    fn test_payout_transitions_forward_only() {
        use PayoutStatus::*;
        assert!(Pending.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Completed));
        assert!(Processing.can_transition_to(Failed));

        assert!(!Pending.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Pending));
        assert!(!Completed.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Pending));
        assert!(!Failed.can_transition_to(Processing));
    }

    #[test]
    fn test_payout_retry_is_new_request() {
        let mut failed = PayoutRequest::new(
            Uuid::new_v4(),
            dec!(5000),
            "RCP_1".into(),
            now(),
            None,
            now(),
        );
        failed.status = PayoutStatus::Failed;

        let retry = failed.retry(now());
        assert_ne!(retry.id, failed.id);
        assert_ne!(retry.transfer_reference, failed.transfer_reference);
        assert_eq!(retry.retry_of, Some(failed.id));
        assert_eq!(retry.status, PayoutStatus::Pending);
        assert_eq!(retry.amount, failed.amount);
    }

    #[test]
    fn test_payment_status_from_gateway() {
        assert_eq!(PaymentStatus::from_gateway("success"), PaymentStatus::Success);
        assert_eq!(PaymentStatus::from_gateway("FAILED"), PaymentStatus::Failed);
        assert_eq!(PaymentStatus::from_gateway("reversed"), PaymentStatus::Reversed);
        assert_eq!(PaymentStatus::from_gateway("ongoing"), PaymentStatus::Pending);
    }
}
