use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{prelude::FromRow, types::Json, PgPool, Postgres, Transaction};
use tracing::debug;
use uuid::Uuid;

use super::models::*;
use super::store::LedgerStore;
use crate::error::{AppError, AppResult};

/// Ledger repository - THE source of truth for all state
pub struct LedgerRepository {
    pub pool: PgPool,
}

const ORDER_COLUMNS: &str = r#"
    id, buyer_id, seller_id, line_items, status, payment_reference,
    total_amount, commission_amount, net_amount,
    created_at, shipped_at, delivered_at, released_at, updated_at
"#;

const PAYOUT_COLUMNS: &str = r#"
    id, seller_id, amount, recipient_code, status, scheduled_for,
    transfer_reference, gateway_reference, error_detail, retry_of,
    created_at, claimed_at, processed_at, updated_at
"#;

const PAYMENT_COLUMNS: &str = r#"
    id, order_id, gateway_reference, amount, status, discrepancy,
    flagged_at, reconciled_at, created_at, updated_at
"#;

#[derive(FromRow)]
struct PaymentRow {
    id: Uuid,
    order_id: Uuid,
    gateway_reference: String,
    amount: Decimal,
    status: PaymentStatus,
    discrepancy: Option<Json<Discrepancy>>,
    flagged_at: Option<DateTime<Utc>>,
    reconciled_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<PaymentRow> for PaymentRecord {
    fn from(row: PaymentRow) -> Self {
        Self {
            id: row.id,
            order_id: row.order_id,
            gateway_reference: row.gateway_reference,
            amount: row.amount,
            status: row.status,
            discrepancy: row.discrepancy.map(|Json(d)| d),
            flagged_at: row.flagged_at,
            reconciled_at: row.reconciled_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

impl LedgerRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn begin_tx(&self) -> AppResult<Transaction<'_, Postgres>> {
        Ok(self.pool.begin().await?)
    }

    async fn append_history(
        tx: &mut Transaction<'_, Postgres>,
        order_id: Uuid,
        from: Option<OrderStatus>,
        to: OrderStatus,
        note: Option<String>,
        at: DateTime<Utc>,
    ) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO order_status_history (order_id, from_status, to_status, note, changed_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(order_id)
        .bind(from)
        .bind(to)
        .bind(note)
        .bind(at)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    /// Return the reserved payout amount to the seller
    async fn credit_available(
        tx: &mut Transaction<'_, Postgres>,
        seller_id: Uuid,
        amount: Decimal,
        at: DateTime<Utc>,
    ) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO seller_balances (seller_id, available, lifetime_released, updated_at)
            VALUES ($1, $2, 0, $3)
            ON CONFLICT (seller_id) DO UPDATE
            SET available = seller_balances.available + EXCLUDED.available,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(seller_id)
        .bind(amount)
        .bind(at)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl LedgerStore for LedgerRepository {
    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn ping(&self) -> AppResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    // ========== ORDER OPERATIONS ==========

    async fn insert_order(&self, order: &Order) -> AppResult<()> {
        let mut tx = self.begin_tx().await?;

        sqlx::query(
            r#"
            INSERT INTO orders (
                id, buyer_id, seller_id, line_items, status, payment_reference,
                total_amount, commission_amount, net_amount,
                created_at, shipped_at, delivered_at, released_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(order.id)
        .bind(order.buyer_id)
        .bind(order.seller_id)
        .bind(Json(&order.line_items))
        .bind(order.status)
        .bind(&order.payment_reference)
        .bind(order.total_amount)
        .bind(order.commission_amount)
        .bind(order.net_amount)
        .bind(order.created_at)
        .bind(order.shipped_at)
        .bind(order.delivered_at)
        .bind(order.released_at)
        .bind(order.updated_at)
        .execute(&mut *tx)
        .await?;

        Self::append_history(&mut tx, order.id, None, order.status, None, order.created_at)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn get_order(&self, order_id: Uuid) -> AppResult<Option<Order>> {
        let order = sqlx::query_as::<_, Order>(&format!(
            "SELECT {} FROM orders WHERE id = $1",
            ORDER_COLUMNS
        ))
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(order)
    }

    async fn order_history(&self, order_id: Uuid) -> AppResult<Vec<OrderStatusChange>> {
        let history = sqlx::query_as::<_, OrderStatusChange>(
            r#"
            SELECT order_id, from_status, to_status, note, changed_at
            FROM order_status_history
            WHERE order_id = $1
            ORDER BY id ASC
            "#,
        )
        .bind(order_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(history)
    }

    async fn transition_order(
        &self,
        order_id: Uuid,
        from: OrderStatus,
        to: OrderStatus,
        note: Option<String>,
        at: DateTime<Utc>,
    ) -> AppResult<bool> {
        // SECURITY: Validate state machine transitions
        if !from.can_transition_to(to) {
            return Err(AppError::InvalidTransition {
                from: from.to_string(),
                to: to.to_string(),
            });
        }

        let mut tx = self.begin_tx().await?;

        let result = sqlx::query(
            r#"
            UPDATE orders
            SET status = $3,
                updated_at = $4,
                shipped_at = CASE WHEN $3 = 'shipped'::order_status THEN $4 ELSE shipped_at END,
                delivered_at = CASE WHEN $3 = 'delivered'::order_status THEN $4 ELSE delivered_at END
            WHERE id = $1 AND status = $2
            "#,
        )
        .bind(order_id)
        .bind(from)
        .bind(to)
        .bind(at)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return match self.get_order(order_id).await? {
                Some(_) => Ok(false),
                None => Err(AppError::NotFound(format!("Order {} not found", order_id))),
            };
        }

        Self::append_history(&mut tx, order_id, Some(from), to, note, at).await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn orders_due_for_release(
        &self,
        delivered_before: DateTime<Utc>,
    ) -> AppResult<Vec<Order>> {
        let orders = sqlx::query_as::<_, Order>(&format!(
            r#"
            SELECT {}
            FROM orders
            WHERE status IN ('delivered', 'escrow_held')
              AND delivered_at IS NOT NULL
              AND delivered_at <= $1
            ORDER BY delivered_at ASC
            "#,
            ORDER_COLUMNS
        ))
        .bind(delivered_before)
        .fetch_all(&self.pool)
        .await?;

        Ok(orders)
    }

    async fn release_escrow(&self, release: &EscrowRelease) -> AppResult<bool> {
        let mut tx = self.begin_tx().await?;

        let result = sqlx::query(
            r#"
            UPDATE orders
            SET status = 'released',
                commission_amount = $3,
                net_amount = $4,
                released_at = $5,
                updated_at = $5
            WHERE id = $1 AND status = $2
            "#,
        )
        .bind(release.order_id)
        .bind(release.expected_status)
        .bind(release.commission)
        .bind(release.net)
        .bind(release.released_at)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            debug!("Order {} no longer {}, release skipped", release.order_id, release.expected_status);
            tx.rollback().await?;
            return Ok(false);
        }

        Self::append_history(
            &mut tx,
            release.order_id,
            Some(release.expected_status),
            OrderStatus::Released,
            Some(format!("escrow released: net {}", release.net)),
            release.released_at,
        )
        .await?;

        sqlx::query(
            r#"
            INSERT INTO seller_balances (seller_id, available, lifetime_released, updated_at)
            VALUES ($1, $2, $2, $3)
            ON CONFLICT (seller_id) DO UPDATE
            SET available = seller_balances.available + EXCLUDED.available,
                lifetime_released = seller_balances.lifetime_released + EXCLUDED.lifetime_released,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(release.seller_id)
        .bind(release.net)
        .bind(release.released_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    // ========== BALANCE OPERATIONS ==========

    async fn seller_balance(&self, seller_id: Uuid) -> AppResult<SellerBalance> {
        let balance = sqlx::query_as::<_, SellerBalance>(
            r#"
            SELECT seller_id, available, lifetime_released, updated_at
            FROM seller_balances
            WHERE seller_id = $1
            "#,
        )
        .bind(seller_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(balance.unwrap_or_else(|| SellerBalance::empty(seller_id, Utc::now())))
    }

    // ========== PAYOUT OPERATIONS ==========

    async fn insert_payout(&self, payout: &PayoutRequest) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO payout_requests (
                id, seller_id, amount, recipient_code, status, scheduled_for,
                transfer_reference, gateway_reference, error_detail, retry_of,
                created_at, claimed_at, processed_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(payout.id)
        .bind(payout.seller_id)
        .bind(payout.amount)
        .bind(&payout.recipient_code)
        .bind(payout.status)
        .bind(payout.scheduled_for)
        .bind(&payout.transfer_reference)
        .bind(&payout.gateway_reference)
        .bind(&payout.error_detail)
        .bind(payout.retry_of)
        .bind(payout.created_at)
        .bind(payout.claimed_at)
        .bind(payout.processed_at)
        .bind(payout.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_payout(&self, payout_id: Uuid) -> AppResult<Option<PayoutRequest>> {
        let payout = sqlx::query_as::<_, PayoutRequest>(&format!(
            "SELECT {} FROM payout_requests WHERE id = $1",
            PAYOUT_COLUMNS
        ))
        .bind(payout_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(payout)
    }

    async fn due_payouts(&self, now: DateTime<Utc>) -> AppResult<Vec<PayoutRequest>> {
        let payouts = sqlx::query_as::<_, PayoutRequest>(&format!(
            r#"
            SELECT {}
            FROM payout_requests
            WHERE status = 'pending' AND scheduled_for <= $1
            ORDER BY scheduled_for ASC, created_at ASC
            "#,
            PAYOUT_COLUMNS
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        Ok(payouts)
    }

    async fn stale_processing_payouts(
        &self,
        claimed_before: DateTime<Utc>,
    ) -> AppResult<Vec<PayoutRequest>> {
        let payouts = sqlx::query_as::<_, PayoutRequest>(&format!(
            r#"
            SELECT {}
            FROM payout_requests
            WHERE status = 'processing'
              AND (claimed_at IS NULL OR claimed_at < $1)
            ORDER BY claimed_at ASC
            "#,
            PAYOUT_COLUMNS
        ))
        .bind(claimed_before)
        .fetch_all(&self.pool)
        .await?;

        Ok(payouts)
    }

    async fn claim_payout(&self, payout_id: Uuid, at: DateTime<Utc>) -> AppResult<ClaimOutcome> {
        let mut tx = self.begin_tx().await?;

        let row: Option<(Uuid, Decimal, PayoutStatus)> = sqlx::query_as(
            r#"
            SELECT seller_id, amount, status
            FROM payout_requests
            WHERE id = $1
            FOR UPDATE
            "#,
        )
        .bind(payout_id)
        .fetch_optional(&mut *tx)
        .await?;

        let (seller_id, amount, status) = row
            .ok_or_else(|| AppError::NotFound(format!("Payout {} not found", payout_id)))?;

        if status != PayoutStatus::Pending {
            tx.rollback().await?;
            return Ok(ClaimOutcome::NotPending);
        }

        let reserved = sqlx::query(
            r#"
            UPDATE seller_balances
            SET available = available - $2, updated_at = $3
            WHERE seller_id = $1 AND available >= $2
            "#,
        )
        .bind(seller_id)
        .bind(amount)
        .bind(at)
        .execute(&mut *tx)
        .await?;

        if reserved.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(ClaimOutcome::InsufficientBalance);
        }

        sqlx::query(
            r#"
            UPDATE payout_requests
            SET status = 'processing', claimed_at = $2, updated_at = $2
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(payout_id)
        .bind(at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(ClaimOutcome::Claimed)
    }

    async fn complete_payout(
        &self,
        payout_id: Uuid,
        gateway_reference: &str,
        at: DateTime<Utc>,
    ) -> AppResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE payout_requests
            SET status = 'completed', gateway_reference = $2, processed_at = $3, updated_at = $3
            WHERE id = $1 AND status = 'processing'
            "#,
        )
        .bind(payout_id)
        .bind(gateway_reference)
        .bind(at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn fail_payout(&self, payout_id: Uuid, error: &str, at: DateTime<Utc>)
        -> AppResult<bool> {
        let mut tx = self.begin_tx().await?;

        let row: Option<(Uuid, Decimal)> = sqlx::query_as(
            r#"
            UPDATE payout_requests
            SET status = 'failed', error_detail = $2, processed_at = $3, updated_at = $3
            WHERE id = $1 AND status = 'processing'
            RETURNING seller_id, amount
            "#,
        )
        .bind(payout_id)
        .bind(error)
        .bind(at)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((seller_id, amount)) = row else {
            tx.rollback().await?;
            return Ok(false);
        };

        Self::credit_available(&mut tx, seller_id, amount, at).await?;
        tx.commit().await?;
        Ok(true)
    }

    // ========== PAYMENT OPERATIONS ==========

    async fn insert_payment(&self, payment: &PaymentRecord) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO payments (
                id, order_id, gateway_reference, amount, status, discrepancy,
                flagged_at, reconciled_at, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(payment.id)
        .bind(payment.order_id)
        .bind(&payment.gateway_reference)
        .bind(payment.amount)
        .bind(payment.status)
        .bind(payment.discrepancy.as_ref().map(Json))
        .bind(payment.flagged_at)
        .bind(payment.reconciled_at)
        .bind(payment.created_at)
        .bind(payment.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_payment(&self, payment_id: Uuid) -> AppResult<Option<PaymentRecord>> {
        let row = sqlx::query_as::<_, PaymentRow>(&format!(
            "SELECT {} FROM payments WHERE id = $1",
            PAYMENT_COLUMNS
        ))
        .bind(payment_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(PaymentRecord::from))
    }

    async fn payments_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> AppResult<Vec<PaymentRecord>> {
        let rows = sqlx::query_as::<_, PaymentRow>(&format!(
            r#"
            SELECT {}
            FROM payments
            WHERE created_at >= $1 AND created_at <= $2
            ORDER BY created_at ASC
            "#,
            PAYMENT_COLUMNS
        ))
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(PaymentRecord::from).collect())
    }

    async fn record_reconciliation(
        &self,
        payment_id: Uuid,
        discrepancy: Option<&Discrepancy>,
        at: DateTime<Utc>,
    ) -> AppResult<bool> {
        let mut tx = self.begin_tx().await?;

        let touched = sqlx::query(
            "UPDATE payments SET reconciled_at = $2, updated_at = $2 WHERE id = $1",
        )
        .bind(payment_id)
        .bind(at)
        .execute(&mut *tx)
        .await?;

        if touched.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(AppError::NotFound(format!("Payment {} not found", payment_id)));
        }

        let mut flagged = false;
        if let Some(found) = discrepancy {
            // jsonb comparison is structural, so an identical annotation is a no-op
            let result = sqlx::query(
                r#"
                UPDATE payments
                SET discrepancy = $2, flagged_at = $3
                WHERE id = $1 AND discrepancy IS DISTINCT FROM $2
                "#,
            )
            .bind(payment_id)
            .bind(Json(found))
            .bind(at)
            .execute(&mut *tx)
            .await?;
            flagged = result.rows_affected() > 0;
        } else {
            sqlx::query(
                r#"
                UPDATE payments
                SET discrepancy = NULL, flagged_at = NULL
                WHERE id = $1 AND discrepancy IS NOT NULL
                "#,
            )
            .bind(payment_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(flagged)
    }

    async fn flagged_payments(&self) -> AppResult<Vec<PaymentRecord>> {
        let rows = sqlx::query_as::<_, PaymentRow>(&format!(
            r#"
            SELECT {}
            FROM payments
            WHERE discrepancy IS NOT NULL
            ORDER BY flagged_at DESC
            "#,
            PAYMENT_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(PaymentRecord::from).collect())
    }
}
