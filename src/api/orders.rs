use axum::{
    extract::{Path, State},
    Json,
};
use tracing::{info, warn};
use uuid::Uuid;

use super::handler::AppState;
use super::models::*;
use crate::error::{AppError, AppResult};
use crate::ledger::models::{Order, OrderStatus};
use crate::middleware::ValidatedJson;

async fn load_order(state: &AppState, order_id: Uuid) -> AppResult<Order> {
    state
        .ledger
        .get_order(order_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Order {} not found", order_id)))
}

async fn order_response(state: &AppState, order_id: Uuid) -> AppResult<Json<OrderResponse>> {
    let order = load_order(state, order_id).await?;
    let history = state.ledger.order_history(order_id).await?;
    Ok(Json(OrderResponse { order, history }))
}

/// Apply a transition from the order's current status, refusing it if the
/// order moved in the meantime
async fn transition(
    state: &AppState,
    order: &Order,
    to: OrderStatus,
    note: String,
) -> AppResult<()> {
    if !order.status.can_transition_to(to) {
        return Err(AppError::InvalidTransition {
            from: order.status.to_string(),
            to: to.to_string(),
        });
    }

    let applied = state
        .ledger
        .transition_order(order.id, order.status, to, Some(note), state.clock.now())
        .await?;
    if !applied {
        return Err(AppError::Conflict(format!(
            "Order {} changed status concurrently",
            order.id
        )));
    }
    Ok(())
}

/// GET /api/v1/orders/:id
pub async fn get_order(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
) -> AppResult<Json<OrderResponse>> {
    order_response(&state, order_id).await
}

/// Starts the escrow holding period
/// POST /api/v1/orders/:id/confirm-delivery
pub async fn confirm_delivery(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
) -> AppResult<Json<OrderResponse>> {
    let order = load_order(&state, order_id).await?;
    if order.status != OrderStatus::Shipped {
        return Err(AppError::InvalidTransition {
            from: order.status.to_string(),
            to: OrderStatus::Delivered.to_string(),
        });
    }

    transition(&state, &order, OrderStatus::Delivered, "delivery confirmed".to_string()).await?;
    info!("📦 Delivery confirmed for order {}", order_id);

    order_response(&state, order_id).await
}

/// Holds the order out of escrow release until resolved
/// POST /api/v1/orders/:id/dispute
pub async fn open_dispute(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
    ValidatedJson(request): ValidatedJson<DisputeRequest>,
) -> AppResult<Json<OrderResponse>> {
    let order = load_order(&state, order_id).await?;
    transition(&state, &order, OrderStatus::Disputed, request.reason).await?;
    warn!("⚖️ Order {} disputed", order_id);

    order_response(&state, order_id).await
}

/// Payments carrying a reconciliation annotation
/// GET /api/v1/admin/payments/flagged
pub async fn list_flagged_payments(
    State(state): State<AppState>,
) -> AppResult<Json<FlaggedPaymentsResponse>> {
    let payments = state.ledger.flagged_payments().await?;
    Ok(Json(FlaggedPaymentsResponse {
        count: payments.len(),
        payments,
    }))
}

#[cfg(test)]
mod tests {
    use crate::api::testing::{send, TestApp};
    use crate::ledger::models::{LineItem, Order, OrderStatus, PaymentRecord, PaymentStatus};
    use crate::ledger::LedgerStore;
    use axum::http::{Method, StatusCode};
    use chrono::Duration;
    use rust_decimal_macros::dec;
    use serde_json::json;
    use uuid::Uuid;

    async fn seed_order(app: &TestApp, status: OrderStatus) -> Order {
        let mut order = Order::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            vec![LineItem { product_id: "sku-1".into(), quantity: 2, unit_price: dec!(2500) }],
            Some("ref-1".into()),
            app.now() - Duration::days(3),
        );
        order.status = status;
        app.ledger.insert_order(&order).await.unwrap();
        order
    }

    #[tokio::test]
    async fn test_confirm_delivery_starts_holding_period() {
        let app = TestApp::new(Some("abc"));
        let order = seed_order(&app, OrderStatus::Shipped).await;
        let uri = format!("/api/v1/orders/{}/confirm-delivery", order.id);

        let (status, body) = send(&app.router, Method::POST, &uri, None).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["order"]["status"], "delivered");
        assert_eq!(body["history"].as_array().unwrap().len(), 2);
        let stored = app.ledger.get_order(order.id).await.unwrap().unwrap();
        assert_eq!(stored.delivered_at, Some(app.now()));

        // Confirming twice is an illegal transition
        let (status, body) = send(&app.router, Method::POST, &uri, None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error_code"], "INVALID_TRANSITION");
    }

    #[tokio::test]
    async fn test_dispute_blocks_release() {
        let app = TestApp::new(Some("abc"));
        let order_id = seed_order(&app, OrderStatus::Shipped).await.id;
        app.ledger
            .transition_order(order_id, OrderStatus::Shipped, OrderStatus::Delivered, None, app.now())
            .await
            .unwrap();

        let (status, body) = send(
            &app.router,
            Method::POST,
            &format!("/api/v1/orders/{}/dispute", order_id),
            Some(json!({ "reason": "item arrived damaged" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["order"]["status"], "disputed");

        app.clock.advance(Duration::days(30));
        let (_, released) =
            send(&app.router, Method::POST, "/cron/auto-release-escrow?secret=abc", None).await;
        assert_eq!(released["released"], 0);
    }

    #[tokio::test]
    async fn test_dispute_requires_reason() {
        let app = TestApp::new(None);
        let order = seed_order(&app, OrderStatus::Paid).await;

        let (status, _) = send(
            &app.router,
            Method::POST,
            &format!("/api/v1/orders/{}/dispute", order.id),
            Some(json!({ "reason": "" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_released_order_cannot_be_disputed() {
        let app = TestApp::new(None);
        let order = seed_order(&app, OrderStatus::Released).await;

        let (status, _) = send(
            &app.router,
            Method::POST,
            &format!("/api/v1/orders/{}/dispute", order.id),
            Some(json!({ "reason": "changed my mind" })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_flagged_payments_listing() {
        let app = TestApp::new(Some("abc"));
        let payment = PaymentRecord::new(
            Uuid::new_v4(),
            "ref-gone".into(),
            dec!(5000),
            PaymentStatus::Success,
            app.now() - Duration::hours(2),
        );
        app.ledger.insert_payment(&payment).await.unwrap();
        send(&app.router, Method::GET, "/cron/reconcile-payments?secret=abc", None).await;

        let (status, body) =
            send(&app.router, Method::GET, "/api/v1/admin/payments/flagged", None).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["count"], 1);
        assert_eq!(body["payments"][0]["discrepancy"]["kinds"][0], "missing_at_gateway");
    }
}
