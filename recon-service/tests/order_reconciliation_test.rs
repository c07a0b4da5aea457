//! Order-vs-payment reconciler tests.

mod common;

use std::sync::Arc;

use chrono::Utc;
use common::{
    dec, payment_with_status, pending_order, processed_notification, InMemoryOrderStore,
    MockGatewayClient,
};
use recon_service::models::{OrderDiscrepancyKind, OrderStatus, PaymentStatus};
use recon_service::services::gateway::GatewayStatus;
use recon_service::services::OrderReconciler;

fn link(store: &InMemoryOrderStore, mut order: recon_service::models::Order, payment: recon_service::models::Payment) -> uuid::Uuid {
    order.payment_id = Some(payment.payment_id);
    let order_id = order.order_id;
    store.insert_payment(payment);
    store.insert_order(order);
    order_id
}

#[tokio::test]
async fn paid_payment_marks_order_paid() {
    common::init_tracing();

    let store = Arc::new(InMemoryOrderStore::new());
    let order_id = link(
        &store,
        pending_order("ORD-1", "100.00"),
        payment_with_status(PaymentStatus::Paid, "100.00"),
    );

    let reconciler = OrderReconciler::new(store.clone(), None);
    let summary = reconciler.reconcile_pending().await.unwrap();

    assert_eq!(summary.orders_marked_paid, 1);
    assert_eq!(summary.amount_warnings, 0);
    assert_eq!(
        store.order(order_id).unwrap().status,
        OrderStatus::Paid.as_str()
    );
}

#[tokio::test]
async fn failed_and_refunded_payments_are_mirrored() {
    common::init_tracing();

    let store = Arc::new(InMemoryOrderStore::new());
    let failed_id = link(
        &store,
        pending_order("ORD-F", "50.00"),
        payment_with_status(PaymentStatus::Failed, "50.00"),
    );
    let refunded_id = link(
        &store,
        pending_order("ORD-R", "75.00"),
        payment_with_status(PaymentStatus::Refunded, "75.00"),
    );

    let reconciler = OrderReconciler::new(store.clone(), None);
    let summary = reconciler.reconcile_pending().await.unwrap();

    assert_eq!(summary.orders_marked_failed, 1);
    assert_eq!(summary.orders_marked_refunded, 1);
    assert_eq!(
        store.order(failed_id).unwrap().status,
        OrderStatus::Failed.as_str()
    );
    assert_eq!(
        store.order(refunded_id).unwrap().status,
        OrderStatus::Refunded.as_str()
    );
}

#[tokio::test]
async fn amount_disagreement_warns_but_still_marks_paid() {
    common::init_tracing();

    let store = Arc::new(InMemoryOrderStore::new());
    let order_id = link(
        &store,
        pending_order("ORD-1", "100.00"),
        payment_with_status(PaymentStatus::Paid, "95.00"),
    );

    let reconciler = OrderReconciler::new(store.clone(), None);
    let summary = reconciler.reconcile_pending().await.unwrap();

    assert_eq!(summary.orders_marked_paid, 1);
    assert_eq!(summary.amount_warnings, 1);
    assert_eq!(
        store.order(order_id).unwrap().status,
        OrderStatus::Paid.as_str()
    );
}

#[tokio::test]
async fn pending_payment_leaves_order_untouched() {
    common::init_tracing();

    let store = Arc::new(InMemoryOrderStore::new());
    let order_id = link(
        &store,
        pending_order("ORD-1", "100.00"),
        payment_with_status(PaymentStatus::Pending, "100.00"),
    );

    let reconciler = OrderReconciler::new(store.clone(), None);
    let summary = reconciler.reconcile_pending().await.unwrap();

    assert_eq!(summary, Default::default());
    assert_eq!(
        store.order(order_id).unwrap().status,
        OrderStatus::Pending.as_str()
    );
}

#[tokio::test]
async fn processed_notification_synthesizes_missing_payment() {
    common::init_tracing();

    let store = Arc::new(InMemoryOrderStore::new());
    let order = pending_order("ORD-42", "120.00");
    let order_id = order.order_id;
    store.insert_order(order);
    store.insert_notification(processed_notification("ORD-42", "120.00"));

    let reconciler = OrderReconciler::new(store.clone(), None);
    let summary = reconciler.reconcile_pending().await.unwrap();

    assert_eq!(summary.payments_synthesized, 1);
    assert_eq!(summary.orders_marked_paid, 1);

    let order = store.order(order_id).unwrap();
    assert_eq!(order.status, OrderStatus::Paid.as_str());
    let payment = store.payment_for_order(order_id).unwrap();
    assert_eq!(payment.status, PaymentStatus::Paid.as_str());
    assert_eq!(payment.amount, dec("120.00"));
}

#[tokio::test]
async fn order_without_payment_or_notification_stays_pending() {
    common::init_tracing();

    let store = Arc::new(InMemoryOrderStore::new());
    let order = pending_order("ORD-NONE", "10.00");
    let order_id = order.order_id;
    store.insert_order(order);

    let reconciler = OrderReconciler::new(store.clone(), None);
    let summary = reconciler.reconcile_pending().await.unwrap();

    assert_eq!(summary, Default::default());
    assert_eq!(
        store.order(order_id).unwrap().status,
        OrderStatus::Pending.as_str()
    );
}

#[tokio::test]
async fn gateway_recheck_corrects_stale_pending_payment() {
    common::init_tracing();

    let store = Arc::new(InMemoryOrderStore::new());
    let mut payment = payment_with_status(PaymentStatus::Pending, "100.00");
    payment.gateway_transaction_id = Some("gw-abc".to_string());
    let order_id = link(&store, pending_order("ORD-1", "100.00"), payment);

    let gateway = Arc::new(MockGatewayClient::new());
    gateway.respond_with(
        "gw-abc",
        GatewayStatus {
            status: "paid".to_string(),
            amount: dec("100.00"),
            currency: "USD".to_string(),
            paid_at: Some(Utc::now()),
            payment_method: Some("card".to_string()),
        },
    );

    let reconciler = OrderReconciler::new(store.clone(), Some(gateway));
    let summary = reconciler.reconcile_pending().await.unwrap();

    assert_eq!(summary.orders_marked_paid, 1);
    let order = store.order(order_id).unwrap();
    assert_eq!(order.status, OrderStatus::Paid.as_str());
    let payment = store.payment_for_order(order_id).unwrap();
    assert_eq!(payment.status, PaymentStatus::Paid.as_str());
    assert!(payment.paid_at.is_some());
}

#[tokio::test]
async fn gateway_outage_does_not_block_the_sweep() {
    common::init_tracing();

    let store = Arc::new(InMemoryOrderStore::new());
    let mut stale = payment_with_status(PaymentStatus::Pending, "100.00");
    stale.gateway_transaction_id = Some("gw-down".to_string());
    let stale_id = link(&store, pending_order("ORD-1", "100.00"), stale);
    let paid_id = link(
        &store,
        pending_order("ORD-2", "40.00"),
        payment_with_status(PaymentStatus::Paid, "40.00"),
    );

    let gateway = Arc::new(MockGatewayClient::new());
    gateway.fail_requests();

    let reconciler = OrderReconciler::new(store.clone(), Some(gateway));
    let summary = reconciler.reconcile_pending().await.unwrap();

    // the stale order stays pending, the other one still settles
    assert_eq!(summary.orders_marked_paid, 1);
    assert_eq!(
        store.order(stale_id).unwrap().status,
        OrderStatus::Pending.as_str()
    );
    assert_eq!(
        store.order(paid_id).unwrap().status,
        OrderStatus::Paid.as_str()
    );
}

#[tokio::test]
async fn discrepancy_sweep_reports_both_categories() {
    common::init_tracing();

    let store = Arc::new(InMemoryOrderStore::new());

    // paid order with no payment at all
    let mut orphan = pending_order("ORD-ORPHAN", "10.00");
    orphan.status = OrderStatus::Paid.as_str().to_string();
    let orphan_id = orphan.order_id;
    store.insert_order(orphan);

    // linked pair that disagrees on amount
    let mismatched_id = link(
        &store,
        pending_order("ORD-MISMATCH", "100.00"),
        payment_with_status(PaymentStatus::Paid, "90.00"),
    );

    let reconciler = OrderReconciler::new(store.clone(), None);
    let discrepancies = reconciler.discrepancy_sweep().await.unwrap();

    assert_eq!(discrepancies.len(), 2);

    let missing = discrepancies
        .iter()
        .find(|d| d.kind == OrderDiscrepancyKind::MissingPayment)
        .unwrap();
    assert_eq!(missing.order_id, orphan_id);
    assert!(missing.payment_id.is_none());

    let mismatch = discrepancies
        .iter()
        .find(|d| d.kind == OrderDiscrepancyKind::AmountMismatch)
        .unwrap();
    assert_eq!(mismatch.order_id, mismatched_id);
    assert_eq!(mismatch.order_amount, dec("100.00"));
    assert_eq!(mismatch.payment_amount, Some(dec("90.00")));

    // the sweep is read-only
    assert_eq!(
        store.order(orphan_id).unwrap().status,
        OrderStatus::Paid.as_str()
    );
    assert_eq!(
        store.order(mismatched_id).unwrap().status,
        OrderStatus::Pending.as_str()
    );
}
