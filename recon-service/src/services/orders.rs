//! Order-vs-payment reconciler.
//!
//! Sweeps pending orders and settles each against its payment's status,
//! optionally re-checking locally `pending` payments with the gateway
//! before trusting the local row. A separate read-only sweep reports
//! discrepancies without mutating anything.

use std::sync::Arc;

use chrono::Utc;
use recon_core::error::AppError;
use tracing::{info, instrument, warn};

use crate::models::{
    Order, OrderDiscrepancy, OrderDiscrepancyKind, OrderReconcileSummary, OrderStatus, Payment,
    PaymentStatus,
};
use crate::services::database::OrderStore;
use crate::services::gateway::GatewayClient;
use crate::services::metrics::record_order_reconcile;

pub struct OrderReconciler {
    store: Arc<dyn OrderStore>,
    gateway: Option<Arc<dyn GatewayClient>>,
}

impl OrderReconciler {
    pub fn new(store: Arc<dyn OrderStore>, gateway: Option<Arc<dyn GatewayClient>>) -> Self {
        Self { store, gateway }
    }

    /// Reconcile every pending order against its payment. One order failing
    /// to resolve never aborts the sweep; it is logged and skipped.
    #[instrument(skip(self))]
    pub async fn reconcile_pending(&self) -> Result<OrderReconcileSummary, AppError> {
        let orders = self.store.list_pending_orders().await?;
        info!(pending = orders.len(), "Order reconciliation sweep started");

        let mut summary = OrderReconcileSummary::default();

        for order in &orders {
            match order.payment_id {
                Some(payment_id) => {
                    let Some(payment) = self.store.get_payment(payment_id).await? else {
                        warn!(
                            order_id = %order.order_id,
                            payment_id = %payment_id,
                            "Order references missing payment"
                        );
                        continue;
                    };
                    self.settle_with_payment(order, payment, &mut summary).await?;
                }
                None => {
                    self.settle_from_notification(order, &mut summary).await?;
                }
            }
        }

        info!(
            marked_paid = summary.orders_marked_paid,
            marked_failed = summary.orders_marked_failed,
            marked_refunded = summary.orders_marked_refunded,
            synthesized = summary.payments_synthesized,
            amount_warnings = summary.amount_warnings,
            "Order reconciliation sweep completed"
        );

        Ok(summary)
    }

    async fn settle_with_payment(
        &self,
        order: &Order,
        payment: Payment,
        summary: &mut OrderReconcileSummary,
    ) -> Result<(), AppError> {
        let mut payment = payment;
        let mut status = PaymentStatus::from_str(&payment.status);

        // A locally pending payment may have settled on the gateway side
        // without the notification ever arriving.
        if status == PaymentStatus::Pending {
            if let (Some(client), Some(txn_id)) =
                (&self.gateway, payment.gateway_transaction_id.as_deref())
            {
                match client.query_status(txn_id).await {
                    Ok(Some(gateway_status)) => {
                        let remote = PaymentStatus::from_str(&gateway_status.status);
                        if remote != PaymentStatus::Pending {
                            info!(
                                payment_id = %payment.payment_id,
                                local = payment.status,
                                remote = gateway_status.status,
                                "Gateway disagrees with local payment status"
                            );
                            self.store
                                .update_payment_status(
                                    payment.payment_id,
                                    remote,
                                    gateway_status.paid_at.or_else(|| Some(Utc::now())),
                                )
                                .await?;
                            record_order_reconcile("payment_status_corrected");
                            payment.status = remote.as_str().to_string();
                            status = remote;
                        }
                    }
                    Ok(None) => {
                        warn!(
                            payment_id = %payment.payment_id,
                            transaction_id = txn_id,
                            "Gateway does not know this transaction"
                        );
                    }
                    Err(e) => {
                        // Gateway being down must not block the sweep.
                        warn!(
                            payment_id = %payment.payment_id,
                            error = %e,
                            "Gateway status check failed"
                        );
                    }
                }
            }
        }

        match status {
            PaymentStatus::Paid => {
                if order.amount != payment.amount {
                    warn!(
                        order_id = %order.order_id,
                        payment_id = %payment.payment_id,
                        order_amount = %order.amount,
                        payment_amount = %payment.amount,
                        "Order and payment amounts disagree; marking paid anyway"
                    );
                    summary.amount_warnings += 1;
                    record_order_reconcile("amount_warning");
                }
                self.store
                    .update_order_status(order.order_id, OrderStatus::Paid)
                    .await?;
                summary.orders_marked_paid += 1;
                record_order_reconcile("marked_paid");
            }
            PaymentStatus::Failed => {
                self.store
                    .update_order_status(order.order_id, OrderStatus::Failed)
                    .await?;
                summary.orders_marked_failed += 1;
                record_order_reconcile("marked_failed");
            }
            PaymentStatus::Refunded => {
                self.store
                    .update_order_status(order.order_id, OrderStatus::Refunded)
                    .await?;
                summary.orders_marked_refunded += 1;
                record_order_reconcile("marked_refunded");
            }
            PaymentStatus::Pending => {
                // Still pending on both sides; leave the order alone.
            }
        }

        Ok(())
    }

    /// An order without a payment can still have been paid: a processed
    /// gateway notification for its reference is proof, and the missing
    /// payment row is synthesized from it.
    async fn settle_from_notification(
        &self,
        order: &Order,
        summary: &mut OrderReconcileSummary,
    ) -> Result<(), AppError> {
        let Some(notification) = self
            .store
            .find_processed_notification(&order.reference)
            .await?
        else {
            return Ok(());
        };

        info!(
            order_id = %order.order_id,
            reference = %order.reference,
            "Processed gateway notification found for unpaid order"
        );

        if order.amount != notification.amount {
            warn!(
                order_id = %order.order_id,
                order_amount = %order.amount,
                notification_amount = %notification.amount,
                "Notification amount disagrees with order; synthesizing anyway"
            );
            summary.amount_warnings += 1;
            record_order_reconcile("amount_warning");
        }

        self.store
            .create_payment_for_order(order, &notification)
            .await?;
        summary.payments_synthesized += 1;
        record_order_reconcile("payment_synthesized");

        self.store
            .update_order_status(order.order_id, OrderStatus::Paid)
            .await?;
        summary.orders_marked_paid += 1;
        record_order_reconcile("marked_paid");

        Ok(())
    }

    /// Read-only discrepancy report: paid orders with no payment, and
    /// order/payment pairs that disagree on amount. Never mutates state.
    #[instrument(skip(self))]
    pub async fn discrepancy_sweep(&self) -> Result<Vec<OrderDiscrepancy>, AppError> {
        let mut discrepancies = Vec::new();

        for order in self.store.list_paid_orders_without_payment().await? {
            warn!(
                order_id = %order.order_id,
                reference = %order.reference,
                "Paid order has no payment"
            );
            discrepancies.push(OrderDiscrepancy {
                kind: OrderDiscrepancyKind::MissingPayment,
                order_id: order.order_id,
                payment_id: None,
                order_amount: order.amount,
                payment_amount: None,
                detail: format!("order {} is paid but has no payment", order.reference),
            });
        }

        for (order, payment) in self.store.list_amount_mismatched_orders().await? {
            warn!(
                order_id = %order.order_id,
                payment_id = %payment.payment_id,
                order_amount = %order.amount,
                payment_amount = %payment.amount,
                "Order and payment amounts disagree"
            );
            discrepancies.push(OrderDiscrepancy {
                kind: OrderDiscrepancyKind::AmountMismatch,
                order_id: order.order_id,
                payment_id: Some(payment.payment_id),
                order_amount: order.amount,
                payment_amount: Some(payment.amount),
                detail: format!(
                    "order {} amount {} != payment amount {}",
                    order.reference, order.amount, payment.amount
                ),
            });
        }

        info!(count = discrepancies.len(), "Discrepancy sweep completed");

        Ok(discrepancies)
    }
}
