//! Common test utilities for recon-service integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, Once};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use recon_core::error::AppError;
use recon_service::models::{
    GatewayNotification, NewItem, Order, OrderStatus, Payment, PaymentStatus, ReconciliationItem,
    ReconciliationRun, RunAggregates, RunFilter, RunScope, RunStatus,
};
use recon_service::services::database::{OrderStore, RunStore};
use recon_service::services::gateway::{GatewayClient, GatewayStatus};
use rust_decimal::Decimal;
use uuid::Uuid;

static INIT: Once = Once::new();

/// Initialize tracing for tests (only once).
pub fn init_tracing() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter("info,recon_service=debug")
            .with_test_writer()
            .try_init()
            .ok();
    });
}

pub fn dec(s: &str) -> Decimal {
    s.parse().expect("valid decimal literal")
}

// ============================================================================
// In-memory run store
// ============================================================================

#[derive(Default)]
struct RunState {
    runs: HashMap<Uuid, ReconciliationRun>,
    items: HashMap<Uuid, Vec<ReconciliationItem>>,
}

/// In-memory `RunStore` so orchestrator behavior can be tested without a
/// live database. `fail_complete` injects a store failure at finalization.
#[derive(Default)]
pub struct InMemoryRunStore {
    state: Mutex<RunState>,
    pub fail_complete: AtomicBool,
}

impl InMemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_complete(&self) {
        self.fail_complete.store(true, Ordering::SeqCst);
    }

    pub fn run(&self, run_id: Uuid) -> Option<ReconciliationRun> {
        self.state.lock().unwrap().runs.get(&run_id).cloned()
    }

    pub fn items(&self, run_id: Uuid) -> Vec<ReconciliationItem> {
        self.state
            .lock()
            .unwrap()
            .items
            .get(&run_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl RunStore for InMemoryRunStore {
    async fn create_run(&self, scope: &RunScope) -> Result<ReconciliationRun, AppError> {
        let run = ReconciliationRun {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            completed_at: None,
            status: RunStatus::Running.as_str().to_string(),
            period_start: scope.period_start,
            period_end: scope.period_end,
            county: scope.county.clone(),
            total_matched: 0,
            total_unmatched_app: 0,
            total_unmatched_gateway: 0,
            total_amount_mismatch: 0,
            total_app_amount: Decimal::ZERO,
            total_gateway_amount: Decimal::ZERO,
            error_message: None,
            metadata: scope.metadata.clone().unwrap_or(serde_json::Value::Null),
            created_by: scope.created_by.clone(),
        };
        self.state
            .lock()
            .unwrap()
            .runs
            .insert(run.run_id, run.clone());
        Ok(run)
    }

    async fn complete_run(
        &self,
        run_id: Uuid,
        items: &[NewItem],
        aggregates: &RunAggregates,
        status: RunStatus,
    ) -> Result<ReconciliationRun, AppError> {
        if self.fail_complete.swap(false, Ordering::SeqCst) {
            return Err(AppError::DatabaseError(anyhow::anyhow!(
                "injected store failure"
            )));
        }

        let mut state = self.state.lock().unwrap();
        let run = state
            .runs
            .get_mut(&run_id)
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("run {} not found", run_id)))?;
        if run.status != RunStatus::Running.as_str() {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "run {} is not running",
                run_id
            )));
        }

        run.status = status.as_str().to_string();
        run.completed_at = Some(Utc::now());
        run.total_matched = aggregates.total_matched;
        run.total_unmatched_app = aggregates.total_unmatched_app;
        run.total_unmatched_gateway = aggregates.total_unmatched_gateway;
        run.total_amount_mismatch = aggregates.total_amount_mismatch;
        run.total_app_amount = aggregates.total_app_amount;
        run.total_gateway_amount = aggregates.total_gateway_amount;
        let run = run.clone();

        let rows = items
            .iter()
            .map(|item| ReconciliationItem {
                item_id: Uuid::new_v4(),
                run_id,
                transaction_id: item.transaction_id.clone(),
                reference: item.reference.clone(),
                amount: item.amount,
                source: item.source.as_str().to_string(),
                reconciliation_status: item.status.as_str().to_string(),
                linked_transaction_id: item.linked_transaction_id.clone(),
                metadata: item.metadata.clone(),
                created_utc: Utc::now(),
            })
            .collect();
        state.items.insert(run_id, rows);

        Ok(run)
    }

    async fn fail_run(
        &self,
        run_id: Uuid,
        error_message: &str,
    ) -> Result<ReconciliationRun, AppError> {
        let mut state = self.state.lock().unwrap();
        let run = state
            .runs
            .get_mut(&run_id)
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("run {} not found", run_id)))?;
        if run.status != RunStatus::Running.as_str() {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "run {} is not running",
                run_id
            )));
        }
        run.status = RunStatus::Failed.as_str().to_string();
        run.completed_at = Some(Utc::now());
        run.error_message = Some(error_message.to_string());
        Ok(run.clone())
    }

    async fn get_run(&self, run_id: Uuid) -> Result<Option<ReconciliationRun>, AppError> {
        Ok(self.state.lock().unwrap().runs.get(&run_id).cloned())
    }

    async fn get_run_items(&self, run_id: Uuid) -> Result<Vec<ReconciliationItem>, AppError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .items
            .get(&run_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn list_runs(
        &self,
        filter: &RunFilter,
        page_size: i32,
        page_token: Option<&str>,
    ) -> Result<(Vec<ReconciliationRun>, Option<String>), AppError> {
        let cursor: Option<Uuid> = page_token
            .map(Uuid::parse_str)
            .transpose()
            .map_err(|_| AppError::BadRequest(anyhow::anyhow!("Invalid page_token")))?;

        let mut runs: Vec<ReconciliationRun> = self
            .state
            .lock()
            .unwrap()
            .runs
            .values()
            .filter(|r| filter.status.is_none_or(|s| r.status == s.as_str()))
            .filter(|r| {
                filter
                    .county
                    .as_deref()
                    .is_none_or(|c| r.county.as_deref() == Some(c))
            })
            // period overlap; periodless runs never match a period filter
            .filter(|r| {
                filter
                    .period_start
                    .is_none_or(|start| r.period_end.is_some_and(|end| end >= start))
            })
            .filter(|r| {
                filter
                    .period_end
                    .is_none_or(|end| r.period_start.is_some_and(|start| start <= end))
            })
            .filter(|r| cursor.is_none_or(|c| r.run_id > c))
            .cloned()
            .collect();
        runs.sort_by_key(|r| r.run_id);

        let limit = page_size.clamp(1, 100) as usize;
        let has_more = runs.len() > limit;
        runs.truncate(limit);
        let next_token = if has_more {
            runs.last().map(|r| r.run_id.to_string())
        } else {
            None
        };
        Ok((runs, next_token))
    }

    async fn delete_run(&self, run_id: Uuid) -> Result<bool, AppError> {
        let mut state = self.state.lock().unwrap();
        state.items.remove(&run_id);
        Ok(state.runs.remove(&run_id).is_some())
    }
}

// ============================================================================
// In-memory order store
// ============================================================================

#[derive(Default)]
struct OrderState {
    orders: HashMap<Uuid, Order>,
    payments: HashMap<Uuid, Payment>,
    notifications: Vec<GatewayNotification>,
}

#[derive(Default)]
pub struct InMemoryOrderStore {
    state: Mutex<OrderState>,
}

impl InMemoryOrderStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_order(&self, order: Order) {
        self.state
            .lock()
            .unwrap()
            .orders
            .insert(order.order_id, order);
    }

    pub fn insert_payment(&self, payment: Payment) {
        self.state
            .lock()
            .unwrap()
            .payments
            .insert(payment.payment_id, payment);
    }

    pub fn insert_notification(&self, notification: GatewayNotification) {
        self.state.lock().unwrap().notifications.push(notification);
    }

    pub fn order(&self, order_id: Uuid) -> Option<Order> {
        self.state.lock().unwrap().orders.get(&order_id).cloned()
    }

    pub fn payment_for_order(&self, order_id: Uuid) -> Option<Payment> {
        let state = self.state.lock().unwrap();
        let payment_id = state.orders.get(&order_id)?.payment_id?;
        state.payments.get(&payment_id).cloned()
    }
}

#[async_trait]
impl OrderStore for InMemoryOrderStore {
    async fn list_pending_orders(&self) -> Result<Vec<Order>, AppError> {
        let mut orders: Vec<Order> = self
            .state
            .lock()
            .unwrap()
            .orders
            .values()
            .filter(|o| o.status == OrderStatus::Pending.as_str())
            .cloned()
            .collect();
        orders.sort_by_key(|o| (o.created_utc, o.order_id));
        Ok(orders)
    }

    async fn get_payment(&self, payment_id: Uuid) -> Result<Option<Payment>, AppError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .payments
            .get(&payment_id)
            .cloned())
    }

    async fn update_order_status(
        &self,
        order_id: Uuid,
        status: OrderStatus,
    ) -> Result<(), AppError> {
        let mut state = self.state.lock().unwrap();
        let order = state
            .orders
            .get_mut(&order_id)
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("order {} not found", order_id)))?;
        order.status = status.as_str().to_string();
        order.updated_utc = Utc::now();
        Ok(())
    }

    async fn update_payment_status(
        &self,
        payment_id: Uuid,
        status: PaymentStatus,
        paid_at: Option<DateTime<Utc>>,
    ) -> Result<(), AppError> {
        let mut state = self.state.lock().unwrap();
        let payment = state.payments.get_mut(&payment_id).ok_or_else(|| {
            AppError::NotFound(anyhow::anyhow!("payment {} not found", payment_id))
        })?;
        payment.status = status.as_str().to_string();
        if paid_at.is_some() {
            payment.paid_at = paid_at;
        }
        Ok(())
    }

    async fn find_processed_notification(
        &self,
        reference: &str,
    ) -> Result<Option<GatewayNotification>, AppError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .notifications
            .iter()
            .filter(|n| n.reference == reference && n.status == "processed")
            .max_by_key(|n| n.received_utc)
            .cloned())
    }

    async fn create_payment_for_order(
        &self,
        order: &Order,
        notification: &GatewayNotification,
    ) -> Result<Payment, AppError> {
        let payment = Payment {
            payment_id: Uuid::new_v4(),
            order_id: Some(order.order_id),
            gateway_transaction_id: Some(notification.reference.clone()),
            amount: notification.amount,
            currency: notification.currency.clone(),
            status: PaymentStatus::Paid.as_str().to_string(),
            payment_method: notification.payment_method.clone(),
            paid_at: notification.paid_at,
            created_utc: Utc::now(),
        };
        let mut state = self.state.lock().unwrap();
        state.payments.insert(payment.payment_id, payment.clone());
        if let Some(order) = state.orders.get_mut(&order.order_id) {
            order.payment_id = Some(payment.payment_id);
            order.updated_utc = Utc::now();
        }
        Ok(payment)
    }

    async fn list_paid_orders_without_payment(&self) -> Result<Vec<Order>, AppError> {
        let mut orders: Vec<Order> = self
            .state
            .lock()
            .unwrap()
            .orders
            .values()
            .filter(|o| o.status == OrderStatus::Paid.as_str() && o.payment_id.is_none())
            .cloned()
            .collect();
        orders.sort_by_key(|o| (o.created_utc, o.order_id));
        Ok(orders)
    }

    async fn list_amount_mismatched_orders(&self) -> Result<Vec<(Order, Payment)>, AppError> {
        let state = self.state.lock().unwrap();
        let mut pairs: Vec<(Order, Payment)> = state
            .orders
            .values()
            .filter_map(|o| {
                let payment = state.payments.get(&o.payment_id?)?;
                (o.amount != payment.amount).then(|| (o.clone(), payment.clone()))
            })
            .collect();
        pairs.sort_by_key(|(o, _)| (o.created_utc, o.order_id));
        Ok(pairs)
    }
}

// ============================================================================
// Mock gateway client
// ============================================================================

/// Gateway client backed by a canned response table.
#[derive(Default)]
pub struct MockGatewayClient {
    responses: Mutex<HashMap<String, GatewayStatus>>,
    fail: AtomicBool,
}

impl MockGatewayClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond_with(&self, transaction_id: &str, status: GatewayStatus) {
        self.responses
            .lock()
            .unwrap()
            .insert(transaction_id.to_string(), status);
    }

    pub fn fail_requests(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl GatewayClient for MockGatewayClient {
    async fn query_status(&self, transaction_id: &str) -> Result<Option<GatewayStatus>, AppError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(AppError::GatewayError(anyhow::anyhow!(
                "gateway unavailable"
            )));
        }
        Ok(self
            .responses
            .lock()
            .unwrap()
            .get(transaction_id)
            .cloned())
    }
}

// ============================================================================
// Builders
// ============================================================================

pub fn pending_order(reference: &str, amount: &str) -> Order {
    Order {
        order_id: Uuid::new_v4(),
        reference: reference.to_string(),
        amount: dec(amount),
        status: OrderStatus::Pending.as_str().to_string(),
        payment_id: None,
        county: None,
        created_utc: Utc::now(),
        updated_utc: Utc::now(),
    }
}

pub fn payment_with_status(status: PaymentStatus, amount: &str) -> Payment {
    Payment {
        payment_id: Uuid::new_v4(),
        order_id: None,
        gateway_transaction_id: None,
        amount: dec(amount),
        currency: "USD".to_string(),
        status: status.as_str().to_string(),
        payment_method: Some("card".to_string()),
        paid_at: None,
        created_utc: Utc::now(),
    }
}

pub fn processed_notification(reference: &str, amount: &str) -> GatewayNotification {
    GatewayNotification {
        notification_id: Uuid::new_v4(),
        reference: reference.to_string(),
        status: "processed".to_string(),
        amount: dec(amount),
        currency: "USD".to_string(),
        payment_method: Some("card".to_string()),
        paid_at: Some(Utc::now()),
        received_utc: Utc::now(),
    }
}
