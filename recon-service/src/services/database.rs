//! Database service for recon-service.

#![allow(clippy::too_many_arguments)]

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use recon_core::error::AppError;
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::{info, instrument};
use uuid::Uuid;

use crate::models::{
    GatewayNotification, NewItem, Order, OrderStatus, Payment, PaymentStatus, ReconciliationItem,
    ReconciliationRun, RunAggregates, RunFilter, RunScope, RunStatus,
};
use crate::services::metrics::DB_QUERY_DURATION;

/// Persistence boundary for reconciliation runs and their items.
///
/// A run's items, aggregates, and terminal status land in one atomic write:
/// an observer can never see a `success` run with a partial item set.
#[async_trait]
pub trait RunStore: Send + Sync {
    async fn create_run(&self, scope: &RunScope) -> Result<ReconciliationRun, AppError>;

    async fn complete_run(
        &self,
        run_id: Uuid,
        items: &[NewItem],
        aggregates: &RunAggregates,
        status: RunStatus,
    ) -> Result<ReconciliationRun, AppError>;

    /// Finalize a run as `failed`, discarding any not-yet-written items.
    async fn fail_run(
        &self,
        run_id: Uuid,
        error_message: &str,
    ) -> Result<ReconciliationRun, AppError>;

    async fn get_run(&self, run_id: Uuid) -> Result<Option<ReconciliationRun>, AppError>;

    async fn get_run_items(&self, run_id: Uuid) -> Result<Vec<ReconciliationItem>, AppError>;

    async fn list_runs(
        &self,
        filter: &RunFilter,
        page_size: i32,
        page_token: Option<&str>,
    ) -> Result<(Vec<ReconciliationRun>, Option<String>), AppError>;

    /// Delete a run and, through ownership, every item it produced.
    async fn delete_run(&self, run_id: Uuid) -> Result<bool, AppError>;
}

/// Persistence boundary for the order-vs-payment reconciler.
#[async_trait]
pub trait OrderStore: Send + Sync {
    async fn list_pending_orders(&self) -> Result<Vec<Order>, AppError>;

    async fn get_payment(&self, payment_id: Uuid) -> Result<Option<Payment>, AppError>;

    async fn update_order_status(&self, order_id: Uuid, status: OrderStatus)
        -> Result<(), AppError>;

    async fn update_payment_status(
        &self,
        payment_id: Uuid,
        status: PaymentStatus,
        paid_at: Option<DateTime<Utc>>,
    ) -> Result<(), AppError>;

    async fn find_processed_notification(
        &self,
        reference: &str,
    ) -> Result<Option<GatewayNotification>, AppError>;

    /// Synthesize the payment row a processed gateway notification proves
    /// happened, and link it to the order.
    async fn create_payment_for_order(
        &self,
        order: &Order,
        notification: &GatewayNotification,
    ) -> Result<Payment, AppError>;

    async fn list_paid_orders_without_payment(&self) -> Result<Vec<Order>, AppError>;

    async fn list_amount_mismatched_orders(&self) -> Result<Vec<(Order, Payment)>, AppError>;
}

const RUN_COLUMNS: &str = "run_id, started_at, completed_at, status, period_start, period_end, county, total_matched, total_unmatched_app, total_unmatched_gateway, total_amount_mismatch, total_app_amount, total_gateway_amount, error_message, metadata, created_by";

const ORDER_COLUMNS: &str =
    "order_id, reference, amount, status, payment_id, county, created_utc, updated_utc";

const PAYMENT_COLUMNS: &str = "payment_id, order_id, gateway_transaction_id, amount, currency, status, payment_method, paid_at, created_utc";

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "recon-service"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Check database health.
    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["health_check"])
            .start_timer();

        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Health check failed: {}", e)))?;

        timer.observe_duration();
        Ok(())
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }
}

// =============================================================================
// Run Store
// =============================================================================

#[async_trait]
impl RunStore for Database {
    #[instrument(skip(self, scope))]
    async fn create_run(&self, scope: &RunScope) -> Result<ReconciliationRun, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_run"])
            .start_timer();

        let run_id = Uuid::new_v4();
        let metadata = scope.metadata.clone().unwrap_or(serde_json::Value::Null);

        let run = sqlx::query_as::<_, ReconciliationRun>(&format!(
            r#"
            INSERT INTO reconciliation_runs (run_id, status, period_start, period_end, county, metadata, created_by)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING {RUN_COLUMNS}
            "#,
        ))
        .bind(run_id)
        .bind(RunStatus::Running.as_str())
        .bind(scope.period_start)
        .bind(scope.period_end)
        .bind(scope.county.as_deref())
        .bind(metadata)
        .bind(scope.created_by.as_deref())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to create run: {}", e)))?;

        timer.observe_duration();
        info!(run_id = %run.run_id, "Reconciliation run created");

        Ok(run)
    }

    #[instrument(skip(self, items, aggregates), fields(run_id = %run_id, item_count = items.len()))]
    async fn complete_run(
        &self,
        run_id: Uuid,
        items: &[NewItem],
        aggregates: &RunAggregates,
        status: RunStatus,
    ) -> Result<ReconciliationRun, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["complete_run"])
            .start_timer();

        let mut tx = self.pool.begin().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })?;

        for item in items {
            sqlx::query(
                r#"
                INSERT INTO reconciliation_items (item_id, run_id, transaction_id, reference, amount, source, reconciliation_status, linked_transaction_id, metadata)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(run_id)
            .bind(item.transaction_id.as_deref())
            .bind(item.reference.as_deref())
            .bind(item.amount)
            .bind(item.source.as_str())
            .bind(item.status.as_str())
            .bind(item.linked_transaction_id.as_deref())
            .bind(item.metadata.clone())
            .execute(&mut *tx)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to insert item: {}", e)))?;
        }

        // The status guard enforces mutate-once: a run leaves `running`
        // exactly one time.
        let run = sqlx::query_as::<_, ReconciliationRun>(&format!(
            r#"
            UPDATE reconciliation_runs
            SET status = $2,
                completed_at = now(),
                total_matched = $3,
                total_unmatched_app = $4,
                total_unmatched_gateway = $5,
                total_amount_mismatch = $6,
                total_app_amount = $7,
                total_gateway_amount = $8
            WHERE run_id = $1 AND status = 'running'
            RETURNING {RUN_COLUMNS}
            "#,
        ))
        .bind(run_id)
        .bind(status.as_str())
        .bind(aggregates.total_matched)
        .bind(aggregates.total_unmatched_app)
        .bind(aggregates.total_unmatched_gateway)
        .bind(aggregates.total_amount_mismatch)
        .bind(aggregates.total_app_amount)
        .bind(aggregates.total_gateway_amount)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to finalize run: {}", e)))?
        .ok_or_else(|| AppError::Conflict(anyhow::anyhow!("Run {} is not running", run_id)))?;

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit run: {}", e))
        })?;

        timer.observe_duration();
        info!(run_id = %run.run_id, status = %run.status, "Reconciliation run finalized");

        Ok(run)
    }

    #[instrument(skip(self), fields(run_id = %run_id))]
    async fn fail_run(
        &self,
        run_id: Uuid,
        error_message: &str,
    ) -> Result<ReconciliationRun, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["fail_run"])
            .start_timer();

        let run = sqlx::query_as::<_, ReconciliationRun>(&format!(
            r#"
            UPDATE reconciliation_runs
            SET status = 'failed', completed_at = now(), error_message = $2
            WHERE run_id = $1 AND status = 'running'
            RETURNING {RUN_COLUMNS}
            "#,
        ))
        .bind(run_id)
        .bind(error_message)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to fail run: {}", e)))?
        .ok_or_else(|| AppError::Conflict(anyhow::anyhow!("Run {} is not running", run_id)))?;

        timer.observe_duration();

        Ok(run)
    }

    #[instrument(skip(self), fields(run_id = %run_id))]
    async fn get_run(&self, run_id: Uuid) -> Result<Option<ReconciliationRun>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_run"])
            .start_timer();

        let run = sqlx::query_as::<_, ReconciliationRun>(&format!(
            "SELECT {RUN_COLUMNS} FROM reconciliation_runs WHERE run_id = $1",
        ))
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get run: {}", e)))?;

        timer.observe_duration();

        Ok(run)
    }

    #[instrument(skip(self), fields(run_id = %run_id))]
    async fn get_run_items(&self, run_id: Uuid) -> Result<Vec<ReconciliationItem>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_run_items"])
            .start_timer();

        let items = sqlx::query_as::<_, ReconciliationItem>(
            r#"
            SELECT item_id, run_id, transaction_id, reference, amount, source, reconciliation_status, linked_transaction_id, metadata, created_utc
            FROM reconciliation_items
            WHERE run_id = $1
            ORDER BY created_utc, item_id
            "#,
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get run items: {}", e)))?;

        timer.observe_duration();

        Ok(items)
    }

    #[instrument(skip(self, filter))]
    async fn list_runs(
        &self,
        filter: &RunFilter,
        page_size: i32,
        page_token: Option<&str>,
    ) -> Result<(Vec<ReconciliationRun>, Option<String>), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_runs"])
            .start_timer();

        let limit = page_size.clamp(1, 100) as i64;
        let cursor: Option<Uuid> = page_token
            .map(Uuid::parse_str)
            .transpose()
            .map_err(|_| AppError::BadRequest(anyhow::anyhow!("Invalid page_token")))?;

        // Period filtering is by overlap: a run matches when its period
        // intersects the requested window. Runs without a period never
        // match a period filter.
        let runs = sqlx::query_as::<_, ReconciliationRun>(&format!(
            r#"
            SELECT {RUN_COLUMNS}
            FROM reconciliation_runs
            WHERE ($1::text IS NULL OR status = $1)
              AND ($2::date IS NULL OR (period_end IS NOT NULL AND period_end >= $2))
              AND ($3::date IS NULL OR (period_start IS NOT NULL AND period_start <= $3))
              AND ($4::text IS NULL OR county = $4)
              AND ($5::uuid IS NULL OR run_id > $5)
            ORDER BY run_id
            LIMIT $6
            "#,
        ))
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.period_start)
        .bind(filter.period_end)
        .bind(filter.county.as_deref())
        .bind(cursor)
        .bind(limit + 1)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to list runs: {}", e)))?;

        timer.observe_duration();

        let has_more = runs.len() > limit as usize;
        let mut runs = runs;
        if has_more {
            runs.pop();
        }
        let next_token = if has_more {
            runs.last().map(|r| r.run_id.to_string())
        } else {
            None
        };

        Ok((runs, next_token))
    }

    #[instrument(skip(self), fields(run_id = %run_id))]
    async fn delete_run(&self, run_id: Uuid) -> Result<bool, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["delete_run"])
            .start_timer();

        // Items go with the run via the FK cascade.
        let result = sqlx::query("DELETE FROM reconciliation_runs WHERE run_id = $1")
            .bind(run_id)
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to delete run: {}", e)))?;

        timer.observe_duration();

        Ok(result.rows_affected() > 0)
    }
}

// =============================================================================
// Order Store
// =============================================================================

#[async_trait]
impl OrderStore for Database {
    #[instrument(skip(self))]
    async fn list_pending_orders(&self) -> Result<Vec<Order>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_pending_orders"])
            .start_timer();

        let orders = sqlx::query_as::<_, Order>(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders WHERE status = 'pending' ORDER BY created_utc, order_id",
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to list pending orders: {}", e))
        })?;

        timer.observe_duration();

        Ok(orders)
    }

    #[instrument(skip(self), fields(payment_id = %payment_id))]
    async fn get_payment(&self, payment_id: Uuid) -> Result<Option<Payment>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_payment"])
            .start_timer();

        let payment = sqlx::query_as::<_, Payment>(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments WHERE payment_id = $1",
        ))
        .bind(payment_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get payment: {}", e)))?;

        timer.observe_duration();

        Ok(payment)
    }

    #[instrument(skip(self), fields(order_id = %order_id))]
    async fn update_order_status(
        &self,
        order_id: Uuid,
        status: OrderStatus,
    ) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["update_order_status"])
            .start_timer();

        sqlx::query("UPDATE orders SET status = $2, updated_utc = now() WHERE order_id = $1")
            .bind(order_id)
            .bind(status.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| {
                AppError::DatabaseError(anyhow::anyhow!("Failed to update order status: {}", e))
            })?;

        timer.observe_duration();
        info!(order_id = %order_id, status = status.as_str(), "Order status updated");

        Ok(())
    }

    #[instrument(skip(self), fields(payment_id = %payment_id))]
    async fn update_payment_status(
        &self,
        payment_id: Uuid,
        status: PaymentStatus,
        paid_at: Option<DateTime<Utc>>,
    ) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["update_payment_status"])
            .start_timer();

        sqlx::query(
            "UPDATE payments SET status = $2, paid_at = COALESCE($3, paid_at) WHERE payment_id = $1",
        )
        .bind(payment_id)
        .bind(status.as_str())
        .bind(paid_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to update payment status: {}", e))
        })?;

        timer.observe_duration();

        Ok(())
    }

    #[instrument(skip(self), fields(reference = %reference))]
    async fn find_processed_notification(
        &self,
        reference: &str,
    ) -> Result<Option<GatewayNotification>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_processed_notification"])
            .start_timer();

        let notification = sqlx::query_as::<_, GatewayNotification>(
            r#"
            SELECT notification_id, reference, status, amount, currency, payment_method, paid_at, received_utc
            FROM gateway_notifications
            WHERE reference = $1 AND status = 'processed'
            ORDER BY received_utc DESC
            LIMIT 1
            "#,
        )
        .bind(reference)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to find notification: {}", e))
        })?;

        timer.observe_duration();

        Ok(notification)
    }

    #[instrument(skip(self, notification), fields(order_id = %order.order_id))]
    async fn create_payment_for_order(
        &self,
        order: &Order,
        notification: &GatewayNotification,
    ) -> Result<Payment, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_payment_for_order"])
            .start_timer();

        let mut tx = self.pool.begin().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })?;

        let payment_id = Uuid::new_v4();
        let payment = sqlx::query_as::<_, Payment>(&format!(
            r#"
            INSERT INTO payments (payment_id, order_id, gateway_transaction_id, amount, currency, status, payment_method, paid_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING {PAYMENT_COLUMNS}
            "#,
        ))
        .bind(payment_id)
        .bind(order.order_id)
        .bind(notification.reference.as_str())
        .bind(notification.amount)
        .bind(notification.currency.as_str())
        .bind(PaymentStatus::Paid.as_str())
        .bind(notification.payment_method.as_deref())
        .bind(notification.paid_at)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to create payment: {}", e)))?;

        sqlx::query("UPDATE orders SET payment_id = $2, updated_utc = now() WHERE order_id = $1")
            .bind(order.order_id)
            .bind(payment_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                AppError::DatabaseError(anyhow::anyhow!("Failed to link payment to order: {}", e))
            })?;

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit payment: {}", e))
        })?;

        timer.observe_duration();
        info!(
            order_id = %order.order_id,
            payment_id = %payment.payment_id,
            "Payment synthesized from gateway notification"
        );

        Ok(payment)
    }

    #[instrument(skip(self))]
    async fn list_paid_orders_without_payment(&self) -> Result<Vec<Order>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_paid_orders_without_payment"])
            .start_timer();

        let orders = sqlx::query_as::<_, Order>(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders WHERE status = 'paid' AND payment_id IS NULL ORDER BY created_utc, order_id",
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to list paid orders: {}", e))
        })?;

        timer.observe_duration();

        Ok(orders)
    }

    #[instrument(skip(self))]
    async fn list_amount_mismatched_orders(&self) -> Result<Vec<(Order, Payment)>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_amount_mismatched_orders"])
            .start_timer();

        let rows = sqlx::query_as::<_, MismatchedPair>(
            r#"
            SELECT o.order_id, o.reference, o.amount, o.status, o.payment_id, o.county, o.created_utc, o.updated_utc,
                   p.payment_id AS p_payment_id, p.order_id AS p_order_id, p.gateway_transaction_id,
                   p.amount AS p_amount, p.currency, p.status AS p_status, p.payment_method, p.paid_at,
                   p.created_utc AS p_created_utc
            FROM orders o
            JOIN payments p ON p.payment_id = o.payment_id
            WHERE o.amount <> p.amount
            ORDER BY o.created_utc, o.order_id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to list mismatched orders: {}", e))
        })?;

        timer.observe_duration();

        Ok(rows.into_iter().map(MismatchedPair::split).collect())
    }
}

/// Flattened join row for the order/payment amount-mismatch sweep.
#[derive(sqlx::FromRow)]
struct MismatchedPair {
    order_id: Uuid,
    reference: String,
    amount: rust_decimal::Decimal,
    status: String,
    payment_id: Option<Uuid>,
    county: Option<String>,
    created_utc: DateTime<Utc>,
    updated_utc: DateTime<Utc>,
    p_payment_id: Uuid,
    p_order_id: Option<Uuid>,
    gateway_transaction_id: Option<String>,
    p_amount: rust_decimal::Decimal,
    currency: String,
    p_status: String,
    payment_method: Option<String>,
    paid_at: Option<DateTime<Utc>>,
    p_created_utc: DateTime<Utc>,
}

impl MismatchedPair {
    fn split(self) -> (Order, Payment) {
        (
            Order {
                order_id: self.order_id,
                reference: self.reference,
                amount: self.amount,
                status: self.status,
                payment_id: self.payment_id,
                county: self.county,
                created_utc: self.created_utc,
                updated_utc: self.updated_utc,
            },
            Payment {
                payment_id: self.p_payment_id,
                order_id: self.p_order_id,
                gateway_transaction_id: self.gateway_transaction_id,
                amount: self.p_amount,
                currency: self.currency,
                status: self.p_status,
                payment_method: self.payment_method,
                paid_at: self.paid_at,
                created_utc: self.p_created_utc,
            },
        )
    }
}
