//! Domain models for recon-service.

#![allow(clippy::should_implement_trait)]

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

// ============================================================================
// Transaction Records (matcher input, not persisted directly)
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionSource {
    App,
    Gateway,
}

impl TransactionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::App => "app",
            Self::Gateway => "gateway",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "gateway" => Self::Gateway,
            _ => Self::App,
        }
    }
}

/// One transaction-like record from either ledger. This is the unit the
/// matcher operates on; persistence only happens through run items.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub transaction_id: Option<String>,
    pub reference: Option<String>,
    pub amount: Decimal,
    pub date: Option<NaiveDate>,
    pub source: TransactionSource,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl TransactionRecord {
    pub fn new(source: TransactionSource, amount: Decimal) -> Self {
        Self {
            transaction_id: None,
            reference: None,
            amount,
            date: None,
            source,
            metadata: serde_json::Value::Null,
        }
    }

    pub fn app(amount: Decimal) -> Self {
        Self::new(TransactionSource::App, amount)
    }

    pub fn gateway(amount: Decimal) -> Self {
        Self::new(TransactionSource::Gateway, amount)
    }

    pub fn with_transaction_id(mut self, id: impl Into<String>) -> Self {
        self.transaction_id = Some(id.into());
        self
    }

    pub fn with_reference(mut self, reference: impl Into<String>) -> Self {
        self.reference = Some(reference.into());
        self
    }

    pub fn with_date(mut self, date: NaiveDate) -> Self {
        self.date = Some(date);
        self
    }

    /// Parse and attach a business date. A malformed date leaves the record
    /// dateless rather than rejecting it; the tolerance policy decides what
    /// a missing date means during matching.
    pub fn with_date_str(mut self, date: &str) -> Self {
        self.date = parse_business_date(date);
        self
    }

    /// A record with neither identifier nor date can never be matched by any
    /// strategy except amount+date, which it also fails. Callers may use
    /// this to pre-filter garbage rows.
    pub fn has_identity(&self) -> bool {
        self.transaction_id.as_deref().is_some_and(|s| !s.is_empty())
            || self.reference.as_deref().is_some_and(|s| !s.is_empty())
            || self.date.is_some()
    }
}

/// Accepts `YYYY-MM-DD` or RFC 3339; anything else is treated as absent.
pub fn parse_business_date(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .or_else(|| DateTime::parse_from_rfc3339(s).ok().map(|dt| dt.date_naive()))
}

// ============================================================================
// Run Models
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Running,
    Success,
    Partial,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Success => "success",
            Self::Partial => "partial",
            Self::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "success" => Self::Success,
            "partial" => Self::Partial,
            "failed" => Self::Failed,
            _ => Self::Running,
        }
    }
}

/// One reconciliation execution. Created in `running` state and finalized
/// exactly once; a completed run is an immutable historical record.
#[derive(Debug, Clone, FromRow)]
pub struct ReconciliationRun {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: String,
    pub period_start: Option<NaiveDate>,
    pub period_end: Option<NaiveDate>,
    pub county: Option<String>,
    pub total_matched: i64,
    pub total_unmatched_app: i64,
    pub total_unmatched_gateway: i64,
    pub total_amount_mismatch: i64,
    pub total_app_amount: Decimal,
    pub total_gateway_amount: Decimal,
    pub error_message: Option<String>,
    pub metadata: serde_json::Value,
    pub created_by: Option<String>,
}

/// Caller-supplied scope for a run (audit metadata, never matching input).
#[derive(Debug, Clone, Default)]
pub struct RunScope {
    pub period_start: Option<NaiveDate>,
    pub period_end: Option<NaiveDate>,
    pub county: Option<String>,
    pub created_by: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

/// Aggregate counters computed over a finished classification pass.
/// `total_matched` and `total_amount_mismatch` count pairs, not item rows.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunAggregates {
    pub total_matched: i64,
    pub total_unmatched_app: i64,
    pub total_unmatched_gateway: i64,
    pub total_amount_mismatch: i64,
    pub total_app_amount: Decimal,
    pub total_gateway_amount: Decimal,
}

impl RunAggregates {
    /// Unmatched rows plus mismatched pairs; feeds the partial-run decision.
    pub fn discrepancies(&self) -> i64 {
        self.total_unmatched_app + self.total_unmatched_gateway + self.total_amount_mismatch
    }
}

/// Filter for listing historical runs.
#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    pub status: Option<RunStatus>,
    pub period_start: Option<NaiveDate>,
    pub period_end: Option<NaiveDate>,
    pub county: Option<String>,
}

// ============================================================================
// Item Models
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemStatus {
    Matched,
    UnmatchedApp,
    UnmatchedGateway,
    AmountMismatch,
}

impl ItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Matched => "matched",
            Self::UnmatchedApp => "unmatched_app",
            Self::UnmatchedGateway => "unmatched_gateway",
            Self::AmountMismatch => "amount_mismatch",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "matched" => Self::Matched,
            "unmatched_gateway" => Self::UnmatchedGateway,
            "amount_mismatch" => Self::AmountMismatch,
            _ => Self::UnmatchedApp,
        }
    }
}

/// One transaction's recorded outcome within a run. Write-once; items are
/// owned by their run and never shared across runs.
#[derive(Debug, Clone, FromRow)]
pub struct ReconciliationItem {
    pub item_id: Uuid,
    pub run_id: Uuid,
    pub transaction_id: Option<String>,
    pub reference: Option<String>,
    pub amount: Decimal,
    pub source: String,
    pub reconciliation_status: String,
    pub linked_transaction_id: Option<String>,
    pub metadata: serde_json::Value,
    pub created_utc: DateTime<Utc>,
}

/// An item before persistence. The store assigns `item_id`/`run_id` when the
/// run is finalized.
#[derive(Debug, Clone)]
pub struct NewItem {
    pub transaction_id: Option<String>,
    pub reference: Option<String>,
    pub amount: Decimal,
    pub source: TransactionSource,
    pub status: ItemStatus,
    pub linked_transaction_id: Option<String>,
    pub metadata: serde_json::Value,
}

impl NewItem {
    pub fn from_record(
        record: &TransactionRecord,
        status: ItemStatus,
        linked_transaction_id: Option<String>,
    ) -> Self {
        Self {
            transaction_id: record.transaction_id.clone(),
            reference: record.reference.clone(),
            amount: record.amount,
            source: record.source,
            status,
            linked_transaction_id,
            metadata: record.metadata.clone(),
        }
    }
}

// ============================================================================
// Order / Payment Models (order reconciler)
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderStatus {
    Pending,
    Paid,
    Failed,
    Refunded,
    Cancelled,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Paid => "paid",
            Self::Failed => "failed",
            Self::Refunded => "refunded",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "paid" => Self::Paid,
            "failed" => Self::Failed,
            "refunded" => Self::Refunded,
            "cancelled" => Self::Cancelled,
            _ => Self::Pending,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentStatus {
    Pending,
    Paid,
    Failed,
    Refunded,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Paid => "paid",
            Self::Failed => "failed",
            Self::Refunded => "refunded",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "paid" => Self::Paid,
            "failed" => Self::Failed,
            "refunded" => Self::Refunded,
            _ => Self::Pending,
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct Order {
    pub order_id: Uuid,
    pub reference: String,
    pub amount: Decimal,
    pub status: String,
    pub payment_id: Option<Uuid>,
    pub county: Option<String>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct Payment {
    pub payment_id: Uuid,
    pub order_id: Option<Uuid>,
    pub gateway_transaction_id: Option<String>,
    pub amount: Decimal,
    pub currency: String,
    pub status: String,
    pub payment_method: Option<String>,
    pub paid_at: Option<DateTime<Utc>>,
    pub created_utc: DateTime<Utc>,
}

/// A gateway-side webhook/notification event recorded by the intake
/// collaborator. The order reconciler consumes `processed` events to
/// synthesize payments that never landed locally.
#[derive(Debug, Clone, FromRow)]
pub struct GatewayNotification {
    pub notification_id: Uuid,
    pub reference: String,
    pub status: String,
    pub amount: Decimal,
    pub currency: String,
    pub payment_method: Option<String>,
    pub paid_at: Option<DateTime<Utc>>,
    pub received_utc: DateTime<Utc>,
}

// ============================================================================
// Order Discrepancies
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderDiscrepancyKind {
    /// Order marked paid with no payment linked to it.
    MissingPayment,
    /// Linked order and payment disagree on amount.
    AmountMismatch,
}

impl OrderDiscrepancyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MissingPayment => "missing_payment",
            Self::AmountMismatch => "amount_mismatch",
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrderDiscrepancy {
    pub kind: OrderDiscrepancyKind,
    pub order_id: Uuid,
    pub payment_id: Option<Uuid>,
    pub order_amount: Decimal,
    pub payment_amount: Option<Decimal>,
    pub detail: String,
}

/// Outcome counters for one order-reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OrderReconcileSummary {
    pub orders_marked_paid: u32,
    pub orders_marked_failed: u32,
    pub orders_marked_refunded: u32,
    pub payments_synthesized: u32,
    pub amount_warnings: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_and_rfc3339_dates() {
        let expected = NaiveDate::from_ymd_opt(2024, 3, 7).unwrap();
        assert_eq!(parse_business_date("2024-03-07"), Some(expected));
        assert_eq!(parse_business_date("2024-03-07T10:30:00Z"), Some(expected));
        assert_eq!(parse_business_date("07/03/2024"), None);
        assert_eq!(parse_business_date(""), None);
    }

    #[test]
    fn malformed_date_leaves_record_dateless() {
        let record = TransactionRecord::app(Decimal::new(100, 0)).with_date_str("not-a-date");
        assert!(record.date.is_none());
    }

    #[test]
    fn unknown_status_strings_fall_back() {
        assert_eq!(RunStatus::from_str("bogus"), RunStatus::Running);
        assert_eq!(ItemStatus::from_str("bogus"), ItemStatus::UnmatchedApp);
        assert_eq!(OrderStatus::from_str("bogus"), OrderStatus::Pending);
        assert_eq!(PaymentStatus::from_str("bogus"), PaymentStatus::Pending);
    }

    #[test]
    fn has_identity_requires_a_usable_field() {
        assert!(!TransactionRecord::app(Decimal::ONE).has_identity());
        assert!(TransactionRecord::app(Decimal::ONE)
            .with_transaction_id("T-1")
            .has_identity());
        assert!(TransactionRecord::app(Decimal::ONE)
            .with_date_str("2024-01-01")
            .has_identity());
        assert!(!TransactionRecord::app(Decimal::ONE)
            .with_transaction_id("")
            .has_identity());
    }
}
