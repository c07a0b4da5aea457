//! Run orchestrator: drives one reconciliation pass over two ledgers.

use std::sync::Arc;

use chrono::NaiveDate;
use recon_core::error::AppError;
use rust_decimal::Decimal;
use tracing::{error, info, instrument};

use crate::models::{
    ItemStatus, NewItem, ReconciliationRun, RunAggregates, RunScope, RunStatus, TransactionRecord,
};
use crate::services::database::RunStore;
use crate::services::matching::{
    match_candidate, GatewayPool, MatchOutcome, MissingDatePolicy, TolerancePolicy,
};
use crate::services::metrics::{record_error, record_match_strategy, record_run_outcome};

/// Per-run tolerance overrides, applied on top of the configured defaults.
/// Absent fields keep the default; present fields go through the policy's
/// clamping setters.
#[derive(Debug, Clone, Copy, Default)]
pub struct ToleranceOverrides {
    pub amount_percentage_tolerance: Option<Decimal>,
    pub amount_absolute_tolerance: Option<Decimal>,
    pub date_tolerance_days: Option<i64>,
    pub fuzzy_match_threshold: Option<i64>,
    pub missing_date_policy: Option<MissingDatePolicy>,
}

impl ToleranceOverrides {
    pub fn apply_to(&self, mut policy: TolerancePolicy) -> TolerancePolicy {
        if let Some(fraction) = self.amount_percentage_tolerance {
            policy = policy.with_amount_percentage_tolerance(fraction);
        }
        if let Some(amount) = self.amount_absolute_tolerance {
            policy = policy.with_amount_absolute_tolerance(amount);
        }
        if let Some(days) = self.date_tolerance_days {
            policy = policy.with_date_tolerance_days(days);
        }
        if let Some(threshold) = self.fuzzy_match_threshold {
            policy = policy.with_fuzzy_match_threshold(threshold);
        }
        if let Some(date_policy) = self.missing_date_policy {
            policy = policy.with_missing_date_policy(date_policy);
        }
        policy
    }
}

/// Result of the pure classification pass, before anything is persisted.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub items: Vec<NewItem>,
    pub aggregates: RunAggregates,
}

pub struct RunOrchestrator {
    store: Arc<dyn RunStore>,
    defaults: TolerancePolicy,
    /// Discrepancy count above which a completed run is recorded as
    /// `partial` instead of `success`. `None` disables the distinction.
    partial_threshold: Option<i64>,
}

impl RunOrchestrator {
    pub fn new(
        store: Arc<dyn RunStore>,
        defaults: TolerancePolicy,
        partial_threshold: Option<i64>,
    ) -> Self {
        Self {
            store,
            defaults,
            partial_threshold,
        }
    }

    /// Execute one reconciliation run: create the run row, classify every
    /// transaction, and finalize items plus aggregates atomically.
    ///
    /// Discrepancies are an expected outcome and never fail the run. A store
    /// error during finalization is caught and converted into a `failed` run
    /// (partial items discarded) so the operator always gets a run record.
    #[instrument(skip_all, fields(app_count = app_txns.len(), gateway_count = gateway_txns.len()))]
    pub async fn run(
        &self,
        app_txns: Vec<TransactionRecord>,
        gateway_txns: Vec<TransactionRecord>,
        overrides: Option<ToleranceOverrides>,
        scope: RunScope,
    ) -> Result<ReconciliationRun, AppError> {
        let policy = match overrides {
            Some(o) => o.apply_to(self.defaults.clone()),
            None => self.defaults.clone(),
        };

        let run = self.store.create_run(&scope).await?;
        info!(run_id = %run.run_id, "Reconciliation run started");

        let outcome = Self::classify(&policy, &app_txns, gateway_txns);
        let status = self.terminal_status(&outcome.aggregates);

        match self
            .store
            .complete_run(run.run_id, &outcome.items, &outcome.aggregates, status)
            .await
        {
            Ok(completed) => {
                record_run_outcome(status.as_str());
                info!(
                    run_id = %completed.run_id,
                    status = %completed.status,
                    total_matched = completed.total_matched,
                    total_unmatched_app = completed.total_unmatched_app,
                    total_unmatched_gateway = completed.total_unmatched_gateway,
                    total_amount_mismatch = completed.total_amount_mismatch,
                    "Reconciliation run completed"
                );
                Ok(completed)
            }
            Err(e) => {
                error!(run_id = %run.run_id, error = %e, "Failed to finalize run");
                record_run_outcome(RunStatus::Failed.as_str());
                record_error("store_error");
                self.store.fail_run(run.run_id, &e.to_string()).await
            }
        }
    }

    /// Abort an in-flight run: persists it as `failed` with any partial
    /// items discarded, so it can never surface as a completed run.
    pub async fn abort(&self, run: &ReconciliationRun, reason: &str) -> Result<ReconciliationRun, AppError> {
        record_run_outcome(RunStatus::Failed.as_str());
        self.store.fail_run(run.run_id, reason).await
    }

    /// The classification pass. Pure, single-threaded, deterministic: app
    /// transactions are visited in input order, so the same ledgers and
    /// policy always reproduce the same aggregates.
    pub fn classify(
        policy: &TolerancePolicy,
        app_txns: &[TransactionRecord],
        gateway_txns: Vec<TransactionRecord>,
    ) -> RunOutcome {
        let mut pool = GatewayPool::new(gateway_txns);
        let mut items = Vec::with_capacity(app_txns.len() + pool.len());
        let mut aggregates = RunAggregates {
            total_gateway_amount: pool.total_amount(),
            ..Default::default()
        };

        for txn in app_txns {
            aggregates.total_app_amount += txn.amount;

            match match_candidate(policy, txn, &pool) {
                Some(MatchOutcome::Matched {
                    gateway_idx,
                    strategy,
                }) => {
                    let counterpart = pool.get(gateway_idx).clone();
                    pool.consume(gateway_idx);
                    record_match_strategy(strategy.as_str());

                    // Matches are always recorded as a pair, each side
                    // pointing at the other.
                    items.push(NewItem::from_record(
                        txn,
                        ItemStatus::Matched,
                        link_id(&counterpart),
                    ));
                    items.push(NewItem::from_record(
                        &counterpart,
                        ItemStatus::Matched,
                        link_id(txn),
                    ));
                    aggregates.total_matched += 1;
                }
                Some(MatchOutcome::AmountMismatch { gateway_idx }) => {
                    let counterpart = pool.get(gateway_idx).clone();
                    pool.consume(gateway_idx);

                    items.push(NewItem::from_record(
                        txn,
                        ItemStatus::AmountMismatch,
                        link_id(&counterpart),
                    ));
                    items.push(NewItem::from_record(
                        &counterpart,
                        ItemStatus::AmountMismatch,
                        link_id(txn),
                    ));
                    aggregates.total_amount_mismatch += 1;
                }
                None => {
                    items.push(NewItem::from_record(txn, ItemStatus::UnmatchedApp, None));
                    aggregates.total_unmatched_app += 1;
                }
            }
        }

        for (_, candidate) in pool.unconsumed() {
            items.push(NewItem::from_record(
                candidate,
                ItemStatus::UnmatchedGateway,
                None,
            ));
            aggregates.total_unmatched_gateway += 1;
        }

        RunOutcome { items, aggregates }
    }

    fn terminal_status(&self, aggregates: &RunAggregates) -> RunStatus {
        match self.partial_threshold {
            Some(threshold) if aggregates.discrepancies() > threshold => RunStatus::Partial,
            _ => RunStatus::Success,
        }
    }
}

/// Pointer stored on the counterpart's item: the transaction id when
/// present, else the reference, so a matched pair always links both ways.
fn link_id(record: &TransactionRecord) -> Option<String> {
    record
        .transaction_id
        .clone()
        .filter(|s| !s.is_empty())
        .or_else(|| record.reference.clone().filter(|s| !s.is_empty()))
}

/// Convenience for callers that scope runs by period without other metadata.
pub fn period_scope(start: NaiveDate, end: NaiveDate) -> RunScope {
    RunScope {
        period_start: Some(start),
        period_end: Some(end),
        ..Default::default()
    }
}
