//! Tolerance policy and the transaction-matching cascade.
//!
//! Everything in this module is pure and synchronous. Matching decisions
//! never fail: configuration slips are clamped, and bad per-field data
//! (missing identifiers, absent dates) makes a strategy skip rather than
//! error out.

use std::collections::HashMap;

use chrono::NaiveDate;
use rust_decimal::Decimal;

use crate::models::TransactionRecord;

/// What an absent business date means for a date-constrained strategy.
///
/// Upstream parse failures surface as `date: None`, so this policy covers
/// both "never supplied" and "unparseable" in one switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MissingDatePolicy {
    /// An absent date never blocks an otherwise-valid match.
    #[default]
    FailOpen,
    /// An absent date fails any date-constrained comparison.
    FailClosed,
}

/// Configurable slack within which two records still count as the same
/// transaction. Immutable once a run starts; build one per run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TolerancePolicy {
    amount_percentage_tolerance: Decimal,
    amount_absolute_tolerance: Decimal,
    date_tolerance_days: i64,
    fuzzy_match_threshold: u8,
    missing_date_policy: MissingDatePolicy,
}

impl Default for TolerancePolicy {
    fn default() -> Self {
        Self {
            // 1% relative difference
            amount_percentage_tolerance: Decimal::new(1, 2),
            amount_absolute_tolerance: Decimal::ZERO,
            date_tolerance_days: 3,
            fuzzy_match_threshold: 80,
            missing_date_policy: MissingDatePolicy::FailOpen,
        }
    }
}

impl TolerancePolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Relative amount tolerance as a fraction; clamped to [0, 1].
    pub fn with_amount_percentage_tolerance(mut self, fraction: Decimal) -> Self {
        self.amount_percentage_tolerance = fraction.clamp(Decimal::ZERO, Decimal::ONE);
        self
    }

    /// Absolute amount tolerance; negative values clamp to zero.
    pub fn with_amount_absolute_tolerance(mut self, amount: Decimal) -> Self {
        self.amount_absolute_tolerance = amount.max(Decimal::ZERO);
        self
    }

    /// Date slack in days; clamped to [0, 365].
    pub fn with_date_tolerance_days(mut self, days: i64) -> Self {
        self.date_tolerance_days = days.clamp(0, 365);
        self
    }

    /// Fuzzy similarity threshold; clamped to [0, 100].
    pub fn with_fuzzy_match_threshold(mut self, threshold: i64) -> Self {
        self.fuzzy_match_threshold = threshold.clamp(0, 100) as u8;
        self
    }

    pub fn with_missing_date_policy(mut self, policy: MissingDatePolicy) -> Self {
        self.missing_date_policy = policy;
        self
    }

    pub fn amount_percentage_tolerance(&self) -> Decimal {
        self.amount_percentage_tolerance
    }

    pub fn amount_absolute_tolerance(&self) -> Decimal {
        self.amount_absolute_tolerance
    }

    pub fn date_tolerance_days(&self) -> i64 {
        self.date_tolerance_days
    }

    pub fn fuzzy_match_threshold(&self) -> u8 {
        self.fuzzy_match_threshold
    }

    pub fn missing_date_policy(&self) -> MissingDatePolicy {
        self.missing_date_policy
    }

    /// Two amounts agree when their absolute difference is within the
    /// absolute tolerance, or their relative difference (against the larger
    /// operand) is within the percentage tolerance. Two zeros always agree.
    pub fn amounts_match(&self, x: Decimal, y: Decimal) -> bool {
        let diff = (x - y).abs();
        if diff <= self.amount_absolute_tolerance {
            return true;
        }
        let larger = x.abs().max(y.abs());
        if larger.is_zero() {
            return true;
        }
        diff / larger <= self.amount_percentage_tolerance
    }

    /// Two dates agree when both are present and within the day tolerance.
    /// When either side is absent, the missing-date policy decides.
    pub fn dates_match(&self, d1: Option<NaiveDate>, d2: Option<NaiveDate>) -> bool {
        match (d1, d2) {
            (Some(a), Some(b)) => (a - b).num_days().abs() <= self.date_tolerance_days,
            _ => self.missing_date_policy == MissingDatePolicy::FailOpen,
        }
    }
}

/// Normalized string similarity in [0, 100]: both sides trimmed and
/// lowercased, then `100 * (max_len - edit_distance) / max_len`. Identical
/// strings score 100, and so do two empty strings.
pub fn similarity(a: &str, b: &str) -> u8 {
    let a: Vec<char> = a.trim().to_lowercase().chars().collect();
    let b: Vec<char> = b.trim().to_lowercase().chars().collect();
    let max_len = a.len().max(b.len());
    if max_len == 0 {
        return 100;
    }
    let distance = edit_distance(&a, &b);
    ((100 * (max_len - distance)) / max_len) as u8
}

/// Classic Levenshtein distance, two-row formulation.
fn edit_distance(a: &[char], b: &[char]) -> usize {
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0usize; b.len() + 1];

    for (i, &ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, &cb) in b.iter().enumerate() {
            let substitution = prev[j] + usize::from(ca != cb);
            curr[j + 1] = substitution.min(prev[j + 1] + 1).min(curr[j] + 1);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[b.len()]
}

fn nonempty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|s| !s.trim().is_empty())
}

// ============================================================================
// Gateway Pool
// ============================================================================

/// The gateway-side ledger for one run: records, the two exact-match lookup
/// indices, and the consumed bitmap.
///
/// Indices are built once so the exact-match strategies stay O(1) per app
/// transaction. `by_reference` is one-to-many because duplicate references
/// are legal on the gateway side; candidate order is input order, which is
/// what makes duplicate resolution reproducible.
pub struct GatewayPool {
    records: Vec<TransactionRecord>,
    by_transaction_id: HashMap<String, usize>,
    by_reference: HashMap<String, Vec<usize>>,
    consumed: Vec<bool>,
}

impl GatewayPool {
    pub fn new(records: Vec<TransactionRecord>) -> Self {
        let mut by_transaction_id = HashMap::new();
        let mut by_reference: HashMap<String, Vec<usize>> = HashMap::new();

        for (idx, record) in records.iter().enumerate() {
            if let Some(id) = nonempty(&record.transaction_id) {
                // Duplicate gateway transaction ids are pathological; keep
                // the first so resolution follows input order.
                by_transaction_id.entry(id.to_string()).or_insert(idx);
            }
            if let Some(reference) = nonempty(&record.reference) {
                by_reference.entry(reference.to_string()).or_default().push(idx);
            }
        }

        let consumed = vec![false; records.len()];
        Self {
            records,
            by_transaction_id,
            by_reference,
            consumed,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, idx: usize) -> &TransactionRecord {
        &self.records[idx]
    }

    pub fn is_consumed(&self, idx: usize) -> bool {
        self.consumed[idx]
    }

    /// Mark a gateway record as used up for the rest of the run. Each record
    /// can satisfy at most one app transaction.
    pub fn consume(&mut self, idx: usize) {
        self.consumed[idx] = true;
    }

    /// Unconsumed records in input order.
    pub fn unconsumed(&self) -> impl Iterator<Item = (usize, &TransactionRecord)> {
        self.records
            .iter()
            .enumerate()
            .filter(|(idx, _)| !self.consumed[*idx])
    }

    /// Sum of every gateway-side amount in the run, consumed or not.
    pub fn total_amount(&self) -> Decimal {
        self.records.iter().map(|r| r.amount).sum()
    }

    fn find_by_transaction_id(&self, id: &str) -> Option<usize> {
        self.by_transaction_id
            .get(id)
            .copied()
            .filter(|&idx| !self.consumed[idx])
    }

    fn candidates_by_reference<'a>(&'a self, reference: &str) -> impl Iterator<Item = usize> + 'a {
        self.by_reference
            .get(reference)
            .into_iter()
            .flatten()
            .copied()
            .filter(|&idx| !self.consumed[idx])
    }
}

// ============================================================================
// Matching Cascade
// ============================================================================

/// Which strategy produced a match; exported as a metrics label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchStrategy {
    TransactionId,
    ExactReference,
    FuzzyReference,
    AmountDate,
}

impl MatchStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TransactionId => "transaction_id",
            Self::ExactReference => "exact_reference",
            Self::FuzzyReference => "fuzzy_reference",
            Self::AmountDate => "amount_date",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchOutcome {
    Matched {
        gateway_idx: usize,
        strategy: MatchStrategy,
    },
    /// Same transaction id on both sides, amounts outside tolerance. The
    /// pair is still consumed and linked so the discrepancy is reportable.
    AmountMismatch { gateway_idx: usize },
}

/// Run the strategy cascade for one app transaction against the unconsumed
/// gateway pool, first success wins:
///
/// 1. exact transaction-id (amount agreement decides matched vs mismatch)
/// 2. exact reference, first candidate whose amount agrees
/// 3. fuzzy reference: similarity over threshold, amount and date agree
/// 4. amount+date, only when neither side carries a reference
///
/// Never consumes; the caller consumes whichever outcome it records.
pub fn match_candidate(
    policy: &TolerancePolicy,
    txn: &TransactionRecord,
    pool: &GatewayPool,
) -> Option<MatchOutcome> {
    if let Some(id) = nonempty(&txn.transaction_id) {
        if let Some(idx) = pool.find_by_transaction_id(id) {
            let candidate = pool.get(idx);
            return Some(if policy.amounts_match(txn.amount, candidate.amount) {
                MatchOutcome::Matched {
                    gateway_idx: idx,
                    strategy: MatchStrategy::TransactionId,
                }
            } else {
                MatchOutcome::AmountMismatch { gateway_idx: idx }
            });
        }
    }

    if let Some(reference) = nonempty(&txn.reference) {
        for idx in pool.candidates_by_reference(reference) {
            if policy.amounts_match(txn.amount, pool.get(idx).amount) {
                return Some(MatchOutcome::Matched {
                    gateway_idx: idx,
                    strategy: MatchStrategy::ExactReference,
                });
            }
        }

        for (idx, candidate) in pool.unconsumed() {
            let Some(candidate_ref) = nonempty(&candidate.reference) else {
                continue;
            };
            if similarity(reference, candidate_ref) >= policy.fuzzy_match_threshold()
                && policy.amounts_match(txn.amount, candidate.amount)
                && policy.dates_match(txn.date, candidate.date)
            {
                return Some(MatchOutcome::Matched {
                    gateway_idx: idx,
                    strategy: MatchStrategy::FuzzyReference,
                });
            }
        }

        return None;
    }

    // Both sides referenceless: amount+date only. Restricting candidates to
    // referenceless records stops two referenced transactions from pairing
    // coincidentally on amount alone.
    for (idx, candidate) in pool.unconsumed() {
        if nonempty(&candidate.reference).is_some() {
            continue;
        }
        if policy.amounts_match(txn.amount, candidate.amount)
            && policy.dates_match(txn.date, candidate.date)
        {
            return Some(MatchOutcome::Matched {
                gateway_idx: idx,
                strategy: MatchStrategy::AmountDate,
            });
        }
    }

    None
}
