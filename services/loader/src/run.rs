//! Run Orchestrator
//!
//! Drives one batch through the stages, in order:
//!
//! ```text
//! Idle → Extracting → Validating → Transforming → Loading → Aggregating → Committing → Committed
//!                                      any fatal error ↘ RollingBack → RolledBack
//! ```
//!
//! The sink transaction opens at `Loading` and closes at `Committing`, so a
//! failure anywhere leaves the dimension, fact and aggregate tables exactly as
//! they were before the run. Rejected rows never fail a run.
//!
//! All per-run state lives in [`RunContext`]; nothing is global.

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::aggregate::refresh_daily_sales;
use crate::dimension::{fold_observations, merge_dimensions, ChangeCounts};
use crate::error::Result;
use crate::fact::{fold_facts, load_facts};
use crate::model::DimensionKind;
use crate::normalize::{normalize, Normalized};
use crate::report::RejectionSink;
use crate::sink::Warehouse;
use crate::source::RecordSource;
use crate::validate::{validate, Rejection, RejectionKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunState {
    Idle,
    Extracting,
    Validating,
    Transforming,
    Loading,
    Aggregating,
    Committing,
    Committed,
    RollingBack,
    RolledBack,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Committed | RunState::RolledBack)
    }

    /// Legal transitions: one step forward, or into rollback from any live state
    pub fn can_advance_to(self, next: RunState) -> bool {
        use RunState::*;
        match (self, next) {
            (Idle, Extracting)
            | (Extracting, Validating)
            | (Validating, Transforming)
            | (Transforming, Loading)
            | (Loading, Aggregating)
            | (Aggregating, Committing)
            | (Committing, Committed)
            | (RollingBack, RolledBack) => true,
            (from, RollingBack) => !from.is_terminal() && from != RollingBack,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunOutcome {
    Committed,
    RolledBack,
}

impl RunOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            RunOutcome::Committed => "committed",
            RunOutcome::RolledBack => "rolled_back",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Only load accepted rows dated on this day
    pub run_date: Option<NaiveDate>,
    /// Progress is logged every `batch_size` fact rows
    pub batch_size: usize,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            run_date: None,
            batch_size: 1000,
        }
    }
}

/// What a run did. Always produced, whatever the outcome.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub source: String,
    pub run_date: Option<NaiveDate>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: i64,
    pub total_rows: usize,
    /// Rows that passed validation, including those outside `run_date`
    pub accepted: usize,
    pub rejected_by_kind: BTreeMap<RejectionKind, usize>,
    pub outside_run_date: usize,
    pub duplicates_collapsed: usize,
    pub superseded_in_batch: usize,
    pub dimensions: BTreeMap<DimensionKind, ChangeCounts>,
    pub facts: ChangeCounts,
    pub aggregate_keys_refreshed: usize,
    /// `RolledBack` until the commit succeeds
    pub outcome: RunOutcome,
    pub first_error: Option<String>,
}

impl RunSummary {
    fn new(source: String, run_date: Option<NaiveDate>) -> Self {
        let now = Utc::now();
        Self {
            run_id: Uuid::new_v4(),
            source,
            run_date,
            started_at: now,
            finished_at: now,
            duration_ms: 0,
            total_rows: 0,
            accepted: 0,
            rejected_by_kind: BTreeMap::new(),
            outside_run_date: 0,
            duplicates_collapsed: 0,
            superseded_in_batch: 0,
            dimensions: BTreeMap::new(),
            facts: ChangeCounts::default(),
            aggregate_keys_refreshed: 0,
            outcome: RunOutcome::RolledBack,
            first_error: None,
        }
    }

    pub fn rejected(&self) -> usize {
        self.rejected_by_kind.values().sum()
    }

    pub fn dimension(&self, kind: DimensionKind) -> ChangeCounts {
        self.dimensions.get(&kind).copied().unwrap_or_default()
    }
}

/// Working set of one run
#[derive(Debug)]
pub struct RunContext {
    pub summary: RunSummary,
    pub rejections: Vec<Rejection>,
    state: RunState,
    history: Vec<RunState>,
}

impl RunContext {
    pub fn new(source: String, run_date: Option<NaiveDate>) -> Self {
        Self {
            summary: RunSummary::new(source, run_date),
            rejections: Vec::new(),
            state: RunState::Idle,
            history: vec![RunState::Idle],
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    /// Every state visited, starting with `Idle`
    pub fn history(&self) -> &[RunState] {
        &self.history
    }

    fn advance(&mut self, next: RunState) {
        debug_assert!(
            self.state.can_advance_to(next),
            "illegal transition {:?} -> {:?}",
            self.state,
            next
        );
        info!("Run state: {:?} -> {:?}", self.state, next);
        self.state = next;
        self.history.push(next);
    }
}

/// Execute one run. Fatal errors are captured in the returned context.
pub async fn execute<W>(
    source: &mut dyn RecordSource,
    sink: &mut W,
    reporter: &mut dyn RejectionSink,
    options: &RunOptions,
) -> RunContext
where
    W: Warehouse + ?Sized,
{
    let mut ctx = RunContext::new(source.label(), options.run_date);
    let span = info_span!("run", run_id = %ctx.summary.run_id);

    async {
        info!("Starting ETL run over {}", ctx.summary.source);

        match run_stages(&mut ctx, source, sink, reporter, options).await {
            Ok(()) => {
                ctx.advance(RunState::Committed);
                ctx.summary.outcome = RunOutcome::Committed;
            }
            Err(err) => {
                error!("Run failed in {:?}: {}", ctx.state, err);
                ctx.summary.first_error = Some(err.to_string());
                ctx.advance(RunState::RollingBack);
                if let Err(rollback_err) = sink.rollback().await {
                    error!("Rollback failed: {}", rollback_err);
                }
                ctx.advance(RunState::RolledBack);
                ctx.summary.outcome = RunOutcome::RolledBack;
            }
        }

        ctx.summary.finished_at = Utc::now();
        ctx.summary.duration_ms = (ctx.summary.finished_at - ctx.summary.started_at).num_milliseconds();

        if let Err(e) = sink.record_run(&ctx.summary).await {
            warn!("Could not journal run: {}", e);
        }

        info!(
            outcome = ctx.summary.outcome.as_str(),
            accepted = ctx.summary.accepted,
            rejected = ctx.summary.rejected(),
            duration_ms = ctx.summary.duration_ms,
            "Run finished"
        );
    }
    .instrument(span)
    .await;

    ctx
}

async fn run_stages<W>(
    ctx: &mut RunContext,
    source: &mut dyn RecordSource,
    sink: &mut W,
    reporter: &mut dyn RejectionSink,
    options: &RunOptions,
) -> Result<()>
where
    W: Warehouse + ?Sized,
{
    ctx.advance(RunState::Extracting);
    let records = source.read_records().await?;
    ctx.summary.total_rows = records.len();

    ctx.advance(RunState::Validating);
    let mut accepted = Vec::with_capacity(records.len());
    for record in &records {
        match validate(record) {
            Ok(txn) => {
                ctx.summary.accepted += 1;
                match options.run_date {
                    Some(day) if txn.date != day => ctx.summary.outside_run_date += 1,
                    _ => accepted.push(txn),
                }
            }
            Err(rejection) => {
                *ctx.summary.rejected_by_kind.entry(rejection.kind).or_insert(0) += 1;
                if let Err(e) = reporter.report(&rejection) {
                    warn!("{}", e);
                }
                ctx.rejections.push(rejection);
            }
        }
    }
    if let Err(e) = reporter.finish() {
        warn!("{}", e);
    }
    info!(
        "Validation complete: {} accepted, {} rejected",
        ctx.summary.accepted,
        ctx.summary.rejected()
    );

    ctx.advance(RunState::Transforming);
    let normalized: Vec<Normalized> = accepted.iter().map(normalize).collect();
    let dimensions = fold_observations(
        normalized
            .iter()
            .flat_map(|n| n.observations.iter().cloned()),
    );
    let batch = fold_facts(normalized.into_iter().map(|n| n.fact));
    ctx.summary.duplicates_collapsed = batch.duplicates_collapsed;
    ctx.summary.superseded_in_batch = batch.superseded;
    if batch.duplicates_collapsed > 0 {
        info!("Removed {} duplicate records", batch.duplicates_collapsed);
    }

    ctx.advance(RunState::Loading);
    sink.begin().await?;
    merge_dimensions(sink, &dimensions, &mut ctx.summary.dimensions).await?;
    let mut touched = BTreeSet::new();
    load_facts(
        sink,
        &batch.facts,
        options.batch_size,
        &mut ctx.summary.facts,
        &mut touched,
    )
    .await?;

    ctx.advance(RunState::Aggregating);
    let refreshed = refresh_daily_sales(sink, &touched).await?;
    ctx.summary.aggregate_keys_refreshed = refreshed.len();

    ctx.advance(RunState::Committing);
    sink.commit().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RawRecord;
    use crate::report::LogRejections;
    use crate::sink::MemoryWarehouse;
    use crate::source::VecSource;

    fn row(id: &str, qty: &str) -> RawRecord {
        RawRecord::new(2)
            .with("transaction_id", id)
            .with("date", "2024-01-15")
            .with("product_id", "P100")
            .with("product_name", "Laptop")
            .with("quantity", qty)
            .with("price", "10.00")
            .with("customer_id", "C001")
            .with("store_id", "S01")
    }

    // -------------------------------------------------------------------------
    // STATE MACHINE
    // -------------------------------------------------------------------------

    #[test]
    fn test_transitions_are_sequential() {
        assert!(RunState::Idle.can_advance_to(RunState::Extracting));
        assert!(!RunState::Idle.can_advance_to(RunState::Validating));
        assert!(!RunState::Validating.can_advance_to(RunState::Loading));
        assert!(RunState::Loading.can_advance_to(RunState::RollingBack));
        assert!(!RunState::Committed.can_advance_to(RunState::RollingBack));
        assert!(!RunState::RollingBack.can_advance_to(RunState::Committed));
        assert!(RunState::RollingBack.can_advance_to(RunState::RolledBack));
    }

    #[tokio::test]
    async fn test_successful_run_visits_every_state() {
        let mut source = VecSource::new("test", vec![row("1", "1")]);
        let mut sink = MemoryWarehouse::new();
        let ctx = execute(&mut source, &mut sink, &mut LogRejections, &RunOptions::default()).await;

        assert_eq!(
            ctx.history(),
            &[
                RunState::Idle,
                RunState::Extracting,
                RunState::Validating,
                RunState::Transforming,
                RunState::Loading,
                RunState::Aggregating,
                RunState::Committing,
                RunState::Committed,
            ]
        );
        assert_eq!(ctx.summary.outcome, RunOutcome::Committed);
        assert!(ctx.summary.first_error.is_none());
        assert_eq!(sink.runs().len(), 1);
    }

    // -------------------------------------------------------------------------
    // SUMMARY
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_rejections_do_not_abort() {
        let mut source = VecSource::new("test", vec![row("1", "1"), row("2", "0"), row("3", "x")]);
        let mut sink = MemoryWarehouse::new();
        let ctx = execute(&mut source, &mut sink, &mut LogRejections, &RunOptions::default()).await;

        assert_eq!(ctx.summary.outcome, RunOutcome::Committed);
        assert_eq!(ctx.summary.total_rows, 3);
        assert_eq!(ctx.summary.accepted, 1);
        assert_eq!(ctx.summary.rejected(), 2);
        assert_eq!(ctx.summary.rejected_by_kind[&RejectionKind::NonPositiveQuantity], 1);
        assert_eq!(ctx.summary.rejected_by_kind[&RejectionKind::MalformedNumber], 1);
        assert_eq!(ctx.rejections.len(), 2);
        assert_eq!(sink.tables().facts.len(), 1);
    }

    #[tokio::test]
    async fn test_run_date_filters_rows() {
        let other_day = row("2", "1").with("date", "2024-01-16");
        let mut source = VecSource::new("test", vec![row("1", "1"), other_day]);
        let mut sink = MemoryWarehouse::new();
        let options = RunOptions {
            run_date: NaiveDate::from_ymd_opt(2024, 1, 15),
            ..Default::default()
        };
        let ctx = execute(&mut source, &mut sink, &mut LogRejections, &options).await;

        assert_eq!(ctx.summary.accepted, 2);
        assert_eq!(ctx.summary.outside_run_date, 1);
        assert_eq!(ctx.summary.facts.inserted, 1);
        assert!(sink.tables().facts.contains_key("1"));
        assert!(!sink.tables().facts.contains_key("2"));
    }

    #[tokio::test]
    async fn test_in_batch_duplicates_are_counted() {
        let mut source = VecSource::new("test", vec![row("1", "1"), row("1", "1"), row("1", "3")]);
        let mut sink = MemoryWarehouse::new();
        let ctx = execute(&mut source, &mut sink, &mut LogRejections, &RunOptions::default()).await;

        assert_eq!(ctx.summary.duplicates_collapsed, 1);
        assert_eq!(ctx.summary.superseded_in_batch, 1);
        assert_eq!(ctx.summary.facts.inserted, 1);
        assert_eq!(sink.tables().facts["1"].quantity, 3);
    }

    #[tokio::test]
    async fn test_empty_batch_commits() {
        let mut source = VecSource::new("empty", Vec::new());
        let mut sink = MemoryWarehouse::new();
        let ctx = execute(&mut source, &mut sink, &mut LogRejections, &RunOptions::default()).await;
        assert_eq!(ctx.summary.outcome, RunOutcome::Committed);
        assert_eq!(ctx.summary.aggregate_keys_refreshed, 0);
    }
}
