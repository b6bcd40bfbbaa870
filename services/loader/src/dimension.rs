//! Dimension Merger
//!
//! Observations are folded per key before anything touches the sink, so each
//! dimension member is read once and written at most once per run.
//!
//! Conflicts inside a batch are last-write-wins in iteration order for the
//! product name. The seen-range always widens: `first_seen` is the earliest
//! date observed, `last_seen` the latest. A missing name never erases a known one.

use serde::Serialize;
use std::collections::BTreeMap;
use tracing::debug;

use crate::error::Result;
use crate::model::{DimensionKind, DimensionObservation, DimensionRecord};
use crate::sink::Warehouse;

/// Insert/update/no-op tallies for one table
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ChangeCounts {
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
}

/// What to do with one folded dimension member
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeDecision {
    Insert(DimensionRecord),
    Update(DimensionRecord),
    Unchanged,
}

/// Collapse observations into one pending record per (kind, key)
pub fn fold_observations<I>(observations: I) -> Vec<DimensionRecord>
where
    I: IntoIterator<Item = DimensionObservation>,
{
    let mut folded: BTreeMap<(DimensionKind, String), DimensionRecord> = BTreeMap::new();

    for obs in observations {
        match folded.get_mut(&(obs.kind, obs.key.clone())) {
            Some(record) => {
                if obs.name.is_some() {
                    record.name = obs.name;
                }
                record.first_seen = record.first_seen.min(obs.seen);
                record.last_seen = record.last_seen.max(obs.seen);
            }
            None => {
                folded.insert(
                    (obs.kind, obs.key.clone()),
                    DimensionRecord {
                        kind: obs.kind,
                        key: obs.key,
                        name: obs.name,
                        first_seen: obs.seen,
                        last_seen: obs.seen,
                    },
                );
            }
        }
    }

    folded.into_values().collect()
}

/// Compare a pending record with what the sink holds
pub fn decide(pending: &DimensionRecord, existing: Option<&DimensionRecord>) -> MergeDecision {
    let Some(existing) = existing else {
        return MergeDecision::Insert(pending.clone());
    };

    let merged = DimensionRecord {
        kind: existing.kind,
        key: existing.key.clone(),
        name: pending.name.clone().or_else(|| existing.name.clone()),
        first_seen: existing.first_seen.min(pending.first_seen),
        last_seen: existing.last_seen.max(pending.last_seen),
    };

    if &merged == existing {
        MergeDecision::Unchanged
    } else {
        MergeDecision::Update(merged)
    }
}

/// Apply folded records to the sink inside the open transaction
pub async fn merge_dimensions<W>(
    sink: &mut W,
    pending: &[DimensionRecord],
    counts: &mut BTreeMap<DimensionKind, ChangeCounts>,
) -> Result<()>
where
    W: Warehouse + ?Sized,
{
    for record in pending {
        let existing = sink.read_dimension(record.kind, &record.key).await?;
        let tally = counts.entry(record.kind).or_default();

        match decide(record, existing.as_ref()) {
            MergeDecision::Insert(row) => {
                sink.upsert_dimension(&row).await?;
                tally.inserted += 1;
            }
            MergeDecision::Update(row) => {
                debug!(kind = %row.kind, key = %row.key, "Updating dimension member");
                sink.upsert_dimension(&row).await?;
                tally.updated += 1;
            }
            MergeDecision::Unchanged => tally.unchanged += 1,
        }
    }
    Ok(())
}
