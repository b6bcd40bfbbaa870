//! Fact Loader
//!
//! Upserts `fact_transactions` by `transaction_id`. A transaction id appears
//! at most once per run: duplicates inside the batch are folded first
//! (identical rows collapse, differing rows resolve last-write-wins).

use std::collections::{BTreeSet, HashMap};
use tracing::{debug, info};

use crate::dimension::ChangeCounts;
use crate::error::Result;
use crate::model::{FactTransaction, StoreDay};
use crate::sink::Warehouse;

/// Facts ready to load, one per transaction id, in first-seen order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FactBatch {
    pub facts: Vec<FactTransaction>,
    /// Exact repeats of an earlier row in the batch
    pub duplicates_collapsed: usize,
    /// Earlier rows overwritten by a later, different row with the same id
    pub superseded: usize,
}

pub fn fold_facts<I>(facts: I) -> FactBatch
where
    I: IntoIterator<Item = FactTransaction>,
{
    let mut batch = FactBatch::default();
    let mut index: HashMap<String, usize> = HashMap::new();

    for fact in facts {
        match index.get(&fact.transaction_id) {
            Some(&at) => {
                if batch.facts[at] == fact {
                    batch.duplicates_collapsed += 1;
                } else {
                    batch.facts[at] = fact;
                    batch.superseded += 1;
                }
            }
            None => {
                index.insert(fact.transaction_id.clone(), batch.facts.len());
                batch.facts.push(fact);
            }
        }
    }
    batch
}

/// How one fact row relates to what is already stored
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FactChange {
    Insert,
    /// A correction; carries the (store, day) the stored row was filed under
    Update { previous: StoreDay },
    Unchanged,
}

pub fn classify(fact: &FactTransaction, existing: Option<&FactTransaction>) -> FactChange {
    match existing {
        None => FactChange::Insert,
        Some(stored) if stored == fact => FactChange::Unchanged,
        Some(stored) => FactChange::Update {
            previous: stored.store_day(),
        },
    }
}

/// Load the batch and record every (store, day) whose aggregate must be recomputed.
///
/// A correction that moves a transaction to another store or day touches
/// both the old and the new key.
pub async fn load_facts<W>(
    sink: &mut W,
    facts: &[FactTransaction],
    batch_size: usize,
    counts: &mut ChangeCounts,
    touched: &mut BTreeSet<StoreDay>,
) -> Result<()>
where
    W: Warehouse + ?Sized,
{
    let batch_size = batch_size.max(1);
    let total_batches = facts.len().div_ceil(batch_size);

    for (batch_num, chunk) in facts.chunks(batch_size).enumerate() {
        for fact in chunk {
            let existing = sink.read_fact(&fact.transaction_id).await?;
            match classify(fact, existing.as_ref()) {
                FactChange::Insert => {
                    sink.upsert_fact(fact).await?;
                    counts.inserted += 1;
                }
                FactChange::Update { previous } => {
                    debug!(transaction_id = %fact.transaction_id, "Correcting fact row");
                    sink.upsert_fact(fact).await?;
                    counts.updated += 1;
                    touched.insert(previous);
                }
                FactChange::Unchanged => counts.unchanged += 1,
            }
            touched.insert(fact.store_day());
        }
        info!("Loaded batch {}/{}", batch_num + 1, total_batches);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::MemoryWarehouse;
    use chrono::NaiveDate;
    use rust_decimal::Decimal;

    fn fact(id: &str, qty: i32, store: &str, day: u32) -> FactTransaction {
        let price = Decimal::new(1000, 2);
        FactTransaction {
            transaction_id: id.into(),
            product_id: "P1".into(),
            customer_id: "C1".into(),
            store_id: store.into(),
            date: NaiveDate::from_ymd_opt(2024, 1, day).unwrap(),
            quantity: qty,
            price,
            line_revenue: price * Decimal::from(qty),
        }
    }

    // -------------------------------------------------------------------------
    // FOLDING
    // -------------------------------------------------------------------------

    #[test]
    fn test_fold_collapses_exact_duplicates() {
        let batch = fold_facts(vec![fact("1", 1, "S01", 15), fact("1", 1, "S01", 15), fact("2", 1, "S01", 15)]);
        assert_eq!(batch.facts.len(), 2);
        assert_eq!(batch.duplicates_collapsed, 1);
        assert_eq!(batch.superseded, 0);
    }

    #[test]
    fn test_fold_last_write_wins_keeps_position() {
        let batch = fold_facts(vec![fact("1", 1, "S01", 15), fact("2", 1, "S01", 15), fact("1", 5, "S01", 15)]);
        assert_eq!(batch.facts[0].transaction_id, "1");
        assert_eq!(batch.facts[0].quantity, 5);
        assert_eq!(batch.superseded, 1);
    }

    // -------------------------------------------------------------------------
    // CLASSIFICATION
    // -------------------------------------------------------------------------

    #[test]
    fn test_classify() {
        let f = fact("1", 1, "S01", 15);
        assert_eq!(classify(&f, None), FactChange::Insert);
        assert_eq!(classify(&f, Some(&f.clone())), FactChange::Unchanged);
        let moved = fact("1", 1, "S02", 14);
        assert_eq!(
            classify(&f, Some(&moved)),
            FactChange::Update {
                previous: moved.store_day()
            }
        );
    }

    // -------------------------------------------------------------------------
    // LOADING
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_load_counts_insert_update_unchanged() {
        let mut sink = MemoryWarehouse::new();
        sink.begin().await.unwrap();
        let mut counts = ChangeCounts::default();
        let mut touched = BTreeSet::new();
        load_facts(&mut sink, &[fact("1", 1, "S01", 15), fact("2", 1, "S01", 15)], 1, &mut counts, &mut touched)
            .await
            .unwrap();
        assert_eq!(counts.inserted, 2);

        let mut counts = ChangeCounts::default();
        load_facts(&mut sink, &[fact("1", 2, "S01", 15), fact("2", 1, "S01", 15)], 10, &mut counts, &mut touched)
            .await
            .unwrap();
        assert_eq!(counts, ChangeCounts { inserted: 0, updated: 1, unchanged: 1 });
        assert_eq!(sink.read_fact("1").await.unwrap().unwrap().quantity, 2);
    }

    #[tokio::test]
    async fn test_moved_correction_touches_both_keys() {
        let mut sink = MemoryWarehouse::new();
        sink.begin().await.unwrap();
        let mut counts = ChangeCounts::default();
        let mut touched = BTreeSet::new();
        load_facts(&mut sink, &[fact("1", 1, "S01", 15)], 100, &mut counts, &mut touched)
            .await
            .unwrap();

        let mut touched = BTreeSet::new();
        load_facts(&mut sink, &[fact("1", 1, "S02", 16)], 100, &mut counts, &mut touched)
            .await
            .unwrap();
        let keys: Vec<String> = touched.iter().map(|k| k.to_string()).collect();
        assert_eq!(keys, vec!["S01@2024-01-15", "S02@2024-01-16"]);
    }
}
