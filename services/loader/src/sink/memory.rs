//! In-memory warehouse
//!
//! A transaction is a staged copy of the committed tables: `commit` swaps it
//! in, `rollback` drops it.

use async_trait::async_trait;
use std::collections::BTreeMap;

use super::Warehouse;
use crate::aggregate::totals_for;
use crate::error::{LoaderError, Result};
use crate::model::{DailySalesAgg, DimensionKind, DimensionRecord, FactTransaction, StoreDay};
use crate::run::RunSummary;

/// The five star-schema tables
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Tables {
    pub dimensions: BTreeMap<(DimensionKind, String), DimensionRecord>,
    pub facts: BTreeMap<String, FactTransaction>,
    pub daily_sales: BTreeMap<StoreDay, DailySalesAgg>,
}

impl Tables {
    pub fn dimension(&self, kind: DimensionKind, key: &str) -> Option<&DimensionRecord> {
        self.dimensions.get(&(kind, key.to_string()))
    }

    pub fn dimension_count(&self, kind: DimensionKind) -> usize {
        self.dimensions.keys().filter(|(k, _)| *k == kind).count()
    }
}

#[derive(Debug, Default)]
pub struct MemoryWarehouse {
    committed: Tables,
    staged: Option<Tables>,
    runs: Vec<RunSummary>,
}

impl MemoryWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from existing committed contents
    pub fn with_tables(tables: Tables) -> Self {
        Self {
            committed: tables,
            ..Default::default()
        }
    }

    /// Committed contents
    pub fn tables(&self) -> &Tables {
        &self.committed
    }

    /// Journaled runs, oldest first
    pub fn runs(&self) -> &[RunSummary] {
        &self.runs
    }

    pub fn in_transaction(&self) -> bool {
        self.staged.is_some()
    }

    fn view(&self) -> &Tables {
        self.staged.as_ref().unwrap_or(&self.committed)
    }

    fn staged_mut(&mut self) -> Result<&mut Tables> {
        self.staged
            .as_mut()
            .ok_or_else(|| LoaderError::SinkWrite("write outside of a transaction".to_string()))
    }
}

#[async_trait]
impl Warehouse for MemoryWarehouse {
    async fn begin(&mut self) -> Result<()> {
        if self.staged.is_some() {
            return Err(LoaderError::SinkWrite(
                "transaction already open".to_string(),
            ));
        }
        self.staged = Some(self.committed.clone());
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        let staged = self
            .staged
            .take()
            .ok_or_else(|| LoaderError::SinkWrite("commit without a transaction".to_string()))?;
        self.committed = staged;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        self.staged = None;
        Ok(())
    }

    async fn read_dimension(
        &mut self,
        kind: DimensionKind,
        key: &str,
    ) -> Result<Option<DimensionRecord>> {
        Ok(self.view().dimension(kind, key).cloned())
    }

    async fn upsert_dimension(&mut self, record: &DimensionRecord) -> Result<()> {
        self.staged_mut()?
            .dimensions
            .insert((record.kind, record.key.clone()), record.clone());
        Ok(())
    }

    async fn read_fact(&mut self, transaction_id: &str) -> Result<Option<FactTransaction>> {
        Ok(self.view().facts.get(transaction_id).cloned())
    }

    async fn upsert_fact(&mut self, fact: &FactTransaction) -> Result<()> {
        self.staged_mut()?
            .facts
            .insert(fact.transaction_id.clone(), fact.clone());
        Ok(())
    }

    async fn store_day_totals(&mut self, key: &StoreDay) -> Result<DailySalesAgg> {
        Ok(totals_for(key, self.view().facts.values()))
    }

    async fn read_daily_sales(&mut self, key: &StoreDay) -> Result<Option<DailySalesAgg>> {
        Ok(self.view().daily_sales.get(key).cloned())
    }

    async fn upsert_daily_sales(&mut self, row: &DailySalesAgg) -> Result<()> {
        let key = StoreDay {
            store_id: row.store_id.clone(),
            date: row.date,
        };
        self.staged_mut()?.daily_sales.insert(key, row.clone());
        Ok(())
    }

    async fn record_run(&mut self, summary: &RunSummary) -> Result<()> {
        self.runs.push(summary.clone());
        Ok(())
    }
}
