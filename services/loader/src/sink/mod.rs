//! Relational sink abstraction
//!
//! The engine never talks to a database directly. Everything it persists
//! goes through [`Warehouse`]: read-by-key and upsert-by-key per table, plus a
//! single transaction spanning all tables for the duration of one run.
//!
//! Implementations:
//! - [`PgWarehouse`]: PostgreSQL via sqlx
//! - [`MemoryWarehouse`]: in-process tables, used for dry runs and tests

mod memory;
mod postgres;

pub use memory::{MemoryWarehouse, Tables};
pub use postgres::PgWarehouse;

use async_trait::async_trait;

use crate::error::Result;
use crate::model::{DailySalesAgg, DimensionKind, DimensionRecord, FactTransaction, StoreDay};
use crate::run::RunSummary;

/// Storage for the star schema.
///
/// Writes are only legal between [`Warehouse::begin`] and
/// [`Warehouse::commit`]/[`Warehouse::rollback`]. Reads inside a transaction
/// see that transaction's own writes.
#[async_trait]
pub trait Warehouse: Send {
    /// Open the run transaction
    async fn begin(&mut self) -> Result<()>;

    /// Make every write since `begin` durable, atomically
    async fn commit(&mut self) -> Result<()>;

    /// Discard every write since `begin`
    async fn rollback(&mut self) -> Result<()>;

    async fn read_dimension(
        &mut self,
        kind: DimensionKind,
        key: &str,
    ) -> Result<Option<DimensionRecord>>;

    async fn upsert_dimension(&mut self, record: &DimensionRecord) -> Result<()>;

    async fn read_fact(&mut self, transaction_id: &str) -> Result<Option<FactTransaction>>;

    async fn upsert_fact(&mut self, fact: &FactTransaction) -> Result<()>;

    /// Full re-aggregation of every fact row stored under `key`
    async fn store_day_totals(&mut self, key: &StoreDay) -> Result<DailySalesAgg>;

    async fn read_daily_sales(&mut self, key: &StoreDay) -> Result<Option<DailySalesAgg>>;

    async fn upsert_daily_sales(&mut self, row: &DailySalesAgg) -> Result<()>;

    /// Journal a finished run. Called outside the run transaction.
    async fn record_run(&mut self, _summary: &RunSummary) -> Result<()> {
        Ok(())
    }
}
