//! PostgreSQL warehouse
//!
//! One `sqlx` transaction is held for the whole run, so every read the
//! merger, loader and aggregator make sees the run's own earlier writes and
//! nothing becomes visible to other sessions until `commit`.
//!
//! Upserts are `INSERT .. ON CONFLICT .. DO UPDATE` on the natural key.

use async_trait::async_trait;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, Transaction};
use tracing::{debug, info, instrument};

use super::Warehouse;
use crate::config::Config;
use crate::error::{LoaderError, Result};
use crate::model::{DailySalesAgg, DimensionKind, DimensionRecord, FactTransaction, StoreDay};
use crate::normalize::to_money;
use crate::run::RunSummary;

const SCHEMA: &str = include_str!("../../sql/schema.sql");

#[derive(Debug, sqlx::FromRow)]
struct FactRow {
    transaction_id: String,
    product_id: String,
    customer_id: String,
    store_id: String,
    date: NaiveDate,
    quantity: i32,
    price: Decimal,
    line_revenue: Decimal,
}

impl From<FactRow> for FactTransaction {
    fn from(row: FactRow) -> Self {
        FactTransaction {
            transaction_id: row.transaction_id,
            product_id: row.product_id,
            customer_id: row.customer_id,
            store_id: row.store_id,
            date: row.date,
            quantity: row.quantity,
            price: to_money(row.price),
            line_revenue: to_money(row.line_revenue),
        }
    }
}

pub struct PgWarehouse {
    pool: PgPool,
    tx: Option<Transaction<'static, Postgres>>,
}

impl PgWarehouse {
    /// Connect using the configured URL. Failure here is a configuration error.
    pub async fn connect(config: &Config) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.db_url)
            .await
            .map_err(|e| {
                LoaderError::Configuration(format!("failed to connect to database: {}", e))
            })?;
        info!("Database connection established");
        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool, tx: None }
    }

    /// Create the star-schema tables if they do not exist yet
    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(|e| LoaderError::Configuration(format!("failed to create schema: {}", e)))?;
        info!("Schema ensured");
        Ok(())
    }

    fn tx(&mut self) -> Result<&mut Transaction<'static, Postgres>> {
        self.tx
            .as_mut()
            .ok_or_else(|| LoaderError::SinkWrite("no open transaction".to_string()))
    }

    fn name_column(kind: DimensionKind) -> &'static str {
        match kind {
            DimensionKind::Product => "product_name",
            DimensionKind::Customer | DimensionKind::Store => "NULL::TEXT",
        }
    }
}

#[async_trait]
impl Warehouse for PgWarehouse {
    async fn begin(&mut self) -> Result<()> {
        if self.tx.is_some() {
            return Err(LoaderError::SinkWrite("transaction already open".to_string()));
        }
        let tx = self.pool.begin().await.map_err(LoaderError::write)?;
        self.tx = Some(tx);
        debug!("Transaction opened");
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        let tx = self
            .tx
            .take()
            .ok_or_else(|| LoaderError::SinkWrite("commit without a transaction".to_string()))?;
        tx.commit().await.map_err(LoaderError::write)?;
        debug!("Transaction committed");
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        if let Some(tx) = self.tx.take() {
            tx.rollback().await.map_err(LoaderError::write)?;
            debug!("Transaction rolled back");
        }
        Ok(())
    }

    async fn read_dimension(
        &mut self,
        kind: DimensionKind,
        key: &str,
    ) -> Result<Option<DimensionRecord>> {
        let sql = format!(
            "SELECT {key}, {name}, first_seen, last_seen FROM {table} WHERE {key} = $1",
            key = kind.key_column(),
            name = Self::name_column(kind),
            table = kind.table(),
        );
        let tx = self.tx()?;
        let row: Option<(String, Option<String>, NaiveDate, NaiveDate)> = sqlx::query_as(&sql)
            .bind(key)
            .fetch_optional(&mut **tx)
            .await
            .map_err(LoaderError::read)?;

        Ok(row.map(|(key, name, first_seen, last_seen)| DimensionRecord {
            kind,
            key,
            name,
            first_seen,
            last_seen,
        }))
    }

    #[instrument(skip(self, record), fields(kind = %record.kind, key = %record.key))]
    async fn upsert_dimension(&mut self, record: &DimensionRecord) -> Result<()> {
        let tx = self.tx()?;
        let query = match record.kind {
            DimensionKind::Product => sqlx::query(
                r#"
                INSERT INTO dim_products (product_id, product_name, first_seen, last_seen)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (product_id) DO UPDATE SET
                    product_name = EXCLUDED.product_name,
                    first_seen = EXCLUDED.first_seen,
                    last_seen = EXCLUDED.last_seen
                "#,
            )
            .bind(&record.key)
            .bind(&record.name)
            .bind(record.first_seen)
            .bind(record.last_seen),
            DimensionKind::Customer => sqlx::query(
                r#"
                INSERT INTO dim_customers (customer_id, first_seen, last_seen)
                VALUES ($1, $2, $3)
                ON CONFLICT (customer_id) DO UPDATE SET
                    first_seen = EXCLUDED.first_seen,
                    last_seen = EXCLUDED.last_seen
                "#,
            )
            .bind(&record.key)
            .bind(record.first_seen)
            .bind(record.last_seen),
            DimensionKind::Store => sqlx::query(
                r#"
                INSERT INTO dim_stores (store_id, first_seen, last_seen)
                VALUES ($1, $2, $3)
                ON CONFLICT (store_id) DO UPDATE SET
                    first_seen = EXCLUDED.first_seen,
                    last_seen = EXCLUDED.last_seen
                "#,
            )
            .bind(&record.key)
            .bind(record.first_seen)
            .bind(record.last_seen),
        };
        query.execute(&mut **tx).await.map_err(LoaderError::write)?;
        Ok(())
    }

    async fn read_fact(&mut self, transaction_id: &str) -> Result<Option<FactTransaction>> {
        let tx = self.tx()?;
        let row: Option<FactRow> = sqlx::query_as(
            r#"
            SELECT transaction_id, product_id, customer_id, store_id, date, quantity, price, line_revenue
            FROM fact_transactions
            WHERE transaction_id = $1
            "#,
        )
        .bind(transaction_id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(LoaderError::read)?;

        Ok(row.map(FactTransaction::from))
    }

    async fn upsert_fact(&mut self, fact: &FactTransaction) -> Result<()> {
        let tx = self.tx()?;
        sqlx::query(
            r#"
            INSERT INTO fact_transactions
                (transaction_id, product_id, customer_id, store_id, date, quantity, price, line_revenue)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (transaction_id) DO UPDATE SET
                product_id = EXCLUDED.product_id,
                customer_id = EXCLUDED.customer_id,
                store_id = EXCLUDED.store_id,
                date = EXCLUDED.date,
                quantity = EXCLUDED.quantity,
                price = EXCLUDED.price,
                line_revenue = EXCLUDED.line_revenue
            "#,
        )
        .bind(&fact.transaction_id)
        .bind(&fact.product_id)
        .bind(&fact.customer_id)
        .bind(&fact.store_id)
        .bind(fact.date)
        .bind(fact.quantity)
        .bind(fact.price)
        .bind(fact.line_revenue)
        .execute(&mut **tx)
        .await
        .map_err(LoaderError::write)?;
        Ok(())
    }

    async fn store_day_totals(&mut self, key: &StoreDay) -> Result<DailySalesAgg> {
        let tx = self.tx()?;
        let (total_revenue, total_transactions): (Decimal, i64) = sqlx::query_as(
            r#"
            SELECT COALESCE(SUM(line_revenue), 0), COUNT(DISTINCT transaction_id)
            FROM fact_transactions
            WHERE store_id = $1 AND date = $2
            "#,
        )
        .bind(&key.store_id)
        .bind(key.date)
        .fetch_one(&mut **tx)
        .await
        .map_err(LoaderError::read)?;

        Ok(DailySalesAgg {
            store_id: key.store_id.clone(),
            date: key.date,
            total_revenue: to_money(total_revenue),
            total_transactions,
        })
    }

    async fn read_daily_sales(&mut self, key: &StoreDay) -> Result<Option<DailySalesAgg>> {
        let tx = self.tx()?;
        let row: Option<(Decimal, i64)> = sqlx::query_as(
            "SELECT total_revenue, total_transactions FROM agg_daily_sales WHERE store_id = $1 AND date = $2",
        )
        .bind(&key.store_id)
        .bind(key.date)
        .fetch_optional(&mut **tx)
        .await
        .map_err(LoaderError::read)?;

        Ok(row.map(|(total_revenue, total_transactions)| DailySalesAgg {
            store_id: key.store_id.clone(),
            date: key.date,
            total_revenue: to_money(total_revenue),
            total_transactions,
        }))
    }

    async fn upsert_daily_sales(&mut self, row: &DailySalesAgg) -> Result<()> {
        let tx = self.tx()?;
        sqlx::query(
            r#"
            INSERT INTO agg_daily_sales (store_id, date, total_revenue, total_transactions)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (store_id, date) DO UPDATE SET
                total_revenue = EXCLUDED.total_revenue,
                total_transactions = EXCLUDED.total_transactions
            "#,
        )
        .bind(&row.store_id)
        .bind(row.date)
        .bind(row.total_revenue)
        .bind(row.total_transactions)
        .execute(&mut **tx)
        .await
        .map_err(LoaderError::write)?;
        Ok(())
    }

    async fn record_run(&mut self, summary: &RunSummary) -> Result<()> {
        let detail = serde_json::to_value(summary).map_err(LoaderError::write)?;
        sqlx::query(
            r#"
            INSERT INTO etl_runs (run_id, source, started_at, finished_at, status, error, detail)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (run_id) DO NOTHING
            "#,
        )
        .bind(summary.run_id)
        .bind(&summary.source)
        .bind(summary.started_at)
        .bind(summary.finished_at)
        .bind(summary.outcome.as_str())
        .bind(&summary.first_error)
        .bind(detail)
        .execute(&self.pool)
        .await
        .map_err(LoaderError::write)?;
        Ok(())
    }
}
