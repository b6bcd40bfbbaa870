//! Aggregator - keeps `agg_daily_sales` equal to a full re-aggregation of
//! `fact_transactions` for every (store, day) a run touched.
//!
//! Nothing is maintained incrementally: each touched key is recomputed from
//! every fact row the sink holds for it, including rows from earlier runs.

use rust_decimal::Decimal;
use std::collections::{BTreeSet, HashSet};
use tracing::debug;

use crate::error::Result;
use crate::model::{DailySalesAgg, FactTransaction, StoreDay};
use crate::normalize::to_money;
use crate::sink::Warehouse;

/// Sum `line_revenue` and count distinct transactions filed under `key`.
/// Sinks without a query engine use this for [`Warehouse::store_day_totals`].
pub fn totals_for<'a, I>(key: &StoreDay, facts: I) -> DailySalesAgg
where
    I: IntoIterator<Item = &'a FactTransaction>,
{
    let mut total_revenue = Decimal::ZERO;
    let mut ids: HashSet<&str> = HashSet::new();

    for fact in facts {
        if fact.store_id == key.store_id && fact.date == key.date {
            total_revenue += fact.line_revenue;
            ids.insert(fact.transaction_id.as_str());
        }
    }

    DailySalesAgg {
        store_id: key.store_id.clone(),
        date: key.date,
        total_revenue: to_money(total_revenue),
        total_transactions: ids.len() as i64,
    }
}

/// Recompute and upsert the aggregate row of every touched key, in key order.
///
/// A key with no remaining facts (its last transaction was moved by a
/// correction) is stored as zero revenue over zero transactions.
pub async fn refresh_daily_sales<W>(
    sink: &mut W,
    touched: &BTreeSet<StoreDay>,
) -> Result<Vec<DailySalesAgg>>
where
    W: Warehouse + ?Sized,
{
    let mut refreshed = Vec::with_capacity(touched.len());
    for key in touched {
        let row = sink.store_day_totals(key).await?;
        debug!(
            key = %key,
            total_revenue = %row.total_revenue,
            total_transactions = row.total_transactions,
            "Refreshed daily sales"
        );
        sink.upsert_daily_sales(&row).await?;
        refreshed.push(row);
    }
    Ok(refreshed)
}
