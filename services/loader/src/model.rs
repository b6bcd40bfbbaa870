//! Record types shared by every stage of the loader
//!
//! Raw rows are loosely typed (`RawRecord`, a map of field name to
//! `RawValue`) and only exist between the source and the validator. Everything
//! after validation uses the strict types below.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

/// Canonical field names of a raw transaction row
pub mod field {
    pub const TRANSACTION_ID: &str = "transaction_id";
    pub const DATE: &str = "date";
    pub const PRODUCT_ID: &str = "product_id";
    pub const PRODUCT_NAME: &str = "product_name";
    pub const QUANTITY: &str = "quantity";
    pub const PRICE: &str = "price";
    pub const CUSTOMER_ID: &str = "customer_id";
    pub const STORE_ID: &str = "store_id";

    /// Every field the loader reads, in source column order
    pub const ALL: &[&str] = &[
        TRANSACTION_ID,
        DATE,
        PRODUCT_ID,
        PRODUCT_NAME,
        QUANTITY,
        PRICE,
        CUSTOMER_ID,
        STORE_ID,
    ];
}

/// Canonical calendar format for transaction dates
pub const DATE_FORMAT: &str = "%Y-%m-%d";

// =============================================================================
// Raw (boundary) types
// =============================================================================

/// An untyped cell as it came out of the source
#[derive(Debug, Clone, PartialEq)]
pub enum RawValue {
    Empty,
    Text(String),
    Int(i64),
    Float(f64),
    Date(NaiveDate),
}

impl RawValue {
    /// Render the cell as trimmed text. Blank cells render as `None`.
    ///
    /// Integral floats render without a fractional part so that a spreadsheet
    /// cell holding `1001.0` reads the same as the CSV text `1001`.
    pub fn render(&self) -> Option<String> {
        let text = match self {
            RawValue::Empty => return None,
            RawValue::Text(s) => s.trim().to_string(),
            RawValue::Int(i) => i.to_string(),
            RawValue::Float(f) => {
                if f.is_finite() && f.fract() == 0.0 && f.abs() < i64::MAX as f64 {
                    (*f as i64).to_string()
                } else {
                    f.to_string()
                }
            }
            RawValue::Date(d) => d.format(DATE_FORMAT).to_string(),
        };
        if text.is_empty() {
            None
        } else {
            Some(text)
        }
    }
}

impl From<&str> for RawValue {
    fn from(value: &str) -> Self {
        if value.trim().is_empty() {
            RawValue::Empty
        } else {
            RawValue::Text(value.to_string())
        }
    }
}

/// One source row: field name to untyped value, plus where it came from
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawRecord {
    /// 1-based line (CSV) or row (spreadsheet) number in the source, header included
    pub line: usize,
    pub fields: BTreeMap<String, RawValue>,
}

impl RawRecord {
    pub fn new(line: usize) -> Self {
        Self {
            line,
            fields: BTreeMap::new(),
        }
    }

    /// Builder used by sources and tests
    pub fn with(mut self, name: &str, value: impl Into<RawValue>) -> Self {
        self.set(name, value.into());
        self
    }

    pub fn set(&mut self, name: &str, value: RawValue) {
        self.fields.insert(name.trim().to_lowercase(), value);
    }

    pub fn get(&self, name: &str) -> Option<&RawValue> {
        self.fields.get(name)
    }

    /// Rendered text of a field, `None` when absent or blank
    pub fn text(&self, name: &str) -> Option<String> {
        self.get(name).and_then(RawValue::render)
    }

    /// Content fingerprint used to spot exact duplicate rows
    pub fn fingerprint(&self) -> Vec<(String, Option<String>)> {
        self.fields
            .iter()
            .map(|(k, v)| (k.clone(), v.render()))
            .collect()
    }
}

impl From<i64> for RawValue {
    fn from(value: i64) -> Self {
        RawValue::Int(value)
    }
}

impl From<f64> for RawValue {
    fn from(value: f64) -> Self {
        RawValue::Float(value)
    }
}

impl From<NaiveDate> for RawValue {
    fn from(value: NaiveDate) -> Self {
        RawValue::Date(value)
    }
}

// =============================================================================
// Strict types
// =============================================================================

/// A raw record that passed every validation rule
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedTransaction {
    pub line: usize,
    pub transaction_id: String,
    pub date: NaiveDate,
    pub product_id: String,
    pub product_name: Option<String>,
    pub quantity: i32,
    pub price: Decimal,
    pub customer_id: String,
    pub store_id: String,
}

/// The three dimensions of the star schema
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DimensionKind {
    Product,
    Customer,
    Store,
}

impl DimensionKind {
    pub const ALL: [DimensionKind; 3] = [
        DimensionKind::Product,
        DimensionKind::Customer,
        DimensionKind::Store,
    ];

    pub fn table(self) -> &'static str {
        match self {
            DimensionKind::Product => "dim_products",
            DimensionKind::Customer => "dim_customers",
            DimensionKind::Store => "dim_stores",
        }
    }

    pub fn key_column(self) -> &'static str {
        match self {
            DimensionKind::Product => "product_id",
            DimensionKind::Customer => "customer_id",
            DimensionKind::Store => "store_id",
        }
    }
}

impl fmt::Display for DimensionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            DimensionKind::Product => "product",
            DimensionKind::Customer => "customer",
            DimensionKind::Store => "store",
        };
        f.write_str(label)
    }
}

/// A row of `dim_products`, `dim_customers` or `dim_stores`.
///
/// `name` is only meaningful for products and is always `None` otherwise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DimensionRecord {
    pub kind: DimensionKind,
    pub key: String,
    pub name: Option<String>,
    pub first_seen: NaiveDate,
    pub last_seen: NaiveDate,
}

/// What one transaction says about one dimension member
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DimensionObservation {
    pub kind: DimensionKind,
    pub key: String,
    pub name: Option<String>,
    pub seen: NaiveDate,
}

/// A row of `fact_transactions`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FactTransaction {
    pub transaction_id: String,
    pub product_id: String,
    pub customer_id: String,
    pub store_id: String,
    pub date: NaiveDate,
    pub quantity: i32,
    pub price: Decimal,
    pub line_revenue: Decimal,
}

impl FactTransaction {
    pub fn store_day(&self) -> StoreDay {
        StoreDay {
            store_id: self.store_id.clone(),
            date: self.date,
        }
    }
}

/// Key of `agg_daily_sales`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct StoreDay {
    pub store_id: String,
    pub date: NaiveDate,
}

impl fmt::Display for StoreDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.store_id, self.date.format(DATE_FORMAT))
    }
}

/// A row of `agg_daily_sales`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DailySalesAgg {
    pub store_id: String,
    pub date: NaiveDate,
    pub total_revenue: Decimal,
    pub total_transactions: i64,
}
