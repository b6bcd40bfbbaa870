//! Validator - classifies raw rows as accepted or rejected
//!
//! Rules run in a fixed order and the first one violated is the reported
//! reason, so the same row always gets the same rejection:
//!
//! 1. `MissingField`        required field absent or blank
//! 2. `MalformedIdentifier` id outside `[A-Za-z0-9_.-]{1,64}`
//! 3. `MalformedDate`       anything other than `YYYY-MM-DD`
//! 4. `MalformedNumber`     quantity not an i32, price not a decimal below 1e10
//! 5. `NonPositiveQuantity` quantity <= 0
//! 6. `NegativePrice`       price < 0 (free items are fine)
//!
//! This module is pure: no I/O, no logging.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;

use crate::model::{field, RawRecord, RawValue, ValidatedTransaction, DATE_FORMAT};
use crate::normalize::to_money;

/// Fields that must be present, in the order they are checked
const REQUIRED_FIELDS: &[&str] = &[
    field::TRANSACTION_ID,
    field::DATE,
    field::PRODUCT_ID,
    field::QUANTITY,
    field::PRICE,
    field::CUSTOMER_ID,
    field::STORE_ID,
];

/// Identifier fields, in the order they are checked
const IDENTIFIER_FIELDS: &[&str] = &[
    field::TRANSACTION_ID,
    field::PRODUCT_ID,
    field::CUSTOMER_ID,
    field::STORE_ID,
];

const MAX_IDENTIFIER_LEN: usize = 64;

/// Prices that round to this or more are out of range for `NUMERIC(12,2)`
fn price_ceiling() -> Decimal {
    Decimal::new(10_000_000_000, 0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum RejectionKind {
    MissingField,
    MalformedIdentifier,
    MalformedDate,
    MalformedNumber,
    NonPositiveQuantity,
    NegativePrice,
}

impl RejectionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RejectionKind::MissingField => "MissingField",
            RejectionKind::MalformedIdentifier => "MalformedIdentifier",
            RejectionKind::MalformedDate => "MalformedDate",
            RejectionKind::MalformedNumber => "MalformedNumber",
            RejectionKind::NonPositiveQuantity => "NonPositiveQuantity",
            RejectionKind::NegativePrice => "NegativePrice",
        }
    }
}

impl fmt::Display for RejectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a row was not accepted
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Rejection {
    pub line: usize,
    /// Present whenever the row had a readable transaction id
    pub transaction_id: Option<String>,
    pub kind: RejectionKind,
    pub field: &'static str,
    pub detail: String,
}

/// Validate one raw record
pub fn validate(record: &RawRecord) -> Result<ValidatedTransaction, Rejection> {
    let reject = |kind: RejectionKind, offending: &'static str, detail: String| Rejection {
        line: record.line,
        transaction_id: record.text(field::TRANSACTION_ID),
        kind,
        field: offending,
        detail,
    };

    // 1. presence
    let mut values: BTreeMap<&'static str, String> = BTreeMap::new();
    for &name in REQUIRED_FIELDS {
        match record.text(name) {
            Some(v) => {
                values.insert(name, v);
            }
            None => {
                return Err(reject(
                    RejectionKind::MissingField,
                    name,
                    format!("'{}' is missing or blank", name),
                ))
            }
        }
    }
    let value = |name: &str| values.get(name).cloned().unwrap_or_default();

    // 2. identifiers
    for &name in IDENTIFIER_FIELDS {
        let id = value(name);
        if !is_valid_identifier(&id) {
            return Err(reject(
                RejectionKind::MalformedIdentifier,
                name,
                format!("'{}' is not a valid identifier: {:?}", name, id),
            ));
        }
    }

    // 3. date
    let raw_date = value(field::DATE);
    let date = parse_canonical_date(&raw_date).ok_or_else(|| {
        reject(
            RejectionKind::MalformedDate,
            field::DATE,
            format!("expected YYYY-MM-DD, found {:?}", raw_date),
        )
    })?;

    // 4. numbers
    let raw_quantity = value(field::QUANTITY);
    let quantity: i32 = raw_quantity.parse().map_err(|_| {
        reject(
            RejectionKind::MalformedNumber,
            field::QUANTITY,
            format!("quantity is not an integer: {:?}", raw_quantity),
        )
    })?;
    let raw_price = value(field::PRICE);
    let price = Decimal::from_str(&raw_price).map_err(|_| {
        reject(
            RejectionKind::MalformedNumber,
            field::PRICE,
            format!("price is not a decimal number: {:?}", raw_price),
        )
    })?;
    if to_money(price).abs() >= price_ceiling() {
        return Err(reject(
            RejectionKind::MalformedNumber,
            field::PRICE,
            format!("price out of range: {}", price),
        ));
    }

    // 5-6. ranges
    if quantity <= 0 {
        return Err(reject(
            RejectionKind::NonPositiveQuantity,
            field::QUANTITY,
            format!("quantity must be positive, found {}", quantity),
        ));
    }
    if price.is_sign_negative() && !price.is_zero() {
        return Err(reject(
            RejectionKind::NegativePrice,
            field::PRICE,
            format!("price must not be negative, found {}", price),
        ));
    }

    Ok(ValidatedTransaction {
        line: record.line,
        transaction_id: value(field::TRANSACTION_ID),
        date,
        product_id: value(field::PRODUCT_ID),
        product_name: record.text(field::PRODUCT_NAME),
        quantity,
        price,
        customer_id: value(field::CUSTOMER_ID),
        store_id: value(field::STORE_ID),
    })
}

fn is_valid_identifier(id: &str) -> bool {
    !id.is_empty()
        && id.chars().count() <= MAX_IDENTIFIER_LEN
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}

/// Parse `YYYY-MM-DD` and nothing else: no single-digit months, no times.
pub fn parse_canonical_date(raw: &str) -> Option<NaiveDate> {
    let bytes = raw.as_bytes();
    if bytes.len() != 10 {
        return None;
    }
    let shape_ok = bytes.iter().enumerate().all(|(i, b)| match i {
        4 | 7 => *b == b'-',
        _ => b.is_ascii_digit(),
    });
    if !shape_ok {
        return None;
    }
    NaiveDate::parse_from_str(raw, DATE_FORMAT).ok()
}

// =============================================================================
// Data-quality profile (validate-only mode)
// =============================================================================

/// Summary of a batch without touching the sink
#[derive(Debug, Clone, Default, Serialize)]
pub struct QualityProfile {
    pub total_records: usize,
    pub columns: Vec<String>,
    /// Per known field, number of rows where it is absent or blank
    pub missing_values: BTreeMap<String, usize>,
    /// Per column, how many cells looked like each type
    /// (`int`, `float`, `date`, `text`, `empty`)
    pub data_types: BTreeMap<String, BTreeMap<&'static str, usize>>,
    /// Rows that repeat an earlier row cell for cell
    pub duplicate_records: usize,
    pub accepted: usize,
    pub rejected_by_kind: BTreeMap<RejectionKind, usize>,
    #[serde(skip)]
    pub rejections: Vec<Rejection>,
}

impl QualityProfile {
    pub fn rejected(&self) -> usize {
        self.rejected_by_kind.values().sum()
    }
}

/// Type a cell looks like. Text cells are sniffed, so CSV input reports
/// the same types a spreadsheet would.
pub fn observed_type(cell: &RawValue) -> &'static str {
    match cell {
        RawValue::Empty => "empty",
        RawValue::Int(_) => "int",
        RawValue::Float(_) => "float",
        RawValue::Date(_) => "date",
        RawValue::Text(s) => {
            let s = s.trim();
            if s.is_empty() {
                "empty"
            } else if s.parse::<i64>().is_ok() {
                "int"
            } else if parse_canonical_date(s).is_some() {
                "date"
            } else if Decimal::from_str(s).is_ok() {
                "float"
            } else {
                "text"
            }
        }
    }
}

/// Validate every record and profile the batch
pub fn profile(records: &[RawRecord]) -> QualityProfile {
    let mut profile = QualityProfile {
        total_records: records.len(),
        ..Default::default()
    };

    let mut columns: Vec<String> = Vec::new();
    for name in field::ALL {
        profile.missing_values.insert(name.to_string(), 0);
    }

    let mut seen = HashSet::new();
    for record in records {
        for (name, cell) in &record.fields {
            if !columns.contains(name) {
                columns.push(name.clone());
            }
            *profile
                .data_types
                .entry(name.clone())
                .or_default()
                .entry(observed_type(cell))
                .or_insert(0) += 1;
        }
        for name in field::ALL {
            if record.text(name).is_none() {
                *profile.missing_values.entry(name.to_string()).or_insert(0) += 1;
            }
        }
        if !seen.insert(record.fingerprint()) {
            profile.duplicate_records += 1;
        }
        match validate(record) {
            Ok(_) => profile.accepted += 1,
            Err(rejection) => {
                *profile.rejected_by_kind.entry(rejection.kind).or_insert(0) += 1;
                profile.rejections.push(rejection);
            }
        }
    }

    profile.columns = columns;
    profile
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn row() -> RawRecord {
        RawRecord::new(2)
            .with("transaction_id", "1001")
            .with("date", "2024-01-15")
            .with("product_id", "P100")
            .with("product_name", "Laptop")
            .with("quantity", "1")
            .with("price", "899.99")
            .with("customer_id", "C001")
            .with("store_id", "S01")
    }

    fn kind_of(record: &RawRecord) -> RejectionKind {
        validate(record).unwrap_err().kind
    }

    // -------------------------------------------------------------------------
    // ACCEPTANCE
    // -------------------------------------------------------------------------

    #[test]
    fn test_valid_row_is_accepted() {
        let txn = validate(&row()).unwrap();
        assert_eq!(txn.transaction_id, "1001");
        assert_eq!(txn.date, NaiveDate::from_ymd_opt(2024, 1, 15).unwrap());
        assert_eq!(txn.quantity, 1);
        assert_eq!(txn.price, Decimal::new(89999, 2));
        assert_eq!(txn.product_name.as_deref(), Some("Laptop"));
        assert_eq!(txn.line, 2);
    }

    #[test]
    fn test_product_name_is_optional() {
        let mut rec = row();
        rec.fields.remove("product_name");
        assert_eq!(validate(&rec).unwrap().product_name, None);
    }

    #[test]
    fn test_zero_price_is_accepted() {
        let rec = row().with("price", "0");
        assert_eq!(validate(&rec).unwrap().price, Decimal::ZERO);
        let rec = row().with("price", "-0.00");
        assert!(validate(&rec).is_ok());
    }

    #[test]
    fn test_spreadsheet_cells_are_accepted() {
        let rec = row()
            .with("transaction_id", 1001.0)
            .with("quantity", 2i64)
            .with("price", 29.99)
            .with("date", NaiveDate::from_ymd_opt(2024, 1, 15).unwrap());
        let txn = validate(&rec).unwrap();
        assert_eq!(txn.transaction_id, "1001");
        assert_eq!(txn.quantity, 2);
        assert_eq!(txn.price, Decimal::new(2999, 2));
    }

    // -------------------------------------------------------------------------
    // REJECTION KINDS
    // -------------------------------------------------------------------------

    #[test]
    fn test_missing_field() {
        let mut rec = row();
        rec.fields.remove("store_id");
        let rejection = validate(&rec).unwrap_err();
        assert_eq!(rejection.kind, RejectionKind::MissingField);
        assert_eq!(rejection.field, "store_id");
        assert_eq!(rejection.transaction_id.as_deref(), Some("1001"));
    }

    #[test]
    fn test_blank_field_counts_as_missing() {
        assert_eq!(kind_of(&row().with("customer_id", "   ")), RejectionKind::MissingField);
    }

    #[test]
    fn test_malformed_identifier() {
        let rec = row().with("product_id", "P 100");
        let rejection = validate(&rec).unwrap_err();
        assert_eq!(rejection.kind, RejectionKind::MalformedIdentifier);
        assert_eq!(rejection.field, "product_id");

        let long = "X".repeat(65);
        assert_eq!(
            kind_of(&row().with("store_id", long.as_str())),
            RejectionKind::MalformedIdentifier
        );
    }

    #[test]
    fn test_malformed_date_formats() {
        for bad in ["2024-1-15", "15/01/2024", "2024/01/15", "2024-02-30", "2024-01-15T10:00", "yesterday"] {
            assert_eq!(kind_of(&row().with("date", bad)), RejectionKind::MalformedDate, "{}", bad);
        }
    }

    #[test]
    fn test_malformed_numbers() {
        let rejection = validate(&row().with("quantity", "1.5")).unwrap_err();
        assert_eq!(rejection.kind, RejectionKind::MalformedNumber);
        assert_eq!(rejection.field, "quantity");

        let rejection = validate(&row().with("price", "$9.99")).unwrap_err();
        assert_eq!(rejection.kind, RejectionKind::MalformedNumber);
        assert_eq!(rejection.field, "price");

        let rejection = validate(&row().with("price", "10000000000")).unwrap_err();
        assert_eq!(rejection.kind, RejectionKind::MalformedNumber);
        assert!(rejection.detail.contains("out of range"));
    }

    #[test]
    fn test_price_checked_after_rounding() {
        let rejection = validate(&row().with("price", "9999999999.995")).unwrap_err();
        assert_eq!(rejection.kind, RejectionKind::MalformedNumber);
        assert_eq!(rejection.field, "price");

        let txn = validate(&row().with("price", "9999999999.994")).unwrap();
        assert_eq!(to_money(txn.price), Decimal::from_str("9999999999.99").unwrap());
    }

    #[test]
    fn test_zero_quantity_rejected() {
        assert_eq!(kind_of(&row().with("quantity", "0")), RejectionKind::NonPositiveQuantity);
    }

    #[test]
    fn test_negative_price_rejected() {
        assert_eq!(kind_of(&row().with("price", "-0.01")), RejectionKind::NegativePrice);
    }

    // -------------------------------------------------------------------------
    // RULE ORDER
    // -------------------------------------------------------------------------

    #[test]
    fn test_first_violated_rule_wins() {
        // bad date, zero quantity and negative price: date is checked first
        let rec = row()
            .with("date", "01/15/2024")
            .with("quantity", "0")
            .with("price", "-1");
        assert_eq!(kind_of(&rec), RejectionKind::MalformedDate);

        // bad identifier beats bad date
        let rec = row().with("store_id", "S 01").with("date", "nope");
        assert_eq!(kind_of(&rec), RejectionKind::MalformedIdentifier);

        // quantity range beats price range
        let rec = row().with("quantity", "-2").with("price", "-1");
        assert_eq!(kind_of(&rec), RejectionKind::NonPositiveQuantity);
    }

    #[test]
    fn test_rejection_is_deterministic() {
        let rec = row().with("quantity", "0").with("price", "-5");
        assert_eq!(validate(&rec), validate(&rec));
    }

    // -------------------------------------------------------------------------
    // PROFILE
    // -------------------------------------------------------------------------

    #[test]
    fn test_profile_counts() {
        let mut missing_name = row().with("transaction_id", "1002");
        missing_name.fields.remove("product_name");
        let records = vec![
            row(),
            row(),
            missing_name,
            row().with("transaction_id", "1003").with("quantity", "0"),
        ];
        let p = profile(&records);
        assert_eq!(p.total_records, 4);
        assert_eq!(p.duplicate_records, 1);
        assert_eq!(p.accepted, 3);
        assert_eq!(p.rejected(), 1);
        assert_eq!(p.rejected_by_kind[&RejectionKind::NonPositiveQuantity], 1);
        assert_eq!(p.missing_values["product_name"], 1);
        assert_eq!(p.missing_values["store_id"], 0);
        assert_eq!(p.columns.len(), 8);
        assert_eq!(p.rejections[0].line, 2);
    }

    #[test]
    fn test_profile_data_types() {
        let records = vec![
            row(),
            row().with("price", "n/a").with("quantity", 3i64),
            row().with("date", NaiveDate::from_ymd_opt(2024, 1, 15).unwrap()),
        ];
        let p = profile(&records);
        assert_eq!(p.data_types["price"]["float"], 2);
        assert_eq!(p.data_types["price"]["text"], 1);
        assert_eq!(p.data_types["quantity"]["int"], 3);
        assert_eq!(p.data_types["date"]["date"], 3);
        assert_eq!(p.data_types["store_id"]["text"], 3);
    }

    #[test]
    fn test_observed_type_sniffs_text() {
        assert_eq!(observed_type(&RawValue::from("1001")), "int");
        assert_eq!(observed_type(&RawValue::from("29.99")), "float");
        assert_eq!(observed_type(&RawValue::from("2024-01-15")), "date");
        assert_eq!(observed_type(&RawValue::from("S01")), "text");
        assert_eq!(observed_type(&RawValue::from("  ")), "empty");
        assert_eq!(observed_type(&RawValue::Float(1.5)), "float");
    }

    #[test]
    fn test_profile_empty_batch() {
        let p = profile(&[]);
        assert_eq!(p.total_records, 0);
        assert_eq!(p.rejected(), 0);
        assert!(p.columns.is_empty());
    }

    proptest! {
        #[test]
        fn prop_non_positive_quantity_always_rejected(q in i32::MIN..=0) {
            let rec = row().with("quantity", q.to_string().as_str());
            prop_assert_eq!(kind_of(&rec), RejectionKind::NonPositiveQuantity);
        }

        #[test]
        fn prop_positive_quantity_and_price_accepted(q in 1i32..10_000, cents in 0i64..10_000_000) {
            let price = Decimal::new(cents, 2).to_string();
            let rec = row()
                .with("quantity", q.to_string().as_str())
                .with("price", price.as_str());
            let txn = validate(&rec).unwrap();
            prop_assert_eq!(txn.quantity, q);
            prop_assert_eq!(txn.price, Decimal::new(cents, 2));
        }
    }
}
