//! Normalizer - turns a validated transaction into a fact row and the
//! dimension observations it implies.
//!
//! Money is fixed-point (`rust_decimal`) with two fractional digits. Rounding
//! is round-half-even and happens here, once. Later stages only add.

use rust_decimal::{Decimal, RoundingStrategy};

use crate::model::{DimensionKind, DimensionObservation, FactTransaction, ValidatedTransaction};

/// Fractional digits carried by every money column
pub const MONEY_SCALE: u32 = 2;

/// Output of normalizing one transaction
#[derive(Debug, Clone, PartialEq)]
pub struct Normalized {
    pub fact: FactTransaction,
    /// Product, customer, store, in that order
    pub observations: [DimensionObservation; 3],
}

/// Round to cents, half to even, and pin the scale so `1.5` and `1.50` store alike
pub fn to_money(value: Decimal) -> Decimal {
    let mut rounded = value.round_dp_with_strategy(MONEY_SCALE, RoundingStrategy::MidpointNearestEven);
    rounded.rescale(MONEY_SCALE);
    rounded
}

pub fn normalize(txn: &ValidatedTransaction) -> Normalized {
    // Revenue comes from the unrounded price so it is rounded exactly once.
    let line_revenue = to_money(txn.price * Decimal::from(txn.quantity));

    let fact = FactTransaction {
        transaction_id: txn.transaction_id.clone(),
        product_id: txn.product_id.clone(),
        customer_id: txn.customer_id.clone(),
        store_id: txn.store_id.clone(),
        date: txn.date,
        quantity: txn.quantity,
        price: to_money(txn.price),
        line_revenue,
    };

    let observe = |kind: DimensionKind, key: &str, name: Option<String>| DimensionObservation {
        kind,
        key: key.to_string(),
        name,
        seen: txn.date,
    };

    Normalized {
        fact,
        observations: [
            observe(DimensionKind::Product, &txn.product_id, txn.product_name.clone()),
            observe(DimensionKind::Customer, &txn.customer_id, None),
            observe(DimensionKind::Store, &txn.store_id, None),
        ],
    }
}
