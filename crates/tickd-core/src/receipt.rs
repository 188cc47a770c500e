//! Relational aggregates produced by the receipt transformer and consumed by
//! the persistence layer. All monetary values are arbitrary-precision
//! decimals parsed from their string form, never binary floats.

use chrono::{NaiveDate, NaiveTime};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Currencies the pipeline accepts; anything else is a transform error.
pub const ACCEPTED_CURRENCIES: [&str; 4] = ["CHF", "EUR", "USD", "GBP"];

/// A store identified by its `(name, city, postal_code)` natural key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Store {
    pub store_name: String,
    pub address: Option<String>,
    pub postal_code: Option<String>,
    pub city: Option<String>,
    pub country_code: Option<String>,
    pub phone: Option<String>,
}

/// One purchase: header data for a `transaction` row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub message_id: Option<i64>,
    pub transaction_category_id: Option<i32>,
    /// When set without an id, the persistence layer resolves or creates the
    /// category on its lower-cased name.
    pub transaction_category_name: Option<String>,
    pub receipt_number: Option<String>,
    pub transaction_date: NaiveDate,
    pub transaction_time: Option<NaiveTime>,
    pub currency: String,
    pub total: Decimal,
    pub payment_method: Option<String>,
    /// Ingestion channel tag; always "signal" for this pipeline.
    pub source: String,
}

/// One receipt line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub product_name: String,
    pub product_reference: Option<String>,
    pub brand: Option<String>,
    pub quantity: Decimal,
    pub unit_price: Decimal,
    /// The extracted value wins; `quantity × unit_price` is advisory only.
    pub total_price: Decimal,
    pub vat_rate: Option<String>,
    pub category_main: String,
    pub category_sub: String,
    /// 1-based position on the receipt.
    pub line_number: i32,
}

/// The full transformed receipt: one store, one transaction, ordered items.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiptData {
    pub store: Store,
    pub transaction: Transaction,
    pub items: Vec<Item>,
}

impl ReceiptData {
    pub fn is_accepted_currency(currency: &str) -> bool {
        ACCEPTED_CURRENCIES.contains(&currency)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn currency_closure() {
        for c in ACCEPTED_CURRENCIES {
            assert!(ReceiptData::is_accepted_currency(c));
        }
        assert!(!ReceiptData::is_accepted_currency("JPY"));
        assert!(!ReceiptData::is_accepted_currency("chf"));
    }

    #[test]
    fn decimal_string_fidelity() {
        // No binary drift: what was parsed is what is emitted.
        let d = Decimal::from_str("12.34").unwrap();
        assert_eq!(d.to_string(), "12.34");
        let d = Decimal::from_str("42.50").unwrap();
        assert_eq!(d.to_string(), "42.50");
    }
}
