//! LLM JSON → [`ReceiptData`].
//!
//! The extraction contract uses source-language keys (`magasin`,
//! `transaction`, `devise`, `total`, `articles`) accepted literally. Parsing
//! is tolerant for times and optional fields, strict everywhere else (dates,
//! currency, required keys). Monetary values always go through their string
//! form into arbitrary-precision decimals.

use std::str::FromStr;

use chrono::{NaiveDate, NaiveTime};
use rust_decimal::Decimal;
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

use tickd_core::receipt::ACCEPTED_CURRENCIES;
use tickd_core::{ErrorKind, Item, ReceiptData, Store, Transaction};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransformError {
    #[error("missing required field: {0}")]
    MissingField(String),

    #[error("invalid date {0:?} (expected YYYY-MM-DD)")]
    InvalidDate(String),

    #[error("invalid number for {field}: {value:?}")]
    InvalidNumber { field: String, value: String },

    #[error("currency {0:?} is not one of CHF/EUR/USD/GBP")]
    UnknownCurrency(String),
}

impl TransformError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::TransformSchema
    }
}

pub type Result<T> = std::result::Result<T, TransformError>;

/// Transform one extraction into the relational aggregate.
///
/// Deterministic and total over its input: the same JSON always yields the
/// same aggregate or the same error.
pub fn transform_receipt(json: &Value, message_id: Option<i64>) -> Result<ReceiptData> {
    let magasin = require_object(json, "magasin")?;
    let transaction = require_object(json, "transaction")?;

    let store = Store {
        store_name: require_str(magasin, "magasin.nom", "nom")?,
        address: optional_str(magasin, "adresse"),
        postal_code: optional_str(magasin, "code_postal"),
        city: optional_str(magasin, "ville"),
        country_code: optional_str(magasin, "pays"),
        phone: optional_str(magasin, "telephone"),
    };

    let date_raw = require_str(transaction, "transaction.date", "date")?;
    let transaction_date = NaiveDate::parse_from_str(&date_raw, "%Y-%m-%d")
        .map_err(|_| TransformError::InvalidDate(date_raw.clone()))?;

    let transaction_time = optional_str(transaction, "heure").and_then(|raw| parse_time(&raw));

    let currency_raw = json
        .get("devise")
        .and_then(Value::as_str)
        .ok_or_else(|| TransformError::MissingField("devise".to_string()))?;
    let currency = currency_raw.trim().to_uppercase();
    if !ACCEPTED_CURRENCIES.contains(&currency.as_str()) {
        return Err(TransformError::UnknownCurrency(currency_raw.to_string()));
    }

    let total = parse_decimal(
        json.get("total")
            .ok_or_else(|| TransformError::MissingField("total".to_string()))?,
        "total",
    )?;

    let record = Transaction {
        message_id,
        transaction_category_id: transaction
            .get("category_id")
            .and_then(Value::as_i64)
            .map(|id| id as i32),
        transaction_category_name: None,
        receipt_number: optional_str(transaction, "numero_ticket"),
        transaction_date,
        transaction_time,
        currency,
        total,
        payment_method: optional_str(transaction, "mode_paiement"),
        source: "signal".to_string(),
    };

    let articles = json
        .get("articles")
        .and_then(Value::as_array)
        .ok_or_else(|| TransformError::MissingField("articles".to_string()))?;

    let mut items = Vec::with_capacity(articles.len());
    for (idx, article) in articles.iter().enumerate() {
        let line_number = (idx + 1) as i32;
        let item = transform_item(article, line_number)?;
        check_line_total(&item);
        items.push(item);
    }

    Ok(ReceiptData {
        store,
        transaction: record,
        items,
    })
}

fn transform_item(article: &Value, line_number: i32) -> Result<Item> {
    let field = |key: &str| format!("articles[{}].{key}", line_number - 1);

    Ok(Item {
        product_name: require_str(article, &field("nom"), "nom")?,
        product_reference: optional_str(article, "reference"),
        brand: optional_str(article, "marque"),
        quantity: parse_decimal(
            article
                .get("quantite")
                .ok_or_else(|| TransformError::MissingField(field("quantite")))?,
            &field("quantite"),
        )?,
        unit_price: parse_decimal(
            article
                .get("prix_unitaire")
                .ok_or_else(|| TransformError::MissingField(field("prix_unitaire")))?,
            &field("prix_unitaire"),
        )?,
        total_price: parse_decimal(
            article
                .get("prix_total")
                .ok_or_else(|| TransformError::MissingField(field("prix_total")))?,
            &field("prix_total"),
        )?,
        vat_rate: article.get("tva").and_then(value_as_string),
        category_main: require_str(article, &field("categorie"), "categorie")?,
        category_sub: require_str(article, &field("sous_categorie"), "sous_categorie")?,
        line_number,
    })
}

/// `HH:MM:SS` first, then `HH:MM`; anything else logs and yields None — a
/// bad time never fails the run.
fn parse_time(raw: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(raw, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(raw, "%H:%M"))
        .map_err(|_| {
            warn!(time = %raw, "unrecognised time format, storing NULL");
        })
        .ok()
}

/// Advisory only: the extracted total wins, a mismatch is just logged.
fn check_line_total(item: &Item) {
    let computed = item.quantity * item.unit_price;
    if (computed - item.total_price).abs() > Decimal::new(1, 2) {
        warn!(
            line = item.line_number,
            product = %item.product_name,
            computed = %computed,
            extracted = %item.total_price,
            "line total differs from quantity × unit price"
        );
    }
    if item.unit_price.is_sign_negative() || item.total_price.is_sign_negative() {
        warn!(
            line = item.line_number,
            product = %item.product_name,
            "negative price on receipt line"
        );
    }
}

/// Parse a decimal from the raw string form, whether the model emitted a
/// JSON number or a numeric string.
fn parse_decimal(value: &Value, field: &str) -> Result<Decimal> {
    let raw = value_as_string(value).ok_or_else(|| TransformError::InvalidNumber {
        field: field.to_string(),
        value: value.to_string(),
    })?;
    Decimal::from_str(raw.trim()).map_err(|_| TransformError::InvalidNumber {
        field: field.to_string(),
        value: raw,
    })
}

fn value_as_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn require_object<'a>(json: &'a Value, key: &str) -> Result<&'a Value> {
    json.get(key)
        .filter(|v| v.is_object())
        .ok_or_else(|| TransformError::MissingField(key.to_string()))
}

fn require_str(json: &Value, full_name: &str, key: &str) -> Result<String> {
    json.get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .map(str::to_string)
        .ok_or_else(|| TransformError::MissingField(full_name.to_string()))
}

fn optional_str(json: &Value, key: &str) -> Option<String> {
    json.get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .map(str::to_string)
}
