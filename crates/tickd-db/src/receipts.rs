//! Receipt-side persistence: stores, categories, transactions, items and the
//! mapping tables. Everything for one receipt happens in one transaction; a
//! failed statement rolls the whole receipt back.

use sqlx::{Postgres, Transaction as PgTransaction};
use tracing::{debug, info};

use tickd_core::ReceiptData;

use crate::error::Result;
use crate::pool::Db;

impl Db {
    /// Insert a transformed receipt. Returns the transaction id.
    ///
    /// When `attachment_ids` is not supplied but `message_id` is, the
    /// attachments are derived from the message mapping table.
    pub async fn insert_receipt(
        &self,
        receipt: &ReceiptData,
        message_id: Option<i64>,
        attachment_ids: Option<&[i64]>,
    ) -> Result<i64> {
        let mut tx = self.pool().begin().await?;

        let store_id = upsert_store(&mut tx, receipt).await?;
        let category_id = resolve_transaction_category(&mut tx, receipt).await?;

        let transaction_id: i64 = sqlx::query_scalar(
            "INSERT INTO transaction (
                message_id, store_id, transaction_category_id, receipt_number,
                transaction_date, transaction_time, currency, total,
                payment_method, source, processed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, CURRENT_TIMESTAMP)
            RETURNING transaction_id",
        )
        .bind(message_id)
        .bind(store_id)
        .bind(category_id)
        .bind(receipt.transaction.receipt_number.as_deref())
        .bind(receipt.transaction.transaction_date)
        .bind(receipt.transaction.transaction_time)
        .bind(&receipt.transaction.currency)
        .bind(receipt.transaction.total)
        .bind(receipt.transaction.payment_method.as_deref())
        .bind(&receipt.transaction.source)
        .fetch_one(&mut *tx)
        .await?;

        for item in &receipt.items {
            let item_category_id =
                resolve_item_category(&mut tx, &item.category_main, &item.category_sub).await?;

            let item_id: i64 = sqlx::query_scalar(
                "INSERT INTO item (
                    product_name, product_reference, brand,
                    quantity, unit_price, total_price, vat_rate,
                    category_id, line_number
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                RETURNING item_id",
            )
            .bind(&item.product_name)
            .bind(item.product_reference.as_deref())
            .bind(item.brand.as_deref())
            .bind(item.quantity)
            .bind(item.unit_price)
            .bind(item.total_price)
            .bind(item.vat_rate.as_deref())
            .bind(item_category_id)
            .bind(item.line_number)
            .fetch_one(&mut *tx)
            .await?;

            sqlx::query(
                "INSERT INTO transaction_item_mapping (transaction_id, item_id)
                 VALUES ($1, $2)",
            )
            .bind(transaction_id)
            .bind(item_id)
            .execute(&mut *tx)
            .await?;
        }

        let linked = link_attachments(&mut tx, transaction_id, message_id, attachment_ids).await?;
        tx.commit().await?;

        info!(
            transaction_id,
            store = %receipt.store.store_name,
            items = receipt.items.len(),
            attachments = linked,
            "receipt persisted"
        );
        Ok(transaction_id)
    }
}

async fn upsert_store(tx: &mut PgTransaction<'_, Postgres>, receipt: &ReceiptData) -> Result<i64> {
    let store = &receipt.store;
    let store_id: i64 = sqlx::query_scalar(
        "INSERT INTO store (store_name, address, postal_code, city, country_code, phone)
         VALUES ($1, $2, $3, $4, $5, $6)
         ON CONFLICT (store_name, city, postal_code)
         DO UPDATE SET
             address = COALESCE(EXCLUDED.address, store.address),
             phone = COALESCE(EXCLUDED.phone, store.phone),
             updated_at = CURRENT_TIMESTAMP
         RETURNING store_id",
    )
    .bind(&store.store_name)
    .bind(store.address.as_deref())
    .bind(store.postal_code.as_deref())
    .bind(store.city.as_deref())
    .bind(store.country_code.as_deref())
    .bind(store.phone.as_deref())
    .fetch_one(&mut **tx)
    .await?;
    Ok(store_id)
}

/// Resolve the transaction category: an explicit id wins; otherwise a name
/// is created or looked up on its lower-cased form.
async fn resolve_transaction_category(
    tx: &mut PgTransaction<'_, Postgres>,
    receipt: &ReceiptData,
) -> Result<Option<i32>> {
    if let Some(name) = receipt.transaction.transaction_category_name.as_deref() {
        let normalized = normalize_category_name(name);
        // Insert-then-select: DO NOTHING returns no row when the category
        // already exists, so a fallback SELECT resolves it without the
        // deadlock-prone upsert-with-update dance.
        let inserted: Option<i32> = sqlx::query_scalar(
            "INSERT INTO transaction_category (name)
             VALUES ($1)
             ON CONFLICT (name) DO NOTHING
             RETURNING category_id",
        )
        .bind(&normalized)
        .fetch_optional(&mut **tx)
        .await?;

        let id = match inserted {
            Some(id) => id,
            None => {
                sqlx::query_scalar("SELECT category_id FROM transaction_category WHERE name = $1")
                    .bind(&normalized)
                    .fetch_one(&mut **tx)
                    .await?
            }
        };
        debug!(category = %normalized, category_id = id, "transaction category resolved");
        return Ok(Some(id));
    }
    Ok(receipt.transaction.transaction_category_id)
}

/// Resolve an item category on its `(main, sub)` pair, creating it when it
/// does not exist yet. Same insert-then-select pattern as transaction
/// categories.
async fn resolve_item_category(
    tx: &mut PgTransaction<'_, Postgres>,
    main: &str,
    sub: &str,
) -> Result<i32> {
    let inserted: Option<i32> = sqlx::query_scalar(
        "INSERT INTO item_category (category_main, category_sub)
         VALUES ($1, $2)
         ON CONFLICT (category_main, category_sub) DO NOTHING
         RETURNING category_id",
    )
    .bind(main)
    .bind(sub)
    .fetch_optional(&mut **tx)
    .await?;

    match inserted {
        Some(id) => Ok(id),
        None => {
            let id = sqlx::query_scalar(
                "SELECT category_id FROM item_category
                 WHERE category_main = $1 AND category_sub = $2",
            )
            .bind(main)
            .bind(sub)
            .fetch_one(&mut **tx)
            .await?;
            Ok(id)
        }
    }
}

pub(crate) fn normalize_category_name(name: &str) -> String {
    name.trim().to_lowercase()
}

async fn link_attachments(
    tx: &mut PgTransaction<'_, Postgres>,
    transaction_id: i64,
    message_id: Option<i64>,
    attachment_ids: Option<&[i64]>,
) -> Result<usize> {
    let ids: Vec<i64> = match (attachment_ids, message_id) {
        (Some(ids), _) if !ids.is_empty() => ids.to_vec(),
        (_, Some(message_id)) => {
            sqlx::query_scalar(
                "SELECT attachment_id
                 FROM message_attachment_mapping
                 WHERE message_id = $1",
            )
            .bind(message_id)
            .fetch_all(&mut **tx)
            .await?
        }
        _ => Vec::new(),
    };

    for attachment_id in &ids {
        sqlx::query(
            "INSERT INTO transaction_attachment_mapping (transaction_id, attachment_id)
             VALUES ($1, $2)
             ON CONFLICT DO NOTHING",
        )
        .bind(transaction_id)
        .bind(attachment_id)
        .execute(&mut **tx)
        .await?;
    }
    Ok(ids.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_names_are_lowercased_and_trimmed() {
        assert_eq!(normalize_category_name("  Courses "), "courses");
        assert_eq!(normalize_category_name("RESTAURANT"), "restaurant");
    }
}
