//! Category queries backing prompt generation.

use sqlx::Row;

use crate::error::Result;
use crate::pool::Db;

/// One active `(main, sub)` item-category pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemCategoryRow {
    pub category_main: String,
    pub category_sub: String,
}

/// One transaction category, as rendered into the prompt (`ID <n>: <name>`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionCategoryRow {
    pub category_id: i32,
    pub name: String,
}

impl Db {
    /// All active item categories, ordered by main then sub. Retired
    /// categories (`active = FALSE`) never reach the prompt.
    pub async fn item_categories(&self) -> Result<Vec<ItemCategoryRow>> {
        let rows = sqlx::query(
            "SELECT category_main, category_sub
             FROM item_category
             WHERE active = TRUE
             ORDER BY category_main, category_sub",
        )
        .fetch_all(self.pool())
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| ItemCategoryRow {
                category_main: row.get("category_main"),
                category_sub: row.get("category_sub"),
            })
            .collect())
    }

    /// All transaction categories ordered by id.
    pub async fn transaction_categories(&self) -> Result<Vec<TransactionCategoryRow>> {
        let rows = sqlx::query(
            "SELECT category_id, name
             FROM transaction_category
             ORDER BY category_id",
        )
        .fetch_all(self.pool())
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| TransactionCategoryRow {
                category_id: row.get("category_id"),
                name: row.get("name"),
            })
            .collect())
    }
}
