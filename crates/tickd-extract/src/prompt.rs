//! Prompt assembly.
//!
//! The template carries two placeholders — `[item_categories]` and
//! `[transaction_categories]` — substituted with enumerations pulled from
//! the database. Rendering is pure given the category snapshot.

use tickd_db::{Db, DbError, ItemCategoryRow, TransactionCategoryRow};

pub const ITEM_CATEGORIES_PLACEHOLDER: &str = "[item_categories]";
pub const TRANSACTION_CATEGORIES_PLACEHOLDER: &str = "[transaction_categories]";

/// Render the template against the current category tables.
pub async fn render_from_db(db: &Db, template: &str) -> Result<String, DbError> {
    let items = db.item_categories().await?;
    let transactions = db.transaction_categories().await?;
    Ok(render(template, &items, &transactions))
}

/// Pure substitution of both placeholders.
pub fn render(
    template: &str,
    items: &[ItemCategoryRow],
    transactions: &[TransactionCategoryRow],
) -> String {
    template
        .replace(ITEM_CATEGORIES_PLACEHOLDER, &format_item_categories(items))
        .replace(
            TRANSACTION_CATEGORIES_PLACEHOLDER,
            &format_transaction_categories(transactions),
        )
}

/// Item categories grouped by `category_main`, one blank line between
/// groups:
///
/// ```text
///    Food:
///       - Bakery
///       - Dairy
///
///    Household:
///       - Cleaning
/// ```
pub fn format_item_categories(rows: &[ItemCategoryRow]) -> String {
    if rows.is_empty() {
        return "Aucune catégorie disponible.".to_string();
    }

    let mut lines: Vec<String> = Vec::new();
    let mut current_main: Option<&str> = None;
    for row in rows {
        if current_main != Some(row.category_main.as_str()) {
            if current_main.is_some() {
                lines.push(String::new());
            }
            lines.push(format!("   {}:", row.category_main));
            current_main = Some(row.category_main.as_str());
        }
        lines.push(format!("      - {}", row.category_sub));
    }
    lines.join("\n")
}

/// Transaction categories as `   - ID <n>: <name>`, ordered by id.
pub fn format_transaction_categories(rows: &[TransactionCategoryRow]) -> String {
    if rows.is_empty() {
        return "Aucune catégorie de transaction disponible.".to_string();
    }
    rows.iter()
        .map(|row| format!("   - ID {}: {}", row.category_id, row.name))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Advisory best-match lookup over the known `(main, sub)` pairs.
///
/// An exact (case-insensitive) main match wins immediately; otherwise the
/// best weighted similarity `0.6·main + 0.4·sub` above 0.5 is returned.
/// Not used on the happy path — kept for validators.
pub fn find_closest_category(
    categories: &[ItemCategoryRow],
    main: &str,
    sub: Option<&str>,
) -> Option<(String, String)> {
    if categories.is_empty() {
        return None;
    }

    let main_lower = main.trim().to_lowercase();
    let sub_lower = sub.map(|s| s.trim().to_lowercase());

    for row in categories {
        if row.category_main.to_lowercase() == main_lower {
            match &sub_lower {
                Some(sub) if row.category_sub.to_lowercase() == *sub => {
                    return Some((row.category_main.clone(), row.category_sub.clone()))
                }
                Some(_) => continue,
                None => return Some((row.category_main.clone(), row.category_sub.clone())),
            }
        }
    }

    let mut best: Option<(f64, &ItemCategoryRow)> = None;
    for row in categories {
        let main_score =
            strsim::normalized_levenshtein(&main_lower, &row.category_main.to_lowercase());
        let score = match &sub_lower {
            Some(sub) => {
                let sub_score =
                    strsim::normalized_levenshtein(sub, &row.category_sub.to_lowercase());
                main_score * 0.6 + sub_score * 0.4
            }
            None => main_score,
        };
        if best.map(|(s, _)| score > s).unwrap_or(true) {
            best = Some((score, row));
        }
    }

    best.filter(|(score, _)| *score > 0.5)
        .map(|(_, row)| (row.category_main.clone(), row.category_sub.clone()))
}
