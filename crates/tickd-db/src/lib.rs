//! PostgreSQL persistence layer.
//!
//! One typed surface over the receipt-processing schema: sender/group/store
//! upserts, message and receipt insertion (each in a single transaction),
//! and the category queries the prompt assembler renders from.

pub mod categories;
pub mod error;
pub mod messages;
pub mod pool;
pub mod receipts;

pub use categories::{ItemCategoryRow, TransactionCategoryRow};
pub use error::DbError;
pub use messages::PersistedMessage;
pub use pool::Db;
