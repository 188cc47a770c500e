pub mod config;
pub mod error;
pub mod receipt;
pub mod retry;
pub mod types;

pub use config::TickdConfig;
pub use error::ErrorKind;
pub use receipt::{Item, ReceiptData, Store, Transaction};
pub use types::{Attachment, Contact, Group, Message};
