//! Vision-model extraction: request assembly, the HTTP call, and the prompt
//! rendered from the category tables.

pub mod client;
pub mod error;
pub mod prompt;

pub use client::{ExtractionRequest, VisionClient};
pub use error::ExtractError;

/// Default extraction prompt, with `[item_categories]` and
/// `[transaction_categories]` placeholders filled at render time.
pub const DEFAULT_TEMPLATE: &str = include_str!("../prompts/receipt.txt");
