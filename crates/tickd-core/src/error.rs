use serde::{Deserialize, Serialize};

/// Taxonomic error kinds shared by every stage boundary.
///
/// Adapters convert their own error types into one of these at the outermost
/// call site; the engine only ever sees kinds, never raw errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// Sidecar process failed to spawn or exited non-zero.
    SidecarTransport,
    /// Malformed envelope JSON or an unreconstructable tag bag.
    SidecarParse,
    /// Pool exhausted or connect timeout.
    DbConnect,
    /// Failure inside the message-persistence transaction.
    DbInsertMessage,
    /// Failure inside the receipt-persistence transaction.
    DbInsertReceipt,
    /// Network/HTTP failure talking to the vision model.
    LlmTransport,
    /// Response received but no JSON object inside.
    LlmDecode,
    /// Required LLM key missing, unparsable date, unknown currency.
    TransformSchema,
    /// Cooperative cancellation.
    Cancelled,
}

impl ErrorKind {
    /// Wire/notification code for this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::SidecarTransport => "SIDECAR_TRANSPORT",
            ErrorKind::SidecarParse => "SIDECAR_PARSE",
            ErrorKind::DbConnect => "DB_CONNECT",
            ErrorKind::DbInsertMessage => "DB_INSERT_MESSAGE",
            ErrorKind::DbInsertReceipt => "DB_INSERT_RECEIPT",
            ErrorKind::LlmTransport => "LLM_TRANSPORT",
            ErrorKind::LlmDecode => "LLM_DECODE",
            ErrorKind::TransformSchema => "TRANSFORM_SCHEMA",
            ErrorKind::Cancelled => "CANCELLED",
        }
    }

    /// Whether the engine may re-run a stage that failed with this kind.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::SidecarTransport
                | ErrorKind::DbConnect
                | ErrorKind::DbInsertMessage
                | ErrorKind::DbInsertReceipt
                | ErrorKind::LlmTransport
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
