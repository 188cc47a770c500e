use thiserror::Error;
use tickd_core::ErrorKind;

#[derive(Debug, Error)]
pub enum ExtractError {
    /// Network/HTTP failure, including the per-call deadline.
    #[error("llm transport error: {0}")]
    Transport(String),

    /// Response arrived but carried no parsable JSON object.
    #[error("llm decode error: {0}")]
    Decode(String),
}

impl ExtractError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ExtractError::Transport(_) => ErrorKind::LlmTransport,
            ExtractError::Decode(_) => ErrorKind::LlmDecode,
        }
    }
}

pub type Result<T> = std::result::Result<T, ExtractError>;
