use thiserror::Error;
use tickd_core::ErrorKind;

#[derive(Debug, Error)]
pub enum SignalError {
    #[error("sidecar transport error: {0}")]
    Transport(String),

    #[error("envelope parse error: {0}")]
    Parse(String),
}

impl SignalError {
    /// Taxonomic kind this error maps to at a stage boundary.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SignalError::Transport(_) => ErrorKind::SidecarTransport,
            SignalError::Parse(_) => ErrorKind::SidecarParse,
        }
    }
}

pub type Result<T> = std::result::Result<T, SignalError>;
