use thiserror::Error;
use tickd_core::ErrorKind;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("connect failed after retries: {0}")]
    Connect(String),
}

impl DbError {
    /// Map onto the stage taxonomy. The insert kind depends on which
    /// transaction the caller was running, so it is passed in.
    pub fn kind(&self, insert_kind: ErrorKind) -> ErrorKind {
        match self {
            DbError::Connect(_) => ErrorKind::DbConnect,
            DbError::Sqlx(e) if is_connect_error(e) => ErrorKind::DbConnect,
            DbError::Sqlx(_) => insert_kind,
        }
    }
}

/// Errors raised before a statement ran: pool exhaustion, connect failures.
fn is_connect_error(e: &sqlx::Error) -> bool {
    matches!(
        e,
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_)
    )
}

/// True when `e` is a unique-constraint violation — the idempotence-hit case
/// for duplicate `(sender, timestamp)` message inserts.
pub fn is_unique_violation(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db) => db.is_unique_violation(),
        _ => false,
    }
}

pub type Result<T> = std::result::Result<T, DbError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_timeout_maps_to_db_connect() {
        let err = DbError::Sqlx(sqlx::Error::PoolTimedOut);
        assert_eq!(err.kind(ErrorKind::DbInsertMessage), ErrorKind::DbConnect);
    }

    #[test]
    fn statement_errors_take_the_caller_kind() {
        let err = DbError::Sqlx(sqlx::Error::RowNotFound);
        assert_eq!(
            err.kind(ErrorKind::DbInsertReceipt),
            ErrorKind::DbInsertReceipt
        );
    }
}
