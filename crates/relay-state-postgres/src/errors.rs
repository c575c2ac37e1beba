use relay_core::CoreError;
use tracing::warn;

/// SQLSTATE class 08: connection exception
const CONNECTION_EXCEPTION_CLASS: &str = "08";
/// SQLSTATE 40001 / 40P01: serialization failure, deadlock
const RETRYABLE_STATES: &[&str] = &["40001", "40P01"];

/// Translate a driver error into the core taxonomy.
///
/// Unique violations become `AlreadyExists`; connection-level failures and
/// serialization conflicts become `Transient`.
pub fn map_sqlx_error(operation: &str, err: sqlx::Error) -> CoreError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => CoreError::AlreadyExists(format!(
            "{}: {}",
            operation,
            db.constraint().unwrap_or_else(|| db.message())
        )),
        sqlx::Error::Database(db) => {
            let code = db.code().map(|c| c.into_owned()).unwrap_or_default();
            if code.starts_with(CONNECTION_EXCEPTION_CLASS) || RETRYABLE_STATES.contains(&code.as_str()) {
                warn!(operation, code = %code, "Retryable database error");
                CoreError::Transient(format!("{}: {}", operation, db.message()))
            } else {
                CoreError::StateStoreError(format!("{}: {}", operation, db.message()))
            }
        }
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => CoreError::Transient(format!("{}: {}", operation, err)),
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            CoreError::SerializationError(format!("{}: {}", operation, err))
        }
        _ => CoreError::StateStoreError(format!("{}: {}", operation, err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_failures_are_transient() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        assert!(map_sqlx_error("find", sqlx::Error::Io(io)).is_transient());
        assert!(map_sqlx_error("find", sqlx::Error::PoolTimedOut).is_transient());
    }

    #[test]
    fn test_other_failures_are_not_retried() {
        let err = map_sqlx_error("find", sqlx::Error::RowNotFound);
        assert!(matches!(err, CoreError::StateStoreError(msg) if msg.starts_with("find:")));
    }
}
