//! Shared Postgres error mapping.

use biblio_core::DomainError;

const FOREIGN_KEY_VIOLATION: &str = "23503";
const UNIQUE_VIOLATION: &str = "23505";

/// Map a sqlx error to the domain taxonomy.
///
/// Unique violations become `Conflict`; everything else (connection loss,
/// pool exhaustion, decode failures) is reported as `Transient` so callers
/// may retry.
pub(crate) fn map_sqlx_error(operation: &str, err: sqlx::Error) -> DomainError {
    match &err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {operation}: {}", db_err.message());
            if db_err.code().as_deref() == Some(UNIQUE_VIOLATION) {
                DomainError::conflict(msg)
            } else {
                DomainError::transient(msg)
            }
        }
        _ => DomainError::transient(format!("sqlx error in {operation}: {err}")),
    }
}

pub(crate) fn is_foreign_key_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        return db_err.code().as_deref() == Some(FOREIGN_KEY_VIOLATION);
    }
    false
}
