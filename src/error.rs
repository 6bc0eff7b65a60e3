use thiserror::Error;

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("invalid input: {0}")]
    Validation(String),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    /// Lock timeout, deadlock or serialization failure on a hot key.
    #[error("contention on {0}, retry the action")]
    Contention(String),

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("storage error: {0}")]
    Internal(String),
}

impl LedgerError {
    pub fn validation(message: impl Into<String>) -> Self {
        LedgerError::Validation(message.into())
    }

    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        LedgerError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, LedgerError::Contention(_))
    }

    /// Classifies a driver error, lifting the Postgres contention codes out of
    /// the generic storage bucket.
    pub fn from_sqlx(err: sqlx::Error, key: &str) -> Self {
        if let sqlx::Error::Database(db) = &err {
            if let Some(code) = db.code() {
                // serialization_failure, deadlock_detected, lock_not_available
                if matches!(code.as_ref(), "40001" | "40P01" | "55P03") {
                    return LedgerError::Contention(key.to_string());
                }
            }
        }
        LedgerError::Storage(err)
    }
}

pub type LedgerResult<T> = Result<T, LedgerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_contention_is_transient() {
        assert!(LedgerError::Contention("user:a".into()).is_transient());
        assert!(!LedgerError::validation("bad").is_transient());
        assert!(!LedgerError::not_found("post", 7).is_transient());
        assert!(!LedgerError::Internal("boom".into()).is_transient());
    }

    #[test]
    fn not_found_names_entity() {
        let err = LedgerError::not_found("post", 42);
        assert_eq!(err.to_string(), "post 42 not found");
    }
}
