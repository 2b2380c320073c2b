use thiserror::Error;

/// Failures reported by a [`crate::store::HealthStore`].
///
/// `Transient` is the only retryable kind. `AuthExpired` must reach the
/// caller untouched so it can re-authenticate.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("datastore temporarily unavailable: {0}")]
    Transient(String),
    #[error("datastore credentials expired")]
    AuthExpired,
    #[error("{0} not found")]
    NotFound(String),
    #[error("invalid stored data: {0}")]
    Invalid(String),
    #[error("datastore error: {0}")]
    Backend(String),
}

impl StoreError {
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    #[must_use]
    pub fn is_auth_expired(&self) -> bool {
        matches!(self, Self::AuthExpired)
    }

    /// Classify a backend message the way a hosted datastore reports it.
    /// Expired JWTs never become retryable.
    #[must_use]
    pub fn from_message(message: &str) -> Self {
        if message.contains("PGRST303") || message.contains("JWT expired") {
            return Self::AuthExpired;
        }
        let lower = message.to_lowercase();
        if ["timed out", "timeout", "connection reset", "temporarily", "busy", "locked"]
            .iter()
            .any(|needle| lower.contains(needle))
        {
            return Self::Transient(message.to_string());
        }
        Self::Backend(message.to_string())
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;
        match &err {
            rusqlite::Error::SqliteFailure(e, _)
                if matches!(e.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) =>
            {
                Self::Transient(err.to_string())
            }
            rusqlite::Error::QueryReturnedNoRows => Self::NotFound("row".to_string()),
            rusqlite::Error::FromSqlConversionFailure(..)
            | rusqlite::Error::InvalidColumnType(..) => Self::Invalid(err.to_string()),
            _ => Self::Backend(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Invalid(err.to_string())
    }
}

/// Failures from the text generation and embedding backends.
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("no API key configured for the language model backend")]
    MissingCredential,
    #[error("backend rejected a request parameter: {0}")]
    UnsupportedParameter(String),
    #[error("language model request timed out")]
    Timeout,
    #[error("language model unavailable: {0}")]
    Unavailable(String),
    #[error("language model returned an unusable response: {0}")]
    Malformed(String),
}

impl GenerationError {
    /// OpenAI-compatible backends reject sampling knobs on some models with
    /// `unsupported_parameter`; the caller retries once without them.
    #[must_use]
    pub fn from_response_body(status: u16, body: &str) -> Self {
        if body.contains("Unsupported parameter") || body.contains("unsupported_parameter") {
            return Self::UnsupportedParameter(body.to_string());
        }
        Self::Unavailable(format!("HTTP {status}: {body}"))
    }
}
