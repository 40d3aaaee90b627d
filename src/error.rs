//! Error taxonomy for the memex engine.
//!
//! Every public operation returns [`Result`]. The nine [`Error`] variants map
//! one-to-one onto stable kind strings (used in the JSON error envelope) and
//! small integer codes (used by embedders that cannot carry typed errors
//! across a language boundary).

use thiserror::Error;

/// Main error type for the memex engine.
#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid input: {0}")]
    Invalid(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("user quota exceeded: {current}/{max} memories")]
    QuotaExceeded { current: u64, max: u64 },

    #[error("rate limit exceeded for user {0}")]
    RateLimited(String),

    #[error("no database connection available before the deadline")]
    Busy,

    #[error("operation deadline exceeded")]
    Timeout,

    #[error("storage corruption detected: {0}")]
    Corrupt(String),

    #[error("storage error: {0}")]
    Io(String),

    #[error("invalid configuration: {0}")]
    BadConfig(String),
}

/// Convenience type alias for Result using the memex [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Stable kind name, as it appears in the JSON error envelope.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Invalid(_) => "Invalid",
            Error::NotFound(_) => "NotFound",
            Error::QuotaExceeded { .. } => "QuotaExceeded",
            Error::RateLimited(_) => "RateLimited",
            Error::Busy => "Busy",
            Error::Timeout => "Timeout",
            Error::Corrupt(_) => "Corrupt",
            Error::Io(_) => "IO",
            Error::BadConfig(_) => "BadConfig",
        }
    }

    /// Stable integer code for callers that cannot carry typed errors.
    pub fn code(&self) -> i32 {
        match self {
            Error::Invalid(_) => 1,
            Error::NotFound(_) => 2,
            Error::QuotaExceeded { .. } => 3,
            Error::RateLimited(_) => 4,
            Error::Busy => 5,
            Error::Timeout => 6,
            Error::Corrupt(_) => 7,
            Error::Io(_) => 8,
            Error::BadConfig(_) => 9,
        }
    }

    /// Render the error as the wire envelope `{"error":{"kind":..,"message":..}}`.
    pub fn to_envelope(&self) -> serde_json::Value {
        serde_json::json!({
            "error": {
                "kind": self.kind(),
                "message": self.to_string(),
            }
        })
    }
}

/// Static description of an error code, for `error_message(code)` callers.
pub fn error_message(code: i32) -> &'static str {
    match code {
        0 => "success",
        1 => "invalid input",
        2 => "not found",
        3 => "user quota exceeded",
        4 => "rate limit exceeded",
        5 => "no database connection available",
        6 => "operation deadline exceeded",
        7 => "storage corruption detected",
        8 => "storage error",
        9 => "invalid configuration",
        _ => "unknown error",
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        if let rusqlite::Error::SqliteFailure(code, ref message) = err {
            match code.code {
                rusqlite::ErrorCode::DatabaseCorrupt | rusqlite::ErrorCode::NotADatabase => {
                    return Error::Corrupt(
                        message.clone().unwrap_or_else(|| code.to_string()),
                    );
                }
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked => {
                    return Error::Busy;
                }
                _ => {}
            }
        }
        Error::Io(err.to_string())
    }
}

impl From<r2d2::Error> for Error {
    fn from(_: r2d2::Error) -> Self {
        // r2d2 only fails a checkout when the pool timeout elapses
        Error::Busy
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Invalid(format!("malformed JSON: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_and_codes_are_stable() {
        let err = Error::QuotaExceeded { current: 11, max: 10 };
        assert_eq!(err.kind(), "QuotaExceeded");
        assert_eq!(err.code(), 3);
        assert_eq!(Error::Busy.code(), 5);
        assert_eq!(Error::BadConfig("x".into()).code(), 9);
    }

    #[test]
    fn envelope_shape() {
        let err = Error::Invalid("importance out of range".into());
        let envelope = err.to_envelope();
        assert_eq!(envelope["error"]["kind"], "Invalid");
        assert!(envelope["error"]["message"]
            .as_str()
            .unwrap()
            .contains("importance"));
    }

    #[test]
    fn error_message_covers_all_codes() {
        for code in 0..=9 {
            assert_ne!(error_message(code), "unknown error");
        }
        assert_eq!(error_message(42), "unknown error");
    }

    #[test]
    fn busy_sqlite_code_maps_to_busy() {
        let err = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        );
        assert!(matches!(Error::from(err), Error::Busy));
    }

    #[test]
    fn corrupt_sqlite_code_poisons() {
        let err = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CORRUPT),
            Some("malformed database".into()),
        );
        assert!(matches!(Error::from(err), Error::Corrupt(_)));
    }
}
