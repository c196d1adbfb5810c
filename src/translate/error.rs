//! Translation failure taxonomy.
//! Every failure carries two flags: whether another attempt may succeed
//! (`is_retryable`) and whether a degraded message can still be shown in place
//! of the translation (`fallback_available`).

use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

/// Coarse failure class, exposed to clients next to fallback renderings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidInput,
    Network,
    RateLimit,
    QuotaExceeded,
    InvalidCredentials,
    UnsupportedLanguage,
    TextTooLong,
    Timeout,
    Server,
    Unknown,
}

impl ErrorKind {
    /// Whether the original text may be shown as a degraded rendering.
    /// Configuration faults (bad key, unknown language) are surfaced as an
    /// explicit error indicator next to the original text instead.
    pub fn fallback_available(self) -> bool {
        !matches!(
            self,
            ErrorKind::InvalidInput | ErrorKind::InvalidCredentials | ErrorKind::UnsupportedLanguage
        )
    }
}

#[derive(Debug, Clone, Error)]
pub enum TranslateError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },
    #[error("translation quota exceeded")]
    QuotaExceeded,
    #[error("translator rejected credentials")]
    InvalidCredentials,
    #[error("unsupported language: {0}")]
    UnsupportedLanguage(String),
    #[error("text too long: {0}")]
    TextTooLong(String),
    #[error("translation timeout")]
    Timeout,
    #[error("translator server error: {status}")]
    Server { status: u16 },
    #[error("unexpected translator response: {0}")]
    Unknown(String),
}

impl TranslateError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TranslateError::InvalidInput(_) => ErrorKind::InvalidInput,
            TranslateError::Network(_) => ErrorKind::Network,
            TranslateError::RateLimited { .. } => ErrorKind::RateLimit,
            TranslateError::QuotaExceeded => ErrorKind::QuotaExceeded,
            TranslateError::InvalidCredentials => ErrorKind::InvalidCredentials,
            TranslateError::UnsupportedLanguage(_) => ErrorKind::UnsupportedLanguage,
            TranslateError::TextTooLong(_) => ErrorKind::TextTooLong,
            TranslateError::Timeout => ErrorKind::Timeout,
            TranslateError::Server { .. } => ErrorKind::Server,
            TranslateError::Unknown(_) => ErrorKind::Unknown,
        }
    }

    /// Timeouts, transport failures, 5xx and 429 are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TranslateError::Network(_)
                | TranslateError::RateLimited { .. }
                | TranslateError::Timeout
                | TranslateError::Server { .. }
        )
    }

    pub fn fallback_available(&self) -> bool {
        self.kind().fallback_available()
    }

    /// Minimum wait the server asked for before the next attempt.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            TranslateError::RateLimited { retry_after_ms } if *retry_after_ms > 0 => {
                Some(Duration::from_millis(*retry_after_ms))
            }
            _ => None,
        }
    }
}

impl From<reqwest::Error> for TranslateError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            TranslateError::Timeout
        } else if e.is_decode() {
            TranslateError::Unknown(e.to_string())
        } else if let Some(status) = e.status() {
            TranslateError::Server {
                status: status.as_u16(),
            }
        } else {
            TranslateError::Network(e.to_string())
        }
    }
}
