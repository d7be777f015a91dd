use thiserror::Error;

/// Exchange call failures, split so callers can branch on retryability
///
/// Transport and transient-status failures are retried by the REST gate;
/// rejects and malformed payloads are terminal for that attempt and surface
/// to the caller's recovery logic instead.
#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("websocket error: {0}")]
    Websocket(String),

    #[error("http {status}: {body}")]
    Status { status: u16, body: String },

    #[error("malformed response: {0}")]
    Malformed(String),

    /// Explicit reject from the exchange (insufficient funds/size, post-only
    /// cross, etc.); never retried
    #[error("order rejected: {0}")]
    Rejected(String),
}

impl ExchangeError {
    /// Whether a retry with backoff is worthwhile, given the configured set
    /// of transient HTTP statuses
    pub fn is_retryable(&self, transient_statuses: &[u16]) -> bool {
        match self {
            ExchangeError::Transport(e) => {
                // Connection-level problems are worth retrying; body/decode
                // problems are not
                e.is_timeout() || e.is_connect() || e.is_request()
            }
            ExchangeError::Websocket(_) => false,
            ExchangeError::Status { status, .. } => transient_statuses.contains(status),
            ExchangeError::Malformed(_) => false,
            ExchangeError::Rejected(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TRANSIENT: &[u16] = &[408, 429, 500, 502, 503, 504];

    #[test]
    fn test_transient_status_is_retryable() {
        let err = ExchangeError::Status {
            status: 429,
            body: "rate limited".to_string(),
        };
        assert!(err.is_retryable(TRANSIENT));
    }

    #[test]
    fn test_client_error_is_terminal() {
        let err = ExchangeError::Status {
            status: 400,
            body: "bad request".to_string(),
        };
        assert!(!err.is_retryable(TRANSIENT));
    }

    #[test]
    fn test_reject_is_terminal() {
        let err = ExchangeError::Rejected("INSUFFICIENT_FUND".to_string());
        assert!(!err.is_retryable(TRANSIENT));
    }
}
