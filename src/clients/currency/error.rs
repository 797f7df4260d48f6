use thiserror::Error;

#[derive(Debug, Error)]
pub enum CurrencyError {
    #[error("currency service transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("currency service returned {status}: {body}")]
    Api { status: u16, body: String },
    #[error("malformed currency service response: {0}")]
    MalformedResponse(String),
    #[error("currency conversion failed: {0}")]
    Internal(String),
}

impl CurrencyError {
    pub fn is_transient(&self) -> bool {
        match self {
            CurrencyError::Transport(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            CurrencyError::Api { status, .. } => *status >= 500,
            CurrencyError::MalformedResponse(_) | CurrencyError::Internal(_) => false,
        }
    }
}
