use thiserror::Error;

#[derive(Debug, Error)]
pub enum PaymentError {
    #[error("payment gateway transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("payment gateway rejected credentials: {0}")]
    Unauthorized(String),
    /// The cached access token stopped being accepted; a fresh one is fetched on retry
    #[error("payment gateway access token rejected")]
    TokenRejected,
    #[error("payment gateway returned {status}: {body}")]
    Api { status: u16, body: String },
    #[error("malformed payment gateway response: {0}")]
    MalformedResponse(String),
    #[error("payment gateway error: {0}")]
    Internal(String),
}

impl PaymentError {
    /// Transport failures, 5xx responses and stale tokens are worth one more try
    pub fn is_transient(&self) -> bool {
        match self {
            PaymentError::Transport(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            PaymentError::Api { status, .. } => *status >= 500,
            PaymentError::TokenRejected => true,
            PaymentError::Unauthorized(_)
            | PaymentError::MalformedResponse(_)
            | PaymentError::Internal(_) => false,
        }
    }
}
