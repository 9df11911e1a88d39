use thiserror::Error;

/// Errors raised by the divination pipeline itself.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DivinationError {
    /// The caller asked for a method outside the catalog. No network call is made.
    #[error("暂不支持 {0} 占卜方法")]
    UnsupportedMethod(String),
}

/// Errors crossing the interpretation-provider boundary.
///
/// `Clone` so the same value can be carried inside a fragment item and later
/// rendered into a transcript entry.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InterpretError {
    #[error("API key is not configured")]
    CredentialMissing,
    #[error("request to interpretation provider failed: {0}")]
    Connect(String),
    #[error("interpretation provider returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("malformed provider response: {0}")]
    Malformed(String),
    #[error("stream interrupted: {0}")]
    Stream(String),
}

impl InterpretError {
    pub fn from_reqwest(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            InterpretError::Connect(format!("request timed out: {}", e))
        } else if e.is_connect() {
            InterpretError::Connect(format!("connection failed: {}", e))
        } else if e.is_decode() {
            InterpretError::Malformed(e.to_string())
        } else {
            InterpretError::Connect(e.to_string())
        }
    }
}
