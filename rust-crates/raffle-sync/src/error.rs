use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Indexer(#[from] IndexerError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error("invalid address `{0}`")]
    InvalidAddress(String),
    #[error("operation cancelled")]
    Cancelled,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("required environment variable {var} is not set")]
    Missing { var: &'static str },
    #[error("environment variable {var} is invalid: {reason}")]
    Invalid { var: &'static str, reason: String },
}

#[derive(Debug, thiserror::Error)]
pub enum IndexerError {
    /// Non-2xx transport response. The message keeps the
    /// `SUBGRAPH_HTTP_ERROR_<code>` marker so logs stay greppable.
    #[error("SUBGRAPH_HTTP_ERROR_{status}: {body}")]
    Http { status: u16, body: String },
    /// Well-formed response carrying a top-level `errors` list.
    #[error("subgraph query failed: {}", .messages.join("; "))]
    Query { messages: Vec<String> },
    #[error("subgraph request failed: {0}")]
    Transport(#[source] reqwest::Error),
    #[error("invalid subgraph payload: {0}")]
    Decode(String),
    #[error("subgraph request timed out after {0:?}")]
    Timeout(Duration),
}

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("ledger responded with HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("ledger rpc error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("ledger request failed: {0}")]
    Transport(#[source] reqwest::Error),
    #[error("invalid ledger response: {0}")]
    Decode(String),
    #[error("`{method}` returned no data")]
    EmptyReturnData { method: String },
    #[error("primary read failed ({primary}); fallback read failed ({fallback})")]
    FallbackExhausted { primary: String, fallback: String },
}

/// How a failed fetch should influence the retry schedule.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureKind {
    /// 429 or 503 from the indexer.
    RateLimited,
    Generic,
    /// Not a failure: the operation was torn down or superseded.
    Cancelled,
}

impl Error {
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Error::Cancelled => FailureKind::Cancelled,
            Error::Indexer(IndexerError::Http {
                status: 429 | 503,
                ..
            })
            | Error::Ledger(LedgerError::Http {
                status: 429 | 503,
                ..
            }) => FailureKind::RateLimited,
            _ => FailureKind::Generic,
        }
    }

    pub fn http_status(&self) -> Option<u16> {
        match self {
            Error::Indexer(IndexerError::Http { status, .. })
            | Error::Ledger(LedgerError::Http { status, .. }) => Some(*status),
            _ => None,
        }
    }
}
