use thiserror::Error;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("api error ({status}): {body}")]
    Api {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("invalid config: {0}")]
    Config(String),
    #[error("failed to parse json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("no api keys available in the pool")]
    EmptyPool,
    #[error("upstream call failed after {attempts} attempts (last key {last_key}): {source}")]
    RetriesExhausted {
        attempts: u32,
        last_key: String,
        #[source]
        source: Box<RelayError>,
    },
}

impl RelayError {
    /// Upstream HTTP status carried by this error, if one is derivable.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            RelayError::Api { status, .. } => Some(status.as_u16()),
            RelayError::Http(err) => err.status().map(|status| status.as_u16()),
            RelayError::RetriesExhausted { source, .. } => source.status_code(),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;
