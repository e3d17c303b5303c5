use std::time::Duration;

use thiserror::Error;

/// Top-level error returned by the supervisor and the binary.
#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Status API error: {0}")]
    Api(#[from] ApiError),
    #[error("Message ID store error: {0}")]
    Store(#[from] StoreError),
    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),
    #[error("No content builder registered for section {0}")]
    MissingBuilder(&'static str),
}

/// Errors raised while reading or validating a server config file.
///
/// Any of these during a reload is fatal for the job that triggered it.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("URL parsing error: {0}")]
    UrlParse(#[from] url::ParseError),
    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: String, reason: String },
}

impl ConfigError {
    pub(crate) fn invalid(field: &str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}

/// Errors from a single status API attempt or from an exhausted call.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("HTTP 401 (Unauthorized)")]
    Unauthorized,
    #[error("HTTP {0} from status API")]
    Status(u16),
    #[error("Request failed: {0}")]
    Transport(String),
    #[error("Received an invalid response: {0}")]
    Malformed(String),
    #[error("No API key or username/password configured")]
    MissingCredentials,
    #[error("{endpoint} failed after {attempts} attempts")]
    Exhausted { endpoint: String, attempts: u32 },
}

impl ApiError {
    /// Whether a later attempt of the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ApiError::Status(_) | ApiError::Transport(_) | ApiError::Malformed(_)
        )
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ApiError::Malformed(err.to_string())
        } else if let Some(status) = err.status() {
            ApiError::Status(status.as_u16())
        } else {
            ApiError::Transport(err.to_string())
        }
    }
}

/// Outcomes of a webhook call that are not a message id.
#[derive(Error, Debug)]
pub enum WebhookError {
    #[error("Message not found")]
    NotFound,
    #[error("Rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },
    #[error("Webhook endpoint unreachable: {0}")]
    Unreachable(String),
    #[error("Webhook rejected the request with HTTP {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("Invalid webhook response: {0}")]
    Malformed(String),
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
    #[error("Message ID {0} does not fit in a TOML integer")]
    IdOutOfRange(u64),
}

/// Errors raised by content builders. All of them are transient for the job.
#[derive(Error, Debug)]
pub enum BuildError {
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error("Unexpected result from {endpoint}: {reason}")]
    Parse { endpoint: String, reason: String },
}

impl BuildError {
    pub(crate) fn parse(endpoint: &str, reason: impl Into<String>) -> Self {
        BuildError::Parse {
            endpoint: endpoint.to_string(),
            reason: reason.into(),
        }
    }
}
