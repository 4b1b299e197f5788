use anyhow::Result;
use url::Url;

pub mod cloudwatch;
pub mod config;
pub mod credentials;
pub mod events;
pub mod http;
pub mod logging;
pub mod sink;

mod batch;
mod streams;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    AnyhowError(#[from] anyhow::Error),
    #[error(transparent)]
    Config(#[from] config::ConfigError),
    #[error(transparent)]
    Credentials(#[from] credentials::CredentialsError),
    #[error(transparent)]
    Api(#[from] cloudwatch::ApiError),
    #[error(transparent)]
    Url(#[from] UrlParseError),
}

/// This trait captures whether a given error is transient, in which case the
/// host should redeliver the batch, or permanent, in which case the batch is
/// reported and dropped.
pub trait ErrorClassification {
    fn is_retryable(&self) -> bool;
}

impl ErrorClassification for Error {
    fn is_retryable(&self) -> bool {
        match self {
            // Catch-all error type -- retries OK.
            Error::AnyhowError(_) => true,
            // A bad configuration cannot heal on its own.
            Error::Config(_) => false,
            // Credential sources are environmental and may recover.
            Error::Credentials(e) => e.is_retryable(),
            // Dispatch to the wrapped error type.
            Error::Api(e) => e.is_retryable(),
            Error::Url(_) => false,
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("failed to parse: {1}, {0}")]
pub struct UrlParseError(url::ParseError, String);

pub fn parse_url(input: String) -> Result<Url, UrlParseError> {
    Url::parse(&input).map_err(|e| UrlParseError(e, input))
}
