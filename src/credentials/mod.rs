//! AWS credential acquisition.
//!
//! Every credential source implements [`ProvideCredentials`]; the
//! [`ChainProvider`] composes them in the standard resolution order and the
//! CloudWatch client consumes whichever provider the sink was built with.
//! Network-backed sources cache their triple and refetch it shortly before
//! expiry, so callers can `fetch` on every request without paying for a
//! round trip each time.

use chrono::{DateTime, Duration, Utc};
use rusoto_core::credential::AwsCredentials;
use slog::{debug, o, warn, Logger};
use std::{
    fmt::{self, Debug, Formatter},
    sync::RwLock,
};

use crate::http::HttpError;

pub mod document;
pub mod environment;
pub mod http;
pub mod imds;
pub mod profile;
pub mod sts;
pub mod web_identity;

pub use environment::EnvironmentProvider;
pub use http::HttpCredentialsProvider;
pub use imds::ImdsProvider;
pub use profile::ProfileProvider;
pub use sts::AssumeRoleProvider;
pub use web_identity::WebIdentityProvider;

/// Safety margin subtracted from any credential or session-token expiry
/// before re-acquisition, so a triple is never used right up to the moment
/// the remote stops honoring it.
pub(crate) const REFRESH_WINDOW_SECONDS: i64 = 300;

pub(crate) fn refresh_window() -> Duration {
    Duration::seconds(REFRESH_WINDOW_SECONDS)
}

/// An immutable AWS credential triple. The session token is present for
/// temporary credentials (STS, IMDS, ECS) and absent for long-lived keys.
#[derive(Clone, Eq, PartialEq)]
pub struct Credentials {
    access_key_id: String,
    secret_access_key: String,
    session_token: Option<String>,
}

impl Credentials {
    pub fn new(
        access_key_id: String,
        secret_access_key: String,
        session_token: Option<String>,
    ) -> Credentials {
        Credentials {
            access_key_id,
            secret_access_key,
            session_token,
        }
    }

    pub fn access_key_id(&self) -> &str {
        &self.access_key_id
    }

    pub fn secret_access_key(&self) -> &str {
        &self.secret_access_key
    }

    pub fn session_token(&self) -> Option<&str> {
        self.session_token.as_deref()
    }

    /// Converts to the form the SigV4 signer consumes. Only the signing
    /// boundary sees this representation.
    pub(crate) fn as_signing_credentials(&self) -> AwsCredentials {
        AwsCredentials::new(
            self.access_key_id.clone(),
            self.secret_access_key.clone(),
            self.session_token.clone(),
            None,
        )
    }
}

impl Debug for Credentials {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"redacted")
            .field(
                "session_token",
                &self.session_token.as_ref().map(|_| "redacted"),
            )
            .finish()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CredentialsError {
    #[error("no credentials available from this provider: {0}")]
    Unavailable(&'static str),
    #[error("no provider in the chain could supply credentials")]
    NoProvider,
    #[error(transparent)]
    Http(#[from] HttpError),
    #[error("credential endpoint returned HTTP {0}")]
    Endpoint(u16),
    #[error("malformed credentials document: {0}")]
    Document(#[from] serde_json::Error),
    #[error("credentials document field {0} is missing or empty")]
    MissingField(&'static str),
    #[error("failed to parse credential expiration: {0}")]
    ExpirationParse(#[from] chrono::ParseError),
    #[error("failed to read {1}: {0}")]
    Io(std::io::Error, String),
    #[error("STS returned an error response: {0}")]
    Sts(String),
    #[error("malformed STS response: {0}")]
    StsParse(String),
}

impl crate::ErrorClassification for CredentialsError {
    fn is_retryable(&self) -> bool {
        // Credential sources are all environmental -- a missing variable can
        // be set, a metadata service can come back -- so a redelivered batch
        // always has a chance.
        true
    }
}

/// The uniform contract every credential source satisfies.
///
/// `fetch` never returns a triple past its refresh deadline when a refetch is
/// possible; disposal of a provider's resources is its `Drop`.
pub trait ProvideCredentials: Debug + Send + Sync {
    /// Returns a credential triple, refreshing any internal cache whose
    /// refresh deadline has passed.
    fn fetch(&self) -> Result<Credentials, CredentialsError>;

    /// Forces the internal cache to be repopulated.
    fn refresh(&self) -> Result<(), CredentialsError>;
}

#[derive(Clone, Debug)]
struct CachedCredentials {
    credentials: Credentials,
    refresh_at: DateTime<Utc>,
}

/// Refresh-window cache shared by the network-backed providers.
///
/// `fetch_with` takes the write lock for the duration of a refetch, so
/// concurrent callers during a refresh produce exactly one outbound request
/// and all of them observe the refreshed triple.
#[derive(Debug, Default)]
pub(crate) struct CredentialsCache {
    slot: RwLock<Option<CachedCredentials>>,
}

impl CredentialsCache {
    pub fn new() -> CredentialsCache {
        CredentialsCache::default()
    }

    /// Returns the cached triple if its refresh deadline has not passed,
    /// otherwise refetches through `acquire` (which returns the new triple
    /// and its expiration). If the refetch fails but a previously cached
    /// triple exists, that triple is returned instead: the remote will
    /// answer it with 401/403 and the flush will be retried, which beats
    /// failing outright here.
    pub fn fetch_with<F>(&self, logger: &Logger, acquire: F) -> Result<Credentials, CredentialsError>
    where
        F: FnOnce() -> Result<(Credentials, DateTime<Utc>), CredentialsError>,
    {
        if let Some(cached) = &*self.slot.read().unwrap() {
            if Utc::now() < cached.refresh_at {
                return Ok(cached.credentials.clone());
            }
        }

        let mut slot = self.slot.write().unwrap();
        // The cache may have been repopulated between dropping the read lock
        // and acquiring the write lock
        if let Some(cached) = &*slot {
            if Utc::now() < cached.refresh_at {
                return Ok(cached.credentials.clone());
            }
        }

        match acquire() {
            Ok((credentials, expiration)) => {
                *slot = Some(CachedCredentials {
                    credentials: credentials.clone(),
                    refresh_at: expiration - refresh_window(),
                });
                Ok(credentials)
            }
            Err(error) => match &*slot {
                Some(cached) => {
                    warn!(
                        logger, "credential refresh failed, using previous credentials";
                        "error" => %error,
                    );
                    Ok(cached.credentials.clone())
                }
                None => Err(error),
            },
        }
    }

    /// Unconditionally repopulates the cache through `acquire`.
    pub fn refresh_with<F>(&self, acquire: F) -> Result<(), CredentialsError>
    where
        F: FnOnce() -> Result<(Credentials, DateTime<Utc>), CredentialsError>,
    {
        let mut slot = self.slot.write().unwrap();
        let (credentials, expiration) = acquire()?;
        *slot = Some(CachedCredentials {
            credentials,
            refresh_at: expiration - refresh_window(),
        });
        Ok(())
    }
}

/// Provides AWS credentials from multiple possible sources using a priority
/// order.
///
/// The following sources are checked in order for credentials:
///
/// 1. Environment variables: `AWS_ACCESS_KEY_ID` and `AWS_SECRET_ACCESS_KEY`
/// 2. AWS credentials file, usually located at `~/.aws/credentials`
/// 3. Web identity token federation (EKS service accounts)
/// 4. EC2 IMDSv2
/// 5. The ECS agent's task-role credentials endpoint
///
/// Sources that cannot exist in the current environment (no `HOME`, no ECS
/// agent variables) are omitted at construction time rather than tried and
/// failed on every fetch.
#[derive(Debug)]
pub struct ChainProvider {
    providers: Vec<Box<dyn ProvideCredentials>>,
    logger: Logger,
}

impl ChainProvider {
    /// Creates the standard chain for the current process environment.
    pub fn standard(parent_logger: &Logger) -> ChainProvider {
        let logger = parent_logger.new(o!("provider" => "chain"));

        let mut providers: Vec<Box<dyn ProvideCredentials>> =
            vec![Box::new(EnvironmentProvider::new(&logger))];
        if let Some(provider) = ProfileProvider::from_environment(&logger) {
            providers.push(Box::new(provider));
        }
        if let Some(provider) = WebIdentityProvider::from_environment(&logger) {
            providers.push(Box::new(provider));
        }
        providers.push(Box::new(ImdsProvider::new(&logger)));
        if let Some(provider) = HttpCredentialsProvider::from_ecs_environment(&logger) {
            providers.push(Box::new(provider));
        }

        ChainProvider { providers, logger }
    }

    /// Creates a chain over an explicit provider list.
    pub fn with_providers(
        providers: Vec<Box<dyn ProvideCredentials>>,
        parent_logger: &Logger,
    ) -> ChainProvider {
        ChainProvider {
            providers,
            logger: parent_logger.new(o!("provider" => "chain")),
        }
    }
}

impl ProvideCredentials for ChainProvider {
    fn fetch(&self) -> Result<Credentials, CredentialsError> {
        for provider in &self.providers {
            match provider.fetch() {
                Ok(credentials) => return Ok(credentials),
                Err(error) => {
                    debug!(
                        self.logger, "provider did not yield credentials, trying next";
                        "error" => %error,
                    );
                }
            }
        }
        Err(CredentialsError::NoProvider)
    }

    fn refresh(&self) -> Result<(), CredentialsError> {
        for provider in &self.providers {
            if provider.refresh().is_ok() {
                return Ok(());
            }
        }
        Err(CredentialsError::NoProvider)
    }
}


#[cfg(test)]
mod tests {
    use super::{test_support::FakeProvider, *};
    use crate::logging::setup_test_logging;
    use assert_matches::assert_matches;

    #[test]
    fn chain_returns_first_success() {
        let logger = setup_test_logging();
        let chain = ChainProvider::with_providers(
            vec![
                Box::new(FakeProvider::unavailable()),
                Box::new(FakeProvider::succeeding("AKIDSECOND")),
                Box::new(FakeProvider::succeeding("AKIDTHIRD")),
            ],
            &logger,
        );

        let credentials = chain.fetch().unwrap();
        assert_eq!(credentials.access_key_id(), "AKIDSECOND");
    }

    #[test]
    fn chain_exhausted() {
        let logger = setup_test_logging();
        let chain = ChainProvider::with_providers(
            vec![
                Box::new(FakeProvider::unavailable()),
                Box::new(FakeProvider::unavailable()),
            ],
            &logger,
        );

        assert_matches!(chain.fetch(), Err(CredentialsError::NoProvider));
        assert_matches!(chain.refresh(), Err(CredentialsError::NoProvider));
    }

    #[test]
    fn cache_avoids_refetch_within_window() {
        let logger = setup_test_logging();
        let cache = CredentialsCache::new();
        let mut calls = 0;

        for _ in 0..3 {
            let credentials = cache
                .fetch_with(&logger, || {
                    calls += 1;
                    Ok((
                        Credentials::new("AKID".to_owned(), "secret".to_owned(), None),
                        Utc::now() + Duration::hours(6),
                    ))
                })
                .unwrap();
            assert_eq!(credentials.access_key_id(), "AKID");
        }

        assert_eq!(calls, 1);
    }

    #[test]
    fn cache_refetches_past_window() {
        let logger = setup_test_logging();
        let cache = CredentialsCache::new();

        // An expiration inside the refresh window is already due
        cache
            .refresh_with(|| {
                Ok((
                    Credentials::new("AKIDOLD".to_owned(), "secret".to_owned(), None),
                    Utc::now() + Duration::seconds(REFRESH_WINDOW_SECONDS - 10),
                ))
            })
            .unwrap();

        let credentials = cache
            .fetch_with(&logger, || {
                Ok((
                    Credentials::new("AKIDNEW".to_owned(), "secret".to_owned(), None),
                    Utc::now() + Duration::hours(6),
                ))
            })
            .unwrap();
        assert_eq!(credentials.access_key_id(), "AKIDNEW");
    }

    #[test]
    fn cache_keeps_stale_credentials_on_failed_refresh() {
        let logger = setup_test_logging();
        let cache = CredentialsCache::new();

        cache
            .refresh_with(|| {
                Ok((
                    Credentials::new("AKIDSTALE".to_owned(), "secret".to_owned(), None),
                    Utc::now() - Duration::hours(1),
                ))
            })
            .unwrap();

        // The refetch fails; the stale triple is better than nothing
        let credentials = cache
            .fetch_with(&logger, || {
                Err(CredentialsError::Unavailable("endpoint went away"))
            })
            .unwrap();
        assert_eq!(credentials.access_key_id(), "AKIDSTALE");

        // With nothing cached, the failure propagates
        let empty = CredentialsCache::new();
        assert_matches!(
            empty.fetch_with(&logger, || Err(CredentialsError::Unavailable("nope"))),
            Err(CredentialsError::Unavailable(_))
        );
    }

    #[test]
    fn debug_redacts_secrets() {
        let credentials = Credentials::new(
            "AKID".to_owned(),
            "very-secret".to_owned(),
            Some("session".to_owned()),
        );
        let debugged = format!("{:?}", credentials);
        assert!(debugged.contains("AKID"));
        assert!(!debugged.contains("very-secret"));
        assert!(!debugged.contains("session"));
    }
}
