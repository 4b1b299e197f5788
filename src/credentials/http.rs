use chrono::{DateTime, Utc};
use slog::{debug, o, Logger};
use std::env;
use url::Url;

use super::{
    document::parse_credentials_document, Credentials, CredentialsCache, CredentialsError,
    ProvideCredentials,
};
use crate::{http::HttpAgent, parse_url};

pub(crate) const ECS_CREDENTIALS_HOST: &str = "169.254.170.2";
pub(crate) const ECS_CREDENTIALS_PATH_VAR: &str = "AWS_CONTAINER_CREDENTIALS_RELATIVE_URI";

/// Obtains credentials from an HTTP endpoint. In ECS the agent vends task
/// role credentials over a link-local address; some deployments run local
/// services speaking the same document format.
#[derive(Debug)]
pub struct HttpCredentialsProvider {
    url: Url,
    agent: HttpAgent,
    cache: CredentialsCache,
    logger: Logger,
}

impl HttpCredentialsProvider {
    pub fn new(host: &str, path: &str, parent_logger: &Logger) -> Option<HttpCredentialsProvider> {
        let url = parse_url(format!("http://{}{}", host, path)).ok()?;
        Some(Self::with_url(url, parent_logger))
    }

    pub(crate) fn with_url(url: Url, parent_logger: &Logger) -> HttpCredentialsProvider {
        HttpCredentialsProvider {
            logger: parent_logger.new(o!(
                "provider" => "http",
                "url" => url.to_string(),
            )),
            url,
            agent: HttpAgent::metadata(),
            cache: CredentialsCache::new(),
        }
    }

    /// The ECS task-role endpoint. Returns `None` when the agent's path
    /// variable is unset, which means this process is not running under ECS
    /// and the provider is left out of the chain.
    pub fn from_ecs_environment(parent_logger: &Logger) -> Option<HttpCredentialsProvider> {
        let path = env::var(ECS_CREDENTIALS_PATH_VAR)
            .ok()
            .filter(|path| !path.is_empty())?;
        HttpCredentialsProvider::new(ECS_CREDENTIALS_HOST, &path, parent_logger)
    }

    fn acquire(&self) -> Result<(Credentials, DateTime<Utc>), CredentialsError> {
        let response = self.agent.request(&self.logger, "GET", &self.url, &[])?;
        if !response.is_success() {
            return Err(CredentialsError::Endpoint(response.status));
        }
        parse_credentials_document(&response.body)
    }
}

impl ProvideCredentials for HttpCredentialsProvider {
    fn fetch(&self) -> Result<Credentials, CredentialsError> {
        debug!(self.logger, "requesting credentials from the HTTP provider");
        self.cache.fetch_with(&self.logger, || self.acquire())
    }

    fn refresh(&self) -> Result<(), CredentialsError> {
        debug!(self.logger, "refresh called on the HTTP provider");
        self.cache.refresh_with(|| self.acquire())
    }
}
