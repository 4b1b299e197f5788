use chrono::{DateTime, Duration, Utc};
use slog::{debug, o, Logger};
use std::sync::RwLock;
use url::Url;

use super::{
    document::parse_credentials_document, Credentials, CredentialsCache, CredentialsError,
    ProvideCredentials, REFRESH_WINDOW_SECONDS,
};
use crate::{http::HttpAgent, parse_url};

pub(crate) const IMDS_HOST: &str = "169.254.169.254";
const TOKEN_PATH: &str = "/latest/api/token";
const ROLE_PATH: &str = "/latest/meta-data/iam/security-credentials/";
const TOKEN_TTL_HEADER: &str = "X-aws-ec2-metadata-token-ttl-seconds";
const TOKEN_HEADER: &str = "X-aws-ec2-metadata-token";
const TOKEN_TTL_SECONDS: i64 = 21600;

#[derive(Debug)]
struct ImdsToken {
    token: String,
    refresh_at: DateTime<Utc>,
}

/// Obtains role-scoped temporary credentials from the EC2 instance metadata
/// service, speaking IMDSv2: every metadata read is gated on a session token
/// which is itself acquired over plain HTTP and cached for most of its TTL.
#[derive(Debug)]
pub struct ImdsProvider {
    base_url: String,
    agent: HttpAgent,
    token: RwLock<Option<ImdsToken>>,
    cache: CredentialsCache,
    logger: Logger,
}

impl ImdsProvider {
    pub fn new(parent_logger: &Logger) -> ImdsProvider {
        Self::with_base_url(format!("http://{}", IMDS_HOST), parent_logger)
    }

    pub(crate) fn with_base_url(base_url: String, parent_logger: &Logger) -> ImdsProvider {
        ImdsProvider {
            base_url,
            agent: HttpAgent::metadata(),
            token: RwLock::new(None),
            cache: CredentialsCache::new(),
            logger: parent_logger.new(o!("provider" => "imds")),
        }
    }

    fn url(&self, path: &str) -> Result<Url, CredentialsError> {
        parse_url(format!("{}{}", self.base_url, path))
            .map_err(|_| CredentialsError::Unavailable("IMDS base URL did not parse"))
    }

    /// Returns a metadata session token, acquiring a fresh one when the
    /// cached token is inside its refresh window. The token request itself
    /// must not carry a token: it is the bootstrap step.
    fn ensure_token(&self) -> Result<String, CredentialsError> {
        if let Some(token) = &*self.token.read().unwrap() {
            if Utc::now() < token.refresh_at {
                return Ok(token.token.clone());
            }
        }

        let mut slot = self.token.write().unwrap();
        if let Some(token) = &*slot {
            if Utc::now() < token.refresh_at {
                return Ok(token.token.clone());
            }
        }

        debug!(self.logger, "requesting a new IMDSv2 token");
        let response = self.agent.request(
            &self.logger,
            "PUT",
            &self.url(TOKEN_PATH)?,
            &[(TOKEN_TTL_HEADER, "21600")],
        )?;
        if !response.is_success() || response.body.is_empty() {
            return Err(CredentialsError::Unavailable(
                "IMDSv2 token request was not answered",
            ));
        }

        let token = response.body.trim_end().to_owned();
        *slot = Some(ImdsToken {
            token: token.clone(),
            refresh_at: Utc::now()
                + Duration::seconds(TOKEN_TTL_SECONDS - REFRESH_WINDOW_SECONDS),
        });
        Ok(token)
    }

    /// Looks up the name of the IAM role attached to this instance.
    fn lookup_role(&self, token: &str) -> Result<String, CredentialsError> {
        let response = self.agent.request(
            &self.logger,
            "GET",
            &self.url(ROLE_PATH)?,
            &[(TOKEN_HEADER, token)],
        )?;
        if !response.is_success() {
            return Err(CredentialsError::Unavailable("IMDS role lookup failed"));
        }

        let role = response.body.trim_end_matches('\n').to_owned();
        if role.is_empty() {
            return Err(CredentialsError::Unavailable(
                "no IAM role is attached to this instance",
            ));
        }
        Ok(role)
    }

    fn acquire(&self) -> Result<(Credentials, DateTime<Utc>), CredentialsError> {
        let token = self.ensure_token()?;
        let role = self.lookup_role(&token)?;
        debug!(self.logger, "requesting credentials for instance role"; "role" => &role);

        let response = self.agent.request(
            &self.logger,
            "GET",
            &self.url(&format!("{}{}", ROLE_PATH, role))?,
            &[(TOKEN_HEADER, &token)],
        )?;
        if !response.is_success() {
            return Err(CredentialsError::Endpoint(response.status));
        }

        parse_credentials_document(&response.body)
    }
}

impl ProvideCredentials for ImdsProvider {
    fn fetch(&self) -> Result<Credentials, CredentialsError> {
        debug!(self.logger, "requesting credentials from the EC2 IMDS provider");
        self.cache.fetch_with(&self.logger, || self.acquire())
    }

    fn refresh(&self) -> Result<(), CredentialsError> {
        debug!(self.logger, "refresh called on the EC2 IMDS provider");
        self.cache.refresh_with(|| self.acquire())
    }
}
