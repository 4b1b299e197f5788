use chrono::{DateTime, Utc};
use slog::{debug, o, Logger};
use std::{env, fs, path::PathBuf};
use url::Url;

use super::{
    sts::{parse_assume_role_response, session_name, STS_API_VERSION},
    Credentials, CredentialsCache, CredentialsError, ProvideCredentials,
};
use crate::{http::HttpAgent, parse_url};

const WEB_IDENTITY_TOKEN_FILE_VAR: &str = "AWS_WEB_IDENTITY_TOKEN_FILE";
const ROLE_ARN_VAR: &str = "AWS_ROLE_ARN";
const ROLE_SESSION_NAME_VAR: &str = "AWS_ROLE_SESSION_NAME";

const STS_GLOBAL_ENDPOINT: &str = "https://sts.amazonaws.com/";

/// Exchanges a Kubernetes-projected OIDC token for role credentials via
/// `AssumeRoleWithWebIdentity`. This is how EKS service accounts map onto IAM
/// roles. The call is unsigned: the web identity token in the form is the
/// authentication.
#[derive(Debug)]
pub struct WebIdentityProvider {
    token_file: PathBuf,
    role_arn: String,
    session_name: String,
    endpoint: Url,
    agent: HttpAgent,
    cache: CredentialsCache,
    logger: Logger,
}

impl WebIdentityProvider {
    /// Builds the provider from the standard EKS environment. Returns `None`
    /// unless both the token file and role ARN variables are set, in which
    /// case the provider is left out of the chain.
    pub fn from_environment(parent_logger: &Logger) -> Option<WebIdentityProvider> {
        let non_empty = |name: &str| env::var(name).ok().filter(|value| !value.is_empty());
        let token_file = PathBuf::from(non_empty(WEB_IDENTITY_TOKEN_FILE_VAR)?);
        let role_arn = non_empty(ROLE_ARN_VAR)?;
        let session_name =
            non_empty(ROLE_SESSION_NAME_VAR).unwrap_or_else(|| session_name().to_owned());

        let endpoint = parse_url(STS_GLOBAL_ENDPOINT.to_owned()).ok()?;
        Some(Self::with_endpoint(
            token_file,
            role_arn,
            session_name,
            endpoint,
            parent_logger,
        ))
    }

    pub(crate) fn with_endpoint(
        token_file: PathBuf,
        role_arn: String,
        session_name: String,
        endpoint: Url,
        parent_logger: &Logger,
    ) -> WebIdentityProvider {
        WebIdentityProvider {
            logger: parent_logger.new(o!(
                "provider" => "web_identity",
                "role_arn" => role_arn.clone(),
            )),
            token_file,
            role_arn,
            session_name,
            endpoint,
            agent: HttpAgent::service(),
            cache: CredentialsCache::new(),
        }
    }

    fn acquire(&self) -> Result<(Credentials, DateTime<Utc>), CredentialsError> {
        let token = fs::read_to_string(&self.token_file)
            .map_err(|e| CredentialsError::Io(e, self.token_file.display().to_string()))?;
        let token = token.trim();
        if token.is_empty() {
            return Err(CredentialsError::Unavailable(
                "web identity token file is empty",
            ));
        }

        debug!(self.logger, "assuming role with web identity token");
        let response = self.agent.post_form(
            &self.logger,
            &self.endpoint,
            &[
                ("Action", "AssumeRoleWithWebIdentity"),
                ("Version", STS_API_VERSION),
                ("RoleArn", &self.role_arn),
                ("RoleSessionName", &self.session_name),
                ("WebIdentityToken", token),
            ],
        )?;

        if !response.is_success() {
            return Err(CredentialsError::Sts(format!(
                "HTTP {}: {}",
                response.status,
                response.body.trim()
            )));
        }

        parse_assume_role_response(&response.body)
    }
}

impl ProvideCredentials for WebIdentityProvider {
    fn fetch(&self) -> Result<Credentials, CredentialsError> {
        self.cache.fetch_with(&self.logger, || self.acquire())
    }

    fn refresh(&self) -> Result<(), CredentialsError> {
        self.cache.refresh_with(|| self.acquire())
    }
}
