use anyhow::Result;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use rand::{distributions::Alphanumeric, thread_rng, Rng};
use rusoto_core::Region;
use slog::{debug, o, Logger};
use url::Url;
use xml::reader::{EventReader, XmlEvent};

use super::{Credentials, CredentialsCache, CredentialsError, ProvideCredentials};
use crate::{http::HttpAgent, parse_url};

pub(crate) const STS_API_VERSION: &str = "2011-06-15";

/// The role session name used for every STS call made by this process.
/// Generated once; STS requires at least 2 characters.
pub(crate) fn session_name() -> &'static str {
    static SESSION_NAME: Lazy<String> = Lazy::new(|| {
        thread_rng()
            .sample_iter(&Alphanumeric)
            .take(16)
            .map(char::from)
            .collect()
    });
    &SESSION_NAME
}

/// Decorates a base provider with STS AssumeRole: the base triple signs an
/// `AssumeRole` call and the resulting role-session triple is what callers
/// see. The session is cached like any other temporary credential; rotating
/// the base credentials only takes effect at the next refresh.
#[derive(Debug)]
pub struct AssumeRoleProvider {
    base: Box<dyn ProvideCredentials>,
    role_arn: String,
    endpoint: Url,
    region: Region,
    agent: HttpAgent,
    cache: CredentialsCache,
    logger: Logger,
}

impl AssumeRoleProvider {
    pub fn new(
        base: Box<dyn ProvideCredentials>,
        role_arn: String,
        region: &Region,
        parent_logger: &Logger,
    ) -> Result<AssumeRoleProvider> {
        let endpoint = parse_url(format!("https://sts.{}.amazonaws.com/", region.name()))?;
        Ok(Self::with_endpoint(
            base,
            role_arn,
            endpoint,
            region.clone(),
            parent_logger,
        ))
    }

    pub(crate) fn with_endpoint(
        base: Box<dyn ProvideCredentials>,
        role_arn: String,
        endpoint: Url,
        region: Region,
        parent_logger: &Logger,
    ) -> AssumeRoleProvider {
        AssumeRoleProvider {
            logger: parent_logger.new(o!(
                "provider" => "sts",
                "role_arn" => role_arn.clone(),
            )),
            base,
            role_arn,
            endpoint,
            region,
            agent: HttpAgent::service(),
            cache: CredentialsCache::new(),
        }
    }

    fn acquire(&self) -> Result<(Credentials, DateTime<Utc>), CredentialsError> {
        let base_credentials = self.base.fetch()?;
        debug!(self.logger, "assuming role with STS");

        // DurationSeconds is omitted so the role's default session duration
        // applies
        let body = format!(
            "Action=AssumeRole&Version={}&RoleArn={}&RoleSessionName={}",
            STS_API_VERSION,
            urlencoding::encode(&self.role_arn),
            session_name(),
        );

        let response = self.agent.post_signed(
            &self.logger,
            &self.endpoint,
            &self.region,
            "sts",
            &[(
                "Content-Type",
                "application/x-www-form-urlencoded; charset=utf-8",
            )],
            body.into_bytes(),
            &base_credentials,
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

impl ProvideCredentials for AssumeRoleProvider {
    fn fetch(&self) -> Result<Credentials, CredentialsError> {
        self.cache.fetch_with(&self.logger, || self.acquire())
    }

    fn refresh(&self) -> Result<(), CredentialsError> {
        self.cache.refresh_with(|| self.acquire())
    }
}

/// Extracts the `Credentials` element from an STS XML response.
/// `AssumeRole` and `AssumeRoleWithWebIdentity` responses share this shape.
pub(crate) fn parse_assume_role_response(
    body: &str,
) -> Result<(Credentials, DateTime<Utc>), CredentialsError> {
    let mut access_key_id = None;
    let mut secret_access_key = None;
    let mut session_token = None;
    let mut expiration = None;
    let mut current_element: Option<String> = None;

    for event in EventReader::new(body.as_bytes()) {
        match event.map_err(|e| CredentialsError::StsParse(e.to_string()))? {
            XmlEvent::StartElement { name, .. } => current_element = Some(name.local_name),
            XmlEvent::EndElement { .. } => current_element = None,
            XmlEvent::Characters(text) => match current_element.as_deref() {
                Some("AccessKeyId") => access_key_id = Some(text),
                Some("SecretAccessKey") => secret_access_key = Some(text),
                Some("SessionToken") => session_token = Some(text),
                Some("Expiration") => expiration = Some(text),
                _ => {}
            },
            _ => {}
        }
    }

    let missing = |field: &str| CredentialsError::StsParse(format!("missing {}", field));
    let access_key_id = access_key_id.ok_or_else(|| missing("AccessKeyId"))?;
    let secret_access_key = secret_access_key.ok_or_else(|| missing("SecretAccessKey"))?;
    let session_token = session_token.ok_or_else(|| missing("SessionToken"))?;
    let expiration = expiration.ok_or_else(|| missing("Expiration"))?;

    let expiration = DateTime::parse_from_rfc3339(expiration.trim())?.with_timezone(&Utc);

    Ok((
        Credentials::new(access_key_id, secret_access_key, Some(session_token)),
        expiration,
    ))
}
