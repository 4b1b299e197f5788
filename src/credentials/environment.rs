use slog::{debug, o, Logger};
use std::env;

use super::{Credentials, CredentialsError, ProvideCredentials};

pub(crate) const ACCESS_KEY_ID_VAR: &str = "AWS_ACCESS_KEY_ID";
pub(crate) const SECRET_ACCESS_KEY_VAR: &str = "AWS_SECRET_ACCESS_KEY";
pub(crate) const SESSION_TOKEN_VAR: &str = "AWS_SESSION_TOKEN";

/// Reads the credential triple from process environment variables on every
/// fetch. Environment values do not expire, so there is nothing to cache or
/// refresh.
#[derive(Debug)]
pub struct EnvironmentProvider {
    logger: Logger,
}

impl EnvironmentProvider {
    pub fn new(parent_logger: &Logger) -> EnvironmentProvider {
        EnvironmentProvider {
            logger: parent_logger.new(o!("provider" => "environment")),
        }
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.is_empty())
}

impl ProvideCredentials for EnvironmentProvider {
    fn fetch(&self) -> Result<Credentials, CredentialsError> {
        debug!(self.logger, "requesting credentials from the environment");

        let access_key_id = non_empty_var(ACCESS_KEY_ID_VAR)
            .ok_or(CredentialsError::Unavailable("AWS_ACCESS_KEY_ID is not set"))?;
        let secret_access_key = non_empty_var(SECRET_ACCESS_KEY_VAR).ok_or(
            CredentialsError::Unavailable("AWS_SECRET_ACCESS_KEY is not set"),
        )?;

        Ok(Credentials::new(
            access_key_id,
            secret_access_key,
            non_empty_var(SESSION_TOKEN_VAR),
        ))
    }

    /// For the environment provider, refresh simply checks that the
    /// variables are still available.
    fn refresh(&self) -> Result<(), CredentialsError> {
        self.fetch().map(|_| ())
    }
}
