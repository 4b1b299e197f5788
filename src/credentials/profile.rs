use slog::{debug, o, Logger};
use std::{env, fs, path::PathBuf};

use super::{Credentials, CredentialsError, ProvideCredentials};

const SHARED_CREDENTIALS_FILE_VAR: &str = "AWS_SHARED_CREDENTIALS_FILE";
const PROFILE_VAR: &str = "AWS_PROFILE";
const DEFAULT_PROFILE: &str = "default";

/// Reads long-lived keys from the shared AWS credentials file, by default
/// `$HOME/.aws/credentials`. The file is re-read on every fetch so edits are
/// picked up without a restart; the keys it holds do not expire.
#[derive(Debug)]
pub struct ProfileProvider {
    path: PathBuf,
    profile: String,
    logger: Logger,
}

impl ProfileProvider {
    /// Resolves the credentials file location from the environment. Returns
    /// `None` when no location can be determined (no `HOME` and no explicit
    /// override), in which case the provider is left out of the chain.
    pub fn from_environment(parent_logger: &Logger) -> Option<ProfileProvider> {
        let path = match env::var(SHARED_CREDENTIALS_FILE_VAR) {
            Ok(path) if !path.is_empty() => PathBuf::from(path),
            _ => {
                let home = env::var("HOME").ok().filter(|home| !home.is_empty())?;
                [&home, ".aws", "credentials"].iter().collect()
            }
        };

        let profile = match env::var(PROFILE_VAR) {
            Ok(profile) if !profile.is_empty() => profile,
            _ => DEFAULT_PROFILE.to_owned(),
        };

        Some(ProfileProvider::new(path, profile, parent_logger))
    }

    pub fn new(path: PathBuf, profile: String, parent_logger: &Logger) -> ProfileProvider {
        ProfileProvider {
            logger: parent_logger.new(o!(
                "provider" => "profile",
                "path" => path.display().to_string(),
            )),
            path,
            profile,
        }
    }

    fn load(&self) -> Result<Credentials, CredentialsError> {
        debug!(self.logger, "reading shared credentials file"; "profile" => &self.profile);
        let contents = fs::read_to_string(&self.path)
            .map_err(|e| CredentialsError::Io(e, self.path.display().to_string()))?;
        parse_profile(&contents, &self.profile).ok_or(CredentialsError::Unavailable(
            "profile not present or incomplete in credentials file",
        ))
    }
}

/// Minimal scan of the INI-style credentials file: `[section]` headers and
/// `key = value` pairs, with `#` and `;` comments.
fn parse_profile(contents: &str, profile: &str) -> Option<Credentials> {
    let mut in_profile = false;
    let mut access_key_id = None;
    let mut secret_access_key = None;
    let mut session_token = None;

    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if line.starts_with('[') {
            in_profile = line == format!("[{}]", profile);
            continue;
        }
        if !in_profile {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            let value = value.trim();
            if value.is_empty() {
                continue;
            }
            match key.trim() {
                "aws_access_key_id" => access_key_id = Some(value.to_owned()),
                "aws_secret_access_key" => secret_access_key = Some(value.to_owned()),
                "aws_session_token" => session_token = Some(value.to_owned()),
                _ => {}
            }
        }
    }

    Some(Credentials::new(
        access_key_id?,
        secret_access_key?,
        session_token,
    ))
}

impl ProvideCredentials for ProfileProvider {
    fn fetch(&self) -> Result<Credentials, CredentialsError> {
        self.load()
    }

    fn refresh(&self) -> Result<(), CredentialsError> {
        self.load().map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::setup_test_logging;
    use assert_matches::assert_matches;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn credentials_file(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn default_profile() {
        let file = credentials_file(
            r#"
# shared credentials
[default]
aws_access_key_id = AKIDPROFILE
aws_secret_access_key = profile-secret

[other]
aws_access_key_id = AKIDOTHER
aws_secret_access_key = other-secret
aws_session_token = other-token
"#,
        );

        let provider = ProfileProvider::new(
            file.path().to_owned(),
            DEFAULT_PROFILE.to_owned(),
            &setup_test_logging(),
        );
        let credentials = provider.fetch().unwrap();
        assert_eq!(credentials.access_key_id(), "AKIDPROFILE");
        assert_eq!(credentials.secret_access_key(), "profile-secret");
        assert_eq!(credentials.session_token(), None);
    }

    #[test]
    fn named_profile_with_token() {
        let file = credentials_file(
            r#"
[default]
aws_access_key_id = AKIDPROFILE
aws_secret_access_key = profile-secret

[staging]
aws_access_key_id = AKIDSTAGING
aws_secret_access_key = staging-secret
aws_session_token = staging-token
"#,
        );

        let provider = ProfileProvider::new(
            file.path().to_owned(),
            "staging".to_owned(),
            &setup_test_logging(),
        );
        let credentials = provider.fetch().unwrap();
        assert_eq!(credentials.access_key_id(), "AKIDSTAGING");
        assert_eq!(credentials.session_token(), Some("staging-token"));
    }

    #[test]
    fn incomplete_profile() {
        let file = credentials_file(
            r#"
[default]
aws_access_key_id = AKIDPROFILE
"#,
        );

        let provider = ProfileProvider::new(
            file.path().to_owned(),
            DEFAULT_PROFILE.to_owned(),
            &setup_test_logging(),
        );
        assert_matches!(provider.fetch(), Err(CredentialsError::Unavailable(_)));
    }

    #[test]
    fn missing_file() {
        let provider = ProfileProvider::new(
            PathBuf::from("/nonexistent/.aws/credentials"),
            DEFAULT_PROFILE.to_owned(),
            &setup_test_logging(),
        );
        assert_matches!(provider.fetch(), Err(CredentialsError::Io(_, _)));
    }
}
