//! Parsing of the shared JSON credential document.
//!
//! IMDS, the ECS agent and custom HTTP credential endpoints all vend the
//! same flat document:
//!
//! ```text
//! {
//!   "AccessKeyId": "ACCESS_KEY_ID",
//!   "Expiration": "2019-12-18T21:27:58Z",
//!   "SecretAccessKey": "SECRET_ACCESS_KEY",
//!   "Token": "SECURITY_TOKEN_STRING"
//! }
//! ```
//!
//! Some sources spell the token key `SessionToken`, and some omit it
//! entirely for long-lived keys; both are accepted. IMDS adds extra fields
//! (`Code`, `LastUpdated`, `Type`), which are ignored.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use super::{Credentials, CredentialsError};

#[derive(Debug, Deserialize, Serialize)]
struct CredentialsDocument {
    #[serde(rename = "AccessKeyId")]
    access_key_id: String,
    #[serde(rename = "SecretAccessKey")]
    secret_access_key: String,
    #[serde(rename = "Token", alias = "SessionToken", default)]
    token: Option<String>,
    #[serde(rename = "Expiration")]
    expiration: String,
}

/// Parses a credential document into a triple and its expiration instant.
/// Fails on malformed JSON, a missing or empty access key or secret, or an
/// expiration that does not parse.
pub(crate) fn parse_credentials_document(
    body: &str,
) -> Result<(Credentials, DateTime<Utc>), CredentialsError> {
    let document: CredentialsDocument = serde_json::from_str(body)?;

    if document.access_key_id.is_empty() {
        return Err(CredentialsError::MissingField("AccessKeyId"));
    }
    if document.secret_access_key.is_empty() {
        return Err(CredentialsError::MissingField("SecretAccessKey"));
    }

    let expiration = parse_expiration(&document.expiration)?;
    let token = document.token.filter(|token| !token.is_empty());

    Ok((
        Credentials::new(document.access_key_id, document.secret_access_key, token),
        expiration,
    ))
}

/// Parses an expiration timestamp, strictly `YYYY-MM-DDTHH:MM:SSZ` in UTC.
pub(crate) fn parse_expiration(timestamp: &str) -> Result<DateTime<Utc>, CredentialsError> {
    let naive = NaiveDateTime::parse_from_str(timestamp, "%Y-%m-%dT%H:%M:%SZ")?;
    Ok(Utc.from_utc_datetime(&naive))
}
