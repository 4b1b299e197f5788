use rusoto_core::{region::ParseRegionError, Region};
use slog::{warn, Logger};
use std::{collections::HashMap, str::FromStr};

/// Message rendering mode for decoded records. Both modes ship the record as
/// a serialized JSON object; `JsonEmf` marks the records as CloudWatch
/// Embedded Metric Format payloads, which are a JSON convention interpreted
/// on the service side.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum LogFormat {
    #[default]
    Json,
    JsonEmf,
}

impl FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<LogFormat, ConfigError> {
        match s {
            "json" => Ok(LogFormat::Json),
            "json_emf" => Ok(LogFormat::JsonEmf),
            other => Err(ConfigError::UnknownLogFormat(other.to_owned())),
        }
    }
}

/// How destination log stream names are derived.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum StreamNaming {
    /// Every batch goes to this stream, regardless of routing tag.
    Static(String),
    /// Stream name is this prefix followed by the batch's routing tag.
    Prefix(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("'{0}' is a required field")]
    MissingKey(&'static str),
    #[error("either 'log_stream_name' or 'log_stream_prefix' is required, but not both")]
    StreamNaming,
    #[error("unrecognized log_format '{0}', expected 'json' or 'json_emf'")]
    UnknownLogFormat(String),
    #[error("'{value}' is not a valid boolean for '{key}', expected On/Off or true/false")]
    InvalidBool { key: &'static str, value: String },
    #[error(transparent)]
    InvalidRegion(#[from] ParseRegionError),
}

/// Sink configuration, built from the key/value string properties the host
/// runtime hands to an output plugin.
#[derive(Clone, Debug)]
pub struct SinkConfig {
    /// Remote log group all streams belong to.
    pub log_group_name: String,
    pub stream_naming: StreamNaming,
    pub region: Region,
    pub log_format: LogFormat,
    /// When set, the value at this record key becomes the event message
    /// instead of the whole record.
    pub log_key: Option<String>,
    pub auto_create_group: bool,
    /// Overrides the default `logs.<region>.amazonaws.com` endpoint. May be a
    /// bare host or a full URL.
    pub endpoint: Option<String>,
    /// When set, credentials are obtained by assuming this role via STS.
    pub role_arn: Option<String>,
}

const KNOWN_KEYS: &[&str] = &[
    "log_group_name",
    "log_stream_name",
    "log_stream_prefix",
    "region",
    "log_format",
    "log_key",
    "auto_create_group",
    "endpoint",
    "role_arn",
];

impl SinkConfig {
    /// Builds a configuration from the host's property map. Keys the sink
    /// does not recognize are ignored with a warning, since hosts pass
    /// plugin-agnostic keys through to every output.
    pub fn from_properties(
        properties: &HashMap<String, String>,
        logger: &Logger,
    ) -> Result<SinkConfig, ConfigError> {
        for key in properties.keys() {
            if !KNOWN_KEYS.contains(&key.as_str()) {
                warn!(logger, "ignoring unrecognized configuration key"; "key" => key);
            }
        }

        let get = |key: &str| {
            properties
                .get(key)
                .map(|value| value.trim())
                .filter(|value| !value.is_empty())
        };

        let log_group_name = get("log_group_name")
            .ok_or(ConfigError::MissingKey("log_group_name"))?
            .to_owned();

        let region = Region::from_str(get("region").ok_or(ConfigError::MissingKey("region"))?)?;

        let stream_naming = match (get("log_stream_name"), get("log_stream_prefix")) {
            (Some(name), None) => StreamNaming::Static(name.to_owned()),
            (None, Some(prefix)) => StreamNaming::Prefix(prefix.to_owned()),
            _ => return Err(ConfigError::StreamNaming),
        };

        let log_format = match get("log_format") {
            Some(format) => LogFormat::from_str(format)?,
            None => LogFormat::default(),
        };

        let auto_create_group = match get("auto_create_group") {
            Some(value) => parse_bool("auto_create_group", value)?,
            None => false,
        };

        Ok(SinkConfig {
            log_group_name,
            stream_naming,
            region,
            log_format,
            log_key: get("log_key").map(str::to_owned),
            auto_create_group,
            endpoint: get("endpoint").map(str::to_owned),
            role_arn: get("role_arn").map(str::to_owned),
        })
    }
}

/// Native host configs use On/Off as booleans; the older plugin style used
/// true/false. Accept both, case-insensitively.
fn parse_bool(key: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "on" | "true" => Ok(true),
        "off" | "false" => Ok(false),
        _ => Err(ConfigError::InvalidBool {
            key,
            value: value.to_owned(),
        }),
    }
}
