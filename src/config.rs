//! Runtime configuration, read from environment variables.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::chain::toncenter::TonCenterOptions;
use crate::reconciler::supervisor::RestartPolicy;
use crate::reconciler::{AttributionPolicy, ReconcilerSettings};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} is not set")]
    Missing(&'static str),

    #[error("{var}: invalid value '{value}': {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub deposit_address: String,
    pub data_dir: PathBuf,
    pub poll_interval: Duration,
    pub attribution: AttributionPolicy,
    pub toncenter: TonCenterOptions,
    pub restart: RestartPolicy,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| env::var(var).ok())
    }

    /// Build the configuration from an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        // Blank values count as unset
        let get = |var: &str| lookup(var).filter(|v| !v.trim().is_empty());

        let deposit_address = get("DEPOSIT_ADDRESS")
            .map(|v| v.trim().to_string())
            .ok_or(ConfigError::Missing("DEPOSIT_ADDRESS"))?;

        let poll_interval = parse_or(&get, "POLL_INTERVAL_SECS", 30)?;
        if poll_interval == 0 {
            return Err(ConfigError::Invalid {
                var: "POLL_INTERVAL_SECS",
                value: "0".to_string(),
                reason: "must be positive".to_string(),
            });
        }
        let defaults = TonCenterOptions::default();
        let toncenter = TonCenterOptions {
            base_url: get("TONCENTER_URL").unwrap_or(defaults.base_url),
            api_key: get("TONCENTER_API_KEY"),
            timeout: Duration::from_secs(parse_or(&get, "REQUEST_TIMEOUT_SECS", 10)?),
            confirmation_depth: parse_or(&get, "CONFIRMATION_DEPTH", defaults.confirmation_depth)?,
            limit: parse_or(&get, "FETCH_LIMIT", defaults.limit)?.max(1),
        };

        let restart = RestartPolicy {
            max_restarts: parse_or(&get, "MAX_FATAL_RESTARTS", RestartPolicy::default().max_restarts)?,
            ..RestartPolicy::default()
        };

        Ok(Self {
            deposit_address,
            data_dir: get("DATA_DIR").map_or_else(|| PathBuf::from("data"), PathBuf::from),
            poll_interval: Duration::from_secs(poll_interval),
            attribution: parse_or(&get, "ATTRIBUTION_POLICY", AttributionPolicy::default())?,
            toncenter,
            restart,
        })
    }

    pub fn reconciler_settings(&self) -> ReconcilerSettings {
        ReconcilerSettings {
            deposit_address: self.deposit_address.clone(),
            poll_interval: self.poll_interval,
            attribution: self.attribution,
        }
    }
}

fn parse_or<T>(
    get: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: ToString,
{
    match get(var) {
        None => Ok(default),
        Some(value) => value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            var,
            reason: e.to_string(),
            value,
        }),
    }
}
