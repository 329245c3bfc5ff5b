use bon::Builder;
use std::time::Duration;

use crate::error::ConfigError;
use crate::TagFilter;

pub const ENV_VAULT_NAME: &str = "BACKUP_VAULT_NAME";
pub const ENV_RETENTION_DAYS: &str = "RETENTION_DAYS";
pub const ENV_TAG_KEY: &str = "BACKUP_TAG_KEY";
pub const ENV_TAG_VALUE: &str = "BACKUP_TAG_VALUE";
pub const ENV_ROLE_ARN: &str = "BACKUP_ROLE_ARN";
pub const ENV_API_TIMEOUT: &str = "API_TIMEOUT_SECONDS";

pub const DEFAULT_VAULT_NAME: &str = "Default";
pub const DEFAULT_RETENTION_DAYS: u32 = 5;
pub const DEFAULT_TAG_KEY: &str = "Backup";
pub const DEFAULT_TAG_VALUE: &str = "True";
pub const DEFAULT_API_TIMEOUT_SECS: u64 = 30;

/// Settings for one invocation, read once at process start.
#[derive(Builder, Debug, Clone, PartialEq)]
#[builder(on(String, into))]
pub struct BackupConfig {
    #[builder(default = String::from(DEFAULT_VAULT_NAME))]
    pub vault_name: String,

    /// Days until AWS Backup deletes the recovery point
    #[builder(default = DEFAULT_RETENTION_DAYS)]
    pub retention_days: u32,

    #[builder(default = String::from(DEFAULT_TAG_KEY))]
    pub tag_key: String,

    #[builder(default = String::from(DEFAULT_TAG_VALUE))]
    pub tag_value: String,

    /// Role AWS Backup assumes to take the snapshot
    pub iam_role_arn: String,

    /// Upper bound for every AWS API call
    #[builder(default = DEFAULT_API_TIMEOUT_SECS)]
    pub api_timeout_secs: u64,
}

impl BackupConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source. Unset variables fall back to
    /// their defaults, except the role ARN which is required.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let iam_role_arn = lookup(ENV_ROLE_ARN)
            .filter(|arn| !arn.trim().is_empty())
            .ok_or(ConfigError::Missing(ENV_ROLE_ARN))?;

        let config = Self {
            vault_name: lookup(ENV_VAULT_NAME).unwrap_or_else(|| DEFAULT_VAULT_NAME.to_string()),
            retention_days: parse_positive(ENV_RETENTION_DAYS, lookup(ENV_RETENTION_DAYS))?
                .unwrap_or(DEFAULT_RETENTION_DAYS),
            tag_key: lookup(ENV_TAG_KEY).unwrap_or_else(|| DEFAULT_TAG_KEY.to_string()),
            tag_value: lookup(ENV_TAG_VALUE).unwrap_or_else(|| DEFAULT_TAG_VALUE.to_string()),
            iam_role_arn,
            api_timeout_secs: parse_positive(ENV_API_TIMEOUT, lookup(ENV_API_TIMEOUT))?
                .unwrap_or(DEFAULT_API_TIMEOUT_SECS),
        };

        config.validate()?;
        Ok(config)
    }

    /// Check invariants that the builder cannot enforce.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.iam_role_arn.trim().is_empty() {
            return Err(ConfigError::Missing(ENV_ROLE_ARN));
        }
        if self.vault_name.is_empty() {
            return Err(ConfigError::Empty(ENV_VAULT_NAME));
        }
        if self.retention_days == 0 {
            return Err(ConfigError::NotPositiveInteger {
                name: ENV_RETENTION_DAYS,
                value: "0".to_string(),
            });
        }
        if self.tag_key.is_empty() {
            return Err(ConfigError::Empty(ENV_TAG_KEY));
        }
        if self.tag_value.is_empty() {
            return Err(ConfigError::Empty(ENV_TAG_VALUE));
        }
        if self.api_timeout_secs == 0 {
            return Err(ConfigError::NotPositiveInteger {
                name: ENV_API_TIMEOUT,
                value: "0".to_string(),
            });
        }
        Ok(())
    }

    pub fn tag_filter(&self) -> TagFilter {
        TagFilter::new(&self.tag_key, &self.tag_value)
    }

    pub fn api_timeout(&self) -> Duration {
        Duration::from_secs(self.api_timeout_secs)
    }
}

fn parse_positive<T>(name: &'static str, raw: Option<String>) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr + PartialOrd + Default,
{
    let Some(raw) = raw else {
        return Ok(None);
    };
    match raw.trim().parse::<T>() {
        Ok(value) if value > T::default() => Ok(Some(value)),
        _ => Err(ConfigError::NotPositiveInteger { name, value: raw }),
    }
}
