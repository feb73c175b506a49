//! Harvest configuration.
//!
//! Values come from an optional TOML file and are then overridden by
//! environment variables. Credentials are normally supplied only through the
//! environment (or a `.env` file loaded by the binary).

use crate::error::{ConfigError, CoreError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_COURSE_ID: &str = "meu2e1usaod412";
pub const DEFAULT_FEED_LIMIT: usize = 5000;
pub const DEFAULT_PARTIAL_PATH: &str = "piazza_data_partial.json";
pub const DEFAULT_OUTPUT_PATH: &str = "piazza_data.json";
pub const DEFAULT_API_BASE_URL: &str = "https://piazza.com";

pub const ENV_COURSE_ID: &str = "PIAZZA_COURSE_ID";
pub const ENV_EMAIL: &str = "PIAZZA_EMAIL";
pub const ENV_PASSWORD: &str = "PIAZZA_PASSWORD";
pub const ENV_FEED_LIMIT: &str = "PIAZZA_FEED_LIMIT";

/// Upper bound on any configured wait, in seconds.
pub const MAX_WAIT_SECS: f64 = u32::MAX as f64;

/// Backoff schedule for throttled requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Total attempts per post, the first one included
    pub max_attempts: u32,
    /// Wait after the first throttled attempt
    pub initial_backoff_secs: f64,
    pub backoff_multiplier: f64,
    /// Upper bound (exclusive) of the uniform jitter added to each wait
    pub max_jitter_secs: f64,
    /// Cap on the base wait before jitter
    pub max_backoff_secs: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 6,
            initial_backoff_secs: 3.0,
            backoff_multiplier: 2.0,
            max_jitter_secs: 1.5,
            max_backoff_secs: 300.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarvestConfig {
    pub course_id: String,
    pub email: Option<String>,
    #[serde(skip_serializing)]
    pub password: Option<String>,
    pub feed_limit: usize,
    pub partial_path: PathBuf,
    pub output_path: PathBuf,
    /// Rewrite the checkpoint after this many successful fetches; 0 writes
    /// only the final output.
    pub checkpoint_every: usize,
    pub api_base_url: String,
    pub request_timeout_secs: u64,
    pub user_agent: String,
    pub retry: RetrySettings,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            course_id: DEFAULT_COURSE_ID.to_string(),
            email: None,
            password: None,
            feed_limit: DEFAULT_FEED_LIMIT,
            partial_path: PathBuf::from(DEFAULT_PARTIAL_PATH),
            output_path: PathBuf::from(DEFAULT_OUTPUT_PATH),
            checkpoint_every: 1,
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            request_timeout_secs: 30,
            user_agent: format!("piazza-harvest/{}", env!("CARGO_PKG_VERSION")),
            retry: RetrySettings::default(),
        }
    }
}

impl HarvestConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Loads the file at `path`. A missing file is only an error when
    /// `required` is set; otherwise defaults are used.
    pub fn from_file(path: &Path, required: bool) -> Result<Self, CoreError> {
        match std::fs::read_to_string(path) {
            Ok(text) => {
                debug!("Loaded configuration from {}", path.display());
                Ok(Self::from_toml_str(&text)?)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && !required => {
                debug!("No configuration file at {}, using defaults", path.display());
                Ok(Self::default())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ConfigError::FileNotFound {
                    path: path.display().to_string(),
                }
                .into())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// File, then process environment, then validation.
    pub fn load(path: &Path, required: bool) -> Result<Self, CoreError> {
        let mut config = Self::from_file(path, required)?;
        config.apply_env(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Overrides fields from environment-style lookups. Empty values are ignored.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());

        if let Some(course_id) = get(ENV_COURSE_ID) {
            self.course_id = course_id;
        }
        if let Some(email) = get(ENV_EMAIL) {
            self.email = Some(email);
        }
        if let Some(password) = get(ENV_PASSWORD) {
            self.password = Some(password);
        }
        if let Some(limit) = get(ENV_FEED_LIMIT) {
            self.feed_limit = limit
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidValue {
                    field: ENV_FEED_LIMIT.to_string(),
                    value: limit.clone(),
                })?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.course_id.trim().is_empty() {
            return Err(ConfigError::MissingField {
                field: "course_id".to_string(),
            });
        }
        if self.feed_limit == 0 {
            return Err(invalid("feed_limit", self.feed_limit));
        }
        if self.api_base_url.trim().is_empty() {
            return Err(ConfigError::MissingField {
                field: "api_base_url".to_string(),
            });
        }

        let retry = &self.retry;
        if retry.max_attempts == 0 {
            return Err(invalid("retry.max_attempts", retry.max_attempts));
        }
        for (field, value) in [
            ("retry.initial_backoff_secs", retry.initial_backoff_secs),
            ("retry.max_jitter_secs", retry.max_jitter_secs),
            ("retry.max_backoff_secs", retry.max_backoff_secs),
        ] {
            if !(0.0..=MAX_WAIT_SECS).contains(&value) {
                return Err(invalid(field, value));
            }
        }
        if !retry.backoff_multiplier.is_finite() || retry.backoff_multiplier < 1.0 {
            return Err(invalid(
                "retry.backoff_multiplier",
                retry.backoff_multiplier,
            ));
        }
        Ok(())
    }

    /// Credentials for login, required only when harvesting.
    pub fn credentials(&self) -> Result<(&str, &str), ConfigError> {
        let email = self
            .email
            .as_deref()
            .ok_or_else(|| ConfigError::MissingEnvironmentVariable {
                var_name: ENV_EMAIL.to_string(),
            })?;
        let password =
            self.password
                .as_deref()
                .ok_or_else(|| ConfigError::MissingEnvironmentVariable {
                    var_name: ENV_PASSWORD.to_string(),
                })?;
        Ok((email, password))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

fn invalid(field: &str, value: impl ToString) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = HarvestConfig::default();
        assert_eq!(config.course_id, DEFAULT_COURSE_ID);
        assert_eq!(config.feed_limit, 5000);
        assert_eq!(config.partial_path, PathBuf::from("piazza_data_partial.json"));
        assert_eq!(config.output_path, PathBuf::from("piazza_data.json"));
        assert_eq!(config.checkpoint_every, 1);
        assert_eq!(config.retry.max_attempts, 6);
        assert_eq!(config.retry.initial_backoff_secs, 3.0);
        assert_eq!(config.retry.max_jitter_secs, 1.5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = HarvestConfig::from_toml_str(
            r#"
course_id = "abc987"
checkpoint_every = 0

[retry]
max_attempts = 3
"#,
        )
        .unwrap();

        assert_eq!(config.course_id, "abc987");
        assert_eq!(config.checkpoint_every, 0);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.backoff_multiplier, 2.0);
        assert_eq!(config.feed_limit, DEFAULT_FEED_LIMIT);
    }

    #[test]
    fn test_invalid_toml() {
        let result = HarvestConfig::from_toml_str("feed_limit = \"lots\"");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            (ENV_COURSE_ID, "course42"),
            (ENV_EMAIL, "student@example.edu"),
            (ENV_PASSWORD, "hunter2"),
            (ENV_FEED_LIMIT, "250"),
        ]
        .into_iter()
        .collect();

        let mut config = HarvestConfig::default();
        config
            .apply_env(|name| env.get(name).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.course_id, "course42");
        assert_eq!(config.feed_limit, 250);
        assert_eq!(
            config.credentials().unwrap(),
            ("student@example.edu", "hunter2")
        );
    }

    #[test]
    fn test_bad_feed_limit_env() {
        let mut config = HarvestConfig::default();
        let result = config.apply_env(|name| {
            (name == ENV_FEED_LIMIT).then(|| "many".to_string())
        });
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_missing_credentials() {
        let config = HarvestConfig::default();
        match config.credentials() {
            Err(ConfigError::MissingEnvironmentVariable { var_name }) => {
                assert_eq!(var_name, ENV_EMAIL)
            }
            other => panic!("Expected missing email, got {:?}", other),
        }
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = HarvestConfig::default();
        config.feed_limit = 0;
        assert!(config.validate().is_err());

        let mut config = HarvestConfig::default();
        config.retry.max_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = HarvestConfig::default();
        config.retry.backoff_multiplier = 0.5;
        assert!(config.validate().is_err());

        let mut config = HarvestConfig::default();
        config.retry.max_jitter_secs = f64::NAN;
        assert!(config.validate().is_err());

        let mut config = HarvestConfig::default();
        config.course_id = "  ".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingField { .. })
        ));
    }

    #[test]
    fn test_validation_rejects_unrepresentable_waits() {
        let config = HarvestConfig::from_toml_str(
            r#"
[retry]
initial_backoff_secs = 1e20
max_backoff_secs = 1e20
"#,
        )
        .unwrap();
        match config.validate() {
            Err(ConfigError::InvalidValue { field, .. }) => {
                assert_eq!(field, "retry.initial_backoff_secs");
            }
            other => panic!("Expected InvalidValue, got {:?}", other),
        }

        let mut config = HarvestConfig::default();
        config.retry.max_jitter_secs = f64::INFINITY;
        assert!(config.validate().is_err());

        let mut config = HarvestConfig::default();
        config.retry.max_backoff_secs = MAX_WAIT_SECS;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");

        let config = HarvestConfig::from_file(&path, false).unwrap();
        assert_eq!(config, HarvestConfig::default());

        let result = HarvestConfig::from_file(&path, true);
        assert!(matches!(
            result,
            Err(CoreError::Config(ConfigError::FileNotFound { .. }))
        ));
    }
}
