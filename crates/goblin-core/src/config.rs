use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::models::{CoreError, CoreErrorKind};
use crate::orchestration::PoolLimits;

pub type ConfigResult<T> = Result<T, CoreError>;

pub const ENV_PREFIX: &str = "GOBLIN_";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DispatcherConfig {
    pub results_dir: PathBuf,
    pub retention_days: u32,
    pub max_concurrency: usize,
    pub completed_capacity: usize,
    pub hard_timeout_secs: u64,
    pub soft_timeout_secs: u64,
    pub cleanup_interval_secs: u64,
    pub cancel_grace_secs: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            results_dir: PathBuf::from("./results"),
            retention_days: 7,
            max_concurrency: 5,
            completed_capacity: 100,
            hard_timeout_secs: 3600,
            soft_timeout_secs: 3540,
            cleanup_interval_secs: 3600,
            cancel_grace_secs: 5,
        }
    }
}

impl DispatcherConfig {
    pub fn from_toml_str(source: &str) -> ConfigResult<Self> {
        toml::from_str(source).map_err(|error| {
            CoreError::new(
                CoreErrorKind::InvalidInput,
                format!("invalid dispatcher config: {error}"),
            )
        })
    }

    /// Reads `path` when given (defaults otherwise), then applies `GOBLIN_*`
    /// environment overrides and validates the result.
    pub fn load(path: Option<&Path>) -> ConfigResult<Self> {
        let mut config = match path {
            Some(path) => {
                let source = std::fs::read_to_string(path).map_err(|error| {
                    CoreError::new(
                        CoreErrorKind::InvalidInput,
                        format!("failed to read config '{}': {error}", path.display()),
                    )
                })?;
                Self::from_toml_str(&source)?
            }
            None => Self::default(),
        };
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> ConfigResult<()> {
        let var = |name: &str| {
            lookup(&format!("{ENV_PREFIX}{name}"))
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        if let Some(value) = var("RESULTS_DIR") {
            self.results_dir = PathBuf::from(value);
        }
        override_parsed(&mut self.retention_days, var("RETENTION_DAYS"), "RETENTION_DAYS")?;
        override_parsed(&mut self.max_concurrency, var("MAX_CONCURRENCY"), "MAX_CONCURRENCY")?;
        override_parsed(
            &mut self.completed_capacity,
            var("COMPLETED_CAPACITY"),
            "COMPLETED_CAPACITY",
        )?;
        override_parsed(
            &mut self.hard_timeout_secs,
            var("HARD_TIMEOUT_SECS"),
            "HARD_TIMEOUT_SECS",
        )?;
        override_parsed(
            &mut self.soft_timeout_secs,
            var("SOFT_TIMEOUT_SECS"),
            "SOFT_TIMEOUT_SECS",
        )?;
        override_parsed(
            &mut self.cleanup_interval_secs,
            var("CLEANUP_INTERVAL_SECS"),
            "CLEANUP_INTERVAL_SECS",
        )?;
        override_parsed(
            &mut self.cancel_grace_secs,
            var("CANCEL_GRACE_SECS"),
            "CANCEL_GRACE_SECS",
        )?;
        Ok(())
    }

    pub fn validate(&self) -> ConfigResult<()> {
        let invalid = |message: &str| Err(CoreError::new(CoreErrorKind::InvalidInput, message));

        if self.max_concurrency == 0 {
            return invalid("max_concurrency must be greater than zero");
        }
        if self.completed_capacity == 0 {
            return invalid("completed_capacity must be greater than zero");
        }
        if self.hard_timeout_secs == 0 {
            return invalid("hard_timeout_secs must be greater than zero");
        }
        if self.soft_timeout_secs >= self.hard_timeout_secs {
            return invalid("soft_timeout_secs must be less than hard_timeout_secs");
        }
        if self.cleanup_interval_secs == 0 {
            return invalid("cleanup_interval_secs must be greater than zero");
        }
        if self.results_dir.as_os_str().is_empty() {
            return invalid("results_dir must not be empty");
        }
        Ok(())
    }

    pub fn pool_limits(&self) -> PoolLimits {
        PoolLimits {
            concurrency: self.max_concurrency,
            hard_timeout: Duration::from_secs(self.hard_timeout_secs),
            soft_timeout: Duration::from_secs(self.soft_timeout_secs),
        }
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_secs(self.cancel_grace_secs)
    }
}

fn override_parsed<T: FromStr>(
    field: &mut T,
    value: Option<String>,
    name: &str,
) -> ConfigResult<()>
where
    T::Err: std::fmt::Display,
{
    let Some(value) = value else {
        return Ok(());
    };
    *field = value.parse().map_err(|error: T::Err| {
        CoreError::new(
            CoreErrorKind::InvalidInput,
            format!("invalid value '{value}' for {ENV_PREFIX}{name}: {error}"),
        )
    })?;
    Ok(())
}
