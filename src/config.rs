//! Tracer configuration
//!
//! Every field has a default, so an empty TOML document is a valid config.
//! Capacities default to the sizes of the kernel maps they stand in for.
//!
//! # Example
//! ```
//! use ioeye::config::TracerConfig;
//! use ioeye::correlation::BeginPolicy;
//!
//! let config = TracerConfig::from_toml_str(
//!     r#"
//!     begin_policy = "version"
//!     orphan_max_age_ms = 30000
//!     sweep_interval_ms = 1000
//!     "#,
//! )
//! .unwrap();
//! assert_eq!(config.begin_policy, BeginPolicy::Version);
//! assert_eq!(config.request_capacity, 10240);
//! ```

use crate::correlation::BeginPolicy;
use crate::filter::TaskFilter;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("{field} must be > 0")]
    MustBePositive { field: &'static str },

    #[error("sweep_interval_ms is set but orphan_max_age_ms is not")]
    SweepWithoutMaxAge,

    #[error("invalid filter_comm pattern: {0}")]
    Filter(#[from] regex::Error),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TracerConfig {
    /// Pending block requests tracked at once
    pub request_capacity: usize,
    /// Pending read/write calls tracked at once, per direction
    pub call_capacity: usize,
    /// Distinct pids aggregated
    pub aggregator_capacity: usize,
    /// Events buffered between hooks and consumer
    pub event_capacity: usize,
    /// What a start does to an identity that is already pending
    pub begin_policy: BeginPolicy,
    /// Pending records older than this are orphans and may be evicted
    pub orphan_max_age_ms: Option<u64>,
    /// Run a background orphan sweep at this period
    pub sweep_interval_ms: Option<u64>,
    /// Only trace these pids (empty = all)
    pub filter_pids: Vec<u32>,
    /// Only trace tasks whose name matches this regex
    pub filter_comm: Option<String>,
}

impl Default for TracerConfig {
    fn default() -> Self {
        Self {
            request_capacity: 10240,
            call_capacity: 10240,
            aggregator_capacity: 1024,
            event_capacity: 8192,
            begin_policy: BeginPolicy::Overwrite,
            orphan_max_age_ms: None,
            sweep_interval_ms: None,
            filter_pids: Vec::new(),
            filter_comm: None,
        }
    }
}

impl TracerConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        let capacities = [
            ("request_capacity", self.request_capacity),
            ("call_capacity", self.call_capacity),
            ("aggregator_capacity", self.aggregator_capacity),
            ("event_capacity", self.event_capacity),
        ];
        if let Some((field, _)) = capacities.iter().find(|(_, cap)| *cap == 0) {
            return Err(ConfigError::MustBePositive { field: *field });
        }

        if self.sweep_interval_ms == Some(0) {
            return Err(ConfigError::MustBePositive {
                field: "sweep_interval_ms",
            });
        }
        if self.sweep_interval_ms.is_some() && self.orphan_max_age_ms.is_none() {
            return Err(ConfigError::SweepWithoutMaxAge);
        }

        self.task_filter()?;
        Ok(())
    }

    pub fn task_filter(&self) -> Result<TaskFilter> {
        Ok(TaskFilter::new(
            &self.filter_pids,
            self.filter_comm.as_deref(),
        )?)
    }

    pub fn orphan_max_age(&self) -> Option<Duration> {
        self.orphan_max_age_ms.map(Duration::from_millis)
    }

    pub fn sweep_interval(&self) -> Option<Duration> {
        self.sweep_interval_ms.map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_gives_defaults() {
        let config = TracerConfig::from_toml_str("").unwrap();
        assert_eq!(config, TracerConfig::default());
        assert_eq!(config.aggregator_capacity, 1024);
        assert_eq!(config.begin_policy, BeginPolicy::Overwrite);
    }

    #[test]
    fn test_full_document() {
        let config = TracerConfig::from_toml_str(
            r#"
            request_capacity = 64
            call_capacity = 32
            aggregator_capacity = 8
            event_capacity = 16
            begin_policy = "reject"
            orphan_max_age_ms = 5000
            sweep_interval_ms = 250
            filter_pids = [1, 2]
            filter_comm = "^dd$"
            "#,
        )
        .unwrap();
        assert_eq!(config.request_capacity, 64);
        assert_eq!(config.begin_policy, BeginPolicy::Reject);
        assert_eq!(config.orphan_max_age(), Some(Duration::from_secs(5)));
        assert_eq!(config.sweep_interval(), Some(Duration::from_millis(250)));
        assert_eq!(config.filter_pids, vec![1, 2]);
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let err = TracerConfig::from_toml_str("event_capacity = 0").unwrap_err();
        assert!(matches!(
            err,
            ConfigError::MustBePositive {
                field: "event_capacity"
            }
        ));
    }

    #[test]
    fn test_sweep_requires_max_age() {
        let err = TracerConfig::from_toml_str("sweep_interval_ms = 100").unwrap_err();
        assert!(matches!(err, ConfigError::SweepWithoutMaxAge));
    }

    #[test]
    fn test_bad_regex_rejected() {
        let err = TracerConfig::from_toml_str(r#"filter_comm = "(""#).unwrap_err();
        assert!(matches!(err, ConfigError::Filter(_)));
    }

    #[test]
    fn test_unknown_field_rejected() {
        assert!(matches!(
            TracerConfig::from_toml_str("capacity = 3"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_missing_file() {
        let err = TracerConfig::from_file("/nonexistent/ioeye.toml").unwrap_err();
        assert!(err.to_string().contains("/nonexistent/ioeye.toml"));
    }
}
