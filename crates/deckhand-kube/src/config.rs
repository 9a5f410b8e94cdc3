//! Deploy engine configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{KubeError, Result};

/// Settings for building and executing a deploy plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployConfig {
    /// Maximum concurrent cluster calls (default: 10)
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,

    /// Deadline for the whole plan (default: 10m)
    #[serde(default = "default_deploy_timeout", with = "humantime_serde")]
    pub deploy_timeout: Duration,

    /// Interval between readiness and existence polls (default: 2s)
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,

    /// How long to wait for a deleted object to disappear (default: 5m)
    #[serde(default = "default_deletion_timeout", with = "humantime_serde")]
    pub deletion_timeout: Duration,

    /// How long to wait for an external dependency to appear (default: 5m)
    #[serde(default = "default_creation_timeout", with = "humantime_serde")]
    pub creation_timeout: Duration,

    /// How long a single readiness tracking operation may run (default: 5m)
    #[serde(default = "default_tracking_timeout", with = "humantime_serde")]
    pub tracking_timeout: Duration,

    /// Skip resources whose kind the cluster does not serve (default: false)
    #[serde(default)]
    pub skip_unsupported: bool,
}

fn default_parallelism() -> usize {
    10
}

fn default_deploy_timeout() -> Duration {
    Duration::from_secs(600)
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(2)
}

fn default_deletion_timeout() -> Duration {
    Duration::from_secs(300)
}

fn default_creation_timeout() -> Duration {
    Duration::from_secs(300)
}

fn default_tracking_timeout() -> Duration {
    Duration::from_secs(300)
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            parallelism: default_parallelism(),
            deploy_timeout: default_deploy_timeout(),
            poll_interval: default_poll_interval(),
            deletion_timeout: default_deletion_timeout(),
            creation_timeout: default_creation_timeout(),
            tracking_timeout: default_tracking_timeout(),
            skip_unsupported: false,
        }
    }
}

impl DeployConfig {
    /// Parse and validate a YAML document
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)
            .map_err(|e| KubeError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.parallelism == 0 {
            return Err(KubeError::InvalidConfig(
                "parallelism must be greater than zero".to_string(),
            ));
        }
        if self.poll_interval.is_zero() {
            return Err(KubeError::InvalidConfig(
                "pollInterval must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism;
        self
    }

    pub fn with_deploy_timeout(mut self, timeout: Duration) -> Self {
        self.deploy_timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_tracking_timeout(mut self, timeout: Duration) -> Self {
        self.tracking_timeout = timeout;
        self
    }

    pub fn with_skip_unsupported(mut self, skip: bool) -> Self {
        self.skip_unsupported = skip;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = DeployConfig::default();
        assert_eq!(config.parallelism, 10);
        assert_eq!(config.deploy_timeout, Duration::from_secs(600));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_yaml_with_humantime() {
        let config = DeployConfig::from_yaml(
            r#"
parallelism: 4
deployTimeout: 1m 30s
pollInterval: 500ms
skipUnsupported: true
"#,
        )
        .unwrap();

        assert_eq!(config.parallelism, 4);
        assert_eq!(config.deploy_timeout, Duration::from_secs(90));
        assert_eq!(config.poll_interval, Duration::from_millis(500));
        assert_eq!(config.deletion_timeout, Duration::from_secs(300));
        assert!(config.skip_unsupported);
    }

    #[test]
    fn test_zero_parallelism_rejected() {
        let err = DeployConfig::from_yaml("parallelism: 0\n").unwrap_err();
        assert!(matches!(err, KubeError::InvalidConfig(_)));
    }

    #[test]
    fn test_yaml_roundtrip() {
        let config = DeployConfig::default().with_parallelism(3);
        let yaml = serde_yaml::to_string(&config).unwrap();
        assert!(yaml.contains("deployTimeout: 10m"));
        assert_eq!(DeployConfig::from_yaml(&yaml).unwrap(), config);
    }
}
