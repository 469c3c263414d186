use crate::core::errors::{Result, RouterError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// How far an abort reaches when a hop answers `abort`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortScope {
    /// Purge the aborted tag from the aborting partition's queue only
    Partition,
    /// Purge the aborted tag from every partition's queue
    Global,
}

/// Router configuration with all tuning parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Number of partitions (one coordinator and one executor each)
    pub partitions: usize,
    /// Bound of each coordinator -> executor request channel
    pub channel_capacity: usize,

    // Gate configuration
    /// Bounded delay between two re-checks of a blocked gate
    pub gate_recheck_interval: Duration,
    /// Upper bound on any single gate wait; `None` waits until deadlock detection fires
    pub dependency_timeout: Option<Duration>,
    /// Static prerequisite lists keyed by transaction tag
    pub dependencies: HashMap<String, Vec<String>>,

    /// Reach of abort rollback
    pub abort_scope: AbortScope,

    /// Capacity of the broadcast event stream
    pub event_capacity: usize,
    /// Simulated executor latency; each hop sleeps a random fraction of it
    pub execution_delay: Option<Duration>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            partitions: 4,
            channel_capacity: 1,
            gate_recheck_interval: Duration::from_millis(100),
            dependency_timeout: Some(Duration::from_secs(30)),
            dependencies: HashMap::new(),
            abort_scope: AbortScope::Partition,
            event_capacity: 1024,
            execution_delay: None,
        }
    }
}

impl RouterConfig {
    /// Create a new builder for RouterConfig
    pub fn builder() -> RouterConfigBuilder {
        RouterConfigBuilder::new()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.partitions == 0 {
            return Err(RouterError::configuration_field(
                "partitions must be greater than 0",
                "partitions",
            ));
        }
        if self.channel_capacity == 0 {
            return Err(RouterError::configuration_field(
                "channel_capacity must be greater than 0",
                "channel_capacity",
            ));
        }
        if self.gate_recheck_interval.is_zero() {
            return Err(RouterError::configuration_field(
                "gate_recheck_interval must be non-zero",
                "gate_recheck_interval",
            ));
        }
        if let Some(timeout) = self.dependency_timeout {
            if timeout < self.gate_recheck_interval {
                return Err(RouterError::configuration_field(
                    "dependency_timeout cannot be shorter than gate_recheck_interval",
                    "dependency_timeout",
                ));
            }
        }
        if self.event_capacity == 0 {
            return Err(RouterError::configuration_field(
                "event_capacity must be greater than 0",
                "event_capacity",
            ));
        }
        for (tag, prerequisites) in &self.dependencies {
            if prerequisites.iter().any(|p| p == tag) {
                return Err(RouterError::configuration_field(
                    format!("transaction {} cannot depend on itself", tag),
                    "dependencies",
                ));
            }
        }
        Ok(())
    }

    /// Static prerequisites declared for `tag`
    pub fn prerequisites_of(&self, tag: &str) -> &[String] {
        self.dependencies.get(tag).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Load a configuration from YAML text; missing fields take defaults
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: RouterConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&text)
    }

    /// Create a configuration tuned for tests: short gate waits
    pub fn development() -> Self {
        Self {
            partitions: 2,
            gate_recheck_interval: Duration::from_millis(10),
            dependency_timeout: Some(Duration::from_secs(5)),
            event_capacity: 256,
            ..Default::default()
        }
    }

    /// Create a configuration for many partitions and long queues
    pub fn high_throughput() -> Self {
        Self {
            partitions: 16,
            channel_capacity: 4,
            gate_recheck_interval: Duration::from_millis(20),
            event_capacity: 65_536,
            ..Default::default()
        }
    }
}

/// Builder for RouterConfig
pub struct RouterConfigBuilder {
    config: RouterConfig,
}

impl RouterConfigBuilder {
    /// Create a new builder with default values
    pub fn new() -> Self {
        Self {
            config: RouterConfig::default(),
        }
    }

    pub fn partitions(mut self, partitions: usize) -> Self {
        self.config.partitions = partitions;
        self
    }

    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.config.channel_capacity = capacity;
        self
    }

    pub fn gate_recheck_interval(mut self, interval: Duration) -> Self {
        self.config.gate_recheck_interval = interval;
        self
    }

    pub fn dependency_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.dependency_timeout = timeout;
        self
    }

    /// Declare the prerequisites of one transaction tag
    pub fn dependency<I, S>(mut self, tag: impl Into<String>, prerequisites: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.dependencies.insert(
            tag.into(),
            prerequisites.into_iter().map(Into::into).collect(),
        );
        self
    }

    pub fn abort_scope(mut self, scope: AbortScope) -> Self {
        self.config.abort_scope = scope;
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.config.event_capacity = capacity;
        self
    }

    pub fn execution_delay(mut self, delay: Option<Duration>) -> Self {
        self.config.execution_delay = delay;
        self
    }

    /// Build and validate the configuration
    pub fn build(self) -> Result<RouterConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for RouterConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RouterConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.partitions, 4);
        assert_eq!(config.abort_scope, AbortScope::Partition);
    }

    #[test]
    fn test_presets_validate() {
        assert!(RouterConfig::development().validate().is_ok());
        assert!(RouterConfig::high_throughput().validate().is_ok());
    }

    #[test]
    fn test_validation_errors() {
        let mut config = RouterConfig::default();
        config.partitions = 0;
        assert!(config.validate().is_err());
        config.partitions = 2;

        config.dependency_timeout = Some(Duration::from_millis(1));
        assert!(config.validate().is_err());
        config.dependency_timeout = None;
        assert!(config.validate().is_ok());

        config.dependencies.insert("T1".into(), vec!["T1".into()]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_builder() {
        let config = RouterConfig::builder()
            .partitions(3)
            .gate_recheck_interval(Duration::from_millis(5))
            .dependency("T7", ["T2", "T3", "T4", "T6"])
            .abort_scope(AbortScope::Global)
            .build()
            .unwrap();

        assert_eq!(config.partitions, 3);
        assert_eq!(config.prerequisites_of("T7").len(), 4);
        assert!(config.prerequisites_of("T1").is_empty());
        assert_eq!(config.abort_scope, AbortScope::Global);
    }

    #[test]
    fn test_from_yaml() {
        let yaml = r#"
partitions: 2
abort_scope: global
dependencies:
  T7: [T2, T3]
"#;
        let config = RouterConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.partitions, 2);
        assert_eq!(config.abort_scope, AbortScope::Global);
        assert_eq!(config.prerequisites_of("T7"), ["T2".to_string(), "T3".to_string()]);
        // untouched fields keep their defaults
        assert_eq!(config.channel_capacity, 1);
    }

    #[test]
    fn test_from_yaml_rejects_invalid() {
        assert!(RouterConfig::from_yaml_str("partitions: 0").is_err());
        assert!(RouterConfig::from_yaml_str("partitions: [").is_err());
    }
}
