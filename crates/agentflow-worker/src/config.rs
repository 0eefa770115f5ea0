//! Daemon configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use agentflow_core::DEFAULT_TASK_LIST;

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}

/// Configuration for the runner service daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerServiceConfig {
    pub service_name: String,
    pub server_group: String,
    pub server_name: String,

    /// Task routing channel to claim from.
    pub task_list: String,

    #[serde(with = "duration_millis")]
    pub poll_interval: Duration,

    #[serde(with = "duration_millis")]
    pub heartbeat_interval: Duration,

    /// Maximum concurrently driven runners.
    pub max_concurrent: usize,
}

impl Default for RunnerServiceConfig {
    fn default() -> Self {
        Self {
            service_name: "afl-runner".to_string(),
            server_group: "default".to_string(),
            server_name: hostname(),
            task_list: DEFAULT_TASK_LIST.to_string(),
            poll_interval: Duration::from_secs(2),
            heartbeat_interval: Duration::from_secs(10),
            max_concurrent: 5,
        }
    }
}

impl RunnerServiceConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_task_list(mut self, task_list: impl Into<String>) -> Self {
        self.task_list = task_list.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max.max(1);
        self
    }
}

/// Configuration for the agent poller daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentPollerConfig {
    pub service_name: String,
    pub server_group: String,
    pub server_name: String,

    pub task_list: String,

    /// Glob patterns restricting which registry facets this agent serves.
    /// Empty means no restriction.
    pub topics: Vec<String>,

    #[serde(with = "duration_millis")]
    pub poll_interval: Duration,

    #[serde(with = "duration_millis")]
    pub heartbeat_interval: Duration,

    #[serde(with = "duration_millis")]
    pub registry_refresh_interval: Duration,

    /// Maximum concurrent handler executions.
    pub max_concurrent: usize,
}

impl Default for AgentPollerConfig {
    fn default() -> Self {
        Self {
            service_name: "afl-agent".to_string(),
            server_group: "default".to_string(),
            server_name: hostname(),
            task_list: DEFAULT_TASK_LIST.to_string(),
            topics: vec![],
            poll_interval: Duration::from_secs(2),
            heartbeat_interval: Duration::from_secs(10),
            registry_refresh_interval: Duration::from_secs(30),
            max_concurrent: 5,
        }
    }
}

impl AgentPollerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_task_list(mut self, task_list: impl Into<String>) -> Self {
        self.task_list = task_list.into();
        self
    }

    pub fn with_topics(mut self, topics: Vec<String>) -> Self {
        self.topics = topics;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max.max(1);
        self
    }

    pub fn with_registry_refresh_interval(mut self, interval: Duration) -> Self {
        self.registry_refresh_interval = interval;
        self
    }
}

/// Configuration for artifact-backed handler execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactConfig {
    /// Local cache directory for downloaded artifacts.
    pub cache_dir: PathBuf,

    /// Artifact repository base URL.
    pub repository_url: String,

    /// Command used to launch JVM subprocesses.
    pub java_command: String,

    /// Fallback subprocess timeout when a registration has none.
    #[serde(with = "duration_millis")]
    pub default_timeout: Duration,

    /// Store connection handed to subprocesses via the environment.
    pub database_url: Option<String>,
    pub database_name: Option<String>,
}

impl Default for ArtifactConfig {
    fn default() -> Self {
        let cache_dir = std::env::var("AGENTFLOW_CACHE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                dirs_fallback().join(".agentflow").join("artifact-cache")
            });
        Self {
            cache_dir,
            repository_url: std::env::var("AGENTFLOW_REPOSITORY_URL")
                .unwrap_or_else(|_| "https://repo1.maven.org/maven2".to_string()),
            java_command: std::env::var("AGENTFLOW_JAVA_COMMAND")
                .unwrap_or_else(|_| "java".to_string()),
            default_timeout: Duration::from_secs(300),
            database_url: std::env::var("AGENTFLOW_DATABASE_URL").ok(),
            database_name: std::env::var("AGENTFLOW_DATABASE").ok(),
        }
    }
}

fn dirs_fallback() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
}

/// Serde support for Duration as milliseconds.
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runner_service_defaults() {
        let config = RunnerServiceConfig::default();
        assert_eq!(config.service_name, "afl-runner");
        assert_eq!(config.task_list, "default");
        assert_eq!(config.poll_interval, Duration::from_secs(2));
        assert_eq!(config.max_concurrent, 5);
    }

    #[test]
    fn test_agent_config_builder() {
        let config = AgentPollerConfig::new()
            .with_task_list("priority")
            .with_topics(vec!["demo.*".to_string()])
            .with_poll_interval(Duration::from_millis(50))
            .with_max_concurrent(8);

        assert_eq!(config.task_list, "priority");
        assert_eq!(config.topics, vec!["demo.*"]);
        assert_eq!(config.poll_interval, Duration::from_millis(50));
        assert_eq!(config.max_concurrent, 8);
    }

    #[test]
    fn test_max_concurrent_floor() {
        let config = AgentPollerConfig::new().with_max_concurrent(0);
        assert_eq!(config.max_concurrent, 1);
    }

    #[test]
    fn test_config_serde_round_trip() {
        let config = RunnerServiceConfig::default().with_poll_interval(Duration::from_millis(250));
        let json = serde_json::to_string(&config).unwrap();
        let back: RunnerServiceConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.poll_interval, Duration::from_millis(250));
    }
}
