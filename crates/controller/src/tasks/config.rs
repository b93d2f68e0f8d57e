//! Validation Controller Configuration
//!
//! Configuration mounted into the controller pod as a YAML file. Contains the
//! requeue cadences, retry/backoff policy, build defaults and runner image
//! settings the reconcilers consume.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

/// Main controller configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ControllerConfig {
    /// Job-level defaults (timeout, requeues, retries)
    #[serde(default)]
    pub job: JobConfig,

    /// Build backend defaults
    #[serde(default)]
    pub build: BuildConfig,

    /// Validation runner workload defaults
    #[serde(default)]
    pub runner: RunnerConfig,
}

/// Job-level defaults
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct JobConfig {
    /// Overall deadline applied when the spec declares none, e.g. "1h"
    #[serde(default = "default_timeout", rename = "defaultTimeout")]
    pub default_timeout: String,

    /// Poll cadence while a build is in progress
    #[serde(default = "default_building_requeue", rename = "buildingRequeueSeconds")]
    pub building_requeue_seconds: u64,

    /// Poll cadence while the validation pod runs
    #[serde(default = "default_running_requeue", rename = "runningRequeueSeconds")]
    pub running_requeue_seconds: u64,

    /// Requeue delay for transient errors (conflicts and friends)
    #[serde(default = "default_transient_requeue", rename = "transientRequeueSeconds")]
    pub transient_requeue_seconds: u64,

    /// Exponential backoff schedule for retriable failures
    #[serde(default = "default_retry_backoff", rename = "retryBackoffSeconds")]
    pub retry_backoff_seconds: Vec<u64>,

    /// Retry cap; conflicts never count against it
    #[serde(default = "default_max_retries", rename = "maxRetries")]
    pub max_retries: u32,
}

/// Build backend defaults
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BuildConfig {
    /// Base image used when the spec declares none
    #[serde(default = "default_base_image", rename = "defaultBaseImage")]
    pub default_base_image: String,

    /// Internal registry prefix for built images
    #[serde(default = "default_internal_registry", rename = "internalRegistry")]
    pub internal_registry: String,

    /// Per-strategy build attempt cap
    #[serde(default = "default_attempts_per_strategy", rename = "maxAttemptsPerStrategy")]
    pub max_attempts_per_strategy: u32,

    /// Overall build attempt cap across strategies
    #[serde(default = "default_attempts_total", rename = "maxAttemptsTotal")]
    pub max_attempts_total: u32,

    /// ServiceAccount the pipeline strategy runs as
    #[serde(default = "default_pipeline_sa", rename = "pipelineServiceAccount")]
    pub pipeline_service_account: String,

    /// SecurityContextConstraints granting privileged builds
    #[serde(default = "default_scc_name", rename = "privilegedBuildScc")]
    pub privileged_build_scc: String,
}

/// Validation runner workload defaults
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RunnerConfig {
    /// Image for the source-clone init container
    #[serde(default = "default_clone_image", rename = "cloneImage")]
    pub clone_image: String,

    /// Entry command of the execution tool inside the workload
    #[serde(default = "default_runner_command")]
    pub command: Vec<String>,

    /// Where the executed notebook is written inside the workload
    #[serde(default = "default_output_path", rename = "outputPath")]
    pub output_path: String,

    /// ServiceAccount fallback when the spec declares none
    #[serde(default = "default_service_account", rename = "serviceAccountName")]
    pub service_account_name: String,

    /// Default CPU/memory requests, quantity strings
    #[serde(default = "default_cpu_request", rename = "cpuRequest")]
    pub cpu_request: String,
    #[serde(default = "default_memory_request", rename = "memoryRequest")]
    pub memory_request: String,
    #[serde(default = "default_cpu_limit", rename = "cpuLimit")]
    pub cpu_limit: String,
    #[serde(default = "default_memory_limit", rename = "memoryLimit")]
    pub memory_limit: String,
}

fn default_timeout() -> String {
    "1h".to_string()
}

fn default_building_requeue() -> u64 {
    30
}

fn default_running_requeue() -> u64 {
    15
}

fn default_transient_requeue() -> u64 {
    60
}

fn default_retry_backoff() -> Vec<u64> {
    vec![60, 120, 300]
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_image() -> String {
    "quay.io/jupyter/minimal-notebook:latest".to_string()
}

fn default_internal_registry() -> String {
    "image-registry.openshift-image-registry.svc:5000".to_string()
}

fn default_attempts_per_strategy() -> u32 {
    3
}

fn default_attempts_total() -> u32 {
    9
}

fn default_pipeline_sa() -> String {
    "pipeline".to_string()
}

fn default_scc_name() -> String {
    "pipelines-scc".to_string()
}

fn default_clone_image() -> String {
    "alpine/git:2.45.2".to_string()
}

fn default_runner_command() -> Vec<String> {
    vec!["notebook-runner".to_string()]
}

fn default_output_path() -> String {
    "/workspace/output.ipynb".to_string()
}

fn default_service_account() -> String {
    "default".to_string()
}

fn default_cpu_request() -> String {
    "500m".to_string()
}

fn default_memory_request() -> String {
    "512Mi".to_string()
}

fn default_cpu_limit() -> String {
    "1".to_string()
}

fn default_memory_limit() -> String {
    "2Gi".to_string()
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            default_timeout: default_timeout(),
            building_requeue_seconds: default_building_requeue(),
            running_requeue_seconds: default_running_requeue(),
            transient_requeue_seconds: default_transient_requeue(),
            retry_backoff_seconds: default_retry_backoff(),
            max_retries: default_max_retries(),
        }
    }
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            default_base_image: default_base_image(),
            internal_registry: default_internal_registry(),
            max_attempts_per_strategy: default_attempts_per_strategy(),
            max_attempts_total: default_attempts_total(),
            pipeline_service_account: default_pipeline_sa(),
            privileged_build_scc: default_scc_name(),
        }
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            clone_image: default_clone_image(),
            command: default_runner_command(),
            output_path: default_output_path(),
            service_account_name: default_service_account(),
            cpu_request: default_cpu_request(),
            memory_request: default_memory_request(),
            cpu_limit: default_cpu_limit(),
            memory_limit: default_memory_limit(),
        }
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            job: JobConfig::default(),
            build: BuildConfig::default(),
            runner: RunnerConfig::default(),
        }
    }
}

impl ControllerConfig {
    /// Load configuration from a mounted YAML file.
    pub fn from_mounted_file(path: &str) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: ControllerConfig = serde_yaml::from_str(&raw)?;
        Ok(config)
    }

    /// Validate loaded configuration before the controllers start.
    pub fn validate(&self) -> anyhow::Result<()> {
        crate::tasks::types::parse_timeout(&self.job.default_timeout)
            .map_err(|e| anyhow::anyhow!("job.defaultTimeout: {e}"))?;

        if self.job.retry_backoff_seconds.is_empty() {
            anyhow::bail!("job.retryBackoffSeconds must not be empty");
        }
        if self.job.building_requeue_seconds == 0 || self.job.running_requeue_seconds == 0 {
            anyhow::bail!("requeue cadences must be positive");
        }
        if self.build.max_attempts_per_strategy == 0 || self.build.max_attempts_total == 0 {
            anyhow::bail!("build attempt caps must be positive");
        }
        if self.runner.command.is_empty() {
            anyhow::bail!("runner.command must not be empty");
        }
        if self.runner.clone_image.trim().is_empty() {
            anyhow::bail!("runner.cloneImage must not be empty");
        }
        Ok(())
    }

    /// Backoff delay for the given retry ordinal (0-based), saturating at the
    /// last schedule entry.
    #[must_use]
    pub fn retry_backoff(&self, retry_count: u32) -> Duration {
        let schedule = &self.job.retry_backoff_seconds;
        let idx = (retry_count as usize).min(schedule.len().saturating_sub(1));
        Duration::from_secs(schedule[idx])
    }

    #[must_use]
    pub fn building_requeue(&self) -> Duration {
        Duration::from_secs(self.job.building_requeue_seconds)
    }

    #[must_use]
    pub fn running_requeue(&self) -> Duration {
        Duration::from_secs(self.job.running_requeue_seconds)
    }

    #[must_use]
    pub fn transient_requeue(&self) -> Duration {
        Duration::from_secs(self.job.transient_requeue_seconds)
    }

    /// Default deadline used when a job declares no timeout. Falls back to one
    /// hour if the configured pattern is somehow unparsable at use time.
    #[must_use]
    pub fn default_deadline(&self) -> Duration {
        crate::tasks::types::parse_timeout(&self.job.default_timeout).unwrap_or_else(|e| {
            warn!("invalid job.defaultTimeout in config, using 1h: {}", e);
            Duration::from_secs(3600)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = ControllerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.job.building_requeue_seconds, 30);
        assert_eq!(config.job.running_requeue_seconds, 15);
        assert_eq!(config.job.retry_backoff_seconds, vec![60, 120, 300]);
        assert_eq!(config.build.max_attempts_per_strategy, 3);
        assert_eq!(config.build.max_attempts_total, 9);
    }

    #[test]
    fn test_retry_backoff_saturates() {
        let config = ControllerConfig::default();
        assert_eq!(config.retry_backoff(0), Duration::from_secs(60));
        assert_eq!(config.retry_backoff(1), Duration::from_secs(120));
        assert_eq!(config.retry_backoff(2), Duration::from_secs(300));
        assert_eq!(config.retry_backoff(7), Duration::from_secs(300));
    }

    #[test]
    #[serial]
    fn test_from_mounted_file_partial_yaml() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(
            file,
            "job:\n  maxRetries: 5\nbuild:\n  internalRegistry: registry.internal:5000"
        )
        .expect("write yaml");

        let config = ControllerConfig::from_mounted_file(file.path().to_str().unwrap())
            .expect("config parses");
        assert_eq!(config.job.max_retries, 5);
        assert_eq!(config.build.internal_registry, "registry.internal:5000");
        // Unspecified sections keep their defaults
        assert_eq!(config.runner.service_account_name, "default");
        assert!(config.validate().is_ok());
    }

    #[test]
    #[serial]
    fn test_from_mounted_file_missing_path() {
        assert!(ControllerConfig::from_mounted_file("/nonexistent/config.yaml").is_err());
    }

    #[test]
    fn test_validate_rejects_empty_backoff() {
        let mut config = ControllerConfig::default();
        config.job.retry_backoff_seconds.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_timeout() {
        let mut config = ControllerConfig::default();
        config.job.default_timeout = "whenever".to_string();
        assert!(config.validate().is_err());
    }
}
