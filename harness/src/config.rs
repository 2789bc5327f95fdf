//! Configuration parsing for the submission harness.

use std::path::Path;

use serde::{Deserialize, Serialize};
use vln_config::{LaunchError, LaunchParams, ResourceProfile};

/// Top-level configuration loaded from TOML (raw, before merging).
#[derive(Debug, Clone, Deserialize)]
struct RawHarnessConfig {
    pub harness: HarnessSettings,
    #[serde(default = "empty_table")]
    pub defaults: toml::Value,
    #[serde(default)]
    pub jobs: Vec<toml::Value>,
}

fn empty_table() -> toml::Value {
    toml::Value::Table(toml::map::Map::new())
}

/// Top-level configuration after merging defaults into jobs.
#[derive(Debug, Clone)]
pub struct HarnessConfig {
    pub harness: HarnessSettings,
    pub jobs: Vec<JobConfig>,
}

/// Harness-level settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarnessSettings {
    /// Interpreter used to launch the entry point.
    #[serde(default = "default_python")]
    pub python: String,
    /// Training entry point, relative to `workdir`.
    #[serde(default = "default_entry_point")]
    pub entry_point: String,
    /// Directory changed into before every launch.
    #[serde(default = "default_workdir")]
    pub workdir: String,
    /// Path to the state file for persistence.
    #[serde(default = "default_state_file")]
    pub state_file: String,
    /// Concurrent job slots in local mode.
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    /// What to do on failure: "retry", "skip", or "abort".
    #[serde(default = "default_on_failure")]
    pub on_failure: FailurePolicy,
    /// Maximum retry attempts per job.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Interval between `bjobs` polls when waiting on cluster jobs.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Kill a local job if no progress update after the first one within this many seconds.
    #[serde(default)]
    pub hang_timeout_secs: Option<u64>,
    /// Kill a local job if no stdout/stderr activity at all within this many seconds.
    #[serde(default)]
    pub idle_timeout_secs: Option<u64>,
    /// Grace period (seconds) after spawn before watchdog timeouts apply.
    /// The simulator prints nothing while it boots.
    #[serde(default = "default_startup_grace")]
    pub startup_grace_secs: u64,
    /// `GLOG_minloglevel` value exported before every launch.
    #[serde(default = "default_glog")]
    pub glog_minloglevel: String,
    /// `MAGNUM_LOG` value exported before every launch.
    #[serde(default = "default_magnum")]
    pub magnum_log: String,
    /// Batch-queue submission command.
    #[serde(default = "default_bsub_bin")]
    pub bsub_bin: String,
}

impl HarnessSettings {
    /// Environment exported to every launch, submission-time and local.
    #[must_use]
    pub fn env_vars(&self) -> Vec<(String, String)> {
        vec![
            ("GLOG_minloglevel".to_string(), self.glog_minloglevel.clone()),
            ("MAGNUM_LOG".to_string(), self.magnum_log.clone()),
        ]
    }
}

/// What to do when a job fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Retry the job up to `max_retries` times.
    #[default]
    Retry,
    /// Skip the job and continue with others.
    Skip,
    /// Abort the entire harness.
    Abort,
}

/// Configuration for a single submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    pub name: String,
    #[serde(flatten)]
    pub launch: LaunchParams,
    #[serde(default)]
    pub resources: ResourceProfile,
    /// Where the external trainer drops `ckpt.N.pth` files, if known.
    /// Used for status reporting only.
    #[serde(default)]
    pub checkpoint_dir: Option<String>,
    #[serde(default)]
    pub out: Option<String>,
}

impl JobConfig {
    /// Directory for harness-side stdout/stderr capture of local runs.
    #[must_use]
    pub fn log_dir(&self) -> String {
        self.out
            .clone()
            .unwrap_or_else(|| format!("./logs/{}", self.name))
    }
}

fn default_python() -> String {
    "python3".to_string()
}

fn default_entry_point() -> String {
    "run.py".to_string()
}

fn default_workdir() -> String {
    ".".to_string()
}

fn default_state_file() -> String {
    "./submit_state.json".to_string()
}

fn default_max_parallel() -> usize {
    1
}

fn default_on_failure() -> FailurePolicy {
    FailurePolicy::Retry
}

fn default_max_retries() -> u32 {
    2
}

fn default_poll_interval() -> u64 {
    30
}

fn default_startup_grace() -> u64 {
    120
}

fn default_glog() -> String {
    "2".to_string()
}

fn default_magnum() -> String {
    "quiet".to_string()
}

fn default_bsub_bin() -> String {
    "bsub".to_string()
}

/// Merge two TOML tables, with `overlay` values taking precedence.
fn merge_toml(base: &toml::Value, overlay: &toml::Value) -> toml::Value {
    match (base, overlay) {
        (toml::Value::Table(base_map), toml::Value::Table(overlay_map)) => {
            let mut merged = base_map.clone();
            for (k, v) in overlay_map {
                merged.insert(
                    k.clone(),
                    if let Some(base_v) = base_map.get(k) {
                        merge_toml(base_v, v)
                    } else {
                        v.clone()
                    },
                );
            }
            toml::Value::Table(merged)
        }
        (_, overlay) => overlay.clone(),
    }
}

impl HarnessConfig {
    /// Load configuration from a TOML file, merging defaults into each job.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Io(path.as_ref().display().to_string(), e))?;
        let raw: RawHarnessConfig =
            toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;

        // Get log_prefix from defaults if present
        let log_prefix = raw
            .defaults
            .get("log_prefix")
            .and_then(|v| v.as_str())
            .map(String::from);

        // Merge defaults into each job
        let jobs: Vec<JobConfig> = raw
            .jobs
            .into_iter()
            .map(|job_value| {
                let mut merged = merge_toml(&raw.defaults, &job_value);
                // Apply log_prefix if out not specified
                if let toml::Value::Table(ref mut t) = merged {
                    t.remove("log_prefix"); // Don't pass to JobConfig
                    if !t.contains_key("out")
                        && let (Some(prefix), Some(name)) =
                            (&log_prefix, t.get("name").and_then(|n| n.as_str()))
                    {
                        t.insert(
                            "out".into(),
                            toml::Value::String(format!("{prefix}/{name}")),
                        );
                    }
                }
                merged
                    .try_into()
                    .map_err(|e: toml::de::Error| ConfigError::Parse(e.to_string()))
            })
            .collect::<Result<_, _>>()?;

        let config = Self {
            harness: raw.harness,
            jobs,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check cross-job constraints after merging.
    fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = std::collections::HashSet::new();
        for job in &self.jobs {
            if !seen.insert(job.name.as_str()) {
                return Err(ConfigError::DuplicateName(job.name.clone()));
            }
            job.launch
                .validate()
                .map_err(|e| ConfigError::Launch(job.name.clone(), e))?;
        }
        Ok(())
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    Io(String, std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(String),
    #[error("duplicate job name '{0}'")]
    DuplicateName(String),
    #[error("job '{0}': {1}")]
    Launch(String, LaunchError),
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;
    use vln_config::RunType;

    use super::*;

    fn parse_config(toml_str: &str) -> Result<HarnessConfig, ConfigError> {
        // Write to unique temp file since load() reads from file
        let dir = tempdir().unwrap();
        let path = dir.path().join("test_harness.toml");
        std::fs::write(&path, toml_str).unwrap();
        HarnessConfig::load(&path)
    }

    #[test]
    fn test_parse_minimal_config() {
        let config = parse_config(
            r#"
[harness]

[[jobs]]
name = "waypoint-train"
exp_config = "config/experiments/waypoint.yaml"
"#,
        )
        .unwrap();
        assert_eq!(config.harness.python, "python3");
        assert_eq!(config.harness.entry_point, "run.py");
        assert_eq!(config.harness.glog_minloglevel, "2");
        assert_eq!(config.harness.magnum_log, "quiet");
        assert_eq!(config.jobs.len(), 1);
        assert_eq!(config.jobs[0].name, "waypoint-train");
        assert_eq!(config.jobs[0].launch.run_type, RunType::Train);
        assert_eq!(config.jobs[0].resources.cpus, 16);
    }

    #[test]
    fn test_defaults_applied() {
        let config = parse_config(
            r#"
[harness]

[defaults]
run_type = "train"
nproc_per_node = 2

[defaults.resources]
gpus = 2
gpu_model = "GeForceRTX2080Ti"

[[jobs]]
name = "job1"
exp_config = "a.yaml"

[[jobs]]
name = "job2"
exp_config = "b.yaml"
run_type = "eval"

[jobs.resources]
gpus = 1
"#,
        )
        .unwrap();
        assert_eq!(config.jobs[0].launch.nproc_per_node, Some(2));
        assert_eq!(config.jobs[0].resources.gpus, 2);
        assert_eq!(
            config.jobs[0].resources.gpu_model.as_deref(),
            Some("GeForceRTX2080Ti")
        );

        assert_eq!(config.jobs[1].launch.run_type, RunType::Eval);
        assert_eq!(config.jobs[1].resources.gpus, 1); // Overridden
        assert_eq!(
            config.jobs[1].resources.gpu_model.as_deref(),
            Some("GeForceRTX2080Ti")
        );
    }

    #[test]
    fn test_log_prefix_expansion() {
        let config = parse_config(
            r#"
[harness]

[defaults]
log_prefix = "./logs/sweep1"

[[jobs]]
name = "job1"
exp_config = "a.yaml"

[[jobs]]
name = "job2"
exp_config = "b.yaml"
out = "./elsewhere"
"#,
        )
        .unwrap();
        assert_eq!(config.jobs[0].log_dir(), "./logs/sweep1/job1");
        assert_eq!(config.jobs[1].log_dir(), "./elsewhere");
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let err = parse_config(
            r#"
[harness]

[[jobs]]
name = "same"
exp_config = "a.yaml"

[[jobs]]
name = "same"
exp_config = "b.yaml"
"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateName(_)));
    }

    #[test]
    fn test_zero_workers_rejected() {
        let err = parse_config(
            r#"
[harness]

[[jobs]]
name = "bad"
exp_config = "a.yaml"
nproc_per_node = 0
"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Launch(_, _)));
    }

    #[test]
    fn test_odd_opts_rejected() {
        let err = parse_config(
            r#"
[harness]

[[jobs]]
name = "bad"
exp_config = "a.yaml"
opts = ["TASK_CONFIG.SEED"]
"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Launch(_, _)));
    }

    #[test]
    fn test_env_vars() {
        let config = parse_config(
            r#"
[harness]
glog_minloglevel = "0"

[[jobs]]
name = "j"
exp_config = "a.yaml"
"#,
        )
        .unwrap();
        let env = config.harness.env_vars();
        assert_eq!(
            env,
            vec![
                ("GLOG_minloglevel".to_string(), "0".to_string()),
                ("MAGNUM_LOG".to_string(), "quiet".to_string()),
            ]
        );
    }
}
