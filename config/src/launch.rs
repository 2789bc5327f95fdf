//! Resource-request profiles and launcher argument assembly.

use serde::{Deserialize, Serialize};

use crate::{RunType, WallTime};

/// Cluster resource request for one job submission.
///
/// Maps one-to-one onto the flags the submission scripts pass to `bsub`:
/// `-n`, `-W`, `rusage[mem=…,ngpus_excl_p=…]`, `select[gpu_model0==…]`, `-o`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[cfg_attr(feature = "clap", derive(clap::Args))]
pub struct ResourceProfile {
    /// CPU core count (`bsub -n`).
    #[serde(default = "default_cpus")]
    #[cfg_attr(feature = "clap", arg(long, default_value = "16"))]
    pub cpus: u32,
    /// Memory request in MB per core (`rusage[mem=…]`).
    #[serde(default = "default_mem_mb")]
    #[cfg_attr(feature = "clap", arg(long, default_value = "4096"))]
    pub mem_mb: u32,
    /// Exclusive-process GPU count (`rusage[ngpus_excl_p=…]`).
    #[serde(default = "default_gpus")]
    #[cfg_attr(feature = "clap", arg(long, default_value = "1"))]
    pub gpus: u32,
    /// GPU model constraint (`select[gpu_model0==…]`).
    #[serde(default)]
    #[cfg_attr(feature = "clap", arg(long))]
    pub gpu_model: Option<String>,
    /// Wall-clock limit (`bsub -W`).
    #[serde(default)]
    #[cfg_attr(feature = "clap", arg(long, default_value = "24:00"))]
    pub walltime: WallTime,
    /// Scheduler stdout/stderr redirection path (`bsub -o`).
    #[serde(default)]
    #[cfg_attr(feature = "clap", arg(long))]
    pub output_log: Option<String>,
}

fn default_cpus() -> u32 {
    16
}
fn default_mem_mb() -> u32 {
    4096
}
fn default_gpus() -> u32 {
    1
}

impl Default for ResourceProfile {
    fn default() -> Self {
        Self {
            cpus: default_cpus(),
            mem_mb: default_mem_mb(),
            gpus: default_gpus(),
            gpu_model: None,
            walltime: WallTime::default(),
            output_log: None,
        }
    }
}

impl ResourceProfile {
    /// Convert to `bsub` arguments (everything before the command to run).
    ///
    /// The GPU rusage term is only emitted for `gpus > 0`, the `select`
    /// clause only when a model constraint is set, `-o` only when a
    /// redirection path is set.
    pub fn to_bsub_args(&self) -> Vec<String> {
        let mut args = vec![
            "-n".into(),
            self.cpus.to_string(),
            "-W".into(),
            self.walltime.to_string(),
        ];

        let mut rusage = format!("rusage[mem={}", self.mem_mb);
        if self.gpus > 0 {
            rusage.push_str(&format!(",ngpus_excl_p={}", self.gpus));
        }
        rusage.push(']');
        args.extend(["-R".into(), rusage]);

        if let Some(ref model) = self.gpu_model {
            args.extend(["-R".into(), format!("select[gpu_model0=={model}]")]);
        }
        if let Some(ref log) = self.output_log {
            args.extend(["-o".into(), log.clone()]);
        }
        args
    }
}

/// What one launcher script forwards to the training entry point.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[cfg_attr(feature = "clap", derive(clap::Args))]
pub struct LaunchParams {
    /// Path to the experiment YAML. Opaque: forwarded, never read.
    #[cfg_attr(feature = "clap", arg(long))]
    pub exp_config: String,
    /// Run mode selector.
    #[serde(default)]
    #[cfg_attr(feature = "clap", arg(long, value_enum, default_value = "train"))]
    pub run_type: RunType,
    /// Trailing KEY VALUE config-override pairs, passed through verbatim.
    #[serde(default)]
    #[cfg_attr(feature = "clap", arg(last = true))]
    pub opts: Vec<String>,
    /// Worker process count per node. `Some(n)` selects the distributed
    /// launcher; `None` runs the entry point directly.
    #[serde(default)]
    #[cfg_attr(feature = "clap", arg(long))]
    pub nproc_per_node: Option<u32>,
    /// Rendezvous port for the distributed launcher.
    #[serde(default)]
    #[cfg_attr(feature = "clap", arg(long))]
    pub master_port: Option<u16>,
}

impl LaunchParams {
    /// Arguments for the entry point itself.
    pub fn to_entry_args(&self) -> Vec<String> {
        let mut args = vec![
            "--exp-config".into(),
            self.exp_config.clone(),
            "--run-type".into(),
            self.run_type.to_string(),
        ];
        args.extend(self.opts.iter().cloned());
        args
    }

    /// Full interpreter argument vector: either the entry point directly or
    /// `-m torch.distributed.launch --nproc_per_node=<n> [--master_port=<p>]`
    /// in front of it.
    pub fn to_launcher_args(&self, entry_point: &str) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(nproc) = self.nproc_per_node {
            args.extend([
                "-m".into(),
                "torch.distributed.launch".into(),
                format!("--nproc_per_node={nproc}"),
            ]);
            if let Some(port) = self.master_port {
                args.push(format!("--master_port={port}"));
            }
        }
        args.push(entry_point.into());
        args.extend(self.to_entry_args());
        args
    }

    /// Check constraints a well-formed launch must satisfy.
    pub fn validate(&self) -> Result<(), LaunchError> {
        if self.exp_config.is_empty() {
            return Err(LaunchError::MissingExpConfig);
        }
        if self.nproc_per_node == Some(0) {
            return Err(LaunchError::ZeroWorkers);
        }
        if self.opts.len() % 2 != 0 {
            return Err(LaunchError::OddOpts(self.opts.len()));
        }
        Ok(())
    }
}

/// Errors for malformed launch parameters.
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("exp_config is required")]
    MissingExpConfig,
    #[error("nproc_per_node must be at least 1")]
    ZeroWorkers,
    #[error("opts must be KEY VALUE pairs, got {0} entries")]
    OddOpts(usize),
}
