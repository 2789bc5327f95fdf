//! LSF batch-queue integration.
//!
//! Drives the external `bsub`/`bjobs`/`bkill` CLIs. The queue owns job
//! lifecycle; this module only assembles command lines and parses replies.

use std::process::Command;

use crate::config::JobConfig;

/// Observed state of a queued job, as reported by `bjobs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueStatus {
    /// Pending or suspended in the queue.
    Queued,
    /// Dispatched and running.
    Running,
    /// Finished with exit code 0.
    Done,
    /// Finished with a non-zero exit code, or killed.
    Exited,
    /// The queue no longer knows the job id.
    Unknown,
}

impl QueueStatus {
    /// Map an LSF `STAT` column value.
    fn from_stat(stat: &str) -> Self {
        match stat {
            "PEND" | "PSUSP" | "USUSP" | "SSUSP" | "WAIT" => Self::Queued,
            "RUN" => Self::Running,
            "DONE" => Self::Done,
            "EXIT" => Self::Exited,
            _ => Self::Unknown,
        }
    }
}

/// LSF submission front end.
pub struct Lsf {
    /// Submission command, normally `bsub`.
    bsub_bin: String,
}

impl Lsf {
    /// Create a new LSF front end.
    #[must_use]
    pub fn new(bsub_bin: impl Into<String>) -> Self {
        Self {
            bsub_bin: bsub_bin.into(),
        }
    }

    /// Check if the submission CLI is installed.
    #[must_use]
    pub fn available(&self) -> bool {
        Command::new("which")
            .arg(&self.bsub_bin)
            .output()
            .is_ok_and(|o| o.status.success())
    }

    /// Check configuration and return any problems.
    /// Returns None if everything is OK, Some(warning) if there's an issue.
    #[must_use]
    pub fn check_config(&self) -> Option<String> {
        if self.available() {
            None
        } else {
            Some(format!(
                "submission command '{}' not found in PATH",
                self.bsub_bin
            ))
        }
    }

    /// Submit a job to the queue and return the assigned job id.
    ///
    /// The environment pairs are set on the `bsub` invocation itself; LSF
    /// copies the submission environment into the job, which is how the
    /// original scripts propagated their exports.
    pub fn submit(
        &self,
        job: &JobConfig,
        python: &str,
        entry_point: &str,
        env: &[(String, String)],
    ) -> Result<u64, LsfError> {
        let args = submit_args(job, python, entry_point);

        tracing::debug!("Submitting: {} {}", self.bsub_bin, args.join(" "));

        let mut cmd = Command::new(&self.bsub_bin);
        cmd.args(&args);
        for (key, value) in env {
            cmd.env(key, value);
        }
        let output = cmd
            .output()
            .map_err(|e| LsfError::Io(self.bsub_bin.clone(), e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(LsfError::Command(
                self.bsub_bin.clone(),
                stderr.into_owned(),
            ));
        }

        let reply = String::from_utf8_lossy(&output.stdout);
        parse_job_id(&reply).ok_or_else(|| LsfError::ParseReply(reply.into_owned()))
    }

    /// Query the queue for a job's status.
    pub fn poll(&self, job_id: u64) -> Result<QueueStatus, LsfError> {
        let output = Command::new("bjobs")
            .args(["-noheader", "-o", "stat", &job_id.to_string()])
            .output()
            .map_err(|e| LsfError::Io("bjobs".to_string(), e))?;

        // bjobs reports unknown ids on stderr with an empty stdout
        let stat = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if stat.is_empty() {
            return Ok(QueueStatus::Unknown);
        }
        Ok(QueueStatus::from_stat(&stat))
    }

    /// Kill a queued or running job.
    pub fn kill(&self, job_id: u64) -> Result<(), LsfError> {
        tracing::info!("Killing cluster job {}", job_id);

        let output = Command::new("bkill")
            .arg(job_id.to_string())
            .output()
            .map_err(|e| LsfError::Io("bkill".to_string(), e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(LsfError::Command("bkill".to_string(), stderr.into_owned()));
        }

        Ok(())
    }
}

/// Build the full `bsub` argument vector for a job.
#[must_use]
pub fn submit_args(job: &JobConfig, python: &str, entry_point: &str) -> Vec<String> {
    let mut args = job.resources.to_bsub_args();
    args.extend(["-J".into(), job.name.clone()]);
    args.push(python.to_string());
    args.extend(job.launch.to_launcher_args(entry_point));
    args
}

/// Extract the numeric id from an LSF acknowledgement,
/// e.g. `Job <190423> is submitted to queue <gpu.24h>.`
fn parse_job_id(reply: &str) -> Option<u64> {
    let rest = reply.split_once("Job <")?.1;
    let id = rest.split_once('>')?.0;
    id.parse().ok()
}

/// Errors that can occur talking to the queue.
#[derive(Debug, thiserror::Error)]
pub enum LsfError {
    #[error("failed to run {0}: {1}")]
    Io(String, std::io::Error),
    #[error("{0} failed: {1}")]
    Command(String, String),
    #[error("could not parse job id from bsub reply: {0:?}")]
    ParseReply(String),
}

#[cfg(test)]
mod tests {
    use vln_config::{LaunchParams, ResourceProfile};

    use super::*;

    fn job() -> JobConfig {
        JobConfig {
            name: "waypoint-train".to_string(),
            launch: LaunchParams {
                exp_config: "config/experiments/waypoint.yaml".to_string(),
                nproc_per_node: Some(2),
                ..Default::default()
            },
            resources: ResourceProfile {
                gpus: 2,
                gpu_model: Some("GeForceRTX2080Ti".to_string()),
                ..Default::default()
            },
            checkpoint_dir: None,
            out: None,
        }
    }

    #[test]
    fn test_submit_args() {
        let args = submit_args(&job(), "python3", "run.py");
        let line = args.join(" ");
        assert_eq!(
            line,
            "-n 16 -W 24:00 -R rusage[mem=4096,ngpus_excl_p=2] \
             -R select[gpu_model0==GeForceRTX2080Ti] -J waypoint-train \
             python3 -m torch.distributed.launch --nproc_per_node=2 run.py \
             --exp-config config/experiments/waypoint.yaml --run-type train"
        );
    }

    #[test]
    fn test_parse_job_id() {
        assert_eq!(
            parse_job_id("Job <190423> is submitted to queue <gpu.24h>.\n"),
            Some(190423)
        );
        assert_eq!(parse_job_id("Request aborted by esub."), None);
        assert_eq!(parse_job_id(""), None);
    }

    #[test]
    fn test_queue_status_mapping() {
        assert_eq!(QueueStatus::from_stat("PEND"), QueueStatus::Queued);
        assert_eq!(QueueStatus::from_stat("USUSP"), QueueStatus::Queued);
        assert_eq!(QueueStatus::from_stat("RUN"), QueueStatus::Running);
        assert_eq!(QueueStatus::from_stat("DONE"), QueueStatus::Done);
        assert_eq!(QueueStatus::from_stat("EXIT"), QueueStatus::Exited);
        assert_eq!(QueueStatus::from_stat("ZOMBI"), QueueStatus::Unknown);
    }
}
