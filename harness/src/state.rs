//! Job state tracking and persistence.
//!
//! Tracks the status of each submission and persists to JSON for crash
//! recovery and cross-invocation bookkeeping.

use std::{
    collections::HashMap,
    fs::File,
    io::{BufReader, BufWriter, Seek, SeekFrom},
    path::Path,
};

use fs2::FileExt;
use serde::{Deserialize, Serialize};

/// Status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Job has not started yet.
    Pending,
    /// Job was handed to the cluster queue but not observed running yet.
    Submitted,
    /// Job is currently executing.
    Running,
    /// Job completed successfully.
    Completed,
    /// Job failed (may be retried).
    Failed,
    /// Job was skipped (e.g., after max retries).
    Skipped,
}

/// State of a single job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobState {
    /// Current status.
    pub status: JobStatus,
    /// Harness-side log capture directory.
    pub log_dir: String,
    /// Cluster job id when submitted via bsub.
    pub lsf_job_id: Option<u64>,
    /// Process ID when running locally (for crash detection).
    pub pid: Option<u32>,
    /// Latest observed checkpoint index (`ckpt.N.pth`).
    pub checkpoint: Option<usize>,
    /// Number of retry attempts so far.
    pub retry_count: u32,
    /// Error messages from failures.
    #[serde(default)]
    pub errors: Vec<String>,
    /// Timestamp when job started.
    pub started_at: Option<String>,
    /// Timestamp when job completed/failed.
    pub finished_at: Option<String>,
}

impl JobState {
    /// Create a new pending job state.
    #[must_use]
    pub fn new(log_dir: String) -> Self {
        Self {
            status: JobStatus::Pending,
            log_dir,
            lsf_job_id: None,
            pid: None,
            checkpoint: None,
            retry_count: 0,
            errors: Vec::new(),
            started_at: None,
            finished_at: None,
        }
    }

    /// Check if this job can be started (pending or retryable).
    #[must_use]
    pub fn can_start(&self, max_retries: u32) -> bool {
        match self.status {
            JobStatus::Pending => true,
            JobStatus::Failed => self.retry_count < max_retries,
            _ => false,
        }
    }

    /// Check if this job is finished (completed, failed with max retries, or skipped).
    #[must_use]
    pub fn is_finished(&self, max_retries: u32) -> bool {
        match self.status {
            JobStatus::Completed | JobStatus::Skipped => true,
            JobStatus::Failed => self.retry_count >= max_retries,
            _ => false,
        }
    }

    /// Check if this job is in the cluster queue's hands.
    #[must_use]
    pub fn in_queue(&self) -> bool {
        matches!(self.status, JobStatus::Submitted | JobStatus::Running)
            && self.lsf_job_id.is_some()
    }
}

/// Persistent state for all jobs.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SubmitState {
    /// State of each job, keyed by job name.
    pub jobs: HashMap<String, JobState>,
    /// Version for future compatibility.
    #[serde(default = "default_version")]
    pub version: u32,
}

fn default_version() -> u32 {
    1
}

/// Manages state persistence with file locking.
pub struct StateManager {
    /// Path to the state file.
    pub path: std::path::PathBuf,
}

impl StateManager {
    /// Create a new state manager for the given path.
    #[must_use]
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Load state from file, or create empty state if file doesn't exist.
    pub fn load(&self) -> Result<SubmitState, StateError> {
        if !self.path.exists() {
            return Ok(SubmitState::default());
        }

        let file = File::open(&self.path).map_err(|e| StateError::Io(self.path.clone(), e))?;
        file.lock_shared()
            .map_err(|e| StateError::Lock(self.path.clone(), e))?;

        let reader = BufReader::new(&file);
        let state = serde_json::from_reader(reader)
            .map_err(|e| StateError::Parse(self.path.clone(), e.to_string()))?;

        file.unlock()
            .map_err(|e| StateError::Lock(self.path.clone(), e))?;

        Ok(state)
    }

    /// Save state to file with exclusive lock.
    pub fn save(&self, state: &SubmitState) -> Result<(), StateError> {
        // Create parent directories if needed
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StateError::Io(parent.to_path_buf(), e))?;
        }

        let file = File::create(&self.path).map_err(|e| StateError::Io(self.path.clone(), e))?;
        file.lock_exclusive()
            .map_err(|e| StateError::Lock(self.path.clone(), e))?;

        let writer = BufWriter::new(&file);
        serde_json::to_writer_pretty(writer, state)
            .map_err(|e| StateError::Write(self.path.clone(), e.to_string()))?;

        file.unlock()
            .map_err(|e| StateError::Lock(self.path.clone(), e))?;

        Ok(())
    }

    /// Update state atomically with a closure (holds lock for entire operation).
    pub fn update<F>(&self, f: F) -> Result<SubmitState, StateError>
    where
        F: FnOnce(&mut SubmitState),
    {
        // Create parent directories if needed
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StateError::Io(parent.to_path_buf(), e))?;
        }

        // Open with read+write, create if needed
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)
            .map_err(|e| StateError::Io(self.path.clone(), e))?;

        // Hold exclusive lock for entire operation
        file.lock_exclusive()
            .map_err(|e| StateError::Lock(self.path.clone(), e))?;

        // Read current state (or default if empty/new file)
        let mut state: SubmitState = if file.metadata().map(|m| m.len()).unwrap_or(0) > 0 {
            let reader = BufReader::new(&file);
            serde_json::from_reader(reader)
                .map_err(|e| StateError::Parse(self.path.clone(), e.to_string()))?
        } else {
            SubmitState::default()
        };

        // Apply the update
        f(&mut state);

        // Truncate and write back
        file.set_len(0)
            .map_err(|e| StateError::Io(self.path.clone(), e))?;
        (&file)
            .seek(SeekFrom::Start(0))
            .map_err(|e| StateError::Io(self.path.clone(), e))?;

        let writer = BufWriter::new(&file);
        serde_json::to_writer_pretty(writer, &state)
            .map_err(|e| StateError::Write(self.path.clone(), e.to_string()))?;

        file.unlock()
            .map_err(|e| StateError::Lock(self.path.clone(), e))?;

        Ok(state)
    }

    /// Initialize state for a set of jobs, preserving existing state.
    pub fn initialize_jobs(
        &self,
        jobs: &[crate::config::JobConfig],
    ) -> Result<SubmitState, StateError> {
        self.update(|state| {
            for job in jobs {
                state
                    .jobs
                    .entry(job.name.clone())
                    .or_insert_with(|| JobState::new(job.log_dir()));
            }
        })
    }

    /// Mark a job as submitted to the cluster queue.
    pub fn mark_submitted(&self, name: &str, lsf_job_id: u64) -> Result<(), StateError> {
        self.update(|state| {
            if let Some(job) = state.jobs.get_mut(name) {
                job.status = JobStatus::Submitted;
                job.lsf_job_id = Some(lsf_job_id);
                job.pid = None;
                job.started_at = Some(now_timestamp());
            }
        })?;
        Ok(())
    }

    /// Mark a job as started locally.
    pub fn mark_started(&self, name: &str, pid: u32) -> Result<(), StateError> {
        self.update(|state| {
            if let Some(job) = state.jobs.get_mut(name) {
                job.status = JobStatus::Running;
                job.pid = Some(pid);
                job.lsf_job_id = None;
                job.started_at = Some(now_timestamp());
            }
        })?;
        Ok(())
    }

    /// Mark a submitted job as observed running on the cluster.
    pub fn mark_running(&self, name: &str) -> Result<(), StateError> {
        self.update(|state| {
            if let Some(job) = state.jobs.get_mut(name) {
                job.status = JobStatus::Running;
            }
        })?;
        Ok(())
    }

    /// Mark a job as completed.
    pub fn mark_completed(&self, name: &str, checkpoint: Option<usize>) -> Result<(), StateError> {
        self.update(|state| {
            if let Some(job) = state.jobs.get_mut(name) {
                job.status = JobStatus::Completed;
                job.pid = None;
                job.checkpoint = checkpoint;
                job.finished_at = Some(now_timestamp());
            }
        })?;
        Ok(())
    }

    /// Mark a job as failed.
    pub fn mark_failed(
        &self,
        name: &str,
        error: &str,
        checkpoint: Option<usize>,
    ) -> Result<(), StateError> {
        self.update(|state| {
            if let Some(job) = state.jobs.get_mut(name) {
                job.status = JobStatus::Failed;
                job.pid = None;
                job.retry_count += 1;
                job.errors.push(error.to_string());
                job.finished_at = Some(now_timestamp());

                if checkpoint.is_some() {
                    job.checkpoint = checkpoint;
                }
            }
        })?;
        Ok(())
    }

    /// Mark a job as skipped.
    pub fn mark_skipped(&self, name: &str, reason: &str) -> Result<(), StateError> {
        self.update(|state| {
            if let Some(job) = state.jobs.get_mut(name) {
                job.status = JobStatus::Skipped;
                job.pid = None;
                job.errors.push(format!("Skipped: {reason}"));
                job.finished_at = Some(now_timestamp());
            }
        })?;
        Ok(())
    }

    /// Reset a job to pending state.
    pub fn reset_job(&self, name: &str) -> Result<bool, StateError> {
        let mut found = false;
        self.update(|state| {
            if let Some(job) = state.jobs.get_mut(name) {
                job.status = JobStatus::Pending;
                job.lsf_job_id = None;
                job.pid = None;
                job.retry_count = 0;
                job.errors.clear();
                job.started_at = None;
                job.finished_at = None;
                found = true;
            }
        })?;
        Ok(found)
    }

    /// Detect crashed local jobs (status=Running, local PID dead) and mark
    /// for retry. Cluster jobs are reconciled by `bjobs` polling, never here.
    pub fn recover_crashed_jobs(&self) -> Result<Vec<String>, StateError> {
        let mut crashed = Vec::new();

        self.update(|state| {
            for (name, job) in &mut state.jobs {
                if job.status == JobStatus::Running && job.lsf_job_id.is_none() {
                    let is_alive = job.pid.is_some_and(is_process_alive);
                    if !is_alive {
                        job.status = JobStatus::Failed;
                        job.pid = None;
                        job.errors
                            .push("Process crashed or harness restarted".to_string());
                        crashed.push(name.clone());
                    }
                }
            }
        })?;

        Ok(crashed)
    }

    /// Find the latest checkpoint index in a trainer checkpoint directory.
    ///
    /// The external DD-PPO trainer writes `ckpt.N.pth` files.
    #[must_use]
    pub fn find_checkpoint(checkpoint_dir: &str) -> Option<usize> {
        std::fs::read_dir(checkpoint_dir)
            .ok()?
            .filter_map(std::result::Result::ok)
            .filter_map(|e| {
                let name = e.file_name().to_string_lossy().to_string();
                name.strip_prefix("ckpt.")?
                    .strip_suffix(".pth")?
                    .parse()
                    .ok()
            })
            .max()
    }
}

/// Check if a process is alive by PID.
fn is_process_alive(pid: u32) -> bool {
    // On Unix, send signal 0 to check if process exists
    #[cfg(unix)]
    {
        // kill -0 checks if process exists without sending a signal
        // SAFETY: kill with signal 0 is safe and just checks process existence
        unsafe { libc::kill(pid as i32, 0) == 0 }
    }

    #[cfg(not(unix))]
    {
        panic!("Non-Unix platform not supported")
    }
}

/// Get current time as a local timestamp string.
#[must_use]
pub fn now_timestamp() -> String {
    chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Errors that can occur with state management.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("failed to read/write state file {0}: {1}")]
    Io(std::path::PathBuf, std::io::Error),
    #[error("failed to lock state file {0}: {1}")]
    Lock(std::path::PathBuf, std::io::Error),
    #[error("failed to parse state file {0}: {1}")]
    Parse(std::path::PathBuf, String),
    #[error("failed to write state file {0}: {1}")]
    Write(std::path::PathBuf, String),
}
