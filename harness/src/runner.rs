//! Subprocess execution for local (non-queued) launches.

use std::{
    collections::VecDeque,
    path::Path,
    process::Stdio,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use tokio::{
    fs::OpenOptions,
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::{Child, Command},
    sync::watch,
};

use crate::{
    config::JobConfig,
    state::{StateError, StateManager, now_timestamp},
};

/// Result of a local launch.
#[derive(Debug)]
pub struct RunResult {
    /// Job name.
    pub name: String,
    /// Whether the launch succeeded.
    pub success: bool,
    /// Exit code if available.
    pub exit_code: Option<i32>,
    /// Error message if failed.
    pub error: Option<String>,
    /// Latest checkpoint index if a checkpoint directory is configured.
    pub checkpoint: Option<usize>,
}

/// Progress update parsed from trainer output.
///
/// The external trainer logs `update: <n>` and `frames: <n>` lines through
/// the habitat logger; total counts live in the opaque experiment YAML, so
/// progress is indeterminate.
#[derive(Debug, Clone, Default)]
pub struct ProgressUpdate {
    pub update: Option<usize>,
    pub frames: Option<usize>,
}

fn extract_field(s: &str, key: &str) -> Option<usize> {
    let idx = s.find(key)?;
    let rest = &s[idx + key.len()..];
    rest.trim_start_matches(|c: char| !c.is_ascii_digit())
        .split(|c: char| !c.is_ascii_digit())
        .next()?
        .parse()
        .ok()
}

impl ProgressUpdate {
    /// Parse from a trainer log line.
    fn parse(line: &str) -> Option<Self> {
        let update = extract_field(line, "update:");
        let frames = extract_field(line, "frames:");
        if update.is_none() && frames.is_none() {
            return None;
        }
        Some(Self { update, frames })
    }
}

/// Manages subprocess execution for local launches.
pub struct Runner {
    /// Interpreter used to launch the entry point.
    python: String,
    /// Training entry point, relative to the working directory.
    entry_point: String,
    /// Working directory for every launch.
    workdir: String,
    /// Environment exported to every launch.
    env: Vec<(String, String)>,
    /// State manager for persistence.
    state_manager: StateManager,
}

impl Runner {
    /// Create a new runner.
    #[must_use]
    pub fn new(
        python: impl Into<String>,
        entry_point: impl Into<String>,
        workdir: impl Into<String>,
        env: Vec<(String, String)>,
        state_manager: StateManager,
    ) -> Self {
        Self {
            python: python.into(),
            entry_point: entry_point.into(),
            workdir: workdir.into(),
            env,
            state_manager,
        }
    }

    /// Check that the entry point exists under the working directory.
    #[must_use]
    pub fn entry_point_exists(&self) -> bool {
        Path::new(&self.workdir).join(&self.entry_point).exists()
    }

    /// Spawn a job as a local subprocess.
    pub fn spawn(&self, job: &JobConfig) -> Result<RunHandle, RunError> {
        let args = job.launch.to_launcher_args(&self.entry_point);

        tracing::debug!("Spawning: {} {}", self.python, args.join(" "));

        let mut cmd = Command::new(&self.python);
        cmd.args(&args)
            .current_dir(&self.workdir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        let child = cmd
            .spawn()
            .map_err(|e| RunError::Spawn(job.name.clone(), e))?;

        let pid = child
            .id()
            .ok_or_else(|| RunError::Spawn(job.name.clone(), std::io::Error::other("no PID")))?;

        // Mark as started in state
        self.state_manager
            .mark_started(&job.name, pid)
            .map_err(RunError::State)?;

        Ok(RunHandle {
            name: job.name.clone(),
            log_dir: job.log_dir(),
            checkpoint_dir: job.checkpoint_dir.clone(),
            child,
            pid,
        })
    }

    /// Wait for a job to complete and update state, sending progress updates.
    ///
    /// If `last_activity` is provided, it is updated (unix seconds) on every
    /// stdout/stderr line so an external watchdog can detect idle processes.
    pub async fn wait(
        &self,
        mut handle: RunHandle,
        progress_tx: Option<Arc<watch::Sender<ProgressUpdate>>>,
        last_activity: Option<Arc<AtomicU64>>,
    ) -> RunResult {
        // Create log directory
        let log_dir = Path::new(&handle.log_dir);
        let _ = tokio::fs::create_dir_all(log_dir).await;

        let stdout_path = log_dir.join("stdout.log");
        let stderr_path = log_dir.join("stderr.log");

        let timestamp = now_timestamp();

        // Stream stdout to file and parse for progress
        let stdout = handle.child.stdout.take();
        let stdout_task = if let Some(stdout) = stdout {
            let path = stdout_path.clone();
            let ts = timestamp.clone();
            let activity = last_activity.clone();
            Some(tokio::spawn(async move {
                let reader = BufReader::new(stdout);
                let mut lines = reader.lines();
                let mut file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&path)
                    .await
                    .ok();

                // Write retry separator if file already has content
                if let Some(ref mut f) = file
                    && f.metadata().await.is_ok_and(|m| m.len() > 0)
                {
                    let _ = f
                        .write_all(format!("\n--- retry at {ts} ---\n\n").as_bytes())
                        .await;
                }

                while let Ok(Some(line)) = lines.next_line().await {
                    if let Some(ref a) = activity {
                        a.store(unix_now(), Ordering::Relaxed);
                    }
                    if let Some(ref mut f) = file {
                        let _ = f.write_all(line.as_bytes()).await;
                        let _ = f.write_all(b"\n").await;
                    }

                    // Parse progress from output
                    if let Some(ref tx) = progress_tx
                        && let Some(update) = ProgressUpdate::parse(&line)
                    {
                        let _ = tx.send(update);
                    }
                }
            }))
        } else {
            None
        };

        // Stream stderr to file and keep last 20 lines for error reporting
        let stderr = handle.child.stderr.take();
        let stderr_task = if let Some(stderr) = stderr {
            let path = stderr_path.clone();
            let ts = timestamp;
            let activity = last_activity;
            Some(tokio::spawn(async move {
                let reader = BufReader::new(stderr);
                let mut lines = reader.lines();
                let mut file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&path)
                    .await
                    .ok();

                // Write retry separator if file already has content
                if let Some(ref mut f) = file
                    && f.metadata().await.is_ok_and(|m| m.len() > 0)
                {
                    let _ = f
                        .write_all(format!("\n--- retry at {ts} ---\n\n").as_bytes())
                        .await;
                }

                let mut tail = VecDeque::with_capacity(20);
                while let Ok(Some(line)) = lines.next_line().await {
                    if let Some(ref a) = activity {
                        a.store(unix_now(), Ordering::Relaxed);
                    }
                    if let Some(ref mut f) = file {
                        let _ = f.write_all(line.as_bytes()).await;
                        let _ = f.write_all(b"\n").await;
                    }
                    if tail.len() >= 20 {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
                tail.into_iter().collect::<Vec<_>>()
            }))
        } else {
            None
        };

        // Wait for process
        let status = handle.child.wait().await;

        // Wait for log tasks
        if let Some(task) = stdout_task {
            let _ = task.await;
        }
        let stderr_output = if let Some(task) = stderr_task {
            task.await.ok()
        } else {
            None
        };

        let checkpoint = handle
            .checkpoint_dir
            .as_deref()
            .and_then(StateManager::find_checkpoint);

        match status {
            Ok(status) if status.success() => {
                if let Err(e) = self.state_manager.mark_completed(&handle.name, checkpoint) {
                    tracing::error!("Failed to mark {} as completed: {}", handle.name, e);
                }
                RunResult {
                    name: handle.name,
                    success: true,
                    exit_code: status.code(),
                    error: None,
                    checkpoint,
                }
            }
            Ok(status) => {
                let error_msg = stderr_output.map_or_else(
                    || format!("Exit code: {:?}", status.code()),
                    |lines| lines.join("\n"),
                );
                if let Err(e) = self
                    .state_manager
                    .mark_failed(&handle.name, &error_msg, checkpoint)
                {
                    tracing::error!("Failed to mark {} as failed: {}", handle.name, e);
                }
                RunResult {
                    name: handle.name,
                    success: false,
                    exit_code: status.code(),
                    error: Some(error_msg),
                    checkpoint,
                }
            }
            Err(e) => {
                let error_msg = format!("Process error: {e}");
                if let Err(e) = self
                    .state_manager
                    .mark_failed(&handle.name, &error_msg, checkpoint)
                {
                    tracing::error!("Failed to mark {} as failed: {}", handle.name, e);
                }
                RunResult {
                    name: handle.name,
                    success: false,
                    exit_code: None,
                    error: Some(error_msg),
                    checkpoint,
                }
            }
        }
    }

    /// Get the state manager.
    #[must_use]
    pub fn state_manager(&self) -> &StateManager {
        &self.state_manager
    }
}

/// Get current unix timestamp in seconds.
fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Create a new last-activity tracker initialized to now.
#[must_use]
pub fn new_activity_tracker() -> Arc<AtomicU64> {
    Arc::new(AtomicU64::new(unix_now()))
}

/// Handle to a running subprocess.
pub struct RunHandle {
    /// Job name.
    pub name: String,
    /// Harness-side log capture directory.
    pub log_dir: String,
    /// Trainer checkpoint directory, if known.
    pub checkpoint_dir: Option<String>,
    /// Child process.
    child: Child,
    /// Process ID.
    pub pid: u32,
}

/// Errors that can occur when running a subprocess.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("failed to spawn process for {0}: {1}")]
    Spawn(String, std::io::Error),
    #[error("state error: {0}")]
    State(#[from] StateError),
}
