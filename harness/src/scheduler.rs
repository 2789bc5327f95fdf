//! Scheduling for local launches and batch-queue submission.

use std::{
    collections::HashSet,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use tokio::sync::{mpsc, watch};

use crate::{
    bsub::{Lsf, LsfError, QueueStatus, submit_args},
    config::{FailurePolicy, HarnessConfig, JobConfig},
    runner::{ProgressUpdate, RunError, RunResult, Runner, new_activity_tracker},
    state::{JobStatus, StateError, StateManager},
};

/// Scheduler for local launches and cluster submission.
pub struct Scheduler {
    config: HarnessConfig,
    jobs: Vec<JobConfig>,
    runner: Runner,
    lsf: Lsf,
}

/// A job with the exact command line it would be launched with.
#[derive(Debug, Clone)]
pub struct PlannedJob {
    pub name: String,
    pub command: String,
}

/// Result of a dry run.
#[derive(Debug)]
pub struct PlanResult {
    /// Jobs that would be launched, with their command lines.
    pub planned: Vec<PlannedJob>,
    /// Jobs already finished or in flight.
    pub held: Vec<String>,
}

/// Result of a batch submission pass.
#[derive(Debug)]
pub struct SubmitSummary {
    /// Total number of jobs.
    pub total: usize,
    /// Number submitted to the queue.
    pub submitted: usize,
    /// Number that failed to submit.
    pub failed: usize,
}

/// Result of a scheduler run.
#[derive(Debug)]
pub struct SchedulerResult {
    /// Total number of jobs.
    pub total: usize,
    /// Number of completed jobs.
    pub completed: usize,
    /// Number of failed jobs.
    pub failed: usize,
    /// Number of skipped jobs.
    pub skipped: usize,
}

impl Scheduler {
    /// Create a new scheduler.
    #[must_use]
    pub fn new(config: HarnessConfig, state_manager: StateManager) -> Self {
        let runner = Runner::new(
            config.harness.python.clone(),
            config.harness.entry_point.clone(),
            config.harness.workdir.clone(),
            config.harness.env_vars(),
            state_manager,
        );
        let lsf = Lsf::new(config.harness.bsub_bin.clone());
        let jobs = config.jobs.clone();
        Self {
            config,
            jobs,
            runner,
            lsf,
        }
    }

    /// Find next startable job that isn't already in flight.
    fn find_next_job(&self, running: &HashSet<String>) -> Option<JobConfig> {
        let state = self.runner.state_manager().load().ok()?;

        for job in &self.jobs {
            if running.contains(&job.name) {
                continue;
            }
            let can_start = state
                .jobs
                .get(&job.name)
                .is_none_or(|s| s.can_start(self.config.harness.max_retries));
            if can_start {
                return Some(job.clone());
            }
        }

        None
    }

    /// Check if all jobs are finished.
    fn all_finished(&self) -> bool {
        let Ok(state) = self.runner.state_manager().load() else {
            return false;
        };
        self.jobs.iter().all(|j| {
            state
                .jobs
                .get(&j.name)
                .is_some_and(|s| s.is_finished(self.config.harness.max_retries))
        })
    }

    /// Dry run: the exact command line each startable job would get.
    pub fn plan(&self, cluster: bool) -> Result<PlanResult, SchedulerError> {
        let state = self.runner.state_manager().load()?;
        let settings = &self.config.harness;

        let mut planned = Vec::new();
        let mut held = Vec::new();

        for job in &self.jobs {
            let can_start = state
                .jobs
                .get(&job.name)
                .is_none_or(|s| s.can_start(settings.max_retries));
            if !can_start {
                held.push(job.name.clone());
                continue;
            }

            let command = if cluster {
                let mut parts = vec![settings.bsub_bin.clone()];
                parts.extend(submit_args(job, &settings.python, &settings.entry_point));
                parts.join(" ")
            } else {
                let mut parts = vec![settings.python.clone()];
                parts.extend(job.launch.to_launcher_args(&settings.entry_point));
                parts.join(" ")
            };

            planned.push(PlannedJob {
                name: job.name.clone(),
                command,
            });
        }

        Ok(PlanResult { planned, held })
    }

    /// Run jobs locally with a slot-limited scheduling loop.
    pub async fn run(&self) -> Result<SchedulerResult, SchedulerError> {
        let state_manager = self.runner.state_manager();

        // Initialize state for all jobs
        state_manager.initialize_jobs(&self.jobs)?;

        // Recover any crashed local jobs
        let crashed = state_manager.recover_crashed_jobs()?;
        if !crashed.is_empty() {
            tracing::info!("Recovered {} crashed jobs: {:?}", crashed.len(), crashed);
        }

        if !self.runner.entry_point_exists() {
            return Err(SchedulerError::MissingEntryPoint(format!(
                "{}/{}",
                self.config.harness.workdir, self.config.harness.entry_point
            )));
        }

        let multi = MultiProgress::new();

        let mut running: HashSet<String> = HashSet::new();

        // Channel for completion notifications
        let (tx, mut rx) = mpsc::unbounded_channel::<RunResult>();

        let mut completed = 0;
        let mut failed = 0;
        let total = self.jobs.len();

        loop {
            // Fill free slots with jobs
            while running.len() < self.config.harness.max_parallel {
                let Some(job) = self.find_next_job(&running) else {
                    break;
                };

                let pb = multi.add(ProgressBar::new_spinner());
                pb.set_style(
                    ProgressStyle::default_spinner()
                        .template("{spinner:.green} [{elapsed_precise}] {msg}")
                        .unwrap(),
                );
                pb.set_message(format!("{:20}: starting...", job.name));

                match self.runner.spawn(&job) {
                    Ok(handle) => {
                        let name = handle.name.clone();
                        let pid = handle.pid;
                        pb.set_message(format!("{name:20}: starting (PID {pid})"));
                        pb.enable_steady_tick(std::time::Duration::from_millis(100));

                        running.insert(name.clone());

                        tracing::info!(
                            "Started {} ({}/{} slots)",
                            name,
                            running.len(),
                            self.config.harness.max_parallel
                        );

                        // Progress channel for this job
                        let (progress_tx, mut progress_rx) =
                            watch::channel(ProgressUpdate::default());
                        let progress_tx = Arc::new(progress_tx);

                        // Activity tracker for idle detection
                        let activity = new_activity_tracker();

                        // Task to update the spinner message. Totals live in
                        // the opaque experiment YAML, so the bar stays
                        // indeterminate and only echoes the latest counts.
                        let pb_clone = pb.clone();
                        let name_clone = name.clone();
                        tokio::spawn(async move {
                            let mut last_update = 0;
                            let mut last_frames = 0;

                            while progress_rx.changed().await.is_ok() {
                                let p = progress_rx.borrow().clone();
                                if let Some(update) = p.update {
                                    last_update = update;
                                }
                                if let Some(frames) = p.frames {
                                    last_frames = frames;
                                }
                                pb_clone.set_message(format!(
                                    "{name_clone:20}: update {last_update} ({last_frames} frames)"
                                ));
                            }
                        });

                        // Spawn watchdog for hang/idle detection
                        if self.config.harness.hang_timeout_secs.is_some()
                            || self.config.harness.idle_timeout_secs.is_some()
                        {
                            let hang_timeout = self.config.harness.hang_timeout_secs;
                            let idle_timeout = self.config.harness.idle_timeout_secs;
                            let not_before = unix_now() + self.config.harness.startup_grace_secs;
                            let watch_activity = activity.clone();
                            let watch_name = name.clone();
                            // Subscribe to progress for hang detection
                            let mut watch_progress = progress_tx.subscribe();
                            tokio::spawn(async move {
                                watchdog(
                                    &watch_name,
                                    pid,
                                    hang_timeout,
                                    idle_timeout,
                                    not_before,
                                    watch_activity,
                                    &mut watch_progress,
                                )
                                .await;
                            });
                        }

                        let tx = tx.clone();
                        let settings = self.config.harness.clone();

                        tokio::spawn(async move {
                            let sm = StateManager::new(&settings.state_file);
                            let env = settings.env_vars();
                            let runner = Runner::new(
                                settings.python,
                                settings.entry_point,
                                settings.workdir,
                                env,
                                sm,
                            );
                            let result =
                                runner.wait(handle, Some(progress_tx), Some(activity)).await;
                            pb.finish_with_message(format!(
                                "{:20}: {}",
                                name,
                                if result.success {
                                    "completed"
                                } else {
                                    "failed"
                                }
                            ));
                            let _ = tx.send(result);
                        });
                    }
                    Err(e) => {
                        tracing::error!("Failed to spawn {}: {}", job.name, e);
                        pb.finish_with_message(format!("{}: spawn failed", job.name));

                        match self.config.harness.on_failure {
                            FailurePolicy::Abort => return Err(SchedulerError::Run(e)),
                            FailurePolicy::Skip => {
                                state_manager.mark_skipped(&job.name, &e.to_string())?;
                                failed += 1;
                            }
                            FailurePolicy::Retry => {
                                // Bump retry_count so repeated spawn failures
                                // eventually exhaust instead of spinning
                                state_manager.mark_failed(&job.name, &e.to_string(), None)?;
                            }
                        }
                    }
                }
            }

            // Check if done
            if running.is_empty() {
                if self.all_finished() {
                    break;
                }
                // Nothing running but not finished - shouldn't happen normally
                tracing::warn!("No jobs active but not all finished");
                break;
            }

            // Wait for next completion
            let Some(result) = rx.recv().await else {
                break;
            };

            running.remove(&result.name);

            if result.success {
                completed += 1;
                tracing::info!("{} completed", result.name);
            } else {
                tracing::error!(
                    "{} failed: {}",
                    result.name,
                    result.error.as_deref().unwrap_or("unknown")
                );

                match self.config.harness.on_failure {
                    FailurePolicy::Abort => {
                        return Err(SchedulerError::JobFailed(
                            result.name,
                            result.error.unwrap_or_default(),
                        ));
                    }
                    FailurePolicy::Skip | FailurePolicy::Retry => {
                        let state = state_manager.load()?;
                        if let Some(job_state) = state.jobs.get(&result.name)
                            && job_state.retry_count >= self.config.harness.max_retries
                        {
                            if self.config.harness.on_failure == FailurePolicy::Skip {
                                state_manager
                                    .mark_skipped(&result.name, "max retries exceeded")?;
                            }
                            failed += 1;
                        }
                        // Otherwise will retry on next loop iteration
                    }
                }
            }
            // Loop continues - immediately try to fill freed slots
        }

        Ok(SchedulerResult {
            total,
            completed,
            failed,
            skipped: total - completed - failed,
        })
    }

    /// Submit every startable job to the cluster queue.
    pub fn submit_all(&self) -> Result<SubmitSummary, SchedulerError> {
        let state_manager = self.runner.state_manager();
        state_manager.initialize_jobs(&self.jobs)?;

        if let Some(warning) = self.lsf.check_config() {
            return Err(SchedulerError::Unavailable(warning));
        }

        let settings = &self.config.harness;
        let env = settings.env_vars();

        let mut submitted = 0;
        let mut failed = 0;

        let state = state_manager.load()?;
        for job in &self.jobs {
            let can_start = state
                .jobs
                .get(&job.name)
                .is_none_or(|s| s.can_start(settings.max_retries));
            if !can_start {
                continue;
            }

            match self
                .lsf
                .submit(job, &settings.python, &settings.entry_point, &env)
            {
                Ok(id) => {
                    state_manager.mark_submitted(&job.name, id)?;
                    tracing::info!("Submitted {} as cluster job {}", job.name, id);
                    submitted += 1;
                }
                Err(e) => {
                    tracing::error!("Failed to submit {}: {}", job.name, e);
                    match settings.on_failure {
                        FailurePolicy::Abort => return Err(SchedulerError::Queue(e)),
                        FailurePolicy::Skip => {
                            state_manager.mark_skipped(&job.name, &e.to_string())?;
                            failed += 1;
                        }
                        FailurePolicy::Retry => {
                            state_manager.mark_failed(&job.name, &e.to_string(), None)?;
                            failed += 1;
                        }
                    }
                }
            }
        }

        Ok(SubmitSummary {
            total: self.jobs.len(),
            submitted,
            failed,
        })
    }

    /// Poll the queue until every job reaches a terminal state, resubmitting
    /// retryable failures. Returns the final tallies.
    pub async fn wait_for_queue(&self) -> Result<SchedulerResult, SchedulerError> {
        let settings = &self.config.harness;
        let poll_interval = std::time::Duration::from_secs(settings.poll_interval_secs);

        while !self.all_finished() {
            tokio::time::sleep(poll_interval).await;
            self.refresh()?;
            self.resubmit_retryable()?;
        }

        let state = self.runner.state_manager().load()?;
        let mut completed = 0;
        let mut failed = 0;
        let mut skipped = 0;
        for job in &self.jobs {
            match state.jobs.get(&job.name).map(|s| s.status) {
                Some(JobStatus::Completed) => completed += 1,
                Some(JobStatus::Skipped) => skipped += 1,
                Some(JobStatus::Failed) => failed += 1,
                _ => {}
            }
        }

        Ok(SchedulerResult {
            total: self.jobs.len(),
            completed,
            failed,
            skipped,
        })
    }

    /// One `bjobs` pass: reconcile state with what the queue reports.
    pub fn refresh(&self) -> Result<(), SchedulerError> {
        let state_manager = self.runner.state_manager();
        let state = state_manager.load()?;

        for job in &self.jobs {
            let Some(job_state) = state.jobs.get(&job.name) else {
                continue;
            };
            if !job_state.in_queue() {
                continue;
            }
            let Some(id) = job_state.lsf_job_id else {
                continue;
            };

            let checkpoint = job
                .checkpoint_dir
                .as_deref()
                .and_then(StateManager::find_checkpoint);

            match self.lsf.poll(id)? {
                QueueStatus::Queued => {}
                QueueStatus::Running => {
                    if job_state.status == JobStatus::Submitted {
                        tracing::info!("{} is running as cluster job {}", job.name, id);
                        state_manager.mark_running(&job.name)?;
                    }
                }
                QueueStatus::Done => {
                    tracing::info!("{} completed as cluster job {}", job.name, id);
                    state_manager.mark_completed(&job.name, checkpoint)?;
                }
                QueueStatus::Exited => {
                    tracing::error!("{} exited as cluster job {}", job.name, id);
                    state_manager.mark_failed(&job.name, "cluster job exited", checkpoint)?;
                    self.apply_retry_exhaustion(&job.name)?;
                }
                QueueStatus::Unknown => {
                    tracing::warn!("cluster job {} for {} is gone from bjobs", id, job.name);
                    state_manager.mark_failed(
                        &job.name,
                        &format!("job {id} no longer known to bjobs"),
                        checkpoint,
                    )?;
                    self.apply_retry_exhaustion(&job.name)?;
                }
            }
        }

        Ok(())
    }

    /// Mark a freshly failed job skipped when retries are exhausted under
    /// the skip policy. Abort is handled by the caller's next pass.
    fn apply_retry_exhaustion(&self, name: &str) -> Result<(), SchedulerError> {
        let settings = &self.config.harness;
        if settings.on_failure != FailurePolicy::Skip {
            return Ok(());
        }
        let state = self.runner.state_manager().load()?;
        if let Some(job_state) = state.jobs.get(name)
            && job_state.status == JobStatus::Failed
            && job_state.retry_count >= settings.max_retries
        {
            self.runner
                .state_manager()
                .mark_skipped(name, "max retries exceeded")?;
        }
        Ok(())
    }

    /// Resubmit failed-but-retryable jobs under the retry policy.
    fn resubmit_retryable(&self) -> Result<(), SchedulerError> {
        let settings = &self.config.harness;
        if settings.on_failure != FailurePolicy::Retry {
            return Ok(());
        }

        let state_manager = self.runner.state_manager();
        let state = state_manager.load()?;
        let env = settings.env_vars();

        for job in &self.jobs {
            let retryable = state.jobs.get(&job.name).is_some_and(|s| {
                s.status == JobStatus::Failed && s.can_start(settings.max_retries)
            });
            if !retryable {
                continue;
            }

            match self
                .lsf
                .submit(job, &settings.python, &settings.entry_point, &env)
            {
                Ok(id) => {
                    state_manager.mark_submitted(&job.name, id)?;
                    tracing::info!("Resubmitted {} as cluster job {}", job.name, id);
                }
                Err(e) => {
                    tracing::error!("Failed to resubmit {}: {}", job.name, e);
                    state_manager.mark_failed(&job.name, &e.to_string(), None)?;
                }
            }
        }

        Ok(())
    }

    /// Kill queued/running cluster jobs, all or a named subset.
    pub fn kill_jobs(&self, names: Option<&[String]>) -> Result<usize, SchedulerError> {
        let state_manager = self.runner.state_manager();
        let state = state_manager.load()?;

        let mut killed = 0;
        for job in &self.jobs {
            if let Some(filter) = names
                && !filter.contains(&job.name)
            {
                continue;
            }
            let Some(job_state) = state.jobs.get(&job.name) else {
                continue;
            };
            if let Some(id) = job_state.lsf_job_id
                && job_state.in_queue()
            {
                self.lsf.kill(id)?;
                state_manager.mark_failed(&job.name, "killed by user", None)?;
                killed += 1;
            }
        }

        Ok(killed)
    }

    /// Get the state manager.
    #[must_use]
    pub fn state_manager(&self) -> &StateManager {
        self.runner.state_manager()
    }
}

/// Errors that can occur during scheduling.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("state error: {0}")]
    State(#[from] StateError),
    #[error("run error: {0}")]
    Run(#[from] RunError),
    #[error("queue error: {0}")]
    Queue(#[from] LsfError),
    #[error("queue unavailable: {0}")]
    Unavailable(String),
    #[error("entry point not found: {0}")]
    MissingEntryPoint(String),
    #[error("job {0} failed: {1}")]
    JobFailed(String, String),
}

/// Get current unix timestamp in seconds.
fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Watchdog that kills a local process if it hangs or goes idle.
///
/// - `hang_timeout`: seconds with no progress update (only active after the first update)
/// - `idle_timeout`: seconds with no stdout/stderr activity at all
/// - `not_before`: timestamp before which nothing is enforced; the simulator
///   boots silently for minutes
async fn watchdog(
    name: &str,
    pid: u32,
    hang_timeout: Option<u64>,
    idle_timeout: Option<u64>,
    not_before: u64,
    last_activity: Arc<AtomicU64>,
    progress_rx: &mut watch::Receiver<ProgressUpdate>,
) {
    const POLL_INTERVAL: std::time::Duration = std::time::Duration::from_secs(5);

    let mut got_first_progress = false;
    let mut last_progress_time = 0u64;

    loop {
        tokio::time::sleep(POLL_INTERVAL).await;

        let now = unix_now();

        // Respect the startup grace period
        if now < not_before {
            continue;
        }

        // Check if process is still alive
        let alive = unsafe { libc::kill(pid as i32, 0) } == 0;
        if !alive {
            return;
        }

        // Check for new progress updates (non-blocking)
        if progress_rx.has_changed().unwrap_or(false) {
            let _ = progress_rx.borrow_and_update();
            if !got_first_progress {
                got_first_progress = true;
            }
            last_progress_time = now;
        }

        // Hang detection: no progress update for too long (only after first update)
        if let Some(timeout) = hang_timeout
            && got_first_progress
            && now - last_progress_time > timeout
        {
            tracing::error!("{name}: no progress update for {timeout}s, killing (PID {pid})");
            unsafe { libc::kill(pid as i32, libc::SIGKILL) };
            return;
        }

        // Idle detection: no stdout/stderr activity at all
        if let Some(timeout) = idle_timeout {
            let last = last_activity.load(Ordering::Relaxed);
            if now - last > timeout {
                tracing::error!("{name}: no output activity for {timeout}s, killing (PID {pid})");
                unsafe { libc::kill(pid as i32, libc::SIGKILL) };
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::process::{Child, Command};

    use super::*;

    fn spawn_sleeper() -> (Child, u32) {
        let child = Command::new("sleep")
            .arg("3600")
            .spawn()
            .expect("failed to spawn sleep");
        let pid = child.id();
        (child, pid)
    }

    fn is_alive(pid: u32) -> bool {
        // Check /proc status - zombies are not "alive" for our purposes
        let Ok(status) = std::fs::read_to_string(format!("/proc/{pid}/status")) else {
            return false;
        };
        // Look for "State:" line - Z means zombie
        status
            .lines()
            .find(|l| l.starts_with("State:"))
            .is_some_and(|l| !l.contains("Z (zombie)"))
    }

    #[tokio::test]
    async fn test_watchdog_idle_timeout_kills_process() {
        let (_child, pid) = spawn_sleeper();
        assert!(is_alive(pid), "process should be alive initially");

        let last_activity = Arc::new(AtomicU64::new(unix_now() - 10)); // 10s in the past
        let (tx, mut rx) = watch::channel(ProgressUpdate::default());

        // Spawn watchdog with 1s idle timeout and no grace period
        let handle = tokio::spawn(async move {
            watchdog(
                "test",
                pid,
                None,    // no hang timeout
                Some(1), // 1s idle timeout
                0,       // no grace
                last_activity,
                &mut rx,
            )
            .await;
        });

        // Wait for watchdog to kill the process (poll interval is 5s, so need >5s)
        tokio::time::sleep(std::time::Duration::from_secs(8)).await;

        assert!(
            !is_alive(pid),
            "process should have been killed by idle timeout"
        );
        drop(tx);
        let _ = handle.await;
    }

    #[tokio::test]
    async fn test_watchdog_respects_startup_grace() {
        let (_child, pid) = spawn_sleeper();
        assert!(is_alive(pid), "process should be alive initially");

        // Grace extends 10s into the future
        let not_before = unix_now() + 10;
        let last_activity = Arc::new(AtomicU64::new(unix_now() - 100)); // very stale
        let (tx, mut rx) = watch::channel(ProgressUpdate::default());

        let watchdog_handle = tokio::spawn(async move {
            watchdog(
                "test",
                pid,
                None,
                Some(1), // 1s idle timeout - would trigger immediately if not for grace
                not_before,
                last_activity,
                &mut rx,
            )
            .await;
        });

        // Wait 6s - process should still be alive due to grace period
        tokio::time::sleep(std::time::Duration::from_secs(6)).await;
        assert!(
            is_alive(pid),
            "process should still be alive during grace period"
        );

        // Clean up
        unsafe { libc::kill(pid as i32, libc::SIGKILL) };
        watchdog_handle.abort();
        drop(tx);
    }

    #[tokio::test]
    async fn test_watchdog_no_hang_before_first_progress() {
        let (_child, pid) = spawn_sleeper();
        assert!(is_alive(pid), "process should be alive initially");

        let last_activity = Arc::new(AtomicU64::new(unix_now())); // keep fresh
        let (tx, mut rx) = watch::channel(ProgressUpdate::default());

        // Keep activity fresh
        let activity = last_activity.clone();
        let activity_handle = tokio::spawn(async move {
            loop {
                activity.store(unix_now(), Ordering::Relaxed);
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            }
        });

        let watchdog_handle = tokio::spawn(async move {
            watchdog(
                "test",
                pid,
                Some(1), // 1s hang timeout - but no progress sent yet
                None,
                0,
                last_activity,
                &mut rx,
            )
            .await;
        });

        // Wait 8s - process should still be alive because no progress was ever sent
        tokio::time::sleep(std::time::Duration::from_secs(8)).await;
        assert!(
            is_alive(pid),
            "process should still be alive - hang timeout only active after first progress"
        );

        // Clean up
        unsafe { libc::kill(pid as i32, libc::SIGKILL) };
        activity_handle.abort();
        watchdog_handle.abort();
        drop(tx);
    }
}
