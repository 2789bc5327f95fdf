//! VLN Submission Harness CLI
//!
//! Turns a pile of near-identical bsub launcher scripts into one TOML file:
//! submits navigation training experiments to an LSF queue, runs them
//! locally when no queue is available, and tracks job state across
//! invocations.

use clap::{Parser, Subcommand};
use tracing_indicatif::IndicatifLayer;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};
use vln_harness::{
    bsub::Lsf,
    config::HarnessConfig,
    scheduler::Scheduler,
    state::{JobStatus, StateManager},
};

#[derive(Parser)]
#[command(
    name = "vln-harness",
    about = "Cluster submission harness for VLN training experiments"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run jobs locally through the scheduling loop
    Run {
        /// Path to harness.toml config file
        #[arg(short, long, default_value = "harness.toml")]
        config: String,

        /// Dry run mode (print launch commands, no execution)
        #[arg(long)]
        dry_run: bool,
    },

    /// Submit jobs to the cluster queue via bsub
    Submit {
        /// Path to harness.toml config file
        #[arg(short, long, default_value = "harness.toml")]
        config: String,

        /// Poll bjobs until all jobs reach a terminal state
        #[arg(long)]
        wait: bool,

        /// Dry run mode (print bsub commands, no submission)
        #[arg(long)]
        dry_run: bool,
    },

    /// Show status of jobs
    Status {
        /// Path to harness.toml config file
        #[arg(short, long, default_value = "harness.toml")]
        config: String,

        /// Reconcile with bjobs before printing
        #[arg(long)]
        refresh: bool,
    },

    /// Kill queued/running cluster jobs
    Kill {
        /// Path to harness.toml config file
        #[arg(short, long, default_value = "harness.toml")]
        config: String,

        /// Job names to kill (all queued jobs if omitted)
        jobs: Vec<String>,
    },

    /// Reset specific jobs to pending
    Reset {
        /// Path to harness.toml config file
        #[arg(short, long, default_value = "harness.toml")]
        config: String,

        /// Job names to reset
        jobs: Vec<String>,
    },
}

fn print_plan(
    scheduler: &Scheduler,
    cluster: bool,
    config: &HarnessConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    let plan = scheduler.plan(cluster)?;

    println!("=== Dry Run ===");
    for (key, value) in config.harness.env_vars() {
        println!("export {key}={value}");
    }
    println!();

    println!("Will launch {} jobs:", plan.planned.len());
    for job in &plan.planned {
        println!("  - {}", job.name);
        println!("      {}", job.command);
    }

    if !plan.held.is_empty() {
        println!();
        println!("Already finished or in flight:");
        for name in &plan.held {
            println!("  - {name}");
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // tracing needs to be initialized with indicatif_layer to not clobber progress bars
    let indicatif_layer = IndicatifLayer::new();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(indicatif_layer.get_stderr_writer()))
        .with(
            EnvFilter::builder()
                .with_default_directive(tracing::Level::INFO.into())
                .from_env_lossy(),
        )
        .with(indicatif_layer)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config, dry_run } => {
            let harness_config = HarnessConfig::load(&config)?;
            let state_manager = StateManager::new(&harness_config.harness.state_file);
            let scheduler = Scheduler::new(harness_config.clone(), state_manager);

            if dry_run {
                print_plan(&scheduler, false, &harness_config)?;
            } else {
                println!("Starting harness with config: {config}");
                let result = scheduler.run().await?;

                println!();
                println!("=== Harness Complete ===");
                println!("Total: {}", result.total);
                println!("Completed: {}", result.completed);
                println!("Failed: {}", result.failed);
                println!("Skipped: {}", result.skipped);
            }
        }

        Commands::Submit {
            config,
            wait,
            dry_run,
        } => {
            let harness_config = HarnessConfig::load(&config)?;
            let state_manager = StateManager::new(&harness_config.harness.state_file);
            let scheduler = Scheduler::new(harness_config.clone(), state_manager);

            if dry_run {
                print_plan(&scheduler, true, &harness_config)?;
                return Ok(());
            }

            // Check queue config and fail early if misconfigured
            let lsf = Lsf::new(harness_config.harness.bsub_bin.clone());
            if let Some(warning) = lsf.check_config() {
                eprintln!("ERROR: {warning}");
                eprintln!("Install the LSF client tools or set [harness] bsub_bin");
                return Err(warning.into());
            }

            let summary = scheduler.submit_all()?;
            println!(
                "Submitted {} of {} jobs ({} failed)",
                summary.submitted, summary.total, summary.failed
            );

            if wait {
                println!(
                    "Waiting for cluster jobs (polling every {}s)...",
                    harness_config.harness.poll_interval_secs
                );
                let result = scheduler.wait_for_queue().await?;

                println!();
                println!("=== Queue Drained ===");
                println!("Total: {}", result.total);
                println!("Completed: {}", result.completed);
                println!("Failed: {}", result.failed);
                println!("Skipped: {}", result.skipped);
            }
        }

        Commands::Status { config, refresh } => {
            let harness_config = HarnessConfig::load(&config)?;
            let state_manager = StateManager::new(&harness_config.harness.state_file);

            if refresh {
                let scheduler =
                    Scheduler::new(harness_config.clone(), StateManager::new(&state_manager.path));
                scheduler.refresh()?;
            }

            let submit_state = state_manager.load()?;

            if submit_state.jobs.is_empty() {
                println!("No jobs in state file.");
                return Ok(());
            }

            println!("=== Job Status ===");
            println!();

            let mut jobs: Vec<_> = submit_state.jobs.iter().collect();
            jobs.sort_by_key(|(name, _)| *name);

            for (name, job) in jobs {
                let status = match job.status {
                    JobStatus::Pending => "PENDING",
                    JobStatus::Submitted => "SUBMITTED",
                    JobStatus::Running => "RUNNING",
                    JobStatus::Completed => "COMPLETED",
                    JobStatus::Failed => "FAILED",
                    JobStatus::Skipped => "SKIPPED",
                };

                print!("{name}: {status}");

                if let Some(id) = job.lsf_job_id {
                    print!(" (job <{id}>)");
                }

                if let Some(pid) = job.pid {
                    print!(" (PID: {pid})");
                }

                if let Some(ckpt) = job.checkpoint {
                    print!(" [ckpt.{ckpt}.pth]");
                }

                if job.retry_count > 0 {
                    print!(" [retries: {}]", job.retry_count);
                }

                println!();

                if !job.errors.is_empty() {
                    for error in &job.errors {
                        println!("  Error: {error}");
                    }
                }
            }
        }

        Commands::Kill { config, jobs } => {
            let harness_config = HarnessConfig::load(&config)?;
            let state_manager = StateManager::new(&harness_config.harness.state_file);
            let scheduler = Scheduler::new(harness_config, state_manager);

            let filter = if jobs.is_empty() {
                None
            } else {
                Some(jobs.as_slice())
            };
            let killed = scheduler.kill_jobs(filter)?;
            println!("Killed {killed} cluster jobs");
        }

        Commands::Reset { config, jobs } => {
            let harness_config = HarnessConfig::load(&config)?;
            let state_manager = StateManager::new(&harness_config.harness.state_file);

            for name in &jobs {
                match state_manager.reset_job(name) {
                    Ok(true) => println!("Reset: {name}"),
                    Ok(false) => println!("Not found: {name}"),
                    Err(e) => eprintln!("Error resetting {name}: {e}"),
                }
            }
        }
    }

    Ok(())
}
