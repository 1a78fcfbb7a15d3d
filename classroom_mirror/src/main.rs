//! classroom-mirror CLI - Download Google Classroom materials.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use inquire::MultiSelect;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};
use tracing_subscriber::EnvFilter;

use classroom_mirror::{
    AuthSession, Config, Course, GoogleClient, MirrorOptions, Orchestrator, RunSummary, Selection,
};

type RunResult<T> = classroom_mirror::Result<T>;

/// Mirror Google Classroom courses and Drive folders to a local directory.
#[derive(Parser)]
#[command(name = "classroom-mirror")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to a TOML config file.
    #[arg(long, short = 'c', env = "CLASSROOM_MIRROR_CONFIG")]
    config: Option<PathBuf>,

    /// Output directory (overrides download.root).
    #[arg(long, short = 'o')]
    out: Option<PathBuf>,

    /// Service account key file (overrides auth.service_account_path).
    #[arg(long, env = "GOOGLE_APPLICATION_CREDENTIALS")]
    credentials: Option<PathBuf>,

    /// Number of concurrent downloads.
    #[arg(long, short = 'j')]
    concurrency: Option<usize>,

    /// Enable debug logging.
    #[arg(long, short = 'v')]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Mirror Classroom courses.
    Courses {
        /// Courses to mirror, by number: "all", "2", "1,3", "2-4".
        #[arg(long, short = 's')]
        select: Option<String>,

        /// Only list the courses.
        #[arg(long)]
        list: bool,
    },

    /// Mirror Drive folders or files.
    Drive {
        /// Folder or file URLs or IDs.
        #[arg(required = true)]
        references: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut config = Config::load_or_default(cli.config.as_deref()).context("Failed to load config")?;
    if let Some(out) = cli.out {
        config.download.root = out;
    }
    if let Some(credentials) = cli.credentials {
        config.auth.service_account_path = Some(credentials);
    }
    if let Some(concurrency) = cli.concurrency {
        config.download.concurrency = concurrency;
    }
    config.validate().context("Invalid configuration")?;

    let auth = match &config.auth.service_account_path {
        Some(path) => AuthSession::from_service_account_file(path, config.auth.subject.clone())
            .with_context(|| format!("Failed to load service account key from {:?}", path))?,
        None => AuthSession::from_files(&config.auth.token_path, Some(config.auth.client_secret_path.as_path()))
            .with_context(|| format!("Failed to load OAuth client from {:?}", config.auth.client_secret_path))?,
    };

    let client = Arc::new(GoogleClient::new(Arc::new(auth), Arc::new(config.rate_limiter())));
    let cancel = CancellationToken::new();
    spawn_interrupt_handler(cancel.clone());

    let mirror = Orchestrator::new(
        client.clone(),
        client.clone(),
        client,
        MirrorOptions::from_config(&config),
        cancel,
    );

    match cli.command {
        Commands::Courses { select, list } => {
            let Some(courses) = settle(mirror.list_courses().await, "Failed to list courses")? else {
                return Ok(());
            };

            if courses.is_empty() {
                println!("No courses found.");
                return Ok(());
            }

            if list {
                print_courses(&courses);
                return Ok(());
            }

            let selected: Vec<Course> = match select {
                Some(select) => {
                    let selection: Selection = select.parse().context("Invalid --select")?;
                    selection
                        .apply(&courses)
                        .context("Invalid --select")?
                        .into_iter()
                        .cloned()
                        .collect()
                }
                None => match MultiSelect::new("Select courses to download:", courses).prompt() {
                    Ok(selected) => selected,
                    Err(e) => {
                        println!("No courses selected ({}).", e);
                        return Ok(());
                    }
                },
            };

            if selected.is_empty() {
                println!("No courses selected.");
                return Ok(());
            }

            println!(
                "Mirroring {} course(s) to {:?}...",
                selected.len(),
                mirror.options().root
            );
            if let Some(summary) = settle(mirror.mirror_courses(&selected).await, "Mirroring stopped")? {
                print_summary(&summary);
            }
        }

        Commands::Drive { references } => {
            println!(
                "Mirroring {} Drive item(s) to {:?}...",
                references.len(),
                mirror.options().root
            );
            if let Some(summary) = settle(mirror.mirror_drive(&references).await, "Mirroring stopped")? {
                print_summary(&summary);
            }
        }
    }

    Ok(())
}

/// Only authorization failures end the process with an error; anything
/// else is reported and the process exits normally.
fn settle<T>(result: RunResult<T>, what: &str) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.is_fatal() => Err(anyhow::Error::new(e).context(what.to_string())),
        Err(e) => {
            error!(error = %e, "{}", what);
            eprintln!("{}: {}", what, e);
            Ok(None)
        }
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose {
        "classroom_mirror=debug"
    } else {
        "classroom_mirror=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Cancel the run on Ctrl-C; queued downloads are then not started.
fn spawn_interrupt_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, finishing up");
            cancel.cancel();
        }
    });
}

fn print_courses(courses: &[Course]) {
    println!("{:>4}  {}", "#", "COURSE");
    println!("{}", "-".repeat(60));
    for (idx, course) in courses.iter().enumerate() {
        println!("{:>4}  {}", idx + 1, course);
    }
}

fn print_summary(summary: &RunSummary) {
    println!();
    println!("Summary");
    println!("{}", "-".repeat(40));
    print!("{}", summary);
    if summary.has_failures() {
        println!("Re-run the same command to retry failed items.");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use classroom_mirror::MirrorError;

    #[test]
    fn test_auth_failure_is_an_error_exit() {
        let result: RunResult<()> = Err(MirrorError::Auth("revoked".into()));
        assert!(settle(result, "Mirroring stopped").is_err());
    }

    #[test]
    fn test_other_failures_exit_normally() {
        let transient: RunResult<()> = Err(MirrorError::Transient {
            status: Some(503),
            message: "backend error".into(),
        });
        assert!(matches!(settle(transient, "Failed to list courses"), Ok(None)));

        let io: RunResult<()> = Err(MirrorError::Io(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "read-only",
        )));
        assert!(matches!(settle(io, "Mirroring stopped"), Ok(None)));
    }

    #[test]
    fn test_success_passes_through() {
        assert!(matches!(settle(Ok(3), "x"), Ok(Some(3))));
    }
}
