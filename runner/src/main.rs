use clap::{Parser, Subcommand};
use std::{path::PathBuf, process::ExitCode};
use stratus::{commands, config::ExperimentPaths, engine::EngineError, job::JobStatus};
use tracing::error;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "stratus", version)]
#[command(about = "Runs experiment workflows on HPC platforms")]
struct Cli {
    /// Directory holding the experiments
    #[arg(long, short = 'C', default_value = ".")]
    root: PathBuf,
    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(long, short, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the job graph from the experiment configuration
    Create {
        expid: String,
        /// Replace an existing job graph
        #[arg(long)]
        force: bool,
    },
    /// Run the experiment until every job is done
    Run { expid: String },
    /// Show status counts and, with --list, the matching jobs
    Status {
        expid: String,
        #[arg(long, short, value_name = "GLOB")]
        list: Option<String>,
    },
    /// Force jobs matching a glob into a status
    SetStatus {
        expid: String,
        #[arg(value_name = "GLOB")]
        pattern: String,
        status: JobStatus,
    },
    /// Reconcile the job graph with the completion markers on the platforms
    Recovery { expid: String },
}

fn execute(root: PathBuf, command: Commands) -> Result<u8, EngineError> {
    match command {
        Commands::Create { expid, force } => {
            let graph = commands::create(&ExperimentPaths::new(&root, &expid), force)?;
            println!("Created {} jobs for {expid}", graph.len());
            Ok(0)
        }
        Commands::Run { expid } => Ok(commands::run(&ExperimentPaths::new(&root, &expid))?.exit_status()),
        Commands::Status { expid, list } => {
            let summary = commands::status(&ExperimentPaths::new(&root, &expid), list.as_deref())?;
            print!("{summary}");
            Ok(0)
        }
        Commands::SetStatus {
            expid,
            pattern,
            status,
        } => {
            let changed = commands::set_status(&ExperimentPaths::new(&root, &expid), &pattern, status)?;
            for job in changed.iter() {
                println!("{job} -> {status}");
            }
            println!("{} jobs changed", changed.len());
            Ok(0)
        }
        Commands::Recovery { expid } => {
            let recovery = commands::recovery(&ExperimentPaths::new(&root, &expid))?;
            println!(
                "{} jobs completed, {} jobs reset",
                recovery.completed.len(),
                recovery.reset.len()
            );
            Ok(0)
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "stratus=debug" } else { "stratus=info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)))
        .with_writer(std::io::stderr)
        .init();

    match execute(cli.root, cli.command) {
        Ok(status) => ExitCode::from(status),
        Err(error) => {
            error!(code = error.code(), "{error}");
            ExitCode::from(error.exit_status())
        }
    }
}
