//! Sandcastle CLI: the main entry point.
//!
//! Commands:
//! - `init`     Write default config, policy, and task board
//! - `run`      Execute a task with a scripted provider
//! - `check`    Ask the policy about a path or command
//! - `exec`     Run one command through the supervised runner
//! - `tail`     Show the end of a command log
//! - `policy`   Print the effective policy
//! - `redact`   Scrub secrets from stdin

use std::path::PathBuf;

use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(
    name = "sandcastle",
    about = "Sandcastle — policy-bounded execution sandbox for coding agents",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Project root (defaults to the config file, then the current directory)
    #[arg(short, long, global = true, env = "SANDCASTLE_PROJECT_ROOT")]
    project: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Write default config, policy, and an empty task board
    Init,

    /// Execute a task with responses replayed from a script file
    Run {
        /// Task id on the board
        #[arg(short, long)]
        task: String,

        /// Task board file (defaults to <project>/.sandcastle/tasks.json)
        #[arg(long)]
        tasks: Option<PathBuf>,

        /// JSON array of scripted provider responses
        #[arg(short, long)]
        script: PathBuf,
    },

    /// Check a path or command against the policy
    Check {
        #[command(subcommand)]
        target: CheckTarget,
    },

    /// Run a command through the supervised process runner
    Exec {
        /// The command line
        cmd: String,

        /// Working directory relative to the project root
        #[arg(long)]
        cwd: Option<String>,

        /// Timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,

        /// Task id the log is filed under
        #[arg(long, default_value = "manual")]
        task: String,
    },

    /// Show the last lines of a command log
    Tail {
        #[arg(long)]
        task: String,

        #[arg(long)]
        run: String,

        #[arg(short, default_value_t = 50)]
        n: usize,
    },

    /// Print the effective policy
    Policy,

    /// Read stdin and print it with secrets redacted
    Redact,
}

#[derive(Subcommand)]
enum CheckTarget {
    /// Validate a path for reading (or writing with --write)
    Path {
        path: String,

        #[arg(long)]
        write: bool,
    },

    /// Validate a shell command
    Command { cmd: String },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = if cli.verbose { "debug" } else { "info" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter));
    if cli.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init();
    }

    let project = cli.project;
    match cli.command {
        Commands::Init => commands::init::run(project).await?,
        Commands::Run {
            task,
            tasks,
            script,
        } => commands::run::run(project, task, tasks, script).await?,
        Commands::Check { target } => match target {
            CheckTarget::Path { path, write } => {
                commands::check::path(project, &path, write).await?
            }
            CheckTarget::Command { cmd } => commands::check::command(project, &cmd).await?,
        },
        Commands::Exec {
            cmd,
            cwd,
            timeout,
            task,
        } => commands::exec::run(project, cmd, cwd, timeout, task).await?,
        Commands::Tail { task, run, n } => commands::tail::run(project, &task, &run, n).await?,
        Commands::Policy => commands::policy::run(project).await?,
        Commands::Redact => commands::redact::run().await?,
    }

    Ok(())
}
