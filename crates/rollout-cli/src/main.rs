mod cmd;
mod dispatch;
mod output;
mod root;

use clap::{Parser, Subcommand};
use cmd::deploy::DeployArgs;
use std::path::PathBuf;
use uuid::Uuid;

#[derive(Parser)]
#[command(
    name = "rollout",
    about = "Release deployment orchestration: plan, gate, dispatch and track release executions",
    version,
    propagate_version = true
)]
struct Cli {
    /// Project root (default: auto-detect from .rollout/ or .git/)
    #[arg(long, global = true, env = "ROLLOUT_ROOT")]
    root: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create .rollout/ with a default config and an empty definitions file
    Init,

    /// Check config and release definitions for mistakes
    Validate,

    /// Show the execution units a release would run
    Plan {
        #[arg(long)]
        release: u64,
        #[arg(long)]
        customer: u64,
    },

    /// Start a new release execution and drive it
    Deploy(DeployArgs),

    /// Approve a stage execution waiting at a gate, then resume
    Approve {
        execution: Uuid,
        stage: Uuid,
        /// Who is approving
        #[arg(long)]
        by: String,
        #[arg(long)]
        comment: Option<String>,
    },

    /// Reject a stage execution waiting at a gate
    Reject {
        execution: Uuid,
        stage: Uuid,
        /// Who is rejecting
        #[arg(long)]
        by: String,
        #[arg(long)]
        comment: Option<String>,
    },

    /// Resume a release execution from its persisted state
    Resume { execution: Uuid },

    /// Cancel a release execution
    Cancel { execution: Uuid },

    /// Show one release execution
    Status { execution: Uuid },

    /// List release executions, newest first
    List {
        /// Only executions of this release
        #[arg(long)]
        release: Option<u64>,
    },
}

fn main() {
    let cli = Cli::parse();

    let default_level = match &cli.command {
        Commands::Deploy(_)
        | Commands::Approve { .. }
        | Commands::Reject { .. }
        | Commands::Resume { .. } => tracing::Level::INFO,
        _ => tracing::Level::WARN,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let root = root::resolve_root(cli.root.as_deref());

    let result = match cli.command {
        Commands::Init => cmd::init::run(&root),
        Commands::Validate => cmd::validate::run(&root, cli.json),
        Commands::Plan { release, customer } => cmd::plan::run(&root, customer, release, cli.json),
        Commands::Deploy(args) => cmd::deploy::run(&root, args, cli.json),
        Commands::Approve {
            execution,
            stage,
            by,
            comment,
        } => cmd::approval::run(&root, execution, stage, &by, true, comment, cli.json),
        Commands::Reject {
            execution,
            stage,
            by,
            comment,
        } => cmd::approval::run(&root, execution, stage, &by, false, comment, cli.json),
        Commands::Resume { execution } => cmd::execution::resume(&root, execution, cli.json),
        Commands::Cancel { execution } => cmd::execution::cancel(&root, execution, cli.json),
        Commands::Status { execution } => cmd::execution::status(&root, execution, cli.json),
        Commands::List { release } => cmd::execution::list(&root, release, cli.json),
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
