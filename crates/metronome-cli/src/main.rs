mod cmd;
mod output;
mod root;

use clap::{Parser, Subcommand};
use cmd::{blocks::StateFilter, config::ConfigSubcommand, submit::SubmitSubcommand, AgentArgs};
use metronome_core::model::Shard;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "metronome",
    about = "Sharded tick scheduler: advance the clock, fire recurring tasks, apply command blocks",
    version,
    propagate_version = true
)]
struct Cli {
    /// Project root (default: auto-detect from .metronome/)
    #[arg(long, global = true, env = "METRONOME_ROOT")]
    root: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    /// Emit logs as JSON lines on stderr
    #[arg(long, global = true, env = "METRONOME_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create .metronome/ with a config and an empty store
    Init {
        /// Shard id written to the new config
        #[arg(long, default_value_t = 0)]
        shard_id: u32,
        /// Shard count written to the new config
        #[arg(long, default_value_t = 1)]
        shard_count: u32,
        /// Concurrency limit written to the new config
        #[arg(long)]
        concurrency: Option<usize>,
    },

    /// Run work cycles on an interval until Ctrl-C
    Run {
        #[command(flatten)]
        agent: AgentArgs,
        /// Stop after this many cycles
        #[arg(long)]
        max_cycles: Option<u64>,
        /// Milliseconds between cycles (overrides config)
        #[arg(long)]
        interval_ms: Option<u64>,
    },

    /// Run exactly one work cycle
    Cycle {
        #[command(flatten)]
        agent: AgentArgs,
    },

    /// Append a command block, acting as the external command writer
    Submit {
        #[command(subcommand)]
        subcommand: SubmitSubcommand,
    },

    /// List scheduled tasks
    Tasks,

    /// Show the current tick
    Clock,

    /// List command blocks
    Blocks {
        /// Only show blocks in this state
        #[arg(long, value_enum)]
        state: Option<StateFilter>,
    },

    /// Show messages handed off by fired tasks
    Outbox {
        /// Remove the listed messages from the outbox
        #[arg(long)]
        drain: bool,
    },

    /// Show or validate the configuration
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },
}

fn init_logging(log_json: bool, default_level: tracing::Level) {
    let filter =
        tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into());
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if log_json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn main() {
    let cli = Cli::parse();

    let default_level = match &cli.command {
        Commands::Run { .. } | Commands::Cycle { .. } => tracing::Level::INFO,
        _ => tracing::Level::WARN,
    };
    init_logging(cli.log_json, default_level);

    let root = root::resolve_root(cli.root.as_deref());

    let result = match cli.command {
        Commands::Init {
            shard_id,
            shard_count,
            concurrency,
        } => cmd::init::run(&root, Shard::new(shard_id, shard_count), concurrency),
        Commands::Run {
            agent,
            max_cycles,
            interval_ms,
        } => cmd::run::run(&root, &agent, max_cycles, interval_ms, cli.json),
        Commands::Cycle { agent } => cmd::cycle::run(&root, &agent, cli.json),
        Commands::Submit { subcommand } => cmd::submit::run(&root, subcommand, cli.json),
        Commands::Tasks => cmd::tasks::run(&root, cli.json),
        Commands::Clock => cmd::clock::run(&root, cli.json),
        Commands::Blocks { state } => cmd::blocks::run(&root, state, cli.json),
        Commands::Outbox { drain } => cmd::outbox::run(&root, drain, cli.json),
        Commands::Config { subcommand } => cmd::config::run(&root, subcommand, cli.json),
    };

    if let Err(e) = result {
        // Print the full error chain (anyhow's alternate Display)
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
