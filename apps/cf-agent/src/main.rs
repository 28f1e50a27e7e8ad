//! # cf-agent
//!
//! Command-line interface for the cf promise agent.
//!
//! - `cf-agent run <policy.json>`: converge this host to the policy
//! - `cf-agent outcomes verify|tail`: inspect the outcome log
//! - `cf-agent probe <host[:port]>`: check that a server answers

mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use cf_actuators::{AgentConfig, DEFAULT_CONFIG_PATH};

/// cf promise agent.
#[derive(Parser)]
#[command(name = "cf-agent", version, about)]
struct Cli {
    /// Agent configuration file; missing means defaults.
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Debug logging for cf crates.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Evaluate a policy and converge this host.
    Run {
        /// Policy file (JSON).
        policy: PathBuf,
        /// Bundles to run, overriding both config and policy.
        #[arg(short, long, value_delimiter = ',')]
        bundlesequence: Vec<String>,
        /// Evaluation passes per bundle.
        #[arg(long)]
        passes: Option<usize>,
        /// Print the run summary as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Inspect the outcome log.
    Outcomes {
        #[command(subcommand)]
        command: commands::outcomes::OutcomeCommands,
    },
    /// Connect to a server and report what it negotiated.
    Probe {
        /// `host`, `host:port` or `[v6addr]:port`.
        target: String,
        /// Protocol to request: classic, tls, latest, 1 or 2.
        #[arg(long)]
        protocol: Option<String>,
        /// Accept the server's key without checking it against trust anchors.
        #[arg(long)]
        trust_server: bool,
    },
}

fn init_logging(verbose: bool) -> anyhow::Result<()> {
    let level = if verbose { "debug" } else { "info" };
    // Logs go to stderr; stdout carries reports and summaries.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive(format!("cf_actuators={}", level).parse()?)
                .add_directive(format!("cf_eval={}", level).parse()?)
                .add_directive(format!("cf_net={}", level).parse()?)
                .add_directive(format!("cf_agent={}", level).parse()?),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose)?;
    let config = AgentConfig::load_or_default(&cli.config)?;
    tracing::debug!(config = %cli.config.display(), "agent configuration loaded");

    match &cli.command {
        Commands::Run {
            policy,
            bundlesequence,
            passes,
            json,
        } => commands::run::execute(config, policy, bundlesequence, *passes, *json),
        Commands::Outcomes { command } => commands::outcomes::execute(command, &config),
        Commands::Probe {
            target,
            protocol,
            trust_server,
        } => commands::probe::execute(&config, target, protocol.as_deref(), *trust_server),
    }
}
