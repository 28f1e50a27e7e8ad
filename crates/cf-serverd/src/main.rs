//! # cf-serverd
//!
//! Serves files to cf agents over the cf peer protocol.
//!
//! ```text
//! cf-serverd --config /etc/cf/cf-serverd.toml
//! cf-serverd --root /srv/masterfiles --port 5308 --allow-classic
//! ```

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use cf_serverd::{build_server, ServerConfig, DEFAULT_CONFIG_PATH};

#[derive(Parser)]
#[command(name = "cf-serverd", version, about = "Serve files to cf agents")]
struct Cli {
    /// Configuration file; missing means defaults.
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Served root, overriding the config.
    #[arg(long)]
    root: Option<PathBuf>,

    /// Listening port, overriding the config.
    #[arg(long)]
    port: Option<String>,

    /// Accept plaintext (classic) sessions.
    #[arg(long)]
    allow_classic: bool,

    /// Debug logging for cf crates.
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive(format!("cf_serverd={}", level).parse()?)
                .add_directive(format!("cf_net={}", level).parse()?),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    let mut config = ServerConfig::load_or_default(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    if let Some(root) = cli.root {
        config.root = root;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    if cli.allow_classic {
        config.allow_classic = true;
    }

    let server = build_server(&config)?;
    server.serve()?;
    tracing::info!("cf-serverd shutting down");
    Ok(())
}
