// outcomes.rs - Outcome log subcommands: verify, tail.

use std::path::PathBuf;

use clap::Subcommand;

use cf_actuators::AgentConfig;
use cf_audit::{AuditError, OutcomeLog};

#[derive(Subcommand)]
pub enum OutcomeCommands {
    /// Verify the outcome log hash chain.
    Verify {
        /// Path to the outcome log (defaults to the configured one).
        #[arg(long)]
        log: Option<PathBuf>,
    },
    /// Show recent promise outcomes.
    Tail {
        /// Path to the outcome log (defaults to the configured one).
        #[arg(long)]
        log: Option<PathBuf>,
        /// Number of outcomes to show.
        #[arg(short, default_value = "10")]
        n: usize,
    },
}

pub fn execute(cmd: &OutcomeCommands, config: &AgentConfig) -> anyhow::Result<()> {
    match cmd {
        OutcomeCommands::Verify { log } => {
            let path = log.clone().unwrap_or_else(|| config.outcome_log.clone());
            if !path.exists() {
                println!("No outcome log found at {}", path.display());
                return Ok(());
            }

            match OutcomeLog::verify_chain(&path) {
                Ok(count) => println!("Outcome log verified: {} event(s), hash chain intact.", count),
                Err(AuditError::IntegrityViolation {
                    line,
                    expected,
                    actual,
                }) => {
                    println!("INTEGRITY VIOLATION at line {}:", line);
                    println!("  Expected previous_hash: {}", expected);
                    println!("  Actual previous_hash:   {}", actual);
                    anyhow::bail!("outcome log integrity check failed");
                }
                Err(e) => return Err(e.into()),
            }
        }

        OutcomeCommands::Tail { log, n } => {
            let path = log.clone().unwrap_or_else(|| config.outcome_log.clone());
            if !path.exists() {
                println!("No outcome log found at {}", path.display());
                return Ok(());
            }

            let recent = OutcomeLog::tail(&path, *n)?;
            if recent.is_empty() {
                println!("No outcomes recorded.");
                return Ok(());
            }

            println!(
                "{:<20} {:<20} {:<10} {:<4} {:<12} PROMISER",
                "TIMESTAMP", "BUNDLE", "TYPE", "PASS", "RESULT"
            );
            println!("{}", "-".repeat(90));
            for event in recent {
                println!(
                    "{:<20} {:<20} {:<10} {:<4} {:<12} {}",
                    event.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    event.bundle,
                    event.promise_type,
                    event.pass,
                    event.result.to_string(),
                    event.promiser,
                );
                if let Some(message) = &event.message {
                    println!("{:>20} {}", "", message);
                }
            }
        }
    }

    Ok(())
}
