// run.rs - `cf-agent run`: evaluate a policy file and print the summary.

use std::path::Path;

use anyhow::Context;

use cf_actuators::{Agent, AgentConfig, RunSummary};
use cf_eval::Policy;

pub fn execute(
    mut config: AgentConfig,
    policy_path: &Path,
    bundlesequence: &[String],
    passes: Option<usize>,
    json: bool,
) -> anyhow::Result<()> {
    if !bundlesequence.is_empty() {
        config.bundlesequence = bundlesequence.to_vec();
    }
    if let Some(passes) = passes {
        config.passes = passes;
    }

    let policy = Policy::from_json_file(policy_path)
        .with_context(|| format!("loading policy {}", policy_path.display()))?;
    tracing::debug!(
        policy = %policy_path.display(),
        bundles = policy.bundles.len(),
        passes = config.passes,
        "policy loaded"
    );
    let agent = Agent::new(config)?;
    let summary = agent.run(&policy)?;
    agent.cache().destroy();

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print_summary(&summary);
    }

    if summary.aborted {
        anyhow::bail!("run {} aborted", summary.run_id);
    }
    Ok(())
}

fn print_summary(summary: &RunSummary) {
    println!(
        "{:<32} {:>6} {:>6} {:>8} {:>8}",
        "BUNDLE", "PASSES", "KEPT", "REPAIRED", "NOT KEPT"
    );
    println!("{}", "-".repeat(64));
    for bundle in &summary.bundles {
        println!(
            "{:<32} {:>6} {:>6} {:>8} {:>8}",
            bundle.name,
            bundle.passes_completed,
            bundle.counts.kept,
            bundle.counts.repaired,
            bundle.counts.not_kept,
        );
    }
    println!();
    println!(
        "Run {}: {:.1}% compliant ({} promises, {} not kept){}",
        summary.run_id,
        summary.percent_compliant(),
        summary.total.total(),
        summary.total.not_kept,
        if summary.aborted { ", ABORTED" } else { "" },
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn runs_policy_file() {
        let dir = tempdir().unwrap();
        let marker = dir.path().join("marker");
        let policy = serde_json::json!({
            "bundlesequence": ["main"],
            "bundles": [{
                "name": "main",
                "promise_types": [{
                    "name": "files",
                    "promises": [{ "promiser": marker.to_str().unwrap(), "attributes": { "create": "true" } }]
                }]
            }]
        });
        let policy_path = dir.path().join("promises.json");
        std::fs::write(&policy_path, policy.to_string()).unwrap();
        let config = AgentConfig {
            outcome_log: dir.path().join("outcomes.jsonl"),
            ..AgentConfig::default()
        };

        execute(config, &policy_path, &[], Some(1), true).unwrap();
        assert!(marker.exists());
    }

    #[test]
    fn unknown_bundle_on_command_line_fails() {
        let dir = tempdir().unwrap();
        let policy_path = dir.path().join("promises.json");
        std::fs::write(&policy_path, r#"{"bundles": [{"name": "main"}]}"#).unwrap();
        let config = AgentConfig {
            outcome_log: dir.path().join("outcomes.jsonl"),
            ..AgentConfig::default()
        };
        assert!(execute(config, &policy_path, &["ghost".to_string()], None, false).is_err());
    }
}
