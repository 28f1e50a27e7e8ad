// agent.rs - The multi-pass run driver.
//
// One run: resolve the bundlesequence, then for each bundle in order
// evaluate it `passes` times with a single `AgentActuator`. The context,
// the connection cache and the abort signal live for the whole run. Cached
// connections outlive a run; the abort signal and the list of servers that
// failed are reset when the next one starts. An aborted bundle stops the
// run; the summary records how far it got.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use cf_audit::OutcomeLog;
use cf_eval::{eval_bundle, AbortSignal, Bundle, BundleCall, EvalContext, EvalError, Policy, Rval};
use cf_net::{ConnCache, Connect, Connector, RustlsSecurity};

use crate::compliance::ComplianceCounts;
use crate::config::AgentConfig;
use crate::dispatch::{promise_type_order, ActuatorEnv, AgentActuator};
use crate::error::AgentError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleSummary {
    pub name: String,
    pub passes_completed: usize,
    pub counts: ComplianceCounts,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub aborted: bool,
    /// Bundles from the bundlesequence, in order. Bundles never reached
    /// because of an abort are absent.
    pub bundles: Vec<BundleSummary>,
    /// Every bundle evaluated, including those reached through `methods`.
    pub total: ComplianceCounts,
}

impl RunSummary {
    pub fn percent_compliant(&self) -> f64 {
        self.total.percent_compliant()
    }
}

pub struct Agent {
    config: AgentConfig,
    cache: Arc<ConnCache>,
    connector: Arc<dyn Connect>,
    abort: AbortSignal,
}

fn compliance_key(bundle: &Bundle) -> String {
    format!("{}:{}", bundle.namespace, bundle.name)
}

impl Agent {
    /// An agent dialing servers over TCP, with TLS trust from the config.
    pub fn new(config: AgentConfig) -> Result<Self, AgentError> {
        config.validate()?;
        let mut security = RustlsSecurity::new();
        if let Some(anchor) = &config.trust_anchor {
            security = security.with_trust_anchors(anchor)?;
        }
        let mut connector = Connector::new(Arc::new(security))
            .with_timeouts(config.connect_timeout(), config.io_timeout());
        if let Some(username) = &config.username {
            connector = connector.with_username(username.clone());
        }
        Ok(Self::with_connector(config, Arc::new(connector)))
    }

    pub fn with_connector(config: AgentConfig, connector: Arc<dyn Connect>) -> Self {
        Self {
            config,
            cache: Arc::new(ConnCache::new()),
            connector,
            abort: AbortSignal::new(),
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<ConnCache> {
        &self.cache
    }

    /// Raising this signal from another thread stops the current run after
    /// the promise being actuated. Each run starts with it cleared.
    pub fn abort_signal(&self) -> AbortSignal {
        self.abort.clone()
    }

    /// The bundles to run, with their call arguments. The config's sequence
    /// wins over the policy's when set.
    pub fn resolve_sequence<'p>(&self, policy: &'p Policy) -> Result<Vec<(BundleCall, &'p Bundle)>, AgentError> {
        let names = if self.config.bundlesequence.is_empty() {
            &policy.bundlesequence
        } else {
            &self.config.bundlesequence
        };
        if names.is_empty() {
            return Err(AgentError::EmptySequence);
        }

        let mut sequence = Vec::with_capacity(names.len());
        for name in names {
            let call = BundleCall::parse(name)?;
            match policy.resolve(&call) {
                Ok(bundle) => sequence.push((call, bundle)),
                Err(EvalError::UndefinedBundle { name }) if self.config.ignore_missing_bundles => {
                    tracing::warn!(bundle = %name, "bundle in bundlesequence not found, skipping");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(sequence)
    }

    pub fn run(&self, policy: &Policy) -> Result<RunSummary, AgentError> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let sequence = self.resolve_sequence(policy)?;

        self.abort.reset();
        self.cache.clear_offline_servers();
        let mut ctx = EvalContext::with_abort_signal(self.abort.clone());
        ctx.set_abort_classes(&self.config.abort_classes);

        let env = ActuatorEnv {
            cache: self.cache.clone(),
            connector: self.connector.clone(),
            default_port: self.config.port.clone(),
            protocol: self.config.protocol(),
            command_timeout: self.config.command_timeout(),
        };
        let log = OutcomeLog::open(&self.config.outcome_log)?;
        let mut actuator = AgentActuator::new(policy, env, run_id).with_outcome_log(log);

        tracing::info!(
            %run_id,
            bundles = sequence.len(),
            passes = self.config.passes,
            "starting agent run"
        );

        let mut passes_completed: Vec<(String, usize)> = Vec::new();
        let mut aborted = false;
        'bundles: for (call, bundle) in &sequence {
            let key = compliance_key(bundle);
            passes_completed.push((key, 0));
            let args: Vec<Rval> = call
                .args
                .iter()
                .map(|arg| Rval::from(ctx.expand_scalar(arg).as_str()))
                .collect();

            for pass in 1..=self.config.passes {
                let completed = eval_bundle(
                    &mut ctx,
                    bundle,
                    &args,
                    false,
                    pass,
                    &mut actuator,
                    promise_type_order(&bundle.bundle_type),
                );
                if !completed {
                    tracing::error!(bundle = %call, pass, "run aborted");
                    aborted = true;
                    break 'bundles;
                }
                if let Some(last) = passes_completed.last_mut() {
                    last.1 = pass;
                }
            }
        }

        let compliance: BTreeMap<String, ComplianceCounts> = actuator
            .compliance()
            .iter()
            .map(|(name, bundle)| (name.clone(), bundle.counts()))
            .collect();
        let mut total = ComplianceCounts::default();
        for counts in compliance.values() {
            total.add(*counts);
        }
        let bundles = passes_completed
            .into_iter()
            .map(|(name, passes)| BundleSummary {
                counts: compliance.get(&name).copied().unwrap_or_default(),
                name,
                passes_completed: passes,
            })
            .collect();

        let summary = RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            aborted,
            bundles,
            total,
        };
        tracing::info!(
            %run_id,
            aborted,
            kept = total.kept,
            repaired = total.repaired,
            not_kept = total.not_kept,
            "run finished, {:.1}% compliant",
            summary.percent_compliant()
        );
        Ok(summary)
    }
}
