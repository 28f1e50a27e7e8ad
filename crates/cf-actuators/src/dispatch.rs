// dispatch.rs - Routing promises to promise-type actuators.
//
// `AgentActuator` is the single `Actuator` the evaluator sees for a run. It
// checks each promise's class guard, expands the promiser, hands the promise
// to the registered `PromiseActuator` for its type, and records the outcome:
// compliance tally, outcome log, log line. `methods` promises are handled
// here because they re-enter the evaluator with this same actuator.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use cf_audit::{OutcomeEvent, OutcomeLog};
use cf_eval::{eval_bundle, Actuator, BundleCall, Compliance, EvalContext, Policy, Promise, PromiseResult, Rval};
use cf_net::{ConnCache, Connect, ProtocolVersion};

use crate::compliance::BundleCompliance;

/// Promise types of an agent bundle, in evaluation order.
pub const AGENT_PROMISE_TYPES: &[&str] = &[
    "meta",
    "vars",
    "defaults",
    "classes",
    "users",
    "files",
    "packages",
    "methods",
    "processes",
    "services",
    "commands",
    "storage",
    "databases",
    "reports",
];

/// Promise types of a common bundle, in evaluation order.
pub const COMMON_PROMISE_TYPES: &[&str] = &["meta", "vars", "defaults", "classes", "reports"];

/// Nested `methods` calls deeper than this fail instead of recursing.
pub const MAX_METHOD_DEPTH: usize = 32;

pub fn promise_type_order(bundle_type: &str) -> &'static [&'static str] {
    match bundle_type {
        "common" => COMMON_PROMISE_TYPES,
        _ => AGENT_PROMISE_TYPES,
    }
}

/// Result of one actuation plus an optional human-readable detail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub result: PromiseResult,
    pub message: Option<String>,
}

impl Outcome {
    pub fn new(result: PromiseResult, message: impl Into<String>) -> Self {
        Self {
            result,
            message: Some(message.into()),
        }
    }

    pub fn kept() -> Self {
        Self {
            result: PromiseResult::Noop,
            message: None,
        }
    }

    pub fn skipped() -> Self {
        Self {
            result: PromiseResult::Skipped,
            message: None,
        }
    }

    pub fn repaired(message: impl Into<String>) -> Self {
        Self::new(PromiseResult::Change, message)
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::new(PromiseResult::Fail, message)
    }

    /// Fold another step of the same promise into this outcome. The worse
    /// result wins and messages accumulate.
    pub fn merge(mut self, other: Outcome) -> Self {
        self.result = self.result.update(other.result);
        self.message = match (self.message, other.message) {
            (Some(a), Some(b)) => Some(format!("{}; {}", a, b)),
            (a, b) => a.or(b),
        };
        self
    }
}

/// Shared services actuators may need.
pub struct ActuatorEnv {
    pub cache: Arc<ConnCache>,
    pub connector: Arc<dyn Connect>,
    pub default_port: String,
    /// Version requested when a promise does not set `protocol_version`.
    pub protocol: ProtocolVersion,
    pub command_timeout: Duration,
}

/// Converges promises of one promise type.
pub trait PromiseActuator: Send {
    fn promise_type(&self) -> &'static str;

    /// One-shot promises are actuated at most once per run; later passes
    /// skip them.
    fn one_shot(&self) -> bool {
        false
    }

    /// `promiser` is the promise's promiser with variables expanded.
    fn actuate(
        &mut self,
        env: &ActuatorEnv,
        ctx: &mut EvalContext,
        promise: &Promise,
        promiser: &str,
    ) -> Outcome;
}

fn promise_key(promise_type: &str, promise: &Promise, promiser: &str) -> String {
    match &promise.handle {
        Some(handle) => format!("{}/{}", promise_type, handle),
        None => format!("{}/{}/{}", promise_type, promise.context, promiser),
    }
}

pub struct AgentActuator<'p> {
    policy: &'p Policy,
    env: ActuatorEnv,
    actuators: HashMap<&'static str, Box<dyn PromiseActuator>>,
    outcomes: Option<OutcomeLog>,
    run_id: Uuid,
    compliance: BTreeMap<String, BundleCompliance>,
    method_results: Vec<PromiseResult>,
    unhandled: HashSet<String>,
}

impl<'p> AgentActuator<'p> {
    /// An actuator with the built-in promise types registered.
    pub fn new(policy: &'p Policy, env: ActuatorEnv, run_id: Uuid) -> Self {
        let mut actuator = Self {
            policy,
            env,
            actuators: HashMap::new(),
            outcomes: None,
            run_id,
            compliance: BTreeMap::new(),
            method_results: Vec::new(),
            unhandled: HashSet::new(),
        };
        actuator.register(Box::new(crate::vars::VarsActuator));
        actuator.register(Box::new(crate::classes::ClassesActuator));
        actuator.register(Box::new(crate::files::FilesActuator));
        actuator.register(Box::new(crate::commands::CommandsActuator));
        actuator.register(Box::new(crate::reports::ReportsActuator::stdout()));
        actuator
    }

    pub fn with_outcome_log(mut self, log: OutcomeLog) -> Self {
        self.outcomes = Some(log);
        self
    }

    /// Register or replace the actuator for its promise type.
    pub fn register(&mut self, actuator: Box<dyn PromiseActuator>) {
        self.actuators.insert(actuator.promise_type(), actuator);
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn compliance(&self) -> &BTreeMap<String, BundleCompliance> {
        &self.compliance
    }

    fn actuate_methods(&mut self, ctx: &mut EvalContext, promise: &Promise, pass: usize) -> Outcome {
        let reference = match promise.scalar("usebundle") {
            Some(reference) => ctx.expand_scalar(reference),
            None => return Outcome::failed("methods promise without usebundle"),
        };
        let call = match BundleCall::parse(&reference) {
            Ok(call) => call,
            Err(e) => return Outcome::failed(e.to_string()),
        };
        let policy = self.policy;
        let bundle = match policy.resolve(&call) {
            Ok(bundle) => bundle,
            Err(e) => return Outcome::failed(e.to_string()),
        };
        if self.method_results.len() >= MAX_METHOD_DEPTH {
            return Outcome::failed(format!(
                "methods nested deeper than {} calling {}",
                MAX_METHOD_DEPTH, call
            ));
        }

        let args: Vec<Rval> = call
            .args
            .iter()
            .map(|arg| Rval::from(ctx.expand_scalar(arg).as_str()))
            .collect();
        self.method_results.push(PromiseResult::Skipped);
        let completed = eval_bundle(
            ctx,
            bundle,
            &args,
            false,
            pass,
            self,
            promise_type_order(&bundle.bundle_type),
        );
        let nested = self.method_results.pop().unwrap_or(PromiseResult::Skipped);

        if !completed {
            return Outcome::new(PromiseResult::Interrupted, format!("{} aborted", call));
        }
        match nested {
            PromiseResult::Skipped => Outcome::kept(),
            result => Outcome {
                result,
                message: None,
            },
        }
    }

    fn record(
        &mut self,
        bundle: &str,
        promise_type: &str,
        promise: &Promise,
        promiser: &str,
        pass: usize,
        outcome: &Outcome,
    ) {
        if let Some(top) = self.method_results.last_mut() {
            *top = top.update(outcome.result);
        }
        self.compliance
            .entry(bundle.to_string())
            .or_default()
            .record(&promise_key(promise_type, promise, promiser), outcome.result);

        let message = outcome.message.as_deref().unwrap_or("");
        match outcome.result.compliance() {
            Compliance::NotKept => tracing::warn!(
                bundle,
                promise_type,
                promiser,
                pass,
                result = %outcome.result,
                "promise not kept: {}",
                message
            ),
            Compliance::Repaired => tracing::info!(
                bundle,
                promise_type,
                promiser,
                pass,
                "promise repaired: {}",
                message
            ),
            Compliance::Kept | Compliance::Ignored => tracing::debug!(
                bundle,
                promise_type,
                promiser,
                pass,
                result = %outcome.result,
                "promise kept"
            ),
        }

        if let Some(log) = self.outcomes.as_mut() {
            let mut event = OutcomeEvent::new(
                self.run_id,
                bundle,
                promise_type,
                promiser,
                outcome.result,
                pass,
            )
            .with_handle(promise.handle.clone());
            if let Some(message) = &outcome.message {
                event = event.with_message(message.clone());
            }
            if let Err(e) = log.append(&mut event) {
                tracing::warn!(error = %e, path = %log.path().display(), "could not record outcome");
            }
        }
    }
}

impl Actuator for AgentActuator<'_> {
    fn actuate(&mut self, ctx: &mut EvalContext, promise: &Promise) -> PromiseResult {
        let promise_type = ctx.current_promise_type().unwrap_or_default().to_string();
        let pass = ctx.current_pass().unwrap_or(1);
        let bundle = ctx
            .current_bundle()
            .map(|b| format!("{}:{}", b.namespace, b.name))
            .unwrap_or_default();

        match ctx.eval_class_expression(&promise.context) {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!(
                    bundle = %bundle,
                    promiser = %promise.promiser,
                    context = %promise.context,
                    "guard not defined, skipping"
                );
                return PromiseResult::Skipped;
            }
            Err(e) => {
                let outcome = Outcome::failed(e.to_string());
                self.record(&bundle, &promise_type, promise, &promise.promiser, pass, &outcome);
                return outcome.result;
            }
        }

        let promiser = ctx.expand_scalar(&promise.promiser);
        ctx.set_this("promiser", Rval::from(promiser.as_str()));

        let outcome = if promise_type == "methods" {
            self.actuate_methods(ctx, promise, pass)
        } else {
            match self.actuators.get_mut(promise_type.as_str()) {
                Some(actuator) => {
                    let key = format!("{}/{}", bundle, promise_key(&promise_type, promise, &promiser));
                    if actuator.one_shot() && ctx.promise_is_done(&key) {
                        return PromiseResult::Skipped;
                    }
                    let outcome = actuator.actuate(&self.env, ctx, promise, &promiser);
                    if actuator.one_shot() {
                        ctx.mark_promise_done(&key);
                    }
                    outcome
                }
                None => {
                    if self.unhandled.insert(promise_type.clone()) {
                        tracing::warn!(
                            promise_type = %promise_type,
                            "no actuator for promise type, its promises are skipped"
                        );
                    }
                    return PromiseResult::Skipped;
                }
            }
        };

        self.record(&bundle, &promise_type, promise, &promiser, pass, &outcome);
        outcome.result
    }
}
