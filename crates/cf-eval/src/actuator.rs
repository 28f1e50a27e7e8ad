// actuator.rs - The contract between the evaluator and promise actuators.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::context::EvalContext;
use crate::policy::Promise;

/// Outcome of actuating one promise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromiseResult {
    /// Not evaluated: guard class false, already done, or not applicable.
    Skipped,
    /// Already converged, nothing to do (kept).
    Noop,
    /// State was changed to converge (repaired).
    Change,
    /// Would have changed, but only a warning was requested.
    Warn,
    Timeout,
    Fail,
    /// Not permitted (access denied by a peer or the OS).
    Denied,
    Interrupted,
}

/// Compliance bucket a result counts towards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compliance {
    Kept,
    Repaired,
    NotKept,
    /// Skipped promises are not counted.
    Ignored,
}

impl PromiseResult {
    /// Combine two results so the worse one wins.
    ///
    /// Failures are sticky; a warning beats a change; a change beats a no-op;
    /// anything beats skipped.
    pub fn update(self, evidence: PromiseResult) -> PromiseResult {
        use PromiseResult::*;
        match self {
            Denied | Fail | Interrupted | Timeout => self,
            Warn => match evidence {
                Denied | Fail | Interrupted | Timeout | Warn => evidence,
                Change | Noop | Skipped => self,
            },
            Change => match evidence {
                Denied | Fail | Interrupted | Timeout | Warn | Change => evidence,
                Noop | Skipped => self,
            },
            Noop => match evidence {
                Skipped => self,
                _ => evidence,
            },
            Skipped => evidence,
        }
    }

    pub fn compliance(self) -> Compliance {
        match self {
            PromiseResult::Skipped => Compliance::Ignored,
            PromiseResult::Noop => Compliance::Kept,
            PromiseResult::Change => Compliance::Repaired,
            PromiseResult::Warn
            | PromiseResult::Timeout
            | PromiseResult::Fail
            | PromiseResult::Denied
            | PromiseResult::Interrupted => Compliance::NotKept,
        }
    }

    pub fn is_failure(self) -> bool {
        self.compliance() == Compliance::NotKept
    }
}

impl fmt::Display for PromiseResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PromiseResult::Skipped => "skipped",
            PromiseResult::Noop => "kept",
            PromiseResult::Change => "repaired",
            PromiseResult::Warn => "warn",
            PromiseResult::Timeout => "timeout",
            PromiseResult::Fail => "failed",
            PromiseResult::Denied => "denied",
            PromiseResult::Interrupted => "interrupted",
        };
        write!(f, "{}", s)
    }
}

/// Applies one promise against the real world.
///
/// The evaluator calls this once per promise, in policy order, with the
/// promise-type frame for the promise on top of the context's stack
/// (`ctx.current_promise_type()` names it). Any caller state the actuator
/// needs lives in the implementing type.
pub trait Actuator {
    fn actuate(&mut self, ctx: &mut EvalContext, promise: &Promise) -> PromiseResult;
}

impl<F> Actuator for F
where
    F: FnMut(&mut EvalContext, &Promise) -> PromiseResult,
{
    fn actuate(&mut self, ctx: &mut EvalContext, promise: &Promise) -> PromiseResult {
        self(ctx, promise)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use PromiseResult::*;

    #[test]
    fn update_is_worst_wins() {
        assert_eq!(Skipped.update(Noop), Noop);
        assert_eq!(Noop.update(Skipped), Noop);
        assert_eq!(Noop.update(Change), Change);
        assert_eq!(Change.update(Noop), Change);
        assert_eq!(Change.update(Warn), Warn);
        assert_eq!(Warn.update(Change), Warn);
        assert_eq!(Warn.update(Fail), Fail);
        assert_eq!(Fail.update(Noop), Fail);
        assert_eq!(Timeout.update(Denied), Timeout);
    }

    #[test]
    fn compliance_buckets() {
        assert_eq!(Noop.compliance(), Compliance::Kept);
        assert_eq!(Change.compliance(), Compliance::Repaired);
        assert_eq!(Timeout.compliance(), Compliance::NotKept);
        assert_eq!(Skipped.compliance(), Compliance::Ignored);
        assert!(Denied.is_failure());
        assert!(!Change.is_failure());
    }

    #[test]
    fn closures_are_actuators() {
        let mut calls = 0;
        let mut actuator = |_: &mut EvalContext, _: &Promise| {
            calls += 1;
            Noop
        };
        let mut ctx = EvalContext::new();
        let promise = Promise::new("x");
        assert_eq!(actuator.actuate(&mut ctx, &promise), Noop);
        drop(actuator);
        assert_eq!(calls, 1);
    }
}
