// vars.rs - vars promises: define variables in the bundle's scope.
//
//   "name" string => "value $(ref)";
//   "list" slist  => { "a", "$(ref)" };
//   "n"    int    => "42";

use cf_eval::{EvalContext, Promise, Rval, VarRef};

use crate::dispatch::{ActuatorEnv, Outcome, PromiseActuator};

pub struct VarsActuator;

fn expand_value(ctx: &EvalContext, promise: &Promise) -> Result<Rval, String> {
    if let Some(value) = promise.scalar("string") {
        return Ok(Rval::from(ctx.expand_scalar(value).as_str()));
    }
    if let Some(value) = promise.scalar("int") {
        let expanded = ctx.expand_scalar(value);
        return match expanded.trim().parse::<i64>() {
            Ok(_) => Ok(Rval::from(expanded.trim())),
            Err(_) => Err(format!("'{}' is not an integer", expanded)),
        };
    }
    if let Some(value) = promise.scalar("real") {
        let expanded = ctx.expand_scalar(value);
        return match expanded.trim().parse::<f64>() {
            Ok(_) => Ok(Rval::from(expanded.trim())),
            Err(_) => Err(format!("'{}' is not a real number", expanded)),
        };
    }
    if promise.attribute("slist").is_some() {
        let items = promise
            .list("slist")
            .iter()
            .map(|item| ctx.expand_scalar(item))
            .collect();
        return Ok(Rval::List(items));
    }
    Err("no string, int, real or slist value".to_string())
}

impl PromiseActuator for VarsActuator {
    fn promise_type(&self) -> &'static str {
        "vars"
    }

    fn actuate(
        &mut self,
        _env: &ActuatorEnv,
        ctx: &mut EvalContext,
        promise: &Promise,
        promiser: &str,
    ) -> Outcome {
        let value = match expand_value(ctx, promise) {
            Ok(value) => value,
            Err(reason) => return Outcome::failed(format!("variable {}: {}", promiser, reason)),
        };
        let var = VarRef::parse(promiser);
        if ctx.variable_get(&var) == Some(&value) {
            return Outcome::kept();
        }
        tracing::debug!(variable = %var, "defining variable");
        ctx.variable_put(&var, value);
        Outcome::kept()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_env;
    use cf_eval::{Bundle, PromiseResult};

    fn run(ctx: &mut EvalContext, promise: Promise) -> Outcome {
        let bundle = Bundle::new("main");
        let mut frame = ctx.push_bundle_frame(&bundle, &[], false);
        let mut frame = frame.push_promise_type_frame("vars", 1);
        let promiser = promise.promiser.clone();
        VarsActuator.actuate(&test_env(), &mut frame, &promise, &promiser)
    }

    #[test]
    fn string_is_expanded_and_stored_in_bundle_scope() {
        let mut ctx = EvalContext::new();
        run(&mut ctx, Promise::new("dir").with_attribute("string", "/srv/$(sys.os)"));
        let stored = ctx.variable_get(&VarRef::parse("main.dir")).cloned();
        assert_eq!(
            stored,
            Some(Rval::from(format!("/srv/{}", std::env::consts::OS).as_str()))
        );
    }

    #[test]
    fn slist_items_are_expanded() {
        let mut ctx = EvalContext::new();
        run(
            &mut ctx,
            Promise::new("pkgs").with_attribute("slist", vec!["a".to_string(), "$(sys.arch)".to_string()]),
        );
        let stored = ctx.variable_get(&VarRef::parse("main.pkgs")).cloned();
        assert_eq!(
            stored,
            Some(Rval::List(vec!["a".to_string(), std::env::consts::ARCH.to_string()]))
        );
    }

    #[test]
    fn bad_int_fails() {
        let mut ctx = EvalContext::new();
        let outcome = run(&mut ctx, Promise::new("n").with_attribute("int", "forty"));
        assert_eq!(outcome.result, PromiseResult::Fail);
    }

    #[test]
    fn missing_value_fails() {
        let mut ctx = EvalContext::new();
        let outcome = run(&mut ctx, Promise::new("empty"));
        assert_eq!(outcome.result, PromiseResult::Fail);
    }
}
