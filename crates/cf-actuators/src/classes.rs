// classes.rs - classes promises: define soft classes from expressions.
//
//   "web_server" expression => "linux.(role_web|role_proxy)";
//   "any_of"     or         => { "a", "b" };
//   "all_of"     and        => { "a", "b" };
//   "not_x"      not        => "x";
//   ...          scope      => "bundle" | "namespace" (default)

use cf_eval::{ClassScope, EvalContext, EvalError, Promise};

use crate::dispatch::{ActuatorEnv, Outcome, PromiseActuator};

pub struct ClassesActuator;

fn condition(ctx: &EvalContext, promise: &Promise) -> Result<bool, EvalError> {
    let expand_all = |lval: &str| -> Vec<String> {
        promise
            .list(lval)
            .iter()
            .map(|item| ctx.expand_scalar(item))
            .collect()
    };

    if let Some(expression) = promise.scalar("expression") {
        return ctx.eval_class_expression(&ctx.expand_scalar(expression));
    }
    if promise.attribute("and").is_some() {
        for item in expand_all("and") {
            if !ctx.eval_class_expression(&item)? {
                return Ok(false);
            }
        }
        return Ok(true);
    }
    if promise.attribute("or").is_some() {
        for item in expand_all("or") {
            if ctx.eval_class_expression(&item)? {
                return Ok(true);
            }
        }
        return Ok(false);
    }
    if let Some(negated) = promise.scalar("not") {
        return Ok(!ctx.eval_class_expression(&ctx.expand_scalar(negated))?);
    }
    // A bare classes promise defines its class unconditionally.
    Ok(true)
}

impl PromiseActuator for ClassesActuator {
    fn promise_type(&self) -> &'static str {
        "classes"
    }

    fn actuate(
        &mut self,
        _env: &ActuatorEnv,
        ctx: &mut EvalContext,
        promise: &Promise,
        promiser: &str,
    ) -> Outcome {
        let scope = match promise.scalar("scope") {
            None | Some("namespace") => ClassScope::Namespace,
            Some("bundle") => ClassScope::Bundle,
            Some(other) => return Outcome::failed(format!("unknown class scope '{}'", other)),
        };
        match condition(ctx, promise) {
            Ok(true) => {
                if ctx.class_put_soft(promiser, scope) {
                    tracing::debug!(class = promiser, ?scope, "class defined");
                }
                Outcome::kept()
            }
            Ok(false) => Outcome::kept(),
            Err(e) => Outcome::failed(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_env;
    use cf_eval::{Bundle, PromiseResult};

    fn define(ctx: &mut EvalContext, promise: Promise) -> (Outcome, bool) {
        let bundle = Bundle::new("main");
        let mut frame = ctx.push_bundle_frame(&bundle, &[], false);
        let mut frame = frame.push_promise_type_frame("classes", 1);
        let promiser = promise.promiser.clone();
        let outcome = ClassesActuator.actuate(&test_env(), &mut frame, &promise, &promiser);
        let visible_inside = frame.is_defined_class(&promiser);
        (outcome, visible_inside)
    }

    #[test]
    fn expression_defines_namespace_class() {
        let mut ctx = EvalContext::new();
        let (outcome, inside) = define(&mut ctx, Promise::new("always").with_attribute("expression", "any"));
        assert_eq!(outcome.result, PromiseResult::Noop);
        assert!(inside);
        assert!(ctx.is_defined_class("always"));
    }

    #[test]
    fn false_expression_defines_nothing() {
        let mut ctx = EvalContext::new();
        define(&mut ctx, Promise::new("never").with_attribute("expression", "!any"));
        assert!(!ctx.is_defined_class("never"));
    }

    #[test]
    fn bundle_scope_ends_with_the_frame() {
        let mut ctx = EvalContext::new();
        let (_, inside) = define(
            &mut ctx,
            Promise::new("local")
                .with_attribute("expression", "any")
                .with_attribute("scope", "bundle"),
        );
        assert!(inside);
        assert!(!ctx.is_defined_class("local"));
    }

    #[test]
    fn and_or_not() {
        let mut ctx = EvalContext::new();
        define(
            &mut ctx,
            Promise::new("both").with_attribute("and", vec!["any".to_string(), "!nope".to_string()]),
        );
        define(
            &mut ctx,
            Promise::new("either").with_attribute("or", vec!["nope".to_string(), "any".to_string()]),
        );
        define(&mut ctx, Promise::new("neither").with_attribute("not", "any"));
        assert!(ctx.is_defined_class("both"));
        assert!(ctx.is_defined_class("either"));
        assert!(!ctx.is_defined_class("neither"));
    }

    #[test]
    fn abort_class_raises_signal() {
        let mut ctx = EvalContext::new();
        ctx.set_abort_classes(["emergency"]);
        define(&mut ctx, Promise::new("emergency"));
        assert!(ctx.abort_signal().is_raised());
    }

    #[test]
    fn malformed_expression_fails() {
        let mut ctx = EvalContext::new();
        let (outcome, _) = define(&mut ctx, Promise::new("bad").with_attribute("expression", "(any"));
        assert_eq!(outcome.result, PromiseResult::Fail);
    }
}
