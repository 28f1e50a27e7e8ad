// evaluator.rs - The bundle evaluation loop.
//
// For one bundle: push a bundle frame, then walk the promise types in the
// caller-supplied order. Absent or empty promise types are skipped without
// any side effect. Each non-empty type gets a banner and its own frame, and
// every promise in it is handed to the actuator in policy order. The abort
// signal is read after every actuator call; once raised, both frames are
// popped and the bundle reports `false`.

use crate::actuator::Actuator;
use crate::context::EvalContext;
use crate::policy::{Bundle, Rval};

/// Evaluate every promise in `bundle` for one pass.
///
/// Returns `true` if the bundle ran to completion, `false` if the run-wide
/// abort signal was raised while it ran. Promise failures do not stop the
/// bundle; they are the actuator's to report.
///
/// # Panics
///
/// Panics if the frame stack does not have the same depth on return as it
/// had on entry. That can only happen if an actuator leaked a frame guard.
pub fn eval_bundle<A>(
    ctx: &mut EvalContext,
    bundle: &Bundle,
    args: &[Rval],
    inherit_previous: bool,
    pass: usize,
    actuator: &mut A,
    promise_type_order: &[&str],
) -> bool
where
    A: Actuator + ?Sized,
{
    let depth = ctx.depth();
    let completed = eval_frames(
        ctx,
        bundle,
        args,
        inherit_previous,
        pass,
        actuator,
        promise_type_order,
    );
    assert_eq!(
        ctx.depth(),
        depth,
        "frame stack imbalance after bundle '{}'",
        bundle.qualified_name()
    );
    completed
}

fn eval_frames<A>(
    ctx: &mut EvalContext,
    bundle: &Bundle,
    args: &[Rval],
    inherit_previous: bool,
    pass: usize,
    actuator: &mut A,
    promise_type_order: &[&str],
) -> bool
where
    A: Actuator + ?Sized,
{
    let name = bundle.qualified_name();
    let mut bundle_frame = ctx.push_bundle_frame(bundle, args, inherit_previous);
    banner_bundle(&name, &bundle.bundle_type, args);

    for &type_name in promise_type_order {
        let promise_type = match bundle.promise_type(type_name) {
            Some(pt) if !pt.is_empty() => pt,
            _ => continue,
        };

        tracing::info!(
            bundle = %name,
            promise_type = type_name,
            pass,
            "P: {} in bundle {} (pass {})",
            type_name,
            name,
            pass
        );
        let mut type_frame = bundle_frame.push_promise_type_frame(type_name, pass);

        for promise in &promise_type.promises {
            type_frame.clear_this();
            type_frame.set_this("promiser", Rval::from(promise.promiser.as_str()));
            if let Some(handle) = &promise.handle {
                type_frame.set_this("handle", Rval::from(handle.as_str()));
            }

            let result = actuator.actuate(&mut type_frame, promise);
            tracing::debug!(
                bundle = %name,
                promise_type = type_name,
                promiser = %promise.promiser,
                pass,
                %result,
                "promise actuated"
            );

            if type_frame.abort_signal().is_raised() {
                tracing::warn!(
                    bundle = %name,
                    promise_type = type_name,
                    pass,
                    "abort signal raised, leaving bundle"
                );
                return false;
            }
        }
    }

    true
}

fn banner_bundle(name: &str, bundle_type: &str, args: &[Rval]) {
    let args: Vec<String> = args
        .iter()
        .map(|a| match a {
            Rval::Scalar(s) => s.clone(),
            Rval::List(items) => format!("{{{}}}", items.join(", ")),
            Rval::Body(_) => "<body>".to_string(),
        })
        .collect();
    tracing::info!(
        bundle = %name,
        bundle_type,
        "B: BEGIN bundle {}({})",
        name,
        args.join(", ")
    );
}
