// bundle_walk.rs - Evaluate a policy loaded from disk, end to end.
//
// Bundle B has one `files` promise P1 and one `reports` promise P2. With
// the order [files, reports] the actuator is called exactly twice, P1 then
// P2, and the bundle completes. A guard class that is not defined still
// reaches the actuator: skipping is the actuator's decision.

use std::cell::RefCell;

use tempfile::tempdir;

use cf_eval::{eval_bundle, Actuator, EvalContext, Policy, Promise, PromiseResult};

const POLICY: &str = r#"{
    "bundlesequence": ["b"],
    "bundles": [
        {
            "name": "b",
            "promise_types": [
                { "name": "reports", "promises": [ { "promiser": "P2" } ] },
                { "name": "files",   "promises": [ { "promiser": "P1", "attributes": { "create": "true" } } ] }
            ]
        }
    ]
}"#;

#[test]
fn files_then_reports_in_order() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("promises.json");
    std::fs::write(&path, POLICY).unwrap();
    let policy = Policy::from_json_file(&path).unwrap();
    let bundle = policy.get_bundle("default", "b").unwrap();

    let calls = RefCell::new(Vec::new());
    let mut actuator = |ctx: &mut EvalContext, promise: &Promise| {
        calls.borrow_mut().push((
            ctx.current_promise_type().unwrap().to_string(),
            promise.promiser.clone(),
        ));
        PromiseResult::Noop
    };

    let mut ctx = EvalContext::new();
    let ok = eval_bundle(&mut ctx, bundle, &[], false, 1, &mut actuator, &["files", "reports"]);

    assert!(ok);
    assert_eq!(
        calls.into_inner(),
        vec![
            ("files".to_string(), "P1".to_string()),
            ("reports".to_string(), "P2".to_string()),
        ]
    );
    assert_eq!(ctx.depth(), 0);
}

/// A guard-checking actuator, the way a real dispatcher behaves.
struct Guarded {
    actuated: Vec<String>,
    skipped: Vec<String>,
}

impl Actuator for Guarded {
    fn actuate(&mut self, ctx: &mut EvalContext, promise: &Promise) -> PromiseResult {
        if !ctx.eval_class_expression(&promise.context).unwrap_or(false) {
            self.skipped.push(promise.promiser.clone());
            return PromiseResult::Skipped;
        }
        self.actuated.push(promise.promiser.clone());
        PromiseResult::Noop
    }
}

#[test]
fn guards_are_evaluated_against_the_context() {
    let policy = Policy::from_json_str(
        r#"{ "bundles": [ { "name": "g", "promise_types": [
            { "name": "reports", "promises": [
                { "promiser": "always" },
                { "promiser": "never", "context": "!any" },
                { "promiser": "sometimes", "context": "any.(nothing|any)" }
            ] }
        ] } ] }"#,
    )
    .unwrap();
    let bundle = policy.get_bundle("default", "g").unwrap();

    let mut ctx = EvalContext::new();
    let mut guarded = Guarded {
        actuated: Vec::new(),
        skipped: Vec::new(),
    };
    assert!(eval_bundle(&mut ctx, bundle, &[], false, 1, &mut guarded, &["reports"]));
    assert_eq!(guarded.actuated, ["always", "sometimes"]);
    assert_eq!(guarded.skipped, ["never"]);
}
