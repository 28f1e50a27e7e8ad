//! # cf-eval
//!
//! The promise evaluation core: the parsed policy model, the run-scoped
//! [`EvalContext`] with its frame stack, class expressions, and
//! [`eval_bundle`], which walks one bundle and hands each promise to an
//! [`Actuator`].
//!
//! ## Quick Example
//!
//! ```rust
//! use cf_eval::{eval_bundle, Bundle, EvalContext, Promise, PromiseResult, PromiseType};
//!
//! let bundle = Bundle::new("main")
//!     .with_promise_type(PromiseType::new("reports").with_promise(Promise::new("hello")));
//! let mut ctx = EvalContext::new();
//! let mut report = |_: &mut EvalContext, p: &Promise| {
//!     println!("R: {}", p.promiser);
//!     PromiseResult::Noop
//! };
//! assert!(eval_bundle(&mut ctx, &bundle, &[], false, 1, &mut report, &["reports"]));
//! ```

pub mod abort;
pub mod actuator;
pub mod classes;
pub mod context;
pub mod error;
pub mod evaluator;
pub mod policy;
pub mod scope;

pub use abort::AbortSignal;
pub use actuator::{Actuator, Compliance, PromiseResult};
pub use context::{ClassScope, EvalContext, FrameGuard, FrameStats};
pub use error::EvalError;
pub use evaluator::eval_bundle;
pub use policy::{parse_bool, Bundle, BundleCall, Policy, Promise, PromiseType, Rval};
pub use scope::{canonify, VarRef};
