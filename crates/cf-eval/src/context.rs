// context.rs - Run-scoped evaluation state.
//
// `EvalContext` owns the frame stack, the persistent variable and class
// tables, the abort signal and the set of one-shot promises already done.
// Frames are pushed through `FrameGuard`s which pop them on drop, so every
// exit path out of an evaluation (including abort and panics unwinding
// through it) leaves the stack balanced.

use std::collections::{BTreeMap, HashSet};
use std::ops::{Deref, DerefMut};

use crate::abort::AbortSignal;
use crate::classes;
use crate::error::EvalError;
use crate::policy::{Bundle, Rval, DEFAULT_NAMESPACE};
use crate::scope::{
    canonify, BundleFrame, ClassTable, PromiseTypeFrame, StackFrame, VarRef, VariableTable,
    THIS_SCOPE,
};

/// Scope used for variables put while no bundle frame is active.
pub const GLOBAL_SCOPE: &str = "global";

/// Where a soft class is defined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassScope {
    /// Visible everywhere for the rest of the run.
    Namespace,
    /// Visible only while the defining bundle frame is on the stack.
    Bundle,
}

/// Push/pop counters, mostly for tests and debug logging.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameStats {
    pub pushed: usize,
    pub popped: usize,
    pub max_depth: usize,
}

pub struct EvalContext {
    stack: Vec<StackFrame>,
    variables: VariableTable,
    classes: ClassTable,
    abort: AbortSignal,
    abort_classes: HashSet<String>,
    done: HashSet<String>,
    stats: FrameStats,
}

impl Default for EvalContext {
    fn default() -> Self {
        Self::new()
    }
}

impl EvalContext {
    /// A context with the discovered hard classes and `sys.*` variables.
    pub fn new() -> Self {
        let mut ctx = Self::bare(AbortSignal::new());
        ctx.discover();
        ctx
    }

    /// A context sharing an existing abort signal with its creator.
    pub fn with_abort_signal(abort: AbortSignal) -> Self {
        let mut ctx = Self::bare(abort);
        ctx.discover();
        ctx
    }

    fn bare(abort: AbortSignal) -> Self {
        Self {
            stack: Vec::new(),
            variables: VariableTable::new(),
            classes: ClassTable::new(),
            abort,
            abort_classes: HashSet::new(),
            done: HashSet::new(),
            stats: FrameStats::default(),
        }
    }

    fn discover(&mut self) {
        self.class_put_hard("any");
        self.class_put_hard(std::env::consts::OS);
        self.class_put_hard(std::env::consts::ARCH);

        let sys = |ctx: &mut Self, lval: &str, value: &str| {
            ctx.variables
                .put(DEFAULT_NAMESPACE, "sys", lval, Rval::from(value));
        };
        sys(self, "os", std::env::consts::OS);
        sys(self, "arch", std::env::consts::ARCH);
        sys(self, "cf_version", env!("CARGO_PKG_VERSION"));
        if let Some(host) = hostname() {
            self.class_put_hard(&host);
            sys(self, "host", &host);
        }
    }

    pub fn abort_signal(&self) -> &AbortSignal {
        &self.abort
    }

    /// Classes whose definition raises the abort signal.
    pub fn set_abort_classes<I, S>(&mut self, classes: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.abort_classes = classes
            .into_iter()
            .map(|c| canonify(c.as_ref()))
            .collect();
    }

    // -- frames --------------------------------------------------------------

    /// Push a bundle frame, binding `args` positionally to the bundle's
    /// parameters. Surplus arguments are ignored, missing ones are unbound.
    pub fn push_bundle_frame(
        &mut self,
        bundle: &Bundle,
        args: &[Rval],
        inherit_previous: bool,
    ) -> FrameGuard<'_> {
        if args.len() != bundle.parameters.len() {
            tracing::warn!(
                bundle = %bundle.qualified_name(),
                expected = bundle.parameters.len(),
                got = args.len(),
                "bundle called with mismatched argument count"
            );
        }
        let vars: BTreeMap<String, Rval> = bundle
            .parameters
            .iter()
            .cloned()
            .zip(args.iter().cloned())
            .collect();

        self.push(StackFrame::Bundle(BundleFrame {
            namespace: bundle.namespace.clone(),
            name: bundle.name.clone(),
            inherits_previous: inherit_previous,
            vars,
            classes: ClassTable::new(),
        }))
    }

    pub fn push_promise_type_frame(&mut self, name: &str, pass: usize) -> FrameGuard<'_> {
        self.push(StackFrame::PromiseType(PromiseTypeFrame {
            name: name.to_string(),
            pass,
            this: BTreeMap::new(),
        }))
    }

    fn push(&mut self, frame: StackFrame) -> FrameGuard<'_> {
        tracing::trace!(kind = frame.kind(), depth = self.stack.len(), "push frame");
        self.stack.push(frame);
        self.stats.pushed += 1;
        self.stats.max_depth = self.stats.max_depth.max(self.stack.len());
        let depth = self.stack.len();
        FrameGuard { ctx: self, depth }
    }

    fn pop(&mut self) {
        if let Some(frame) = self.stack.pop() {
            tracing::trace!(kind = frame.kind(), depth = self.stack.len(), "pop frame");
            self.stats.popped += 1;
        }
    }

    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    pub fn frame_stats(&self) -> FrameStats {
        self.stats
    }

    fn bundle_frames(&self) -> impl Iterator<Item = &BundleFrame> {
        self.stack.iter().rev().filter_map(|f| match f {
            StackFrame::Bundle(b) => Some(b),
            StackFrame::PromiseType(_) => None,
        })
    }

    /// The current bundle frame followed by every caller frame it can see
    /// through `inherits_previous`.
    fn visible_bundle_frames(&self) -> Vec<&BundleFrame> {
        let mut visible = Vec::new();
        for frame in self.bundle_frames() {
            visible.push(frame);
            if !frame.inherits_previous {
                break;
            }
        }
        visible
    }

    pub fn current_bundle(&self) -> Option<&BundleFrame> {
        self.bundle_frames().next()
    }

    fn current_promise_type_frame(&self) -> Option<&PromiseTypeFrame> {
        self.stack.iter().rev().find_map(|f| match f {
            StackFrame::PromiseType(pt) => Some(pt),
            StackFrame::Bundle(_) => None,
        })
    }

    pub fn current_promise_type(&self) -> Option<&str> {
        self.current_promise_type_frame().map(|pt| pt.name.as_str())
    }

    pub fn current_pass(&self) -> Option<usize> {
        self.current_promise_type_frame().map(|pt| pt.pass)
    }

    // -- variables -----------------------------------------------------------

    fn current_promise_type_frame_mut(&mut self) -> Option<&mut PromiseTypeFrame> {
        self.stack.iter_mut().rev().find_map(|f| match f {
            StackFrame::PromiseType(pt) => Some(pt),
            StackFrame::Bundle(_) => None,
        })
    }

    /// Set a `this.*` special variable on the innermost promise-type frame.
    /// Returns `false` when no promise-type frame is active.
    pub fn set_this(&mut self, lval: &str, rval: Rval) -> bool {
        match self.current_promise_type_frame_mut() {
            Some(pt) => {
                pt.this.insert(lval.to_string(), rval);
                true
            }
            None => false,
        }
    }

    /// Drop every `this.*` variable on the innermost promise-type frame.
    pub fn clear_this(&mut self) {
        if let Some(pt) = self.current_promise_type_frame_mut() {
            pt.this.clear();
        }
    }

    /// Where a reference lives in the persistent table. An unqualified
    /// reference belongs to the current bundle's namespace and scope.
    fn table_key(&self, var: &VarRef) -> (String, String) {
        match (&var.scope, self.current_bundle()) {
            (Some(scope), _) => (var.namespace_or_default().to_string(), scope.clone()),
            (None, Some(bundle)) => (bundle.namespace.clone(), bundle.name.clone()),
            (None, None) => (DEFAULT_NAMESPACE.to_string(), GLOBAL_SCOPE.to_string()),
        }
    }

    /// Put a variable in the persistent table.
    pub fn variable_put(&mut self, var: &VarRef, rval: Rval) -> Option<Rval> {
        let (namespace, scope) = self.table_key(var);
        self.variables.put(&namespace, &scope, &var.lval, rval)
    }

    pub fn variable_remove(&mut self, var: &VarRef) -> Option<Rval> {
        let (namespace, scope) = self.table_key(var);
        self.variables.remove(&namespace, &scope, &var.lval)
    }

    /// Resolve a variable reference against the frame stack and the
    /// persistent table.
    pub fn variable_get(&self, var: &VarRef) -> Option<&Rval> {
        if var.scope.as_deref() == Some(THIS_SCOPE) {
            return self
                .current_promise_type_frame()
                .and_then(|pt| pt.this.get(&var.lval));
        }

        match &var.scope {
            None => {
                for frame in self.visible_bundle_frames() {
                    if let Some(rval) = frame.vars.get(&var.lval) {
                        return Some(rval);
                    }
                    if let Some(rval) = self.variables.get(&frame.namespace, &frame.name, &var.lval)
                    {
                        return Some(rval);
                    }
                }
                self.variables
                    .get(DEFAULT_NAMESPACE, GLOBAL_SCOPE, &var.lval)
            }
            Some(scope) => {
                let namespace = var.namespace_or_default();
                let frame_hit = self
                    .visible_bundle_frames()
                    .into_iter()
                    .find(|f| f.name == *scope && f.namespace == namespace)
                    .and_then(|f| f.vars.get(&var.lval));
                frame_hit.or_else(|| self.variables.get(namespace, scope, &var.lval))
            }
        }
    }

    /// Expand `$(ref)` and `${ref}` occurrences that resolve to scalars.
    /// Unresolved references and lists are left untouched.
    pub fn expand_scalar(&self, input: &str) -> String {
        let mut out = String::with_capacity(input.len());
        let mut rest = input;

        while let Some(start) = rest.find('$') {
            out.push_str(&rest[..start]);
            let after = &rest[start + 1..];
            let close = match after.chars().next() {
                Some('(') => ')',
                Some('{') => '}',
                _ => {
                    out.push('$');
                    rest = after;
                    continue;
                }
            };
            match after[1..].find(close) {
                Some(end) => {
                    let name = &after[1..end + 1];
                    let resolved = self
                        .variable_get(&VarRef::parse(name))
                        .and_then(Rval::as_scalar);
                    match resolved {
                        Some(value) => out.push_str(value),
                        None => out.push_str(&rest[start..start + end + 3]),
                    }
                    rest = &after[end + 2..];
                }
                None => {
                    out.push_str(&rest[start..]);
                    rest = "";
                }
            }
        }
        out.push_str(rest);
        out
    }

    // -- classes -------------------------------------------------------------

    pub fn class_put_hard(&mut self, name: &str) {
        self.classes.put(name);
    }

    /// Define a soft class. Returns `true` if it was not defined before in
    /// that scope. Defining a configured abort class raises the abort signal.
    pub fn class_put_soft(&mut self, name: &str, scope: ClassScope) -> bool {
        let canonical = canonify(name);
        let bundle_frame = self.stack.iter_mut().rev().find_map(|f| match f {
            StackFrame::Bundle(b) => Some(b),
            StackFrame::PromiseType(_) => None,
        });
        let added = match (scope, bundle_frame) {
            (ClassScope::Bundle, Some(frame)) => frame.classes.put(&canonical),
            _ => self.classes.put(&canonical),
        };

        if self.abort_classes.contains(&canonical) {
            tracing::warn!(class = %canonical, "abort class defined, aborting run");
            self.abort.raise();
        }
        added
    }

    pub fn class_remove(&mut self, name: &str) -> bool {
        self.classes.remove(name)
    }

    pub fn is_defined_class(&self, name: &str) -> bool {
        let name = name
            .strip_prefix(DEFAULT_NAMESPACE)
            .and_then(|rest| rest.strip_prefix(':'))
            .unwrap_or(name);
        if self.classes.contains(name) {
            return true;
        }
        self.visible_bundle_frames()
            .iter()
            .any(|frame| frame.classes.contains(name))
    }

    pub fn eval_class_expression(&self, expression: &str) -> Result<bool, EvalError> {
        classes::evaluate(expression, |name| self.is_defined_class(name))
    }

    // -- one-shot promises ---------------------------------------------------

    /// Record a promise as done for this run. Returns `false` if it already was.
    pub fn mark_promise_done(&mut self, key: &str) -> bool {
        self.done.insert(key.to_string())
    }

    pub fn promise_is_done(&self, key: &str) -> bool {
        self.done.contains(key)
    }
}

/// Scoped ownership of one pushed frame.
///
/// Derefs to the context so nested frames and actuator calls go through the
/// guard. Dropping it pops exactly the frame it pushed; finding any other
/// depth at that point means a frame leaked and is a fatal contract breach.
pub struct FrameGuard<'a> {
    ctx: &'a mut EvalContext,
    depth: usize,
}

impl Deref for FrameGuard<'_> {
    type Target = EvalContext;

    fn deref(&self) -> &EvalContext {
        self.ctx
    }
}

impl DerefMut for FrameGuard<'_> {
    fn deref_mut(&mut self) -> &mut EvalContext {
        self.ctx
    }
}

impl Drop for FrameGuard<'_> {
    fn drop(&mut self) {
        if self.ctx.stack.len() != self.depth && !std::thread::panicking() {
            panic!(
                "frame stack imbalance: expected depth {}, found {}",
                self.depth,
                self.ctx.stack.len()
            );
        }
        self.ctx.pop();
    }
}

fn hostname() -> Option<String> {
    let mut buf = [0u8; 256];
    // SAFETY: the buffer is valid for `buf.len()` bytes for the whole call.
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if rc != 0 {
        return None;
    }
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    let name = String::from_utf8_lossy(&buf[..end]).into_owned();
    if name.is_empty() {
        None
    } else {
        Some(name)
    }
}
