// scope.rs - Variable references, variable/class tables and stack frames.
//
// The evaluation stack is a LIFO of frames. A bundle frame owns the
// bundle-local variables (call arguments) and bundle-scoped classes. A
// promise-type frame owns the `this.*` special variables of the promise
// currently being actuated.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

use crate::policy::{Rval, DEFAULT_NAMESPACE};

/// Scope name for promise-local special variables.
pub const THIS_SCOPE: &str = "this";

/// Replace every character that cannot appear in a class name with `_`.
pub fn canonify(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// A parsed variable reference: `lval`, `scope.lval` or `ns:scope.lval`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VarRef {
    pub namespace: Option<String>,
    pub scope: Option<String>,
    pub lval: String,
}

impl VarRef {
    pub fn parse(reference: &str) -> Self {
        let (namespace, rest) = match reference.split_once(':') {
            Some((ns, rest)) => (Some(ns.to_string()), rest),
            None => (None, reference),
        };
        let (scope, lval) = match rest.split_once('.') {
            Some((scope, lval)) => (Some(scope.to_string()), lval.to_string()),
            None => (None, rest.to_string()),
        };
        Self {
            namespace,
            scope,
            lval,
        }
    }

    pub fn qualified(scope: &str, lval: &str) -> Self {
        Self {
            namespace: None,
            scope: Some(scope.to_string()),
            lval: lval.to_string(),
        }
    }

    pub fn namespace_or_default(&self) -> &str {
        self.namespace.as_deref().unwrap_or(DEFAULT_NAMESPACE)
    }
}

impl fmt::Display for VarRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ns) = &self.namespace {
            write!(f, "{}:", ns)?;
        }
        if let Some(scope) = &self.scope {
            write!(f, "{}.", scope)?;
        }
        write!(f, "{}", self.lval)
    }
}

/// Variables keyed by `(namespace, scope, lval)`.
#[derive(Debug, Clone, Default)]
pub struct VariableTable {
    vars: HashMap<(String, String, String), Rval>,
}

impl VariableTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace. Returns the previous value, if any.
    pub fn put(&mut self, namespace: &str, scope: &str, lval: &str, rval: Rval) -> Option<Rval> {
        self.vars.insert(
            (namespace.to_string(), scope.to_string(), lval.to_string()),
            rval,
        )
    }

    pub fn get(&self, namespace: &str, scope: &str, lval: &str) -> Option<&Rval> {
        self.vars
            .get(&(namespace.to_string(), scope.to_string(), lval.to_string()))
    }

    pub fn remove(&mut self, namespace: &str, scope: &str, lval: &str) -> Option<Rval> {
        self.vars
            .remove(&(namespace.to_string(), scope.to_string(), lval.to_string()))
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }
}

/// A set of defined classes. Names are stored canonified.
#[derive(Debug, Clone, Default)]
pub struct ClassTable {
    classes: HashSet<String>,
}

impl ClassTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if the class was newly defined.
    pub fn put(&mut self, name: &str) -> bool {
        self.classes.insert(canonify(name))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.classes.contains(name)
    }

    pub fn remove(&mut self, name: &str) -> bool {
        self.classes.remove(&canonify(name))
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &String> {
        self.classes.iter()
    }
}

/// Frame pushed for each bundle invocation.
#[derive(Debug, Clone)]
pub struct BundleFrame {
    pub namespace: String,
    pub name: String,
    /// When set, lookups that miss in this frame continue in the caller's
    /// bundle frame.
    pub inherits_previous: bool,
    /// Parameters bound from the call arguments.
    pub vars: BTreeMap<String, Rval>,
    /// Classes defined with bundle scope.
    pub classes: ClassTable,
}

/// Frame pushed while the promises of one promise type are actuated.
#[derive(Debug, Clone)]
pub struct PromiseTypeFrame {
    pub name: String,
    pub pass: usize,
    /// `this.*` special variables for the promise being actuated.
    pub this: BTreeMap<String, Rval>,
}

#[derive(Debug, Clone)]
pub enum StackFrame {
    Bundle(BundleFrame),
    PromiseType(PromiseTypeFrame),
}

impl StackFrame {
    pub fn kind(&self) -> &'static str {
        match self {
            StackFrame::Bundle(_) => "bundle",
            StackFrame::PromiseType(_) => "promise_type",
        }
    }
}
