// policy.rs - The parsed policy tree: bundles, promise types, promises.
//
// The agent consumes policy that has already been parsed. The tree is loaded
// from its JSON form and is read-only for the whole run; evaluation state
// lives in `EvalContext`, never here.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::EvalError;

pub const DEFAULT_NAMESPACE: &str = "default";

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

fn default_bundle_type() -> String {
    "agent".to_string()
}

fn default_context() -> String {
    "any".to_string()
}

/// A right-hand value in a promise constraint.
///
/// `untagged` lets the JSON form stay natural: a string is a scalar, an
/// array is a list, an object is an inline body (`copy_from`, `usebundle`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Rval {
    Scalar(String),
    List(Vec<String>),
    Body(BTreeMap<String, Rval>),
}

impl Rval {
    pub fn as_scalar(&self) -> Option<&str> {
        match self {
            Rval::Scalar(s) => Some(s),
            _ => None,
        }
    }

    /// Lists as-is; a scalar is treated as a one-element list.
    pub fn to_list(&self) -> Vec<String> {
        match self {
            Rval::Scalar(s) => vec![s.clone()],
            Rval::List(items) => items.clone(),
            Rval::Body(_) => Vec::new(),
        }
    }

    pub fn as_body(&self) -> Option<&BTreeMap<String, Rval>> {
        match self {
            Rval::Body(body) => Some(body),
            _ => None,
        }
    }
}

impl From<&str> for Rval {
    fn from(s: &str) -> Self {
        Rval::Scalar(s.to_string())
    }
}

impl From<String> for Rval {
    fn from(s: String) -> Self {
        Rval::Scalar(s)
    }
}

impl From<Vec<String>> for Rval {
    fn from(items: Vec<String>) -> Self {
        Rval::List(items)
    }
}

/// Parse a boolean constraint value the way policy writers spell them.
pub fn parse_bool(value: &str) -> Option<bool> {
    match value {
        "true" | "yes" | "on" => Some(true),
        "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// A single promise: "promiser promises <attributes> when <context>".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Promise {
    pub promiser: String,
    /// Class expression guarding the promise.
    #[serde(default = "default_context")]
    pub context: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, Rval>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handle: Option<String>,
}

impl Promise {
    pub fn new(promiser: impl Into<String>) -> Self {
        Self {
            promiser: promiser.into(),
            context: default_context(),
            attributes: BTreeMap::new(),
            handle: None,
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = context.into();
        self
    }

    pub fn with_attribute(mut self, lval: impl Into<String>, rval: impl Into<Rval>) -> Self {
        self.attributes.insert(lval.into(), rval.into());
        self
    }

    pub fn with_handle(mut self, handle: impl Into<String>) -> Self {
        self.handle = Some(handle.into());
        self
    }

    pub fn attribute(&self, lval: &str) -> Option<&Rval> {
        self.attributes.get(lval)
    }

    pub fn scalar(&self, lval: &str) -> Option<&str> {
        self.attribute(lval).and_then(Rval::as_scalar)
    }

    pub fn list(&self, lval: &str) -> Vec<String> {
        self.attribute(lval).map(Rval::to_list).unwrap_or_default()
    }

    pub fn body(&self, lval: &str) -> Option<&BTreeMap<String, Rval>> {
        self.attribute(lval).and_then(Rval::as_body)
    }

    pub fn flag(&self, lval: &str) -> Option<bool> {
        self.scalar(lval).and_then(parse_bool)
    }
}

/// A named group of promises inside a bundle (`files`, `reports`, ...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromiseType {
    pub name: String,
    #[serde(default)]
    pub promises: Vec<Promise>,
}

impl PromiseType {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            promises: Vec::new(),
        }
    }

    pub fn with_promise(mut self, promise: Promise) -> Self {
        self.promises.push(promise);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.promises.is_empty()
    }
}

/// A named, parameterized collection of promise types.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bundle {
    pub name: String,
    #[serde(rename = "type", default = "default_bundle_type")]
    pub bundle_type: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default)]
    pub parameters: Vec<String>,
    #[serde(default)]
    pub promise_types: Vec<PromiseType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_path: Option<PathBuf>,
}

impl Bundle {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            bundle_type: default_bundle_type(),
            namespace: default_namespace(),
            parameters: Vec::new(),
            promise_types: Vec::new(),
            source_path: None,
        }
    }

    pub fn with_parameters(mut self, parameters: &[&str]) -> Self {
        self.parameters = parameters.iter().map(|p| p.to_string()).collect();
        self
    }

    pub fn with_promise_type(mut self, promise_type: PromiseType) -> Self {
        self.promise_types.push(promise_type);
        self
    }

    /// Look up a promise type section by name. The first section wins if the
    /// same name appears twice.
    pub fn promise_type(&self, name: &str) -> Option<&PromiseType> {
        self.promise_types.iter().find(|pt| pt.name == name)
    }

    /// `namespace:name`, or just `name` in the default namespace.
    pub fn qualified_name(&self) -> String {
        if self.namespace == DEFAULT_NAMESPACE {
            self.name.clone()
        } else {
            format!("{}:{}", self.namespace, self.name)
        }
    }
}

/// A reference to a bundle with call arguments: `main`, `ns:lib(a, b)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleCall {
    pub namespace: Option<String>,
    pub name: String,
    pub args: Vec<String>,
}

impl BundleCall {
    pub fn parse(reference: &str) -> Result<Self, EvalError> {
        let reference = reference.trim();
        let invalid = |reason: &str| EvalError::InvalidPolicy {
            reason: format!("bad bundle reference '{}': {}", reference, reason),
        };

        let (head, args) = match reference.find('(') {
            Some(open) => {
                let inner = reference[open + 1..]
                    .strip_suffix(')')
                    .ok_or_else(|| invalid("missing ')'"))?;
                let args = if inner.trim().is_empty() {
                    Vec::new()
                } else {
                    inner
                        .split(',')
                        .map(|a| a.trim().trim_matches('"').to_string())
                        .collect()
                };
                (&reference[..open], args)
            }
            None => (reference, Vec::new()),
        };

        let (namespace, name) = match head.split_once(':') {
            Some((ns, name)) => (Some(ns.to_string()), name.to_string()),
            None => (None, head.to_string()),
        };
        if name.is_empty() {
            return Err(invalid("empty bundle name"));
        }

        Ok(Self {
            namespace,
            name,
            args,
        })
    }
}

impl fmt::Display for BundleCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ns) = &self.namespace {
            write!(f, "{}:", ns)?;
        }
        write!(f, "{}", self.name)?;
        if !self.args.is_empty() {
            write!(f, "({})", self.args.join(", "))?;
        }
        Ok(())
    }
}

/// The whole parsed policy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    /// Common control bundlesequence; the agent config may override it.
    #[serde(default)]
    pub bundlesequence: Vec<String>,
    #[serde(default)]
    pub bundles: Vec<Bundle>,
}

impl Policy {
    pub fn from_json_str(json: &str) -> Result<Self, EvalError> {
        let policy: Policy = serde_json::from_str(json)?;
        policy.validate()?;
        Ok(policy)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, EvalError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| EvalError::ReadFailed {
            path: path.to_path_buf(),
            source,
        })?;
        let mut policy = Self::from_json_str(&json)?;
        for bundle in &mut policy.bundles {
            if bundle.source_path.is_none() {
                bundle.source_path = Some(path.to_path_buf());
            }
        }
        Ok(policy)
    }

    /// Structural checks the parser would normally have done.
    pub fn validate(&self) -> Result<(), EvalError> {
        let mut seen = HashSet::new();
        for bundle in &self.bundles {
            if bundle.name.is_empty() {
                return Err(EvalError::InvalidPolicy {
                    reason: "bundle with empty name".to_string(),
                });
            }
            let key = (bundle.namespace.as_str(), bundle.name.as_str());
            if !seen.insert(key) {
                return Err(EvalError::InvalidPolicy {
                    reason: format!("duplicate bundle '{}'", bundle.qualified_name()),
                });
            }
            let mut params = HashSet::new();
            for param in &bundle.parameters {
                if !params.insert(param) {
                    return Err(EvalError::InvalidPolicy {
                        reason: format!(
                            "bundle '{}' declares parameter '{}' twice",
                            bundle.qualified_name(),
                            param
                        ),
                    });
                }
            }
        }
        Ok(())
    }

    pub fn get_bundle(&self, namespace: &str, name: &str) -> Option<&Bundle> {
        self.bundles
            .iter()
            .find(|b| b.namespace == namespace && b.name == name)
    }

    /// Resolve a call; an unqualified name is looked up in the default
    /// namespace.
    pub fn resolve(&self, call: &BundleCall) -> Result<&Bundle, EvalError> {
        let namespace = call.namespace.as_deref().unwrap_or(DEFAULT_NAMESPACE);
        self.get_bundle(namespace, &call.name)
            .ok_or_else(|| EvalError::UndefinedBundle {
                name: call.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const SAMPLE: &str = r#"{
        "bundlesequence": ["main"],
        "bundles": [
            {
                "name": "main",
                "parameters": ["who"],
                "promise_types": [
                    {
                        "name": "files",
                        "promises": [
                            {
                                "promiser": "/tmp/motd",
                                "attributes": {
                                    "create": "true",
                                    "copy_from": { "source": "/srv/motd", "servers": ["hub"] }
                                }
                            }
                        ]
                    },
                    {
                        "name": "reports",
                        "promises": [ { "promiser": "hello $(who)", "context": "linux" } ]
                    }
                ]
            }
        ]
    }"#;

    #[test]
    fn loads_policy_with_defaults() {
        let policy = Policy::from_json_str(SAMPLE).unwrap();
        let bundle = policy.get_bundle("default", "main").unwrap();
        assert_eq!(bundle.bundle_type, "agent");
        assert_eq!(bundle.parameters, vec!["who".to_string()]);

        let files = bundle.promise_type("files").unwrap();
        let promise = &files.promises[0];
        assert_eq!(promise.context, "any");
        assert_eq!(promise.flag("create"), Some(true));
        let copy = promise.body("copy_from").unwrap();
        assert_eq!(copy["servers"].to_list(), vec!["hub".to_string()]);

        let reports = bundle.promise_type("reports").unwrap();
        assert_eq!(reports.promises[0].context, "linux");
    }

    #[test]
    fn from_file_records_source_path() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("promises.json");
        std::fs::write(&path, SAMPLE).unwrap();

        let policy = Policy::from_json_file(&path).unwrap();
        assert_eq!(policy.bundles[0].source_path.as_deref(), Some(path.as_path()));
    }

    #[test]
    fn duplicate_bundles_are_rejected() {
        let policy = Policy {
            bundlesequence: vec![],
            bundles: vec![Bundle::new("a"), Bundle::new("a")],
        };
        assert!(matches!(
            policy.validate(),
            Err(EvalError::InvalidPolicy { .. })
        ));
    }

    #[test]
    fn bundle_call_parsing() {
        let call = BundleCall::parse("main").unwrap();
        assert_eq!(call.name, "main");
        assert!(call.args.is_empty());

        let call = BundleCall::parse("lib:copy(\"/etc/a\", b)").unwrap();
        assert_eq!(call.namespace.as_deref(), Some("lib"));
        assert_eq!(call.name, "copy");
        assert_eq!(call.args, vec!["/etc/a".to_string(), "b".to_string()]);
        assert_eq!(call.to_string(), "lib:copy(/etc/a, b)");

        assert!(BundleCall::parse("broken(").is_err());
        assert!(BundleCall::parse("()").is_err());
    }

    #[test]
    fn resolve_reports_undefined_bundles() {
        let policy = Policy::from_json_str(SAMPLE).unwrap();
        let missing = BundleCall::parse("nope").unwrap();
        assert!(matches!(
            policy.resolve(&missing),
            Err(EvalError::UndefinedBundle { .. })
        ));
    }
}
