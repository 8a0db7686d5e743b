//! Argument tree walking and slot normalization
//!
//! [`CallArgs`] collects the positional and keyword arguments of a
//! user-level invocation; the walker turns them into storage-shaped slots,
//! replacing embedded deferred calls with references and normalizing
//! literals. Traversal is shallow on purpose: a deferred call is accepted
//! only as a direct argument. One buried inside a list or object literal can
//! never become a dependency edge, so it is rejected outright, keeping the
//! dependency graph explicit.
//!
//! [`CallInput`] is the other end of the pipeline: the materialized values a
//! node body receives once every referenced call has resolved.

use crate::call::{Deferred, DeferredRepr, Slot, CALL_MARKER};
use crate::error::{MyceliaError, Result};
use crate::node::Node;
use serde_json::Value;
use std::collections::BTreeMap;

/// Builder for the arguments of one call
///
/// Positional arguments keep insertion order; keyword arguments are keyed by
/// name. Every argument position accepts either a concrete value or a
/// deferred call.
#[derive(Debug, Clone, Default)]
pub struct CallArgs {
    positional: Vec<Deferred>,
    keyword: BTreeMap<String, Deferred>,
}

impl CallArgs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a positional argument.
    pub fn arg(mut self, value: impl Into<Deferred>) -> Self {
        self.positional.push(value.into());
        self
    }

    /// Append several positional arguments.
    pub fn args<I, D>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = D>,
        D: Into<Deferred>,
    {
        self.positional.extend(values.into_iter().map(Into::into));
        self
    }

    /// Set a keyword argument.
    pub fn kwarg(mut self, name: impl Into<String>, value: impl Into<Deferred>) -> Self {
        self.keyword.insert(name.into(), value.into());
        self
    }

    pub fn positional_len(&self) -> usize {
        self.positional.len()
    }

    pub fn keyword_names(&self) -> impl Iterator<Item = &str> {
        self.keyword.keys().map(String::as_str)
    }
}

/// Walk an invocation's arguments into slots, validating against the schema.
pub(crate) fn build_slots(
    node: &Node,
    args: CallArgs,
) -> Result<(Vec<Slot>, BTreeMap<String, Slot>)> {
    node.spec()
        .validate(node.name(), args.positional.len(), args.keyword.keys())?;

    let positional = args
        .positional
        .into_iter()
        .map(|deferred| to_slot(node.name(), deferred))
        .collect::<Result<Vec<_>>>()?;

    let keyword = args
        .keyword
        .into_iter()
        .map(|(name, deferred)| Ok((name, to_slot(node.name(), deferred)?)))
        .collect::<Result<BTreeMap<_, _>>>()?;

    Ok((positional, keyword))
}

fn to_slot(node: &str, deferred: Deferred) -> Result<Slot> {
    match deferred.into_repr() {
        DeferredRepr::Call(call) => Ok(Slot::Call(call)),
        DeferredRepr::Value(value) => {
            if contains_call_marker(&value) {
                return Err(MyceliaError::UnreachableDeferredCall(node.to_string()));
            }
            Ok(Slot::Literal(value))
        }
    }
}

fn contains_call_marker(value: &Value) -> bool {
    match value {
        Value::Object(map) => {
            map.contains_key(CALL_MARKER) || map.values().any(contains_call_marker)
        }
        Value::Array(items) => items.iter().any(contains_call_marker),
        _ => false,
    }
}

/// Materialized arguments handed to a node body
///
/// Positional values appear in declaration order; keyword values are keyed
/// by name. Slots that referenced other calls have been replaced by those
/// calls' resolved values.
#[derive(Debug, Clone, Default)]
pub struct CallInput {
    args: Vec<Value>,
    kwargs: BTreeMap<String, Value>,
}

impl CallInput {
    pub(crate) fn new(args: Vec<Value>, kwargs: BTreeMap<String, Value>) -> Self {
        Self { args, kwargs }
    }

    /// Positional argument by index.
    pub fn arg(&self, index: usize) -> Option<&Value> {
        self.args.get(index)
    }

    /// Keyword argument by name.
    pub fn kwarg(&self, name: &str) -> Option<&Value> {
        self.kwargs.get(name)
    }

    /// All positional values in declaration order.
    pub fn args(&self) -> &[Value] {
        &self.args
    }

    /// All keyword values.
    pub fn kwargs(&self) -> &BTreeMap<String, Value> {
        &self.kwargs
    }

    /// The variadic tail after the first `declared` positionals.
    pub fn variadic(&self, declared: usize) -> &[Value] {
        self.args.get(declared..).unwrap_or(&[])
    }
}
