//! Registered nodes and their argument schemas
//!
//! A [`Node`] is an asynchronous procedure registered once at process start
//! and shared by every worker that shares the graph. Its body receives a
//! [`Context`] and the materialized [`CallInput`], and returns a
//! [`Deferred`]: a concrete value to resolve, or another call to tail-call
//! into.
//!
//! [`NodeHandle`] is what registration hands back to user code; invoking it
//! with [`CallArgs`] produces a [`Call`] without executing anything.

use crate::args::{self, CallArgs, CallInput};
use crate::call::{Call, Deferred};
use crate::context::Context;
use crate::error::{MyceliaError, Result};
use mycelia_adapters::NodeRef;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Type alias for the future a node body returns
pub type NodeFuture = Pin<Box<dyn Future<Output = Result<Deferred>> + Send>>;

/// Type alias for node body functions
pub type NodeFn = Arc<dyn Fn(Context, CallInput) -> NodeFuture + Send + Sync>;

/// Argument schema of a node: the full classical argument shape
///
/// Declared positionals are required; the variadic flag admits a tail of
/// extras. Declared keyword-only names are required; the variadic flag
/// admits arbitrary extra keywords.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ArgSpec {
    /// Number of declared positional parameters
    pub positional: usize,
    /// Accept extra positionals beyond the declared count
    pub variadic_positional: bool,
    /// Declared keyword-only parameter names
    pub keyword: Vec<String>,
    /// Accept keyword arguments beyond the declared names
    pub variadic_keyword: bool,
}

impl ArgSpec {
    /// Schema with `count` required positional parameters and nothing else.
    pub fn positional(count: usize) -> Self {
        Self {
            positional: count,
            ..Self::default()
        }
    }

    pub fn with_variadic_positional(mut self) -> Self {
        self.variadic_positional = true;
        self
    }

    pub fn with_keyword<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.keyword.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn with_variadic_keyword(mut self) -> Self {
        self.variadic_keyword = true;
        self
    }

    pub(crate) fn validate<'a>(
        &self,
        node: &str,
        n_positional: usize,
        provided_keywords: impl Iterator<Item = &'a String>,
    ) -> Result<()> {
        if n_positional < self.positional {
            return Err(MyceliaError::invalid_arguments(
                node,
                format!(
                    "expected {} positional argument(s), got {}",
                    self.positional, n_positional
                ),
            ));
        }
        if n_positional > self.positional && !self.variadic_positional {
            return Err(MyceliaError::invalid_arguments(
                node,
                format!(
                    "expected at most {} positional argument(s), got {}",
                    self.positional, n_positional
                ),
            ));
        }

        let provided: BTreeSet<&str> = provided_keywords.map(String::as_str).collect();
        for name in &provided {
            if !self.keyword.iter().any(|known| known == name) && !self.variadic_keyword {
                return Err(MyceliaError::invalid_arguments(
                    node,
                    format!("unexpected keyword argument '{}'", name),
                ));
            }
        }
        for name in &self.keyword {
            if !provided.contains(name.as_str()) {
                return Err(MyceliaError::invalid_arguments(
                    node,
                    format!("missing keyword argument '{}'", name),
                ));
            }
        }
        Ok(())
    }
}

/// A registered asynchronous procedure
pub struct Node {
    name: String,
    spec: ArgSpec,
    body: NodeFn,
}

impl Node {
    pub(crate) fn new(name: impl Into<String>, spec: ArgSpec, body: NodeFn) -> Self {
        Self {
            name: name.into(),
            spec,
            body,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn spec(&self) -> &ArgSpec {
        &self.spec
    }

    pub(crate) fn invoke(&self, context: Context, input: CallInput) -> NodeFuture {
        (self.body)(context, input)
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name)
            .field("spec", &self.spec)
            .finish()
    }
}

/// Handle to a registered node; invoking it builds deferred calls
#[derive(Clone)]
pub struct NodeHandle {
    graph: String,
    node: Arc<Node>,
}

impl NodeHandle {
    pub(crate) fn new(graph: String, node: Arc<Node>) -> Self {
        Self { graph, node }
    }

    pub fn name(&self) -> &str {
        self.node.name()
    }

    /// Build a deferred call of this node with the given arguments.
    ///
    /// Nothing executes here: the call is a value that can be passed to
    /// other calls, returned from a node body, submitted for background
    /// execution, or handed to `Session::execute`.
    pub fn call(&self, args: CallArgs) -> Result<Call> {
        let (positional, keyword) = args::build_slots(&self.node, args)?;
        Call::new(
            NodeRef::new(self.graph.clone(), self.node.name()),
            positional,
            keyword,
        )
    }
}

impl fmt::Debug for NodeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeHandle")
            .field("graph", &self.graph)
            .field("node", &self.node.name())
            .finish()
    }
}
