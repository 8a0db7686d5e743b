//! Graph registry: the namespace a call resolves its node in
//!
//! Register-only. Nodes are added before a session opens; the first open
//! freezes the graph, and every worker sharing the graph sees the same set.

use crate::error::{MyceliaError, Result};
use crate::args::CallInput;
use crate::context::Context;
use crate::node::{ArgSpec, Node, NodeFuture, NodeHandle};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

/// Named collection of nodes
pub struct Graph {
    name: String,
    nodes: RwLock<HashMap<String, Arc<Node>>>,
    frozen: AtomicBool,
}

impl Graph {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            nodes: RwLock::new(HashMap::new()),
            frozen: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register a node under a stable name.
    ///
    /// Fails when the name is taken or the graph has been frozen by a
    /// session. The returned handle is how user code builds calls of this
    /// node.
    pub fn node<F>(&self, name: impl Into<String>, spec: ArgSpec, body: F) -> Result<NodeHandle>
    where
        F: Fn(Context, CallInput) -> NodeFuture + Send + Sync + 'static,
    {
        let name = name.into();
        if self.frozen.load(Ordering::Acquire) {
            return Err(MyceliaError::GraphFrozen(self.name.clone()));
        }

        let mut nodes = self.nodes.write().expect("graph registry lock poisoned");
        if nodes.contains_key(&name) {
            return Err(MyceliaError::DuplicateNodeRegistration(name));
        }

        let node = Arc::new(Node::new(name.clone(), spec, Arc::new(body)));
        nodes.insert(name, node.clone());
        tracing::debug!(graph = %self.name, node = %node.name(), "node registered");
        Ok(NodeHandle::new(self.name.clone(), node))
    }

    /// Look up a node by name.
    pub(crate) fn lookup(&self, name: &str) -> Option<Arc<Node>> {
        self.nodes
            .read()
            .expect("graph registry lock poisoned")
            .get(name)
            .cloned()
    }

    /// Number of registered nodes.
    pub fn node_count(&self) -> usize {
        self.nodes.read().expect("graph registry lock poisoned").len()
    }

    /// Make the graph immutable. Called by the first session open.
    pub(crate) fn freeze(&self) {
        self.frozen.store(true, Ordering::Release);
    }
}

impl fmt::Debug for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Graph")
            .field("name", &self.name)
            .field("nodes", &self.node_count())
            .field("frozen", &self.frozen.load(Ordering::Acquire))
            .finish()
    }
}
