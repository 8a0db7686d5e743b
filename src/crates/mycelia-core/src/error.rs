//! Error types and error handling for the task-graph runtime
//!
//! All errors implement `std::error::Error` via the `thiserror` crate.
//! User-level failures (a node body returning an error, a failed dependency)
//! travel through the dependency graph as [`ErrorInfo`] values recorded in
//! storage; they surface back to callers of `execute` as [`MyceliaError`].
//! Infrastructure failures (`Broker`/`Storage` variants) are retried with
//! backoff and never recorded against a call.
//!
//! # Error Hierarchy
//!
//! ```text
//! MyceliaError
//! ├── Registration       - NodeNotRegistered, DuplicateNodeRegistration,
//! │                        GraphFrozen
//! ├── Call building      - InvalidArguments, NonSerializableArgument,
//! │                        NonDeterministicArgument, UnreachableDeferredCall
//! ├── Execution          - NodeExecution, DependencyFailed, CallFailed,
//! │                        NonSerializableResult
//! ├── Infrastructure     - BrokerUnavailable, StorageUnavailable (retried)
//! ├── Lifecycle          - SessionCancelled
//! └── Wire               - MalformedCall, Custom
//! ```
//!
//! # Error Handling Patterns
//!
//! ## Basic Error Handling
//!
//! ```rust
//! use mycelia_core::{ArgSpec, Deferred, Graph, MyceliaError};
//! use serde_json::Value;
//!
//! fn build_graph() -> Result<(), MyceliaError> {
//!     let graph = Graph::new("demo");
//!
//!     graph.node("hello", ArgSpec::default(), |_ctx, _input| {
//!         Box::pin(async { Ok(Deferred::value(Value::Null)) })
//!     })?; // may return DuplicateNodeRegistration or GraphFrozen
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Matching Specific Errors
//!
//! ```rust
//! use mycelia_core::MyceliaError;
//!
//! fn handle(err: MyceliaError) -> String {
//!     match err {
//!         MyceliaError::DependencyFailed { dependency, inner } => {
//!             format!("never ran, {} failed: {}", dependency.short(), inner.message)
//!         }
//!         MyceliaError::NodeExecution { node, message } => {
//!             format!("failed at {}: {}", node, message)
//!         }
//!         MyceliaError::SessionCancelled => "torn down".to_string(),
//!         _ => format!("error: {}", err),
//!     }
//! }
//! ```

use mycelia_adapters::{AdapterError, CallId, ErrorInfo, ErrorKind};
use thiserror::Error;

/// Convenience result type using [`MyceliaError`]
pub type Result<T> = std::result::Result<T, MyceliaError>;

/// Error type for graph construction, call building, and execution
///
/// User-level failures are recorded against calls (as [`ErrorInfo`]) and
/// propagate through the DAG; the [`to_info`](Self::to_info) /
/// [`from_info`](Self::from_info) pair converts between the two
/// representations at the storage boundary.
#[derive(Error, Debug)]
pub enum MyceliaError {
    /// A call references a node name the graph does not know
    ///
    /// Occurs when a worker claims a call whose node name resolves to
    /// nothing in the graph it serves.
    ///
    /// **Common causes**:
    /// - Workers running an older build of the graph than the producer
    /// - A call registered against the wrong graph
    /// - A node renamed between sessions sharing one storage backend
    ///
    /// **Recovery**: deploy the same graph to every worker sharing the
    /// queue; the failure is recorded against the call and propagates to
    /// its dependents like any other.
    ///
    /// # Example
    ///
    /// ```rust
    /// use mycelia_core::MyceliaError;
    ///
    /// let err = MyceliaError::NodeNotRegistered {
    ///     graph: "demo".to_string(),
    ///     node: "missing".to_string(),
    /// };
    /// assert_eq!(
    ///     format!("{}", err),
    ///     "Node 'missing' is not registered in graph 'demo'"
    /// );
    /// ```
    #[error("Node '{node}' is not registered in graph '{graph}'")]
    NodeNotRegistered { graph: String, node: String },

    /// Two nodes were registered under the same name
    ///
    /// **Common causes**:
    /// - The same registration code running twice at startup
    /// - Two modules picking the same node name
    ///
    /// **Recovery**: registration-time failure; rename one of the nodes.
    #[error("Node '{0}' is already registered")]
    DuplicateNodeRegistration(String),

    /// Registration attempted after a session opened the graph
    ///
    /// **Recovery**: register every node before `Session::open`; the graph
    /// is immutable from the first open onward.
    #[error("Graph '{0}' is frozen; register nodes before opening a session")]
    GraphFrozen(String),

    /// Arguments do not match the node's declared schema
    ///
    /// Raised while building a call, before anything is registered or
    /// executed.
    ///
    /// **Common causes**:
    /// - Wrong positional count for a non-variadic node
    /// - A keyword the schema does not declare
    /// - A declared keyword left out
    ///
    /// **Recovery**: fix the call site to match the node's `ArgSpec`.
    ///
    /// # Example
    ///
    /// ```rust
    /// use mycelia_core::MyceliaError;
    ///
    /// let err = MyceliaError::invalid_arguments("child", "expected 1 positional argument(s), got 0");
    /// assert!(matches!(err, MyceliaError::InvalidArguments { .. }));
    /// ```
    #[error("Invalid arguments for node '{node}': {reason}")]
    InvalidArguments { node: String, reason: String },

    /// The configured codec rejected a node's return value
    ///
    /// **Common causes**:
    /// - A codec stricter than JSON (binary formats with unsupported shapes)
    /// - Values outside what the storage driver can persist
    ///
    /// **Recovery**: recorded against the call as a failure; return a value
    /// the codec accepts, or configure a codec that accepts the value.
    #[error("Result of call {call} is not serializable: {reason}")]
    NonSerializableResult { call: CallId, reason: String },

    /// An argument literal could not be encoded
    #[error("Argument of node '{node}' is not serializable: {reason}")]
    NonSerializableArgument { node: String, reason: String },

    /// An argument literal encoded differently across two passes
    ///
    /// Content identity requires stable bytes; an unstable encode would
    /// silently break memoization, so it is rejected at call-build time
    /// instead.
    #[error("Argument of node '{0}' does not encode deterministically")]
    NonDeterministicArgument(String),

    /// A deferred call was buried inside a container argument
    ///
    /// **Common causes**:
    /// - Serializing a deferred call into a list or object literal instead
    ///   of passing it as its own argument slot
    ///
    /// **Recovery**: pass each deferred call as a direct argument; only
    /// top-level slots become dependency edges.
    #[error(
        "A deferred call is nested inside a container argument of node '{0}'; \
         deferred calls must appear as direct arguments"
    )]
    UnreachableDeferredCall(String),

    /// The node body returned an error
    ///
    /// Occurs when user code inside a node body fails during execution.
    ///
    /// **Common causes**:
    /// - External API failures inside the body
    /// - Missing or malformed input values
    /// - Application logic errors
    ///
    /// **Recovery**: the failure is recorded against the call and eagerly
    /// fails every transitive dependent; handle expected failures inside
    /// the body, or fix the call's inputs and re-run under a new identity
    /// (e.g. a salt argument).
    ///
    /// # Example
    ///
    /// ```rust
    /// use mycelia_core::MyceliaError;
    ///
    /// let err = MyceliaError::node_execution("fetch", "connection refused");
    /// assert_eq!(
    ///     format!("{}", err),
    ///     "Node 'fetch' execution failed: connection refused"
    /// );
    /// ```
    #[error("Node '{node}' execution failed: {message}")]
    NodeExecution { node: String, message: String },

    /// A dependency failed, so this call never ran
    ///
    /// `dependency` is the originally failing call, even across several
    /// levels: the descriptor propagates unchanged, so a whole failed
    /// subtree points at one root cause.
    ///
    /// **Common causes**:
    /// - Any ancestor in the argument tree recording a failure
    ///
    /// **Recovery**: inspect `inner` for the root cause; fixing and
    /// re-running the failing call (under a new identity) unblocks the
    /// dependents.
    ///
    /// # Example
    ///
    /// ```rust
    /// use mycelia_core::{CallId, ErrorInfo, ErrorKind, MyceliaError};
    ///
    /// let leaf = CallId::from_bytes([7; 32]);
    /// let err = MyceliaError::DependencyFailed {
    ///     dependency: leaf,
    ///     inner: Box::new(ErrorInfo::new(ErrorKind::NodeExecution, "boom")),
    /// };
    /// if let MyceliaError::DependencyFailed { dependency, inner } = &err {
    ///     assert_eq!(*dependency, leaf);
    ///     assert_eq!(inner.kind, ErrorKind::NodeExecution);
    /// }
    /// ```
    #[error("Dependency {dependency} failed: {inner}")]
    DependencyFailed {
        dependency: CallId,
        inner: Box<ErrorInfo>,
    },

    /// A call recorded a failure in storage; carries the wire descriptor
    ///
    /// Catch-all rehydration for recorded failures that have no more
    /// specific variant; the descriptor keeps the original kind and
    /// message.
    #[error("Call failed: {0}")]
    CallFailed(ErrorInfo),

    /// Broker infrastructure failure
    ///
    /// **Recovery**: retried automatically with exponential backoff and
    /// never recorded against a call; a claim that keeps failing is
    /// returned to the queue for a later attempt.
    #[error("Broker unavailable: {0}")]
    BrokerUnavailable(#[source] AdapterError),

    /// Storage infrastructure failure
    ///
    /// **Recovery**: same policy as [`BrokerUnavailable`](Self::BrokerUnavailable).
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(#[source] AdapterError),

    /// The session was torn down while calls were outstanding
    ///
    /// Terminal for every non-terminal call of the session. Storage records
    /// are left untouched, so a new session over the same backends resumes
    /// where this one stopped.
    #[error("Session cancelled")]
    SessionCancelled,

    /// Malformed wire payload (continuation event, stored record)
    #[error("Malformed call payload: {0}")]
    MalformedCall(String),

    /// Custom error
    ///
    /// # Example
    ///
    /// ```rust
    /// use mycelia_core::MyceliaError;
    ///
    /// let err = MyceliaError::Custom("dependency abc123 is not resolved yet".to_string());
    /// ```
    #[error("{0}")]
    Custom(String),
}

impl MyceliaError {
    /// Create a node execution error with context
    ///
    /// # Example
    ///
    /// ```rust
    /// use mycelia_core::MyceliaError;
    ///
    /// fn risky() -> Result<(), MyceliaError> {
    ///     Err(MyceliaError::node_execution("fetch", "connection refused"))
    /// }
    /// ```
    pub fn node_execution(node: impl Into<String>, message: impl Into<String>) -> Self {
        Self::NodeExecution {
            node: node.into(),
            message: message.into(),
        }
    }

    /// Create an invalid-arguments error with context
    pub fn invalid_arguments(node: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidArguments {
            node: node.into(),
            reason: reason.into(),
        }
    }

    /// Whether this error is an infrastructure failure worth retrying.
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            Self::BrokerUnavailable(_) | Self::StorageUnavailable(_)
        )
    }

    /// Convert to the serializable descriptor recorded in storage.
    ///
    /// # Example
    ///
    /// ```rust
    /// use mycelia_core::{ErrorKind, MyceliaError};
    ///
    /// let info = MyceliaError::node_execution("leaf", "boom").to_info();
    /// assert_eq!(info.kind, ErrorKind::NodeExecution);
    /// ```
    pub fn to_info(&self) -> ErrorInfo {
        match self {
            Self::NodeNotRegistered { .. } => {
                ErrorInfo::new(ErrorKind::NodeNotRegistered, self.to_string())
            }
            Self::NodeExecution { .. } => ErrorInfo::new(ErrorKind::NodeExecution, self.to_string()),
            Self::NonSerializableResult { .. } => {
                ErrorInfo::new(ErrorKind::NonSerializableResult, self.to_string())
            }
            Self::NonSerializableArgument { .. } => {
                ErrorInfo::new(ErrorKind::NonSerializableArgument, self.to_string())
            }
            Self::NonDeterministicArgument(_) => {
                ErrorInfo::new(ErrorKind::NonDeterministicArgument, self.to_string())
            }
            Self::UnreachableDeferredCall(_) => {
                ErrorInfo::new(ErrorKind::UnreachableDeferredCall, self.to_string())
            }
            Self::DependencyFailed { dependency, inner } => {
                ErrorInfo::dependency_failed(*dependency, (**inner).clone())
            }
            Self::CallFailed(info) => info.clone(),
            Self::SessionCancelled => {
                ErrorInfo::new(ErrorKind::SessionCancelled, "session cancelled")
            }
            other => ErrorInfo::new(ErrorKind::Other, other.to_string()),
        }
    }

    /// Rehydrate a stored descriptor into the closest error variant.
    ///
    /// `DependencyFailed` and `SessionCancelled` map back to their
    /// dedicated variants; everything else is carried as
    /// [`CallFailed`](Self::CallFailed) to preserve the recorded kind.
    pub fn from_info(info: ErrorInfo) -> Self {
        match info.kind {
            ErrorKind::DependencyFailed => match (info.dependency, info.inner.clone()) {
                (Some(dependency), Some(inner)) => Self::DependencyFailed { dependency, inner },
                _ => Self::CallFailed(info),
            },
            ErrorKind::SessionCancelled => Self::SessionCancelled,
            _ => Self::CallFailed(info),
        }
    }
}
