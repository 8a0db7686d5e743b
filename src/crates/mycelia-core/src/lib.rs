//! # mycelia-core - Distributed Task-Graph Execution
//!
//! Mycelia runs multi-step, dependency-heavy workflows as a DAG of
//! **deferred calls**. User code registers asynchronous **nodes** on a
//! [`Graph`]; invoking a node's handle produces a [`Call`] - a value that
//! represents a future execution and composes freely: pass it as an argument
//! to another call, return it from a node body to tail-call into a
//! successor, or submit it for background execution. Nothing runs until a
//! [`Session`] materializes the calls into a dependency graph and schedules
//! them.
//!
//! ## What the runtime guarantees
//!
//! - **Content identity.** A call's id is a Merkle hash over its node and
//!   arguments. Identical invocations are one call: one record, one
//!   execution, shared by every slot that references it.
//! - **Maximum parallelism.** Every call whose dependencies have resolved is
//!   dispatched; independent work runs concurrently across workers.
//! - **Tail-call substitution.** A body returning another call is replaced
//!   by it in the graph; dependents transparently wait for the continuation,
//!   and storage keeps a forward record.
//! - **Eager failure propagation.** A failed dependency fails all transitive
//!   dependents without running them, each recording the original failure.
//! - **Crash tolerance.** Work is distributed through an at-least-once
//!   broker; outcome writes go through a storage compare-and-swap, so a
//!   redelivered execution can never overwrite the first result.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use mycelia_core::{
//!     ArgSpec, CallArgs, Deferred, Graph, InMemoryBroker, InMemoryStorage, Session,
//!     SessionConfig,
//! };
//! use serde_json::{json, Value};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let graph = Arc::new(Graph::new("demo"));
//!
//!     let double = graph.node("double", ArgSpec::positional(1), |_ctx, input| {
//!         Box::pin(async move {
//!             let n = input.arg(0).and_then(Value::as_i64).unwrap_or(0);
//!             Ok(Deferred::value(json!(n * 2)))
//!         })
//!     })?;
//!
//!     let sum = graph.node("sum", ArgSpec::positional(0).with_variadic_positional(), |_ctx, input| {
//!         Box::pin(async move {
//!             let total: i64 = input.args().iter().filter_map(Value::as_i64).sum();
//!             Ok(Deferred::value(json!(total)))
//!         })
//!     })?;
//!
//!     let session = Session::open(
//!         graph,
//!         Arc::new(InMemoryBroker::new()),
//!         Arc::new(InMemoryStorage::new()),
//!         SessionConfig::default(),
//!     )
//!     .await?;
//!
//!     // the two doublings run in parallel; sum waits for both
//!     let call = sum.call(
//!         CallArgs::new()
//!             .arg(double.call(CallArgs::new().arg(json!(3)))?)
//!             .arg(double.call(CallArgs::new().arg(json!(4)))?),
//!     )?;
//!     let result = session.execute(&call).await?;
//!     assert_eq!(result, json!(14));
//!
//!     session.close().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Module map
//!
//! - [`graph`] / [`node`] - the registry and node schemas
//! - [`call`] - deferred call values and the opaque [`Deferred`] sum
//! - [`args`] - argument walking and slot normalization
//! - [`identity`] - content-addressed call ids
//! - [`dag`] - registration of call trees into scheduler state
//! - [`scheduler`] - the central state machine
//! - [`executor`] - worker loops claiming and running calls
//! - [`context`] - per-execution handle with background `submit`
//! - [`session`] - lifecycle tying everything together
//! - [`config`] - session tuning knobs
//!
//! The broker and storage contracts, the wire data model, and the in-memory
//! reference backends live in the `mycelia-adapters` crate.

pub mod args;
pub mod call;
pub mod config;
pub mod context;
pub mod dag;
pub mod error;
pub mod executor;
pub mod graph;
pub mod identity;
pub mod node;
pub mod scheduler;
pub mod session;

// Re-export main types
pub use args::{CallArgs, CallInput};
pub use call::{Call, Deferred, Slot};
pub use config::{MemoizationScope, RetryConfig, SessionConfig};
pub use context::{Context, SubmitAck};
pub use error::{MyceliaError, Result};
pub use graph::Graph;
pub use node::{ArgSpec, Node, NodeFn, NodeFuture, NodeHandle};
pub use session::Session;

// Re-export the adapter-layer types sessions are wired with
pub use mycelia_adapters::{
    Broker, CallId, CallRecord, CallStatus, Codec, CompletionEvent, CompletionOutcome, ErrorInfo,
    ErrorKind, InMemoryBroker, InMemoryStorage, JsonCodec, NodeRef, ResultLookup, SlotRecord,
    Storage, StoredOutcome,
};
