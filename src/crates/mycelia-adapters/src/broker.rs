//! Message broker trait for distributing ready calls to workers
//!
//! The **[`Broker`]** trait is the contract between the scheduler and an
//! external message broker. Ready calls flow scheduler -> broker -> worker as
//! claims; completion events flow worker -> broker -> scheduler as a
//! broadcast stream. Messages carry only call ids; the argument data lives
//! in storage.
//!
//! # Delivery contract
//!
//! - **At-least-once**: a claim that is not acknowledged within the
//!   visibility timeout is redelivered to another worker. User node bodies
//!   must be idempotent under this; the storage layer's outcome CAS makes
//!   result writes idempotent regardless.
//! - **FIFO per producer**: calls published by one producer are claimed in
//!   publish order. No global order is guaranteed.
//! - **Bounded publish**: back-pressure is the broker's responsibility; the
//!   scheduler dispatches every ready call without throttling.
//!
//! An AMQP implementation lives in a downstream crate;
//! [`InMemoryBroker`](crate::memory::InMemoryBroker) is the in-process
//! reference implementation.

use crate::error::Result;
use crate::ident::{CallId, ErrorInfo};
use async_trait::async_trait;
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::pin::Pin;
use std::time::Duration;
use uuid::Uuid;

/// Type alias for the async stream of completion events
pub type CompletionStream = Pin<Box<dyn Stream<Item = Result<CompletionEvent>> + Send + 'static>>;

/// A claimed work unit
///
/// The token identifies this particular claim for `ack`/`nack`; after the
/// visibility timeout the token is dead and the call is claimable again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claim {
    pub call_id: CallId,
    pub token: Uuid,
}

/// Outcome carried by a completion event
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CompletionOutcome {
    /// The node body returned this value
    Resolved { value: Value },
    /// The node body tail-called another call
    ///
    /// `call` is the serialized continuation call tree, opaque to the
    /// broker; the scheduler deserializes and registers it.
    Forwarded { to: CallId, call: Value },
    /// The call failed
    Failed { error: ErrorInfo },
}

/// Event published by an executor when a call reaches a terminal state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionEvent {
    pub call_id: CallId,
    pub outcome: CompletionOutcome,
}

/// Transport between the scheduler and worker executors
#[async_trait]
pub trait Broker: Send + Sync {
    /// Enqueue a ready call for execution.
    ///
    /// Returns once the message is durably accepted. At-least-once from
    /// here on.
    async fn publish(&self, id: CallId) -> Result<()>;

    /// Claim the next ready call, waiting up to `wait` for one to appear.
    ///
    /// Returns `None` on timeout so workers can check for cancellation
    /// between polls. A claim not acknowledged within the broker's
    /// visibility timeout is redelivered.
    async fn claim(&self, wait: Duration) -> Result<Option<Claim>>;

    /// Acknowledge a claim, removing the message permanently.
    ///
    /// Acknowledging an expired claim is a no-op.
    async fn ack(&self, claim: &Claim) -> Result<()>;

    /// Return a claim to the queue for immediate redelivery.
    async fn nack(&self, claim: &Claim) -> Result<()>;

    /// Publish a completion event to every subscriber.
    async fn publish_completion(&self, event: CompletionEvent) -> Result<()>;

    /// Subscribe to completion events published after this point.
    fn subscribe_completions(&self) -> CompletionStream;
}
