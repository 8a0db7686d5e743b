//! Durable call storage trait for custom backend implementations
//!
//! This module defines the **[`Storage`]** trait - the abstraction over the
//! durable key-value store that holds the authoritative state of every call.
//! It is the memoization substrate: a call id maps to at most one record, and
//! a record's terminal outcome is written exactly once.
//!
//! # Overview
//!
//! Storage backends provide:
//!
//! - **Call records** - node reference, argument slots, status, outcome
//! - **Single-writer outcomes** - compare-and-swap on status so that under
//!   at-least-once delivery only the first worker's result is kept
//! - **Forward records** - a tail-called caller persists a redirect to the
//!   call that supplants it
//! - **Result lookup** - resolve a call id to its value, following nothing;
//!   callers follow forward records themselves
//!
//! The in-memory reference implementation lives in
//! [`InMemoryStorage`](crate::memory::InMemoryStorage). Production backends
//! (PostgreSQL and friends) implement this trait in downstream crates; the
//! record maps onto a single table keyed by call id.
//!
//! # Thread Safety
//!
//! Implementations must be `Send + Sync` and safe under concurrent access
//! from many worker tasks and the scheduler. The two CAS operations are the
//! only synchronization the engine relies on.

use crate::error::Result;
use crate::ident::{CallId, ErrorInfo, NodeRef};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// One argument position on a stored call
///
/// Either an inline literal value or a reference to another call whose
/// resolved value fills the slot at execution time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum SlotRecord {
    Literal(Value),
    Ref(CallId),
}

/// Lifecycle state of a call
///
/// `Resolved`, `Forwarded`, and `Failed` are terminal for the record.
/// A `Forwarded` call is logically pending on its target, but its own
/// record never changes again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Pending,
    Ready,
    Running,
    Resolved,
    Forwarded,
    Failed,
}

impl CallStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, CallStatus::Resolved | CallStatus::Forwarded | CallStatus::Failed)
    }
}

/// Terminal result recorded against a call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum StoredOutcome {
    /// The node body returned a concrete value
    Resolved(Value),
    /// The node body tail-called another call; this record is a redirect
    Forwarded(CallId),
    /// The call failed; the descriptor is propagated to dependents
    Failed(ErrorInfo),
}

impl StoredOutcome {
    /// The status this outcome transitions the record to.
    pub fn status(&self) -> CallStatus {
        match self {
            StoredOutcome::Resolved(_) => CallStatus::Resolved,
            StoredOutcome::Forwarded(_) => CallStatus::Forwarded,
            StoredOutcome::Failed(_) => CallStatus::Failed,
        }
    }
}

/// Persisted state of one call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallRecord {
    pub id: CallId,
    pub node: NodeRef,
    pub args: Vec<SlotRecord>,
    pub kwargs: BTreeMap<String, SlotRecord>,
    pub status: CallStatus,
    pub outcome: Option<StoredOutcome>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CallRecord {
    /// Fresh `Pending` record with no outcome.
    pub fn new(
        id: CallId,
        node: NodeRef,
        args: Vec<SlotRecord>,
        kwargs: BTreeMap<String, SlotRecord>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            node,
            args,
            kwargs,
            status: CallStatus::Pending,
            outcome: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Result of looking up a call's resolved value
#[derive(Debug, Clone, PartialEq)]
pub enum ResultLookup {
    /// The call resolved to this value
    Value(Value),
    /// The call forwarded; look up the target instead
    Forward(CallId),
    /// The call failed
    Failed(ErrorInfo),
    /// The record exists but has no outcome yet
    NotReady,
    /// No record with this id
    Missing,
}

/// Durable map from call id to call state
///
/// The authoritative state of every call lives here; the in-memory scheduler
/// is a cache kept coherent through broker events. Outcome writes go through
/// compare-and-swap so a redelivered execution cannot overwrite the first
/// result.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Insert a call record if absent.
    ///
    /// Returns `false` when a record with this id already exists; the
    /// existing record is left untouched (first writer wins, and identical
    /// ids describe identical calls anyway).
    async fn put_call(&self, record: &CallRecord) -> Result<bool>;

    /// Fetch a call record by id.
    async fn get_call(&self, id: &CallId) -> Result<Option<CallRecord>>;

    /// Compare-and-swap the status of a non-terminal record.
    ///
    /// Returns `false` when the record's current status is not `from`.
    /// Used for `Pending -> Ready` by the scheduler and `Ready -> Running`
    /// by a claiming worker.
    async fn set_status(&self, id: &CallId, from: CallStatus, to: CallStatus) -> Result<bool>;

    /// Compare-and-swap a terminal outcome onto a record.
    ///
    /// Succeeds at most once per record: the write is applied only when the
    /// current status equals `expected` and is not already terminal. A
    /// worker losing this race discards its result.
    async fn try_set_outcome(
        &self,
        id: &CallId,
        expected: CallStatus,
        outcome: &StoredOutcome,
    ) -> Result<bool>;

    /// Look up the result of a call.
    ///
    /// Does not follow forward records; the caller chases `Forward` targets.
    async fn get_result(&self, id: &CallId) -> Result<ResultLookup>;
}
