//! Per-execution context handed to node bodies

use crate::call::Call;
use crate::error::Result;
use crate::scheduler::Scheduler;
use mycelia_adapters::CallId;
use std::fmt;
use std::sync::Arc;

/// Acknowledgment that a background call has been durably enqueued
///
/// Carries the call id for logging; it is not a dependency handle. To use a
/// submitted call as a dependency elsewhere, pass around the [`Call`] value
/// it was built from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmitAck {
    call_id: CallId,
}

impl SubmitAck {
    pub fn call_id(&self) -> CallId {
        self.call_id
    }
}

/// Handle passed into every node body execution
#[derive(Clone)]
pub struct Context {
    scheduler: Arc<Scheduler>,
    call_id: CallId,
}

impl Context {
    pub(crate) fn new(scheduler: Arc<Scheduler>, call_id: CallId) -> Self {
        Self { scheduler, call_id }
    }

    /// Id of the call this body is executing.
    pub fn call_id(&self) -> CallId {
        self.call_id
    }

    /// Register a call for background execution.
    ///
    /// No dependency edge is added from the submitter: the submitted call
    /// runs concurrently with and may outlive this one. Returns after the
    /// call is durably enqueued, not after it completes; delivery is
    /// at-least-once. A background failure does not fail the submitter
    /// unless the submitter also takes the call as a dependency.
    pub async fn submit(&self, call: &Call) -> Result<SubmitAck> {
        let call_id = self.scheduler.register(call).await?;
        tracing::debug!(
            submitter = %self.call_id,
            submitted = %call_id,
            "background call enqueued"
        );
        Ok(SubmitAck { call_id })
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("call_id", &self.call_id)
            .finish()
    }
}
