//! Central state machine tracking every call of a session
//!
//! The scheduler owns the in-memory view of the DAG: per-call status,
//! unresolved-dependency counts, and the dependent sets that are the dual of
//! the dependency edges. The authoritative state lives in storage; this
//! cache is kept coherent by applying the completion events workers publish
//! through the broker.
//!
//! State transitions:
//!
//! ```text
//! PENDING --(all deps RESOLVED)--> READY --(claimed)--> RUNNING
//! RUNNING --(body returns value)--> RESOLVED
//! RUNNING --(body returns a call)--> FORWARDED (tail-call substitution)
//! RUNNING --(body errors)--> FAILED
//! ```
//!
//! A tail-call re-points every dependent of the caller at the continuation
//! target; a failure propagates eagerly through the transitive dependents,
//! which never execute. Terminal transitions are broadcast on an in-process
//! channel so `execute` waiters can follow along, including across forward
//! chains.

use crate::config::RetryConfig;
use crate::error::{MyceliaError, Result};
use mycelia_adapters::{
    Broker, CallId, CallStatus, CompletionEvent, CompletionOutcome, ErrorInfo, ErrorKind,
    ResultLookup, Storage, StoredOutcome,
};
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};

use crate::call::Call;
use crate::config::MemoizationScope;

/// Terminal transition broadcast to in-process waiters
#[derive(Debug, Clone)]
pub(crate) enum CallEvent {
    Resolved { id: CallId, value: Value },
    Forwarded { id: CallId, to: CallId },
    Failed { id: CallId, error: ErrorInfo },
}

/// Cached status of one call
#[derive(Debug, Clone)]
pub(crate) enum LocalStatus {
    Pending,
    Ready,
    Resolved(Value),
    Forwarded(CallId),
    Failed(ErrorInfo),
}

impl LocalStatus {
    fn is_terminal(&self) -> bool {
        matches!(
            self,
            LocalStatus::Resolved(_) | LocalStatus::Forwarded(_) | LocalStatus::Failed(_)
        )
    }
}

pub(crate) struct CallState {
    pub(crate) status: LocalStatus,
    /// Dependencies not yet resolved; the call becomes ready at zero
    pub(crate) unresolved: usize,
    /// Calls waiting on this one (dual of dependency edges)
    pub(crate) dependents: HashSet<CallId>,
}

#[derive(Default)]
pub(crate) struct SchedulerInner {
    pub(crate) calls: HashMap<CallId, CallState>,
}

pub(crate) struct Scheduler {
    pub(crate) broker: Arc<dyn Broker>,
    pub(crate) storage: Arc<dyn Storage>,
    pub(crate) memoization: MemoizationScope,
    pub(crate) retry: RetryConfig,
    pub(crate) inner: Mutex<SchedulerInner>,
    pub(crate) events: broadcast::Sender<CallEvent>,
}

impl Scheduler {
    pub(crate) fn new(
        broker: Arc<dyn Broker>,
        storage: Arc<dyn Storage>,
        memoization: MemoizationScope,
        retry: RetryConfig,
        event_capacity: usize,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(event_capacity);
        Arc::new(Self {
            broker,
            storage,
            memoization,
            retry,
            inner: Mutex::new(SchedulerInner::default()),
            events,
        })
    }

    /// Apply one completion event from the broker stream.
    pub(crate) async fn apply_completion(&self, event: CompletionEvent) -> Result<()> {
        match event.outcome {
            CompletionOutcome::Resolved { value } => self.complete_resolved(event.call_id, value).await,
            CompletionOutcome::Failed { error } => self.complete_failed(event.call_id, error).await,
            CompletionOutcome::Forwarded { to, call } => {
                self.complete_forwarded(event.call_id, to, call).await
            }
        }
    }

    async fn complete_resolved(&self, id: CallId, value: Value) -> Result<()> {
        let mut newly_ready = Vec::new();
        {
            let mut inner = self.inner.lock().await;
            let Some(state) = inner.calls.get_mut(&id) else {
                tracing::debug!(call = %id, "completion for unknown call ignored");
                return Ok(());
            };
            if state.status.is_terminal() {
                // redelivered completion; the first one already advanced us
                return Ok(());
            }

            tracing::debug!(call = %id, "call resolved");
            state.status = LocalStatus::Resolved(value.clone());
            let dependents = std::mem::take(&mut state.dependents);
            let _ = self.events.send(CallEvent::Resolved { id, value });

            for dependent in dependents {
                if let Some(dep_state) = inner.calls.get_mut(&dependent) {
                    dep_state.unresolved = dep_state.unresolved.saturating_sub(1);
                    if dep_state.unresolved == 0
                        && matches!(dep_state.status, LocalStatus::Pending)
                    {
                        dep_state.status = LocalStatus::Ready;
                        newly_ready.push(dependent);
                    }
                }
            }
        }
        self.publish_ready(&newly_ready).await
    }

    async fn complete_failed(&self, id: CallId, error: ErrorInfo) -> Result<()> {
        let mut inner = self.inner.lock().await;
        self.fail_transitively(&mut inner, id, error, true).await
    }

    /// Mark `id` failed and eagerly fail every transitive dependent.
    ///
    /// Dependents receive the same `DependencyFailed` descriptor, pointing
    /// at the originally failing call; their bodies never run. Outcomes for
    /// never-run calls are written here (the executor writes only for calls
    /// it ran), guarded by the Pending-status CAS.
    pub(crate) async fn fail_transitively(
        &self,
        inner: &mut SchedulerInner,
        id: CallId,
        error: ErrorInfo,
        origin_recorded: bool,
    ) -> Result<()> {
        let mut queue = VecDeque::new();
        queue.push_back((id, error, origin_recorded));

        while let Some((call_id, error, recorded)) = queue.pop_front() {
            let Some(state) = inner.calls.get_mut(&call_id) else {
                continue;
            };
            if state.status.is_terminal() {
                continue;
            }

            tracing::debug!(call = %call_id, kind = ?error.kind, "call failed");
            state.status = LocalStatus::Failed(error.clone());
            let dependents = std::mem::take(&mut state.dependents);
            let _ = self.events.send(CallEvent::Failed {
                id: call_id,
                error: error.clone(),
            });

            if !recorded {
                let outcome = StoredOutcome::Failed(error.clone());
                let written = self
                    .storage
                    .try_set_outcome(&call_id, CallStatus::Pending, &outcome)
                    .await
                    .map_err(MyceliaError::StorageUnavailable)?;
                if !written {
                    tracing::debug!(call = %call_id, "failure outcome already recorded");
                }
            }

            // a DependencyFailed descriptor propagates unchanged; anything
            // else gets wrapped once, pointing at the failing call
            let propagated = if error.kind == ErrorKind::DependencyFailed {
                error.clone()
            } else {
                ErrorInfo::dependency_failed(call_id, error.clone())
            };
            for dependent in dependents {
                queue.push_back((dependent, propagated.clone(), false));
            }
        }
        Ok(())
    }

    async fn complete_forwarded(&self, caller: CallId, to: CallId, wire: Value) -> Result<()> {
        let continuation = Call::from_wire(&wire)?;
        if continuation.id() != to {
            return Err(MyceliaError::MalformedCall(format!(
                "continuation id mismatch: event says {}, tree hashes to {}",
                to.short(),
                continuation.id().short()
            )));
        }

        let mut newly_ready = Vec::new();
        {
            let mut inner = self.inner.lock().await;
            self.insert_tree(&mut inner, &continuation, &mut newly_ready)
                .await?;

            let Some(state) = inner.calls.get_mut(&caller) else {
                tracing::debug!(call = %caller, "forward for unknown caller ignored");
                return Ok(());
            };
            if state.status.is_terminal() {
                return Ok(());
            }

            tracing::debug!(call = %caller, target = %to, "tail-call forwarded");
            let dependents = std::mem::take(&mut state.dependents);
            state.status = LocalStatus::Forwarded(to);
            let _ = self.events.send(CallEvent::Forwarded { id: caller, to });

            // re-point every dependent of the caller at the continuation
            let target = Self::resolve_alias(&inner, to);
            let target_status = inner
                .calls
                .get(&target)
                .map(|state| state.status.clone())
                .unwrap_or(LocalStatus::Pending);

            match target_status {
                LocalStatus::Resolved(_) => {
                    for dependent in dependents {
                        if let Some(dep_state) = inner.calls.get_mut(&dependent) {
                            dep_state.unresolved = dep_state.unresolved.saturating_sub(1);
                            if dep_state.unresolved == 0
                                && matches!(dep_state.status, LocalStatus::Pending)
                            {
                                dep_state.status = LocalStatus::Ready;
                                newly_ready.push(dependent);
                            }
                        }
                    }
                }
                LocalStatus::Failed(error) => {
                    let propagated = if error.kind == ErrorKind::DependencyFailed {
                        error
                    } else {
                        ErrorInfo::dependency_failed(target, error)
                    };
                    for dependent in dependents {
                        self.fail_transitively(&mut inner, dependent, propagated.clone(), false)
                            .await?;
                    }
                }
                _ => {
                    if let Some(target_state) = inner.calls.get_mut(&target) {
                        target_state.dependents.extend(dependents);
                    }
                }
            }
        }
        self.publish_ready(&newly_ready).await
    }

    /// Follow forward links to the call currently standing in for `id`.
    pub(crate) fn resolve_alias(inner: &SchedulerInner, mut id: CallId) -> CallId {
        let mut hops = 0;
        while let Some(state) = inner.calls.get(&id) {
            match state.status {
                LocalStatus::Forwarded(next) if hops < 1024 => {
                    id = next;
                    hops += 1;
                }
                _ => break,
            }
        }
        id
    }

    /// Move ready calls to the queue: status write-through, then publish.
    pub(crate) async fn publish_ready(&self, ids: &[CallId]) -> Result<()> {
        for id in ids {
            let transitioned = self
                .storage
                .set_status(id, CallStatus::Pending, CallStatus::Ready)
                .await
                .map_err(MyceliaError::StorageUnavailable)?;
            if !transitioned {
                tracing::debug!(call = %id, "storage status not pending; publishing anyway");
            }

            let mut attempt = 0;
            loop {
                match self.broker.publish(*id).await {
                    Ok(()) => {
                        tracing::debug!(call = %id, "call ready, published");
                        break;
                    }
                    Err(error) => {
                        attempt += 1;
                        if attempt >= self.retry.max_attempts {
                            return Err(MyceliaError::BrokerUnavailable(error));
                        }
                        let delay = self.retry.delay_for(attempt);
                        tracing::warn!(
                            call = %id,
                            %error,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            "publish failed, backing off"
                        );
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }
        Ok(())
    }

    /// Await the terminal resolution of `id`, following forward records.
    pub(crate) async fn wait(&self, id: CallId) -> Result<Value> {
        let mut events = self.events.subscribe();
        let mut current = id;
        loop {
            // the state map is authoritative for everything that happened
            // before the subscription, or while the receiver lagged
            {
                let inner = self.inner.lock().await;
                current = Self::resolve_alias(&inner, current);
                if let Some(state) = inner.calls.get(&current) {
                    match &state.status {
                        LocalStatus::Resolved(value) => return Ok(value.clone()),
                        LocalStatus::Failed(error) => {
                            return Err(MyceliaError::from_info(error.clone()))
                        }
                        _ => {}
                    }
                }
            }

            loop {
                match events.recv().await {
                    Ok(CallEvent::Resolved { id, value }) if id == current => return Ok(value),
                    Ok(CallEvent::Failed { id, error }) if id == current => {
                        return Err(MyceliaError::from_info(error))
                    }
                    Ok(CallEvent::Forwarded { id, to }) if id == current => {
                        // the target may already be terminal; re-check state
                        current = to;
                        break;
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => break,
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(MyceliaError::SessionCancelled)
                    }
                }
            }
        }
    }

    /// Fail every non-terminal call with `SessionCancelled` and wake waiters.
    ///
    /// Storage records are left untouched so a resumed session under the
    /// same ids can pick up where this one stopped.
    pub(crate) async fn cancel(&self) {
        let mut inner = self.inner.lock().await;
        let cancelled = ErrorInfo::new(ErrorKind::SessionCancelled, "session cancelled");
        for (id, state) in inner.calls.iter_mut() {
            if !state.status.is_terminal() {
                state.status = LocalStatus::Failed(cancelled.clone());
                state.dependents.clear();
                let _ = self.events.send(CallEvent::Failed {
                    id: *id,
                    error: cancelled.clone(),
                });
            }
        }
    }

    /// Look up a stored terminal result, following forward records.
    pub(crate) async fn lookup_stored(
        &self,
        id: CallId,
    ) -> Result<Option<std::result::Result<Value, ErrorInfo>>> {
        let mut current = id;
        let mut hops = 0;
        loop {
            match self
                .storage
                .get_result(&current)
                .await
                .map_err(MyceliaError::StorageUnavailable)?
            {
                ResultLookup::Value(value) => return Ok(Some(Ok(value))),
                ResultLookup::Failed(error) => return Ok(Some(Err(error))),
                ResultLookup::Forward(next) => {
                    hops += 1;
                    if hops > 1024 {
                        return Ok(None);
                    }
                    current = next;
                }
                ResultLookup::NotReady | ResultLookup::Missing => return Ok(None),
            }
        }
    }
}
