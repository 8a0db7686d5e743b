//! Worker executors: claiming, materializing, running, reporting
//!
//! A worker loops on the broker queue: claim a ready call, load its record,
//! materialize every referenced dependency value from storage, run the node
//! body under a tracing span, and compare-and-swap the terminal outcome into
//! storage. The executor never mutates scheduler state directly; it emits a
//! completion event to the broker and the scheduler advances from there.
//!
//! Exactly one worker owns a claim at a time, but at-least-once delivery
//! means a call can be executed twice after a crash or visibility timeout.
//! The outcome CAS makes that harmless: the late writer loses the swap and
//! discards its result. Infrastructure errors are retried with exponential
//! backoff and never recorded against a call; a claim that keeps hitting
//! them is returned to the queue.

use crate::args::CallInput;
use crate::call::{Call, DeferredRepr, Slot};
use crate::config::RetryConfig;
use crate::context::Context;
use crate::error::{MyceliaError, Result};
use crate::graph::Graph;
use crate::scheduler::Scheduler;
use futures::future::BoxFuture;
use mycelia_adapters::{
    Broker, CallId, CallRecord, CallStatus, Claim, Codec, CompletionEvent, CompletionOutcome,
    ErrorInfo, ErrorKind, ResultLookup, SlotRecord, Storage, StoredOutcome,
};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::Instrument;

const FORWARD_CHAIN_LIMIT: usize = 1024;

/// Outcome of argument materialization
enum Materialized {
    Input(CallInput),
    /// A dependency turned out failed; the call fails without running
    DepFailed(ErrorInfo),
}

pub(crate) struct Worker {
    pub(crate) index: usize,
    pub(crate) graph: Arc<Graph>,
    pub(crate) broker: Arc<dyn Broker>,
    pub(crate) storage: Arc<dyn Storage>,
    pub(crate) scheduler: Arc<Scheduler>,
    pub(crate) codec: Arc<dyn Codec>,
    pub(crate) retry: RetryConfig,
    pub(crate) claim_poll: Duration,
    pub(crate) cancel: watch::Receiver<bool>,
}

impl Worker {
    pub(crate) async fn run(mut self) {
        tracing::debug!(worker = self.index, "worker started");
        loop {
            if *self.cancel.borrow() {
                break;
            }

            let claimed = tokio::select! {
                _ = self.cancel.changed() => break,
                claimed = self.broker.claim(self.claim_poll) => claimed,
            };

            let claim = match claimed {
                Ok(Some(claim)) => claim,
                Ok(None) => continue,
                Err(error) => {
                    let delay = self.retry.delay_for(1);
                    tracing::warn!(
                        worker = self.index,
                        %error,
                        delay_ms = delay.as_millis() as u64,
                        "claim failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
            };

            // cooperative cancel: abandon the body at its next suspension
            // point and hand the claim back for a future session
            let mut cancel = self.cancel.clone();
            let outcome = tokio::select! {
                _ = cancel.changed() => None,
                outcome = self.process(&claim) => Some(outcome),
            };

            match outcome {
                Some(Ok(())) => {
                    if let Err(error) = self.broker.ack(&claim).await {
                        tracing::warn!(call = %claim.call_id, %error, "ack failed");
                    }
                }
                Some(Err(error)) => {
                    tracing::warn!(
                        call = %claim.call_id,
                        %error,
                        "processing failed, returning claim for redelivery"
                    );
                    if let Err(nack_error) = self.broker.nack(&claim).await {
                        tracing::warn!(call = %claim.call_id, %nack_error, "nack failed");
                    }
                }
                None => {
                    let _ = self.broker.nack(&claim).await;
                    break;
                }
            }
        }
        tracing::debug!(worker = self.index, "worker stopped");
    }

    /// Handle one claimed call. `Ok` leads to an ack, `Err` to a nack.
    async fn process(&self, claim: &Claim) -> Result<()> {
        let id = claim.call_id;
        let Some(record) = self
            .storage
            .get_call(&id)
            .await
            .map_err(MyceliaError::StorageUnavailable)?
        else {
            tracing::warn!(call = %id, "claimed call has no record, dropping");
            return Ok(());
        };

        if record.status.is_terminal() {
            // redelivery of finished work: make sure the completion event
            // reaches the scheduler, then drop the message
            return self.republish_completion(&record).await;
        }

        let took = self
            .storage
            .set_status(&id, CallStatus::Ready, CallStatus::Running)
            .await
            .map_err(MyceliaError::StorageUnavailable)?;
        if !took && record.status != CallStatus::Running {
            // another worker won the claim race
            return Ok(());
        }
        tracing::debug!(call = %id, node = %record.node, "call running");

        if record.node.graph != self.graph.name() {
            let info = ErrorInfo::new(
                ErrorKind::NodeNotRegistered,
                format!(
                    "call targets graph '{}', worker serves '{}'",
                    record.node.graph,
                    self.graph.name()
                ),
            );
            return self.finish(id, StoredOutcome::Failed(info), None).await;
        }
        let Some(node) = self.graph.lookup(&record.node.node) else {
            let info = MyceliaError::NodeNotRegistered {
                graph: record.node.graph.clone(),
                node: record.node.node.clone(),
            }
            .to_info();
            return self.finish(id, StoredOutcome::Failed(info), None).await;
        };

        let input = match self.materialize(&record).await? {
            Materialized::Input(input) => input,
            Materialized::DepFailed(error) => {
                return self.finish(id, StoredOutcome::Failed(error), None).await;
            }
        };

        let context = Context::new(self.scheduler.clone(), id);
        let span = tracing::info_span!("node_run", call = %id, node = %record.node.node);
        let output = node.invoke(context, input).instrument(span).await;

        let (outcome, continuation) = match output {
            Ok(deferred) => match deferred.into_repr() {
                DeferredRepr::Value(value) => match self.codec.dumps(&value) {
                    Ok(_) => (StoredOutcome::Resolved(value), None),
                    Err(error) => {
                        let info = MyceliaError::NonSerializableResult {
                            call: id,
                            reason: error.to_string(),
                        }
                        .to_info();
                        (StoredOutcome::Failed(info), None)
                    }
                },
                DeferredRepr::Call(call) => (StoredOutcome::Forwarded(call.id()), Some(call)),
            },
            Err(error) if error.is_infrastructure() => return Err(error),
            Err(error) => {
                let mut info = error.to_info();
                if info.kind == ErrorKind::Other {
                    info = ErrorInfo::new(
                        ErrorKind::NodeExecution,
                        format!("node '{}' execution failed: {}", record.node.node, info.message),
                    );
                }
                (StoredOutcome::Failed(info), None)
            }
        };

        self.finish(id, outcome, continuation).await
    }

    /// CAS the outcome into storage and publish the completion event.
    async fn finish(
        &self,
        id: CallId,
        outcome: StoredOutcome,
        continuation: Option<Call>,
    ) -> Result<()> {
        // the continuation's records must exist before anyone follows the
        // forward we are about to write
        if let Some(call) = &continuation {
            self.persist_tree(call).await?;
        }

        let written = self
            .storage
            .try_set_outcome(&id, CallStatus::Running, &outcome)
            .await
            .map_err(MyceliaError::StorageUnavailable)?;
        if !written {
            tracing::debug!(call = %id, "lost the outcome race, discarding result");
            return Ok(());
        }
        tracing::debug!(call = %id, status = ?outcome.status(), "outcome recorded");

        let event = CompletionEvent {
            call_id: id,
            outcome: match outcome {
                StoredOutcome::Resolved(value) => CompletionOutcome::Resolved { value },
                StoredOutcome::Failed(error) => CompletionOutcome::Failed { error },
                StoredOutcome::Forwarded(to) => {
                    let wire = match continuation {
                        Some(call) => call.to_wire(),
                        None => self.call_from_records(to).await?.to_wire(),
                    };
                    CompletionOutcome::Forwarded { to, call: wire }
                }
            },
        };
        self.publish_completion(event).await
    }

    /// Re-announce a finished record; the first event may have been lost.
    async fn republish_completion(&self, record: &CallRecord) -> Result<()> {
        let outcome = match &record.outcome {
            Some(StoredOutcome::Resolved(value)) => CompletionOutcome::Resolved {
                value: value.clone(),
            },
            Some(StoredOutcome::Failed(error)) => CompletionOutcome::Failed {
                error: error.clone(),
            },
            Some(StoredOutcome::Forwarded(to)) => {
                let wire = self.call_from_records(*to).await?.to_wire();
                CompletionOutcome::Forwarded { to: *to, call: wire }
            }
            None => {
                tracing::warn!(call = %record.id, "terminal record without outcome");
                return Ok(());
            }
        };
        self.publish_completion(CompletionEvent {
            call_id: record.id,
            outcome,
        })
        .await
    }

    async fn publish_completion(&self, event: CompletionEvent) -> Result<()> {
        let mut attempt = 0;
        loop {
            match self.broker.publish_completion(event.clone()).await {
                Ok(()) => return Ok(()),
                Err(error) => {
                    attempt += 1;
                    if attempt >= self.retry.max_attempts {
                        return Err(MyceliaError::BrokerUnavailable(error));
                    }
                    let delay = self.retry.delay_for(attempt);
                    tracing::warn!(
                        call = %event.call_id,
                        %error,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "completion publish failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Persist a continuation tree, children first. Existing records stay.
    async fn persist_tree(&self, root: &Call) -> Result<()> {
        for call in crate::dag::post_order(root) {
            self.storage
                .put_call(&call.to_record())
                .await
                .map_err(MyceliaError::StorageUnavailable)?;
        }
        Ok(())
    }

    /// Assemble the node body's input from resolved dependency values.
    async fn materialize(&self, record: &CallRecord) -> Result<Materialized> {
        let mut args = Vec::with_capacity(record.args.len());
        for slot in &record.args {
            match self.materialize_slot(record, slot).await? {
                Ok(value) => args.push(value),
                Err(error) => return Ok(Materialized::DepFailed(error)),
            }
        }

        let mut kwargs = BTreeMap::new();
        for (name, slot) in &record.kwargs {
            match self.materialize_slot(record, slot).await? {
                Ok(value) => {
                    kwargs.insert(name.clone(), value);
                }
                Err(error) => return Ok(Materialized::DepFailed(error)),
            }
        }

        Ok(Materialized::Input(CallInput::new(args, kwargs)))
    }

    async fn materialize_slot(
        &self,
        record: &CallRecord,
        slot: &SlotRecord,
    ) -> Result<std::result::Result<Value, ErrorInfo>> {
        let child = match slot {
            SlotRecord::Literal(value) => return Ok(Ok(value.clone())),
            SlotRecord::Ref(child) => *child,
        };

        let mut current = child;
        let mut hops = 0;
        loop {
            match self
                .storage
                .get_result(&current)
                .await
                .map_err(MyceliaError::StorageUnavailable)?
            {
                ResultLookup::Value(value) => return Ok(Ok(value)),
                ResultLookup::Forward(next) => {
                    hops += 1;
                    if hops > FORWARD_CHAIN_LIMIT {
                        return Err(MyceliaError::MalformedCall(format!(
                            "forward chain from {} exceeds {} hops",
                            child.short(),
                            FORWARD_CHAIN_LIMIT
                        )));
                    }
                    current = next;
                }
                ResultLookup::Failed(error) => {
                    let propagated = if error.kind == ErrorKind::DependencyFailed {
                        error
                    } else {
                        ErrorInfo::dependency_failed(current, error)
                    };
                    return Ok(Err(propagated));
                }
                ResultLookup::NotReady | ResultLookup::Missing => {
                    // scheduled before its dependency landed; retry later
                    return Err(MyceliaError::Custom(format!(
                        "dependency {} of call {} is not resolved yet",
                        current.short(),
                        record.id.short()
                    )));
                }
            }
        }
    }

    /// Rebuild a call tree from storage records (children collapse to refs
    /// in storage, so this recurses until it reaches literals).
    fn call_from_records(&self, id: CallId) -> BoxFuture<'_, Result<Call>> {
        Box::pin(async move {
            let record = self
                .storage
                .get_call(&id)
                .await
                .map_err(MyceliaError::StorageUnavailable)?
                .ok_or_else(|| {
                    MyceliaError::MalformedCall(format!("no record for call {}", id.short()))
                })?;

            let mut args = Vec::with_capacity(record.args.len());
            for slot in &record.args {
                args.push(self.slot_from_record(slot).await?);
            }
            let mut kwargs = BTreeMap::new();
            for (name, slot) in &record.kwargs {
                kwargs.insert(name.clone(), self.slot_from_record(slot).await?);
            }
            Call::new(record.node, args, kwargs)
        })
    }

    async fn slot_from_record(&self, slot: &SlotRecord) -> Result<Slot> {
        Ok(match slot {
            SlotRecord::Literal(value) => Slot::Literal(value.clone()),
            SlotRecord::Ref(child) => Slot::Call(self.call_from_records(*child).await?),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::Deferred;
    use crate::config::{MemoizationScope, SessionConfig};
    use crate::node::ArgSpec;
    use mycelia_adapters::{InMemoryBroker, InMemoryStorage, JsonCodec, NodeRef};
    use serde_json::json;

    fn test_worker() -> (Worker, Arc<InMemoryStorage>, watch::Sender<bool>) {
        let graph = Arc::new(Graph::new("g"));
        graph
            .node("noop", ArgSpec::default(), |_ctx, _input| {
                Box::pin(async { Ok(Deferred::value(Value::Null)) })
            })
            .unwrap();

        let broker = Arc::new(InMemoryBroker::new());
        let storage = Arc::new(InMemoryStorage::new());
        let config = SessionConfig::default();
        let scheduler = Scheduler::new(
            broker.clone(),
            storage.clone(),
            MemoizationScope::Session,
            config.retry.clone(),
            64,
        );
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let worker = Worker {
            index: 0,
            graph,
            broker,
            storage: storage.clone(),
            scheduler,
            codec: Arc::new(JsonCodec::new()),
            retry: config.retry,
            claim_poll: Duration::from_millis(50),
            cancel: cancel_rx,
        };
        (worker, storage, cancel_tx)
    }

    fn literal_call(name: &str, value: Value) -> Call {
        Call::new(
            NodeRef::new("g", name),
            vec![Slot::Literal(value)],
            BTreeMap::new(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_materialize_follows_forward_records() {
        let (worker, storage, _cancel) = test_worker();

        let origin = literal_call("origin", json!(1));
        let target = literal_call("target", json!(2));
        storage.put_call(&origin.to_record()).await.unwrap();
        storage.put_call(&target.to_record()).await.unwrap();

        // origin forwarded to target, target resolved
        storage
            .try_set_outcome(
                &origin.id(),
                CallStatus::Pending,
                &StoredOutcome::Forwarded(target.id()),
            )
            .await
            .unwrap();
        storage
            .try_set_outcome(
                &target.id(),
                CallStatus::Pending,
                &StoredOutcome::Resolved(json!("final")),
            )
            .await
            .unwrap();

        let parent = Call::new(
            NodeRef::new("g", "parent"),
            vec![Slot::Call(origin.clone()), Slot::Literal(json!("inline"))],
            BTreeMap::new(),
        )
        .unwrap();
        let record = parent.to_record();

        match worker.materialize(&record).await.unwrap() {
            Materialized::Input(input) => {
                assert_eq!(input.arg(0), Some(&json!("final")));
                assert_eq!(input.arg(1), Some(&json!("inline")));
            }
            Materialized::DepFailed(error) => panic!("unexpected failure: {}", error),
        }
    }

    #[tokio::test]
    async fn test_materialize_surfaces_failed_dependency() {
        let (worker, storage, _cancel) = test_worker();

        let dep = literal_call("dep", json!(1));
        storage.put_call(&dep.to_record()).await.unwrap();
        storage
            .try_set_outcome(
                &dep.id(),
                CallStatus::Pending,
                &StoredOutcome::Failed(ErrorInfo::new(ErrorKind::NodeExecution, "boom")),
            )
            .await
            .unwrap();

        let parent = Call::new(
            NodeRef::new("g", "parent"),
            vec![Slot::Call(dep.clone())],
            BTreeMap::new(),
        )
        .unwrap();

        match worker.materialize(&parent.to_record()).await.unwrap() {
            Materialized::DepFailed(error) => {
                assert_eq!(error.kind, ErrorKind::DependencyFailed);
                assert_eq!(error.dependency, Some(dep.id()));
            }
            Materialized::Input(_) => panic!("expected dependency failure"),
        }
    }

    #[tokio::test]
    async fn test_materialize_reports_unresolved_dependency() {
        let (worker, storage, _cancel) = test_worker();

        let dep = literal_call("dep", json!(1));
        storage.put_call(&dep.to_record()).await.unwrap();

        let parent = Call::new(
            NodeRef::new("g", "parent"),
            vec![Slot::Call(dep)],
            BTreeMap::new(),
        )
        .unwrap();

        assert!(worker.materialize(&parent.to_record()).await.is_err());
    }

    #[tokio::test]
    async fn test_call_from_records_round_trips() {
        let (worker, storage, _cancel) = test_worker();

        let child = literal_call("child", json!("x"));
        let parent = Call::new(
            NodeRef::new("g", "parent"),
            vec![Slot::Call(child.clone()), Slot::Literal(json!(3))],
            BTreeMap::from([("mode".to_string(), Slot::Literal(json!("fast")))]),
        )
        .unwrap();

        worker.persist_tree(&parent).await.unwrap();
        assert_eq!(storage.call_count().await, 2);

        let rebuilt = worker.call_from_records(parent.id()).await.unwrap();
        assert_eq!(rebuilt.id(), parent.id());
    }
}
