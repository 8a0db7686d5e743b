//! DAG construction: turning call trees into scheduler state
//!
//! Registration walks a call tree in post-order, so every child is inserted
//! (and has its id) before its parents. An id the scheduler already knows is
//! structural sharing: the existing entry is reused and no edge is added
//! twice. Acyclicity holds by construction, since a cycle would require a
//! call whose id depends on its own id.

use crate::call::Call;
use crate::config::MemoizationScope;
use crate::error::{MyceliaError, Result};
use crate::scheduler::{CallState, LocalStatus, Scheduler, SchedulerInner};
use mycelia_adapters::{CallId, ErrorInfo, ErrorKind};
use std::collections::HashSet;

/// Unique calls of a tree, children before parents.
pub(crate) fn post_order(root: &Call) -> Vec<Call> {
    fn visit(call: &Call, visited: &mut HashSet<CallId>, order: &mut Vec<Call>) {
        if !visited.insert(call.id()) {
            return;
        }
        for child in call.child_calls() {
            visit(child, visited, order);
        }
        order.push(call.clone());
    }

    let mut visited = HashSet::new();
    let mut order = Vec::new();
    visit(root, &mut visited, &mut order);
    order
}

impl Scheduler {
    /// Register a call tree: persist records, wire edges, enqueue ready work.
    ///
    /// Idempotent per id: registering an identical call again lands on the
    /// existing entry, and duplicate requests within the session return the
    /// memoized result once it exists.
    pub(crate) async fn register(&self, call: &Call) -> Result<CallId> {
        let mut newly_ready = Vec::new();
        {
            let mut inner = self.inner.lock().await;
            self.insert_tree(&mut inner, call, &mut newly_ready).await?;
        }
        self.publish_ready(&newly_ready).await?;
        Ok(call.id())
    }

    /// Insert every call of a tree into the scheduler state.
    ///
    /// Caller holds the scheduler lock; freshly ready ids are appended to
    /// `newly_ready` for publishing after the lock is released.
    pub(crate) async fn insert_tree(
        &self,
        inner: &mut SchedulerInner,
        root: &Call,
        newly_ready: &mut Vec<CallId>,
    ) -> Result<()> {
        for call in post_order(root) {
            self.insert_one(inner, &call, newly_ready).await?;
        }
        Ok(())
    }

    async fn insert_one(
        &self,
        inner: &mut SchedulerInner,
        call: &Call,
        newly_ready: &mut Vec<CallId>,
    ) -> Result<()> {
        let id = call.id();
        if inner.calls.contains_key(&id) {
            // structural sharing: same id, same entity
            return Ok(());
        }

        if self.memoization == MemoizationScope::Persistent {
            if let Some(stored) = self.lookup_stored(id).await? {
                let status = match stored {
                    Ok(value) => {
                        tracing::debug!(call = %id, "adopted memoized result from storage");
                        LocalStatus::Resolved(value)
                    }
                    Err(error) => {
                        tracing::debug!(call = %id, "adopted recorded failure from storage");
                        LocalStatus::Failed(error)
                    }
                };
                inner.calls.insert(
                    id,
                    CallState {
                        status,
                        unresolved: 0,
                        dependents: HashSet::new(),
                    },
                );
                return Ok(());
            }
        }

        let record = call.to_record();
        let inserted = self
            .storage
            .put_call(&record)
            .await
            .map_err(MyceliaError::StorageUnavailable)?;
        if !inserted {
            tracing::debug!(call = %id, "record already persisted");
        }

        // one edge per distinct dependency, however many slots share it
        let mut dep_ids = Vec::new();
        let mut seen = HashSet::new();
        for child in call.child_calls() {
            if seen.insert(child.id()) {
                dep_ids.push(child.id());
            }
        }

        let mut unresolved = 0;
        let mut failed_dep: Option<(CallId, ErrorInfo)> = None;
        for dep_id in dep_ids {
            let target = Self::resolve_alias(inner, dep_id);
            let Some(dep_state) = inner.calls.get_mut(&target) else {
                continue;
            };
            match &dep_state.status {
                LocalStatus::Resolved(_) => {}
                LocalStatus::Failed(error) => {
                    if failed_dep.is_none() {
                        failed_dep = Some((target, error.clone()));
                    }
                }
                _ => {
                    unresolved += 1;
                    dep_state.dependents.insert(id);
                }
            }
        }

        inner.calls.insert(
            id,
            CallState {
                status: LocalStatus::Pending,
                unresolved,
                dependents: HashSet::new(),
            },
        );
        tracing::debug!(call = %id, node = %call.node(), unresolved, "call registered");

        if let Some((dep_id, error)) = failed_dep {
            let propagated = if error.kind == ErrorKind::DependencyFailed {
                error
            } else {
                ErrorInfo::dependency_failed(dep_id, error)
            };
            self.fail_transitively(inner, id, propagated, false).await?;
        } else if unresolved == 0 {
            if let Some(state) = inner.calls.get_mut(&id) {
                state.status = LocalStatus::Ready;
            }
            newly_ready.push(id);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::Slot;
    use crate::config::RetryConfig;
    use mycelia_adapters::{
        Broker, CallRecord, CallStatus, CompletionEvent, CompletionOutcome, InMemoryBroker,
        InMemoryStorage, NodeRef, Storage, StoredOutcome,
    };
    use serde_json::{json, Value};
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::time::Duration;

    fn scheduler_with(
        memoization: MemoizationScope,
    ) -> (Arc<Scheduler>, Arc<InMemoryBroker>, Arc<InMemoryStorage>) {
        let broker = Arc::new(InMemoryBroker::new());
        let storage = Arc::new(InMemoryStorage::new());
        let scheduler = Scheduler::new(
            broker.clone(),
            storage.clone(),
            memoization,
            RetryConfig::default(),
            64,
        );
        (scheduler, broker, storage)
    }

    fn leaf(name: &str, arg: Value) -> Call {
        Call::new(
            NodeRef::new("g", name),
            vec![Slot::Literal(arg)],
            BTreeMap::new(),
        )
        .unwrap()
    }

    fn parent_of(name: &str, children: Vec<Call>) -> Call {
        Call::new(
            NodeRef::new("g", name),
            children.into_iter().map(Slot::Call).collect(),
            BTreeMap::new(),
        )
        .unwrap()
    }

    async fn next_published(broker: &InMemoryBroker) -> Option<mycelia_adapters::CallId> {
        broker
            .claim(Duration::from_millis(100))
            .await
            .unwrap()
            .map(|claim| claim.call_id)
    }

    #[tokio::test]
    async fn test_leaf_is_ready_immediately() {
        let (scheduler, broker, storage) = scheduler_with(MemoizationScope::Session);
        let call = leaf("child", json!(1));

        scheduler.register(&call).await.unwrap();

        assert_eq!(next_published(&broker).await, Some(call.id()));
        let record = storage.get_call(&call.id()).await.unwrap().unwrap();
        assert_eq!(record.status, CallStatus::Ready);
    }

    #[tokio::test]
    async fn test_parent_waits_for_children() {
        let (scheduler, broker, _storage) = scheduler_with(MemoizationScope::Session);
        let a = leaf("child", json!(1));
        let b = leaf("child", json!(2));
        let parent = parent_of("parent", vec![a.clone(), b.clone()]);

        scheduler.register(&parent).await.unwrap();

        // both children published, parent not
        let first = next_published(&broker).await.unwrap();
        let second = next_published(&broker).await.unwrap();
        assert_eq!(
            HashSet::from([first, second]),
            HashSet::from([a.id(), b.id()])
        );
        assert_eq!(next_published(&broker).await, None);

        scheduler
            .apply_completion(CompletionEvent {
                call_id: a.id(),
                outcome: CompletionOutcome::Resolved { value: json!(10) },
            })
            .await
            .unwrap();
        assert_eq!(next_published(&broker).await, None);

        scheduler
            .apply_completion(CompletionEvent {
                call_id: b.id(),
                outcome: CompletionOutcome::Resolved { value: json!(20) },
            })
            .await
            .unwrap();
        assert_eq!(next_published(&broker).await, Some(parent.id()));
    }

    #[tokio::test]
    async fn test_shared_child_registers_once() {
        let (scheduler, broker, storage) = scheduler_with(MemoizationScope::Session);
        let shared = leaf("child", json!(0));
        let parent = parent_of("parent", vec![shared.clone(), shared.clone(), shared.clone()]);

        scheduler.register(&parent).await.unwrap();

        assert_eq!(next_published(&broker).await, Some(shared.id()));
        assert_eq!(next_published(&broker).await, None);
        // two records total: the shared child and the parent
        assert_eq!(storage.call_count().await, 2);

        // one resolution readies the parent despite three slots
        scheduler
            .apply_completion(CompletionEvent {
                call_id: shared.id(),
                outcome: CompletionOutcome::Resolved { value: json!(7) },
            })
            .await
            .unwrap();
        assert_eq!(next_published(&broker).await, Some(parent.id()));
    }

    #[tokio::test]
    async fn test_duplicate_registration_is_idempotent() {
        let (scheduler, broker, storage) = scheduler_with(MemoizationScope::Session);
        let call = leaf("child", json!(5));

        let first = scheduler.register(&call).await.unwrap();
        let second = scheduler.register(&call).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(storage.call_count().await, 1);
        // published once, not twice
        assert_eq!(next_published(&broker).await, Some(call.id()));
        assert_eq!(next_published(&broker).await, None);
    }

    #[tokio::test]
    async fn test_failure_propagates_to_transitive_dependents() {
        let (scheduler, broker, storage) = scheduler_with(MemoizationScope::Session);
        let bottom = leaf("leaf", json!(1));
        let mid = parent_of("mid", vec![bottom.clone()]);
        let root = parent_of("root", vec![mid.clone()]);

        scheduler.register(&root).await.unwrap();
        let _ = next_published(&broker).await;

        let boom = ErrorInfo::new(ErrorKind::NodeExecution, "boom");
        scheduler
            .apply_completion(CompletionEvent {
                call_id: bottom.id(),
                outcome: CompletionOutcome::Failed { error: boom },
            })
            .await
            .unwrap();

        // neither mid nor root was ever published
        assert_eq!(next_published(&broker).await, None);

        for id in [mid.id(), root.id()] {
            let record = storage.get_call(&id).await.unwrap().unwrap();
            assert_eq!(record.status, CallStatus::Failed);
            match record.outcome {
                Some(StoredOutcome::Failed(error)) => {
                    assert_eq!(error.kind, ErrorKind::DependencyFailed);
                    // both point at the original failing call
                    assert_eq!(error.dependency, Some(bottom.id()));
                }
                other => panic!("unexpected outcome: {:?}", other),
            }
        }

        let result = scheduler.wait(root.id()).await;
        assert!(matches!(
            result,
            Err(MyceliaError::DependencyFailed { dependency, .. }) if dependency == bottom.id()
        ));
    }

    #[tokio::test]
    async fn test_registering_against_failed_dep_fails_immediately() {
        let (scheduler, broker, _storage) = scheduler_with(MemoizationScope::Session);
        let bottom = leaf("leaf", json!(1));
        scheduler.register(&bottom).await.unwrap();
        let _ = next_published(&broker).await;

        scheduler
            .apply_completion(CompletionEvent {
                call_id: bottom.id(),
                outcome: CompletionOutcome::Failed {
                    error: ErrorInfo::new(ErrorKind::NodeExecution, "boom"),
                },
            })
            .await
            .unwrap();

        let late = parent_of("late", vec![bottom.clone()]);
        scheduler.register(&late).await.unwrap();

        assert_eq!(next_published(&broker).await, None);
        let result = scheduler.wait(late.id()).await;
        assert!(matches!(result, Err(MyceliaError::DependencyFailed { .. })));
    }

    #[tokio::test]
    async fn test_forward_transfers_dependents() {
        let (scheduler, broker, _storage) = scheduler_with(MemoizationScope::Session);
        let a = leaf("a", json!(1));
        let parent = parent_of("parent", vec![a.clone()]);

        scheduler.register(&parent).await.unwrap();
        assert_eq!(next_published(&broker).await, Some(a.id()));

        // a tail-calls b
        let b = leaf("b", json!(2));
        scheduler
            .apply_completion(CompletionEvent {
                call_id: a.id(),
                outcome: CompletionOutcome::Forwarded {
                    to: b.id(),
                    call: b.to_wire(),
                },
            })
            .await
            .unwrap();

        // b is published; parent still waits
        assert_eq!(next_published(&broker).await, Some(b.id()));
        assert_eq!(next_published(&broker).await, None);

        scheduler
            .apply_completion(CompletionEvent {
                call_id: b.id(),
                outcome: CompletionOutcome::Resolved { value: json!("done") },
            })
            .await
            .unwrap();

        // parent becomes ready, and waiting on a follows the forward
        assert_eq!(next_published(&broker).await, Some(parent.id()));
        assert_eq!(scheduler.wait(a.id()).await.unwrap(), json!("done"));
    }

    #[tokio::test]
    async fn test_persistent_scope_adopts_stored_result() {
        let (scheduler, broker, storage) = scheduler_with(MemoizationScope::Persistent);
        let call = leaf("memoized", json!(1));

        // a previous session left a resolved record behind
        let mut record: CallRecord = call.to_record();
        record.status = CallStatus::Resolved;
        record.outcome = Some(StoredOutcome::Resolved(json!(99)));
        storage.put_call(&record).await.unwrap();

        scheduler.register(&call).await.unwrap();

        assert_eq!(next_published(&broker).await, None);
        assert_eq!(scheduler.wait(call.id()).await.unwrap(), json!(99));
    }

    #[tokio::test]
    async fn test_session_scope_reschedules_despite_stored_result() {
        let (scheduler, broker, storage) = scheduler_with(MemoizationScope::Session);
        let call = leaf("memoized", json!(1));

        let mut record: CallRecord = call.to_record();
        record.status = CallStatus::Resolved;
        record.outcome = Some(StoredOutcome::Resolved(json!(99)));
        storage.put_call(&record).await.unwrap();

        scheduler.register(&call).await.unwrap();

        // scheduled anyway; a worker will notice the terminal record
        assert_eq!(next_published(&broker).await, Some(call.id()));
    }

    #[tokio::test]
    async fn test_cancel_wakes_waiters() {
        let (scheduler, _broker, _storage) = scheduler_with(MemoizationScope::Session);
        let call = leaf("slow", json!(1));
        scheduler.register(&call).await.unwrap();

        let waiter = {
            let scheduler = scheduler.clone();
            let id = call.id();
            tokio::spawn(async move { scheduler.wait(id).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        scheduler.cancel().await;

        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(MyceliaError::SessionCancelled)));
    }
}
