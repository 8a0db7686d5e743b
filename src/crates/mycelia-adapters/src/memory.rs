//! In-memory broker and storage for development and testing
//!
//! [`InMemoryBroker`] and [`InMemoryStorage`] are the reference
//! implementations of the [`Broker`] and [`Storage`] traits. They keep
//! everything in process memory behind tokio synchronization primitives, so
//! they are suitable for single-process sessions, examples, and the test
//! suite, and they double as executable documentation of the delivery and
//! CAS contracts a production backend must honor.
//!
//! The broker implements visibility-timeout redelivery: a claim that is not
//! acknowledged in time goes back on the queue and will be handed to the
//! next claimant. The storage applies both CAS operations under a single
//! write lock, which is exactly the atomicity a database backend provides
//! with a conditional `UPDATE`.

use crate::broker::{Broker, Claim, CompletionEvent, CompletionStream};
use crate::error::{AdapterError, Result};
use crate::ident::CallId;
use crate::storage::{CallRecord, CallStatus, ResultLookup, Storage, StoredOutcome};
use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Mutex, Notify, RwLock};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use uuid::Uuid;

const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(30);
const COMPLETION_CHANNEL_CAPACITY: usize = 1024;

/// Poll granularity for noticing expired claims while waiting.
const CLAIM_POLL_INTERVAL: Duration = Duration::from_millis(50);

struct InflightClaim {
    call_id: CallId,
    claimed_at: Instant,
}

#[derive(Default)]
struct QueueState {
    queue: VecDeque<CallId>,
    inflight: HashMap<Uuid, InflightClaim>,
}

/// In-memory broker implementation
///
/// FIFO queue with visibility-timeout redelivery and a broadcast channel for
/// completion events.
pub struct InMemoryBroker {
    state: Mutex<QueueState>,
    notify: Notify,
    completions: broadcast::Sender<CompletionEvent>,
    visibility: Duration,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::with_visibility_timeout(DEFAULT_VISIBILITY_TIMEOUT)
    }

    /// Broker whose un-acked claims are redelivered after `visibility`.
    pub fn with_visibility_timeout(visibility: Duration) -> Self {
        let (completions, _) = broadcast::channel(COMPLETION_CHANNEL_CAPACITY);
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            completions,
            visibility,
        }
    }

    /// Number of queued, unclaimed calls.
    pub async fn queued(&self) -> usize {
        self.state.lock().await.queue.len()
    }

    /// Number of claimed, un-acked calls.
    pub async fn inflight(&self) -> usize {
        let mut state = self.state.lock().await;
        Self::requeue_expired(&mut state, self.visibility);
        state.inflight.len()
    }

    fn requeue_expired(state: &mut QueueState, visibility: Duration) {
        let now = Instant::now();
        let expired: Vec<Uuid> = state
            .inflight
            .iter()
            .filter(|(_, claim)| now.duration_since(claim.claimed_at) >= visibility)
            .map(|(token, _)| *token)
            .collect();
        for token in expired {
            if let Some(claim) = state.inflight.remove(&token) {
                tracing::warn!(call = %claim.call_id, "claim expired, redelivering");
                state.queue.push_back(claim.call_id);
            }
        }
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn publish(&self, id: CallId) -> Result<()> {
        let mut state = self.state.lock().await;
        state.queue.push_back(id);
        drop(state);
        self.notify.notify_one();
        Ok(())
    }

    async fn claim(&self, wait: Duration) -> Result<Option<Claim>> {
        let deadline = Instant::now() + wait;
        loop {
            {
                let mut state = self.state.lock().await;
                Self::requeue_expired(&mut state, self.visibility);
                if let Some(call_id) = state.queue.pop_front() {
                    let token = Uuid::new_v4();
                    state.inflight.insert(
                        token,
                        InflightClaim {
                            call_id,
                            claimed_at: Instant::now(),
                        },
                    );
                    return Ok(Some(Claim { call_id, token }));
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let poll = (deadline - now).min(CLAIM_POLL_INTERVAL);
            let _ = tokio::time::timeout(poll, self.notify.notified()).await;
        }
    }

    async fn ack(&self, claim: &Claim) -> Result<()> {
        let mut state = self.state.lock().await;
        // an expired token is simply gone; acking it is a no-op
        state.inflight.remove(&claim.token);
        Ok(())
    }

    async fn nack(&self, claim: &Claim) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(inflight) = state.inflight.remove(&claim.token) {
            state.queue.push_back(inflight.call_id);
            drop(state);
            self.notify.notify_one();
        }
        Ok(())
    }

    async fn publish_completion(&self, event: CompletionEvent) -> Result<()> {
        // send fails only when nobody is subscribed, which is fine
        let _ = self.completions.send(event);
        Ok(())
    }

    fn subscribe_completions(&self) -> CompletionStream {
        let stream = BroadcastStream::new(self.completions.subscribe()).map(|item| {
            item.map_err(|error| match error {
                BroadcastStreamRecvError::Lagged(missed) => AdapterError::Lagged(missed),
            })
        });
        Box::pin(stream)
    }
}

/// Thread-safe in-memory call storage
type RecordMap = Arc<RwLock<HashMap<CallId, CallRecord>>>;

/// In-memory storage implementation
///
/// Stores call records in a locked `HashMap`. Both CAS operations run under
/// the write lock, so the single-writer invariant holds exactly as it would
/// with a conditional database update.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStorage {
    records: RecordMap,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of stored call records.
    pub async fn call_count(&self) -> usize {
        self.records.read().await.len()
    }

    /// Number of records currently in `status`.
    pub async fn count_with_status(&self, status: CallStatus) -> usize {
        self.records
            .read()
            .await
            .values()
            .filter(|record| record.status == status)
            .count()
    }

    /// Drop all records (useful for testing).
    pub async fn clear(&self) {
        self.records.write().await.clear();
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn put_call(&self, record: &CallRecord) -> Result<bool> {
        let mut records = self.records.write().await;
        if records.contains_key(&record.id) {
            return Ok(false);
        }
        records.insert(record.id, record.clone());
        Ok(true)
    }

    async fn get_call(&self, id: &CallId) -> Result<Option<CallRecord>> {
        Ok(self.records.read().await.get(id).cloned())
    }

    async fn set_status(&self, id: &CallId, from: CallStatus, to: CallStatus) -> Result<bool> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(id)
            .ok_or_else(|| AdapterError::NotFound(format!("call {}", id.short())))?;
        if record.status != from {
            return Ok(false);
        }
        record.status = to;
        record.updated_at = Utc::now();
        Ok(true)
    }

    async fn try_set_outcome(
        &self,
        id: &CallId,
        expected: CallStatus,
        outcome: &StoredOutcome,
    ) -> Result<bool> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(id)
            .ok_or_else(|| AdapterError::NotFound(format!("call {}", id.short())))?;
        if record.status.is_terminal() || record.status != expected {
            return Ok(false);
        }
        record.status = outcome.status();
        record.outcome = Some(outcome.clone());
        record.updated_at = Utc::now();
        Ok(true)
    }

    async fn get_result(&self, id: &CallId) -> Result<ResultLookup> {
        let records = self.records.read().await;
        let Some(record) = records.get(id) else {
            return Ok(ResultLookup::Missing);
        };
        Ok(match &record.outcome {
            Some(StoredOutcome::Resolved(value)) => ResultLookup::Value(value.clone()),
            Some(StoredOutcome::Forwarded(target)) => ResultLookup::Forward(*target),
            Some(StoredOutcome::Failed(error)) => ResultLookup::Failed(error.clone()),
            None => ResultLookup::NotReady,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::CompletionOutcome;
    use crate::ident::{ErrorInfo, ErrorKind, NodeRef};
    use serde_json::json;
    use std::collections::BTreeMap;

    fn test_id(byte: u8) -> CallId {
        CallId::from_bytes([byte; 32])
    }

    fn test_record(byte: u8) -> CallRecord {
        CallRecord::new(
            test_id(byte),
            NodeRef::new("graph", "node"),
            Vec::new(),
            BTreeMap::new(),
        )
    }

    #[tokio::test]
    async fn test_publish_claim_ack() {
        let broker = InMemoryBroker::new();
        broker.publish(test_id(1)).await.unwrap();

        let claim = broker
            .claim(Duration::from_millis(100))
            .await
            .unwrap()
            .expect("claim available");
        assert_eq!(claim.call_id, test_id(1));
        assert_eq!(broker.inflight().await, 1);

        broker.ack(&claim).await.unwrap();
        assert_eq!(broker.inflight().await, 0);
        assert_eq!(broker.queued().await, 0);
    }

    #[tokio::test]
    async fn test_claim_preserves_publish_order() {
        let broker = InMemoryBroker::new();
        for byte in 1..=3 {
            broker.publish(test_id(byte)).await.unwrap();
        }

        for byte in 1..=3 {
            let claim = broker
                .claim(Duration::from_millis(100))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(claim.call_id, test_id(byte));
            broker.ack(&claim).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_claim_times_out_on_empty_queue() {
        let broker = InMemoryBroker::new();
        let claimed = broker.claim(Duration::from_millis(50)).await.unwrap();
        assert!(claimed.is_none());
    }

    #[tokio::test]
    async fn test_unacked_claim_is_redelivered() {
        let broker = InMemoryBroker::with_visibility_timeout(Duration::from_millis(50));
        broker.publish(test_id(7)).await.unwrap();

        let first = broker
            .claim(Duration::from_millis(100))
            .await
            .unwrap()
            .unwrap();
        // simulate a worker crash: never ack
        tokio::time::sleep(Duration::from_millis(80)).await;

        let second = broker
            .claim(Duration::from_millis(200))
            .await
            .unwrap()
            .expect("redelivered");
        assert_eq!(second.call_id, test_id(7));
        assert_ne!(second.token, first.token);

        // the dead worker's ack is a harmless no-op
        broker.ack(&first).await.unwrap();
        assert_eq!(broker.inflight().await, 1);
    }

    #[tokio::test]
    async fn test_nack_requeues_immediately() {
        let broker = InMemoryBroker::new();
        broker.publish(test_id(2)).await.unwrap();

        let claim = broker
            .claim(Duration::from_millis(100))
            .await
            .unwrap()
            .unwrap();
        broker.nack(&claim).await.unwrap();

        let again = broker
            .claim(Duration::from_millis(100))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(again.call_id, test_id(2));
    }

    #[tokio::test]
    async fn test_completion_broadcast() {
        let broker = InMemoryBroker::new();
        let mut stream = broker.subscribe_completions();

        broker
            .publish_completion(CompletionEvent {
                call_id: test_id(9),
                outcome: CompletionOutcome::Resolved { value: json!(42) },
            })
            .await
            .unwrap();

        let event = stream.next().await.unwrap().unwrap();
        assert_eq!(event.call_id, test_id(9));
    }

    #[tokio::test]
    async fn test_put_call_first_writer_wins() {
        let storage = InMemoryStorage::new();
        assert!(storage.put_call(&test_record(1)).await.unwrap());
        assert!(!storage.put_call(&test_record(1)).await.unwrap());
        assert_eq!(storage.call_count().await, 1);
    }

    #[tokio::test]
    async fn test_status_cas() {
        let storage = InMemoryStorage::new();
        storage.put_call(&test_record(1)).await.unwrap();

        assert!(storage
            .set_status(&test_id(1), CallStatus::Pending, CallStatus::Ready)
            .await
            .unwrap());
        // lost CAS: status is no longer Pending
        assert!(!storage
            .set_status(&test_id(1), CallStatus::Pending, CallStatus::Ready)
            .await
            .unwrap());
        assert!(storage
            .set_status(&test_id(1), CallStatus::Ready, CallStatus::Running)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_outcome_cas_rejects_second_writer() {
        let storage = InMemoryStorage::new();
        storage.put_call(&test_record(1)).await.unwrap();
        storage
            .set_status(&test_id(1), CallStatus::Pending, CallStatus::Ready)
            .await
            .unwrap();
        storage
            .set_status(&test_id(1), CallStatus::Ready, CallStatus::Running)
            .await
            .unwrap();

        let first = StoredOutcome::Resolved(json!("winner"));
        let second = StoredOutcome::Resolved(json!("loser"));

        assert!(storage
            .try_set_outcome(&test_id(1), CallStatus::Running, &first)
            .await
            .unwrap());
        assert!(!storage
            .try_set_outcome(&test_id(1), CallStatus::Running, &second)
            .await
            .unwrap());

        let record = storage.get_call(&test_id(1)).await.unwrap().unwrap();
        assert_eq!(record.status, CallStatus::Resolved);
        assert_eq!(record.outcome, Some(first));
    }

    #[tokio::test]
    async fn test_get_result_variants() {
        let storage = InMemoryStorage::new();
        assert_eq!(
            storage.get_result(&test_id(1)).await.unwrap(),
            ResultLookup::Missing
        );

        storage.put_call(&test_record(1)).await.unwrap();
        assert_eq!(
            storage.get_result(&test_id(1)).await.unwrap(),
            ResultLookup::NotReady
        );

        storage.put_call(&test_record(2)).await.unwrap();
        storage
            .set_status(&test_id(2), CallStatus::Pending, CallStatus::Ready)
            .await
            .unwrap();
        storage
            .set_status(&test_id(2), CallStatus::Ready, CallStatus::Running)
            .await
            .unwrap();
        storage
            .try_set_outcome(
                &test_id(2),
                CallStatus::Running,
                &StoredOutcome::Forwarded(test_id(3)),
            )
            .await
            .unwrap();
        assert_eq!(
            storage.get_result(&test_id(2)).await.unwrap(),
            ResultLookup::Forward(test_id(3))
        );

        storage.put_call(&test_record(4)).await.unwrap();
        storage
            .try_set_outcome(
                &test_id(4),
                CallStatus::Pending,
                &StoredOutcome::Failed(ErrorInfo::new(ErrorKind::NodeExecution, "boom")),
            )
            .await
            .unwrap();
        match storage.get_result(&test_id(4)).await.unwrap() {
            ResultLookup::Failed(error) => assert_eq!(error.kind, ErrorKind::NodeExecution),
            other => panic!("unexpected lookup: {:?}", other),
        }
    }
}
