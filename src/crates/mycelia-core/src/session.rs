//! Session lifecycle: the bounded lifetime of scheduler, broker, and storage
//!
//! `Session::open` freezes the graph, connects the scheduler to the broker's
//! completion stream, and starts the worker loops. `execute` registers a
//! root call and awaits its terminal resolution, following forwards.
//! `close` cancels cooperatively: workers stop claiming, outstanding work is
//! returned to the queue, and every waiter is woken with a cancellation
//! error. Dropping an unclosed session aborts the loops as a last resort.

use crate::call::Call;
use crate::config::SessionConfig;
use crate::error::Result;
use crate::executor::Worker;
use crate::graph::Graph;
use crate::scheduler::Scheduler;
use futures::StreamExt;
use mycelia_adapters::{Broker, Codec, CompletionStream, JsonCodec, Storage};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

const CLOSE_GRACE: Duration = Duration::from_secs(5);

/// An open connection between a graph, a broker, and a storage backend
pub struct Session {
    graph: Arc<Graph>,
    scheduler: Arc<Scheduler>,
    cancel: watch::Sender<bool>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Session {
    /// Open a session with the default JSON result codec.
    pub async fn open(
        graph: Arc<Graph>,
        broker: Arc<dyn Broker>,
        storage: Arc<dyn Storage>,
        config: SessionConfig,
    ) -> Result<Self> {
        Self::open_with_codec(graph, broker, storage, config, Arc::new(JsonCodec::new())).await
    }

    /// Open a session with an explicit result codec.
    pub async fn open_with_codec(
        graph: Arc<Graph>,
        broker: Arc<dyn Broker>,
        storage: Arc<dyn Storage>,
        config: SessionConfig,
        codec: Arc<dyn Codec>,
    ) -> Result<Self> {
        graph.freeze();

        let scheduler = Scheduler::new(
            broker.clone(),
            storage.clone(),
            config.memoization,
            config.retry.clone(),
            config.event_capacity,
        );
        let (cancel, cancel_rx) = watch::channel(false);
        let mut tasks = Vec::with_capacity(config.workers + 1);

        // subscribe before any worker can publish a completion
        let completions = broker.subscribe_completions();
        tasks.push(tokio::spawn(scheduler_loop(
            scheduler.clone(),
            completions,
            cancel_rx.clone(),
        )));

        for index in 0..config.workers {
            let worker = Worker {
                index,
                graph: graph.clone(),
                broker: broker.clone(),
                storage: storage.clone(),
                scheduler: scheduler.clone(),
                codec: codec.clone(),
                retry: config.retry.clone(),
                claim_poll: config.claim_poll(),
                cancel: cancel_rx.clone(),
            };
            tasks.push(tokio::spawn(worker.run()));
        }

        tracing::info!(
            graph = graph.name(),
            workers = config.workers,
            memoization = ?config.memoization,
            "session opened"
        );

        Ok(Self {
            graph,
            scheduler,
            cancel,
            tasks: std::sync::Mutex::new(tasks),
        })
    }

    /// The graph this session executes against.
    pub fn graph(&self) -> &Arc<Graph> {
        &self.graph
    }

    /// Register a root call and await its terminal resolution.
    ///
    /// Follows forward records, so if the root tail-calls into a chain the
    /// returned value is the chain's final one. A recorded failure surfaces
    /// as the captured error.
    pub async fn execute(&self, call: &Call) -> Result<Value> {
        let id = self.scheduler.register(call).await?;
        tracing::debug!(call = %id, node = %call.node(), "root call registered");
        self.scheduler.wait(id).await
    }

    /// Cancel outstanding work, stop the loops, and disconnect.
    ///
    /// Idempotent: the first call tears everything down, later calls are
    /// no-ops. Every pending `execute` returns `SessionCancelled`.
    pub async fn close(&self) -> Result<()> {
        tracing::info!(graph = self.graph.name(), "session closing");
        let _ = self.cancel.send(true);
        self.scheduler.cancel().await;

        let tasks = {
            let mut tasks = self.tasks.lock().expect("session task list poisoned");
            std::mem::take(&mut *tasks)
        };
        for mut task in tasks {
            match tokio::time::timeout(CLOSE_GRACE, &mut task).await {
                Ok(_) => {}
                Err(_) => {
                    tracing::warn!("task did not stop within grace period, aborting");
                    task.abort();
                }
            }
        }
        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // last resort for sessions dropped without close()
        if let Ok(tasks) = self.tasks.lock() {
            for task in tasks.iter() {
                task.abort();
            }
        }
    }
}

async fn scheduler_loop(
    scheduler: Arc<Scheduler>,
    mut completions: CompletionStream,
    mut cancel: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            changed = cancel.changed() => {
                if changed.is_err() || *cancel.borrow() {
                    break;
                }
            }
            event = completions.next() => match event {
                Some(Ok(event)) => {
                    if let Err(error) = scheduler.apply_completion(event).await {
                        tracing::error!(%error, "failed to apply completion event");
                    }
                }
                Some(Err(error)) => {
                    tracing::warn!(%error, "completion stream error");
                }
                None => break,
            },
        }
    }
    tracing::debug!("scheduler loop stopped");
}
