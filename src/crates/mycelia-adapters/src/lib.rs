//! # mycelia-adapters - Distribution Layer Contracts for Mycelia
//!
//! **Broker and storage adapter traits, the wire-level data model, and
//! in-memory reference implementations** for the Mycelia task-graph runtime.
//! This crate is what makes the engine horizontally scalable and
//! crash-tolerant: the scheduler and executors in `mycelia-core` speak only
//! to the traits defined here, never to a concrete backend.
//!
//! ## Overview
//!
//! A Mycelia deployment needs two external collaborators:
//!
//! - a **message broker** carrying ready call ids to workers and completion
//!   events back to the scheduler ([`Broker`]), and
//! - a **durable key-value store** holding the authoritative state of every
//!   call, keyed by content id ([`Storage`]).
//!
//! Both contracts are deliberately small. The broker guarantees
//! at-least-once delivery with visibility-timeout redelivery and per-producer
//! FIFO. The storage guarantees compare-and-swap on call status, which is the
//! single synchronization primitive the whole system relies on: under
//! redelivery, two workers may run the same call, but only the first terminal
//! write sticks.
//!
//! ## Core Types
//!
//! - [`CallId`] - content-derived identity (SHA-256, hex-encoded)
//! - [`NodeRef`] - (graph, node) reference a call resolves against
//! - [`CallRecord`] / [`SlotRecord`] / [`CallStatus`] / [`StoredOutcome`] -
//!   the persisted shape of a call
//! - [`ErrorInfo`] / [`ErrorKind`] - serializable failure descriptors
//!   propagated through the dependency graph
//! - [`Claim`] / [`CompletionEvent`] / [`CompletionOutcome`] - queue-side
//!   messages
//! - [`Codec`] - pluggable result serialization ([`JsonCodec`] by default,
//!   [`BincodeCodec`] as the binary alternative)
//!
//! ## Implementation Strategy
//!
//! [`InMemoryBroker`] and [`InMemoryStorage`] are complete, contract-faithful
//! implementations for development, testing, and single-process sessions.
//! Production deployments implement [`Broker`] over AMQP and [`Storage`] over
//! PostgreSQL (one table, primary key = call id, conditional `UPDATE` for
//! the CAS operations) in downstream crates; the engine does not change.

pub mod broker;
pub mod codec;
pub mod error;
pub mod ident;
pub mod memory;
pub mod storage;

// Re-export main types
pub use broker::{Broker, Claim, CompletionEvent, CompletionOutcome, CompletionStream};
pub use codec::{BincodeCodec, Codec, JsonCodec};
pub use error::{AdapterError, Result};
pub use ident::{CallId, ErrorInfo, ErrorKind, NodeRef};
pub use memory::{InMemoryBroker, InMemoryStorage};
pub use storage::{CallRecord, CallStatus, ResultLookup, SlotRecord, Storage, StoredOutcome};
