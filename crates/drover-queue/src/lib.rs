//! # Drover Queue
//!
//! Background job worker with interchangeable queue backends.
//!
//! Features:
//! - `Queue` contract with success / failed / error / stopped routing
//! - Backend adapters: reservation (tube), atomic list move, managed queue
//! - Idempotency store guarding at-least-once backends against redelivery
//! - Single-task worker loop with fault isolation and graceful shutdown

pub mod config;
pub mod idempotency;
pub mod list;
pub mod managed;
pub mod memory;
pub mod naming;
pub mod queue;
#[cfg(feature = "redis")]
pub mod redis;
pub mod reservation;
pub mod worker;

pub use config::{ConfigError, QueueSettings, WorkerConfig};
pub use idempotency::{IdempotencyError, IdempotencyRecord, IdempotencyStore, KeyValueClient, TypedValue};
pub use list::{ListClient, ListJob, ListQueue, ListSettings};
pub use managed::{ManagedQueue, ManagedQueueClient, ManagedSettings, ReceivedMessage};
pub use memory::{MemoryKeyValue, MemoryListClient, MemoryManagedClient, MemoryReservationClient};
pub use naming::QueueNames;
pub use queue::{Queue, QueueError};
pub use reservation::{ReservationClient, ReservationQueue, ReservationSettings, ReservedJob};
pub use worker::{ExitReason, JobHandler, Outcome, Worker, WorkerReport, STOP_SENTINEL};
