//! # AgentFlow Storage
//!
//! The persistence port and its implementations. All inter-process state
//! transitions funnel through [`PersistenceStore`]: the evaluator, the
//! runner service and the agent poller never talk to a backend directly.
//!
//! Two implementations are provided:
//! - [`InMemoryStore`] for tests
//! - [`PostgresStore`] for production, with `FOR UPDATE SKIP LOCKED` task
//!   claiming and partial unique indexes carrying the queue invariants

pub mod changes;
pub mod memory;
pub mod postgres;
pub mod store;

pub use changes::IterationChanges;
pub use memory::InMemoryStore;
pub use postgres::PostgresStore;
pub use store::{PersistenceStore, StoreError};
