//! tokenflow-core: a token-based BPMN 2.0 process execution engine.
//!
//! Business analysts author directed graphs of events, tasks, and gateways;
//! this crate parses those graphs, plants tokens at start events, and drives
//! instances to completion across failures, restarts, and concurrent
//! activity. The engine is embedded: transport surfaces, authentication, and
//! definition CRUD live in the host application, which talks to
//! [`engine::ProcessEngine`] through plain async methods.
//!
//! Architecture, leaves first:
//!
//! - [`bpmn`]: XML parsing, validation, the immutable process graph
//! - [`store`]: the durable (relational) and runtime (coordination) store
//!   traits, with in-memory and Postgres implementations
//! - [`token_manager`]: atomic token create/move/split/consume
//! - [`expr`] / [`script`]: the sandboxed expression and script language
//! - [`instance`]: instance lifecycle, variables, the activity log
//! - [`engine`]: node executors and the per-instance run loop
//! - [`scheduler`] / [`bus`]: timer jobs and the `process.started` bridge

pub mod bpmn;
pub mod bus;
pub mod engine;
pub mod error;
mod executor;
pub mod expr;
pub mod instance;
pub mod scheduler;
pub mod script;
pub mod service;
pub mod store;
pub mod store_memory;
#[cfg(feature = "postgres")]
pub mod store_postgres;
pub mod timer;
pub mod token_manager;
pub mod types;

pub use engine::{ProcessEngine, LOCK_TTL, MAX_ITERATIONS};
pub use error::{EngineError, ErrorKind, Result};
pub use types::*;
