// Core infrastructure modules
pub mod core;

// Per-partition row storage
pub mod storage;

// Coordinators, executors and the shared transaction state
pub mod router;

// Re-exports for convenience
pub use crate::core::{AbortScope, Result, RouterConfig, RouterConfigBuilder, RouterError};
pub use router::{
    AlwaysCommit, BufferingEventSink, EventKind, FnValidator, Hop, HopValidator, Operation,
    OperationOutcome, OperationType, Response, ResponseStatus, Router, RouterBuilder,
    RouterEvent, RunReport, ShutdownHandle, StrictValidator, TransactionPhase, Verdict,
};
pub use storage::{MemoryRowStore, Record, RowStore, SledRowStore, StoreFactory};
