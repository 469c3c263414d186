//! Partitioned hop routing
//!
//! Each partition pairs a [`coordinator::Coordinator`] with an
//! [`executor::Executor`]. Coordinators share the transaction state and use it
//! to gate hops on other transactions; executors own their partition's rows.

pub mod channel;
pub mod coordinator;
pub mod events;
pub mod executor;
pub mod hooks;
pub mod queue;
pub mod runtime;
pub mod state;
pub mod types;

pub use channel::{channel, HopReceiver, HopSender};
pub use coordinator::{Coordinator, CoordinatorReport, ReadResult};
pub use events::{BufferingEventSink, EventBus, EventKind, EventSink, LoggingEventSink, RouterEvent};
pub use executor::{Executor, ExecutorStats};
pub use hooks::{AlwaysCommit, FnValidator, HopValidator, StrictValidator, Verdict};
pub use queue::{HopQueue, QueuedHop};
pub use runtime::{Router, RouterBuilder, RunReport, ShutdownHandle};
pub use state::{DoneEntry, DoneSet, GateMonitor, RouterState, TagSignals, TransactionStates};
pub use types::{
    Hop, Operation, OperationOutcome, OperationType, PartitionId, Request, Response,
    ResponseStatus, TransactionPhase, TxTag,
};
