//! Core types for partitioned hop routing
//!
//! A transaction is never materialised as an object: it is the set of hops
//! sharing a `transaction_tag` across partition queues.

use crate::storage::{key_string, Record};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;

/// Index of a partition
pub type PartitionId = usize;

/// Transaction tag shared by all hops of one transaction
pub type TxTag = String;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    Read,
    Write,
    Update,
}

/// One row operation inside a hop
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub operation_type: OperationType,
    pub table_name: String,
    pub primary_key_name: String,
    pub primary_key_value: Value,
    /// Record schema for write/update, fill-in template for read
    #[serde(default)]
    pub data: Record,
}

impl Operation {
    fn new(
        operation_type: OperationType,
        table_name: impl Into<String>,
        primary_key_name: impl Into<String>,
        primary_key_value: impl Into<Value>,
        data: Record,
    ) -> Self {
        Self {
            operation_type,
            table_name: table_name.into(),
            primary_key_name: primary_key_name.into(),
            primary_key_value: primary_key_value.into(),
            data,
        }
    }

    pub fn write(
        table_name: impl Into<String>,
        primary_key_name: impl Into<String>,
        primary_key_value: impl Into<Value>,
        data: Record,
    ) -> Self {
        Self::new(OperationType::Write, table_name, primary_key_name, primary_key_value, data)
    }

    pub fn update(
        table_name: impl Into<String>,
        primary_key_name: impl Into<String>,
        primary_key_value: impl Into<Value>,
        data: Record,
    ) -> Self {
        Self::new(OperationType::Update, table_name, primary_key_name, primary_key_value, data)
    }

    /// Read with an empty template returns the whole row
    pub fn read(
        table_name: impl Into<String>,
        primary_key_name: impl Into<String>,
        primary_key_value: impl Into<Value>,
    ) -> Self {
        Self::new(
            OperationType::Read,
            table_name,
            primary_key_name,
            primary_key_value,
            Record::new(),
        )
    }

    /// Read only the fields named in `template`
    pub fn read_fields(
        table_name: impl Into<String>,
        primary_key_name: impl Into<String>,
        primary_key_value: impl Into<Value>,
        template: Record,
    ) -> Self {
        Self::new(OperationType::Read, table_name, primary_key_name, primary_key_value, template)
    }

    /// Canonical store key of the targeted row
    pub fn key(&self) -> String {
        key_string(&self.primary_key_value)
    }

    pub fn is_read(&self) -> bool {
        self.operation_type == OperationType::Read
    }
}

/// One partition-local step of a transaction
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Hop {
    pub transaction_tag: TxTag,
    pub is_last: bool,
    pub operations: Vec<Operation>,
    /// Transactions that must be committed before this hop dispatches
    #[serde(default)]
    pub depends_on: Vec<TxTag>,
    /// Position of this hop inside its transaction, enforced across partitions
    #[serde(default)]
    pub sequence: Option<u32>,
}

impl Hop {
    pub fn new(transaction_tag: impl Into<TxTag>, is_last: bool) -> Self {
        Self {
            transaction_tag: transaction_tag.into(),
            is_last,
            operations: Vec::new(),
            depends_on: Vec::new(),
            sequence: None,
        }
    }

    pub fn with_operation(mut self, operation: Operation) -> Self {
        self.operations.push(operation);
        self
    }

    pub fn with_operations(mut self, operations: impl IntoIterator<Item = Operation>) -> Self {
        self.operations.extend(operations);
        self
    }

    pub fn depends_on<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<TxTag>,
    {
        self.depends_on.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn with_sequence(mut self, sequence: u32) -> Self {
        self.sequence = Some(sequence);
        self
    }

    pub fn tag(&self) -> &str {
        &self.transaction_tag
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Commit,
    Abort,
}

/// Per-operation result reported by the executor
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationOutcome {
    Applied,
    RecordNotFound,
    DuplicateKey,
}

/// Executor answer to one hop
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub status: ResponseStatus,
    /// Filled read templates, in operation order
    pub body: Vec<Record>,
    pub outcomes: Vec<OperationOutcome>,
    pub reason: Option<String>,
}

impl Response {
    pub fn commit(body: Vec<Record>, outcomes: Vec<OperationOutcome>) -> Self {
        Self {
            status: ResponseStatus::Commit,
            body,
            outcomes,
            reason: None,
        }
    }

    pub fn abort(reason: impl Into<String>, outcomes: Vec<OperationOutcome>) -> Self {
        Self {
            status: ResponseStatus::Abort,
            body: Vec::new(),
            outcomes,
            reason: Some(reason.into()),
        }
    }

    pub fn is_commit(&self) -> bool {
        self.status == ResponseStatus::Commit
    }
}

/// A hop travelling to an executor together with its reply slot
#[derive(Debug)]
pub struct Request {
    pub hop: Hop,
    pub reply: oneshot::Sender<Response>,
}

/// Logical lifecycle of a transaction, derived from hop-index and set membership
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionPhase {
    Unstarted,
    InProgress(u32),
    Committed,
    Aborted,
}
