use crate::core::errors::{Result, RouterError};
use crate::router::channel::HopReceiver;
use crate::router::hooks::{HopValidator, Verdict};
use crate::router::types::{
    Hop, Operation, OperationOutcome, OperationType, PartitionId, Response,
};
use crate::storage::{PutOutcome, Record, RowStore, UpdateOutcome};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Counters reported by an executor when it stops
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecutorStats {
    pub hops: u64,
    pub commits: u64,
    pub aborts: u64,
}

/// Applies hops to one partition's row store
pub struct Executor {
    partition: PartitionId,
    store: Arc<dyn RowStore>,
    validator: Arc<dyn HopValidator>,
    execution_delay: Option<Duration>,
}

impl Executor {
    pub fn new(
        partition: PartitionId,
        store: Arc<dyn RowStore>,
        validator: Arc<dyn HopValidator>,
    ) -> Self {
        Self {
            partition,
            store,
            validator,
            execution_delay: None,
        }
    }

    /// Sleep a random fraction of `delay` before each hop
    pub fn with_execution_delay(mut self, delay: Option<Duration>) -> Self {
        self.execution_delay = delay;
        self
    }

    /// Serve requests until the channel closes or shutdown is signalled.
    ///
    /// Pending requests are always answered before a shutdown is honoured.
    pub async fn run(
        self,
        mut requests: HopReceiver,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<ExecutorStats> {
        info!(partition = self.partition, "Executor started");
        let mut stats = ExecutorStats::default();

        loop {
            tokio::select! {
                biased;
                request = requests.recv() => {
                    let Some(request) = request else {
                        debug!(partition = self.partition, "Request channel closed");
                        break;
                    };
                    let response = self.handle(&request.hop).await;
                    stats.hops += 1;
                    if response.is_commit() {
                        stats.commits += 1;
                    } else {
                        stats.aborts += 1;
                    }
                    if request.reply.send(response).is_err() {
                        warn!(
                            partition = self.partition,
                            tag = %request.hop.transaction_tag,
                            "Coordinator dropped the reply channel"
                        );
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!(partition = self.partition, "Executor shutting down");
                        break;
                    }
                }
            }
        }

        self.store.flush()?;
        Ok(stats)
    }

    /// Execute one hop and turn any failure into an abort response
    pub async fn handle(&self, hop: &Hop) -> Response {
        if let Some(delay) = self.execution_delay {
            tokio::time::sleep(delay.mul_f64(fastrand::f64())).await;
        }
        match self.execute(hop).await {
            Ok(response) => response,
            Err(e) => {
                error!(
                    partition = self.partition,
                    tag = %hop.transaction_tag,
                    error = %e,
                    "Hop execution failed"
                );
                Response::abort(e.to_string(), Vec::new())
            }
        }
    }

    /// Stage every operation, ask the validator, and flush only on commit
    pub async fn execute(&self, hop: &Hop) -> Result<Response> {
        let mut staged = StagedRows::new(self.store.as_ref());
        let mut body = Vec::new();
        let mut outcomes = Vec::with_capacity(hop.operations.len());

        for op in &hop.operations {
            let outcome = match op.operation_type {
                OperationType::Write => staged.write(op)?,
                OperationType::Update => staged.update(op)?,
                OperationType::Read => match staged.lookup(&op.table_name, &op.key())? {
                    Some(row) => {
                        body.push(fill_template(&op.data, &row));
                        OperationOutcome::Applied
                    }
                    None => OperationOutcome::RecordNotFound,
                },
            };
            match outcome {
                OperationOutcome::RecordNotFound => warn!(
                    partition = self.partition,
                    tag = %hop.transaction_tag,
                    "{}",
                    RouterError::record_not_found(&op.table_name, op.key())
                ),
                OperationOutcome::DuplicateKey => warn!(
                    partition = self.partition,
                    tag = %hop.transaction_tag,
                    "{}",
                    RouterError::duplicate_key(&op.table_name, op.key())
                ),
                OperationOutcome::Applied => {}
            }
            outcomes.push(outcome);
        }

        let verdict = match self.validator.validate(hop, &outcomes).await {
            Ok(verdict) => verdict,
            Err(e) => Verdict::abort(e.to_string()),
        };

        match verdict {
            Verdict::Commit => {
                staged.flush()?;
                Ok(Response::commit(body, outcomes))
            }
            Verdict::Abort { reason } => {
                debug!(
                    partition = self.partition,
                    tag = %hop.transaction_tag,
                    reason = %reason,
                    "Validator rejected hop"
                );
                Ok(Response::abort(reason, outcomes))
            }
        }
    }
}

/// Copy matching fields of `row` into `template`; an empty template takes the whole row
fn fill_template(template: &Record, row: &Record) -> Record {
    if template.is_empty() {
        return row.clone();
    }
    template
        .iter()
        .map(|(field, default)| {
            let value = row.get(field).cloned().unwrap_or_else(|| default.clone());
            (field.clone(), value)
        })
        .collect()
}

struct StagedRow {
    record: Record,
    created: bool,
}

/// Writes of one hop, held back until the validator accepts the hop
struct StagedRows<'a> {
    store: &'a dyn RowStore,
    rows: HashMap<(String, String), StagedRow>,
    order: Vec<(String, String)>,
}

impl<'a> StagedRows<'a> {
    fn new(store: &'a dyn RowStore) -> Self {
        Self {
            store,
            rows: HashMap::new(),
            order: Vec::new(),
        }
    }

    fn lookup(&self, table: &str, key: &str) -> Result<Option<Record>> {
        match self.rows.get(&(table.to_string(), key.to_string())) {
            Some(staged) => Ok(Some(staged.record.clone())),
            None => self.store.get(table, key),
        }
    }

    fn stage(&mut self, id: (String, String), record: Record, created: bool) {
        match self.rows.get_mut(&id) {
            Some(existing) => existing.record = record,
            None => {
                self.order.push(id.clone());
                self.rows.insert(id, StagedRow { record, created });
            }
        }
    }

    fn write(&mut self, op: &Operation) -> Result<OperationOutcome> {
        let key = op.key();
        if self.lookup(&op.table_name, &key)?.is_some() {
            return Ok(OperationOutcome::DuplicateKey);
        }
        let mut record = op.data.clone();
        record
            .entry(op.primary_key_name.clone())
            .or_insert_with(|| op.primary_key_value.clone());
        self.stage((op.table_name.clone(), key), record, true);
        Ok(OperationOutcome::Applied)
    }

    fn update(&mut self, op: &Operation) -> Result<OperationOutcome> {
        let key = op.key();
        let Some(mut record) = self.lookup(&op.table_name, &key)? else {
            return Ok(OperationOutcome::RecordNotFound);
        };
        record.extend(op.data.iter().map(|(k, v)| (k.clone(), v.clone())));
        self.stage((op.table_name.clone(), key), record, false);
        Ok(OperationOutcome::Applied)
    }

    /// Apply the staged rows in order. If one of them fails, the rows
    /// already applied are reverted before the error is returned.
    fn flush(self) -> Result<()> {
        let StagedRows {
            store,
            mut rows,
            order,
        } = self;
        let mut applied: Vec<(String, String, Option<Record>)> = Vec::new();
        for (table, key) in order {
            let Some(staged) = rows.remove(&(table.clone(), key.clone())) else {
                continue;
            };
            let result = Self::apply(store, &table, &key, staged);
            match result {
                Ok(before) => applied.push((table, key, before)),
                Err(e) => {
                    Self::revert(store, applied);
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Returns the row as it was before, `None` for a fresh insert
    fn apply(
        store: &dyn RowStore,
        table: &str,
        key: &str,
        staged: StagedRow,
    ) -> Result<Option<Record>> {
        if staged.created {
            if store.put(table, key, staged.record)? == PutOutcome::AlreadyExists {
                return Err(RouterError::duplicate_key(table, key));
            }
            return Ok(None);
        }
        let before = store.get(table, key)?;
        if before.is_none()
            || store.update(table, key, staged.record)? == UpdateOutcome::NotFound
        {
            return Err(RouterError::record_not_found(table, key));
        }
        Ok(before)
    }

    fn revert(store: &dyn RowStore, applied: Vec<(String, String, Option<Record>)>) {
        for (table, key, before) in applied.into_iter().rev() {
            let restored = store.delete(&table, &key).and_then(|_| match before {
                Some(row) => store.put(&table, &key, row).map(|_| ()),
                None => Ok(()),
            });
            if let Err(e) = restored {
                error!(table = %table, key = %key, error = %e, "Failed to revert staged row");
            }
        }
    }
}
