//! Coordinator - drives one partition's hop queue
//!
//! The coordinator peeks the head hop, holds it behind the dependency and
//! ordering gates, dispatches it to its executor and reconciles the shared
//! transaction state with the answer. At most one hop per partition is in
//! flight at any time.

use crate::core::config::{AbortScope, RouterConfig};
use crate::core::errors::{Result, RouterError};
use crate::router::channel::HopSender;
use crate::router::events::{EventBus, EventKind};
use crate::router::queue::{HopQueue, QueuedHop};
use crate::router::state::RouterState;
use crate::router::types::{Hop, PartitionId, Response, TxTag};
use crate::storage::Record;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::futures::Notified;
use tokio::sync::{watch, Notify};
use tracing::{debug, info, warn};

/// Rows returned by the read operations of one committed hop
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReadResult {
    pub transaction_tag: TxTag,
    pub partition: PartitionId,
    pub rows: Vec<Record>,
}

/// What one coordinator did during a run
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CoordinatorReport {
    pub partition: PartitionId,
    pub hops_committed: u64,
    /// Transactions whose final hop committed here
    pub committed: Vec<TxTag>,
    pub aborted: Vec<TxTag>,
    /// Transactions rejected because a gate could never open
    pub unsatisfiable: Vec<TxTag>,
    pub reads: Vec<ReadResult>,
    /// Stopped by shutdown with hops still queued
    pub interrupted: bool,
}

/// Precondition guarding the head hop
enum Gate {
    /// Every listed transaction must be in the Done Set
    Dependency(Vec<TxTag>),
    /// The transaction's hop-index must equal this sequence number
    Ordering(u32),
}

enum GateCheck {
    Open,
    Pending(Vec<TxTag>),
    Closed { reason: String, missing: Vec<TxTag> },
    /// The head hop was removed while waiting
    Stale,
}

enum GateOutcome {
    Ready,
    Unsatisfiable { reason: String, missing: Vec<TxTag> },
    Stale,
    Shutdown,
}

pub struct Coordinator {
    partition: PartitionId,
    run_id: String,
    queue: Arc<HopQueue>,
    sender: HopSender,
    state: Arc<RouterState>,
    config: Arc<RouterConfig>,
    events: Arc<EventBus>,
    shutdown: watch::Receiver<bool>,
}

impl Coordinator {
    /// The caller must have registered this coordinator with the gate monitor
    pub fn new(
        run_id: impl Into<String>,
        sender: HopSender,
        state: Arc<RouterState>,
        config: Arc<RouterConfig>,
        events: Arc<EventBus>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self> {
        let partition = sender.partition();
        let queue = state
            .queues
            .get(partition)
            .cloned()
            .ok_or(RouterError::InvalidPartition {
                partition,
                partitions: state.queues.len(),
            })?;
        Ok(Self {
            partition,
            run_id: run_id.into(),
            queue,
            sender,
            state,
            config,
            events,
            shutdown,
        })
    }

    /// Drain the queue, then retire from the gate monitor
    pub async fn run(mut self) -> Result<CoordinatorReport> {
        info!(partition = self.partition, queued = self.queue.len(), "Coordinator started");
        let mut report = CoordinatorReport {
            partition: self.partition,
            ..Default::default()
        };
        let result = self.drive(&mut report).await;
        self.state.monitor.retire();
        info!(
            partition = self.partition,
            hops = report.hops_committed,
            aborted = report.aborted.len(),
            "Coordinator done"
        );
        result.map(|_| report)
    }

    async fn drive(&mut self, report: &mut CoordinatorReport) -> Result<()> {
        loop {
            if *self.shutdown.borrow() {
                report.interrupted = !self.queue.is_empty();
                return Ok(());
            }

            let head = match self.queue.peek() {
                Ok(head) => head,
                Err(RouterError::EmptyQueue { .. }) => return Ok(()),
                Err(e) => return Err(e),
            };
            let tag = head.hop.transaction_tag.clone();

            if self.config.abort_scope == AbortScope::Global && self.state.aborted.contains(&tag) {
                // purged elsewhere while this queue was being reshaped
                self.queue.remove_all(&tag);
                continue;
            }

            let prerequisites = self.prerequisites(&head.hop);
            if !prerequisites.is_empty() {
                let gate = Gate::Dependency(prerequisites);
                match self.wait_gate(&head, &gate).await {
                    GateOutcome::Ready => {}
                    GateOutcome::Stale => continue,
                    GateOutcome::Shutdown => {
                        report.interrupted = true;
                        return Ok(());
                    }
                    GateOutcome::Unsatisfiable { reason, missing } => {
                        self.reject(&tag, reason, missing, report);
                        continue;
                    }
                }
            }

            if let Some(sequence) = head.hop.sequence {
                match self.wait_gate(&head, &Gate::Ordering(sequence)).await {
                    GateOutcome::Ready => {}
                    GateOutcome::Stale => continue,
                    GateOutcome::Shutdown => {
                        report.interrupted = true;
                        return Ok(());
                    }
                    GateOutcome::Unsatisfiable { reason, missing } => {
                        self.reject(&tag, reason, missing, report);
                        continue;
                    }
                }
            }

            self.events
                .emit(&self.run_id, &tag, self.partition, EventKind::Dispatched);
            let response = match self.sender.dispatch(head.hop.clone()).await {
                Ok(response) => response,
                // the executor may already have honoured the stop flag
                Err(_) if *self.shutdown.borrow() => {
                    report.interrupted = true;
                    return Ok(());
                }
                Err(e) => return Err(e),
            };

            if response.is_commit() {
                self.on_commit(head, response, report);
            } else {
                let reason = response
                    .reason
                    .clone()
                    .unwrap_or_else(|| "executor answered abort".to_string());
                self.on_abort(&tag, reason, report);
            }
        }
    }

    /// Declared prerequisites of a hop plus the configured ones for its tag
    fn prerequisites(&self, hop: &Hop) -> Vec<TxTag> {
        let mut tags: Vec<TxTag> = Vec::new();
        for tag in hop
            .depends_on
            .iter()
            .chain(self.config.prerequisites_of(&hop.transaction_tag))
        {
            if !tags.contains(tag) {
                tags.push(tag.clone());
            }
        }
        tags
    }

    fn on_commit(&self, head: QueuedHop, response: Response, report: &mut CoordinatorReport) {
        let tag = head.hop.transaction_tag.as_str();
        report.hops_committed += 1;

        if !response.body.is_empty() {
            self.events.emit(
                &self.run_id,
                tag,
                self.partition,
                EventKind::ReadResult {
                    rows: response.body.clone(),
                },
            );
            report.reads.push(ReadResult {
                transaction_tag: tag.to_string(),
                partition: self.partition,
                rows: response.body,
            });
        }

        if self.state.aborted.contains(tag) {
            warn!(
                partition = self.partition,
                tag = %tag,
                "Hop committed after its transaction was aborted elsewhere"
            );
        } else if head.hop.is_last {
            // Done Set first: scanners must never see the hop gone and the tag not done
            let hop_index = self.state.states.get(tag) + 1;
            self.state.done.insert(tag);
            self.state.states.remove(tag);
            self.events
                .emit(&self.run_id, tag, self.partition, EventKind::Committed { hop_index });
            self.events
                .emit(&self.run_id, tag, self.partition, EventKind::TransactionCommitted);
            info!(partition = self.partition, tag = %tag, "Transaction completed and added to done set");
            report.committed.push(tag.to_string());
        } else {
            let hop_index = self.state.states.advance(tag);
            self.events
                .emit(&self.run_id, tag, self.partition, EventKind::Committed { hop_index });
            debug!(partition = self.partition, tag = %tag, hop_index, "Hop committed");
        }

        self.queue.complete(head.seq);
        self.state.signals.notify(tag);
    }

    fn on_abort(&self, tag: &str, reason: String, report: &mut CoordinatorReport) {
        let removed = self.abort_transaction(tag);
        warn!(
            partition = self.partition,
            removed,
            "{}",
            RouterError::aborted(tag, reason.as_str())
        );
        self.events.emit(
            &self.run_id,
            tag,
            self.partition,
            EventKind::Aborted { reason, removed },
        );
        report.aborted.push(tag.to_string());
    }

    /// Abort a transaction whose gate can never open
    fn reject(&self, tag: &str, reason: String, missing: Vec<TxTag>, report: &mut CoordinatorReport) {
        let removed = self.abort_transaction(tag);
        let err = RouterError::unsatisfiable(tag, missing.clone(), reason.as_str());
        warn!(partition = self.partition, removed, error = %err, "Gate rejected transaction");
        self.events.emit(
            &self.run_id,
            tag,
            self.partition,
            EventKind::DependencyUnsatisfiable { reason, missing },
        );
        report.unsatisfiable.push(tag.to_string());
    }

    /// Mark `tag` aborted, drop its progress and purge its queued hops
    fn abort_transaction(&self, tag: &str) -> usize {
        self.state.aborted.insert(tag.to_string());
        self.state.states.remove(tag);
        let removed = match self.config.abort_scope {
            AbortScope::Partition => self.queue.remove_all(tag),
            AbortScope::Global => self.state.queues.iter().map(|q| q.remove_all(tag)).sum(),
        };
        self.state.signals.notify(tag);
        removed
    }

    fn check(&self, head: &QueuedHop, gate: &Gate) -> GateCheck {
        if self.queue.peek().map(|h| h.seq).ok() != Some(head.seq) {
            return GateCheck::Stale;
        }
        let tag = head.hop.transaction_tag.as_str();
        match gate {
            Gate::Dependency(prerequisites) => {
                let mut missing = Vec::new();
                for prerequisite in prerequisites {
                    // queue scan first: a final hop leaves its queue only after the Done Set insert
                    let queued = self.state.is_queued(prerequisite);
                    if self.state.done.contains(prerequisite) {
                        continue;
                    }
                    if self.state.aborted.contains(prerequisite) {
                        return GateCheck::Closed {
                            reason: format!("prerequisite {} aborted", prerequisite),
                            missing: vec![prerequisite.clone()],
                        };
                    }
                    if !queued {
                        return GateCheck::Closed {
                            reason: format!("prerequisite {} is not queued on any partition", prerequisite),
                            missing: vec![prerequisite.clone()],
                        };
                    }
                    missing.push(prerequisite.clone());
                }
                if missing.is_empty() {
                    GateCheck::Open
                } else {
                    GateCheck::Pending(missing)
                }
            }
            Gate::Ordering(sequence) => {
                if self.state.aborted.contains(tag) {
                    return GateCheck::Closed {
                        reason: "transaction aborted on another partition".to_string(),
                        missing: Vec::new(),
                    };
                }
                if self.state.done.contains(tag) {
                    return GateCheck::Closed {
                        reason: "transaction already committed".to_string(),
                        missing: Vec::new(),
                    };
                }
                let index = self.state.states.get(tag);
                if index == *sequence {
                    GateCheck::Open
                } else if index > *sequence {
                    GateCheck::Closed {
                        reason: format!("hop {} already passed (transaction at hop {})", sequence, index),
                        missing: Vec::new(),
                    }
                } else {
                    GateCheck::Pending(vec![tag.to_string()])
                }
            }
        }
    }

    /// Partitions whose queues hold the hops a pending gate waits for.
    /// In this partition only hops behind the head count.
    fn waiting_on(&self, head: &QueuedHop, missing: &[TxTag]) -> Vec<PartitionId> {
        self.state
            .queues
            .iter()
            .filter(|queue| {
                missing.iter().any(|tag| {
                    if queue.partition() == self.partition {
                        queue.holds_behind(tag, head.seq)
                    } else {
                        queue.contains_tag(tag)
                    }
                })
            })
            .map(|queue| queue.partition())
            .collect()
    }

    /// Tags whose changes can open (or close) the gate
    fn watched(head: &QueuedHop, gate: &Gate) -> Vec<TxTag> {
        let mut tags = vec![head.hop.transaction_tag.clone()];
        if let Gate::Dependency(prerequisites) = gate {
            tags.extend(prerequisites.iter().cloned());
        }
        tags
    }

    /// Hold the head hop until the gate opens, closes for good, or shutdown.
    ///
    /// Wake-ups come from the watched tags' signals, from the gate monitor and
    /// from the bounded re-check interval. A pending gate is declared
    /// unsatisfiable on timeout, or when the whole router stays stalled and
    /// this partition is the one elected to break the stall.
    async fn wait_gate(&mut self, head: &QueuedHop, gate: &Gate) -> GateOutcome {
        let tag = head.hop.transaction_tag.as_str();
        match self.check(head, gate) {
            GateCheck::Open => return GateOutcome::Ready,
            GateCheck::Stale => return GateOutcome::Stale,
            GateCheck::Closed { reason, missing } => {
                return GateOutcome::Unsatisfiable { reason, missing }
            }
            GateCheck::Pending(missing) => {
                debug!(partition = self.partition, tag = %tag, missing = ?missing, "Waiting for gate");
                self.state
                    .monitor
                    .block(self.partition, self.waiting_on(head, &missing));
                self.events.emit(
                    &self.run_id,
                    tag,
                    self.partition,
                    EventKind::DependencyWait { missing },
                );
            }
        }

        let started = Instant::now();
        let watched = Self::watched(head, gate);
        let mut last_stall: Option<u64> = None;

        let outcome = loop {
            let handles: Vec<Arc<Notify>> =
                watched.iter().map(|t| self.state.signals.handle(t)).collect();
            let mut waits: Vec<Pin<Box<Notified<'_>>>> =
                handles.iter().map(|h| Box::pin(h.notified())).collect();
            for wait in waits.iter_mut() {
                wait.as_mut().enable();
            }
            let mut stall = Box::pin(self.state.monitor.changed().notified());
            stall.as_mut().enable();

            // sample the monitor before the gate so progress made in between is not missed
            let stall_epoch = self.state.monitor.stall_epoch();
            match self.check(head, gate) {
                GateCheck::Open => break GateOutcome::Ready,
                GateCheck::Stale => break GateOutcome::Stale,
                GateCheck::Closed { reason, missing } => {
                    break GateOutcome::Unsatisfiable { reason, missing }
                }
                GateCheck::Pending(missing) => {
                    self.state
                        .monitor
                        .set_waits(self.partition, self.waiting_on(head, &missing));
                    // the same stall seen on two consecutive wake-ups is a deadlock;
                    // only the elected partition gives up, the rest re-check after it moves
                    if let Some(epoch) = stall_epoch.filter(|_| stall_epoch == last_stall) {
                        if self.state.monitor.elect(epoch) == Some(self.partition) {
                            break GateOutcome::Unsatisfiable {
                                reason: "deadlock: gate waits on hops no coordinator can reach"
                                    .to_string(),
                                missing,
                            };
                        }
                    }
                    if let Some(limit) = self.config.dependency_timeout {
                        if started.elapsed() >= limit {
                            break GateOutcome::Unsatisfiable {
                                reason: format!("gate wait exceeded {:?}", limit),
                                missing,
                            };
                        }
                    }
                }
            }
            last_stall = stall_epoch;

            tokio::select! {
                _ = futures::future::select_all(waits) => {}
                _ = &mut stall => {}
                _ = tokio::time::sleep(self.config.gate_recheck_interval) => {}
                // only `true` is ever sent, a closed sender means the router is gone
                _ = self.shutdown.changed() => break GateOutcome::Shutdown,
            }
        };

        self.state.monitor.unblock(self.partition);
        outcome
    }
}
