//! Cross-partition transaction state
//!
//! These are the only structures mutated by more than one unit. Every
//! mutation takes one short critical section and never spans an await.

use crate::router::queue::HopQueue;
use crate::router::types::{PartitionId, TransactionPhase, TxTag};
use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;

/// Hop-progress index per in-flight transaction
#[derive(Debug, Default)]
pub struct TransactionStates {
    index: DashMap<TxTag, u32>,
}

impl TransactionStates {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one more committed hop for `tag`, creating the entry if needed.
    /// Returns the new index.
    pub fn advance(&self, tag: &str) -> u32 {
        let mut entry = self.index.entry(tag.to_string()).or_insert(0);
        *entry += 1;
        *entry
    }

    /// Committed hop count; 0 for unknown tags
    pub fn get(&self, tag: &str) -> u32 {
        self.index.get(tag).map(|e| *e.value()).unwrap_or(0)
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.index.contains_key(tag)
    }

    pub fn remove(&self, tag: &str) -> Option<u32> {
        self.index.remove(tag).map(|(_, index)| index)
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}

/// One Done Set member and when it got there
#[derive(Clone, Debug, PartialEq)]
pub struct DoneEntry {
    pub tag: TxTag,
    pub committed_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct DoneInner {
    order: Vec<DoneEntry>,
    members: HashSet<TxTag>,
}

/// Append-only set of fully committed transactions, in commit order
#[derive(Debug, Default)]
pub struct DoneSet {
    inner: Mutex<DoneInner>,
}

impl DoneSet {
    pub fn new() -> Self {
        Self::default()
    }

    fn inner(&self) -> MutexGuard<'_, DoneInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Adds `tag`; returns false if it was already present
    pub fn insert(&self, tag: &str) -> bool {
        let mut inner = self.inner();
        if !inner.members.insert(tag.to_string()) {
            return false;
        }
        inner.order.push(DoneEntry {
            tag: tag.to_string(),
            committed_at: Utc::now(),
        });
        true
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.inner().members.contains(tag)
    }

    pub fn contains_all<'a>(&self, tags: impl IntoIterator<Item = &'a String>) -> bool {
        let inner = self.inner();
        tags.into_iter().all(|t| inner.members.contains(t))
    }

    pub fn committed_at(&self, tag: &str) -> Option<DateTime<Utc>> {
        self.inner()
            .order
            .iter()
            .find(|e| e.tag == tag)
            .map(|e| e.committed_at)
    }

    /// Members in commit order
    pub fn tags(&self) -> Vec<TxTag> {
        self.inner().order.iter().map(|e| e.tag.clone()).collect()
    }

    pub fn entries(&self) -> Vec<DoneEntry> {
        self.inner().order.clone()
    }

    pub fn len(&self) -> usize {
        self.inner().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Per-tag wake channels.
///
/// Whoever commits, aborts or advances a tag notifies exactly the coordinators
/// waiting on that tag. Waiters must create their `Notified` future before
/// evaluating their gate so a concurrent notification is not lost.
#[derive(Debug, Default)]
pub struct TagSignals {
    signals: DashMap<TxTag, Arc<Notify>>,
}

impl TagSignals {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to changes of `tag`
    pub fn handle(&self, tag: &str) -> Arc<Notify> {
        self.signals
            .entry(tag.to_string())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    pub fn notify(&self, tag: &str) {
        if let Some(signal) = self.signals.get(tag) {
            signal.notify_waiters();
        }
    }
}

/// Tracks how many coordinators are alive and how many are parked on a gate.
///
/// When every live coordinator is parked nobody can insert into the Done Set
/// or advance a transaction, so no gate can open any more. Every transition
/// bumps an epoch so a waiter can tell a lasting stall from a passing one.
/// Each parked coordinator records the partitions holding what it waits on;
/// a lasting stall is broken by electing one victim from that waits-for graph.
#[derive(Debug, Default)]
pub struct GateMonitor {
    live: AtomicUsize,
    blocked: AtomicUsize,
    epoch: AtomicU64,
    changed: Notify,
    waits: Mutex<BTreeMap<PartitionId, Vec<PartitionId>>>,
    // (stall epoch, elected partition)
    election: Mutex<Option<(u64, PartitionId)>>,
}

impl GateMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    fn waits(&self) -> MutexGuard<'_, BTreeMap<PartitionId, Vec<PartitionId>>> {
        self.waits.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn register(&self) {
        self.live.fetch_add(1, Ordering::SeqCst);
    }

    pub fn retire(&self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.changed.notify_waiters();
    }

    /// Park `partition` on a gate waiting for hops queued on `waiting_on`
    pub fn block(&self, partition: PartitionId, waiting_on: Vec<PartitionId>) {
        self.waits().insert(partition, waiting_on);
        self.blocked.fetch_add(1, Ordering::SeqCst);
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.changed.notify_waiters();
    }

    /// Refresh what a parked partition waits on; not a transition
    pub fn set_waits(&self, partition: PartitionId, waiting_on: Vec<PartitionId>) {
        if let Some(entry) = self.waits().get_mut(&partition) {
            *entry = waiting_on;
        }
    }

    pub fn unblock(&self, partition: PartitionId) {
        self.waits().remove(&partition);
        self.blocked.fetch_sub(1, Ordering::SeqCst);
        self.epoch.fetch_add(1, Ordering::SeqCst);
    }

    pub fn is_stalled(&self) -> bool {
        let live = self.live.load(Ordering::SeqCst);
        live > 0 && self.blocked.load(Ordering::SeqCst) >= live
    }

    /// Epoch of the current stall, `None` while some coordinator can progress
    pub fn stall_epoch(&self) -> Option<u64> {
        let before = self.epoch.load(Ordering::SeqCst);
        let stalled = self.is_stalled();
        let after = self.epoch.load(Ordering::SeqCst);
        (stalled && before == after).then_some(after)
    }

    /// The single partition that must give up its gate to end the stall of `epoch`.
    ///
    /// The first caller for an epoch picks the victim; later callers get the
    /// same answer. A partition waiting on its own queue is preferred, then the
    /// lowest partition of a waits-for cycle.
    pub fn elect(&self, epoch: u64) -> Option<PartitionId> {
        let mut election = self
            .election
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some((elected_epoch, victim)) = *election {
            if elected_epoch == epoch {
                return Some(victim);
            }
        }
        let victim = pick_victim(&self.waits())?;
        *election = Some((epoch, victim));
        drop(election);
        self.changed.notify_waiters();
        Some(victim)
    }

    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn changed(&self) -> &Notify {
        &self.changed
    }
}

fn pick_victim(waits: &BTreeMap<PartitionId, Vec<PartitionId>>) -> Option<PartitionId> {
    if let Some((&partition, _)) = waits.iter().find(|(p, on)| on.contains(p)) {
        return Some(partition);
    }

    let mut graph = DiGraph::<PartitionId, ()>::new();
    let nodes: HashMap<PartitionId, NodeIndex> = waits
        .keys()
        .map(|&partition| (partition, graph.add_node(partition)))
        .collect();
    for (partition, waiting_on) in waits {
        for target in waiting_on {
            if let (Some(&from), Some(&to)) = (nodes.get(partition), nodes.get(target)) {
                graph.update_edge(from, to, ());
            }
        }
    }

    tarjan_scc(&graph)
        .into_iter()
        .filter(|component| component.len() > 1)
        .filter_map(|component| component.iter().map(|&index| graph[index]).min())
        .min()
        .or_else(|| waits.keys().next().copied())
}

/// Everything coordinators share across partitions
#[derive(Debug)]
pub struct RouterState {
    pub queues: Vec<Arc<HopQueue>>,
    pub done: DoneSet,
    pub states: TransactionStates,
    pub aborted: DashSet<TxTag>,
    pub signals: TagSignals,
    pub monitor: GateMonitor,
}

impl RouterState {
    pub fn new(partitions: usize) -> Self {
        Self {
            queues: (0..partitions).map(|p| Arc::new(HopQueue::new(p))).collect(),
            done: DoneSet::new(),
            states: TransactionStates::new(),
            aborted: DashSet::new(),
            signals: TagSignals::new(),
            monitor: GateMonitor::new(),
        }
    }

    /// Whether any partition still holds a hop of `tag`
    pub fn is_queued(&self, tag: &str) -> bool {
        self.queues.iter().any(|q| q.contains_tag(tag))
    }

    pub fn phase(&self, tag: &str) -> TransactionPhase {
        if self.done.contains(tag) {
            TransactionPhase::Committed
        } else if self.aborted.contains(tag) {
            TransactionPhase::Aborted
        } else if self.states.contains(tag) {
            TransactionPhase::InProgress(self.states.get(tag))
        } else {
            TransactionPhase::Unstarted
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_transaction_states() {
        let states = TransactionStates::new();
        assert_eq!(states.get("T1"), 0);
        assert_eq!(states.advance("T1"), 1);
        assert_eq!(states.advance("T1"), 2);
        assert_eq!(states.get("T1"), 2);
        assert_eq!(states.remove("T1"), Some(2));
        assert!(states.is_empty());
    }

    #[test]
    fn test_done_set_is_idempotent_and_ordered() {
        let done = DoneSet::new();
        assert!(done.insert("T2"));
        assert!(done.insert("T1"));
        assert!(!done.insert("T2"));
        assert_eq!(done.tags(), vec!["T2", "T1"]);
        assert_eq!(done.len(), 2);
        assert!(done.contains_all(&["T1".to_string(), "T2".to_string()]));
        assert!(!done.contains_all(&["T1".to_string(), "T3".to_string()]));
        assert!(done.committed_at("T1").unwrap() >= done.committed_at("T2").unwrap());
    }

    #[test]
    fn test_phase_derivation() {
        let state = RouterState::new(2);
        assert_eq!(state.phase("T1"), TransactionPhase::Unstarted);
        state.states.advance("T1");
        assert_eq!(state.phase("T1"), TransactionPhase::InProgress(1));
        state.states.remove("T1");
        state.done.insert("T1");
        assert_eq!(state.phase("T1"), TransactionPhase::Committed);
        state.aborted.insert("T9".to_string());
        assert_eq!(state.phase("T9"), TransactionPhase::Aborted);
    }

    #[test]
    fn test_gate_monitor_stall() {
        let monitor = GateMonitor::new();
        assert!(!monitor.is_stalled());
        monitor.register();
        monitor.register();
        monitor.block(0, vec![1]);
        assert!(!monitor.is_stalled());
        monitor.block(1, vec![0]);
        assert!(monitor.is_stalled());
        let epoch = monitor.stall_epoch();
        assert!(epoch.is_some());
        assert_eq!(monitor.stall_epoch(), epoch);
        monitor.unblock(1);
        assert_eq!(monitor.stall_epoch(), None);
        monitor.retire();
        assert!(monitor.is_stalled());
        assert_ne!(monitor.stall_epoch(), epoch);
    }

    #[test]
    fn test_election_prefers_partition_waiting_on_itself() {
        let monitor = GateMonitor::new();
        monitor.register();
        monitor.register();
        // partition 1 waits on partition 0, which waits on a hop behind its own head
        monitor.block(1, vec![0]);
        monitor.block(0, vec![0]);
        let epoch = monitor.stall_epoch().unwrap();
        assert_eq!(monitor.elect(epoch), Some(0));
        // the answer is fixed for the epoch even if the graph is refreshed
        monitor.set_waits(0, vec![1]);
        assert_eq!(monitor.elect(epoch), Some(0));
    }

    #[test]
    fn test_election_picks_one_member_of_a_cycle() {
        let monitor = GateMonitor::new();
        for _ in 0..3 {
            monitor.register();
        }
        monitor.block(0, vec![2]);
        monitor.block(2, vec![1]);
        monitor.block(1, vec![2]);
        let epoch = monitor.stall_epoch().unwrap();
        assert_eq!(monitor.elect(epoch), Some(1));

        monitor.unblock(1);
        monitor.block(1, vec![2]);
        let next = monitor.stall_epoch().unwrap();
        assert_ne!(next, epoch);
        assert_eq!(monitor.elect(next), Some(1));
    }

    #[tokio::test]
    async fn test_tag_signal_wakes_subscriber() {
        let signals = Arc::new(TagSignals::new());
        let handle = signals.handle("T2");
        let notified = handle.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        let notifier = signals.clone();
        tokio::spawn(async move {
            notifier.notify("T3");
            notifier.notify("T2");
        });

        tokio::time::timeout(Duration::from_secs(1), notified)
            .await
            .expect("subscriber of T2 should be woken");
    }
}
