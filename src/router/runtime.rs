//! Router system: wires N coordinators and N executors over shared state

use crate::core::config::RouterConfig;
use crate::core::errors::{Result, RouterError};
use crate::router::channel::channel;
use crate::router::coordinator::{Coordinator, CoordinatorReport, ReadResult};
use crate::router::events::{EventBus, EventSink, LoggingEventSink, RouterEvent};
use crate::router::executor::{Executor, ExecutorStats};
use crate::router::hooks::{AlwaysCommit, HopValidator};
use crate::router::state::{DoneSet, RouterState};
use crate::router::types::{Hop, PartitionId, TransactionPhase, TxTag};
use crate::storage::{memory_factory, RowStore, StoreFactory};
use dashmap::DashSet;
use futures::future::join_all;
use petgraph::algo::{is_cyclic_directed, tarjan_scc};
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info};
use uuid::Uuid;

/// Summary of one `Router::run`
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub run_id: String,
    /// Transactions that entered the Done Set during this run
    pub committed: Vec<TxTag>,
    pub aborted: Vec<TxTag>,
    pub unsatisfiable: Vec<TxTag>,
    pub reads: Vec<ReadResult>,
    pub hops_committed: u64,
    pub executor_stats: Vec<ExecutorStats>,
    pub elapsed: Duration,
    /// Committed hops per second
    pub throughput: f64,
    /// Shutdown stopped the run with hops still queued
    pub interrupted: bool,
}

impl RunReport {
    /// Rows read by one transaction, in commit order
    pub fn reads_for(&self, tag: &str) -> Vec<&ReadResult> {
        self.reads
            .iter()
            .filter(|r| r.transaction_tag == tag)
            .collect()
    }

    fn absorb(&mut self, partition: CoordinatorReport) {
        self.hops_committed += partition.hops_committed;
        self.committed.extend(partition.committed);
        self.aborted.extend(partition.aborted);
        self.unsatisfiable.extend(partition.unsatisfiable);
        self.reads.extend(partition.reads);
        self.interrupted |= partition.interrupted;
    }
}

/// Requests an early stop of the router
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    /// Set the global stop flag. It stays set for the lifetime of the router.
    pub fn shutdown(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_shutdown(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Builder for [`Router`]
pub struct RouterBuilder {
    config: RouterConfig,
    store_factory: StoreFactory,
    validator: Arc<dyn HopValidator>,
    partition_validators: HashMap<PartitionId, Arc<dyn HopValidator>>,
    sinks: Vec<Arc<dyn EventSink>>,
}

impl RouterBuilder {
    pub fn new(config: RouterConfig) -> Self {
        Self {
            config,
            store_factory: memory_factory(),
            validator: Arc::new(AlwaysCommit),
            partition_validators: HashMap::new(),
            sinks: vec![Arc::new(LoggingEventSink)],
        }
    }

    pub fn store_factory(mut self, factory: StoreFactory) -> Self {
        self.store_factory = factory;
        self
    }

    /// Validator used by every executor without a partition override
    pub fn validator(mut self, validator: Arc<dyn HopValidator>) -> Self {
        self.validator = validator;
        self
    }

    pub fn partition_validator(
        mut self,
        partition: PartitionId,
        validator: Arc<dyn HopValidator>,
    ) -> Self {
        self.partition_validators.insert(partition, validator);
        self
    }

    pub fn event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Drop the default logging sink
    pub fn without_logging_sink(mut self) -> Self {
        self.sinks.clear();
        self
    }

    pub fn build(self) -> Result<Router> {
        self.config.validate()?;
        let partitions = self.config.partitions;

        if let Some(&partition) = self
            .partition_validators
            .keys()
            .find(|&&p| p >= partitions)
        {
            return Err(RouterError::InvalidPartition {
                partition,
                partitions,
            });
        }

        let stores = (0..partitions)
            .map(|p| (self.store_factory)(p))
            .collect::<Result<Vec<_>>>()?;
        let validators = (0..partitions)
            .map(|p| {
                self.partition_validators
                    .get(&p)
                    .cloned()
                    .unwrap_or_else(|| self.validator.clone())
            })
            .collect();

        let (shutdown_tx, _) = watch::channel(false);
        info!(partitions, "Router built");

        Ok(Router {
            events: Arc::new(EventBus::new(self.config.event_capacity, self.sinks)),
            state: Arc::new(RouterState::new(partitions)),
            config: Arc::new(self.config),
            stores,
            validators,
            finals: DashSet::new(),
            running: AtomicBool::new(false),
            shutdown: Arc::new(shutdown_tx),
        })
    }
}

/// Partitioned transaction router
pub struct Router {
    config: Arc<RouterConfig>,
    state: Arc<RouterState>,
    stores: Vec<Arc<dyn RowStore>>,
    validators: Vec<Arc<dyn HopValidator>>,
    events: Arc<EventBus>,
    // tags that already have their final hop submitted
    finals: DashSet<TxTag>,
    running: AtomicBool,
    shutdown: Arc<watch::Sender<bool>>,
}

impl Router {
    pub fn builder(config: RouterConfig) -> RouterBuilder {
        RouterBuilder::new(config)
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    pub fn partitions(&self) -> usize {
        self.state.queues.len()
    }

    /// Append a hop to a partition's queue. Only allowed while no run is active.
    pub fn submit(&self, partition: PartitionId, hop: Hop) -> Result<()> {
        if self.running.load(Ordering::SeqCst) {
            return Err(RouterError::AlreadyRunning);
        }
        let queue = self
            .state
            .queues
            .get(partition)
            .ok_or(RouterError::InvalidPartition {
                partition,
                partitions: self.partitions(),
            })?;

        let tag = hop.transaction_tag.as_str();
        if tag.is_empty() {
            return Err(RouterError::invalid_hop(tag, "transaction tag is empty"));
        }
        if hop.depends_on.iter().any(|t| t == tag) {
            return Err(RouterError::invalid_hop(tag, "hop depends on its own transaction"));
        }
        match self.state.phase(tag) {
            TransactionPhase::Committed => {
                return Err(RouterError::invalid_hop(tag, "transaction already committed"))
            }
            TransactionPhase::Aborted => {
                return Err(RouterError::invalid_hop(tag, "transaction already aborted"))
            }
            _ => {}
        }
        if hop.is_last && !self.finals.insert(tag.to_string()) {
            return Err(RouterError::invalid_hop(tag, "transaction already has a final hop"));
        }

        let seq = queue.enqueue(hop);
        debug!(partition, seq, "Hop submitted");
        Ok(())
    }

    /// Submit a batch of hops to one partition, stopping at the first rejection
    pub fn submit_all(&self, partition: PartitionId, hops: impl IntoIterator<Item = Hop>) -> Result<()> {
        for hop in hops {
            self.submit(partition, hop)?;
        }
        Ok(())
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: self.shutdown.clone(),
        }
    }

    pub fn done_set(&self) -> &DoneSet {
        &self.state.done
    }

    pub fn phase(&self, tag: &str) -> TransactionPhase {
        self.state.phase(tag)
    }

    pub fn store(&self, partition: PartitionId) -> Option<Arc<dyn RowStore>> {
        self.stores.get(partition).cloned()
    }

    pub fn queue_len(&self, partition: PartitionId) -> Result<usize> {
        self.state
            .queues
            .get(partition)
            .map(|q| q.len())
            .ok_or(RouterError::InvalidPartition {
                partition,
                partitions: self.partitions(),
            })
    }

    /// Live event stream; only events emitted after subscribing are seen
    pub fn subscribe(&self) -> async_broadcast::Receiver<RouterEvent> {
        self.events.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Drain every queued hop and report what happened.
    ///
    /// Returns once every coordinator has emptied its queue (or shutdown was
    /// requested) and every executor has stopped.
    pub async fn run(&self) -> Result<RunReport> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(RouterError::AlreadyRunning);
        }
        let result = self.run_inner().await;
        self.running.store(false, Ordering::SeqCst);
        result
    }

    async fn run_inner(&self) -> Result<RunReport> {
        self.check_dependency_graph()?;

        let run_id = Uuid::new_v4().to_string();
        let started = Instant::now();
        let partitions = self.partitions();
        info!(
            run_id = %run_id,
            partitions,
            queued = self.state.queues.iter().map(|q| q.len()).sum::<usize>(),
            "Router run started"
        );

        // every coordinator counts as live before any of them can look at the monitor
        for _ in 0..partitions {
            self.state.monitor.register();
        }

        let mut executors = Vec::with_capacity(partitions);
        let mut coordinators = Vec::with_capacity(partitions);
        for partition in 0..partitions {
            let (sender, receiver) = channel(partition, self.config.channel_capacity);
            let executor = Executor::new(
                partition,
                self.stores[partition].clone(),
                self.validators[partition].clone(),
            )
            .with_execution_delay(self.config.execution_delay);
            executors.push(tokio::spawn(executor.run(receiver, self.shutdown.subscribe())));

            let coordinator = Coordinator::new(
                run_id.clone(),
                sender,
                self.state.clone(),
                self.config.clone(),
                self.events.clone(),
                self.shutdown.subscribe(),
            );
            match coordinator {
                Ok(coordinator) => coordinators.push(tokio::spawn(coordinator.run())),
                Err(e) => {
                    self.state.monitor.retire();
                    error!(partition, error = %e, "Failed to start coordinator");
                }
            }
        }

        let mut report = RunReport {
            run_id,
            ..Default::default()
        };
        let mut failure: Option<RouterError> = None;

        for joined in join_all(coordinators).await {
            match joined {
                Ok(Ok(partition)) => report.absorb(partition),
                Ok(Err(e)) => {
                    error!(error = %e, "Coordinator failed");
                    failure.get_or_insert(e);
                }
                Err(e) => {
                    error!(error = %e, "Coordinator task panicked");
                    failure.get_or_insert(RouterError::internal(e.to_string()));
                }
            }
        }

        // coordinators dropped their senders, so every executor sees its channel close
        for joined in join_all(executors).await {
            match joined {
                Ok(Ok(stats)) => report.executor_stats.push(stats),
                Ok(Err(e)) => {
                    error!(error = %e, "Executor failed");
                    failure.get_or_insert(e);
                }
                Err(e) => {
                    error!(error = %e, "Executor task panicked");
                    failure.get_or_insert(RouterError::internal(e.to_string()));
                }
            }
        }

        if let Some(e) = failure {
            return Err(e);
        }

        report.elapsed = started.elapsed();
        let seconds = report.elapsed.as_secs_f64();
        report.throughput = if seconds > 0.0 {
            report.hops_committed as f64 / seconds
        } else {
            0.0
        };
        info!(
            run_id = %report.run_id,
            hops = report.hops_committed,
            committed = report.committed.len(),
            aborted = report.aborted.len(),
            unsatisfiable = report.unsatisfiable.len(),
            elapsed_ms = report.elapsed.as_millis() as u64,
            throughput = report.throughput,
            "Router run finished"
        );
        Ok(report)
    }

    /// Reject prerequisite declarations that wait on each other
    fn check_dependency_graph(&self) -> Result<()> {
        let mut graph = DiGraph::<TxTag, ()>::new();
        let mut nodes: HashMap<TxTag, NodeIndex> = HashMap::new();
        let mut node = |graph: &mut DiGraph<TxTag, ()>, tag: &str| -> NodeIndex {
            *nodes
                .entry(tag.to_string())
                .or_insert_with(|| graph.add_node(tag.to_string()))
        };

        let mut edges: Vec<(TxTag, TxTag)> = Vec::new();
        for queue in &self.state.queues {
            for entry in queue.snapshot() {
                let tag = &entry.hop.transaction_tag;
                for prerequisite in entry
                    .hop
                    .depends_on
                    .iter()
                    .chain(self.config.prerequisites_of(tag))
                {
                    edges.push((prerequisite.clone(), tag.clone()));
                }
            }
        }
        for (tag, prerequisites) in &self.config.dependencies {
            for prerequisite in prerequisites {
                edges.push((prerequisite.clone(), tag.clone()));
            }
        }

        for (from, to) in &edges {
            let a = node(&mut graph, from);
            let b = node(&mut graph, to);
            graph.update_edge(a, b, ());
        }

        if !is_cyclic_directed(&graph) {
            return Ok(());
        }
        let cycle = tarjan_scc(&graph)
            .into_iter()
            .find(|component| component.len() > 1)
            .map(|component| {
                component
                    .iter()
                    .map(|&index| graph[index].as_str())
                    .collect::<Vec<_>>()
                    .join(" -> ")
            })
            .unwrap_or_else(|| "self-dependency".to_string());
        error!(cycle = %cycle, "Dependency cycle detected");
        Err(RouterError::DependencyCycle { cycle })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::types::Operation;
    use crate::storage::Record;

    fn router(partitions: usize) -> Router {
        let config = RouterConfig::builder()
            .partitions(partitions)
            .dependency_timeout(Some(Duration::from_secs(5)))
            .build()
            .unwrap();
        Router::builder(config).build().unwrap()
    }

    #[test]
    fn test_submit_validation() {
        let router = router(2);
        assert!(matches!(
            router.submit(5, Hop::new("T1", true)),
            Err(RouterError::InvalidPartition { partition: 5, partitions: 2 })
        ));
        assert!(matches!(
            router.submit(0, Hop::new("", true)),
            Err(RouterError::InvalidHop { .. })
        ));
        assert!(matches!(
            router.submit(0, Hop::new("T1", true).depends_on(["T1"])),
            Err(RouterError::InvalidHop { .. })
        ));

        router.submit(0, Hop::new("T1", true)).unwrap();
        let second_final = router.submit(1, Hop::new("T1", true));
        assert!(matches!(second_final, Err(RouterError::InvalidHop { .. })));
        assert_eq!(router.queue_len(0).unwrap(), 1);
        assert_eq!(router.queue_len(1).unwrap(), 0);
    }

    #[test]
    fn test_cycle_is_rejected() {
        let router = router(2);
        router.submit(0, Hop::new("A", true).depends_on(["B"])).unwrap();
        router.submit(1, Hop::new("B", true).depends_on(["A"])).unwrap();
        match router.check_dependency_graph() {
            Err(RouterError::DependencyCycle { cycle }) => {
                assert!(cycle.contains('A'));
                assert!(cycle.contains('B'));
            }
            other => panic!("expected cycle, got {:?}", other.err()),
        }
    }

    #[tokio::test]
    async fn test_run_empty_router() {
        let router = router(3);
        let report = router.run().await.unwrap();
        assert_eq!(report.hops_committed, 0);
        assert_eq!(report.executor_stats.len(), 3);
        assert!(!report.interrupted);
        assert!(!router.is_running());
    }

    #[tokio::test]
    async fn test_runs_can_be_repeated() {
        let router = router(1);
        let mut row = Record::new();
        row.insert("n".into(), 1.into());
        router
            .submit(0, Hop::new("T1", true).with_operation(Operation::write("t", "id", 1, row)))
            .unwrap();
        let first = router.run().await.unwrap();
        assert_eq!(first.committed, vec!["T1".to_string()]);

        router
            .submit(0, Hop::new("T2", true).with_operation(Operation::read("t", "id", 1)))
            .unwrap();
        let second = router.run().await.unwrap();
        assert_ne!(first.run_id, second.run_id);
        assert_eq!(second.reads_for("T2")[0].rows[0]["n"], 1);
        assert_eq!(router.done_set().tags(), vec!["T1", "T2"]);
    }
}
