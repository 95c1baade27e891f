//! Graph executor: lifecycle, delivery entry points and barriers.
//!
//! The graph owns a set of [`GraphNode`]s and one root node. Lifecycle
//! transitions are applied to every node in insertion order and rolled back
//! in reverse order if any node fails:
//!
//! ```text
//! IDLE --init--> READY --start--> RUNNING
//!      <-uninit-       <--stop--
//! ```
//!
//! `flush` and `sync` block the caller on latch rounds that every node
//! counts down once it reports idle with no external dependency. The
//! optional watchdog only dumps diagnostics; the wait continues.

use super::node::{ConnectionKind, DataId, GraphNode, NodeLink, NodeStatus, Payload};
use crate::error::{PipeError, Result};
use crate::sync::{lock, CountDownLatch};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Graph lifecycle stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum GraphStage {
    Idle,
    Ready,
    Running,
}

impl GraphStage {
    pub fn name(self) -> &'static str {
        match self {
            GraphStage::Idle => "idle",
            GraphStage::Ready => "ready",
            GraphStage::Running => "running",
        }
    }
}

/// Hook invoked with node snapshots when a barrier watchdog fires.
pub type DiagnosticHook = Arc<dyn Fn(&[NodeStatus]) + Send + Sync>;

struct GraphInner<I: DataId, D: Payload> {
    stage: GraphStage,
    /// Set while a lifecycle transition runs node hooks outside the lock.
    transitioning: bool,
    nodes: Vec<NodeLink<I, D>>,
    root: Option<NodeLink<I, D>>,
}

#[derive(Serialize)]
struct BarrierDump<'a> {
    graph: &'a str,
    operation: &'static str,
    at: chrono::DateTime<chrono::Local>,
    nodes: &'a [NodeStatus],
}

pub struct Graph<I: DataId, D: Payload> {
    name: String,
    inner: Mutex<GraphInner<I, D>>,
    diagnostic: Mutex<Option<DiagnosticHook>>,
}

impl<I: DataId, D: Payload> Graph<I, D> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inner: Mutex::new(GraphInner {
                stage: GraphStage::Idle,
                transitioning: false,
                nodes: Vec::new(),
                root: None,
            }),
            diagnostic: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stage(&self) -> GraphStage {
        lock(&self.inner).stage
    }

    pub fn nodes(&self) -> Vec<NodeLink<I, D>> {
        lock(&self.inner).nodes.clone()
    }

    pub fn root(&self) -> Option<NodeLink<I, D>> {
        lock(&self.inner).root.clone()
    }

    pub fn set_diagnostic_hook(&self, hook: DiagnosticHook) {
        *lock(&self.diagnostic) = Some(hook);
    }

    // ── Graph building ──

    fn require_stage(
        inner: &GraphInner<I, D>,
        operation: &'static str,
        expected: GraphStage,
    ) -> Result<()> {
        if inner.transitioning || inner.stage != expected {
            return Err(PipeError::InvalidStage {
                operation,
                expected: expected.name(),
                found: if inner.transitioning {
                    "transitioning"
                } else {
                    inner.stage.name()
                },
            });
        }
        Ok(())
    }

    fn contains(inner: &GraphInner<I, D>, node: &NodeLink<I, D>) -> bool {
        inner.nodes.iter().any(|n| Arc::ptr_eq(n, node))
    }

    /// Add a node. Only legal while idle; adding the same node twice is a no-op.
    pub fn add_node(&self, node: &NodeLink<I, D>) -> Result<()> {
        let mut inner = lock(&self.inner);
        Self::require_stage(&inner, "add_node", GraphStage::Idle)?;
        if !Self::contains(&inner, node) {
            tracing::debug!(graph = %self.name, node = node.name(), "Node added");
            inner.nodes.push(node.clone());
        }
        Ok(())
    }

    /// Set the node `enque` delivers to, adding it if needed.
    pub fn set_root_node(&self, node: &NodeLink<I, D>) -> Result<()> {
        let mut inner = lock(&self.inner);
        Self::require_stage(&inner, "set_root_node", GraphStage::Idle)?;
        if !Self::contains(&inner, node) {
            inner.nodes.push(node.clone());
        }
        inner.root = Some(node.clone());
        Ok(())
    }

    /// Connect `src_id` on `src` to `dst_id` on `dst` and register the inbound id.
    pub fn connect_data(
        &self,
        src_id: I,
        dst_id: I,
        src: &NodeLink<I, D>,
        dst: &NodeLink<I, D>,
        kind: ConnectionKind,
    ) -> Result<()> {
        let inner = lock(&self.inner);
        if inner.stage == GraphStage::Running || inner.transitioning {
            return Err(PipeError::InvalidStage {
                operation: "connect_data",
                expected: "idle or ready",
                found: inner.stage.name(),
            });
        }
        if !Self::contains(&inner, src) || !Self::contains(&inner, dst) {
            return Err(PipeError::topology(
                src.name(),
                format!("cannot connect to {}: node not in graph", dst.name()),
            ));
        }
        src.connect(src_id, dst, dst_id, kind);
        dst.register_input_data_id(dst_id);
        Ok(())
    }

    /// Every registered inbound id of a non-root node must be fed by an edge.
    pub fn verify_topology(&self) -> Result<()> {
        let (nodes, root) = {
            let inner = lock(&self.inner);
            (inner.nodes.clone(), inner.root.clone())
        };
        let Some(root) = root else {
            return Err(PipeError::topology(self.name.as_str(), "no root node"));
        };

        for node in nodes.iter().filter(|n| !Arc::ptr_eq(n, &root)) {
            for id in node.input_data_ids() {
                if !nodes.iter().any(|src| src.delivers_to(node, id)) {
                    tracing::error!(graph = %self.name, node = node.name(), ?id, "Input has no producer");
                    return Err(PipeError::topology(
                        node.name(),
                        format!("registered input {:?} has no producer", id),
                    ));
                }
            }
        }
        Ok(())
    }

    // ── Lifecycle ──

    /// Mark a transition as running and hand back the node list.
    fn begin_transition(
        &self,
        operation: &'static str,
        expected: GraphStage,
    ) -> Result<Vec<NodeLink<I, D>>> {
        let mut inner = lock(&self.inner);
        Self::require_stage(&inner, operation, expected)?;
        inner.transitioning = true;
        Ok(inner.nodes.clone())
    }

    fn end_transition(&self, stage: GraphStage) {
        let mut inner = lock(&self.inner);
        inner.transitioning = false;
        inner.stage = stage;
    }

    pub fn init(&self) -> Result<()> {
        let nodes = self.begin_transition("init", GraphStage::Idle)?;
        for (i, node) in nodes.iter().enumerate() {
            if !node.init() {
                tracing::error!(graph = %self.name, node = node.name(), "Node init failed, rolling back");
                for done in nodes[..i].iter().rev() {
                    if !done.uninit() {
                        tracing::warn!(node = done.name(), "Rollback uninit failed");
                    }
                }
                self.end_transition(GraphStage::Idle);
                return Err(PipeError::NodeLifecycle {
                    node: node.name().to_string(),
                    phase: "init",
                });
            }
        }
        self.end_transition(GraphStage::Ready);
        tracing::info!(graph = %self.name, nodes = nodes.len(), "Graph initialized");
        Ok(())
    }

    pub fn uninit(&self) -> Result<()> {
        let nodes = self.begin_transition("uninit", GraphStage::Ready)?;
        let mut ok = true;
        for node in nodes.iter().rev() {
            if !node.uninit() {
                tracing::warn!(graph = %self.name, node = node.name(), "Node uninit failed");
                ok = false;
            }
        }
        self.end_transition(GraphStage::Idle);
        tracing::info!(graph = %self.name, "Graph uninitialized");
        if ok {
            Ok(())
        } else {
            Err(PipeError::NodeLifecycle {
                node: self.name.clone(),
                phase: "uninit",
            })
        }
    }

    pub fn start(&self) -> Result<()> {
        {
            let inner = lock(&self.inner);
            Self::require_stage(&inner, "start", GraphStage::Ready)?;
        }
        self.verify_topology()?;

        let nodes = self.begin_transition("start", GraphStage::Ready)?;
        for (i, node) in nodes.iter().enumerate() {
            node.set_data_flow(true);
            if let Err(e) = node.start() {
                tracing::error!(graph = %self.name, node = node.name(), "Node start failed: {}", e);
                for done in nodes[..i].iter().rev() {
                    if let Err(e) = done.stop() {
                        tracing::warn!(node = done.name(), "Rollback stop failed: {}", e);
                    }
                }
                self.end_transition(GraphStage::Ready);
                return Err(e);
            }
        }
        self.end_transition(GraphStage::Running);
        tracing::info!(graph = %self.name, "Graph started");
        Ok(())
    }

    pub fn stop(&self) -> Result<()> {
        let nodes = self.begin_transition("stop", GraphStage::Running)?;
        for (i, node) in nodes.iter().enumerate() {
            if let Err(e) = node.stop() {
                tracing::error!(graph = %self.name, node = node.name(), "Node stop failed: {}", e);
                for done in nodes[..i].iter().rev() {
                    if let Err(e) = done.start() {
                        tracing::warn!(node = done.name(), "Rollback restart failed: {}", e);
                    }
                }
                self.end_transition(GraphStage::Running);
                return Err(e);
            }
        }
        self.end_transition(GraphStage::Ready);
        tracing::info!(graph = %self.name, "Graph stopped");
        Ok(())
    }

    // ── Delivery ──

    fn running_root(&self, operation: &'static str) -> Result<NodeLink<I, D>> {
        let inner = lock(&self.inner);
        Self::require_stage(&inner, operation, GraphStage::Running)?;
        inner
            .root
            .clone()
            .ok_or_else(|| PipeError::topology(self.name.as_str(), "no root node"))
    }

    /// Deliver `data` to the root node.
    pub fn enque(&self, id: I, data: D) -> Result<bool> {
        let root = self.running_root("enque")?;
        Ok(root.on_data(id, &data))
    }

    /// Deliver `data` to every node. Returns how many accepted it.
    pub fn broadcast(&self, id: I, data: D) -> Result<usize> {
        let nodes = {
            let inner = lock(&self.inner);
            Self::require_stage(&inner, "broadcast", GraphStage::Running)?;
            inner.nodes.clone()
        };
        Ok(nodes.iter().filter(|n| n.on_data(id, &data)).count())
    }

    pub fn set_data_flow(&self, enabled: bool) {
        for node in self.nodes() {
            node.set_data_flow(enabled);
        }
    }

    /// Reset every node's ordered-delivery expectation to `next`.
    pub fn reset_sequence(&self, next: u32) {
        for node in self.nodes() {
            node.reset_sequence(next);
        }
    }

    pub fn node_status(&self) -> Vec<NodeStatus> {
        self.nodes().iter().map(|n| n.status()).collect()
    }

    // ── Barriers ──

    fn barrier_nodes(&self) -> Option<Vec<NodeLink<I, D>>> {
        let inner = lock(&self.inner);
        if inner.stage == GraphStage::Running && !inner.transitioning {
            Some(inner.nodes.clone())
        } else {
            None
        }
    }

    fn dump(&self, operation: &'static str, nodes: &[NodeLink<I, D>]) {
        let statuses: Vec<NodeStatus> = nodes.iter().map(|n| n.status()).collect();
        let dump = BarrierDump {
            graph: &self.name,
            operation,
            at: chrono::Local::now(),
            nodes: &statuses,
        };
        match serde_json::to_string(&dump) {
            Ok(json) => tracing::warn!(graph = %self.name, "{} watchdog: {}", operation, json),
            Err(e) => tracing::warn!(graph = %self.name, "{} watchdog (dump failed: {})", operation, e),
        }
        let hook = lock(&self.diagnostic).clone();
        if let Some(hook) = hook {
            hook(&statuses);
        }
    }

    /// Repeat latch rounds until every node is idle at the same moment.
    ///
    /// A node may report idle before an upstream node forwards its last
    /// item, so one round is not enough. The watchdog deadline spans all
    /// rounds and fires at most once.
    fn wait_idle(
        &self,
        operation: &'static str,
        nodes: &[NodeLink<I, D>],
        watchdog: Option<Duration>,
    ) -> bool {
        let deadline = watchdog.map(|w| Instant::now() + w);
        let mut fired = false;
        let mut rounds = 0usize;
        loop {
            rounds += 1;
            let latch = Arc::new(CountDownLatch::new(nodes.len()));
            for node in nodes {
                node.register_sync(latch.clone());
            }
            let remaining = match deadline {
                Some(deadline) if !fired => Some(deadline.saturating_duration_since(Instant::now())),
                _ => None,
            };
            fired |= latch.wait_with_watchdog(remaining, || self.dump(operation, nodes));

            if nodes.iter().all(|n| n.hub().is_idle()) {
                break;
            }
        }
        if fired {
            tracing::warn!(graph = %self.name, rounds, "{} completed after watchdog", operation);
        } else {
            tracing::trace!(graph = %self.name, rounds, "{} settled", operation);
        }
        true
    }

    /// Block until every node is simultaneously idle.
    pub fn sync(&self, watchdog: Option<Duration>) -> bool {
        let Some(nodes) = self.barrier_nodes() else {
            tracing::debug!(graph = %self.name, "sync skipped, graph not running");
            return true;
        };
        tracing::debug!(graph = %self.name, "sync begin");
        let ok = self.wait_idle("sync", &nodes, watchdog);
        tracing::debug!(graph = %self.name, "sync end");
        ok
    }

    /// Drop in-flight work: stop forwarding, drain queues, then wait idle.
    pub fn flush(&self, watchdog: Option<Duration>) -> bool {
        let Some(nodes) = self.barrier_nodes() else {
            for node in self.nodes() {
                node.hub().flush_queues();
            }
            return true;
        };

        tracing::debug!(graph = %self.name, "flush begin");
        for node in &nodes {
            node.set_data_flow(false);
        }
        for node in &nodes {
            node.hub().trigger_signal(crate::thread::Signal::DryRun);
        }
        let ok = self.wait_idle("flush", &nodes, watchdog);
        for node in &nodes {
            node.set_data_flow(true);
        }
        tracing::debug!(graph = %self.name, "flush end");
        ok
    }
}

impl<I: DataId, D: Payload> Drop for Graph<I, D> {
    fn drop(&mut self) {
        if self.stage() == GraphStage::Running {
            let _ = self.stop();
        }
        if self.stage() == GraphStage::Ready {
            let _ = self.uninit();
        }
        for node in self.nodes() {
            node.disconnect_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::node::NodeHandler;
    use crate::thread::{FifoQueue, WaitQueue};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Forwards each item to `out` after processing.
    struct Relay {
        name: String,
        queue: FifoQueue<u32>,
        processed: AtomicUsize,
        fail_init: AtomicBool,
        inits: AtomicUsize,
        forward: bool,
    }

    impl Relay {
        fn new(name: &str, forward: bool) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                queue: FifoQueue::new(format!("{name}.in")),
                processed: AtomicUsize::new(0),
                fail_init: AtomicBool::new(false),
                inits: AtomicUsize::new(0),
                forward,
            })
        }
    }

    impl NodeHandler<u8, u32> for Relay {
        fn name(&self) -> &str {
            &self.name
        }

        fn wait_queues(&self) -> Vec<Arc<dyn WaitQueue>> {
            vec![Arc::new(self.queue.clone())]
        }

        fn on_init(&self) -> bool {
            if self.fail_init.load(Ordering::SeqCst) {
                return false;
            }
            self.inits.fetch_add(1, Ordering::SeqCst);
            true
        }

        fn on_uninit(&self) -> bool {
            self.inits.fetch_sub(1, Ordering::SeqCst);
            true
        }

        fn on_data(&self, _id: u8, data: &u32) -> bool {
            self.queue.enque(*data);
            true
        }

        fn on_thread_loop(&self, node: &NodeLink<u8, u32>) -> bool {
            if !node.wait_all_queue() {
                return false;
            }
            let Some(item) = self.queue.deque() else {
                return false;
            };
            self.processed.fetch_add(1, Ordering::SeqCst);
            if self.forward {
                node.handle_data(0, item);
            }
            true
        }
    }

    fn node(handler: Arc<Relay>) -> NodeLink<u8, u32> {
        GraphNode::new(handler)
    }

    fn two_stage() -> (Graph<u8, u32>, Arc<Relay>, Arc<Relay>) {
        let graph = Graph::new("test");
        let first = Relay::new("first", true);
        let second = Relay::new("second", false);
        let a = node(first.clone());
        let b = node(second.clone());
        graph.set_root_node(&a).unwrap();
        graph.add_node(&b).unwrap();
        graph.connect_data(0, 0, &a, &b, ConnectionKind::Direct).unwrap();
        (graph, first, second)
    }

    #[test]
    fn test_lifecycle_order() {
        let (graph, _, _) = two_stage();
        assert!(graph.uninit().is_err());
        assert!(graph.start().is_err());
        graph.init().unwrap();
        assert_eq!(graph.stage(), GraphStage::Ready);
        graph.start().unwrap();
        assert!(graph.start().is_err());
        assert_eq!(graph.stage(), GraphStage::Running);
        graph.stop().unwrap();
        graph.uninit().unwrap();
        assert_eq!(graph.stage(), GraphStage::Idle);
    }

    #[test]
    fn test_init_failure_rolls_back() {
        let (graph, first, second) = two_stage();
        second.fail_init.store(true, Ordering::SeqCst);
        assert!(graph.init().is_err());
        assert_eq!(graph.stage(), GraphStage::Idle);
        assert_eq!(first.inits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_enque_requires_running() {
        let (graph, _, _) = two_stage();
        assert!(graph.enque(0, 1).is_err());
        assert!(graph.broadcast(0, 1).is_err());
    }

    #[test]
    fn test_flow_and_sync() {
        let (graph, first, second) = two_stage();
        graph.init().unwrap();
        graph.start().unwrap();
        for i in 0..10 {
            assert!(graph.enque(0, i).unwrap());
        }
        assert!(graph.sync(Some(Duration::from_secs(5))));
        assert_eq!(first.processed.load(Ordering::SeqCst), 10);
        assert_eq!(second.processed.load(Ordering::SeqCst), 10);
        graph.stop().unwrap();
    }

    #[test]
    fn test_broadcast_reaches_every_node() {
        let (graph, first, second) = two_stage();
        graph.init().unwrap();
        graph.start().unwrap();
        assert_eq!(graph.broadcast(0, 7).unwrap(), 2);
        graph.sync(None);
        assert_eq!(first.processed.load(Ordering::SeqCst), 1);
        assert_eq!(second.processed.load(Ordering::SeqCst), 2);
        graph.stop().unwrap();
    }

    #[test]
    fn test_unfed_input_blocks_start() {
        let graph: Graph<u8, u32> = Graph::new("broken");
        let a = node(Relay::new("a", false));
        let b = node(Relay::new("b", false));
        graph.set_root_node(&a).unwrap();
        graph.add_node(&b).unwrap();
        b.register_input_data_id(3);
        graph.init().unwrap();
        assert!(matches!(graph.start(), Err(PipeError::Topology { .. })));
        assert_eq!(graph.stage(), GraphStage::Ready);
    }
}
