//! Graph nodes: a handler, an edge table and a worker thread, composed.
//!
//! [`NodeHandler`] is the only thing a stage implements. [`GraphNode`] wraps
//! it with the outbound edge table, the inbound id registry, the sequence
//! restorer used by ordered edges and the worker loop that drives
//! `on_thread_loop`.

use super::sequence::SequenceRestorer;
use crate::error::Result;
use crate::sync::{lock, IdleLatchCallback, CountDownLatch, NotifyCallback};
use crate::thread::{Sequenced, ThreadBody, WaitHub, WaitQueue, WorkerThread};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

/// Identifier of a data edge.
pub trait DataId: Copy + Eq + Hash + Debug + Send + Sync + 'static {}

impl<T: Copy + Eq + Hash + Debug + Send + Sync + 'static> DataId for T {}

/// Data carried along edges.
pub trait Payload: Sequenced + Clone + Send + Sync + 'static {}

impl<T: Sequenced + Clone + Send + Sync + 'static> Payload for T {}

/// Shared handle to a node, handed to handler hooks that need to dispatch.
pub type NodeLink<I, D> = Arc<GraphNode<I, D>>;

/// How a delivery travels along an edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionKind {
    /// Call the destination's `on_data` immediately
    Direct,
    /// Release to the destination in ascending sequence order
    SequenceRestoring,
}

/// Per-stage behaviour plugged into a [`GraphNode`].
pub trait NodeHandler<I: DataId, D: Payload>: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Queues the node's hub should wait on.
    fn wait_queues(&self) -> Vec<Arc<dyn WaitQueue>> {
        Vec::new()
    }

    fn on_init(&self) -> bool {
        true
    }

    fn on_uninit(&self) -> bool {
        true
    }

    fn on_start(&self) -> bool {
        true
    }

    fn on_stop(&self) -> bool {
        true
    }

    fn on_thread_start(&self, _node: &NodeLink<I, D>) -> bool {
        true
    }

    fn on_thread_stop(&self, _node: &NodeLink<I, D>) -> bool {
        true
    }

    /// Accept a delivery. Runs on the producer's thread, so it must only
    /// enqueue.
    fn on_data(&self, id: I, data: &D) -> bool;

    /// One processing step on the node's own thread.
    fn on_thread_loop(&self, node: &NodeLink<I, D>) -> bool;
}

struct Edge<I: DataId, D: Payload> {
    dst: Weak<GraphNode<I, D>>,
    dst_id: I,
    kind: ConnectionKind,
}

/// Snapshot used by barrier diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct NodeStatus {
    pub name: String,
    pub running: bool,
    pub idle: bool,
    pub data_flow: bool,
    pub queued: usize,
    pub ext_dependencies: usize,
    pub pending_ordered: usize,
    pub signals: Vec<&'static str>,
}

pub struct GraphNode<I: DataId, D: Payload> {
    handler: Arc<dyn NodeHandler<I, D>>,
    worker: WorkerThread,
    edges: RwLock<HashMap<I, Edge<I, D>>>,
    inputs: Mutex<Vec<I>>,
    restorer: Mutex<SequenceRestorer<(I, D)>>,
    data_flow: AtomicBool,
}

struct NodeBody<I: DataId, D: Payload> {
    node: NodeLink<I, D>,
}

impl<I: DataId, D: Payload> ThreadBody for NodeBody<I, D> {
    fn on_thread_start(&mut self) -> bool {
        self.node.handler.on_thread_start(&self.node)
    }

    fn on_thread_stop(&mut self) -> bool {
        self.node.handler.on_thread_stop(&self.node)
    }

    fn on_thread_loop(&mut self) -> bool {
        self.node.handler.on_thread_loop(&self.node)
    }
}

impl<I: DataId, D: Payload> GraphNode<I, D> {
    pub fn new(handler: Arc<dyn NodeHandler<I, D>>) -> Arc<Self> {
        let worker = WorkerThread::new(handler.name());
        for queue in handler.wait_queues() {
            worker.hub().add_wait_queue(queue);
        }
        Arc::new(Self {
            handler,
            worker,
            edges: RwLock::new(HashMap::new()),
            inputs: Mutex::new(Vec::new()),
            restorer: Mutex::new(SequenceRestorer::new(0)),
            data_flow: AtomicBool::new(true),
        })
    }

    pub fn name(&self) -> &str {
        self.handler.name()
    }

    pub fn handler(&self) -> &Arc<dyn NodeHandler<I, D>> {
        &self.handler
    }

    pub fn hub(&self) -> &Arc<WaitHub> {
        self.worker.hub()
    }

    // ── Edge table ──

    /// Route deliveries of `src_id` to `dst` as `dst_id`.
    pub fn connect(&self, src_id: I, dst: &NodeLink<I, D>, dst_id: I, kind: ConnectionKind) {
        let previous = self.edges.write().unwrap_or_else(|e| e.into_inner()).insert(
            src_id,
            Edge {
                dst: Arc::downgrade(dst),
                dst_id,
                kind,
            },
        );
        if previous.is_some() {
            tracing::warn!(node = self.name(), ?src_id, "Edge replaced");
        }
        tracing::debug!(
            node = self.name(),
            ?src_id,
            dst = dst.name(),
            ?dst_id,
            ?kind,
            "Edge connected"
        );
    }

    pub fn disconnect_all(&self) {
        self.edges.write().unwrap_or_else(|e| e.into_inner()).clear();
    }

    /// True if this node has an edge delivering `dst_id` into `dst`.
    pub fn delivers_to(&self, dst: &GraphNode<I, D>, dst_id: I) -> bool {
        self.edges
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .any(|edge| {
                edge.dst_id == dst_id
                    && edge
                        .dst
                        .upgrade()
                        .is_some_and(|d| std::ptr::eq(Arc::as_ptr(&d), dst))
            })
    }

    /// Record an inbound id so topology can be verified before start.
    pub fn register_input_data_id(&self, id: I) {
        let mut inputs = lock(&self.inputs);
        if !inputs.contains(&id) {
            inputs.push(id);
        }
    }

    pub fn input_data_ids(&self) -> Vec<I> {
        lock(&self.inputs).clone()
    }

    // ── Data flow ──

    pub fn set_data_flow(&self, enabled: bool) {
        self.data_flow.store(enabled, Ordering::Release);
    }

    pub fn data_flow(&self) -> bool {
        self.data_flow.load(Ordering::Acquire)
    }

    /// Send `data` along the edge registered for `id`.
    pub fn handle_data(&self, id: I, data: D) -> bool {
        if !self.data_flow() {
            tracing::debug!(node = self.name(), ?id, seq = data.sequence(), "Data flow disabled, dropped");
            return false;
        }

        let (dst, dst_id, kind) = {
            let edges = self.edges.read().unwrap_or_else(|e| e.into_inner());
            let Some(edge) = edges.get(&id) else {
                tracing::warn!(node = self.name(), ?id, "No edge for data id");
                return false;
            };
            (edge.dst.upgrade(), edge.dst_id, edge.kind)
        };

        let Some(dst) = dst else {
            tracing::error!(node = self.name(), ?id, "Edge destination no longer exists");
            return false;
        };

        match kind {
            ConnectionKind::Direct => dst.on_data(dst_id, &data),
            ConnectionKind::SequenceRestoring => dst.on_ordered_data(dst_id, data),
        }
    }

    /// Deliver directly to this node's handler.
    pub fn on_data(&self, id: I, data: &D) -> bool {
        let accepted = self.handler.on_data(id, data);
        if !accepted {
            tracing::debug!(node = self.name(), ?id, seq = data.sequence(), "Delivery refused");
        }
        accepted
    }

    fn on_ordered_data(&self, id: I, data: D) -> bool {
        let seq = data.sequence();
        // Held across delivery so concurrent producers cannot interleave
        // released runs; handlers only enqueue.
        let mut restorer = lock(&self.restorer);
        let ready = restorer.push(seq, (id, data));
        if ready.is_empty() {
            tracing::trace!(node = self.name(), seq, expected = restorer.expected(), "Held for ordering");
        }
        for (id, data) in ready {
            self.on_data(id, &data);
        }
        true
    }

    /// Discard held ordered deliveries and expect `next` from now on.
    pub fn reset_sequence(&self, next: u32) {
        let dropped = lock(&self.restorer).reset(next);
        if dropped > 0 {
            tracing::debug!(node = self.name(), dropped, next, "Ordered deliveries discarded");
        }
    }

    // ── Lifecycle ──

    pub fn init(&self) -> bool {
        self.handler.on_init()
    }

    pub fn uninit(&self) -> bool {
        self.handler.on_uninit()
    }

    pub fn start(self: &Arc<Self>) -> Result<()> {
        if !self.handler.on_start() {
            return Err(crate::error::PipeError::NodeLifecycle {
                node: self.name().to_string(),
                phase: "start",
            });
        }
        if let Err(e) = self.worker.start(NodeBody { node: self.clone() }) {
            self.handler.on_stop();
            return Err(e);
        }
        Ok(())
    }

    pub fn stop(&self) -> Result<()> {
        self.worker.stop()?;
        if !self.handler.on_stop() {
            return Err(crate::error::PipeError::NodeLifecycle {
                node: self.name().to_string(),
                phase: "stop",
            });
        }
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_running()
    }

    // ── Thread services for handlers ──

    pub fn wait_all_queue(&self) -> bool {
        self.hub().wait_all_queue()
    }

    pub fn wait_any_queue(&self) -> bool {
        self.hub().wait_any_queue()
    }

    pub fn wait_all_queue_sync(&self) -> Option<u32> {
        self.hub().wait_all_queue_sync()
    }

    pub fn inc_ext_thread_dependency(&self) -> usize {
        self.worker.inc_ext_thread_dependency()
    }

    pub fn dec_ext_thread_dependency(&self) -> bool {
        self.worker.dec_ext_thread_dependency()
    }

    pub fn insert_cb(&self, cb: Arc<dyn NotifyCallback>) {
        self.worker.insert_cb(cb);
    }

    pub fn insert_idle_cb(&self, cb: Arc<dyn NotifyCallback>) {
        self.worker.insert_idle_cb(cb);
    }

    /// Count `latch` down once this node reports idle.
    pub fn register_sync(&self, latch: Arc<CountDownLatch>) {
        self.worker
            .register_status_cb(Arc::new(IdleLatchCallback::new(latch)));
    }

    pub fn status(&self) -> NodeStatus {
        let hub = self.hub();
        NodeStatus {
            name: self.name().to_string(),
            running: self.is_running(),
            idle: hub.is_idle(),
            data_flow: self.data_flow(),
            queued: hub.queued(),
            ext_dependencies: hub.ext_dependencies(),
            pending_ordered: lock(&self.restorer).pending(),
            signals: hub.signals().iter().map(|s| s.name()).collect(),
        }
    }
}

impl<I: DataId, D: Payload> Debug for GraphNode<I, D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphNode")
            .field("name", &self.name())
            .field("running", &self.is_running())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread::FifoQueue;

    /// Records every delivery in arrival order.
    struct Recorder {
        name: String,
        seen: Mutex<Vec<(u8, u32)>>,
    }

    impl Recorder {
        fn new(name: &str) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    impl NodeHandler<u8, u32> for Recorder {
        fn name(&self) -> &str {
            &self.name
        }

        fn on_data(&self, id: u8, data: &u32) -> bool {
            lock(&self.seen).push((id, *data));
            true
        }

        fn on_thread_loop(&self, _node: &NodeLink<u8, u32>) -> bool {
            true
        }
    }

    fn node(handler: Arc<Recorder>) -> NodeLink<u8, u32> {
        GraphNode::new(handler)
    }

    #[test]
    fn test_direct_edge_delivers() {
        let sink = Recorder::new("sink");
        let src = node(Recorder::new("src"));
        let dst = node(sink.clone());
        src.connect(1, &dst, 9, ConnectionKind::Direct);

        assert!(src.handle_data(1, 42));
        assert!(!src.handle_data(2, 42));
        assert_eq!(*lock(&sink.seen), vec![(9, 42)]);
        assert!(src.delivers_to(&dst, 9));
        assert!(!src.delivers_to(&dst, 1));
    }

    #[test]
    fn test_data_flow_gate() {
        let sink = Recorder::new("sink");
        let src = node(Recorder::new("src"));
        let dst = node(sink.clone());
        src.connect(1, &dst, 1, ConnectionKind::Direct);

        src.set_data_flow(false);
        assert!(!src.handle_data(1, 1));
        src.set_data_flow(true);
        assert!(src.handle_data(1, 2));
        assert_eq!(lock(&sink.seen).len(), 1);
    }

    #[test]
    fn test_ordered_edge_restores_sequence() {
        let sink = Recorder::new("sink");
        let a = node(Recorder::new("a"));
        let b = node(Recorder::new("b"));
        let dst = node(sink.clone());
        a.connect(0, &dst, 0, ConnectionKind::SequenceRestoring);
        b.connect(0, &dst, 1, ConnectionKind::SequenceRestoring);

        b.handle_data(0, 2);
        a.handle_data(0, 1);
        assert!(lock(&sink.seen).is_empty());
        b.handle_data(0, 0);
        assert_eq!(*lock(&sink.seen), vec![(1, 0), (0, 1), (1, 2)]);
    }

    #[test]
    fn test_registered_queues_feed_hub() {
        struct Queued {
            queue: FifoQueue<u32>,
        }
        impl NodeHandler<u8, u32> for Queued {
            fn name(&self) -> &str {
                "queued"
            }
            fn wait_queues(&self) -> Vec<Arc<dyn WaitQueue>> {
                vec![Arc::new(self.queue.clone())]
            }
            fn on_data(&self, _id: u8, data: &u32) -> bool {
                self.queue.enque(*data);
                true
            }
            fn on_thread_loop(&self, _node: &NodeLink<u8, u32>) -> bool {
                true
            }
        }

        let node: NodeLink<u8, u32> = GraphNode::new(Arc::new(Queued {
            queue: FifoQueue::new("in"),
        }));
        assert!(node.hub().is_idle());
        node.on_data(0, &5);
        assert_eq!(node.status().queued, 1);
        assert!(!node.status().idle);
    }
}
