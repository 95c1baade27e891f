//! The capture feature pipe.
//!
//! Owns the graph of capture nodes plus the root, runs inference for every
//! request and reports results through a [`RequestCallback`].
//!
//! ```text
//! caller ──enque──▶ root ──paths──▶ capture nodes ──deque──▶ root ──▶ callback
//! ```
//!
//! Requests get consecutive sequence numbers at enqueue. With ordered
//! completion the deque edges restore that order before the root reports.

use super::ids::{real_paths, NodeId, PathId};
use super::inference::CaptureFeatureInferenceData;
use super::node::{CaptureLink, CaptureNode, CaptureProcessor};
use super::request::{CaptureFeatureRequest, RequestPtr};
use super::root::RootNode;
use crate::buffer::ImagePoolSet;
use crate::config::PipeConfig;
use crate::error::{PipeError, Result, ResultExt};
use crate::graph::{ConnectionKind, DiagnosticHook, Graph, GraphNode, GraphStage, NodeStatus};
use crate::sync::lock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Outcome notifications for enqueued requests.
///
/// Completions arrive on the root thread. `on_continue` arrives once per
/// request with a positive `EnableNextCapture` (first frame of a burst
/// only), on the P2A thread when P2A finishes its share, or on the first
/// finishing node when the request skips P2A.
#[cfg_attr(test, mockall::automock)]
pub trait RequestCallback: Send + Sync {
    /// The request drained. `ok` is false if it leaked references.
    fn on_completed(&self, request: &RequestPtr, ok: bool);

    /// The request was dropped by `flush`.
    fn on_aborted(&self, request: &RequestPtr);

    /// The next capture may be started.
    fn on_continue(&self, _request: &RequestPtr) {}
}

#[derive(Default)]
struct Inflight {
    next_sequence: u32,
    requests: BTreeMap<u32, RequestPtr>,
}

struct PipeShared {
    callback: Arc<dyn RequestCallback>,
    inflight: Mutex<Inflight>,
    completed: AtomicU64,
}

impl PipeShared {
    fn on_finish(&self, request: RequestPtr) {
        let tracked = lock(&self.inflight).requests.remove(&request.sequence());
        if tracked.is_none() {
            tracing::debug!(request = request.request_no(), "Request finished after being aborted");
            return;
        }
        self.completed.fetch_add(1, Ordering::Relaxed);
        let ok = request.leaked_references().is_empty();
        self.callback.on_completed(&request, ok);
    }
}

pub struct CaptureFeaturePipe {
    config: PipeConfig,
    graph: Graph<PathId, RequestPtr>,
    root: CaptureLink,
    nodes: Mutex<Vec<(NodeId, CaptureLink, Arc<dyn CaptureProcessor>)>>,
    shared: Arc<PipeShared>,
    pools: Arc<ImagePoolSet>,
    connected: AtomicBool,
}

impl CaptureFeaturePipe {
    pub fn new(config: PipeConfig, callback: Arc<dyn RequestCallback>) -> Result<Self> {
        config.validate()?;

        let shared = Arc::new(PipeShared {
            callback,
            inflight: Mutex::new(Inflight::default()),
            completed: AtomicU64::new(0),
        });
        let finish = shared.clone();
        let root: CaptureLink = GraphNode::new(Arc::new(RootNode::new(Box::new(move |request| {
            finish.on_finish(request)
        }))));

        let graph = Graph::new("capture");
        graph.set_root_node(&root)?;

        Ok(Self {
            pools: Arc::new(ImagePoolSet::new(config.pool.clone())),
            config,
            graph,
            root,
            nodes: Mutex::new(Vec::new()),
            shared,
            connected: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &PipeConfig {
        &self.config
    }

    pub fn stage(&self) -> GraphStage {
        self.graph.stage()
    }

    pub fn pools(&self) -> &Arc<ImagePoolSet> {
        &self.pools
    }

    pub fn node_status(&self) -> Vec<NodeStatus> {
        self.graph.node_status()
    }

    pub fn set_diagnostic_hook(&self, hook: DiagnosticHook) {
        self.graph.set_diagnostic_hook(hook);
    }

    /// Requests enqueued and not yet completed or aborted.
    pub fn in_flight(&self) -> usize {
        lock(&self.shared.inflight).requests.len()
    }

    pub fn completed(&self) -> u64 {
        self.shared.completed.load(Ordering::Relaxed)
    }

    /// Register the processor for `id`. Only legal before `init`.
    pub fn add_node(&self, id: NodeId, processor: Arc<dyn CaptureProcessor>) -> Result<()> {
        if id == NodeId::Root {
            return Err(PipeError::topology(id.name(), "the root node is built in"));
        }
        let mut nodes = lock(&self.nodes);
        if nodes.iter().any(|(n, _, _)| *n == id) {
            return Err(PipeError::topology(id.name(), "node added twice"));
        }
        let handler = CaptureNode::new(
            id,
            processor.clone(),
            self.shared.callback.clone(),
            self.config.ordering.priority_queues,
        );
        let link: CaptureLink = GraphNode::new(Arc::new(handler));
        self.graph.add_node(&link)?;
        tracing::debug!(node = %id, processor = processor.name(), "Capture node added");
        nodes.push((id, link, processor));
        Ok(())
    }

    fn link(&self, id: NodeId) -> Option<CaptureLink> {
        if id == NodeId::Root {
            return Some(self.root.clone());
        }
        lock(&self.nodes)
            .iter()
            .find(|(n, _, _)| *n == id)
            .map(|(_, link, _)| link.clone())
    }

    /// Wire every path whose endpoints are both present, plus the
    /// completion edges back into the root.
    fn connect(&self) -> Result<()> {
        for path in real_paths() {
            let (Some(src), Some(dst)) = (self.link(path.src()), self.link(path.dst())) else {
                continue;
            };
            self.graph
                .connect_data(path, path, &src, &dst, ConnectionKind::Direct)
                .with_context(|| format!("connecting {path}"))?;
        }

        let kind = if self.config.ordering.ordered_completion {
            ConnectionKind::SequenceRestoring
        } else {
            ConnectionKind::Direct
        };
        let links: Vec<CaptureLink> = lock(&self.nodes).iter().map(|(_, link, _)| link.clone()).collect();
        for link in links.iter().chain(std::iter::once(&self.root)) {
            self.graph
                .connect_data(PathId::Deque, PathId::Deque, link, &self.root, kind)?;
        }
        Ok(())
    }

    pub fn init(&self) -> Result<()> {
        if !self.connected.load(Ordering::Acquire) {
            self.connect().context("wiring capture graph")?;
            self.connected.store(true, Ordering::Release);
        }
        self.graph.init()
    }

    pub fn uninit(&self) -> Result<()> {
        self.graph.uninit()
    }

    pub fn start(&self) -> Result<()> {
        self.graph.start()
    }

    pub fn stop(&self) -> Result<()> {
        self.graph.stop()
    }

    /// Run inference for `request` across every registered node.
    ///
    /// A node whose declaration is rejected is left out and its features
    /// are dropped; the request itself fails only if a caller target
    /// cannot be produced.
    pub fn evaluate(&self, request: &mut CaptureFeatureRequest) -> Result<()> {
        let mut infer = CaptureFeatureInferenceData::new(request.features());
        let sources: Vec<_> = request.source_buffers().collect();
        for (type_id, bid, spec) in sources {
            infer.add_source(type_id, bid, spec)?;
        }

        let mut processors: Vec<(NodeId, Arc<dyn CaptureProcessor>)> = lock(&self.nodes)
            .iter()
            .map(|(id, _, processor)| (*id, processor.clone()))
            .collect();
        processors.sort_by_key(|(id, _)| *id);
        for (id, processor) in processors {
            if let Err(e) = processor.evaluate(id, &mut infer) {
                tracing::warn!(node = %id, request = request.request_no(), "Evaluate failed: {}", e);
            }
        }

        let targets: Vec<_> = request.target_buffers().collect();
        for (type_id, bid) in targets {
            infer.add_target(type_id, bid)?;
        }
        infer.determine(request)
    }

    /// Infer and submit `request`, returning its sequence number.
    pub fn enque(&self, mut request: CaptureFeatureRequest) -> Result<u32> {
        let stage = self.graph.stage();
        if stage != GraphStage::Running {
            return Err(PipeError::InvalidStage {
                operation: "enque",
                expected: GraphStage::Running.name(),
                found: stage.name(),
            });
        }
        self.evaluate(&mut request)?;
        request.set_provider(self.pools.clone());

        let mut inflight = lock(&self.shared.inflight);
        let sequence = inflight.next_sequence;
        request.set_sequence(sequence);
        let request = Arc::new(request);
        if !self.graph.enque(PathId::Enque, request.clone())? {
            return Err(PipeError::Protocol(format!(
                "root refused request {}",
                request.request_no()
            )));
        }
        inflight.requests.insert(sequence, request.clone());
        inflight.next_sequence = sequence.wrapping_add(1);
        tracing::debug!(request = request.request_no(), seq = sequence, "Request enqueued");
        Ok(sequence)
    }

    /// Block until every node is idle.
    pub fn sync(&self) -> bool {
        self.graph.sync(self.config.barrier.watchdog())
    }

    /// Drop all in-flight work and report it through `on_aborted`.
    pub fn flush(&self) -> bool {
        let ok = self.graph.flush(self.config.barrier.watchdog());
        let (aborted, next) = {
            let mut inflight = lock(&self.shared.inflight);
            (std::mem::take(&mut inflight.requests), inflight.next_sequence)
        };
        self.graph.reset_sequence(next);
        if !aborted.is_empty() {
            tracing::info!(aborted = aborted.len(), next_seq = next, "Flush aborted in-flight requests");
        }
        for request in aborted.values() {
            self.shared.callback.on_aborted(request);
        }
        ok
    }
}
