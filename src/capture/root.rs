//! Root node: entry and exit point of every request.

use super::ids::{NodeId, PathId};
use super::node::{dispatch, CaptureLink};
use super::request::RequestPtr;
use crate::graph::NodeHandler;
use crate::thread::{FifoQueue, WaitQueue};
use std::sync::Arc;

/// Called on the root thread for every request that came back.
pub type FinishHook = Box<dyn Fn(RequestPtr) + Send + Sync>;

pub struct RootNode {
    requests: FifoQueue<RequestPtr>,
    finished: FifoQueue<RequestPtr>,
    on_finish: FinishHook,
}

impl RootNode {
    pub fn new(on_finish: FinishHook) -> Self {
        Self {
            requests: FifoQueue::new("root.requests"),
            finished: FifoQueue::new("root.finished"),
            on_finish,
        }
    }

    fn finish(&self, request: RequestPtr) {
        let leaks = request.leaked_references();
        if !leaks.is_empty() {
            tracing::error!(request = request.request_no(), ?leaks, "Request finished with outstanding references");
        }
        tracing::debug!(request = request.request_no(), seq = request.sequence(), "Request finished");
        (self.on_finish)(request);
    }

    fn start(&self, link: &CaptureLink, request: RequestPtr) {
        tracing::debug!(
            request = request.request_no(),
            seq = request.sequence(),
            nodes = ?request.nodes(),
            "Request dispatched"
        );
        if request.dec_node_reference(NodeId::Root) {
            dispatch(link, NodeId::Root, &request);
        }
    }
}

impl NodeHandler<PathId, RequestPtr> for RootNode {
    fn name(&self) -> &str {
        NodeId::Root.name()
    }

    fn wait_queues(&self) -> Vec<Arc<dyn WaitQueue>> {
        vec![Arc::new(self.requests.clone()), Arc::new(self.finished.clone())]
    }

    fn on_data(&self, path: PathId, request: &RequestPtr) -> bool {
        match path {
            PathId::Enque => self.requests.enque(request.clone()),
            PathId::Deque => self.finished.enque(request.clone()),
            other => {
                tracing::error!(path = %other, request = request.request_no(), "Root received a non-virtual path");
                return false;
            }
        }
        true
    }

    fn on_thread_loop(&self, link: &CaptureLink) -> bool {
        if !link.wait_any_queue() {
            return false;
        }
        // Completions first so finished requests free their buffers early.
        if let Some(request) = self.finished.deque() {
            self.finish(request);
        } else if let Some(request) = self.requests.deque() {
            self.start(link, request);
        }
        true
    }
}
