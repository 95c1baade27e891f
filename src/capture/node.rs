//! Capture stages as graph nodes.
//!
//! A [`CaptureProcessor`] declares its IO during inference and processes
//! one request at a time. [`CaptureNode`] adapts it to the graph: it admits
//! a request once every inbound path has fired, queues it, and hands the
//! processor a [`Completion`] token. Finishing the token releases the
//! node's buffers and metadata, fires the outgoing paths and, when the
//! request has drained, delivers it back to the root.

use super::ids::{NodeId, PathId};
use super::inference::CaptureFeatureInferenceData;
use super::pipe::RequestCallback;
use super::request::RequestPtr;
use crate::error::Result;
use crate::graph::{NodeHandler, NodeLink};
use crate::thread::{InputQueue, WaitQueue};
use std::sync::Arc;

pub type CaptureLink = NodeLink<PathId, RequestPtr>;

/// Stage-specific behaviour of a capture node.
pub trait CaptureProcessor: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Declare IO for the request being inferred, typically through
    /// `infer.add_node_io(node, ..)`. Not participating is `Ok(())`.
    fn evaluate(&self, node: NodeId, infer: &mut CaptureFeatureInferenceData) -> Result<()>;

    /// Work on `request`. The node's share of the request is released when
    /// `completion` is finished, which may happen on another thread.
    fn process(&self, request: &RequestPtr, completion: Completion) -> bool;

    fn on_init(&self) -> bool {
        true
    }

    fn on_uninit(&self) -> bool {
        true
    }
}

/// Fire every outgoing path of `from`, then hand the request back to the
/// root if it has drained.
pub(crate) fn dispatch(link: &CaptureLink, from: NodeId, request: &RequestPtr) {
    for path in request.outgoing_paths(from) {
        if request.traverse(path) && !link.handle_data(path, request.clone()) {
            tracing::debug!(node = %from, %path, request = request.request_no(), "Delivery not accepted");
        }
    }
    if request.try_complete() && !link.handle_data(PathId::Deque, request.clone()) {
        tracing::warn!(node = %from, request = request.request_no(), "Finished request could not reach root");
    }
}

/// Proof that a node still owes the graph one request.
///
/// Creating it counts as an external dependency of the node, so barriers
/// keep waiting while processing continues elsewhere. Dropping it without
/// [`finish`](Completion::finish) finishes it anyway, with a warning.
pub struct Completion {
    link: Option<CaptureLink>,
    node: NodeId,
    request: RequestPtr,
    callback: Arc<dyn RequestCallback>,
}

impl Completion {
    fn new(link: &CaptureLink, node: NodeId, request: RequestPtr, callback: Arc<dyn RequestCallback>) -> Self {
        link.inc_ext_thread_dependency();
        Self {
            link: Some(link.clone()),
            node,
            request,
            callback,
        }
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn request(&self) -> &RequestPtr {
        &self.request
    }

    pub fn finish(mut self) {
        self.complete();
    }

    fn complete(&mut self) {
        let Some(link) = self.link.take() else {
            return;
        };
        let request = &self.request;
        if !request.release_node_resources(self.node) {
            tracing::error!(node = %self.node, request = request.request_no(), "Node released resources it did not hold");
        }
        if request.take_continue(self.node) {
            self.callback.on_continue(request);
        }
        if request.dec_node_reference(self.node) {
            dispatch(&link, self.node, request);
        }
        link.dec_ext_thread_dependency();
        tracing::trace!(node = %self.node, request = request.request_no(), "Node finished request");
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        if self.link.is_some() {
            tracing::warn!(node = %self.node, request = self.request.request_no(), "Completion dropped unfinished");
            self.complete();
        }
    }
}

/// Graph handler wrapping one [`CaptureProcessor`].
pub struct CaptureNode {
    id: NodeId,
    processor: Arc<dyn CaptureProcessor>,
    queue: InputQueue<RequestPtr>,
    callback: Arc<dyn RequestCallback>,
}

impl CaptureNode {
    pub fn new(
        id: NodeId,
        processor: Arc<dyn CaptureProcessor>,
        callback: Arc<dyn RequestCallback>,
        priority_queue: bool,
    ) -> Self {
        Self {
            id,
            queue: InputQueue::new(format!("{}.requests", id.name()), priority_queue),
            processor,
            callback,
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn processor(&self) -> &Arc<dyn CaptureProcessor> {
        &self.processor
    }
}

impl NodeHandler<PathId, RequestPtr> for CaptureNode {
    fn name(&self) -> &str {
        self.id.name()
    }

    fn wait_queues(&self) -> Vec<Arc<dyn WaitQueue>> {
        vec![self.queue.as_wait_queue()]
    }

    fn on_init(&self) -> bool {
        self.processor.on_init()
    }

    fn on_uninit(&self) -> bool {
        self.processor.on_uninit()
    }

    fn on_data(&self, path: PathId, request: &RequestPtr) -> bool {
        if request.node_request(self.id).is_none() {
            tracing::error!(
                node = %self.id,
                %path,
                request = request.request_no(),
                "Request delivered to a node it does not use"
            );
            return false;
        }
        if request.acquire_node(self.id) {
            tracing::trace!(node = %self.id, %path, request = request.request_no(), "Request admitted");
            self.queue.enque(request.clone());
        } else {
            tracing::trace!(node = %self.id, %path, request = request.request_no(), "Waiting for other producers");
        }
        true
    }

    fn on_thread_loop(&self, link: &CaptureLink) -> bool {
        if !link.wait_all_queue() {
            return false;
        }
        let Some(request) = self.queue.deque() else {
            return false;
        };
        tracing::debug!(
            node = %self.id,
            processor = self.processor.name(),
            request = request.request_no(),
            seq = request.sequence(),
            "Processing"
        );
        let completion = Completion::new(link, self.id, request.clone(), self.callback.clone());
        let ok = self.processor.process(&request, completion);
        if !ok {
            tracing::warn!(node = %self.id, request = request.request_no(), "Processor reported failure");
        }
        ok
    }
}
