//! Mock construction helpers

use feature_pipe::capture::{RequestCallback, RequestPtr};
use std::sync::Mutex;
use std::time::Duration;

mockall::mock! {
    pub Callback {}

    impl RequestCallback for Callback {
        fn on_completed(&self, request: &RequestPtr, ok: bool);
        fn on_aborted(&self, request: &RequestPtr);
        fn on_continue(&self, request: &RequestPtr);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Completed { request_no: u32, seq: u32, ok: bool },
    Aborted { request_no: u32 },
}

/// Callback that records every notification, keeping finished requests
/// alive so tests can inspect their buffers.
#[derive(Default)]
pub struct RecordingCallback {
    outcomes: Mutex<Vec<Outcome>>,
    requests: Mutex<Vec<RequestPtr>>,
    continued: Mutex<Vec<u32>>,
}

impl RecordingCallback {
    pub fn outcomes(&self) -> Vec<Outcome> {
        self.outcomes.lock().unwrap().clone()
    }

    pub fn finished(&self) -> usize {
        self.outcomes.lock().unwrap().len()
    }

    pub fn continued(&self) -> Vec<u32> {
        self.continued.lock().unwrap().clone()
    }

    pub fn request(&self, request_no: u32) -> Option<RequestPtr> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .find(|r| r.request_no() == request_no)
            .cloned()
    }

    /// Wait until `count` requests have finished either way
    pub fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        super::wait_until(timeout, || self.finished() >= count)
    }
}

impl RequestCallback for RecordingCallback {
    fn on_completed(&self, request: &RequestPtr, ok: bool) {
        self.requests.lock().unwrap().push(request.clone());
        self.outcomes.lock().unwrap().push(Outcome::Completed {
            request_no: request.request_no(),
            seq: request.sequence(),
            ok,
        });
    }

    fn on_aborted(&self, request: &RequestPtr) {
        self.outcomes.lock().unwrap().push(Outcome::Aborted {
            request_no: request.request_no(),
        });
    }

    fn on_continue(&self, request: &RequestPtr) {
        self.continued.lock().unwrap().push(request.request_no());
    }
}
