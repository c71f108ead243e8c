//! Caller-thread delivery seam.
//!
//! Completion callbacks frequently touch thread-affine state (renderer
//! objects, widget trees), so they must run on the execution context that
//! issued the request — never on the reader task that pulled the response
//! off the wire. The embedding shell supplies the dispatcher (typically a
//! UI event-loop handle); this crate only submits closures to it.

/// Submits a closure to the work queue of the context that owns it.
pub trait Dispatcher: Send + Sync {
    fn dispatch(&self, task: Box<dyn FnOnce() + Send>);
}

/// Runs tasks immediately on the submitting thread.
///
/// For tests and headless embeddings where thread affinity does not
/// matter. Delivery order is the resolution order, which makes assertions
/// deterministic.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineDispatcher;

impl Dispatcher for InlineDispatcher {
    fn dispatch(&self, task: Box<dyn FnOnce() + Send>) {
        task();
    }
}
