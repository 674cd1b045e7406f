//! Dispatchers deciding where listener callbacks run

use tokio::sync::mpsc;

/// A listener callback ready to run
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Runs listener callbacks on behalf of the connection manager
pub trait Dispatcher: Send + Sync + 'static {
    fn dispatch(&self, job: Job);
}

/// Runs each callback immediately on the calling task
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineDispatcher;

impl Dispatcher for InlineDispatcher {
    fn dispatch(&self, job: Job) {
        job();
    }
}

/// Queues callbacks for the task that owns the host state
#[derive(Clone)]
pub struct ChannelDispatcher {
    tx: mpsc::UnboundedSender<Job>,
}

/// Receiving end of a [`ChannelDispatcher`]
pub struct DispatchQueue {
    rx: mpsc::UnboundedReceiver<Job>,
}

impl ChannelDispatcher {
    /// Create a dispatcher and the queue its callbacks land on
    pub fn new() -> (Self, DispatchQueue) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, DispatchQueue { rx })
    }
}

impl Dispatcher for ChannelDispatcher {
    fn dispatch(&self, job: Job) {
        // The host went away; nobody is left to notify
        let _ = self.tx.send(job);
    }
}

impl DispatchQueue {
    /// Wait for the next callback and run it. Returns false once every
    /// dispatcher has been dropped.
    pub async fn run_next(&mut self) -> bool {
        match self.rx.recv().await {
            Some(job) => {
                job();
                true
            }
            None => false,
        }
    }

    /// Run all callbacks already queued
    pub fn drain(&mut self) -> usize {
        let mut ran = 0;
        while let Ok(job) = self.rx.try_recv() {
            job();
            ran += 1;
        }
        ran
    }
}
