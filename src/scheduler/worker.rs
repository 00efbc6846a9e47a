//! Worker pool executing resolved node stages.
//!
//! A fixed set of threads drains a shared job channel. A stage callback
//! runs to completion on whichever thread picks it up; suspension only
//! happens at stage boundaries, by the node returning a dependency unit
//! instead of blocking.

use crate::ids::NodeId;
use crate::scheduler::dependency::Stage;
use crossbeam_channel::Receiver;
use std::thread::JoinHandle;

/// One runnable (node, request, stage) invocation.
#[derive(Debug, Clone)]
pub struct Job {
    pub node: NodeId,
    pub request: u64,
    pub stage: Stage,
    /// When set, the request failed (fence error or flush) and the node
    /// must take its error branch: emit default output and complete.
    pub error_path: bool,
}

/// Fixed pool of stage-execution threads.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `threads` workers draining `rx`. Workers exit when every
    /// sender is dropped.
    pub fn spawn<F>(threads: usize, rx: Receiver<Job>, handler: F) -> Self
    where
        F: Fn(Job) + Send + Clone + 'static,
    {
        let mut handles = Vec::with_capacity(threads);
        for i in 0..threads {
            let rx = rx.clone();
            let handler = handler.clone();
            let handle = std::thread::Builder::new()
                .name(format!("framesched-worker-{}", i))
                .spawn(move || {
                    tracing::debug!("worker thread started");
                    while let Ok(job) = rx.recv() {
                        handler(job);
                    }
                    tracing::debug!("worker thread exiting");
                })
                .expect("failed to spawn worker thread");
            handles.push(handle);
        }
        Self { handles }
    }

    pub fn thread_count(&self) -> usize {
        self.handles.len()
    }

    /// Wait for every worker to exit. Callers must drop all job senders
    /// first or this blocks forever.
    pub fn join(self) {
        for handle in self.handles {
            let _ = handle.join();
        }
    }
}
