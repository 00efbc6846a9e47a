//! Thread boundary between the pipeline and its consumer.
//!
//! The pipeline reports request lifecycle events over a bounded channel.
//! The consumer — the HAL framework in production, the demo binary or a
//! test harness here — also plays the fence producer: every
//! [`ResultEvent::FenceArmed`] announces a fence some hardware block is
//! expected to signal.

use crate::fence::Fence;
use crossbeam_channel::Receiver;
use std::time::Duration;

/// Messages sent from the pipeline to the consumer thread.
#[derive(Debug, Clone)]
pub enum ResultEvent {
    /// A node armed a fence for `request`; the producer should signal it
    /// when the corresponding hardware work finishes.
    FenceArmed {
        request: u64,
        label: String,
        fence: Fence,
    },

    /// Stream configuration completed for `request`.
    StreamConfigured { request: u64 },

    /// Early (partial) metadata is available for `request`.
    PartialMetadata { request: u64 },

    /// Final metadata for `request`. Fired exactly once per request;
    /// `error` selects between real and default/error content.
    Metadata { request: u64, error: bool },

    /// All output buffers for `request` are filled (or failed).
    BuffersReady { request: u64, error: bool },

    /// Every node finished `request`; its slot is reusable.
    RequestComplete { request: u64, error: bool },

    /// The pipeline is shutting down.
    Shutdown,
}

/// Consumer-side handle for pipeline events.
pub struct PipelineBridge {
    pub msg_rx: Receiver<ResultEvent>,
}

impl PipelineBridge {
    pub(crate) fn new(msg_rx: Receiver<ResultEvent>) -> Self {
        Self { msg_rx }
    }

    /// Drain all pending events without blocking.
    pub fn drain(&self) -> Vec<ResultEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.msg_rx.try_recv() {
            events.push(event);
        }
        events
    }

    /// Try to receive a single event without blocking.
    pub fn try_recv(&self) -> Option<ResultEvent> {
        self.msg_rx.try_recv().ok()
    }

    /// Receive a single event, waiting up to `timeout`.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<ResultEvent> {
        self.msg_rx.recv_timeout(timeout).ok()
    }
}
