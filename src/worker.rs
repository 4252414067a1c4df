//! Encoding worker pool.
//!
//! N long-lived threads drain the hand-off queue: convert, compress,
//! publish, touch the source's last-successful-frame instant. A worker never
//! exits on a per-item failure; everything surfaces through the log stream.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::bus::MessageBus;
use crate::encode::{self, EncoderSettings};
use crate::frame::RawFrameItem;
use crate::queue::FrameQueue;
use crate::telemetry::SourceTelemetry;

/// How long a worker waits on the queue before re-checking its loop
/// condition. A timeout is a liveness check, not an error.
const POP_TIMEOUT: Duration = Duration::from_secs(1);

pub struct EncoderPool {
    handles: Vec<JoinHandle<()>>,
}

impl EncoderPool {
    /// Spawn `count` workers over the shared queue. Call before capture
    /// starts so the first delivered frame already has a consumer.
    pub fn spawn(
        count: usize,
        queue: Arc<FrameQueue<RawFrameItem>>,
        bus: Arc<dyn MessageBus>,
        settings: EncoderSettings,
        telemetry: HashMap<String, Arc<SourceTelemetry>>,
    ) -> Self {
        let mut handles = Vec::with_capacity(count);
        for index in 0..count {
            let queue = queue.clone();
            let bus = bus.clone();
            let settings = settings.clone();
            let telemetry = telemetry.clone();
            let handle = thread::Builder::new()
                .name(format!("encode-{}", index))
                .spawn(move || worker_loop(queue, bus, settings, telemetry))
                .expect("failed to spawn encoding worker");
            handles.push(handle);
        }
        Self { handles }
    }

    pub fn worker_count(&self) -> usize {
        self.handles.len()
    }

    /// Wait for every worker to exit. Returns promptly once the queue has
    /// been halted.
    pub fn join(self) {
        for handle in self.handles {
            let _ = handle.join();
        }
    }
}

fn worker_loop(
    queue: Arc<FrameQueue<RawFrameItem>>,
    bus: Arc<dyn MessageBus>,
    settings: EncoderSettings,
    telemetry: HashMap<String, Arc<SourceTelemetry>>,
) {
    while queue.is_enabled() {
        let Some(item) = queue.pop(POP_TIMEOUT) else {
            continue;
        };
        match encode::encode_frame(&item, &settings) {
            Ok(message) => match bus.send(&message) {
                Ok(()) => {
                    if let Some(source) = telemetry.get(&item.source_id) {
                        source.mark_published();
                    }
                }
                Err(err) => log::error!("failed to publish {}: {:#}", message.id, err),
            },
            Err(err) => log::error!(
                "failed to encode frame {} from {}: {:#}",
                item.counter,
                item.source_id,
                err
            ),
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
