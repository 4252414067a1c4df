//! Session supervisor: the outer control loop.
//!
//! One capture session covers every enumerated frame source. The supervisor
//! walks `Starting -> Capturing -> Draining -> Restarting -> Starting ...`
//! until its shutdown token is cancelled:
//!
//! 1. Starting: load configuration, connect the bus, start the worker pool,
//!    then bring up every source (features, buffers, callback, acquisition).
//! 2. Capturing: a 1-second tick checks for configuration changes and the
//!    no-images watchdog, and drives the health monitor.
//! 3. Draining: halt the queue, join the workers, stop every source.
//! 4. Restarting: log, back off one second, start over. Nothing escapes
//!    this loop; the process is self-healing against transient faults.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use chrono::Utc;

use crate::bus::MessageBus;
use crate::config::{CaptureSettings, ConfigStore};
use crate::driver::{
    FeatureValue, FrameCallback, FrameEvent, FrameSource, FrameSourceDriver, CMD_ACQUISITION_START,
};
use crate::frame::{FrameStatus, RawFrameItem};
use crate::queue::{FrameQueue, PushResult};
use crate::telemetry::{HealthMonitor, SourceTelemetry};
use crate::worker::EncoderPool;

const TICK_INTERVAL: Duration = Duration::from_secs(1);
const RESTART_BACKOFF: Duration = Duration::from_secs(1);

/// Cooperative cancellation handle. Created at process start; the signal
/// handler only cancels the token, the supervisor observes it.
#[derive(Clone, Default)]
pub struct ShutdownToken {
    cancelled: Arc<AtomicBool>,
}

impl ShutdownToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Why a capture session ended.
pub enum SessionOutcome {
    /// The shutdown token was cancelled; leave the supervisor loop.
    Shutdown,
    /// Tear down and start over, with the trigger named.
    Restart(&'static str),
}

/// Connects (or reconnects) the bus at the start of every session.
pub type BusConnector = Box<dyn Fn(&mut ConfigStore) -> Result<Arc<dyn MessageBus>> + Send>;

/// One opened, capturing frame source.
struct SessionState {
    source: Box<dyn FrameSource>,
    telemetry: Arc<SourceTelemetry>,
}

pub struct Supervisor {
    driver: Arc<dyn FrameSourceDriver>,
    bus_connector: BusConnector,
    config_path: PathBuf,
    token: ShutdownToken,
    /// Per-source frame counters. Owned here, outside any session, so they
    /// stay monotonic and are never reused across restarts.
    counters: HashMap<String, Arc<AtomicU64>>,
}

impl Supervisor {
    pub fn new(
        driver: Arc<dyn FrameSourceDriver>,
        bus_connector: BusConnector,
        config_path: impl Into<PathBuf>,
        token: ShutdownToken,
    ) -> Self {
        Self {
            driver,
            bus_connector,
            config_path: config_path.into(),
            token,
            counters: HashMap::new(),
        }
    }

    /// Run until the shutdown token is cancelled. Session errors are logged
    /// and answered with a restart after a fixed backoff; they never
    /// propagate out of this loop.
    pub fn run(&mut self) -> Result<()> {
        while !self.token.is_cancelled() {
            match self.run_session() {
                Ok(SessionOutcome::Shutdown) => break,
                Ok(SessionOutcome::Restart(reason)) => {
                    log::warn!("capture session restarting ({})", reason);
                }
                Err(err) => {
                    log::error!("capture session error: {:#}", err);
                    if self.token.is_cancelled() {
                        break;
                    }
                    thread::sleep(RESTART_BACKOFF);
                }
            }
        }
        log::info!("supervisor stopped");
        Ok(())
    }

    /// One full session: bring-up, supervision, drain. The drain runs
    /// whether bring-up or supervision succeeded or failed.
    fn run_session(&mut self) -> Result<SessionOutcome> {
        let mut store = ConfigStore::open(&self.config_path)?;
        let settings = CaptureSettings::load(&mut store)?;
        let bus = (self.bus_connector)(&mut store)?;

        log::info!("starting frame source driver ({})", self.driver.version());
        self.driver.startup()?;

        let queue = Arc::new(FrameQueue::new(
            settings.queue_capacity,
            settings.overflow_policy,
        ));
        let mut sessions: Vec<SessionState> = Vec::new();
        let mut pool: Option<EncoderPool> = None;

        let result = self.run_capture(&mut store, &settings, bus, &queue, &mut sessions, &mut pool);

        // Draining: halt first so workers and any blocked producers wake,
        // then join, then stop the sources.
        queue.halt();
        if let Some(pool) = pool.take() {
            pool.join();
        }
        for session in &mut sessions {
            if let Err(err) = session.source.stop() {
                log::warn!("failed to stop {}: {:#}", session.source.id(), err);
            }
        }
        if let Err(err) = self.driver.shutdown() {
            log::warn!("driver shutdown failed: {:#}", err);
        }

        result
    }

    fn run_capture(
        &mut self,
        store: &mut ConfigStore,
        settings: &CaptureSettings,
        bus: Arc<dyn MessageBus>,
        queue: &Arc<FrameQueue<RawFrameItem>>,
        sessions: &mut Vec<SessionState>,
        pool: &mut Option<EncoderPool>,
    ) -> Result<SessionOutcome> {
        let descriptors = self.driver.enumerate()?;
        if descriptors.is_empty() {
            bail!("no frame sources found");
        }
        log::info!(
            "found {} frame source{}:",
            descriptors.len(),
            if descriptors.len() == 1 { "" } else { "s" }
        );
        for descriptor in &descriptors {
            log::info!("  {} : {}", descriptor.id, descriptor.model);
        }

        let mut telemetry: HashMap<String, Arc<SourceTelemetry>> = HashMap::new();
        for descriptor in &descriptors {
            telemetry.insert(
                descriptor.id.clone(),
                Arc::new(SourceTelemetry::new(&descriptor.id)),
            );
        }

        // Workers start before capture so no frame ever arrives without a
        // consumer ready to dequeue it.
        *pool = Some(EncoderPool::spawn(
            settings.thread_count,
            queue.clone(),
            bus,
            settings.encoder(),
            telemetry.clone(),
        ));

        let buffer_count = (settings.total_buffer_count / descriptors.len()).max(1);
        for descriptor in &descriptors {
            let mut source = self.driver.open(&descriptor.id)?;

            for (name, raw) in &settings.source_parameters {
                log::info!("{} = {}", name, raw);
                let data_type = source.feature_type(name)?;
                let value = FeatureValue::decode(raw, data_type)
                    .map_err(|err| err.context(format!("feature \"{}\"", name)))?;
                source.set_feature(name, value)?;
            }

            let payload_size = source.payload_size()?;
            log::info!("source {}: payload size = {}", descriptor.id, payload_size);
            source.announce_buffers(buffer_count, payload_size)?;

            let counter = self
                .counters
                .entry(descriptor.id.clone())
                .or_default()
                .clone();
            let source_telemetry = telemetry[&descriptor.id].clone();
            source.set_frame_callback(frame_callback(
                descriptor.id.clone(),
                queue.clone(),
                source_telemetry.clone(),
                counter,
            ));

            source.start_capture()?;
            source.queue_buffers()?;
            source.run_command(CMD_ACQUISITION_START)?;

            sessions.push(SessionState {
                source,
                telemetry: source_telemetry,
            });
        }

        // Persist any defaults materialized during this attempt; otherwise
        // re-baseline so our own state does not read as an external edit.
        if store.is_dirty() {
            store.save()?;
        } else {
            store.refresh()?;
        }

        self.supervise(store, settings, sessions)
    }

    /// The Capturing state: 1-second tick on absolute deadlines.
    fn supervise(
        &self,
        store: &mut ConfigStore,
        settings: &CaptureSettings,
        sessions: &[SessionState],
    ) -> Result<SessionOutcome> {
        let monitor = HealthMonitor::new(settings.sensor_toggles());
        let session_started = Instant::now();
        let mut next_tick = Instant::now() + TICK_INTERVAL;
        let mut last_tick = Instant::now();

        loop {
            if self.token.is_cancelled() {
                return Ok(SessionOutcome::Shutdown);
            }
            if let Some(wait) = next_tick.checked_duration_since(Instant::now()) {
                thread::sleep(wait);
            }
            next_tick += TICK_INTERVAL;
            if self.token.is_cancelled() {
                return Ok(SessionOutcome::Shutdown);
            }

            let elapsed_s = last_tick.elapsed().as_secs_f64();
            last_tick = Instant::now();

            if store.refresh()? {
                log::info!("configuration changed, starting over");
                return Ok(SessionOutcome::Restart("config changed"));
            }

            if let Some(timeout) = settings.no_images_timeout {
                let newest = sessions
                    .iter()
                    .filter_map(|session| session.telemetry.last_successful())
                    .max();
                let idle = newest
                    .map(|at| at.elapsed())
                    .unwrap_or_else(|| session_started.elapsed());
                if idle > timeout {
                    log::warn!(
                        "no image received in {} s, starting over",
                        idle.as_secs()
                    );
                    return Ok(SessionOutcome::Restart("no images"));
                }
            }

            for session in sessions {
                monitor.emit(elapsed_s, &session.telemetry, session.source.as_ref());
            }
        }
    }
}

/// Build the frame-delivery callback for one source. Runs on the driver's
/// delivery thread: stamp, count, hand off. Nothing heavier belongs here.
fn frame_callback(
    source_id: String,
    queue: Arc<FrameQueue<RawFrameItem>>,
    telemetry: Arc<SourceTelemetry>,
    counter: Arc<AtomicU64>,
) -> FrameCallback {
    Box::new(move |event: FrameEvent| {
        let sequence = counter.fetch_add(1, Ordering::Relaxed);
        match event.status {
            FrameStatus::Complete => {
                telemetry.record_complete();
                let item = RawFrameItem {
                    source_id: source_id.clone(),
                    pixels: event.data,
                    pixel_format: event.pixel_format,
                    rows: event.rows,
                    cols: event.cols,
                    timestamp: Utc::now(),
                    counter: sequence,
                };
                match queue.push(item) {
                    PushResult::Queued | PushResult::Halted => {}
                    PushResult::DroppedOldest | PushResult::DroppedNewest => {
                        telemetry.record_dropped();
                    }
                }
            }
            FrameStatus::Incomplete => telemetry.record_incomplete(),
            FrameStatus::TooSmall => log::error!("{}: frame buffer too small", source_id),
            FrameStatus::Invalid => log::error!("{}: frame buffer not valid", source_id),
        }
    })
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
