//! Per-source health telemetry.
//!
//! The frame-delivery callback updates atomic counters on the hot path; the
//! supervisor's 1-second tick exchanges them for zero and turns the counts
//! into rates. The only mutex-guarded state is the last-successful-frame
//! instant, touched once per published frame and once per watchdog check.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use crate::driver::FrameSource;

/// Sensor features sampled by the health tick.
pub const FEATURE_TEMPERATURE: &str = "DeviceTemperature";
pub const FEATURE_EXPOSURE_TIME: &str = "ExposureTime";
pub const FEATURE_GAIN: &str = "Gain";

/// Which sensor readings the health line includes.
#[derive(Clone, Copy, Debug)]
pub struct SensorToggles {
    pub temperature: bool,
    pub exposure_time: bool,
    pub gain: bool,
}

/// Counters and timestamps for one frame source.
///
/// Shared between the delivery callback (producer side), the encoding
/// workers (publish side) and the supervisor tick (reader side).
pub struct SourceTelemetry {
    source_id: String,
    complete: AtomicU64,
    incomplete: AtomicU64,
    dropped: AtomicU64,
    first_complete_seen: AtomicBool,
    first_incomplete_seen: AtomicBool,
    last_successful: Mutex<Option<Instant>>,
}

impl SourceTelemetry {
    pub fn new(source_id: &str) -> Self {
        Self {
            source_id: source_id.to_string(),
            complete: AtomicU64::new(0),
            incomplete: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            first_complete_seen: AtomicBool::new(false),
            first_incomplete_seen: AtomicBool::new(false),
            last_successful: Mutex::new(None),
        }
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    /// Called by the delivery callback for every complete frame.
    pub fn record_complete(&self) {
        self.complete.fetch_add(1, Ordering::Relaxed);
        if !self.first_complete_seen.swap(true, Ordering::Relaxed) {
            log::info!("{}: First frame received", self.source_id);
        }
    }

    /// Called by the delivery callback for every incomplete frame.
    pub fn record_incomplete(&self) {
        self.incomplete.fetch_add(1, Ordering::Relaxed);
        if !self.first_incomplete_seen.swap(true, Ordering::Relaxed) {
            log::info!("{}: First incomplete frame received", self.source_id);
        }
    }

    /// Called when the hand-off queue discarded a frame on overflow.
    pub fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Called by a worker after a frame was encoded and published.
    pub fn mark_published(&self) {
        if let Ok(mut guard) = self.last_successful.lock() {
            *guard = Some(Instant::now());
        }
    }

    /// Instant of the most recent published frame, read by the watchdog.
    pub fn last_successful(&self) -> Option<Instant> {
        self.last_successful.lock().ok().and_then(|guard| *guard)
    }

    /// Exchange-and-reset this tick's (complete, incomplete, dropped) counts.
    pub fn take_tick_counts(&self) -> TickCounts {
        TickCounts {
            complete: self.complete.swap(0, Ordering::Relaxed),
            incomplete: self.incomplete.swap(0, Ordering::Relaxed),
            dropped: self.dropped.swap(0, Ordering::Relaxed),
        }
    }

    /// Whether any complete frame was ever seen on this source.
    pub fn has_seen_frames(&self) -> bool {
        self.first_complete_seen.load(Ordering::Relaxed)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TickCounts {
    pub complete: u64,
    pub incomplete: u64,
    pub dropped: u64,
}

/// Emits the per-source health line each supervision tick.
pub struct HealthMonitor {
    toggles: SensorToggles,
}

impl HealthMonitor {
    pub fn new(toggles: SensorToggles) -> Self {
        Self { toggles }
    }

    /// One tick for one source: exchange the counters, compute rates over
    /// the measured interval, sample enabled sensor features, log one line.
    pub fn emit(&self, elapsed_s: f64, telemetry: &SourceTelemetry, source: &dyn FrameSource) {
        let counts = telemetry.take_tick_counts();
        let elapsed_s = if elapsed_s > 0.0 { elapsed_s } else { 1.0 };
        let fps = counts.complete as f64 / elapsed_s;

        let mut line = format!("{}: FPS {:.2}", telemetry.source_id(), fps);
        if counts.incomplete > 0 {
            let incomplete_fps = counts.incomplete as f64 / elapsed_s;
            let _ = write!(line, ", incomplete FPS {:.2}", incomplete_fps);
        }
        if counts.dropped > 0 {
            let _ = write!(line, ", dropped {}", counts.dropped);
        }
        for (enabled, label, feature) in [
            (self.toggles.temperature, "temperature", FEATURE_TEMPERATURE),
            (self.toggles.exposure_time, "exposure", FEATURE_EXPOSURE_TIME),
            (self.toggles.gain, "gain", FEATURE_GAIN),
        ] {
            if !enabled {
                continue;
            }
            match source.get_feature(feature) {
                Ok(value) => {
                    let _ = write!(line, ", {} {:.2}", label, value);
                }
                Err(err) => log::debug!(
                    "{}: failed to read {}: {:#}",
                    telemetry.source_id(),
                    feature,
                    err
                ),
            }
        }
        log::info!("{}", line);
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
