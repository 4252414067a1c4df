//! Frame-source driver interface.
//!
//! The vendor driver is an external collaborator: this module defines the
//! capability surface the supervisor needs (enumeration, typed feature
//! access, buffer announcement, capture control, asynchronous frame
//! delivery) and a synthetic in-process backend used by tests and
//! `stub://` demo runs.
//!
//! Frame delivery is modeled as a plain callback registered per source; the
//! driver invokes it from its own delivery thread, once per arriving frame.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};

use crate::frame::{FrameStatus, PixelFormat};

/// Name of the command that begins acquisition on an opened source.
pub const CMD_ACQUISITION_START: &str = "AcquisitionStart";

/// Data type of a driver feature, as reported by the driver.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FeatureType {
    Int,
    Float,
    Enum,
    Str,
    Bool,
    /// Reported by the driver for types this pipeline cannot set
    /// (commands, raw registers). Rejected explicitly at decode time.
    Unknown,
}

/// A typed feature value, decoded once per configured key.
#[derive(Clone, Debug, PartialEq)]
pub enum FeatureValue {
    Int(i64),
    Float(f64),
    Enum(String),
    Str(String),
    Bool(bool),
}

impl FeatureValue {
    /// Decode a raw configuration string against the driver-reported type.
    ///
    /// An `Unknown` type is an explicit error: applying a value of a type we
    /// cannot represent is fatal to the session attempt.
    pub fn decode(raw: &str, data_type: FeatureType) -> Result<Self> {
        let raw = raw.trim();
        match data_type {
            FeatureType::Int => Ok(FeatureValue::Int(
                raw.parse()
                    .with_context(|| format!("\"{}\" is not an integer", raw))?,
            )),
            FeatureType::Float => Ok(FeatureValue::Float(
                raw.parse()
                    .with_context(|| format!("\"{}\" is not a number", raw))?,
            )),
            FeatureType::Enum => Ok(FeatureValue::Enum(raw.to_string())),
            FeatureType::Str => Ok(FeatureValue::Str(raw.to_string())),
            FeatureType::Bool => {
                if let Ok(numeric) = raw.parse::<i64>() {
                    Ok(FeatureValue::Bool(numeric != 0))
                } else {
                    Ok(FeatureValue::Bool(raw.parse().with_context(|| {
                        format!("\"{}\" is not a boolean", raw)
                    })?))
                }
            }
            FeatureType::Unknown => bail!("unsupported feature data type"),
        }
    }
}

/// One frame delivery, handed to the registered callback.
pub struct FrameEvent {
    pub rows: u32,
    pub cols: u32,
    pub pixel_format: PixelFormat,
    pub status: FrameStatus,
    /// Raw payload. Empty for non-complete deliveries.
    pub data: Vec<u8>,
}

/// Callback invoked by the driver for every arriving frame.
pub type FrameCallback = Box<dyn Fn(FrameEvent) + Send + Sync>;

/// Identity of an enumerated source.
#[derive(Clone, Debug)]
pub struct SourceDescriptor {
    pub id: String,
    pub model: String,
}

/// Driver connection: enumeration and source lifecycle.
pub trait FrameSourceDriver: Send + Sync {
    /// Driver/SDK version string, logged at session start.
    fn version(&self) -> String;

    /// Bring the driver up. Called once per capture session.
    fn startup(&self) -> Result<()>;

    fn enumerate(&self) -> Result<Vec<SourceDescriptor>>;

    fn open(&self, id: &str) -> Result<Box<dyn FrameSource>>;

    /// Tear the driver down. Called during session drain.
    fn shutdown(&self) -> Result<()>;
}

/// One opened frame source.
pub trait FrameSource: Send {
    fn id(&self) -> &str;

    /// Driver-reported data type of a feature, for typed set dispatch.
    fn feature_type(&self, name: &str) -> Result<FeatureType>;

    fn set_feature(&mut self, name: &str, value: FeatureValue) -> Result<()>;

    /// Read a numeric feature (sensor readings: temperature, exposure, gain).
    fn get_feature(&self, name: &str) -> Result<f64>;

    /// Byte size of one raw frame buffer for the current configuration.
    fn payload_size(&self) -> Result<usize>;

    fn announce_buffers(&mut self, count: usize, payload_size: usize) -> Result<()>;

    fn set_frame_callback(&mut self, callback: FrameCallback);

    fn start_capture(&mut self) -> Result<()>;

    /// Hand the announced buffers to the driver for filling.
    fn queue_buffers(&mut self) -> Result<()>;

    fn run_command(&mut self, name: &str) -> Result<()>;

    /// Stop delivery and release buffers. Idempotent.
    fn stop(&mut self) -> Result<()>;
}

// ----------------------------------------------------------------------------
// Synthetic driver (stub:// sources) for tests and demo runs
// ----------------------------------------------------------------------------

/// Script for one synthetic source.
#[derive(Clone)]
pub struct SyntheticSourceSpec {
    pub id: String,
    pub model: String,
    pub rows: u32,
    pub cols: u32,
    pub pixel_format: PixelFormat,
    /// Delay between frame deliveries.
    pub frame_interval: Duration,
    /// Total deliveries per capture run; `None` runs until stopped.
    pub frame_limit: Option<u64>,
    /// Every Nth delivery (1-based) arrives incomplete.
    pub incomplete_every: Option<u64>,
    /// Readable sensor features and their values.
    pub features: HashMap<String, f64>,
    /// Feature name to type map for `set_feature` dispatch.
    pub feature_types: HashMap<String, FeatureType>,
}

impl Default for SyntheticSourceSpec {
    fn default() -> Self {
        let mut features = HashMap::new();
        features.insert("DeviceTemperature".to_string(), 35.0);
        features.insert("ExposureTime".to_string(), 10_000.0);
        features.insert("Gain".to_string(), 0.0);
        Self {
            id: "stub://camera-0".to_string(),
            model: "Synthetic".to_string(),
            rows: 480,
            cols: 640,
            pixel_format: PixelFormat::Mono8,
            frame_interval: Duration::from_millis(100),
            frame_limit: None,
            incomplete_every: None,
            features,
            feature_types: HashMap::new(),
        }
    }
}

/// In-process driver producing a scripted stream of synthetic frames.
pub struct SyntheticDriver {
    specs: Vec<SyntheticSourceSpec>,
    open_count: AtomicUsize,
}

impl SyntheticDriver {
    pub fn new(specs: Vec<SyntheticSourceSpec>) -> Self {
        Self {
            specs,
            open_count: AtomicUsize::new(0),
        }
    }

    /// How many times any source has been opened. Grows across session
    /// restarts; used by tests to observe supervisor behavior.
    pub fn open_count(&self) -> usize {
        self.open_count.load(Ordering::SeqCst)
    }
}

impl FrameSourceDriver for SyntheticDriver {
    fn version(&self) -> String {
        format!("synthetic {}", env!("CARGO_PKG_VERSION"))
    }

    fn startup(&self) -> Result<()> {
        Ok(())
    }

    fn enumerate(&self) -> Result<Vec<SourceDescriptor>> {
        Ok(self
            .specs
            .iter()
            .map(|spec| SourceDescriptor {
                id: spec.id.clone(),
                model: spec.model.clone(),
            })
            .collect())
    }

    fn open(&self, id: &str) -> Result<Box<dyn FrameSource>> {
        let spec = self
            .specs
            .iter()
            .find(|spec| spec.id == id)
            .ok_or_else(|| anyhow!("unknown frame source \"{}\"", id))?;
        self.open_count.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(SyntheticSource::new(spec.clone())))
    }

    fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}

struct SyntheticSource {
    spec: SyntheticSourceSpec,
    callback: Option<Arc<dyn Fn(FrameEvent) + Send + Sync>>,
    announced_buffers: usize,
    capture_started: bool,
    running: Arc<AtomicBool>,
    generator: Option<JoinHandle<()>>,
}

impl SyntheticSource {
    fn new(spec: SyntheticSourceSpec) -> Self {
        Self {
            spec,
            callback: None,
            announced_buffers: 0,
            capture_started: false,
            running: Arc::new(AtomicBool::new(false)),
            generator: None,
        }
    }

    /// Fill a frame with a pattern that varies per delivery, in the shape of
    /// a static scene with slow drift.
    fn generate_pixels(spec: &SyntheticSourceSpec, sequence: u64) -> Vec<u8> {
        let len = (spec.rows * spec.cols) as usize;
        let mut pixels = vec![0u8; len];
        for (i, pixel) in pixels.iter_mut().enumerate() {
            *pixel = ((i as u64 + sequence) % 256) as u8;
        }
        pixels
    }
}

impl FrameSource for SyntheticSource {
    fn id(&self) -> &str {
        &self.spec.id
    }

    fn feature_type(&self, name: &str) -> Result<FeatureType> {
        if let Some(data_type) = self.spec.feature_types.get(name) {
            return Ok(*data_type);
        }
        if self.spec.features.contains_key(name) {
            return Ok(FeatureType::Float);
        }
        bail!("feature \"{}\" not found on {}", name, self.spec.id)
    }

    fn set_feature(&mut self, name: &str, value: FeatureValue) -> Result<()> {
        // Validate the name the way a real driver would; the value itself
        // has no effect on the synthetic stream.
        self.feature_type(name)?;
        if let FeatureValue::Float(numeric) = value {
            self.spec.features.insert(name.to_string(), numeric);
        }
        Ok(())
    }

    fn get_feature(&self, name: &str) -> Result<f64> {
        self.spec
            .features
            .get(name)
            .copied()
            .ok_or_else(|| anyhow!("feature \"{}\" not found on {}", name, self.spec.id))
    }

    fn payload_size(&self) -> Result<usize> {
        Ok((self.spec.rows * self.spec.cols) as usize)
    }

    fn announce_buffers(&mut self, count: usize, payload_size: usize) -> Result<()> {
        if count == 0 {
            bail!("buffer count must be at least 1");
        }
        if payload_size != self.payload_size()? {
            bail!(
                "announced payload size {} does not match source payload size {}",
                payload_size,
                self.payload_size()?
            );
        }
        self.announced_buffers = count;
        Ok(())
    }

    fn set_frame_callback(&mut self, callback: FrameCallback) {
        self.callback = Some(Arc::from(callback));
    }

    fn start_capture(&mut self) -> Result<()> {
        if self.announced_buffers == 0 {
            bail!("start_capture before any buffer was announced");
        }
        if self.callback.is_none() {
            bail!("start_capture before a frame callback was registered");
        }
        self.capture_started = true;
        Ok(())
    }

    fn queue_buffers(&mut self) -> Result<()> {
        if !self.capture_started {
            bail!("queue_buffers before start_capture");
        }
        Ok(())
    }

    fn run_command(&mut self, name: &str) -> Result<()> {
        if name != CMD_ACQUISITION_START {
            bail!("unknown command \"{}\"", name);
        }
        if !self.capture_started {
            bail!("{} before start_capture", CMD_ACQUISITION_START);
        }
        if self.generator.is_some() {
            return Ok(());
        }

        let spec = self.spec.clone();
        let callback = self
            .callback
            .clone()
            .ok_or_else(|| anyhow!("no frame callback registered"))?;
        self.running.store(true, Ordering::SeqCst);
        let running = self.running.clone();

        let handle = thread::Builder::new()
            .name(format!("synthetic-{}", spec.id))
            .spawn(move || {
                let mut sequence: u64 = 0;
                loop {
                    if !running.load(Ordering::SeqCst) {
                        break;
                    }
                    sequence += 1;
                    if let Some(limit) = spec.frame_limit {
                        if sequence > limit {
                            break;
                        }
                    }
                    thread::sleep(spec.frame_interval);
                    let incomplete = spec
                        .incomplete_every
                        .map(|every| sequence % every == 0)
                        .unwrap_or(false);
                    let event = if incomplete {
                        FrameEvent {
                            rows: spec.rows,
                            cols: spec.cols,
                            pixel_format: spec.pixel_format,
                            status: FrameStatus::Incomplete,
                            data: Vec::new(),
                        }
                    } else {
                        FrameEvent {
                            rows: spec.rows,
                            cols: spec.cols,
                            pixel_format: spec.pixel_format,
                            status: FrameStatus::Complete,
                            data: Self::generate_pixels(&spec, sequence),
                        }
                    };
                    callback(event);
                }
            })
            .expect("failed to spawn synthetic frame generator");
        self.generator = Some(handle);
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.generator.take() {
            let _ = handle.join();
        }
        self.capture_started = false;
        Ok(())
    }
}

impl Drop for SyntheticSource {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
