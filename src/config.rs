//! Configuration store and capture settings.
//!
//! The store is a TOML file with get-or-set semantics: reading a key that is
//! missing writes the default back into the document and marks the store
//! dirty, so a freshly deployed daemon materializes its full configuration
//! surface on first run. `refresh()` re-reads the file and reports whether it
//! changed on disk; the supervisor uses that as its live-reconfiguration
//! trigger.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use toml::{Table, Value};

use crate::encode::{EncoderSettings, ImageFormat};
use crate::queue::OverflowPolicy;
use crate::telemetry::SensorToggles;

const SECTION_ENCODING: &str = "ImageEncoding";
const SECTION_BUFFERS: &str = "FrameBuffers";
const SECTION_OPERATION: &str = "Operation";
const SECTION_LOGGING: &str = "Logging";
/// Arbitrary feature key/values applied verbatim to every source at startup.
const SECTION_SOURCE_PARAMETERS: &str = "SourceParameters";

const DEFAULT_IMAGE_FORMAT: &str = "jpg";
const DEFAULT_JPEG_QUALITY: i64 = 90;
const DEFAULT_TOTAL_BUFFER_COUNT: i64 = 100;
const DEFAULT_QUEUE_CAPACITY: i64 = 256;
const DEFAULT_OVERFLOW_POLICY: &str = "drop-oldest";
const DEFAULT_NO_IMAGES_TIMEOUT_S: f64 = 10.0;

/// Typed key/value persistence over a TOML document.
pub struct ConfigStore {
    path: PathBuf,
    table: Table,
    /// Raw file text as last loaded or saved; the change-detection baseline.
    snapshot: String,
    dirty: bool,
}

impl ConfigStore {
    /// Open the store. A missing file starts as an empty document; the first
    /// `save()` creates it.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let snapshot = read_or_empty(&path)?;
        let table = snapshot
            .parse::<Table>()
            .with_context(|| format!("invalid config file {}", path.display()))?;
        Ok(Self {
            path,
            table,
            snapshot,
            dirty: false,
        })
    }

    fn section_mut(&mut self, section: &str) -> Result<&mut Table> {
        let entry = self
            .table
            .entry(section.to_string())
            .or_insert_with(|| Value::Table(Table::new()));
        entry
            .as_table_mut()
            .ok_or_else(|| anyhow!("config section \"{}\" is not a table", section))
    }

    pub fn get_or_set_str(&mut self, section: &str, key: &str, default: &str) -> Result<String> {
        let table = self.section_mut(section)?;
        match table.get(key) {
            Some(Value::String(value)) => Ok(value.clone()),
            Some(other) => bail!(
                "config key {}.{} has type {}, expected string",
                section,
                key,
                other.type_str()
            ),
            None => {
                table.insert(key.to_string(), Value::String(default.to_string()));
                self.dirty = true;
                Ok(default.to_string())
            }
        }
    }

    pub fn get_or_set_i64(&mut self, section: &str, key: &str, default: i64) -> Result<i64> {
        let table = self.section_mut(section)?;
        match table.get(key) {
            Some(Value::Integer(value)) => Ok(*value),
            Some(other) => bail!(
                "config key {}.{} has type {}, expected integer",
                section,
                key,
                other.type_str()
            ),
            None => {
                table.insert(key.to_string(), Value::Integer(default));
                self.dirty = true;
                Ok(default)
            }
        }
    }

    pub fn get_or_set_f64(&mut self, section: &str, key: &str, default: f64) -> Result<f64> {
        let table = self.section_mut(section)?;
        match table.get(key) {
            Some(Value::Float(value)) => Ok(*value),
            Some(Value::Integer(value)) => Ok(*value as f64),
            Some(other) => bail!(
                "config key {}.{} has type {}, expected number",
                section,
                key,
                other.type_str()
            ),
            None => {
                table.insert(key.to_string(), Value::Float(default));
                self.dirty = true;
                Ok(default)
            }
        }
    }

    pub fn get_or_set_bool(&mut self, section: &str, key: &str, default: bool) -> Result<bool> {
        let table = self.section_mut(section)?;
        match table.get(key) {
            Some(Value::Boolean(value)) => Ok(*value),
            Some(other) => bail!(
                "config key {}.{} has type {}, expected boolean",
                section,
                key,
                other.type_str()
            ),
            None => {
                table.insert(key.to_string(), Value::Boolean(default));
                self.dirty = true;
                Ok(default)
            }
        }
    }

    /// All keys of a section with their values rendered as strings, for
    /// passthrough dispatch. Missing section yields an empty list.
    pub fn string_pairs(&self, section: &str) -> Result<Vec<(String, String)>> {
        let Some(value) = self.table.get(section) else {
            return Ok(Vec::new());
        };
        let table = value
            .as_table()
            .ok_or_else(|| anyhow!("config section \"{}\" is not a table", section))?;
        let mut pairs = Vec::with_capacity(table.len());
        for (key, value) in table {
            let rendered = match value {
                Value::String(text) => text.clone(),
                Value::Integer(number) => number.to_string(),
                Value::Float(number) => number.to_string(),
                Value::Boolean(flag) => flag.to_string(),
                other => bail!(
                    "config key {}.{} has unsupported type {}",
                    section,
                    key,
                    other.type_str()
                ),
            };
            pairs.push((key.clone(), rendered));
        }
        Ok(pairs)
    }

    /// True if a get-or-set call materialized a default since the last save.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn save(&mut self) -> Result<()> {
        let rendered = self.table.to_string();
        std::fs::write(&self.path, &rendered)
            .with_context(|| format!("failed to write config file {}", self.path.display()))?;
        self.snapshot = rendered;
        self.dirty = false;
        Ok(())
    }

    /// Re-read the file from disk. Returns true when its contents differ
    /// from the last loaded or saved state; the document is reloaded then.
    pub fn refresh(&mut self) -> Result<bool> {
        let raw = read_or_empty(&self.path)?;
        if raw == self.snapshot {
            return Ok(false);
        }
        self.table = raw
            .parse::<Table>()
            .with_context(|| format!("invalid config file {}", self.path.display()))?;
        self.snapshot = raw;
        self.dirty = false;
        Ok(true)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn read_or_empty(path: &Path) -> Result<String> {
    match std::fs::read_to_string(path) {
        Ok(raw) => Ok(raw),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
        Err(err) => {
            Err(err).with_context(|| format!("failed to read config file {}", path.display()))
        }
    }
}

// ----------------------------------------------------------------------------
// Capture settings
// ----------------------------------------------------------------------------

/// Typed settings the supervisor consumes, decoded from the store once per
/// session attempt.
#[derive(Clone, Debug)]
pub struct CaptureSettings {
    pub image_format: ImageFormat,
    /// Present only when the output format is JPEG.
    pub jpeg_quality: Option<u8>,
    pub thread_count: usize,
    pub total_buffer_count: usize,
    pub queue_capacity: usize,
    pub overflow_policy: OverflowPolicy,
    /// Watchdog threshold; `None` disables the watchdog.
    pub no_images_timeout: Option<Duration>,
    pub log_temperature: bool,
    pub log_exposure_time: bool,
    pub log_gain: bool,
    /// Passthrough feature key/values applied to every source at startup.
    pub source_parameters: Vec<(String, String)>,
}

impl CaptureSettings {
    pub fn load(store: &mut ConfigStore) -> Result<Self> {
        let format_name =
            store.get_or_set_str(SECTION_ENCODING, "ImageFormat", DEFAULT_IMAGE_FORMAT)?;
        let image_format = ImageFormat::parse(&format_name)?;

        let jpeg_quality = if image_format == ImageFormat::Jpeg {
            let quality = store.get_or_set_i64(
                SECTION_ENCODING,
                "JpegCompressionQuality",
                DEFAULT_JPEG_QUALITY,
            )?;
            if !(0..=100).contains(&quality) {
                bail!("JpegCompressionQuality must be between 0 and 100, got {}", quality);
            }
            Some(quality as u8)
        } else {
            None
        };

        let thread_count = store.get_or_set_i64(
            SECTION_ENCODING,
            "ThreadCount",
            default_thread_count() as i64,
        )?;
        if thread_count < 1 {
            bail!("ThreadCount must be at least 1, got {}", thread_count);
        }

        let total_buffer_count =
            store.get_or_set_i64(SECTION_BUFFERS, "TotalCount", DEFAULT_TOTAL_BUFFER_COUNT)?;
        if total_buffer_count < 1 {
            bail!("FrameBuffers.TotalCount must be at least 1, got {}", total_buffer_count);
        }

        let queue_capacity =
            store.get_or_set_i64(SECTION_BUFFERS, "QueueCapacity", DEFAULT_QUEUE_CAPACITY)?;
        if queue_capacity < 1 {
            bail!("FrameBuffers.QueueCapacity must be at least 1, got {}", queue_capacity);
        }

        let overflow_policy = OverflowPolicy::parse(&store.get_or_set_str(
            SECTION_BUFFERS,
            "OverflowPolicy",
            DEFAULT_OVERFLOW_POLICY,
        )?)?;

        let no_images_timeout_s = store.get_or_set_f64(
            SECTION_OPERATION,
            "NoImagesTimeout_s",
            DEFAULT_NO_IMAGES_TIMEOUT_S,
        )?;
        let no_images_timeout = if no_images_timeout_s > 0.0 {
            Some(Duration::from_secs_f64(no_images_timeout_s))
        } else {
            None
        };

        let log_temperature = store.get_or_set_bool(SECTION_LOGGING, "LogTemperature", true)?;
        let log_exposure_time = store.get_or_set_bool(SECTION_LOGGING, "LogExposureTime", false)?;
        let log_gain = store.get_or_set_bool(SECTION_LOGGING, "LogGain", false)?;

        let source_parameters = store.string_pairs(SECTION_SOURCE_PARAMETERS)?;

        Ok(Self {
            image_format,
            jpeg_quality,
            thread_count: thread_count as usize,
            total_buffer_count: total_buffer_count as usize,
            queue_capacity: queue_capacity as usize,
            overflow_policy,
            no_images_timeout,
            log_temperature,
            log_exposure_time,
            log_gain,
            source_parameters,
        })
    }

    pub fn encoder(&self) -> EncoderSettings {
        EncoderSettings {
            format: self.image_format,
            jpeg_quality: self.jpeg_quality,
        }
    }

    pub fn sensor_toggles(&self) -> SensorToggles {
        SensorToggles {
            temperature: self.log_temperature,
            exposure_time: self.log_exposure_time,
            gain: self.log_gain,
        }
    }
}

fn default_thread_count() -> usize {
    let cores = std::thread::available_parallelism()
        .map(|cores| cores.get())
        .unwrap_or(2);
    cores.max(2) - 1
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("framecast-config-{}-{}.toml", name, std::process::id()))
    }

    #[test]
    fn get_or_set_materializes_defaults_and_marks_dirty() -> Result<()> {
        let path = temp_path("defaults");
        let _ = std::fs::remove_file(&path);
        let mut store = ConfigStore::open(&path)?;
        assert!(!store.is_dirty());

        assert_eq!(
            store.get_or_set_str("ImageEncoding", "ImageFormat", "jpg")?,
            "jpg"
        );
        assert!(store.is_dirty());
        // Second read returns the stored value without re-dirtying.
        store.save()?;
        assert!(!store.is_dirty());
        assert_eq!(
            store.get_or_set_str("ImageEncoding", "ImageFormat", "png")?,
            "jpg"
        );
        assert!(!store.is_dirty());

        let _ = std::fs::remove_file(&path);
        Ok(())
    }

    #[test]
    fn typed_accessors_reject_mismatched_values() -> Result<()> {
        let path = temp_path("types");
        std::fs::write(&path, "[Operation]\nNoImagesTimeout_s = \"soon\"\n")?;
        let mut store = ConfigStore::open(&path)?;
        assert!(store
            .get_or_set_f64("Operation", "NoImagesTimeout_s", 10.0)
            .is_err());
        let _ = std::fs::remove_file(&path);
        Ok(())
    }

    #[test]
    fn settings_disable_watchdog_for_non_positive_timeout() -> Result<()> {
        let path = temp_path("watchdog");
        std::fs::write(&path, "[Operation]\nNoImagesTimeout_s = 0.0\n")?;
        let mut store = ConfigStore::open(&path)?;
        let settings = CaptureSettings::load(&mut store)?;
        assert!(settings.no_images_timeout.is_none());
        let _ = std::fs::remove_file(&path);
        Ok(())
    }

    #[test]
    fn jpeg_quality_only_attached_for_jpeg() -> Result<()> {
        let path = temp_path("quality");
        std::fs::write(&path, "[ImageEncoding]\nImageFormat = \"png\"\n")?;
        let mut store = ConfigStore::open(&path)?;
        let settings = CaptureSettings::load(&mut store)?;
        assert_eq!(settings.image_format, ImageFormat::Png);
        assert!(settings.jpeg_quality.is_none());
        let _ = std::fs::remove_file(&path);
        Ok(())
    }

    #[test]
    fn source_parameters_render_as_string_pairs() -> Result<()> {
        let path = temp_path("params");
        std::fs::write(
            &path,
            "[SourceParameters]\nExposureTime = 15000\nGainAuto = \"Off\"\nReverseX = true\n",
        )?;
        let store = ConfigStore::open(&path)?;
        let mut pairs = store.string_pairs("SourceParameters")?;
        pairs.sort();
        assert_eq!(
            pairs,
            vec![
                ("ExposureTime".to_string(), "15000".to_string()),
                ("GainAuto".to_string(), "Off".to_string()),
                ("ReverseX".to_string(), "true".to_string()),
            ]
        );
        let _ = std::fs::remove_file(&path);
        Ok(())
    }
}
