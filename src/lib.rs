//! Framecast
//!
//! A capture-to-publish pipeline for hardware frame sources: raw frames come
//! in through a driver callback, encoding workers convert and compress them,
//! and the results are published to a message bus as "Image" messages. A
//! supervising state machine restarts the whole capture session on stalls,
//! driver faults, or configuration changes, so the daemon keeps itself alive
//! without operator intervention.
//!
//! # Architecture
//!
//! ```text
//! driver callback -> FrameQueue -> EncoderPool -> MessageBus
//!        |                             |
//!        +-- SourceTelemetry <---------+
//!                   |
//!             Supervisor (1 s tick: watchdog, config changes, health log)
//! ```
//!
//! # Module Structure
//!
//! - `frame`: raw frame hand-off types (`RawFrameItem`, `PixelFormat`)
//! - `queue`: bounded MPMC hand-off queue with overflow policies
//! - `driver`: frame-source driver interface + synthetic backend
//! - `encode`: pixel-format conversion policy and JPEG/PNG compression
//! - `bus`: message bus interface, MQTT and in-memory implementations
//! - `telemetry`: per-source counters and the health monitor
//! - `worker`: the encoding worker pool
//! - `supervisor`: the session state machine and shutdown token
//! - `config`: TOML configuration store with get-or-set semantics

pub mod bus;
pub mod config;
pub mod driver;
pub mod encode;
pub mod frame;
pub mod queue;
pub mod supervisor;
pub mod telemetry;
pub mod worker;

pub use bus::{ImageMessage, InMemoryBus, MessageBus, MqttBus, MESSAGE_TYPE_IMAGE};
pub use config::{CaptureSettings, ConfigStore};
pub use driver::{
    FeatureType, FeatureValue, FrameCallback, FrameEvent, FrameSource, FrameSourceDriver,
    SourceDescriptor, SyntheticDriver, SyntheticSourceSpec, CMD_ACQUISITION_START,
};
pub use encode::{encode_frame, image_id, EncoderSettings, ImageFormat};
pub use frame::{FrameStatus, PixelFormat, RawFrameItem};
pub use queue::{FrameQueue, OverflowPolicy, PushResult};
pub use supervisor::{BusConnector, SessionOutcome, ShutdownToken, Supervisor};
pub use telemetry::{HealthMonitor, SensorToggles, SourceTelemetry, TickCounts};
pub use worker::EncoderPool;
