//! Raw frame hand-off types.
//!
//! A `RawFrameItem` is created by the frame-delivery callback, moved into the
//! `FrameQueue`, and dropped once an encoding worker has published it. The
//! pixel buffer is exclusively owned; nothing downstream holds on to it.

use chrono::{DateTime, Utc};

/// Pixel layout of a raw frame as reported by the driver.
///
/// The conversion policy in `encode` dispatches on this tag. Formats the
/// policy does not know are carried as `Unknown` and passed through
/// unconverted (degraded output, not dropped).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PixelFormat {
    /// 8-bit single channel.
    Mono8,
    /// 8-bit Bayer mosaic, RG-GB tiling.
    BayerRg8,
    /// Anything else, with the driver's raw format code.
    Unknown(u32),
}

impl std::fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PixelFormat::Mono8 => write!(f, "Mono8"),
            PixelFormat::BayerRg8 => write!(f, "BayerRG8"),
            PixelFormat::Unknown(code) => write!(f, "unknown(0x{:08x})", code),
        }
    }
}

/// Completeness status attached to every frame delivery.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameStatus {
    /// Frame received in full.
    Complete,
    /// Frame arrived truncated (transfer interrupted).
    Incomplete,
    /// The announced buffer was too small for the payload.
    TooSmall,
    /// The buffer contents are not valid.
    Invalid,
}

/// One raw frame on its way from the delivery callback to an encoding worker.
pub struct RawFrameItem {
    /// Identifier of the source that produced this frame.
    pub source_id: String,
    /// Raw pixel data, exclusively owned.
    pub pixels: Vec<u8>,
    pub pixel_format: PixelFormat,
    pub rows: u32,
    pub cols: u32,
    /// Arrival wall-clock time, stamped in the delivery callback.
    pub timestamp: DateTime<Utc>,
    /// Per-source counter. Monotonic for the lifetime of the process,
    /// never reset across session restarts.
    pub counter: u64,
}

impl RawFrameItem {
    /// Sortable timestamp string used in message attributes and identifiers.
    pub fn timestamp_string(&self) -> String {
        self.timestamp.format("%Y-%m-%dT%H:%M:%S%.6f").to_string()
    }
}
