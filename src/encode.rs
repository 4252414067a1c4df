//! Pixel-format conversion policy and compressed encoding.
//!
//! Conversion is an extensible dispatch over `PixelFormat`: single-channel
//! formats pass through, Bayer mosaics are reconstructed to 3-channel RGB,
//! and unrecognized formats are logged and passed through unconverted so the
//! frame is still published (degraded output, not dropped).

use std::io::Cursor;

use anyhow::{bail, Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::{ExtendedColorType, ImageEncoder};

use crate::bus::ImageMessage;
use crate::frame::{PixelFormat, RawFrameItem};

/// Supported output codecs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImageFormat {
    Jpeg,
    Png,
}

impl ImageFormat {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "jpg" | "jpeg" => Ok(ImageFormat::Jpeg),
            "png" => Ok(ImageFormat::Png),
            other => bail!("unsupported image format \"{}\"", other),
        }
    }

    /// File extension, also used as the `format` message attribute.
    pub fn extension(&self) -> &'static str {
        match self {
            ImageFormat::Jpeg => "jpg",
            ImageFormat::Png => "png",
        }
    }
}

#[derive(Clone, Debug)]
pub struct EncoderSettings {
    pub format: ImageFormat,
    /// Attached only when the format is JPEG.
    pub jpeg_quality: Option<u8>,
}

enum Converted {
    Gray(Vec<u8>),
    Rgb(Vec<u8>),
}

impl Converted {
    fn color_type(&self) -> ExtendedColorType {
        match self {
            Converted::Gray(_) => ExtendedColorType::L8,
            Converted::Rgb(_) => ExtendedColorType::Rgb8,
        }
    }

    fn data(&self) -> &[u8] {
        match self {
            Converted::Gray(data) | Converted::Rgb(data) => data,
        }
    }
}

/// Convert one raw frame per the format policy table.
fn convert(item: &RawFrameItem) -> Result<Converted> {
    if item.rows == 0 || item.cols == 0 {
        bail!("empty frame dimensions {}x{}", item.rows, item.cols);
    }
    let expected = (item.rows * item.cols) as usize;
    if item.pixels.len() != expected {
        bail!(
            "raw buffer is {} bytes, expected {} for {}x{}",
            item.pixels.len(),
            expected,
            item.rows,
            item.cols
        );
    }
    match item.pixel_format {
        PixelFormat::Mono8 => Ok(Converted::Gray(item.pixels.clone())),
        PixelFormat::BayerRg8 => Ok(Converted::Rgb(demosaic_bayer_rg8(
            &item.pixels,
            item.rows as usize,
            item.cols as usize,
        ))),
        PixelFormat::Unknown(_) => {
            log::error!(
                "Unsupported pixel format: {} (source {}, frame {})",
                item.pixel_format,
                item.source_id,
                item.counter
            );
            Ok(Converted::Gray(item.pixels.clone()))
        }
    }
}

/// Nearest-neighbor reconstruction of an RG-GB mosaic into RGB8.
///
/// Each pixel samples its enclosing 2x2 Bayer cell. Good enough for a
/// monitoring stream; this is not a quality demosaic.
fn demosaic_bayer_rg8(mosaic: &[u8], rows: usize, cols: usize) -> Vec<u8> {
    let mut rgb = vec![0u8; rows * cols * 3];
    for row in 0..rows {
        let cell_row = row & !1;
        let next_row = (cell_row + 1).min(rows - 1);
        for col in 0..cols {
            let cell_col = col & !1;
            let next_col = (cell_col + 1).min(cols - 1);
            let r = mosaic[cell_row * cols + cell_col];
            let g = mosaic[cell_row * cols + next_col];
            let b = mosaic[next_row * cols + next_col];
            let out = (row * cols + col) * 3;
            rgb[out] = r;
            rgb[out + 1] = g;
            rgb[out + 2] = b;
        }
    }
    rgb
}

fn compress(converted: &Converted, rows: u32, cols: u32, settings: &EncoderSettings) -> Result<Vec<u8>> {
    let mut out = Cursor::new(Vec::new());
    match settings.format {
        ImageFormat::Jpeg => {
            let quality = settings.jpeg_quality.unwrap_or(90);
            JpegEncoder::new_with_quality(&mut out, quality)
                .write_image(converted.data(), cols, rows, converted.color_type())
                .context("JPEG encoding failed")?;
        }
        ImageFormat::Png => {
            PngEncoder::new(&mut out)
                .write_image(converted.data(), cols, rows, converted.color_type())
                .context("PNG encoding failed")?;
        }
    }
    Ok(out.into_inner())
}

/// Stable message identifier: sanitized timestamp, 16-hex-digit zero-padded
/// counter, format extension.
pub fn image_id(timestamp: &str, counter: u64, extension: &str) -> String {
    let sanitized = timestamp.replace(':', ".");
    format!("{}_{}.{}", sanitized, hex::encode(counter.to_be_bytes()), extension)
}

/// Convert and compress one frame into a publishable message.
pub fn encode_frame(item: &RawFrameItem, settings: &EncoderSettings) -> Result<ImageMessage> {
    let converted = convert(item)?;
    let data = compress(&converted, item.rows, item.cols, settings)?;
    let timestamp = item.timestamp_string();
    let extension = settings.format.extension();
    Ok(ImageMessage {
        id: image_id(&timestamp, item.counter, extension),
        timestamp,
        counter: item.counter,
        rows: item.rows,
        cols: item.cols,
        data,
        format: extension.to_string(),
        jpeg_quality: settings.jpeg_quality,
    })
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
