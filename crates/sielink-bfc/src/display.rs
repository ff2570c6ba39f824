//! Display-buffer records and pixel formats.
//!
//! The display service reports the panel geometry and the live
//! framebuffer's pixel format and address; the buffer itself is then
//! pulled over the ordinary memory-read channel.

use sielink_core::error::{Error, Result};

/// Pixel format codes reported by the display service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// 1 bit per pixel, 8 pixels packed per byte.
    Wb,
    /// 8-bit 3-3-2 RGB.
    Rgb332,
    /// 16-bit 4-4-4-4 RGBA.
    Rgba4444,
    /// 16-bit 5-6-5 RGB.
    Rgb565,
    /// 24-bit RGB.
    Rgb888,
    /// 32-bit RGB with padding byte.
    Rgb8888,
}

impl PixelFormat {
    /// Decode the wire format code.
    pub fn from_code(code: u8) -> Result<PixelFormat> {
        match code {
            1 => Ok(PixelFormat::Wb),
            2 => Ok(PixelFormat::Rgb332),
            3 => Ok(PixelFormat::Rgba4444),
            4 => Ok(PixelFormat::Rgb565),
            5 => Ok(PixelFormat::Rgb888),
            9 => Ok(PixelFormat::Rgb8888),
            other => Err(Error::Unsupported(format!(
                "unknown display buffer format {other}"
            ))),
        }
    }

    /// Framebuffer size in bytes for a `width` x `height` panel.
    pub fn buffer_size(&self, width: u32, height: u32) -> u32 {
        let pixels = width * height;
        match self {
            PixelFormat::Wb => pixels.div_ceil(8),
            PixelFormat::Rgb332 => pixels,
            PixelFormat::Rgba4444 | PixelFormat::Rgb565 => pixels * 2,
            PixelFormat::Rgb888 => pixels * 3,
            PixelFormat::Rgb8888 => pixels * 4,
        }
    }
}

/// Panel geometry from the display-info reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplayInfo {
    /// Panel width in pixels.
    pub width: u16,
    /// Panel height in pixels.
    pub height: u16,
}

impl DisplayInfo {
    /// Parse a display-info reply payload.
    pub fn parse(payload: &[u8]) -> Result<DisplayInfo> {
        if payload.len() < 4 {
            return Err(Error::Protocol(format!(
                "display info reply too short: {} bytes",
                payload.len()
            )));
        }
        Ok(DisplayInfo {
            width: u16::from_le_bytes([payload[0], payload[1]]),
            height: u16::from_le_bytes([payload[2], payload[3]]),
        })
    }
}

/// Framebuffer location from the buffer-info reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplayBufferInfo {
    /// Pixel format of the live buffer.
    pub format: PixelFormat,
    /// Address of the buffer in phone memory.
    pub addr: u32,
}

impl DisplayBufferInfo {
    /// Parse a buffer-info reply payload.
    pub fn parse(payload: &[u8]) -> Result<DisplayBufferInfo> {
        if payload.len() < 5 {
            return Err(Error::Protocol(format!(
                "display buffer info reply too short: {} bytes",
                payload.len()
            )));
        }
        Ok(DisplayBufferInfo {
            format: PixelFormat::from_code(payload[0])?,
            addr: u32::from_le_bytes([payload[1], payload[2], payload[3], payload[4]]),
        })
    }
}

/// A captured framebuffer.
#[derive(Debug, Clone)]
pub struct DisplayBuffer {
    /// Panel width in pixels.
    pub width: u16,
    /// Panel height in pixels.
    pub height: u16,
    /// Pixel format of `data`.
    pub format: PixelFormat,
    /// Raw framebuffer bytes.
    pub data: Vec<u8>,
}
