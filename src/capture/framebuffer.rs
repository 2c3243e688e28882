//! Linux framebuffer capture
//!
//! Geometry comes from sysfs (`modes`, `virtual_size`, `bits_per_pixel`,
//! `stride`); pixel data is read straight from the device node. 32-bit
//! framebuffers are taken as RGBX, 16-bit ones as RGB565.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::{ensure_rgba, CaptureError, CaptureSource, Frame};

/// Framebuffer device capture source
pub struct FramebufferSource {
    device: Option<File>,
    path: PathBuf,
    width: u32,
    height: u32,
    stride: usize,
    bits_per_pixel: u32,
    raw: Vec<u8>,
}

impl FramebufferSource {
    /// Open the framebuffer device and read its geometry from `sysfs`
    pub fn open(device_path: &Path, sysfs: &Path) -> Result<Self, CaptureError> {
        let (width, height) = read_visible_size(sysfs)?;

        let bits_per_pixel = read_sysfs(sysfs, "bits_per_pixel")
            .ok()
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(32);
        if bits_per_pixel != 32 && bits_per_pixel != 16 {
            return Err(CaptureError::UnsupportedDepth { bits_per_pixel });
        }

        let packed_stride = width as usize * (bits_per_pixel as usize / 8);
        let stride = read_sysfs(sysfs, "stride")
            .ok()
            .and_then(|v| v.trim().parse().ok())
            .filter(|&s: &usize| s >= packed_stride)
            .unwrap_or(packed_stride);

        let device = File::open(device_path).map_err(|source| CaptureError::Unavailable {
            path: device_path.to_path_buf(),
            source,
        })?;

        info!(
            "Framebuffer {:?}: {}x{}, {} bpp, stride {}",
            device_path, width, height, bits_per_pixel, stride
        );

        Ok(Self {
            device: Some(device),
            path: device_path.to_path_buf(),
            width,
            height,
            stride,
            bits_per_pixel,
            raw: vec![0; stride * height as usize],
        })
    }
}

impl CaptureSource for FramebufferSource {
    fn name(&self) -> &'static str {
        "framebuffer"
    }

    fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn capture(&mut self, frame: &mut Frame) -> Result<(), CaptureError> {
        let device = self.device.as_mut().ok_or(CaptureError::Closed)?;
        device.seek(SeekFrom::Start(0))?;
        device.read_exact(&mut self.raw)?;

        ensure_rgba(frame, self.width, self.height);
        let row_bytes = self.width as usize * 4;

        for y in 0..self.height as usize {
            let src = &self.raw[y * self.stride..];
            let dst = &mut frame.data[y * row_bytes..(y + 1) * row_bytes];
            match self.bits_per_pixel {
                32 => {
                    dst.copy_from_slice(&src[..row_bytes]);
                    // RGBX: force opaque alpha
                    for px in dst.chunks_exact_mut(4) {
                        px[3] = 255;
                    }
                }
                _ => {
                    for (px, rgb565) in dst.chunks_exact_mut(4).zip(src.chunks_exact(2)) {
                        let v = u16::from_le_bytes([rgb565[0], rgb565[1]]);
                        let r = ((v >> 11) & 0x1f) as u8;
                        let g = ((v >> 5) & 0x3f) as u8;
                        let b = (v & 0x1f) as u8;
                        px.copy_from_slice(&[
                            (r << 3) | (r >> 2),
                            (g << 2) | (g >> 4),
                            (b << 3) | (b >> 2),
                            255,
                        ]);
                    }
                }
            }
        }
        Ok(())
    }

    fn close(&mut self) {
        if self.device.take().is_some() {
            debug!("Closed framebuffer {:?}", self.path);
        }
    }
}

fn read_sysfs(sysfs: &Path, attribute: &str) -> std::io::Result<String> {
    std::fs::read_to_string(sysfs.join(attribute))
}

/// Visible size from the current mode (`U:1080x1920p-60`), falling back to
/// `virtual_size`. The virtual size may include the back buffer, so the mode wins.
fn read_visible_size(sysfs: &Path) -> Result<(u32, u32), CaptureError> {
    if let Ok(modes) = read_sysfs(sysfs, "modes") {
        if let Some(size) = modes.lines().next().and_then(parse_mode) {
            return Ok(size);
        }
    }

    let virtual_size = read_sysfs(sysfs, "virtual_size").map_err(|source| {
        CaptureError::Unavailable {
            path: sysfs.join("virtual_size"),
            source,
        }
    })?;
    let mut parts = virtual_size.trim().split(',');
    match (
        parts.next().and_then(|w| w.trim().parse().ok()),
        parts.next().and_then(|h| h.trim().parse().ok()),
    ) {
        (Some(w), Some(h)) if w > 0 && h > 0 => Ok((w, h)),
        _ => Err(CaptureError::InvalidGeometry(virtual_size.trim().to_string())),
    }
}

fn parse_mode(mode: &str) -> Option<(u32, u32)> {
    let dims = mode.split_once(':').map_or(mode, |(_, rest)| rest);
    let (w, rest) = dims.split_once('x')?;
    let h: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    let (w, h) = (w.trim().parse().ok()?, h.parse().ok()?);
    (w > 0 && h > 0).then_some((w, h))
}
