//! Software frame transform
//!
//! Rotates and scales the captured RGBA frame into the padded output
//! canvas, then converts it to the encoder's pixel format. YUV output uses
//! BT.601 limited-range coefficients with 2x2 averaged chroma.

use crate::capture::{Frame, PixelFormat};
use crate::pipeline::{ColorFormat, PipelineConfig, RenderStrategy, Rotation};

use super::FrameGeometry;

const BLACK: [u8; 4] = [0, 0, 0, 255];

/// Encoder input format for a configuration
pub fn output_format(config: &PipelineConfig) -> PixelFormat {
    match (config.strategy, config.color_format) {
        (RenderStrategy::YuvSemiPlanar, _) => PixelFormat::Nv12,
        (RenderStrategy::YuvPlanar, _) => PixelFormat::I420,
        (_, ColorFormat::Bgra) => PixelFormat::Bgra,
        (_, ColorFormat::Rgba) => PixelFormat::Rgba,
    }
}

/// Rotation + scale + padding + colour conversion, fixed for the whole recording
pub struct Transform {
    geometry: FrameGeometry,
    format: PixelFormat,
    canvas: Frame,
}

impl Transform {
    pub fn new(geometry: FrameGeometry, format: PixelFormat) -> Self {
        Self {
            geometry,
            format,
            canvas: Frame::new(geometry.video_width, geometry.video_height, PixelFormat::Rgba),
        }
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn geometry(&self) -> &FrameGeometry {
        &self.geometry
    }

    /// Allocate an output frame matching this transform
    pub fn output_frame(&self) -> Frame {
        Frame::new(self.geometry.video_width, self.geometry.video_height, self.format)
    }

    /// Transform an RGBA capture into `dst`
    pub fn apply(&mut self, src: &Frame, dst: &mut Frame) {
        self.compose(src);

        if dst.width != self.canvas.width
            || dst.height != self.canvas.height
            || dst.format != self.format
        {
            *dst = self.output_frame();
        }

        match self.format {
            PixelFormat::Rgba => dst.data.copy_from_slice(&self.canvas.data),
            PixelFormat::Bgra => {
                for (out, px) in dst.data.chunks_exact_mut(4).zip(self.canvas.data.chunks_exact(4)) {
                    out.copy_from_slice(&[px[2], px[1], px[0], px[3]]);
                }
            }
            PixelFormat::Nv12 => rgba_to_yuv420(&self.canvas, &mut dst.data, true),
            PixelFormat::I420 => rgba_to_yuv420(&self.canvas, &mut dst.data, false),
        }
    }

    /// Draw the rotated, scaled capture into the black padded canvas
    fn compose(&mut self, src: &Frame) {
        for px in self.canvas.data.chunks_exact_mut(4) {
            px.copy_from_slice(&BLACK);
        }
        if src.width == 0 || src.height == 0 {
            return;
        }

        let g = &self.geometry;
        let (ox, oy) = g.content_offset();
        let (rw, rh) = if g.rotation.is_quarter_turn() {
            (u64::from(src.height), u64::from(src.width))
        } else {
            (u64::from(src.width), u64::from(src.height))
        };
        let (cw, ch) = (u64::from(g.content_width), u64::from(g.content_height));
        let (sw, sh) = (src.width, src.height);

        for y in 0..g.content_height {
            let ry = (u64::from(y) * rh / ch) as u32;
            for x in 0..g.content_width {
                let rx = (u64::from(x) * rw / cw) as u32;
                let (sx, sy) = match g.rotation {
                    Rotation::Deg0 => (rx, ry),
                    Rotation::Deg90 => (ry, sh - 1 - rx),
                    Rotation::Deg180 => (sw - 1 - rx, sh - 1 - ry),
                    Rotation::Deg270 => (sw - 1 - ry, rx),
                };
                self.canvas.set_pixel(ox + x, oy + y, src.pixel(sx, sy));
            }
        }
    }
}

fn luma(p: [u8; 4]) -> u8 {
    let (r, g, b) = (i32::from(p[0]), i32::from(p[1]), i32::from(p[2]));
    (((66 * r + 129 * g + 25 * b + 128) >> 8) + 16) as u8
}

fn chroma(r: i32, g: i32, b: i32) -> (u8, u8) {
    let u = ((-38 * r - 74 * g + 112 * b + 128) >> 8) + 128;
    let v = ((112 * r - 94 * g - 18 * b + 128) >> 8) + 128;
    (u.clamp(0, 255) as u8, v.clamp(0, 255) as u8)
}

/// Convert an RGBA frame to NV12 (`interleaved`) or I420
fn rgba_to_yuv420(src: &Frame, dst: &mut [u8], interleaved: bool) {
    let (w, h) = (src.width as usize, src.height as usize);
    let (cw, ch) = (w.div_ceil(2), h.div_ceil(2));
    let (y_plane, chroma_planes) = dst.split_at_mut(w * h);

    for y in 0..h {
        for x in 0..w {
            y_plane[y * w + x] = luma(src.pixel(x as u32, y as u32));
        }
    }

    for cy in 0..ch {
        for cx in 0..cw {
            let (mut r, mut g, mut b, mut n) = (0i32, 0i32, 0i32, 0i32);
            for y in (cy * 2)..(cy * 2 + 2).min(h) {
                for x in (cx * 2)..(cx * 2 + 2).min(w) {
                    let p = src.pixel(x as u32, y as u32);
                    r += i32::from(p[0]);
                    g += i32::from(p[1]);
                    b += i32::from(p[2]);
                    n += 1;
                }
            }
            let (u, v) = chroma(r / n, g / n, b / n);
            let i = cy * cw + cx;
            if interleaved {
                chroma_planes[i * 2] = u;
                chroma_planes[i * 2 + 1] = v;
            } else {
                chroma_planes[i] = u;
                chroma_planes[cw * ch + i] = v;
            }
        }
    }
}
