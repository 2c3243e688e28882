//! Output frame geometry
//!
//! Works out the encoded frame size from the display size and the
//! requested rotation, resolution and padding.

use tracing::{info, warn};

use crate::pipeline::{PipelineConfig, Rotation};

/// Resolved sizes for one recording
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameGeometry {
    /// Captured display size
    pub source_width: u32,
    pub source_height: u32,
    /// Rotation applied to the captured content
    pub rotation: Rotation,
    /// Size of the (rotated, scaled) display content inside the frame
    pub content_width: u32,
    pub content_height: u32,
    /// Encoded frame size, content plus padding
    pub video_width: u32,
    pub video_height: u32,
}

impl FrameGeometry {
    /// Resolve the geometry for a display of `source_width` x `source_height`
    pub fn resolve(source_width: u32, source_height: u32, config: &PipelineConfig) -> Self {
        let mut rotation = config.rotation;
        let (mut width, mut height) = if rotation.is_quarter_turn() {
            (source_height, source_width)
        } else {
            (source_width, source_height)
        };

        if !config.allow_vertical_frames && height > width {
            rotation = rotation.then(Rotation::Deg90);
            std::mem::swap(&mut width, &mut height);
            info!("Vertical frames not allowed, rotating to {}", rotation.degrees());
        }

        let (content_width, content_height) = if config.width > 0 && config.height > 0 {
            (even_dimension(config.width), even_dimension(config.height))
        } else {
            (even_dimension(width), even_dimension(height))
        };

        Self {
            source_width,
            source_height,
            rotation,
            content_width,
            content_height,
            video_width: even_dimension(content_width.saturating_add(config.padding_width)),
            video_height: even_dimension(content_height.saturating_add(config.padding_height)),
        }
    }

    /// Top-left corner of the content inside the padded frame
    pub fn content_offset(&self) -> (u32, u32) {
        (
            (self.video_width - self.content_width) / 2,
            (self.video_height - self.content_height) / 2,
        )
    }

    /// Size of the captured content after rotation, before scaling
    pub fn rotated_source(&self) -> (u32, u32) {
        if self.rotation.is_quarter_turn() {
            (self.source_height, self.source_width)
        } else {
            (self.source_width, self.source_height)
        }
    }
}

/// Largest frame side any encoder here accepts
const MAX_DIMENSION: u32 = 16_384;

/// Clamp to [`MAX_DIMENSION`] and round up to even (required by 4:2:0 encoders)
fn even_dimension(v: u32) -> u32 {
    if v > MAX_DIMENSION {
        warn!("Frame side {} exceeds {}, clamping", v, MAX_DIMENSION);
        return MAX_DIMENSION;
    }
    v + v % 2
}
