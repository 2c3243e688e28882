//! Synthetic capture source used in test mode

use super::{ensure_rgba, CaptureError, CaptureSource, Frame};

const BARS: [[u8; 4]; 8] = [
    [255, 255, 255, 255],
    [255, 255, 0, 255],
    [0, 255, 255, 255],
    [0, 255, 0, 255],
    [255, 0, 255, 255],
    [255, 0, 0, 255],
    [0, 0, 255, 255],
    [0, 0, 0, 255],
];

/// Scrolling colour bars, so dropped or duplicated frames are visible in the output
pub struct TestPatternSource {
    width: u32,
    height: u32,
    frame_index: u32,
    closed: bool,
}

impl TestPatternSource {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            frame_index: 0,
            closed: false,
        }
    }
}

impl Default for TestPatternSource {
    fn default() -> Self {
        Self::new(1280, 720)
    }
}

impl CaptureSource for TestPatternSource {
    fn name(&self) -> &'static str {
        "test-pattern"
    }

    fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn capture(&mut self, frame: &mut Frame) -> Result<(), CaptureError> {
        if self.closed {
            return Err(CaptureError::Closed);
        }
        ensure_rgba(frame, self.width, self.height);

        let bar_width = (self.width / BARS.len() as u32).max(1);
        let shift = self.frame_index % self.width.max(1);
        for y in 0..self.height {
            for x in 0..self.width {
                let bar = ((x + shift) % self.width / bar_width) as usize % BARS.len();
                frame.set_pixel(x, y, BARS[bar]);
            }
        }

        self.frame_index = self.frame_index.wrapping_add(4);
        Ok(())
    }

    fn close(&mut self) {
        self.closed = true;
    }
}
