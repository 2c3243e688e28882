//! Frame buffers shared by capture sources, transforms and encoders

/// Pixel layout of a frame buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PixelFormat {
    #[default]
    Rgba,
    Bgra,
    /// YUV 4:2:0, Y plane followed by interleaved UV
    Nv12,
    /// YUV 4:2:0, Y, U and V planes
    I420,
}

impl PixelFormat {
    /// Bytes needed for a tightly packed frame of the given size
    pub fn frame_size(self, width: u32, height: u32) -> usize {
        let (w, h) = (width as usize, height as usize);
        match self {
            PixelFormat::Rgba | PixelFormat::Bgra => w * h * 4,
            PixelFormat::Nv12 | PixelFormat::I420 => w * h + 2 * (w.div_ceil(2) * h.div_ceil(2)),
        }
    }

    /// Name ffmpeg uses for `-pix_fmt`
    pub fn ffmpeg_name(self) -> &'static str {
        match self {
            PixelFormat::Rgba => "rgba",
            PixelFormat::Bgra => "bgra",
            PixelFormat::Nv12 => "nv12",
            PixelFormat::I420 => "yuv420p",
        }
    }
}

/// A tightly packed frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub data: Vec<u8>,
}

impl Frame {
    /// Allocate a zeroed frame
    pub fn new(width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            width,
            height,
            format,
            data: vec![0; format.frame_size(width, height)],
        }
    }

    /// RGBA/BGRA pixel at (x, y) in the frame's own channel order
    pub fn pixel(&self, x: u32, y: u32) -> [u8; 4] {
        let offset = (y as usize * self.width as usize + x as usize) * 4;
        [
            self.data[offset],
            self.data[offset + 1],
            self.data[offset + 2],
            self.data[offset + 3],
        ]
    }

    /// Overwrite the RGBA/BGRA pixel at (x, y)
    pub fn set_pixel(&mut self, x: u32, y: u32, pixel: [u8; 4]) {
        let offset = (y as usize * self.width as usize + x as usize) * 4;
        self.data[offset..offset + 4].copy_from_slice(&pixel);
    }
}
