/// Width and height of the captured display in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScreenSize {
    pub width: u32,
    pub height: u32,
}

impl ScreenSize {
    #[must_use]
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Byte length of one tightly packed BGRA frame at this size.
    #[must_use]
    pub fn frame_len(self) -> usize {
        (self.width as usize) * (self.height as usize) * 4
    }
}

/// A single raw display snapshot moving through the pipeline.
///
/// The buffer is tightly packed BGRA and owned exclusively by whichever
/// stage currently holds the frame.
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    /// Raw pixel data (BGRA, stride = width * 4).
    pub data: Vec<u8>,
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Cursor position normalized to `[0, 1]` across the display.
    pub cursor_u: f32,
    pub cursor_v: f32,
    /// Monotonically increasing capture sequence number.
    pub sequence: u64,
    /// Set when the buffer replays the previous capture (idle display).
    pub duplicate: bool,
}

impl CapturedFrame {
    /// Expected data length for the given dimensions.
    #[must_use]
    pub fn expected_len(width: u32, height: u32) -> usize {
        (width as usize) * (height as usize) * 4
    }

    /// Validate that the pixel buffer matches the declared dimensions.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.data.len() == Self::expected_len(self.width, self.height)
    }
}

/// A chunk of loopback audio as delivered by the capture backend.
///
/// Samples are interleaved `f32` in the device's native rate and channel
/// count; the audio stage resamples and narrows them downstream.
#[derive(Debug, Clone)]
pub struct AudioChunk {
    /// Interleaved samples.
    pub samples: Vec<f32>,
    /// Number of interleaved channels.
    pub channels: u16,
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Monotonically increasing chunk number.
    pub sequence: u64,
}
