//! The display capture seam.
//!
//! Real backends (GPU desktop duplication, CPU frame grabbers) live behind
//! [`FrameSource`]; the pipeline only ever sees this trait. The crate ships
//! [`TestPatternSource`], a synthetic source that doubles as the CPU
//! fallback path and the test fixture.

use std::time::Duration;

use crate::frame::ScreenSize;

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    /// The backend lost its device or surface and cannot continue.
    #[error("capture backend failed: {0}")]
    Backend(String),

    /// The backend produced a buffer that does not match its geometry.
    #[error("capture produced {got} bytes, expected {expected}")]
    BadBuffer { got: usize, expected: usize },
}

/// A borrowed view of one captured frame.
///
/// The pixels stay owned by the source; the capture stage copies them into
/// a fresh buffer before they enter the pipeline.
#[derive(Debug)]
pub struct RawFrame<'a> {
    /// Tightly packed BGRA pixels.
    pub data: &'a [u8],
    pub width: u32,
    pub height: u32,
}

/// One display capture backend.
pub trait FrameSource: Send {
    /// Dimensions of the captured display.
    fn size(&self) -> ScreenSize;

    /// Wait up to `timeout` for new display content.
    ///
    /// `Ok(None)` means the display did not change within the timeout; the
    /// capture stage replays its cached frame in that case.
    fn next_frame(&mut self, timeout: Duration) -> Result<Option<RawFrame<'_>>, CaptureError>;

    /// Capture the current display content unconditionally.
    ///
    /// Used to synthesize a frame when nothing has been captured yet but a
    /// viewer needs one.
    fn grab_now(&mut self) -> Result<RawFrame<'_>, CaptureError>;
}

/// Synthetic moving-gradient source.
///
/// Emits a new frame every `change_every` polls and reports "no change"
/// in between, which exercises the duplicate-frame path the same way an
/// idle desktop does.
pub struct TestPatternSource {
    size: ScreenSize,
    buffer: Vec<u8>,
    phase: u32,
    polls: u64,
    change_every: u64,
}

impl TestPatternSource {
    #[must_use]
    pub fn new(size: ScreenSize) -> Self {
        Self::with_change_interval(size, 1)
    }

    /// A source whose content only moves every `change_every` polls.
    #[must_use]
    pub fn with_change_interval(size: ScreenSize, change_every: u64) -> Self {
        let mut source = Self {
            size,
            buffer: vec![0; size.frame_len()],
            phase: 0,
            polls: 0,
            change_every: change_every.max(1),
        };
        source.render();
        source
    }

    /// Diagonal gradient with a phase offset, BGRA.
    fn render(&mut self) {
        let width = self.size.width as usize;
        for (i, px) in self.buffer.chunks_exact_mut(4).enumerate() {
            let x = (i % width) as u32;
            let y = (i / width) as u32;
            px[0] = ((x + self.phase) & 0xFF) as u8;
            px[1] = ((y + self.phase) & 0xFF) as u8;
            px[2] = ((x + y) & 0xFF) as u8;
            px[3] = 0xFF;
        }
    }

    fn raw(&self) -> RawFrame<'_> {
        RawFrame {
            data: &self.buffer,
            width: self.size.width,
            height: self.size.height,
        }
    }
}

impl FrameSource for TestPatternSource {
    fn size(&self) -> ScreenSize {
        self.size
    }

    fn next_frame(&mut self, _timeout: Duration) -> Result<Option<RawFrame<'_>>, CaptureError> {
        self.polls += 1;
        if self.polls % self.change_every != 0 {
            return Ok(None);
        }
        self.phase = self.phase.wrapping_add(4);
        self.render();
        Ok(Some(self.raw()))
    }

    fn grab_now(&mut self) -> Result<RawFrame<'_>, CaptureError> {
        Ok(self.raw())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pattern_has_expected_geometry() {
        let mut src = TestPatternSource::new(ScreenSize::new(64, 32));
        let frame = src.grab_now().unwrap();
        assert_eq!(frame.width, 64);
        assert_eq!(frame.height, 32);
        assert_eq!(frame.data.len(), 64 * 32 * 4);
        // Opaque alpha everywhere.
        assert!(frame.data.chunks_exact(4).all(|px| px[3] == 0xFF));
    }

    #[test]
    fn change_interval_reports_idle_polls() {
        let mut src = TestPatternSource::with_change_interval(ScreenSize::new(8, 8), 3);
        let timeout = Duration::from_millis(10);
        assert!(src.next_frame(timeout).unwrap().is_none());
        assert!(src.next_frame(timeout).unwrap().is_none());
        assert!(src.next_frame(timeout).unwrap().is_some());
        assert!(src.next_frame(timeout).unwrap().is_none());
    }

    #[test]
    fn content_moves_between_frames() {
        let mut src = TestPatternSource::new(ScreenSize::new(16, 16));
        let first = src.next_frame(Duration::from_millis(10)).unwrap().unwrap().data.to_vec();
        let second = src.next_frame(Duration::from_millis(10)).unwrap().unwrap().data.to_vec();
        assert_ne!(first, second);
    }
}
