// Video encoding for deskcast-server.
//
// Provides the encode stage and its two backends:
// - h264.rs: hardware-first H.264 encoder chain (NVENC, AMF, QSV, x264)
// - jpeg.rs: per-frame JPEG fallback when no H.264 encoder opens
// - stage.rs: the encode worker between the capture and fan-out rings

pub mod h264;
pub mod jpeg;
pub mod stage;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;

pub use h264::H264Encoder;
pub use jpeg::JpegFallback;
pub use stage::{EncodeStage, EncoderSettings};

/// A compressed frame ready for fan-out.
///
/// When `keyframe` is set the payload is self-sufficient for a fresh
/// decoder: SPS/PPS in-band for H.264, or a complete JPEG image.
#[derive(Debug, Clone)]
pub struct EncodedFrame {
    /// Codec output bytes.
    pub data: Bytes,
    /// Cursor position inherited from the source frame.
    pub cursor_u: f32,
    pub cursor_v: f32,
    /// Whether the codec emitted a self-contained frame.
    pub keyframe: bool,
    /// Sequence number inherited from the source frame; gaps are preserved
    /// when the encoder drops or holds a frame.
    pub sequence: u64,
}

/// Process-wide keyframe demand, set by the control plane and the session
/// registry, read-and-cleared by the encoder once per frame.
#[derive(Debug, Clone, Default)]
pub struct KeyframeRequest(Arc<AtomicBool>);

impl KeyframeRequest {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the encoder to force an I-frame on the next encode.
    pub fn request(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Consume the request. Multiple requests between encodes collapse into
    /// one forced I-frame.
    #[must_use]
    pub fn take(&self) -> bool {
        self.0.swap(false, Ordering::AcqRel)
    }

    /// Whether a request is pending, without consuming it.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    /// No encoder in the chain opened; the stage downgrades to JPEG.
    #[error("no H.264 encoder available")]
    NoEncoder,

    /// One encoder in the chain failed to open.
    #[error("encoder {name} failed to open: {reason}")]
    Open { name: &'static str, reason: String },

    /// A single frame was rejected; the frame is dropped, the encoder kept.
    #[error("frame rejected by encoder: {0}")]
    Frame(#[from] ffmpeg_next::Error),

    /// The frame buffer does not match the encoder geometry.
    #[error("frame of {got} bytes does not match {width}x{height} BGRA")]
    Geometry { got: usize, width: u32, height: u32 },

    #[error("jpeg encoding failed: {0}")]
    Jpeg(#[from] jpeg_encoder::EncodingError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keyframe_request_is_read_and_clear() {
        let flag = KeyframeRequest::new();
        assert!(!flag.take());

        flag.request();
        assert!(flag.is_pending());
        assert!(flag.take());
        assert!(!flag.take());
    }

    #[test]
    fn rapid_requests_collapse_into_one() {
        let flag = KeyframeRequest::new();
        flag.request();
        flag.request();
        assert!(flag.take());
        // The second request does not arm a second forced frame.
        assert!(!flag.take());
    }

    #[test]
    fn clones_share_the_flag() {
        let flag = KeyframeRequest::new();
        let other = flag.clone();
        other.request();
        assert!(flag.take());
    }
}
