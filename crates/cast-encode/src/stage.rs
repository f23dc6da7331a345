//! The encode worker.
//!
//! Pulls captured frames off the capture ring, lazily opens the encoder
//! from the first frame's dimensions, and pushes compressed frames to the
//! fan-out ring. An encoder that cannot open downgrades the stage to JPEG
//! for the rest of the process; a frame the codec rejects is dropped alone.

use std::time::Duration;

use bytes::Bytes;
use cast_capture::frame::CapturedFrame;
use cast_capture::ring::{RingReceiver, RingSender};
use tokio::sync::watch;

use crate::h264::H264Encoder;
use crate::jpeg::JpegFallback;
use crate::{EncodeError, EncodedFrame, KeyframeRequest};

/// Interval between stage counter log lines.
const STATS_INTERVAL: Duration = Duration::from_secs(5);

/// Fixed encoding parameters. Resolution is taken from the frames.
#[derive(Debug, Clone)]
pub struct EncoderSettings {
    pub fps: u32,
    /// Target bitrate in bits per second.
    pub bitrate: u64,
    pub jpeg_quality: u8,
    /// When false the H.264 chain is skipped entirely.
    pub prefer_h264: bool,
}

enum Backend {
    /// Nothing encoded yet; the first frame decides.
    Pending,
    H264(H264Encoder),
    Jpeg(JpegFallback),
}

/// The encode worker between captureQ and encodeQ.
pub struct EncodeStage {
    settings: EncoderSettings,
    keyframe: KeyframeRequest,
    backend: Backend,
    /// Dimensions the open encoder was built for.
    open_size: Option<(u32, u32)>,
    input: RingReceiver<CapturedFrame>,
    output: RingSender<EncodedFrame>,
    encoder_name: watch::Sender<String>,
    encoded: u64,
    dropped: u64,
    error_streak: u64,
}

impl EncodeStage {
    /// Create the stage. The returned watch channel reports the active
    /// encoder name (`pending`, a codec name, or `jpeg`).
    pub fn new(
        settings: EncoderSettings,
        keyframe: KeyframeRequest,
        input: RingReceiver<CapturedFrame>,
        output: RingSender<EncodedFrame>,
    ) -> (Self, watch::Receiver<String>) {
        let (encoder_name, name_rx) = watch::channel(String::from("pending"));
        (
            Self {
                settings,
                keyframe,
                backend: Backend::Pending,
                open_size: None,
                input,
                output,
                encoder_name,
                encoded: 0,
                dropped: 0,
                error_streak: 0,
            },
            name_rx,
        )
    }

    /// Run until the capture ring closes.
    pub async fn run(mut self) {
        let mut last_stats = tokio::time::Instant::now();

        while let Some(frame) = self.input.recv().await {
            self.ensure_backend(frame.width, frame.height);

            // Read-and-clear: concurrent requests between encodes collapse
            // into a single forced I-frame.
            let force = self.keyframe.take();

            if !self.encode_one(&frame, force) {
                break;
            }

            if last_stats.elapsed() >= STATS_INTERVAL {
                last_stats = tokio::time::Instant::now();
                tracing::debug!(
                    encoded = self.encoded,
                    dropped = self.dropped,
                    queue_dropped = self.output.dropped(),
                    "encode counters"
                );
            }
        }

        tracing::info!("Encode stage stopped");
    }

    /// Open or re-open the backend for the given frame dimensions.
    fn ensure_backend(&mut self, width: u32, height: u32) {
        let stale = match self.backend {
            Backend::Pending => true,
            // JPEG is stateless; H.264 contexts are bound to one resolution.
            Backend::H264(_) => self.open_size != Some((width, height)),
            Backend::Jpeg(_) => false,
        };
        if !stale {
            return;
        }

        if matches!(self.backend, Backend::H264(_)) {
            tracing::info!(width, height, "display resolution changed, reopening encoder");
            // At most one codec context exists at a time.
            self.backend = Backend::Pending;
        }

        self.backend = if self.settings.prefer_h264 {
            match H264Encoder::open(width, height, self.settings.fps, self.settings.bitrate) {
                Ok(encoder) => {
                    let _ = self.encoder_name.send(encoder.name().to_string());
                    Backend::H264(encoder)
                }
                Err(e) => {
                    tracing::warn!(error = %e, "H.264 unavailable, falling back to JPEG for this session");
                    let _ = self.encoder_name.send(String::from("jpeg"));
                    Backend::Jpeg(JpegFallback::with_quality(self.settings.jpeg_quality))
                }
            }
        } else {
            let _ = self.encoder_name.send(String::from("jpeg"));
            Backend::Jpeg(JpegFallback::with_quality(self.settings.jpeg_quality))
        };
        self.open_size = Some((width, height));
    }

    /// Encode one frame. Returns `false` once the output ring is closed.
    fn encode_one(&mut self, frame: &CapturedFrame, force_keyframe: bool) -> bool {
        let result: Result<Option<(Vec<u8>, bool)>, EncodeError> = match &mut self.backend {
            Backend::H264(encoder) => encoder.encode(&frame.data, force_keyframe),
            Backend::Jpeg(fallback) => fallback
                .encode(&frame.data, frame.width, frame.height)
                .map(|jpeg| Some((jpeg, true))),
            Backend::Pending => return true,
        };

        match result {
            Ok(Some((data, keyframe))) => {
                self.error_streak = 0;
                self.encoded += 1;
                self.output.send(EncodedFrame {
                    data: Bytes::from(data),
                    cursor_u: frame.cursor_u,
                    cursor_v: frame.cursor_v,
                    keyframe,
                    sequence: frame.sequence,
                })
            }
            // The codec is holding the frame; the sequence gap is preserved.
            Ok(None) => true,
            Err(e) => {
                self.dropped += 1;
                self.error_streak += 1;
                if self.error_streak == 1 {
                    tracing::warn!(error = %e, sequence = frame.sequence, "frame rejected, dropping");
                } else {
                    tracing::trace!(error = %e, streak = self.error_streak, "frame rejected");
                }
                true
            }
        }
    }
}
