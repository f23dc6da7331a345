//! Codec contexts and the per-session decode state machine.
//!
//! A session starts `Waiting` and drops every inter-predicted frame until
//! the first self-contained one arrives. A decode error on a keyframe, or
//! a transport reset, sends it back to `Waiting` with a fresh codec
//! context, because the reference chain is unrecoverable at that point.
//!
//! Payloads are handed to the codec through a borrowed packet; the input
//! buffer is never copied and outlives the codec call.

use ffmpeg_next as ffmpeg;
use ffmpeg_next::format::Pixel;
use ffmpeg_next::software::scaling::{context::Context as Scaler, flag::Flags as ScalerFlags};
use ffmpeg_next::{codec, decoder, frame};

use cast_proto::adpcm;
use cast_proto::wire::{self, MediaFrame};

use crate::yuv::{self, ChromaLayout, PackedYuv, SourcePlanes};
use crate::DecodeError;

/// What the decoder emits for the presentation layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Single-channel packed YUV, sampled by the viewer's shader.
    PackedYuv,
    /// Converted RGBA, for presenters without a YUV path.
    Rgba,
}

/// Session decode state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderPhase {
    /// Dropping frames until a keyframe arrives.
    Waiting,
    /// Reference chain intact, decoding everything.
    Streaming,
}

/// A tightly packed RGBA image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RgbaImage {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// One decoded video frame in the session's output mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodedImage {
    Yuv(PackedYuv),
    Rgba(RgbaImage),
}

/// A parsed and decoded wire message.
#[derive(Debug, Clone, PartialEq)]
pub enum ViewerEvent {
    Video {
        image: DecodedImage,
        cursor: (f32, f32),
    },
    Cursor((f32, f32)),
    /// Decoded loopback audio, normalized to `[-1, 1]`.
    Audio(Vec<f32>),
}

/// Whether a frame should reach the codec in the given phase.
fn should_decode(phase: DecoderPhase, keyframe: bool) -> bool {
    keyframe || phase == DecoderPhase::Streaming
}

/// Map a codec pixel format onto the chroma layouts the packer knows.
fn chroma_layout(format: Pixel) -> ChromaLayout {
    match format {
        Pixel::YUV420P | Pixel::YUVJ420P => ChromaLayout::Planar420,
        Pixel::NV12 => ChromaLayout::SemiPlanarUv,
        Pixel::NV21 => ChromaLayout::SemiPlanarVu,
        Pixel::YUV422P | Pixel::YUVJ422P => ChromaLayout::Planar422,
        _ => ChromaLayout::Unknown,
    }
}

enum CodecOutcome {
    SendFailed,
    NoFrame,
    Frame(frame::Video),
}

/// Per-session stream decoder.
pub struct StreamDecoder {
    h264: decoder::Video,
    /// Opened lazily for JPEG fallback payloads.
    mjpeg: Option<decoder::Video>,
    phase: DecoderPhase,
    mode: OutputMode,
    rgba: RgbaConverter,
    dropped_waiting: u64,
}

impl StreamDecoder {
    /// Open a decoder for a fresh session.
    pub fn new(mode: OutputMode) -> Result<Self, DecodeError> {
        ffmpeg::init().map_err(|e| DecodeError::Init(e.to_string()))?;
        Ok(Self {
            h264: open_codec(codec::Id::H264)?,
            mjpeg: None,
            phase: DecoderPhase::Waiting,
            mode,
            rgba: RgbaConverter::new(),
            dropped_waiting: 0,
        })
    }

    #[must_use]
    pub fn phase(&self) -> DecoderPhase {
        self.phase
    }

    /// Frames dropped while waiting for a keyframe.
    #[must_use]
    pub fn dropped_waiting(&self) -> u64 {
        self.dropped_waiting
    }

    /// Reset after a transport reconnect: fresh codec, back to `Waiting`.
    pub fn reset(&mut self) -> Result<(), DecodeError> {
        self.h264 = open_codec(codec::Id::H264)?;
        self.phase = DecoderPhase::Waiting;
        Ok(())
    }

    /// Parse one binary wire message and decode whatever it carries.
    pub fn handle(&mut self, buf: &[u8]) -> Result<Option<ViewerEvent>, DecodeError> {
        match wire::parse(buf)? {
            MediaFrame::Video {
                keyframe,
                cursor,
                payload,
            } => Ok(self
                .push(keyframe, payload)
                .map(|image| ViewerEvent::Video { image, cursor })),
            MediaFrame::LegacyJpeg { cursor, payload } => Ok(self
                .push(true, payload)
                .map(|image| ViewerEvent::Video { image, cursor })),
            MediaFrame::CursorOnly { cursor } => Ok(Some(ViewerEvent::Cursor(cursor))),
            MediaFrame::Audio { payload } => {
                Ok(Some(ViewerEvent::Audio(adpcm::decode_packet_f32(payload)?)))
            }
        }
    }

    /// Decode one video payload, honoring the keyframe state machine.
    pub fn push(&mut self, keyframe: bool, payload: &[u8]) -> Option<DecodedImage> {
        if !should_decode(self.phase, keyframe) {
            self.dropped_waiting += 1;
            tracing::trace!(dropped = self.dropped_waiting, "waiting for keyframe, frame dropped");
            return None;
        }

        // JPEG fallback servers ship complete images; route by signature.
        let is_jpeg = payload.starts_with(&[0xFF, 0xD8]);

        let outcome = if is_jpeg {
            match self.mjpeg_codec() {
                Ok(codec) => run_codec(codec, payload),
                Err(e) => {
                    tracing::warn!(error = %e, "no JPEG decoder available");
                    return None;
                }
            }
        } else {
            run_codec(&mut self.h264, payload)
        };

        match outcome {
            CodecOutcome::Frame(frame) => {
                self.phase = DecoderPhase::Streaming;
                self.convert(&frame)
            }
            CodecOutcome::NoFrame => {
                // The codec accepted the data but holds the picture.
                if keyframe {
                    self.phase = DecoderPhase::Streaming;
                }
                None
            }
            CodecOutcome::SendFailed => {
                if keyframe && !is_jpeg {
                    tracing::warn!("keyframe failed to decode, resetting decoder");
                    self.phase = DecoderPhase::Waiting;
                    if let Err(e) = self.reset() {
                        tracing::error!(error = %e, "decoder reopen failed");
                    }
                }
                None
            }
        }
    }

    fn mjpeg_codec(&mut self) -> Result<&mut decoder::Video, DecodeError> {
        if self.mjpeg.is_none() {
            self.mjpeg = Some(open_codec(codec::Id::MJPEG)?);
        }
        Ok(self.mjpeg.as_mut().expect("just set"))
    }

    /// Convert a decoded frame into the session's output representation.
    fn convert(&mut self, frame: &frame::Video) -> Option<DecodedImage> {
        match self.mode {
            OutputMode::PackedYuv => Some(DecodedImage::Yuv(pack_decoded(frame))),
            OutputMode::Rgba => self.rgba.convert(frame).map(DecodedImage::Rgba),
        }
    }
}

/// Converts decoded frames to tightly packed RGBA through a cached
/// swscale context, rebuilt when the source format or size changes.
struct RgbaConverter {
    scaler: Option<(Pixel, u32, u32, Scaler)>,
}

impl RgbaConverter {
    fn new() -> Self {
        Self { scaler: None }
    }

    fn convert(&mut self, frame: &frame::Video) -> Option<RgbaImage> {
        let (width, height, format) = (frame.width(), frame.height(), frame.format());

        let rebuild = !matches!(
            &self.scaler,
            Some((f, w, h, _)) if *f == format && *w == width && *h == height
        );
        if rebuild {
            match Scaler::get(
                format,
                width,
                height,
                Pixel::RGBA,
                width,
                height,
                ScalerFlags::FAST_BILINEAR,
            ) {
                Ok(ctx) => self.scaler = Some((format, width, height, ctx)),
                Err(e) => {
                    tracing::warn!(error = %e, ?format, "cannot build RGBA converter");
                    return None;
                }
            }
        }

        let (_, _, _, scaler) = self.scaler.as_mut()?;
        let mut rgba = frame::Video::empty();
        if let Err(e) = scaler.run(frame, &mut rgba) {
            tracing::warn!(error = %e, "RGBA conversion failed");
            return None;
        }

        // The scaled frame's rows carry alignment padding; trim to a tight
        // width * 4 layout.
        let stride = rgba.stride(0);
        let row_bytes = (width as usize) * 4;
        let mut data = vec![0u8; row_bytes * height as usize];
        for row in 0..height as usize {
            let from = row * stride;
            data[row * row_bytes..(row + 1) * row_bytes]
                .copy_from_slice(&rgba.data(0)[from..from + row_bytes]);
        }

        Some(RgbaImage {
            data,
            width,
            height,
        })
    }
}

fn open_codec(id: codec::Id) -> Result<decoder::Video, DecodeError> {
    let found = decoder::find(id)
        .ok_or_else(|| DecodeError::Init(format!("no decoder for {id:?}")))?;
    let ctx = codec::context::Context::new_with_codec(found);
    ctx.decoder()
        .video()
        .map_err(|e| DecodeError::Init(e.to_string()))
}

/// Feed one payload into a codec without copying it, then drain output.
fn run_codec(codec: &mut decoder::Video, payload: &[u8]) -> CodecOutcome {
    // The borrowed packet's lifetime covers both codec calls below.
    let packet = ffmpeg::Packet::borrow(payload);
    if let Err(e) = codec.send_packet(&packet) {
        tracing::debug!(error = %e, "codec rejected packet");
        return CodecOutcome::SendFailed;
    }

    let mut newest: Option<frame::Video> = None;
    loop {
        let mut decoded = frame::Video::empty();
        if codec.receive_frame(&mut decoded).is_err() {
            break;
        }
        newest = Some(decoded);
    }

    match newest {
        Some(frame) => CodecOutcome::Frame(frame),
        None => CodecOutcome::NoFrame,
    }
}

/// Pack a decoded frame's planes into the single-texture layout.
fn pack_decoded(frame: &frame::Video) -> PackedYuv {
    let layout = chroma_layout(frame.format());
    let planes = frame.planes();

    let empty: &[u8] = &[];
    let (y, y_stride) = if planes > 0 {
        (frame.data(0), frame.stride(0))
    } else {
        (empty, 0)
    };
    let (u, u_stride) = if planes > 1 {
        (frame.data(1), frame.stride(1))
    } else {
        (empty, 0)
    };
    let (v, v_stride) = if planes > 2 {
        (frame.data(2), frame.stride(2))
    } else {
        (empty, 0)
    };

    // A layout that promises planes it does not have degrades to Y-only.
    let layout = match layout {
        ChromaLayout::Planar420 | ChromaLayout::Planar422 if planes < 3 => ChromaLayout::Unknown,
        ChromaLayout::SemiPlanarUv | ChromaLayout::SemiPlanarVu if planes < 2 => {
            ChromaLayout::Unknown
        }
        other => other,
    };

    yuv::pack(&SourcePlanes {
        layout,
        width: frame.width(),
        height: frame.height(),
        y,
        y_stride,
        u,
        u_stride,
        v,
        v_stride,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn waiting_drops_inter_frames() {
        assert!(!should_decode(DecoderPhase::Waiting, false));
        assert!(should_decode(DecoderPhase::Waiting, true));
    }

    #[test]
    fn streaming_accepts_everything() {
        assert!(should_decode(DecoderPhase::Streaming, false));
        assert!(should_decode(DecoderPhase::Streaming, true));
    }

    #[test]
    fn chroma_layouts_cover_the_wire_formats() {
        assert_eq!(chroma_layout(Pixel::YUV420P), ChromaLayout::Planar420);
        assert_eq!(chroma_layout(Pixel::YUVJ420P), ChromaLayout::Planar420);
        assert_eq!(chroma_layout(Pixel::NV12), ChromaLayout::SemiPlanarUv);
        assert_eq!(chroma_layout(Pixel::NV21), ChromaLayout::SemiPlanarVu);
        assert_eq!(chroma_layout(Pixel::YUV422P), ChromaLayout::Planar422);
        assert_eq!(chroma_layout(Pixel::RGB24), ChromaLayout::Unknown);
    }

    /// A frame with constant luma and chroma across every plane.
    fn flat_frame(format: Pixel, width: u32, height: u32, luma: u8, chroma: u8) -> frame::Video {
        ffmpeg::init().expect("ffmpeg init");
        let mut frame = frame::Video::new(format, width, height);
        frame.data_mut(0).fill(luma);
        for plane in 1..frame.planes() {
            frame.data_mut(plane).fill(chroma);
        }
        frame
    }

    #[test]
    fn rgba_conversion_trims_row_padding() {
        let mut converter = RgbaConverter::new();
        // Width 10 makes 40-byte rows, below the scaler's alignment, so
        // the output stride carries padding the copy loop must drop.
        let frame = flat_frame(Pixel::YUV420P, 10, 4, 128, 128);

        let image = converter.convert(&frame).expect("conversion");
        assert_eq!(image.width, 10);
        assert_eq!(image.height, 4);
        assert_eq!(image.data.len(), 10 * 4 * 4);

        // Neutral chroma comes out grey and fully opaque.
        for px in image.data.chunks_exact(4) {
            assert_eq!(px[3], 255);
            assert!((i16::from(px[0]) - i16::from(px[1])).abs() <= 4);
            assert!((i16::from(px[1]) - i16::from(px[2])).abs() <= 4);
        }
    }

    #[test]
    fn rgba_scaler_rebuilds_on_format_and_size_change() {
        let mut converter = RgbaConverter::new();

        let planar = converter
            .convert(&flat_frame(Pixel::YUV420P, 16, 8, 60, 128))
            .expect("planar conversion");
        assert_eq!((planar.width, planar.height), (16, 8));
        assert_eq!(planar.data.len(), 16 * 8 * 4);

        // Same size, different layout: the cached context must not be
        // reused for NV12 input.
        let semi = converter
            .convert(&flat_frame(Pixel::NV12, 16, 8, 60, 128))
            .expect("semi-planar conversion");
        assert_eq!(semi.data.len(), 16 * 8 * 4);

        let grown = converter
            .convert(&flat_frame(Pixel::YUV420P, 32, 16, 60, 128))
            .expect("resized conversion");
        assert_eq!((grown.width, grown.height), (32, 16));
        assert_eq!(grown.data.len(), 32 * 16 * 4);
    }

    #[test]
    fn rgba_output_is_stable_across_frames_of_one_session() {
        let mut converter = RgbaConverter::new();

        let first = converter
            .convert(&flat_frame(Pixel::YUV420P, 16, 8, 40, 128))
            .expect("first frame");
        let second = converter
            .convert(&flat_frame(Pixel::YUV420P, 16, 8, 40, 128))
            .expect("second frame");

        // Same input through the cached context yields identical output.
        assert_eq!(first, second);
    }
}
