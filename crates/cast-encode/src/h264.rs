//! Hardware-first H.264 encoder chain.
//!
//! Tries NVENC, then AMF, then QuickSync, then software x264. Every family
//! is configured for low latency: no B-frames, a ten-second GOP, constant
//! bitrate and the family's own zero-latency preset. Color conversion from
//! BGRA to YUV420P happens here, through a fast-bilinear swscale context.

use ffmpeg_next as ffmpeg;
use ffmpeg_next::format::Pixel;
use ffmpeg_next::software::scaling::{context::Context as Scaler, flag::Flags as ScalerFlags};
use ffmpeg_next::{codec, encoder, frame, packet, picture, Dictionary, Rational};

use crate::EncodeError;

/// Seconds between forced GOP keyframes.
const GOP_SECONDS: u32 = 10;

/// Encoder fallback chain with per-family zero-latency options, tried in
/// order until one opens.
const ENCODER_CHAIN: &[(&str, &[(&str, &str)])] = &[
    (
        "h264_nvenc",
        &[
            ("preset", "p1"),
            ("tune", "ull"),
            ("zerolatency", "1"),
            ("delay", "0"),
            ("rc", "cbr"),
            ("forced-idr", "1"),
        ],
    ),
    (
        "h264_amf",
        &[
            ("usage", "ultralowlatency"),
            ("rc", "cbr"),
            ("preset", "speed"),
        ],
    ),
    (
        "h264_qsv",
        &[("preset", "veryfast"), ("async_depth", "1")],
    ),
    (
        "libx264",
        &[
            ("preset", "ultrafast"),
            ("tune", "zerolatency"),
            ("nal-hrd", "cbr"),
        ],
    ),
];

/// GOP length for a target frame rate.
#[must_use]
pub fn gop_for(fps: u32) -> u32 {
    fps * GOP_SECONDS
}

/// An open H.264 encoder with its BGRA converter.
///
/// Resolution, frame rate and bitrate are fixed at construction; a display
/// resolution change requires a new instance.
pub struct H264Encoder {
    encoder: encoder::video::Encoder,
    scaler: Scaler,
    width: u32,
    height: u32,
    frame_index: i64,
    name: &'static str,
}

impl H264Encoder {
    /// Open the first encoder in the chain that accepts the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`EncodeError::NoEncoder`] when the whole chain fails; the
    /// encode stage downgrades to JPEG for the rest of the process.
    pub fn open(width: u32, height: u32, fps: u32, bitrate: u64) -> Result<Self, EncodeError> {
        ffmpeg::init().map_err(|e| EncodeError::Open {
            name: "ffmpeg",
            reason: e.to_string(),
        })?;

        for &(name, options) in ENCODER_CHAIN {
            match Self::open_single(name, options, width, height, fps, bitrate) {
                Ok(encoder) => {
                    let scaler = Scaler::get(
                        Pixel::BGRA,
                        width,
                        height,
                        Pixel::YUV420P,
                        width,
                        height,
                        ScalerFlags::FAST_BILINEAR,
                    )
                    .map_err(|e| EncodeError::Open {
                        name,
                        reason: format!("scaler: {e}"),
                    })?;

                    tracing::info!(encoder = name, width, height, fps, bitrate, "H.264 encoder open");
                    return Ok(Self {
                        encoder,
                        scaler,
                        width,
                        height,
                        frame_index: 0,
                        name,
                    });
                }
                Err(e) => {
                    tracing::debug!(encoder = name, error = %e, "encoder unavailable, trying next");
                }
            }
        }

        Err(EncodeError::NoEncoder)
    }

    fn open_single(
        name: &'static str,
        options: &[(&str, &str)],
        width: u32,
        height: u32,
        fps: u32,
        bitrate: u64,
    ) -> Result<encoder::video::Encoder, EncodeError> {
        let open_err = |reason: String| EncodeError::Open { name, reason };

        let codec = encoder::find_by_name(name)
            .ok_or_else(|| open_err("not present in this ffmpeg build".into()))?;

        let ctx = codec::context::Context::new_with_codec(codec);
        let mut video = ctx
            .encoder()
            .video()
            .map_err(|e| open_err(e.to_string()))?;

        video.set_width(width);
        video.set_height(height);
        video.set_format(Pixel::YUV420P);
        video.set_time_base(Rational::new(1, fps as i32));
        video.set_frame_rate(Some(Rational::new(fps as i32, 1)));
        video.set_bit_rate(bitrate as usize);
        video.set_max_bit_rate(bitrate as usize);

        // GOP, B-frame and low-delay fields have no safe setters.
        unsafe {
            let raw = video.as_mut_ptr();
            (*raw).gop_size = gop_for(fps) as i32;
            (*raw).max_b_frames = 0;
            (*raw).flags |= ffmpeg::sys::AV_CODEC_FLAG_LOW_DELAY as i32;
        }

        let mut opts = Dictionary::new();
        for &(key, value) in options {
            opts.set(key, value);
        }
        opts.set("bufsize", &bitrate.to_string());

        video
            .open_as_with(codec, opts)
            .map_err(|e| open_err(e.to_string()))
    }

    /// Name of the codec that opened, for observability.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Encode one tightly packed BGRA frame.
    ///
    /// Returns the concatenated NAL units and the codec's own key flag,
    /// which may exceed requests because of GOP boundaries. `Ok(None)`
    /// means the codec is holding the frame.
    pub fn encode(
        &mut self,
        bgra: &[u8],
        force_keyframe: bool,
    ) -> Result<Option<(Vec<u8>, bool)>, EncodeError> {
        let expected = (self.width as usize) * (self.height as usize) * 4;
        if bgra.len() != expected {
            return Err(EncodeError::Geometry {
                got: bgra.len(),
                width: self.width,
                height: self.height,
            });
        }

        let mut src = frame::Video::new(Pixel::BGRA, self.width, self.height);
        let stride = src.stride(0);
        let row_bytes = (self.width as usize) * 4;
        for row in 0..self.height as usize {
            let line = &bgra[row * row_bytes..(row + 1) * row_bytes];
            let dst = row * stride;
            src.data_mut(0)[dst..dst + row_bytes].copy_from_slice(line);
        }

        let mut yuv = frame::Video::new(Pixel::YUV420P, self.width, self.height);
        self.scaler.run(&src, &mut yuv)?;

        yuv.set_pts(Some(self.frame_index));
        self.frame_index += 1;
        if force_keyframe {
            yuv.set_kind(picture::Type::I);
        }

        self.encoder.send_frame(&yuv)?;

        let mut out = Vec::with_capacity(32 * 1024);
        let mut keyframe = false;
        let mut pkt = ffmpeg::Packet::empty();
        while self.encoder.receive_packet(&mut pkt).is_ok() {
            if let Some(data) = pkt.data() {
                out.extend_from_slice(data);
            }
            keyframe |= pkt.flags().contains(packet::Flags::KEY);
            pkt = ffmpeg::Packet::empty();
        }

        if out.is_empty() {
            Ok(None)
        } else {
            Ok(Some((out, keyframe)))
        }
    }
}
