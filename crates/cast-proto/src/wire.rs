//! Binary media frame layout.
//!
//! Every media message starts with a type byte. Video and cursor frames
//! carry the cursor position as two little-endian `f32`s right after it;
//! audio frames skip the cursor and go straight to the packet payload.
//!
//! ```text
//! offset 0  u8   frame type (0 = delta, 1 = key, 2 = cursor-only, 3 = audio)
//! offset 1  f32  cursor u      (types 0, 1, 2)
//! offset 5  f32  cursor v      (types 0, 1, 2)
//! offset 9  ..   codec payload (types 0, 1)
//! ```
//!
//! Older servers sent `cursor_u`, `cursor_v`, then raw JPEG bytes with no
//! type byte. The parser still accepts that shape so viewers can talk to
//! both generations.

use bytes::{BufMut, Bytes, BytesMut};

/// Inter-predicted video frame.
pub const FRAME_TYPE_DELTA: u8 = 0;
/// Self-contained video frame (I-frame or a JPEG image).
pub const FRAME_TYPE_KEY: u8 = 1;
/// Cursor position update without pixels.
pub const FRAME_TYPE_CURSOR: u8 = 2;
/// IMA-ADPCM audio packet.
pub const FRAME_TYPE_AUDIO: u8 = 3;

/// Type byte + two cursor floats.
pub const VIDEO_HEADER_LEN: usize = 9;
/// Cursor-only frames are exactly the video header.
pub const CURSOR_FRAME_LEN: usize = 9;
/// Two cursor floats, no type byte.
const LEGACY_HEADER_LEN: usize = 8;

/// A parsed media frame, borrowing the payload from the input buffer.
#[derive(Debug, PartialEq)]
pub enum MediaFrame<'a> {
    Video {
        keyframe: bool,
        cursor: (f32, f32),
        payload: &'a [u8],
    },
    CursorOnly {
        cursor: (f32, f32),
    },
    Audio {
        payload: &'a [u8],
    },
    /// Pre-type-byte frame: cursor floats followed by a JPEG image.
    LegacyJpeg {
        cursor: (f32, f32),
        payload: &'a [u8],
    },
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum WireError {
    #[error("media frame of {0} bytes is too short")]
    Truncated(usize),

    #[error("audio packet of {0} bytes is shorter than its header")]
    AudioTruncated(usize),
}

/// Build a video frame in a single allocation.
#[must_use]
pub fn encode_video(keyframe: bool, cursor: (f32, f32), payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(VIDEO_HEADER_LEN + payload.len());
    buf.put_u8(if keyframe { FRAME_TYPE_KEY } else { FRAME_TYPE_DELTA });
    buf.put_f32_le(cursor.0);
    buf.put_f32_le(cursor.1);
    buf.put_slice(payload);
    buf.freeze()
}

/// Build a cursor-only frame.
#[must_use]
pub fn encode_cursor_only(cursor: (f32, f32)) -> Bytes {
    let mut buf = BytesMut::with_capacity(CURSOR_FRAME_LEN);
    buf.put_u8(FRAME_TYPE_CURSOR);
    buf.put_f32_le(cursor.0);
    buf.put_f32_le(cursor.1);
    buf.freeze()
}

/// Wrap an ADPCM packet (header + nibbles) as an audio frame.
#[must_use]
pub fn encode_audio(packet: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(1 + packet.len());
    buf.put_u8(FRAME_TYPE_AUDIO);
    buf.put_slice(packet);
    buf.freeze()
}

/// Parse a binary media frame.
///
/// Unrecognized leading bytes and under-length typed frames are treated as
/// the legacy cursor+JPEG shape when they are long enough for it.
pub fn parse(buf: &[u8]) -> Result<MediaFrame<'_>, WireError> {
    if let Some(frame) = parse_typed(buf) {
        return Ok(frame);
    }

    // A recognized audio type byte with nothing behind it is a truncated
    // audio frame, not a legacy candidate.
    if buf.first() == Some(&FRAME_TYPE_AUDIO) {
        return Err(WireError::AudioTruncated(buf.len()));
    }

    // Legacy: 4-byte u, 4-byte v, JPEG bytes, no type byte.
    if buf.len() >= LEGACY_HEADER_LEN {
        return Ok(MediaFrame::LegacyJpeg {
            cursor: read_cursor(&buf[0..]),
            payload: &buf[LEGACY_HEADER_LEN..],
        });
    }

    Err(WireError::Truncated(buf.len()))
}

fn parse_typed(buf: &[u8]) -> Option<MediaFrame<'_>> {
    let (&ty, rest) = buf.split_first()?;
    match ty {
        FRAME_TYPE_DELTA | FRAME_TYPE_KEY if buf.len() > VIDEO_HEADER_LEN => {
            Some(MediaFrame::Video {
                keyframe: ty == FRAME_TYPE_KEY,
                cursor: read_cursor(rest),
                payload: &buf[VIDEO_HEADER_LEN..],
            })
        }
        FRAME_TYPE_CURSOR if buf.len() == CURSOR_FRAME_LEN => Some(MediaFrame::CursorOnly {
            cursor: read_cursor(rest),
        }),
        FRAME_TYPE_AUDIO if !rest.is_empty() => Some(MediaFrame::Audio { payload: rest }),
        _ => None,
    }
}

fn read_cursor(buf: &[u8]) -> (f32, f32) {
    let u = f32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
    let v = f32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
    (u, v)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn video_frame_roundtrip() {
        let payload = [0u8, 0, 0, 1, 0x65, 0x88];
        let wire = encode_video(true, (0.25, 0.75), &payload);

        assert_eq!(wire.len(), VIDEO_HEADER_LEN + payload.len());
        assert_eq!(wire[0], FRAME_TYPE_KEY);

        match parse(&wire).unwrap() {
            MediaFrame::Video {
                keyframe,
                cursor,
                payload: parsed,
            } => {
                assert!(keyframe);
                assert_eq!(cursor, (0.25, 0.75));
                assert_eq!(parsed, &payload);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn delta_frame_type_byte() {
        let wire = encode_video(false, (0.0, 0.0), &[1, 2, 3]);
        assert_eq!(wire[0], FRAME_TYPE_DELTA);
        assert!(matches!(
            parse(&wire).unwrap(),
            MediaFrame::Video { keyframe: false, .. }
        ));
    }

    #[test]
    fn cursor_only_roundtrip() {
        let wire = encode_cursor_only((1.0, 0.5));
        assert_eq!(wire.len(), CURSOR_FRAME_LEN);
        assert_eq!(
            parse(&wire).unwrap(),
            MediaFrame::CursorOnly { cursor: (1.0, 0.5) }
        );
    }

    #[test]
    fn audio_frame_skips_cursor() {
        let packet = [0u8, 0, 0, 0, 0, 0, 0x07];
        let wire = encode_audio(&packet);
        assert_eq!(wire[0], FRAME_TYPE_AUDIO);
        match parse(&wire).unwrap() {
            MediaFrame::Audio { payload } => assert_eq!(payload, &packet),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn legacy_jpeg_detected_by_unknown_type_byte() {
        // JPEG SOI marker 0xFF is not a recognized type byte, so the first
        // 8 bytes must be read as cursor floats.
        let mut wire = Vec::new();
        wire.extend_from_slice(&0.5f32.to_le_bytes());
        wire.extend_from_slice(&0.5f32.to_le_bytes());
        wire.extend_from_slice(&[0xFF, 0xD8, 0xFF, 0xE0]);

        match parse(&wire).unwrap() {
            MediaFrame::LegacyJpeg { cursor, payload } => {
                assert_eq!(cursor, (0.5, 0.5));
                assert_eq!(payload, &[0xFF, 0xD8, 0xFF, 0xE0]);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn typed_frame_below_minimum_falls_back_to_legacy() {
        // Starts with 0x01 but is too short for a typed video frame; long
        // enough for the legacy shape, so it parses as legacy.
        let buf = [1u8, 0, 0, 0, 0, 0, 0, 0];
        assert!(matches!(parse(&buf).unwrap(), MediaFrame::LegacyJpeg { .. }));
    }

    #[test]
    fn audio_frame_without_payload_is_an_error() {
        assert_eq!(
            parse(&[FRAME_TYPE_AUDIO]),
            Err(WireError::AudioTruncated(1))
        );
    }

    #[test]
    fn short_buffer_is_an_error() {
        assert_eq!(parse(&[0u8; 4]), Err(WireError::Truncated(4)));
        assert_eq!(parse(&[]), Err(WireError::Truncated(0)));
    }
}
