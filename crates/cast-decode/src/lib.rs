// Viewer-side decoding for deskcast.
//
// Parses wire frames and turns H.264 (or fallback JPEG) payloads into
// pixel buffers the presentation layer can upload directly:
// - yuv.rs: packed single-texture YUV layout and plane conversions
// - decoder.rs: codec contexts and the waiting-for-keyframe state machine

pub mod decoder;
pub mod yuv;

pub use decoder::{DecodedImage, DecoderPhase, OutputMode, RgbaImage, StreamDecoder, ViewerEvent};
pub use yuv::{ChromaLayout, PackedYuv, SourcePlanes, NEUTRAL_CHROMA};

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("failed to open decoder: {0}")]
    Init(String),

    #[error("wire frame rejected: {0}")]
    Wire(#[from] cast_proto::wire::WireError),

    #[error("audio packet rejected: {0}")]
    Audio(#[from] cast_proto::adpcm::AdpcmError),
}
