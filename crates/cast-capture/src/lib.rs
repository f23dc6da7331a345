// Capture-side plumbing for deskcast-server.
//
// Provides the FrameSource seam to the display capture backend and the
// capture stage that drives the streaming tick:
// - frame.rs: CapturedFrame / AudioChunk types
// - ring.rs: bounded drop-oldest channels between pipeline stages
// - source.rs: FrameSource trait and the synthetic fallback source
// - cursor.rs: cursor sampling and normalization
// - stage.rs: the fixed-cadence capture worker
// - audio_stream.rs: cpal loopback audio source

pub mod audio_stream;
pub mod cursor;
pub mod frame;
pub mod ring;
pub mod source;
pub mod stage;

pub use audio_stream::{AudioCaptureError, AudioCaptureStream, AudioFormat};
pub use cursor::{CursorSampler, FixedCursor};
pub use frame::{AudioChunk, CapturedFrame, ScreenSize};
pub use source::{CaptureError, FrameSource, RawFrame, TestPatternSource};
pub use stage::{CaptureStage, ViewerCount};
