//! Pipeline bootstrap and shutdown.
//!
//! Wires the four workers together: capture -> [captureQ] -> encode ->
//! [encodeQ] -> fan-out, with the audio stage feeding [audioQ] on the
//! side. Shutdown unwinds in producer order: the capture and audio
//! stages stop first, their rings drain and close, and the downstream
//! consumers run out naturally.

use std::sync::Arc;

use cast_capture::cursor::CursorSampler;
use cast_capture::ring;
use cast_capture::source::FrameSource;
use cast_capture::stage::{CaptureStage, ViewerCount};
use cast_capture::{AudioCaptureStream, CapturedFrame};
use cast_encode::stage::{EncodeStage, EncoderSettings};
use cast_encode::KeyframeRequest;
use cast_proto::control;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::audio::AudioStage;
use crate::config::ServerConfig;
use crate::fanout::FanOut;
use crate::registry::{ClientRegistry, Outbound};

/// Loopback chunks buffered between the capture callback and the audio
/// stage.
const AUDIO_SOURCE_DEPTH: usize = 32;

/// The running pipeline.
pub struct Pipeline {
    /// Active encoder name (`pending`, a codec name, or `jpeg`).
    pub encoder_name: watch::Receiver<String>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    /// Keeps the loopback capture thread alive.
    _audio_capture: Option<AudioCaptureStream>,
}

impl Pipeline {
    /// Spawn all stage workers.
    pub fn start<S, C>(
        config: &ServerConfig,
        source: S,
        cursor: C,
        viewers: ViewerCount,
        keyframe: KeyframeRequest,
        registry: Arc<ClientRegistry>,
    ) -> Self
    where
        S: FrameSource + 'static,
        C: CursorSampler + 'static,
    {
        let (shutdown, _) = watch::channel(false);
        let mut tasks = Vec::new();

        let depth = config.pipeline.queue_depth.max(1);
        let (capture_tx, capture_rx) = ring::channel::<CapturedFrame>(depth);
        let (encode_tx, encode_rx) = ring::channel(depth);
        let (audio_tx, audio_rx) = ring::channel(config.pipeline.audio_queue_depth.max(1));

        let capture = CaptureStage::new(source, cursor, viewers, capture_tx, config.capture.fps);
        tasks.push(tokio::spawn(capture.run(shutdown.subscribe())));

        let settings = EncoderSettings {
            fps: config.capture.fps,
            bitrate: config.bitrate_bps(),
            jpeg_quality: config.encode.jpeg_quality,
            prefer_h264: config.encode.h264,
        };
        let (encode, encoder_name) =
            EncodeStage::new(settings, keyframe, capture_rx, encode_tx);
        tasks.push(tokio::spawn(encode.run()));

        let audio_capture = if config.audio.enabled {
            match AudioCaptureStream::start(AUDIO_SOURCE_DEPTH) {
                Ok((capture_handle, chunk_rx, format)) => {
                    tracing::info!(
                        device = %format.device_name,
                        source_rate = format.sample_rate,
                        "audio stage enabled"
                    );
                    let stage = AudioStage::new(chunk_rx, audio_tx, config.audio.sample_rate);
                    tasks.push(tokio::spawn(stage.run(shutdown.subscribe())));
                    Some(capture_handle)
                }
                Err(e) => {
                    tracing::warn!(error = %e, "audio disabled for this process");
                    None
                }
            }
        } else {
            tracing::info!("audio disabled by configuration");
            None
        };

        let fanout = FanOut::new(encode_rx, audio_rx, Arc::clone(&registry));
        tasks.push(tokio::spawn(fanout.run()));

        tasks.push(tokio::spawn(notify_on_jpeg_fallback(
            encoder_name.clone(),
            registry,
        )));

        Self {
            encoder_name,
            shutdown,
            tasks,
            _audio_capture: audio_capture,
        }
    }

    /// Stop producers first, then wait for the consumers to drain out.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
    }
}

/// Tell connected viewers when the encoder downgrades to JPEG.
async fn notify_on_jpeg_fallback(
    mut encoder_name: watch::Receiver<String>,
    registry: Arc<ClientRegistry>,
) {
    while encoder_name.changed().await.is_ok() {
        let name = encoder_name.borrow_and_update().clone();
        if name == "jpeg" {
            let text = control::status("video: no H.264 encoder, streaming JPEG");
            for session in registry.snapshot() {
                let _ = session.try_submit(Outbound::Control(text.clone()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cast_capture::cursor::FixedCursor;
    use cast_capture::frame::ScreenSize;
    use cast_capture::source::TestPatternSource;
    use cast_proto::wire::{self, MediaFrame};
    use tokio::sync::mpsc;

    fn test_config() -> ServerConfig {
        let mut config = ServerConfig::default();
        config.capture.width = 32;
        config.capture.height = 16;
        config.capture.fps = 60;
        config.encode.h264 = false; // JPEG keeps the test hermetic
        config.audio.enabled = false;
        config
    }

    /// End-to-end through capture, encode and fan-out with a live session.
    #[tokio::test(start_paused = true)]
    async fn frames_flow_from_capture_to_session() {
        let config = test_config();
        let size = ScreenSize::new(config.capture.width, config.capture.height);
        let viewers = ViewerCount::new();
        let keyframe = KeyframeRequest::new();
        let registry = Arc::new(ClientRegistry::new(
            config.max_clients,
            viewers.clone(),
            keyframe.clone(),
        ));

        let pipeline = Pipeline::start(
            &config,
            TestPatternSource::with_change_interval(size, 3),
            FixedCursor::centered(size),
            viewers,
            keyframe,
            Arc::clone(&registry),
        );

        let (tx, mut rx) = mpsc::channel(64);
        let _session = registry.register(tx).unwrap();

        // The session's first delivered video frame must be standalone.
        let Some(Outbound::Media(first)) = rx.recv().await else {
            panic!("expected media");
        };
        match wire::parse(&first).unwrap() {
            MediaFrame::Video {
                keyframe, payload, ..
            } => {
                assert!(keyframe, "first frame must be a keyframe");
                assert_eq!(&payload[..2], &[0xFF, 0xD8], "JPEG fallback payload");
            }
            other => panic!("expected video, got {other:?}"),
        }

        // And the stream keeps flowing even though the pattern only
        // changes every third tick.
        for _ in 0..5 {
            let Some(Outbound::Media(frame)) = rx.recv().await else {
                panic!("stream stopped");
            };
            assert!(matches!(
                wire::parse(&frame).unwrap(),
                MediaFrame::Video { .. }
            ));
        }

        pipeline.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_terminates_all_stages() {
        let config = test_config();
        let size = ScreenSize::new(config.capture.width, config.capture.height);
        let viewers = ViewerCount::new();
        let keyframe = KeyframeRequest::new();
        let registry = Arc::new(ClientRegistry::new(
            config.max_clients,
            viewers.clone(),
            keyframe.clone(),
        ));

        let pipeline = Pipeline::start(
            &config,
            TestPatternSource::new(size),
            FixedCursor::centered(size),
            viewers,
            keyframe,
            registry,
        );

        // Must complete; a hung stage would wedge this await.
        tokio::time::timeout(std::time::Duration::from_secs(30), pipeline.shutdown())
            .await
            .expect("shutdown should not hang");
    }
}
