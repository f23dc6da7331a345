//! The fan-out worker.
//!
//! Drains the encoded video ring and the audio packet ring, builds each
//! wire frame once, and pushes it to every eligible session concurrently.
//! Per-session order follows producer order because every session is
//! awaited before the next item; a stuck session only costs the send
//! timeout, after which it is marked closed and skipped.

use std::sync::Arc;
use std::time::Duration;

use cast_capture::ring::RingReceiver;
use cast_encode::EncodedFrame;
use cast_proto::wire;
use futures_util::future::join_all;

use crate::registry::{ClientRegistry, ClientSession, Outbound};

/// Budget for one per-session send before the session is marked for
/// cleanup.
pub const SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Interval between stage counter log lines.
const STATS_INTERVAL: Duration = Duration::from_secs(5);

/// The fan-out worker between the media rings and the session writers.
pub struct FanOut {
    video: RingReceiver<EncodedFrame>,
    audio: RingReceiver<Vec<u8>>,
    registry: Arc<ClientRegistry>,
    send_timeout: Duration,
    video_sent: u64,
    audio_sent: u64,
    gated: u64,
}

impl FanOut {
    pub fn new(
        video: RingReceiver<EncodedFrame>,
        audio: RingReceiver<Vec<u8>>,
        registry: Arc<ClientRegistry>,
    ) -> Self {
        Self {
            video,
            audio,
            registry,
            send_timeout: SEND_TIMEOUT,
            video_sent: 0,
            audio_sent: 0,
            gated: 0,
        }
    }

    #[cfg(test)]
    fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    /// Run until both media rings close.
    pub async fn run(mut self) {
        let mut video_open = true;
        let mut audio_open = true;
        let mut last_stats = tokio::time::Instant::now();

        while video_open || audio_open {
            tokio::select! {
                frame = self.video.recv(), if video_open => match frame {
                    Some(frame) => self.dispatch_video(frame).await,
                    None => video_open = false,
                },
                packet = self.audio.recv(), if audio_open => match packet {
                    Some(packet) => self.dispatch_audio(&packet).await,
                    None => audio_open = false,
                },
            }

            if last_stats.elapsed() >= STATS_INTERVAL {
                last_stats = tokio::time::Instant::now();
                tracing::debug!(
                    video_sent = self.video_sent,
                    audio_sent = self.audio_sent,
                    gated = self.gated,
                    "fan-out counters"
                );
            }
        }

        tracing::info!("Fan-out stage stopped");
    }

    /// Send one video frame to every session that may receive it.
    async fn dispatch_video(&mut self, frame: EncodedFrame) {
        let wire = wire::encode_video(
            frame.keyframe,
            (frame.cursor_u, frame.cursor_v),
            &frame.data,
        );

        let mut sends = Vec::new();
        for session in self.registry.snapshot() {
            if session.is_closed() {
                continue;
            }

            if frame.keyframe {
                // Clear before the send: a request_keyframe racing with
                // this dispatch arms the *next* keyframe instead of being
                // swallowed.
                session.clear_needs_keyframe();
            } else if session.needs_keyframe() {
                // No inter-predicted frames until the session has a
                // reference to predict from.
                self.gated += 1;
                continue;
            }

            session.note_sequence(frame.sequence);
            sends.push(Self::send_one(
                session,
                Outbound::Media(wire.clone()),
                self.send_timeout,
            ));
        }

        if !sends.is_empty() {
            self.video_sent += 1;
            join_all(sends).await;
        }
    }

    /// Audio goes to every open session; it never depends on keyframes.
    async fn dispatch_audio(&mut self, packet: &[u8]) {
        let wire = wire::encode_audio(packet);

        let sends: Vec<_> = self
            .registry
            .snapshot()
            .into_iter()
            .filter(|session| !session.is_closed())
            .map(|session| {
                Self::send_one(session, Outbound::Media(wire.clone()), self.send_timeout)
            })
            .collect();

        if !sends.is_empty() {
            self.audio_sent += 1;
            join_all(sends).await;
        }
    }

    async fn send_one(session: Arc<ClientSession>, message: Outbound, timeout: Duration) {
        if !session.submit_timed(message, timeout).await {
            tracing::warn!(session = session.id, "send stalled past timeout, marking session");
            session.mark_closed();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use cast_capture::ring;
    use cast_capture::stage::ViewerCount;
    use cast_encode::KeyframeRequest;
    use cast_proto::wire::MediaFrame;
    use tokio::sync::mpsc;

    fn encoded(sequence: u64, keyframe: bool) -> EncodedFrame {
        EncodedFrame {
            data: Bytes::from(vec![0xAB; 16]),
            cursor_u: 0.5,
            cursor_v: 0.5,
            keyframe,
            sequence,
        }
    }

    struct Harness {
        registry: Arc<ClientRegistry>,
        video_tx: ring::RingSender<EncodedFrame>,
        audio_tx: ring::RingSender<Vec<u8>>,
        worker: tokio::task::JoinHandle<()>,
    }

    fn start() -> Harness {
        let registry = Arc::new(ClientRegistry::new(
            4,
            ViewerCount::new(),
            KeyframeRequest::new(),
        ));
        let (video_tx, video_rx) = ring::channel(16);
        let (audio_tx, audio_rx) = ring::channel(16);
        let fanout = FanOut::new(video_rx, audio_rx, Arc::clone(&registry));
        let worker = tokio::spawn(fanout.run());
        Harness {
            registry,
            video_tx,
            audio_tx,
            worker,
        }
    }

    async fn finish(harness: Harness) {
        drop(harness.video_tx);
        drop(harness.audio_tx);
        harness.worker.await.unwrap();
    }

    fn attach(harness: &Harness) -> (Arc<ClientSession>, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(32);
        (harness.registry.register(tx).unwrap(), rx)
    }

    fn parse_keyframe(message: &Outbound) -> bool {
        let Outbound::Media(bytes) = message else {
            panic!("expected media frame");
        };
        match wire::parse(bytes).unwrap() {
            MediaFrame::Video { keyframe, .. } => keyframe,
            other => panic!("expected video frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn first_frame_to_a_session_is_a_keyframe() {
        let harness = start();
        let (_session, mut rx) = attach(&harness);

        // P-frames before any keyframe must be gated.
        harness.video_tx.send(encoded(1, false));
        harness.video_tx.send(encoded(2, false));
        harness.video_tx.send(encoded(3, true));
        harness.video_tx.send(encoded(4, false));

        let first = rx.recv().await.unwrap();
        assert!(parse_keyframe(&first));
        let second = rx.recv().await.unwrap();
        assert!(!parse_keyframe(&second));

        finish(harness).await;
    }

    #[tokio::test]
    async fn keyframe_request_gates_until_next_keyframe() {
        let harness = start();
        let (session, mut rx) = attach(&harness);

        harness.video_tx.send(encoded(1, true));
        let _ = rx.recv().await.unwrap();
        assert!(!session.needs_keyframe());

        session.set_needs_keyframe();
        harness.video_tx.send(encoded(2, false));
        harness.video_tx.send(encoded(3, true));

        // The P-frame at sequence 2 is skipped; the next delivery is the
        // keyframe at sequence 3.
        let next = rx.recv().await.unwrap();
        assert!(parse_keyframe(&next));
        assert_eq!(session.last_sequence(), 3);

        finish(harness).await;
    }

    #[tokio::test]
    async fn sequences_are_monotonic_per_session() {
        let harness = start();
        let (session, mut rx) = attach(&harness);

        harness.video_tx.send(encoded(1, true));
        harness.video_tx.send(encoded(5, false));
        harness.video_tx.send(encoded(9, false));

        for _ in 0..3 {
            let _ = rx.recv().await.unwrap();
        }
        // Gaps allowed, order preserved.
        assert_eq!(session.last_sequence(), 9);

        finish(harness).await;
    }

    #[tokio::test]
    async fn audio_flows_regardless_of_keyframe_state() {
        let harness = start();
        let (session, mut rx) = attach(&harness);
        assert!(session.needs_keyframe());

        harness.audio_tx.send(vec![0u8; 8]);

        let Outbound::Media(bytes) = rx.recv().await.unwrap() else {
            panic!("expected media");
        };
        assert!(matches!(
            wire::parse(&bytes).unwrap(),
            MediaFrame::Audio { .. }
        ));

        finish(harness).await;
    }

    #[tokio::test]
    async fn late_joiner_waits_for_its_own_keyframe() {
        let harness = start();
        let (_a, mut rx_a) = attach(&harness);

        harness.video_tx.send(encoded(1, true));
        harness.video_tx.send(encoded(2, false));
        let _ = rx_a.recv().await.unwrap();
        let _ = rx_a.recv().await.unwrap();

        // B connects mid-stream; only keyframes may reach it.
        let (_b, mut rx_b) = attach(&harness);
        harness.video_tx.send(encoded(3, false));
        harness.video_tx.send(encoded(4, true));

        assert!(!parse_keyframe(&rx_a.recv().await.unwrap()));
        let first_b = rx_b.recv().await.unwrap();
        assert!(parse_keyframe(&first_b));

        finish(harness).await;
    }

    #[tokio::test]
    async fn stuck_session_is_marked_not_fatal() {
        let registry = Arc::new(ClientRegistry::new(
            4,
            ViewerCount::new(),
            KeyframeRequest::new(),
        ));
        let (video_tx, video_rx) = ring::channel(16);
        let (audio_tx, audio_rx) = ring::channel(16);
        let fanout = FanOut::new(video_rx, audio_rx, Arc::clone(&registry))
            .with_send_timeout(Duration::from_millis(20));
        let worker = tokio::spawn(fanout.run());

        // A session whose writer queue is full and never drained.
        let (stuck_tx, _stuck_rx) = mpsc::channel(1);
        stuck_tx.try_send(Outbound::Close).unwrap();
        let stuck = registry.register(stuck_tx).unwrap();

        let (healthy_tx, mut healthy_rx) = mpsc::channel(32);
        let healthy = registry.register(healthy_tx).unwrap();

        video_tx.send(encoded(1, true));

        // The healthy session still gets its frame.
        let got = healthy_rx.recv().await.unwrap();
        assert!(parse_keyframe(&got));
        assert!(!healthy.is_closed());

        // The stuck one was aged out, not the whole fan-out.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(stuck.is_closed());

        drop(video_tx);
        drop(audio_tx);
        worker.await.unwrap();
    }
}
