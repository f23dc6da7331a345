//! The capture worker.
//!
//! Drives a fixed-interval tick at the target frame rate. Every tick with
//! at least one viewer attached produces exactly one frame on the capture
//! ring: fresh display content when the backend has some, otherwise a
//! replay of the cached last frame with the current cursor position. The
//! stream therefore never goes silent while viewers are connected, which
//! keeps socket keepalives healthy and lets inter-predicting codecs run
//! cheaply over unchanged content.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::cursor::{normalize, CursorSampler};
use crate::frame::CapturedFrame;
use crate::ring::RingSender;
use crate::source::{FrameSource, RawFrame};

/// How long one tick waits for fresh display content before replaying the
/// cached frame.
const CAPTURE_POLL: Duration = Duration::from_millis(10);

/// Interval between stage counter log lines.
const STATS_INTERVAL: Duration = Duration::from_secs(5);

/// Number of attached viewers, shared between the session registry and the
/// capture stage. Capture work is skipped entirely while it is zero.
#[derive(Debug, Clone, Default)]
pub struct ViewerCount(Arc<AtomicUsize>);

impl ViewerCount {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self) -> usize {
        self.0.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn remove(&self) {
        let previous = self.0.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "viewer count underflow");
    }

    #[must_use]
    pub fn get(&self) -> usize {
        self.0.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.get() == 0
    }
}

/// Pixels and dimensions of the most recent capture. Private to the stage;
/// nothing downstream reads it.
struct LastFrame {
    data: Vec<u8>,
    width: u32,
    height: u32,
}

/// The capture worker. Owns the frame source, the cursor sampler and the
/// last-frame cache.
pub struct CaptureStage<S: FrameSource, C: CursorSampler> {
    source: S,
    cursor: C,
    viewers: ViewerCount,
    out: RingSender<CapturedFrame>,
    fps: u32,
    last: Option<LastFrame>,
    sequence: u64,
    captured: u64,
    duplicated: u64,
    error_streak: u64,
}

impl<S: FrameSource, C: CursorSampler> CaptureStage<S, C> {
    pub fn new(
        source: S,
        cursor: C,
        viewers: ViewerCount,
        out: RingSender<CapturedFrame>,
        fps: u32,
    ) -> Self {
        Self {
            source,
            cursor,
            viewers,
            out,
            fps: fps.max(1),
            last: None,
            sequence: 0,
            captured: 0,
            duplicated: 0,
            error_streak: 0,
        }
    }

    /// Run the capture tick until shutdown or the pipeline goes away.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let period = Duration::from_secs(1) / self.fps;
        let mut tick = tokio::time::interval(period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut last_stats = tokio::time::Instant::now();

        tracing::info!(fps = self.fps, ?period, "Capture stage running");

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = tick.tick() => {
                    if self.viewers.is_empty() {
                        continue;
                    }
                    if !self.produce_one() {
                        break;
                    }
                    if last_stats.elapsed() >= STATS_INTERVAL {
                        last_stats = tokio::time::Instant::now();
                        tracing::debug!(
                            captured = self.captured,
                            duplicated = self.duplicated,
                            queue_dropped = self.out.dropped(),
                            "capture counters"
                        );
                    }
                }
            }
        }

        tracing::info!("Capture stage stopped");
    }

    /// Produce exactly one frame for this tick. Returns `false` once the
    /// capture ring is closed.
    fn produce_one(&mut self) -> bool {
        let size = self.source.size();
        let (cursor_u, cursor_v) = normalize(self.cursor.position(), size);

        // The raw frame borrows the source, so the fresh-frame path works
        // on the cache and counters as plain fields.
        let frame = match self.source.next_frame(CAPTURE_POLL) {
            Ok(Some(raw)) => {
                self.error_streak = 0;
                self.captured += 1;
                fresh_frame(
                    &mut self.last,
                    &mut self.sequence,
                    &raw,
                    cursor_u,
                    cursor_v,
                )
            }
            Ok(None) => match self.replay(cursor_u, cursor_v) {
                Some(frame) => frame,
                // Nothing was ever captured; synthesize so a waiting viewer
                // has something to key off.
                None => match self.source.grab_now() {
                    Ok(raw) => {
                        self.captured += 1;
                        fresh_frame(
                            &mut self.last,
                            &mut self.sequence,
                            &raw,
                            cursor_u,
                            cursor_v,
                        )
                    }
                    Err(e) => {
                        self.note_error(&e);
                        return true;
                    }
                },
            },
            Err(e) => {
                self.note_error(&e);
                match self.replay(cursor_u, cursor_v) {
                    Some(frame) => frame,
                    None => return true,
                }
            }
        };

        self.out.send(frame)
    }

    /// Re-emit the cached frame with the current cursor.
    fn replay(&mut self, cursor_u: f32, cursor_v: f32) -> Option<CapturedFrame> {
        let cache = self.last.as_ref()?;
        self.sequence += 1;
        self.captured += 1;
        self.duplicated += 1;
        Some(CapturedFrame {
            data: cache.data.clone(),
            width: cache.width,
            height: cache.height,
            cursor_u,
            cursor_v,
            sequence: self.sequence,
            duplicate: true,
        })
    }

    fn note_error(&mut self, error: &crate::source::CaptureError) {
        self.error_streak += 1;
        if self.error_streak == 1 {
            tracing::warn!(%error, "capture failed, replaying cached frame");
        } else {
            tracing::trace!(%error, streak = self.error_streak, "capture still failing");
        }
    }
}

/// Copy the raw pixels into a fresh buffer and refresh the cache.
///
/// Buffers are never pooled across stages: the emitted frame outlives this
/// tick while encoding proceeds.
fn fresh_frame(
    last: &mut Option<LastFrame>,
    sequence: &mut u64,
    raw: &RawFrame<'_>,
    cursor_u: f32,
    cursor_v: f32,
) -> CapturedFrame {
    let data = raw.data.to_vec();

    match last.as_mut() {
        Some(cache) if cache.width == raw.width && cache.height == raw.height => {
            cache.data.copy_from_slice(raw.data);
        }
        _ => {
            *last = Some(LastFrame {
                data: raw.data.to_vec(),
                width: raw.width,
                height: raw.height,
            });
        }
    }

    *sequence += 1;
    CapturedFrame {
        data,
        width: raw.width,
        height: raw.height,
        cursor_u,
        cursor_v,
        sequence: *sequence,
        duplicate: false,
    }
}
