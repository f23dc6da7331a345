//! Connected viewer sessions.
//!
//! One [`ClientSession`] per attached viewer. The session's inbound reader
//! is the only writer of its registry entry; every other component reads
//! session atomics or takes a snapshot of the map. Removal is idempotent
//! and allowed from any task.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use cast_capture::stage::ViewerCount;
use cast_encode::KeyframeRequest;
use tokio::sync::mpsc;

/// A message queued to a session's socket writer.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// Binary media frame.
    Media(Bytes),
    /// JSON control message.
    Control(String),
    /// Close the socket and end the writer.
    Close,
}

/// One attached viewer.
pub struct ClientSession {
    pub id: u64,
    needs_keyframe: AtomicBool,
    /// Sequence of the last frame dispatched; -1 until the first send.
    last_sequence: AtomicI64,
    protocol_version: AtomicU32,
    closed: AtomicBool,
    submit: mpsc::Sender<Outbound>,
}

impl ClientSession {
    fn new(id: u64, submit: mpsc::Sender<Outbound>) -> Self {
        Self {
            id,
            // A fresh session must start on a self-contained frame.
            needs_keyframe: AtomicBool::new(true),
            last_sequence: AtomicI64::new(-1),
            protocol_version: AtomicU32::new(1),
            closed: AtomicBool::new(false),
            submit,
        }
    }

    #[must_use]
    pub fn needs_keyframe(&self) -> bool {
        self.needs_keyframe.load(Ordering::Acquire)
    }

    pub fn set_needs_keyframe(&self) {
        self.needs_keyframe.store(true, Ordering::Release);
    }

    /// Cleared *before* a keyframe send so a request arriving mid-send
    /// still arms another one.
    pub fn clear_needs_keyframe(&self) {
        self.needs_keyframe.store(false, Ordering::Release);
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Mark the session dead; fan-out skips it until the reader removes it.
    pub fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn record_version(&self, version: u32) {
        self.protocol_version.store(version, Ordering::Release);
    }

    #[must_use]
    pub fn version(&self) -> u32 {
        self.protocol_version.load(Ordering::Acquire)
    }

    /// Record a dispatched frame sequence.
    pub fn note_sequence(&self, sequence: u64) {
        self.last_sequence
            .store(sequence as i64, Ordering::Release);
    }

    #[must_use]
    pub fn last_sequence(&self) -> i64 {
        self.last_sequence.load(Ordering::Acquire)
    }

    /// Non-blocking submit, for control replies.
    pub fn try_submit(&self, message: Outbound) -> bool {
        self.submit.try_send(message).is_ok()
    }

    /// Submit with the fan-out send budget. `false` means the session's
    /// writer queue stayed full past the timeout or is gone.
    pub async fn submit_timed(&self, message: Outbound, timeout: Duration) -> bool {
        self.submit.send_timeout(message, timeout).await.is_ok()
    }
}

impl std::fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSession")
            .field("id", &self.id)
            .field("needs_keyframe", &self.needs_keyframe())
            .field("last_sequence", &self.last_sequence())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Refused connection beyond the configured capacity.
#[derive(Debug, thiserror::Error)]
#[error("viewer limit reached ({capacity} connected)")]
pub struct RegistryFull {
    pub capacity: usize,
}

/// The session map.
pub struct ClientRegistry {
    sessions: Mutex<HashMap<u64, Arc<ClientSession>>>,
    viewers: ViewerCount,
    keyframe: KeyframeRequest,
    capacity: usize,
    next_id: AtomicU64,
}

impl ClientRegistry {
    pub fn new(capacity: usize, viewers: ViewerCount, keyframe: KeyframeRequest) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            viewers,
            keyframe,
            capacity: capacity.max(1),
            next_id: AtomicU64::new(1),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, Arc<ClientSession>>> {
        self.sessions
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Admit a new viewer.
    ///
    /// Arms both the session's own keyframe flag and the process-wide
    /// request so the encoder produces a fresh I-frame for it.
    pub fn register(
        &self,
        submit: mpsc::Sender<Outbound>,
    ) -> Result<Arc<ClientSession>, RegistryFull> {
        let mut sessions = self.lock();
        if sessions.len() >= self.capacity {
            return Err(RegistryFull {
                capacity: self.capacity,
            });
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let session = Arc::new(ClientSession::new(id, submit));
        sessions.insert(id, Arc::clone(&session));
        drop(sessions);

        self.viewers.add();
        self.keyframe.request();
        tracing::info!(session = id, viewers = self.viewers.get(), "viewer attached");
        Ok(session)
    }

    /// Remove a session. Safe to call repeatedly and from any task.
    pub fn remove(&self, id: u64) {
        let removed = self.lock().remove(&id);
        if let Some(session) = removed {
            session.mark_closed();
            self.viewers.remove();
            tracing::info!(session = id, viewers = self.viewers.get(), "viewer detached");
        }
    }

    /// Current sessions, for one fan-out dispatch.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Arc<ClientSession>> {
        self.lock().values().cloned().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(capacity: usize) -> (ClientRegistry, KeyframeRequest, ViewerCount) {
        let viewers = ViewerCount::new();
        let keyframe = KeyframeRequest::new();
        (
            ClientRegistry::new(capacity, viewers.clone(), keyframe.clone()),
            keyframe,
            viewers,
        )
    }

    fn submit() -> mpsc::Sender<Outbound> {
        mpsc::channel(4).0
    }

    #[test]
    fn register_arms_keyframe_flags() {
        let (registry, keyframe, viewers) = registry(4);

        let session = registry.register(submit()).unwrap();
        assert!(session.needs_keyframe());
        assert_eq!(session.last_sequence(), -1);
        assert!(keyframe.take(), "global request must be armed on insert");
        assert_eq!(viewers.get(), 1);
    }

    #[test]
    fn capacity_cap_refuses_cleanly() {
        let (registry, _, viewers) = registry(2);
        let _a = registry.register(submit()).unwrap();
        let _b = registry.register(submit()).unwrap();

        let refused = registry.register(submit());
        assert!(refused.is_err());
        assert_eq!(registry.len(), 2);
        assert_eq!(viewers.get(), 2);
    }

    #[test]
    fn removal_is_idempotent() {
        let (registry, _, viewers) = registry(4);
        let session = registry.register(submit()).unwrap();

        registry.remove(session.id);
        registry.remove(session.id);
        registry.remove(9999);

        assert!(registry.is_empty());
        assert_eq!(viewers.get(), 0);
        assert!(session.is_closed());
    }

    #[test]
    fn slot_frees_after_removal() {
        let (registry, _, _) = registry(1);
        let first = registry.register(submit()).unwrap();
        assert!(registry.register(submit()).is_err());

        registry.remove(first.id);
        assert!(registry.register(submit()).is_ok());
    }

    #[test]
    fn session_ids_are_unique() {
        let (registry, _, _) = registry(4);
        let a = registry.register(submit()).unwrap();
        let b = registry.register(submit()).unwrap();
        assert_ne!(a.id, b.id);
    }
}
