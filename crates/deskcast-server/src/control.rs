//! The control plane.
//!
//! Parses text messages arriving on any session and routes them: `hello`
//! records the client version, `request_keyframe` arms both keyframe
//! flags, `pointer` goes to the injector. Unknown kinds and malformed
//! JSON are dropped without touching the session.

use std::sync::{Arc, Mutex};

use cast_encode::KeyframeRequest;
use cast_input::{MouseBackend, PointerInjector};
use cast_proto::control::{self, ControlMessage, PointerEvent};

use crate::registry::{ClientSession, Outbound};

/// Server name reported in the hello acknowledgement.
const SERVER_NAME: &str = "deskcast-server";

/// Protocol version this server speaks.
const PROTOCOL_VERSION: u32 = 1;

/// Shared pointer injector; `None` when the OS input backend is
/// unavailable and the server runs view-only.
pub type SharedInjector = Arc<Mutex<PointerInjector<Box<dyn MouseBackend>>>>;

/// Routes inbound control messages.
pub struct ControlPlane {
    keyframe: KeyframeRequest,
    injector: Option<SharedInjector>,
}

impl ControlPlane {
    pub fn new(keyframe: KeyframeRequest, injector: Option<SharedInjector>) -> Self {
        Self { keyframe, injector }
    }

    /// Handle one text message from a session.
    pub fn handle(&self, session: &ClientSession, text: &str) {
        let Some(message) = control::parse(text) else {
            tracing::trace!(session = session.id, "unrecognized control message dropped");
            return;
        };

        match message {
            ControlMessage::Hello { client, version } => {
                session.record_version(version);
                tracing::info!(session = session.id, %client, version, "hello");
                let ack = control::status(format!("{SERVER_NAME} v{PROTOCOL_VERSION}"));
                let _ = session.try_submit(Outbound::Control(ack));
            }
            ControlMessage::RequestKeyframe => {
                tracing::debug!(session = session.id, "keyframe requested");
                session.set_needs_keyframe();
                self.keyframe.request();
            }
            ControlMessage::Pointer(event) => self.inject(session, &event),
            // Status is server -> client only.
            ControlMessage::Status { .. } => {}
        }
    }

    fn inject(&self, session: &ClientSession, event: &PointerEvent) {
        let Some(injector) = &self.injector else {
            tracing::trace!(session = session.id, "pointer ignored, no input backend");
            return;
        };

        let mut injector = injector
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Err(e) = injector.inject(event.u, event.v, event.down, event.up, event.button) {
            tracing::debug!(session = session.id, error = %e, "pointer injection failed");
        }
    }
}
