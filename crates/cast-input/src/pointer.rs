//! Pointer injection backend.
//!
//! Viewers send pointer events in normalized `(u, v)` coordinates; the
//! injector maps them to absolute pixels on the host display, warps the OS
//! cursor and synthesizes button edges through [`MouseBackend`]. The
//! default backend drives `enigo`; tests substitute a recording one.

use enigo::{Coordinate, Direction, Enigo, Mouse, Settings};

/// Buttons a viewer can address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MouseButton {
    /// Wire button `0`.
    Primary,
    /// Wire button `1`.
    Secondary,
}

impl MouseButton {
    /// Map the wire button id; values beyond the two known buttons are
    /// ignored by the injector.
    #[must_use]
    pub fn from_wire(id: u8) -> Option<Self> {
        match id {
            0 => Some(Self::Primary),
            1 => Some(Self::Secondary),
            _ => None,
        }
    }
}

/// The OS mouse primitives.
pub trait MouseBackend: Send {
    fn warp(&mut self, x: i32, y: i32) -> Result<(), InputError>;
    fn button(&mut self, button: MouseButton, pressed: bool) -> Result<(), InputError>;
    /// Current cursor position in absolute screen pixels.
    fn location(&mut self) -> Result<(i32, i32), InputError>;
}

impl<B: MouseBackend + ?Sized> MouseBackend for Box<B> {
    fn warp(&mut self, x: i32, y: i32) -> Result<(), InputError> {
        (**self).warp(x, y)
    }

    fn button(&mut self, button: MouseButton, pressed: bool) -> Result<(), InputError> {
        (**self).button(button, pressed)
    }

    fn location(&mut self) -> Result<(i32, i32), InputError> {
        (**self).location()
    }
}

/// Host display dimensions used to de-normalize coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScreenMetrics {
    pub width: u32,
    pub height: u32,
}

/// Maps normalized pointer events onto a [`MouseBackend`].
pub struct PointerInjector<B: MouseBackend> {
    backend: B,
    metrics: ScreenMetrics,
}

impl<B: MouseBackend> PointerInjector<B> {
    pub fn new(backend: B, metrics: ScreenMetrics) -> Self {
        Self { backend, metrics }
    }

    /// Update the display dimensions after a resolution change.
    pub fn set_metrics(&mut self, metrics: ScreenMetrics) {
        self.metrics = metrics;
    }

    /// Apply one pointer message.
    ///
    /// The cursor always warps to the event position. `down` presses and
    /// `up` releases; the steady-state `pressed` field of the wire message
    /// never synthesizes an event on its own.
    pub fn inject(
        &mut self,
        u: f32,
        v: f32,
        down: bool,
        up: bool,
        button: u8,
    ) -> Result<(), InputError> {
        let (x, y) = self.to_pixels(u, v);
        self.backend.warp(x, y)?;

        let Some(button) = MouseButton::from_wire(button) else {
            if down || up {
                tracing::debug!(button, "ignoring event for unmapped button");
            }
            return Ok(());
        };

        if down {
            self.backend.button(button, true)?;
        }
        if up {
            self.backend.button(button, false)?;
        }
        Ok(())
    }

    /// Current cursor position, for the capture stage's sampler.
    pub fn cursor_position(&mut self) -> Result<(i32, i32), InputError> {
        self.backend.location()
    }

    fn to_pixels(&self, u: f32, v: f32) -> (i32, i32) {
        let scale = |n: f32, max: u32| -> i32 {
            if max == 0 {
                return 0;
            }
            let pixel = (n.clamp(0.0, 1.0) * max as f32) as i64;
            pixel.min(i64::from(max) - 1) as i32
        };
        (scale(u, self.metrics.width), scale(v, self.metrics.height))
    }
}

/// `enigo`-backed mouse primitives.
pub struct EnigoBackend {
    enigo: Enigo,
}

impl EnigoBackend {
    /// Connect to the OS input stack.
    ///
    /// # Errors
    ///
    /// Returns [`InputError::Init`] when the platform backend cannot be
    /// established (e.g. no display server); pointer messages are then
    /// logged but not injected.
    pub fn new() -> Result<Self, InputError> {
        let enigo = Enigo::new(&Settings::default())
            .map_err(|e| InputError::Init(e.to_string()))?;
        Ok(Self { enigo })
    }
}

impl MouseBackend for EnigoBackend {
    fn warp(&mut self, x: i32, y: i32) -> Result<(), InputError> {
        self.enigo
            .move_mouse(x, y, Coordinate::Abs)
            .map_err(|e| InputError::Inject(e.to_string()))
    }

    fn button(&mut self, button: MouseButton, pressed: bool) -> Result<(), InputError> {
        let button = match button {
            MouseButton::Primary => enigo::Button::Left,
            MouseButton::Secondary => enigo::Button::Right,
        };
        let direction = if pressed {
            Direction::Press
        } else {
            Direction::Release
        };
        self.enigo
            .button(button, direction)
            .map_err(|e| InputError::Inject(e.to_string()))
    }

    fn location(&mut self) -> Result<(i32, i32), InputError> {
        self.enigo
            .location()
            .map_err(|e| InputError::Inject(e.to_string()))
    }
}

/// Errors from the input injection backend.
#[derive(Debug, thiserror::Error)]
pub enum InputError {
    /// Failed to initialize the OS input backend.
    #[error("failed to initialize input backend: {0}")]
    Init(String),

    /// A single event failed to inject.
    #[error("failed to inject input: {0}")]
    Inject(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    enum Recorded {
        Warp(i32, i32),
        Button(MouseButton, bool),
    }

    #[derive(Default)]
    struct RecordingBackend {
        events: Vec<Recorded>,
    }

    impl MouseBackend for RecordingBackend {
        fn warp(&mut self, x: i32, y: i32) -> Result<(), InputError> {
            self.events.push(Recorded::Warp(x, y));
            Ok(())
        }

        fn button(&mut self, button: MouseButton, pressed: bool) -> Result<(), InputError> {
            self.events.push(Recorded::Button(button, pressed));
            Ok(())
        }

        fn location(&mut self) -> Result<(i32, i32), InputError> {
            Ok((0, 0))
        }
    }

    fn injector() -> PointerInjector<RecordingBackend> {
        PointerInjector::new(
            RecordingBackend::default(),
            ScreenMetrics {
                width: 1920,
                height: 1080,
            },
        )
    }

    #[test]
    fn center_click_warps_then_presses_secondary() {
        let mut inj = injector();
        inj.inject(0.5, 0.5, true, false, 1).unwrap();
        assert_eq!(
            inj.backend.events,
            vec![
                Recorded::Warp(960, 540),
                Recorded::Button(MouseButton::Secondary, true),
            ]
        );
    }

    #[test]
    fn up_event_releases() {
        let mut inj = injector();
        inj.inject(0.1, 0.2, false, true, 0).unwrap();
        assert_eq!(
            inj.backend.events,
            vec![
                Recorded::Warp(192, 216),
                Recorded::Button(MouseButton::Primary, false),
            ]
        );
    }

    #[test]
    fn pressed_without_edges_only_moves() {
        let mut inj = injector();
        // A move-while-held message: pressed=true but no down/up edge.
        inj.inject(0.25, 0.25, false, false, 0).unwrap();
        assert_eq!(inj.backend.events, vec![Recorded::Warp(480, 270)]);
    }

    #[test]
    fn unknown_button_still_warps_but_never_clicks() {
        let mut inj = injector();
        inj.inject(0.0, 0.0, true, true, 7).unwrap();
        assert_eq!(inj.backend.events, vec![Recorded::Warp(0, 0)]);
    }

    #[test]
    fn coordinates_clamp_to_display_bounds() {
        let mut inj = injector();
        inj.inject(2.0, -1.0, false, false, 0).unwrap();
        assert_eq!(inj.backend.events, vec![Recorded::Warp(1919, 0)]);
    }

    #[test]
    fn down_and_up_in_one_event_click() {
        let mut inj = injector();
        inj.inject(0.5, 0.5, true, true, 0).unwrap();
        assert_eq!(
            inj.backend.events,
            vec![
                Recorded::Warp(960, 540),
                Recorded::Button(MouseButton::Primary, true),
                Recorded::Button(MouseButton::Primary, false),
            ]
        );
    }
}
