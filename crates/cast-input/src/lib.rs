// Input injection for deskcast-server.
//
// Provides the MouseBackend seam over the OS primitives and the pointer
// injector that maps normalized viewer coordinates onto the host display.

pub mod pointer;

pub use pointer::{
    EnigoBackend, InputError, MouseBackend, MouseButton, PointerInjector, ScreenMetrics,
};
