//! facegate-engine: live capture and verification sessions.
//!
//! [`spawn_engine`] starts one session in register or verify mode and
//! returns an [`EngineHandle`]. The session owns the camera from start to
//! close; the caller only sees the published [`EngineView`] and
//! [`EngineEvent`]s.

pub mod auto_capture;
pub mod config;
pub mod controller;
pub mod error;
pub mod events;
pub mod scheduler;

#[cfg(test)]
mod testing;

pub use config::{ConfigError, EngineConfig};
pub use controller::spawn_engine;
pub use error::{EngineError, RetryCause};
pub use events::{EngineEvent, EngineHandle, EngineState, EngineView, ResultCause};
