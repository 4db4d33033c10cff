//! Tuner device control.
//!
//! This module provides:
//! - [`StreamSession`]: addressing and lifecycle state of one live feed
//! - [`TunerCommandClient`]: start/stop commands over the control protocol

pub mod command;
pub mod session;

pub use command::{resolve_local_address, CommandError, TunerCommandClient, DEFAULT_CONTROL_TIMEOUT};
pub use session::{SessionState, StreamSession, MAX_TUNER_COUNT};
