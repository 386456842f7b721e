//! Simulated SailBots on a fake serial link.
//!
//! A [`FleetDriver`] ticks a fleet of [`SailBot`]s at a fixed interval and streams their
//! telemetry, framed by a [`protocol::FrameCodec`], to a [`ByteSink`] one byte at a time.
//! Commands from the controlling application are handed back with
//! [`FleetDriver::submit_inbound`].

#[macro_use]
extern crate log;

#[macro_use]
extern crate eyre;

pub mod config;
pub mod fleet;
pub mod geo;
pub mod protocol;
pub mod sailbot;

pub use fleet::{ByteSink, DriverStats, FleetDriver, Inbound};
pub use sailbot::{ControlMode, SailBot, SailBotState};
