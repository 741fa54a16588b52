//! Simulated smartcard subsystem for testing and development.
//!
//! The simulation can be driven programmatically (attach readers, insert
//! cards, restart the service) without any hardware or PC/SC daemon.

pub mod subsystem;

pub use subsystem::{MockCard, MockStats, MockSubsystem, MockSubsystemHandle};
