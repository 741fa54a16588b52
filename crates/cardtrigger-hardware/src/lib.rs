//! Smartcard reader monitoring for cardtrigger.
//!
//! This crate watches a smartcard subsystem for reader and card changes and
//! turns them into [`CardEvent`]s. It defines:
//!
//! - The native subsystem contract ([`traits`]): context lifecycle, reader
//!   enumeration, the blocking status-change wait with cancellation, and
//!   per-card sessions.
//! - The state vocabulary ([`types`]): `SCARD_STATE_*` bits with the event
//!   counter, status codes and their classification.
//! - Card identity ([`card`]): ATR to card-type resolution and card handles
//!   with a lazily read certificate store.
//! - The [`ReaderStateTracker`], which runs the polling loop on a dedicated
//!   thread and survives service restarts.
//!
//! # Backends
//!
//! - [`mock`]: a scriptable in-memory subsystem, always available.
//! - `pcsc`: PC/SC with PIV certificate access, behind the `hardware-pcsc`
//!   feature.
//!
//! # Event Guarantees
//!
//! - Unchanged state never produces an event.
//! - At most one open card episode per reader: no insert is repeated
//!   without a remove in between.
//! - A reader that never reported a card never reports a remove.
//! - When the service stops, every open episode is closed with a synthetic
//!   remove before the context is rebuilt.
//!
//! # Thread Safety
//!
//! The subsystem is shared through an `Arc` and must be `Send + Sync`. The
//! context is owned by the monitor thread; only its canceller crosses
//! threads.

pub mod card;
pub mod error;
pub mod mock;
pub mod piv;
pub mod tracker;
pub mod traits;
pub mod transition;
pub mod types;

#[cfg(feature = "hardware-pcsc")]
pub mod pcsc;

// Re-export commonly used types for convenience
pub use card::{Card, CardIdentity, Certificate};
pub use error::{HardwareError, Result};
pub use tracker::{CardEvent, CardEventHandler, ReaderStateTracker, TrackerConfig};
pub use traits::{CardSession, CardSubsystem, ContextCanceller, SubsystemContext};
pub use types::{PNP_NOTIFICATION, ReaderStatus, StateFlags, StatusCode, StatusKind};

#[cfg(feature = "hardware-pcsc")]
pub use crate::pcsc::PcscSubsystem;
