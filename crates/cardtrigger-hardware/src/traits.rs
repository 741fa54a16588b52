//! Native smartcard subsystem contract.
//!
//! The tracker talks to the platform through these traits only. A backend
//! provides a [`CardSubsystem`] (shared, stateless entry point), the
//! [`SubsystemContext`] it establishes (owned by the monitor thread), a
//! [`ContextCanceller`] that can interrupt a blocked wait from any thread, and
//! [`CardSession`]s for per-card operations.
//!
//! Contexts and sessions release their native resources on `Drop`.

use std::time::Duration;

use secrecy::SecretString;

use crate::card::Certificate;
use crate::error::Result;
use crate::types::{ReaderStatus, StatusCode};

/// Entry point to a smartcard subsystem.
pub trait CardSubsystem: Send + Sync + 'static {
    /// Context type established by this subsystem.
    type Context: SubsystemContext;

    /// Establish a new context.
    ///
    /// # Errors
    ///
    /// Returns the native status if the service is not reachable.
    fn establish_context(&self) -> std::result::Result<Self::Context, StatusCode>;

    /// Names of every card type whose ATR pattern matches `atr`.
    ///
    /// # Errors
    ///
    /// Returns the native status if the card database cannot be queried.
    fn list_card_types_by_atr(&self, atr: &[u8]) -> std::result::Result<Vec<String>, StatusCode>;

    /// Open a session to the card in `reader`.
    ///
    /// # Errors
    ///
    /// Returns an error if the card cannot be connected.
    fn open_card(&self, reader: &str, card_type: &str) -> Result<Box<dyn CardSession>>;
}

/// An established subsystem context.
pub trait SubsystemContext: Send + 'static {
    /// Canceller type for this context.
    type Canceller: ContextCanceller;

    /// Names of the attached readers. An empty list is not an error.
    ///
    /// # Errors
    ///
    /// Returns the native status on failure.
    fn list_readers(&self) -> std::result::Result<Vec<String>, StatusCode>;

    /// Names of the known card types.
    ///
    /// # Errors
    ///
    /// Returns the native status on failure.
    fn list_card_types(&self) -> std::result::Result<Vec<String>, StatusCode>;

    /// Block until the state of any entry differs from its `current_state`,
    /// the timeout elapses, or the wait is cancelled.
    ///
    /// `None` waits forever. On success every entry's `event_state` and
    /// `atr` are filled in, with [`StateFlags::CHANGED`] set on entries
    /// that differ.
    ///
    /// # Errors
    ///
    /// Returns the native status: timeout, cancelled, service stopped, an
    /// unknown reader, or a fatal code.
    ///
    /// [`StateFlags::CHANGED`]: crate::types::StateFlags::CHANGED
    fn get_status_change(
        &mut self,
        timeout: Option<Duration>,
        readers: &mut [ReaderStatus],
    ) -> std::result::Result<(), StatusCode>;

    /// Handle that cancels a pending wait on this context.
    fn canceller(&self) -> Self::Canceller;
}

/// Cancels a blocked [`SubsystemContext::get_status_change`].
///
/// A cancel issued while no wait is pending may be lost; callers that need
/// the wait to end keep cancelling until it has.
pub trait ContextCanceller: Send + Sync + 'static {
    fn cancel(&self);
}

/// An open connection to one card.
pub trait CardSession: Send {
    /// Read the certificates stored on the card.
    ///
    /// # Errors
    ///
    /// Returns an error if the certificate store cannot be read.
    fn certificates(&mut self) -> Result<Vec<Certificate>>;

    /// Unlock the card's private key operations with `pin`.
    ///
    /// # Errors
    ///
    /// Returns an error if the PIN is rejected or the card fails.
    fn unlock(&mut self, pin: &SecretString) -> Result<()>;
}
