//! Action dispatch for cardtrigger.
//!
//! Card events from the reader tracker are matched against the certificate
//! policy and turned into side effects:
//!
//! - [`Action`]: the handler contract, with private [`ActionState`].
//! - [`ActionCatalog`]: the read-only registry of handlers, built once.
//! - [`ActionBatch`]: the actions matched for one side of one card presence
//!   episode, run at most once.
//! - [`ActionDispatcher`]: the tracker's event handler, keeping one batch in
//!   flight per reader.
//! - [`PinHandoff`]: the rendezvous with whatever surface asks the user for
//!   a PIN.
//! - [`handlers`]: the built-in `lockworkstation` and `volumeunlock`.
//!
//! # Examples
//!
//! ```
//! use std::sync::Arc;
//!
//! use cardtrigger_actions::{ActionCatalog, ActionDispatcher};
//! use cardtrigger_core::Policy;
//!
//! let catalog = Arc::new(ActionCatalog::with_builtin_actions()?);
//! let _dispatcher = ActionDispatcher::new(Policy::default(), catalog)?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod action;
pub mod batch;
pub mod catalog;
pub mod dispatcher;
pub mod error;
pub mod handlers;
pub mod pin;

// Re-export commonly used types for convenience
pub use action::{Action, ActionState};
pub use batch::{ActionBatch, ActionOutcome, BatchKind, CompletionSignal, OutcomeStatus};
pub use catalog::{ActionCatalog, ActionCatalogBuilder};
pub use dispatcher::{ActionDispatcher, BatchReport, ExecutionMode};
pub use error::{ActionError, BatchError, CatalogError, DispatchError, PinError};
pub use pin::{PinHandoff, PinRequest, PinRequests};
