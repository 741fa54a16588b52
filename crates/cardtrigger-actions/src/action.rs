//! The action contract.
//!
//! An [`Action`] is a side effect keyed by an identifier that policy entries
//! name as their `target`. Handlers are shared by every batch, so they take
//! `&self`; anything they need to remember between an insert and the matching
//! remove lives in an [`ActionState`] they own.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;

use cardtrigger_core::Parameters;
use cardtrigger_hardware::Card;
use parking_lot::Mutex;
use secrecy::SecretString;

use crate::error::ActionError;

/// A handler that reacts to card events.
///
/// Returning `Ok(false)` reports a failure the handler already dealt with
/// (logged, nothing to propagate). Either way the outcome is recorded for
/// this action only; the rest of the batch still runs.
///
/// # Examples
///
/// ```
/// use cardtrigger_actions::{Action, ActionError};
/// use cardtrigger_core::Parameters;
/// use cardtrigger_hardware::Card;
/// use secrecy::SecretString;
///
/// struct Beep;
///
/// impl Action for Beep {
///     fn id(&self) -> &str {
///         "beep"
///     }
///
///     fn perform_insert(
///         &self,
///         _card: &Card,
///         subject: &str,
///         _pin: Option<&SecretString>,
///         _parameters: &Parameters,
///     ) -> Result<bool, ActionError> {
///         println!("\x07 hello {subject}");
///         Ok(true)
///     }
///
///     fn perform_remove(&self, _card: &Card, _parameters: &Parameters) -> Result<bool, ActionError> {
///         Ok(true)
///     }
/// }
/// ```
pub trait Action: Send + Sync + 'static {
    /// Identifier referenced by policy `target`s. Matched case-insensitively.
    fn id(&self) -> &str;

    /// Run after `card` carrying a certificate with `subject` was inserted.
    ///
    /// `pin` is present when any action of the batch asked for one.
    fn perform_insert(
        &self,
        card: &Card,
        subject: &str,
        pin: Option<&SecretString>,
        parameters: &Parameters,
    ) -> Result<bool, ActionError>;

    /// Run after `card` was removed. The card handle may no longer reach the
    /// physical card.
    fn perform_remove(&self, card: &Card, parameters: &Parameters) -> Result<bool, ActionError>;
}

/// Private, string-keyed state of one handler.
///
/// Values of any `Send` type can be stored; reading back with the wrong type
/// behaves like a missing key.
///
/// # Examples
///
/// ```
/// use cardtrigger_actions::ActionState;
///
/// let state = ActionState::new();
/// state.insert("home", "/dev/sda2".to_string());
///
/// assert_eq!(state.get::<String>("home").as_deref(), Some("/dev/sda2"));
/// assert_eq!(state.get::<u32>("home"), None);
/// assert_eq!(state.remove::<String>("home").as_deref(), Some("/dev/sda2"));
/// assert!(state.is_empty());
/// ```
#[derive(Default)]
pub struct ActionState {
    items: Mutex<HashMap<String, Box<dyn Any + Send>>>,
}

impl ActionState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clone of the value under `key`, if it has type `T`.
    pub fn get<T: Any + Clone>(&self, key: &str) -> Option<T> {
        self.items
            .lock()
            .get(key)
            .and_then(|value| value.downcast_ref::<T>())
            .cloned()
    }

    /// Store `value` under `key`, replacing any previous value.
    pub fn insert<T: Any + Send>(&self, key: impl Into<String>, value: T) {
        self.items.lock().insert(key.into(), Box::new(value));
    }

    /// Take the value under `key` out, if it has type `T`.
    pub fn remove<T: Any>(&self, key: &str) -> Option<T> {
        let mut items = self.items.lock();
        if !items.get(key)?.is::<T>() {
            return None;
        }
        items
            .remove(key)
            .and_then(|value| value.downcast::<T>().ok())
            .map(|value| *value)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.items.lock().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }
}

impl fmt::Debug for ActionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let items = self.items.lock();
        let mut keys: Vec<&String> = items.keys().collect();
        keys.sort();
        f.debug_struct("ActionState").field("keys", &keys).finish()
    }
}
