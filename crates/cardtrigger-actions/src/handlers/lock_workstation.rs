//! `lockworkstation`: lock the login session.

use std::sync::Arc;

use cardtrigger_core::Parameters;
use cardtrigger_hardware::Card;
use secrecy::SecretString;
use tracing::info;

use super::command::{CommandRunner, SystemCommand};
use crate::action::Action;
use crate::error::ActionError;

/// Locks the session through `loginctl lock-session`, on insert or remove
/// depending on the configured `on` flags.
///
/// Parameters:
/// - `session` (optional): session id to lock instead of the caller's.
pub struct LockWorkstation {
    runner: Arc<dyn CommandRunner>,
}

impl LockWorkstation {
    pub const ID: &'static str = "lockworkstation";

    pub fn new() -> Self {
        Self::with_runner(Arc::new(SystemCommand))
    }

    pub fn with_runner(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    fn lock(&self, card: &Card, parameters: &Parameters) -> Result<bool, ActionError> {
        let mut args = vec!["lock-session".to_string()];
        if let Some(session) = parameters.get("session") {
            args.push(session.to_string());
        }

        info!(reader = %card.reader(), "Locking session");
        self.runner.run("loginctl", &args, None)?;
        Ok(true)
    }
}

impl Default for LockWorkstation {
    fn default() -> Self {
        Self::new()
    }
}

impl Action for LockWorkstation {
    fn id(&self) -> &str {
        Self::ID
    }

    fn perform_insert(
        &self,
        card: &Card,
        _subject: &str,
        _pin: Option<&SecretString>,
        parameters: &Parameters,
    ) -> Result<bool, ActionError> {
        self.lock(card, parameters)
    }

    fn perform_remove(&self, card: &Card, parameters: &Parameters) -> Result<bool, ActionError> {
        self.lock(card, parameters)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::testing::{RecordingRunner, card};

    #[test]
    fn test_locks_current_session() {
        let runner = Arc::new(RecordingRunner::default());
        let action = LockWorkstation::with_runner(runner.clone());
        let (card, _handle) = card(None);

        assert!(action.perform_remove(&card, &Parameters::default()).unwrap());
        assert_eq!(
            *runner.calls.lock(),
            vec![("loginctl".to_string(), vec!["lock-session".to_string()], None)]
        );
    }

    #[test]
    fn test_locks_named_session() {
        let runner = Arc::new(RecordingRunner::default());
        let action = LockWorkstation::with_runner(runner.clone());
        let (card, _handle) = card(None);
        let parameters = Parameters::from_iter([("session".to_string(), "c2".to_string())]);

        assert!(action.perform_insert(&card, "CN=Alice", None, &parameters).unwrap());
        assert_eq!(runner.calls.lock()[0].1, vec!["lock-session", "c2"]);
    }

    #[test]
    fn test_command_failure_is_an_error() {
        let runner = Arc::new(RecordingRunner::default());
        *runner.fail.lock() = true;
        let action = LockWorkstation::with_runner(runner);
        let (card, _handle) = card(None);

        let result = action.perform_remove(&card, &Parameters::default());
        assert!(matches!(result, Err(ActionError::CommandFailed { .. })));
    }
}
