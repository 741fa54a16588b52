//! `volumeunlock`: open a LUKS volume with the card's PIN.

use std::sync::Arc;

use cardtrigger_core::Parameters;
use cardtrigger_hardware::Card;
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, info};

use super::command::{CommandRunner, SystemCommand};
use super::required;
use crate::action::{Action, ActionState};
use crate::error::ActionError;

/// Unlocks the card with the PIN, then opens an encrypted volume with
/// `cryptsetup open`. Removal closes the mappings this handler opened.
///
/// Parameters:
/// - `target`: the encrypted block device.
/// - `name`: the device-mapper name to open it as.
/// - `key_file` (optional): key file for `cryptsetup`. Without it the PIN is
///   passed as the passphrase on standard input.
pub struct VolumeUnlock {
    runner: Arc<dyn CommandRunner>,
    state: ActionState,
}

impl VolumeUnlock {
    pub const ID: &'static str = "volumeunlock";

    pub fn new() -> Self {
        Self::with_runner(Arc::new(SystemCommand))
    }

    pub fn with_runner(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            state: ActionState::new(),
        }
    }

    /// Device opened under `name` by this handler, if any.
    pub fn opened(&self, name: &str) -> Option<String> {
        self.state.get::<String>(name)
    }
}

impl Default for VolumeUnlock {
    fn default() -> Self {
        Self::new()
    }
}

impl Action for VolumeUnlock {
    fn id(&self) -> &str {
        Self::ID
    }

    fn perform_insert(
        &self,
        card: &Card,
        subject: &str,
        pin: Option<&SecretString>,
        parameters: &Parameters,
    ) -> Result<bool, ActionError> {
        let device = required(parameters, "target")?;
        let name = required(parameters, "name")?;
        let pin = pin.ok_or_else(|| ActionError::Other("a PIN is required to unlock the card".to_string()))?;

        card.unlock(pin)?;

        if self.state.contains_key(name) {
            debug!(name = %name, "Volume already open");
            return Ok(true);
        }

        let mut args = vec!["open".to_string(), device.to_string(), name.to_string()];
        let stdin = match parameters.get("key_file") {
            Some(key_file) => {
                args.extend(["--key-file".to_string(), key_file.to_string()]);
                None
            }
            None => Some(pin.expose_secret().as_bytes()),
        };
        self.runner.run("cryptsetup", &args, stdin)?;

        self.state.insert(name, device.to_string());
        info!(device = %device, name = %name, subject = %subject, "Volume unlocked");
        Ok(true)
    }

    fn perform_remove(&self, card: &Card, parameters: &Parameters) -> Result<bool, ActionError> {
        let name = required(parameters, "name")?;
        let Some(device) = self.state.remove::<String>(name) else {
            debug!(reader = %card.reader(), name = %name, "Volume was not opened here, leaving it");
            return Ok(true);
        };

        if let Err(e) = self.runner.run("cryptsetup", &["close".to_string(), name.to_string()], None) {
            self.state.insert(name, device);
            return Err(e);
        }
        info!(device = %device, name = %name, "Volume closed");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::testing::{RecordingRunner, card};

    fn parameters(extra: &[(&str, &str)]) -> Parameters {
        [("target", "/dev/sda2"), ("name", "home")]
            .iter()
            .chain(extra)
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn pin(value: &str) -> SecretString {
        SecretString::from(value.to_string())
    }

    #[test]
    fn test_open_then_close() {
        let runner = Arc::new(RecordingRunner::default());
        let action = VolumeUnlock::with_runner(runner.clone());
        let (card, handle) = card(Some("1234"));

        assert!(action.perform_insert(&card, "CN=Alice", Some(&pin("1234")), &parameters(&[])).unwrap());
        assert_eq!(action.opened("home").as_deref(), Some("/dev/sda2"));
        assert_eq!(handle.unlocks(), vec![("Reader0".to_string(), "1234".to_string())]);

        assert!(action.perform_remove(&card, &parameters(&[])).unwrap());
        assert_eq!(action.opened("home"), None);

        let calls = runner.calls.lock();
        assert_eq!(calls[0].1, vec!["open", "/dev/sda2", "home"]);
        assert_eq!(calls[0].2.as_deref(), Some(b"1234".as_slice()));
        assert_eq!(calls[1].1, vec!["close", "home"]);
    }

    #[test]
    fn test_key_file_keeps_pin_off_stdin() {
        let runner = Arc::new(RecordingRunner::default());
        let action = VolumeUnlock::with_runner(runner.clone());
        let (card, _handle) = card(None);

        action
            .perform_insert(&card, "CN=Alice", Some(&pin("1234")), &parameters(&[("key_file", "/etc/home.key")]))
            .unwrap();

        let calls = runner.calls.lock();
        assert_eq!(calls[0].1, vec!["open", "/dev/sda2", "home", "--key-file", "/etc/home.key"]);
        assert_eq!(calls[0].2, None);
    }

    #[test]
    fn test_wrong_pin_opens_nothing() {
        let runner = Arc::new(RecordingRunner::default());
        let action = VolumeUnlock::with_runner(runner.clone());
        let (card, _handle) = card(Some("1234"));

        let result = action.perform_insert(&card, "CN=Alice", Some(&pin("0000")), &parameters(&[]));
        assert!(matches!(result, Err(ActionError::Card(_))));
        assert!(runner.calls.lock().is_empty());
    }

    #[test]
    fn test_missing_parameters_and_pin() {
        let action = VolumeUnlock::with_runner(Arc::new(RecordingRunner::default()));
        let (card, _handle) = card(None);

        let result = action.perform_insert(&card, "CN=Alice", Some(&pin("1")), &Parameters::default());
        assert!(matches!(result, Err(ActionError::MissingParameter { ref name }) if name == "target"));

        let result = action.perform_insert(&card, "CN=Alice", None, &parameters(&[]));
        assert!(matches!(result, Err(ActionError::Other(_))));
    }

    #[test]
    fn test_remove_leaves_foreign_volume() {
        let runner = Arc::new(RecordingRunner::default());
        let action = VolumeUnlock::with_runner(runner.clone());
        let (card, _handle) = card(None);

        assert!(action.perform_remove(&card, &parameters(&[])).unwrap());
        assert!(runner.calls.lock().is_empty());
    }

    #[test]
    fn test_failed_close_keeps_mapping() {
        let runner = Arc::new(RecordingRunner::default());
        let action = VolumeUnlock::with_runner(runner.clone());
        let (card, _handle) = card(None);
        action
            .perform_insert(&card, "CN=Alice", Some(&pin("1234")), &parameters(&[]))
            .unwrap();

        *runner.fail.lock() = true;
        assert!(action.perform_remove(&card, &parameters(&[])).is_err());
        assert_eq!(action.opened("home").as_deref(), Some("/dev/sda2"));
    }
}
