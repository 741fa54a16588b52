//! Built-in action handlers.
//!
//! - [`LockWorkstation`] (`lockworkstation`): locks the login session.
//! - [`VolumeUnlock`] (`volumeunlock`): unlocks the card with the PIN and
//!   opens a LUKS volume, closing it again on removal.
//!
//! Both shell out through a [`CommandRunner`], which tests replace.

pub mod command;
pub mod lock_workstation;
pub mod volume_unlock;

use std::sync::Arc;

use cardtrigger_core::Parameters;

use crate::action::Action;
use crate::error::ActionError;

pub use command::{CommandRunner, SystemCommand};
pub use lock_workstation::LockWorkstation;
pub use volume_unlock::VolumeUnlock;

/// Every built-in handler, backed by real system commands.
pub fn builtin_actions() -> Vec<Arc<dyn Action>> {
    vec![
        Arc::new(LockWorkstation::new()),
        Arc::new(VolumeUnlock::new()),
    ]
}

fn required<'a>(parameters: &'a Parameters, name: &str) -> Result<&'a str, ActionError> {
    parameters
        .get(name)
        .ok_or_else(|| ActionError::missing_parameter(name))
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Arc;

    use cardtrigger_hardware::mock::{MockCard, MockSubsystem, MockSubsystemHandle};
    use cardtrigger_hardware::{Card, CardIdentity};
    use parking_lot::Mutex;

    use super::CommandRunner;
    use crate::error::ActionError;

    pub const ATR: [u8; 2] = [0x3B, 0x02];

    /// Records commands instead of running them.
    #[derive(Debug, Default)]
    pub struct RecordingRunner {
        pub calls: Mutex<Vec<(String, Vec<String>, Option<Vec<u8>>)>>,
        pub fail: Mutex<bool>,
    }

    impl CommandRunner for RecordingRunner {
        fn run(&self, program: &str, args: &[String], stdin: Option<&[u8]>) -> Result<(), ActionError> {
            self.calls
                .lock()
                .push((program.to_string(), args.to_vec(), stdin.map(<[u8]>::to_vec)));
            if *self.fail.lock() {
                return Err(ActionError::command_failed(program, "exit status: 1"));
            }
            Ok(())
        }
    }

    /// An open card in `Reader0`, optionally protected by `pin`.
    pub fn card(pin: Option<&str>) -> (Arc<Card>, MockSubsystemHandle) {
        let (subsystem, handle) = MockSubsystem::new();
        handle.register_card_type("PIV", &ATR);
        handle.attach_reader("Reader0");
        let mut card = MockCard::new(ATR.to_vec()).with_certificate("CN=Alice");
        if let Some(pin) = pin {
            card = card.with_pin(pin);
        }
        handle.insert_card("Reader0", card).unwrap();
        let card = CardIdentity::new(&subsystem).open("Reader0", &ATR).unwrap();
        (Arc::new(card), handle)
    }
}
