//! External command execution.

use std::io::Write;
use std::process::{Command, Stdio};

use tracing::debug;

use crate::error::ActionError;

/// Runs an external program to completion.
pub trait CommandRunner: Send + Sync + 'static {
    /// Run `program` with `args`, feeding `stdin` to it if given.
    ///
    /// # Errors
    ///
    /// Returns [`ActionError::CommandFailed`] if the program cannot be
    /// started or exits unsuccessfully.
    fn run(&self, program: &str, args: &[String], stdin: Option<&[u8]>) -> Result<(), ActionError>;
}

/// [`CommandRunner`] backed by [`std::process::Command`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemCommand;

impl CommandRunner for SystemCommand {
    fn run(&self, program: &str, args: &[String], stdin: Option<&[u8]>) -> Result<(), ActionError> {
        debug!(program = %program, args = ?args, "Running command");

        let mut child = Command::new(program)
            .args(args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| ActionError::command_failed(program, e.to_string()))?;

        if let Some(input) = stdin
            && let Some(mut pipe) = child.stdin.take()
        {
            pipe.write_all(input)
                .map_err(|e| ActionError::command_failed(program, e.to_string()))?;
        }

        let output = child
            .wait_with_output()
            .map_err(|e| ActionError::command_failed(program, e.to_string()))?;

        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(ActionError::command_failed(
            program,
            format!("{} ({})", output.status, stderr.trim()),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_program() {
        let result = SystemCommand.run("cardtrigger-no-such-program", &[], None);
        assert!(matches!(
            result,
            Err(ActionError::CommandFailed { ref program, .. }) if program == "cardtrigger-no-such-program"
        ));
    }
}
