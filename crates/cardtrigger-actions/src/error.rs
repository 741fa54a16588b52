//! Error types for action registration, batching and execution.

use cardtrigger_hardware::HardwareError;

/// Errors raised while building or querying an [`ActionCatalog`].
///
/// [`ActionCatalog`]: crate::ActionCatalog
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CatalogError {
    /// Two different handlers claim the same identifier.
    #[error("Duplicate action identifier: {id}")]
    DuplicateAction { id: String },

    /// No handler is registered for the identifier.
    #[error("Unknown action: {id}")]
    UnknownAction { id: String },
}

impl CatalogError {
    /// Create a new duplicate action error.
    pub fn duplicate(id: impl Into<String>) -> Self {
        Self::DuplicateAction { id: id.into() }
    }

    /// Create a new unknown action error.
    pub fn unknown(id: impl Into<String>) -> Self {
        Self::UnknownAction { id: id.into() }
    }
}

/// Misuse of an [`ActionBatch`](crate::ActionBatch).
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum BatchError {
    /// The batch already ran or was finished; it cannot be touched again.
    #[error("Batch already completed")]
    Completed,

    /// Execution has started; no more actions can be added.
    #[error("Batch is sealed for execution")]
    Sealed,
}

/// Failure of a single action handler.
#[derive(Debug, thiserror::Error)]
pub enum ActionError {
    /// A required parameter is absent from the action configuration.
    #[error("Missing parameter: {name}")]
    MissingParameter { name: String },

    /// An external command could not be run or exited unsuccessfully.
    #[error("Command {program} failed: {message}")]
    CommandFailed { program: String, message: String },

    /// A card operation failed.
    #[error(transparent)]
    Card(#[from] HardwareError),

    #[error("{0}")]
    Other(String),
}

impl ActionError {
    /// Create a new missing parameter error.
    pub fn missing_parameter(name: impl Into<String>) -> Self {
        Self::MissingParameter { name: name.into() }
    }

    /// Create a new command failure error.
    pub fn command_failed(program: impl Into<String>, message: impl Into<String>) -> Self {
        Self::CommandFailed {
            program: program.into(),
            message: message.into(),
        }
    }
}

/// Why no PIN was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PinError {
    /// The surface dropped the request without supplying a PIN.
    #[error("PIN entry cancelled")]
    Cancelled,

    /// No surface is listening for PIN requests.
    #[error("PIN entry surface closed")]
    SurfaceClosed,
}

/// Errors raised while building an [`ActionDispatcher`](crate::ActionDispatcher).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    /// The policy references an action that is not in the catalog.
    #[error("Certificate {subject:?} references an unregistered action")]
    UnknownTarget {
        subject: String,
        #[source]
        source: CatalogError,
    },
}
