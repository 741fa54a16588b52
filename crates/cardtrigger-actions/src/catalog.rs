//! Registry of action handlers.
//!
//! The catalog is built once from an explicit list of handlers and is
//! read-only afterwards. Identifiers are compared case-insensitively.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::action::Action;
use crate::error::CatalogError;
use crate::handlers;

/// Read-only map from action identifier to handler.
///
/// # Examples
///
/// ```
/// use cardtrigger_actions::ActionCatalog;
///
/// let catalog = ActionCatalog::with_builtin_actions()?;
/// assert!(catalog.get("LockWorkstation").is_ok());
/// assert!(catalog.get("bitlocker").is_err());
/// # Ok::<(), cardtrigger_actions::CatalogError>(())
/// ```
#[derive(Clone, Default)]
pub struct ActionCatalog {
    actions: HashMap<String, Arc<dyn Action>>,
}

impl ActionCatalog {
    pub fn builder() -> ActionCatalogBuilder {
        ActionCatalogBuilder::default()
    }

    /// Catalog holding the handlers that ship with cardtrigger.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError::DuplicateAction`] if two built-in handlers
    /// share an identifier.
    pub fn with_builtin_actions() -> Result<Self, CatalogError> {
        handlers::builtin_actions()
            .into_iter()
            .try_fold(Self::builder(), ActionCatalogBuilder::register)
            .map(ActionCatalogBuilder::build)
    }

    /// Look up the handler for `id`.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError::UnknownAction`] if nothing is registered
    /// under `id`.
    pub fn get(&self, id: &str) -> Result<&Arc<dyn Action>, CatalogError> {
        self.actions
            .get(&id.to_lowercase())
            .ok_or_else(|| CatalogError::unknown(id))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.actions.contains_key(&id.to_lowercase())
    }

    /// Registered identifiers, normalized to lowercase and sorted.
    pub fn ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.actions.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

impl fmt::Debug for ActionCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionCatalog")
            .field("actions", &self.ids())
            .finish()
    }
}

/// Builder for an [`ActionCatalog`].
#[derive(Default)]
pub struct ActionCatalogBuilder {
    actions: HashMap<String, Arc<dyn Action>>,
}

impl ActionCatalogBuilder {
    /// Register `action` under its identifier.
    ///
    /// Registering the same handler instance twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError::DuplicateAction`] if a different handler is
    /// already registered under the same identifier, ignoring case.
    pub fn register(mut self, action: Arc<dyn Action>) -> Result<Self, CatalogError> {
        let key = action.id().to_lowercase();
        if let Some(existing) = self.actions.get(&key) {
            if Arc::ptr_eq(existing, &action) {
                return Ok(self);
            }
            return Err(CatalogError::duplicate(action.id()));
        }

        debug!(action = %key, "Registered action handler");
        self.actions.insert(key, action);
        Ok(self)
    }

    pub fn build(self) -> ActionCatalog {
        ActionCatalog {
            actions: self.actions,
        }
    }
}
