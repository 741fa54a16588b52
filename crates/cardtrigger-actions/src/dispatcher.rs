//! Turning card events into action batches.
//!
//! The [`ActionDispatcher`] is the tracker's event handler. For an insert it
//! reads the card's certificates, matches each subject against the policy
//! and runs the resulting [`ActionBatch`], asking for a PIN first when one
//! of the matched actions needs it. The subjects are remembered per reader
//! so the remove can be matched after the card is gone.
//!
//! # Ordering
//!
//! At most one batch per reader is in flight. A new batch for a reader waits
//! for the completion signal of the previous one before it runs. In
//! [`ExecutionMode::Inline`] batches run on the calling thread, so that
//! order is trivially kept; [`ExecutionMode::Background`] runs each batch on
//! its own worker thread and relies on the signal. Dropping the dispatcher
//! joins every worker, so no batch is cut short.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use cardtrigger_core::Policy;
use cardtrigger_hardware::{Card, CardEvent, CardEventHandler};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::batch::{ActionBatch, ActionOutcome, BatchKind, CompletionSignal};
use crate::catalog::ActionCatalog;
use crate::error::{DispatchError, PinError};
use crate::pin::PinHandoff;

/// Where batches run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutionMode {
    /// On the thread delivering the event.
    #[default]
    Inline,
    /// On a worker thread per batch.
    Background,
}

impl ExecutionMode {
    pub fn from_background(background: bool) -> Self {
        if background {
            Self::Background
        } else {
            Self::Inline
        }
    }
}

/// What happened to one non-empty batch.
#[derive(Debug)]
pub struct BatchReport {
    pub id: Uuid,
    pub reader: String,
    pub kind: BatchKind,
    pub outcomes: Vec<ActionOutcome>,
    /// Why no PIN was available, when the batch asked for one.
    pub pin_error: Option<PinError>,
}

struct ReaderSession {
    card: Arc<Card>,
    subjects: Vec<String>,
}

/// Everything a batch needs once it leaves the dispatcher.
#[derive(Clone)]
struct Runner {
    catalog: Arc<ActionCatalog>,
    pins: Option<PinHandoff>,
    reports: Option<mpsc::UnboundedSender<BatchReport>>,
}

impl Runner {
    fn run(&self, mut batch: ActionBatch, previous: Option<CompletionSignal>) {
        if let Some(previous) = previous
            && !previous.is_complete()
        {
            debug!(reader = %batch.reader(), "Waiting for previous batch");
            previous.wait();
        }

        let (pin, pin_error) = if batch.kind() == BatchKind::Insert && batch.pin_required() {
            match self.request_pin(&batch) {
                Ok(pin) => (Some(pin), None),
                Err(e) => {
                    warn!(reader = %batch.reader(), batch = %batch.id(), error = %e, "No PIN, skipping actions that need one");
                    (None, Some(e))
                }
            }
        } else {
            (None, None)
        };

        match batch.execute(&self.catalog, pin.as_ref()) {
            Ok(outcomes) => {
                let succeeded = outcomes.iter().filter(|o| o.is_success()).count();
                info!(
                    reader = %batch.reader(),
                    batch = %batch.id(),
                    kind = %batch.kind(),
                    succeeded,
                    total = outcomes.len(),
                    "Batch finished"
                );
                self.report(&batch, outcomes, pin_error);
            }
            Err(e) => error!(reader = %batch.reader(), error = %e, "Batch could not run"),
        }
    }

    fn request_pin(&self, batch: &ActionBatch) -> Result<secrecy::SecretString, PinError> {
        match &self.pins {
            Some(pins) => pins.request_pin(batch.reader(), batch.id()),
            None => Err(PinError::SurfaceClosed),
        }
    }

    fn report(&self, batch: &ActionBatch, outcomes: Vec<ActionOutcome>, pin_error: Option<PinError>) {
        if let Some(reports) = &self.reports {
            let _ = reports.send(BatchReport {
                id: batch.id(),
                reader: batch.reader().to_string(),
                kind: batch.kind(),
                outcomes,
                pin_error,
            });
        }
    }
}

/// Matches card events against the policy and runs the matched actions.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
///
/// use cardtrigger_actions::{ActionCatalog, ActionDispatcher, ExecutionMode, PinHandoff};
/// use cardtrigger_core::CardTriggerConfig;
///
/// let config = CardTriggerConfig::from_toml(
///     r#"
///     [[certificates]]
///     subject = "CN=Alice"
///
///     [[certificates.actions]]
///     on = "remove"
///     target = "LockWorkstation"
///     require_pin = false
///     "#,
/// )
/// .unwrap();
///
/// let catalog = Arc::new(ActionCatalog::with_builtin_actions().unwrap());
/// let (pins, _requests) = PinHandoff::new();
/// let dispatcher = ActionDispatcher::new(config.policy, catalog)
///     .unwrap()
///     .with_pin_handoff(pins)
///     .with_mode(ExecutionMode::Inline);
/// assert_eq!(dispatcher.mode(), ExecutionMode::Inline);
/// ```
pub struct ActionDispatcher {
    policy: Policy,
    runner: Runner,
    mode: ExecutionMode,
    sessions: HashMap<String, ReaderSession>,
    in_flight: HashMap<String, CompletionSignal>,
    workers: Vec<JoinHandle<()>>,
}

impl ActionDispatcher {
    /// Create a dispatcher for `policy`.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::UnknownTarget`] for the first policy action
    /// whose target is not in `catalog`.
    pub fn new(policy: Policy, catalog: Arc<ActionCatalog>) -> Result<Self, DispatchError> {
        for entry in policy.entries() {
            for action in entry.actions() {
                catalog
                    .get(action.target())
                    .map_err(|source| DispatchError::UnknownTarget {
                        subject: entry.subject().to_string(),
                        source,
                    })?;
            }
        }

        Ok(Self {
            policy,
            runner: Runner {
                catalog,
                pins: None,
                reports: None,
            },
            mode: ExecutionMode::default(),
            sessions: HashMap::new(),
            in_flight: HashMap::new(),
            workers: Vec::new(),
        })
    }

    /// Ask `pins` for PINs. Without a handoff, actions that need a PIN are
    /// skipped.
    pub fn with_pin_handoff(mut self, pins: PinHandoff) -> Self {
        self.runner.pins = Some(pins);
        self
    }

    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    /// Send a [`BatchReport`] for every non-empty batch to `reports`.
    pub fn with_reports(mut self, reports: mpsc::UnboundedSender<BatchReport>) -> Self {
        self.runner.reports = Some(reports);
        self
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    /// Certificate subjects remembered for the card in `reader`.
    pub fn subjects(&self, reader: &str) -> Option<&[String]> {
        self.sessions.get(reader).map(|s| s.subjects.as_slice())
    }

    /// Handle one card event.
    pub fn dispatch(&mut self, event: CardEvent) {
        match event {
            CardEvent::Inserted { reader, card, .. } => self.card_inserted(reader, card),
            CardEvent::Removed { reader, .. } => self.card_removed(reader),
        }
    }

    fn card_inserted(&mut self, reader: String, card: Arc<Card>) {
        let mut batch = ActionBatch::new(BatchKind::Insert, reader.as_str());
        let mut subjects = Vec::new();

        match card.certificates() {
            Ok(certificates) => {
                for certificate in certificates {
                    let subject = certificate.subject();
                    let matched = self.policy.matching(subject, BatchKind::Insert.event());
                    if let Err(e) = batch.add_all(&card, subject, matched) {
                        error!(reader = %reader, error = %e, "Failed to build batch");
                    }
                    subjects.push(subject.to_string());
                }
            }
            Err(e) => {
                warn!(reader = %reader, error = %e, "Failed to read certificates");
            }
        }

        debug!(reader = %reader, subjects = ?subjects, actions = batch.len(), "Matched insert actions");
        if let Some(previous) = self.sessions.insert(reader.clone(), ReaderSession { card: Arc::clone(&card), subjects }) {
            warn!(reader = %reader, card_type = %previous.card.card_type(), "Replacing card session without remove");
        }
        self.submit(batch);
    }

    fn card_removed(&mut self, reader: String) {
        let Some(session) = self.sessions.remove(&reader) else {
            debug!(reader = %reader, "No session for removed card");
            return;
        };

        let mut batch = ActionBatch::new(BatchKind::Remove, reader.as_str());
        for subject in &session.subjects {
            let matched = self.policy.matching(subject, BatchKind::Remove.event());
            if let Err(e) = batch.add_all(&session.card, subject, matched) {
                error!(reader = %reader, error = %e, "Failed to build batch");
            }
        }

        debug!(reader = %reader, actions = batch.len(), "Matched remove actions");
        self.submit(batch);
    }

    fn submit(&mut self, mut batch: ActionBatch) {
        if batch.is_empty() {
            if let Err(e) = batch.finish() {
                error!(error = %e, "Failed to finish empty batch");
            }
            return;
        }

        let previous = self
            .in_flight
            .insert(batch.reader().to_string(), batch.completion());

        match self.mode {
            ExecutionMode::Inline => self.runner.run(batch, previous),
            ExecutionMode::Background => {
                self.workers.retain(|worker| !worker.is_finished());
                let runner = self.runner.clone();
                let name = format!("cardtrigger-batch-{}", batch.id());
                match thread::Builder::new()
                    .name(name)
                    .spawn(move || runner.run(batch, previous))
                {
                    Ok(worker) => self.workers.push(worker),
                    Err(e) => error!(error = %e, "Failed to spawn batch worker"),
                }
            }
        }
    }
}

impl Drop for ActionDispatcher {
    fn drop(&mut self) {
        if !self.workers.is_empty() {
            debug!(workers = self.workers.len(), "Waiting for batch workers");
        }
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                error!("Batch worker panicked");
            }
        }
    }
}

impl CardEventHandler for ActionDispatcher {
    fn handle(&mut self, event: CardEvent) {
        self.dispatch(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CatalogError;
    use cardtrigger_core::{ActionConfig, CertificatePolicy, EventFlags, Parameters};

    fn policy(target: &str) -> Policy {
        let action = ActionConfig::new(EventFlags::INSERT, target, false, Parameters::default()).unwrap();
        Policy::new(vec![CertificatePolicy::new("CN=Alice", vec![action]).unwrap()])
    }

    #[test]
    fn test_unknown_target_rejected() {
        let catalog = Arc::new(ActionCatalog::with_builtin_actions().unwrap());
        let result = ActionDispatcher::new(policy("nosuch"), catalog);

        assert_eq!(
            result.err(),
            Some(DispatchError::UnknownTarget {
                subject: "CN=Alice".to_string(),
                source: CatalogError::UnknownAction {
                    id: "nosuch".to_string()
                },
            })
        );
    }

    #[test]
    fn test_targets_match_case_insensitively() {
        let catalog = Arc::new(ActionCatalog::with_builtin_actions().unwrap());
        assert!(ActionDispatcher::new(policy("LockWorkStation"), catalog).is_ok());
    }

    #[test]
    fn test_execution_mode() {
        assert_eq!(ExecutionMode::from_background(true), ExecutionMode::Background);
        assert_eq!(ExecutionMode::from_background(false), ExecutionMode::Inline);
        assert_eq!(ExecutionMode::default(), ExecutionMode::Inline);
    }
}
