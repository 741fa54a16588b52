//! Action batches.
//!
//! An [`ActionBatch`] collects every configured action matched for one side
//! (insert or remove) of one card presence episode, then runs them in match
//! order. A batch runs at most once. Its [`CompletionSignal`] fires when it
//! has run, was finished without running, or was dropped, so a later batch
//! for the same reader can wait on it.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use cardtrigger_core::{ActionConfig, EventFlags};
use cardtrigger_hardware::Card;
use parking_lot::{Condvar, Mutex};
use secrecy::SecretString;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::catalog::ActionCatalog;
use crate::error::BatchError;

/// Which handler method a batch calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BatchKind {
    Insert,
    Remove,
}

impl BatchKind {
    /// The policy event flag this kind matches.
    pub fn event(self) -> EventFlags {
        match self {
            Self::Insert => EventFlags::INSERT,
            Self::Remove => EventFlags::REMOVE,
        }
    }
}

impl fmt::Display for BatchKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Insert => write!(f, "insert"),
            Self::Remove => write!(f, "remove"),
        }
    }
}

/// One-shot signal set when a batch is done.
#[derive(Debug, Clone, Default)]
pub struct CompletionSignal {
    inner: Arc<SignalInner>,
}

#[derive(Debug, Default)]
struct SignalInner {
    done: Mutex<bool>,
    cond: Condvar,
}

impl CompletionSignal {
    pub fn is_complete(&self) -> bool {
        *self.inner.done.lock()
    }

    /// Block until the signal is set.
    pub fn wait(&self) {
        let mut done = self.inner.done.lock();
        while !*done {
            self.inner.cond.wait(&mut done);
        }
    }

    /// Block until the signal is set or `timeout` elapses. Returns whether
    /// the signal is set.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut done = self.inner.done.lock();
        if !*done {
            self.inner.cond.wait_while_for(&mut done, |done| !*done, timeout);
        }
        *done
    }

    fn set(&self) {
        *self.inner.done.lock() = true;
        self.inner.cond.notify_all();
    }
}

/// How a single action ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutcomeStatus {
    Succeeded,
    /// The handler reported failure.
    Failed,
    /// The handler returned an error, or no handler was registered.
    Errored(String),
    Panicked,
    /// Not run: the action needs a PIN and none was supplied.
    Skipped,
}

/// Result of one action of a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionOutcome {
    pub target: String,
    pub subject: String,
    pub status: OutcomeStatus,
}

impl ActionOutcome {
    pub fn is_success(&self) -> bool {
        self.status == OutcomeStatus::Succeeded
    }
}

#[derive(Debug)]
struct BatchEntry {
    card: Arc<Card>,
    subject: String,
    action: ActionConfig,
}

/// The actions matched for one side of one card presence episode.
///
/// # Examples
///
/// ```
/// use cardtrigger_actions::{ActionBatch, BatchError, BatchKind};
///
/// let mut batch = ActionBatch::new(BatchKind::Insert, "Reader0");
/// assert!(!batch.pin_required());
///
/// batch.finish()?;
/// assert!(batch.completion().is_complete());
/// assert_eq!(batch.finish(), Err(BatchError::Completed));
/// # Ok::<(), BatchError>(())
/// ```
#[derive(Debug)]
pub struct ActionBatch {
    id: Uuid,
    kind: BatchKind,
    reader: String,
    entries: Vec<BatchEntry>,
    pin_required: OnceLock<bool>,
    completion: CompletionSignal,
}

impl ActionBatch {
    pub fn new(kind: BatchKind, reader: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            reader: reader.into(),
            entries: Vec::new(),
            pin_required: OnceLock::new(),
            completion: CompletionSignal::default(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn kind(&self) -> BatchKind {
        self.kind
    }

    pub fn reader(&self) -> &str {
        &self.reader
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Signal that fires once this batch is done.
    pub fn completion(&self) -> CompletionSignal {
        self.completion.clone()
    }

    /// Add `action`, matched through the certificate `subject` of `card`.
    ///
    /// # Errors
    ///
    /// Returns [`BatchError::Completed`] once the batch is done, and
    /// [`BatchError::Sealed`] once [`pin_required`](Self::pin_required) was
    /// evaluated.
    pub fn add(&mut self, card: &Arc<Card>, subject: &str, action: &ActionConfig) -> Result<(), BatchError> {
        if self.completion.is_complete() {
            return Err(BatchError::Completed);
        }
        if self.pin_required.get().is_some() {
            return Err(BatchError::Sealed);
        }

        self.entries.push(BatchEntry {
            card: Arc::clone(card),
            subject: subject.to_string(),
            action: action.clone(),
        });
        Ok(())
    }

    /// Add every action of `actions`. See [`add`](Self::add).
    ///
    /// # Errors
    ///
    /// Same as [`add`](Self::add).
    pub fn add_all<'a>(
        &mut self,
        card: &Arc<Card>,
        subject: &str,
        actions: impl IntoIterator<Item = &'a ActionConfig>,
    ) -> Result<(), BatchError> {
        for action in actions {
            self.add(card, subject, action)?;
        }
        Ok(())
    }

    /// Whether any action asked for a PIN.
    ///
    /// Evaluated on first call and fixed from then on; the batch accepts no
    /// more actions afterwards.
    pub fn pin_required(&self) -> bool {
        *self
            .pin_required
            .get_or_init(|| self.entries.iter().any(|entry| entry.action.require_pin()))
    }

    /// Run every action in order and complete the batch.
    ///
    /// Each action's outcome is recorded separately; a failing, erroring or
    /// panicking handler does not stop the others. `pin` is handed to every
    /// insert handler. Without a `pin`, insert actions that require one are
    /// recorded as [`OutcomeStatus::Skipped`] and the rest still run.
    ///
    /// # Errors
    ///
    /// Returns [`BatchError::Completed`] if the batch is already done.
    pub fn execute(
        &mut self,
        catalog: &ActionCatalog,
        pin: Option<&SecretString>,
    ) -> Result<Vec<ActionOutcome>, BatchError> {
        if self.completion.is_complete() {
            return Err(BatchError::Completed);
        }
        self.pin_required();

        let outcomes = self
            .entries
            .iter()
            .map(|entry| self.run(catalog, entry, pin))
            .collect();

        self.completion.set();
        Ok(outcomes)
    }

    /// Complete the batch without running anything.
    ///
    /// # Errors
    ///
    /// Returns [`BatchError::Completed`] if the batch is already done.
    pub fn finish(&mut self) -> Result<(), BatchError> {
        if self.completion.is_complete() {
            return Err(BatchError::Completed);
        }
        self.pin_required();
        self.completion.set();
        Ok(())
    }

    fn run(&self, catalog: &ActionCatalog, entry: &BatchEntry, pin: Option<&SecretString>) -> ActionOutcome {
        let target = entry.action.target();
        debug!(
            reader = %self.reader,
            target = %target,
            subject = %entry.subject,
            kind = %self.kind,
            "Running action"
        );

        let status = match catalog.get(target) {
            Err(e) => OutcomeStatus::Errored(e.to_string()),
            Ok(_) if self.kind == BatchKind::Insert && entry.action.require_pin() && pin.is_none() => {
                OutcomeStatus::Skipped
            }
            Ok(handler) => {
                let parameters = entry.action.parameters();
                let result = panic::catch_unwind(AssertUnwindSafe(|| match self.kind {
                    BatchKind::Insert => handler.perform_insert(&entry.card, &entry.subject, pin, parameters),
                    BatchKind::Remove => handler.perform_remove(&entry.card, parameters),
                }));
                match result {
                    Ok(Ok(true)) => OutcomeStatus::Succeeded,
                    Ok(Ok(false)) => OutcomeStatus::Failed,
                    Ok(Err(e)) => OutcomeStatus::Errored(e.to_string()),
                    Err(_) => OutcomeStatus::Panicked,
                }
            }
        };

        match &status {
            OutcomeStatus::Succeeded => {
                info!(reader = %self.reader, target = %target, kind = %self.kind, "Action succeeded");
            }
            OutcomeStatus::Failed => {
                warn!(reader = %self.reader, target = %target, kind = %self.kind, "Action reported failure");
            }
            OutcomeStatus::Errored(message) => {
                warn!(reader = %self.reader, target = %target, kind = %self.kind, error = %message, "Action failed");
            }
            OutcomeStatus::Panicked => {
                warn!(reader = %self.reader, target = %target, kind = %self.kind, "Action panicked");
            }
            OutcomeStatus::Skipped => {
                warn!(reader = %self.reader, target = %target, kind = %self.kind, "Action skipped, no PIN");
            }
        }

        ActionOutcome {
            target: target.to_string(),
            subject: entry.subject.clone(),
            status,
        }
    }
}

impl Drop for ActionBatch {
    fn drop(&mut self) {
        self.completion.set();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::Action;
    use crate::error::ActionError;
    use cardtrigger_core::Parameters;
    use cardtrigger_hardware::CardIdentity;
    use cardtrigger_hardware::mock::{MockCard, MockSubsystem};
    use rstest::rstest;
    use secrecy::ExposeSecret;

    const ATR: [u8; 2] = [0x3B, 0x02];

    #[derive(Default)]
    struct Scripted {
        calls: Mutex<Vec<String>>,
    }

    impl Action for Scripted {
        fn id(&self) -> &str {
            "scripted"
        }

        fn perform_insert(
            &self,
            _card: &Card,
            subject: &str,
            pin: Option<&SecretString>,
            parameters: &Parameters,
        ) -> Result<bool, ActionError> {
            let pin = pin.map(|p| p.expose_secret().to_string()).unwrap_or_default();
            self.calls.lock().push(format!("insert {subject} {pin}"));
            self.behave(parameters)
        }

        fn perform_remove(&self, _card: &Card, parameters: &Parameters) -> Result<bool, ActionError> {
            self.calls.lock().push("remove".to_string());
            self.behave(parameters)
        }
    }

    impl Scripted {
        fn behave(&self, parameters: &Parameters) -> Result<bool, ActionError> {
            match parameters.get("result") {
                Some("fail") => Ok(false),
                Some("error") => Err(ActionError::Other("boom".to_string())),
                Some("panic") => panic!("handler panicked"),
                _ => Ok(true),
            }
        }
    }

    fn card() -> Arc<Card> {
        let (subsystem, handle) = MockSubsystem::new();
        handle.register_card_type("PIV", &ATR);
        handle.attach_reader("Reader0");
        handle
            .insert_card("Reader0", MockCard::new(ATR.to_vec()))
            .unwrap();
        Arc::new(CardIdentity::new(&subsystem).open("Reader0", &ATR).unwrap())
    }

    fn action(target: &str, require_pin: bool, result: &str) -> ActionConfig {
        let parameters = Parameters::from_iter([("result".to_string(), result.to_string())]);
        ActionConfig::new(EventFlags::INSERT | EventFlags::REMOVE, target, require_pin, parameters).unwrap()
    }

    fn catalog(handler: &Arc<Scripted>) -> ActionCatalog {
        let handler: Arc<dyn Action> = handler.clone();
        ActionCatalog::builder().register(handler).unwrap().build()
    }

    #[rstest]
    #[case(&[], false)]
    #[case(&[false], false)]
    #[case(&[false, true], true)]
    #[case(&[true, true], true)]
    fn test_pin_required(#[case] pins: &[bool], #[case] expected: bool) {
        let card = card();
        let mut batch = ActionBatch::new(BatchKind::Insert, "Reader0");
        for pin in pins {
            batch.add(&card, "CN=Alice", &action("scripted", *pin, "ok")).unwrap();
        }

        assert_eq!(batch.pin_required(), expected);
        assert_eq!(batch.pin_required(), expected);
    }

    #[test]
    fn test_pin_required_seals_batch() {
        let card = card();
        let mut batch = ActionBatch::new(BatchKind::Insert, "Reader0");
        batch.add(&card, "CN=Alice", &action("scripted", false, "ok")).unwrap();
        assert!(!batch.pin_required());

        let result = batch.add(&card, "CN=Alice", &action("scripted", true, "ok"));
        assert_eq!(result, Err(BatchError::Sealed));
        assert!(!batch.pin_required());
    }

    #[test]
    fn test_completed_batch_rejects_everything() {
        let card = card();
        let handler = Arc::new(Scripted::default());
        let catalog = catalog(&handler);
        let mut batch = ActionBatch::new(BatchKind::Insert, "Reader0");
        batch.add(&card, "CN=Alice", &action("scripted", false, "ok")).unwrap();

        batch.execute(&catalog, None).unwrap();

        assert_eq!(
            batch.add(&card, "CN=Alice", &action("scripted", false, "ok")),
            Err(BatchError::Completed)
        );
        assert_eq!(batch.execute(&catalog, None), Err(BatchError::Completed));
        assert_eq!(batch.finish(), Err(BatchError::Completed));
        assert_eq!(handler.calls.lock().len(), 1);
    }

    #[test]
    fn test_outcomes_are_isolated() {
        let card = card();
        let handler = Arc::new(Scripted::default());
        let catalog = catalog(&handler);
        let mut batch = ActionBatch::new(BatchKind::Insert, "Reader0");
        for result in ["panic", "fail", "error", "ok"] {
            batch.add(&card, "CN=Alice", &action("scripted", false, result)).unwrap();
        }
        batch.add(&card, "CN=Alice", &action("missing", false, "ok")).unwrap();

        let outcomes = batch.execute(&catalog, None).unwrap();
        let statuses: Vec<_> = outcomes.iter().map(|o| o.status.clone()).collect();

        assert_eq!(
            statuses,
            vec![
                OutcomeStatus::Panicked,
                OutcomeStatus::Failed,
                OutcomeStatus::Errored("boom".to_string()),
                OutcomeStatus::Succeeded,
                OutcomeStatus::Errored("Unknown action: missing".to_string()),
            ]
        );
        assert_eq!(handler.calls.lock().len(), 4);
        assert!(batch.completion().is_complete());
    }

    #[test]
    fn test_insert_receives_pin_and_remove_does_not() {
        let card = card();
        let handler = Arc::new(Scripted::default());
        let catalog = catalog(&handler);
        let pin = SecretString::from("1234".to_string());

        let mut insert = ActionBatch::new(BatchKind::Insert, "Reader0");
        insert.add(&card, "CN=Alice", &action("scripted", true, "ok")).unwrap();
        insert.execute(&catalog, Some(&pin)).unwrap();

        let mut remove = ActionBatch::new(BatchKind::Remove, "Reader0");
        remove.add(&card, "CN=Alice", &action("scripted", true, "ok")).unwrap();
        remove.execute(&catalog, None).unwrap();

        assert_eq!(*handler.calls.lock(), vec!["insert CN=Alice 1234", "remove"]);
    }

    #[test]
    fn test_missing_pin_skips_only_pin_actions() {
        let card = card();
        let handler = Arc::new(Scripted::default());
        let catalog = catalog(&handler);

        let mut insert = ActionBatch::new(BatchKind::Insert, "Reader0");
        insert.add(&card, "CN=Alice", &action("scripted", true, "ok")).unwrap();
        insert.add(&card, "CN=Alice", &action("scripted", false, "ok")).unwrap();
        let statuses: Vec<_> = insert
            .execute(&catalog, None)
            .unwrap()
            .into_iter()
            .map(|o| o.status)
            .collect();

        assert_eq!(statuses, vec![OutcomeStatus::Skipped, OutcomeStatus::Succeeded]);
        assert_eq!(*handler.calls.lock(), vec!["insert CN=Alice "]);
    }

    #[test]
    fn test_drop_completes_signal() {
        let batch = ActionBatch::new(BatchKind::Remove, "Reader0");
        let completion = batch.completion();
        assert!(!completion.wait_timeout(Duration::from_millis(10)));

        drop(batch);
        assert!(completion.wait_timeout(Duration::from_millis(10)));
        completion.wait();
    }
}
