//! Common test utilities for dispatch tests.
//!
//! Provides recording action handlers, a simulated card world and helpers to
//! build card events and policies.

#![allow(dead_code)]

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use cardtrigger_actions::{Action, ActionCatalog, ActionError, BatchReport};
use cardtrigger_core::{CardTriggerConfig, Parameters, Policy};
use cardtrigger_hardware::mock::{MockCard, MockSubsystem, MockSubsystemHandle};
use cardtrigger_hardware::{Card, CardEvent, CardIdentity};
use parking_lot::Mutex;
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::mpsc;

/// ATR registered as the `PIV` card type.
pub const PIV_ATR: [u8; 4] = [0x3B, 0x8F, 0x80, 0x01];

/// How long to wait for an expected report.
pub const REPORT_TIMEOUT: Duration = Duration::from_secs(5);

/// Ordered log of handler calls shared by several actions.
pub type Journal = Arc<Mutex<Vec<String>>>;

pub fn journal() -> Journal {
    Arc::new(Mutex::new(Vec::new()))
}

/// Action that appends one line per call to a [`Journal`].
///
/// Insert lines are written after the optional delay, so a line proves the
/// insert finished. Remove lines are written as soon as the remove starts.
pub struct RecordingAction {
    id: String,
    journal: Journal,
    delay: Duration,
}

impl RecordingAction {
    pub fn new(id: &str, journal: &Journal) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            journal: Arc::clone(journal),
            delay: Duration::ZERO,
        })
    }

    pub fn slow(id: &str, journal: &Journal, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            journal: Arc::clone(journal),
            delay,
        })
    }
}

impl Action for RecordingAction {
    fn id(&self) -> &str {
        &self.id
    }

    fn perform_insert(
        &self,
        card: &Card,
        subject: &str,
        pin: Option<&SecretString>,
        _parameters: &Parameters,
    ) -> Result<bool, ActionError> {
        thread::sleep(self.delay);
        let pin = pin.map_or("-", |p| p.expose_secret());
        self.journal
            .lock()
            .push(format!("insert {} {} {subject} pin={pin}", self.id, card.reader()));
        Ok(true)
    }

    fn perform_remove(&self, card: &Card, _parameters: &Parameters) -> Result<bool, ActionError> {
        self.journal
            .lock()
            .push(format!("remove {} {}", self.id, card.reader()));
        Ok(true)
    }
}

/// Action that panics on every call.
pub struct PanickingAction;

impl Action for PanickingAction {
    fn id(&self) -> &str {
        "explode"
    }

    fn perform_insert(
        &self,
        _card: &Card,
        _subject: &str,
        _pin: Option<&SecretString>,
        _parameters: &Parameters,
    ) -> Result<bool, ActionError> {
        panic!("explode on insert")
    }

    fn perform_remove(&self, _card: &Card, _parameters: &Parameters) -> Result<bool, ActionError> {
        panic!("explode on remove")
    }
}

/// Catalog holding `actions`.
///
/// # Panics
///
/// Panics if two actions share an identifier.
pub fn catalog(actions: Vec<Arc<dyn Action>>) -> Arc<ActionCatalog> {
    let builder = actions
        .into_iter()
        .try_fold(ActionCatalog::builder(), |builder, action| builder.register(action))
        .expect("Test helper: duplicate action");
    Arc::new(builder.build())
}

/// Policy parsed from a TOML snippet.
///
/// # Panics
///
/// Panics if the snippet is invalid.
pub fn policy(toml: &str) -> Policy {
    CardTriggerConfig::from_toml(toml)
        .expect("Test helper: invalid policy")
        .policy
}

/// Simulated subsystem with the `PIV` card type and two readers.
pub fn world() -> (MockSubsystem, MockSubsystemHandle) {
    let (subsystem, handle) = MockSubsystem::new();
    handle.register_card_type("PIV", &PIV_ATR);
    handle.attach_reader("Reader0");
    handle.attach_reader("Reader1");
    (subsystem, handle)
}

/// Insert a card carrying `subjects` into `reader` and build its event.
///
/// # Panics
///
/// Panics if the card cannot be inserted or opened.
pub fn inserted(
    subsystem: &MockSubsystem,
    handle: &MockSubsystemHandle,
    reader: &str,
    subjects: &[&str],
) -> CardEvent {
    let card = subjects
        .iter()
        .fold(MockCard::new(PIV_ATR.to_vec()), |card, subject| card.with_certificate(subject));
    handle
        .insert_card(reader, card)
        .expect("Test helper: failed to insert card");
    let card = CardIdentity::new(subsystem)
        .open(reader, &PIV_ATR)
        .expect("Test helper: failed to open card");

    CardEvent::Inserted {
        reader: reader.to_string(),
        card: Arc::new(card),
        observed_at: chrono::Utc::now(),
    }
}

pub fn removed(reader: &str) -> CardEvent {
    CardEvent::Removed {
        reader: reader.to_string(),
        observed_at: chrono::Utc::now(),
    }
}

/// Wait for the next batch report.
///
/// # Panics
///
/// Panics if none arrives within [`REPORT_TIMEOUT`].
pub fn next_report(reports: &mut mpsc::UnboundedReceiver<BatchReport>) -> BatchReport {
    let deadline = Instant::now() + REPORT_TIMEOUT;
    loop {
        if let Ok(report) = reports.try_recv() {
            return report;
        }
        assert!(Instant::now() < deadline, "no batch report within {REPORT_TIMEOUT:?}");
        thread::sleep(Duration::from_millis(5));
    }
}
