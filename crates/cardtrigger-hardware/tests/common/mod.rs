//! Common test utilities for tracker integration tests.
//!
//! Builds a simulated subsystem with a known card type, and records the
//! events a tracker delivers so tests can wait for them in order.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::mpsc;
use std::time::Duration;

use cardtrigger_hardware::mock::{MockCard, MockSubsystem, MockSubsystemHandle};
use cardtrigger_hardware::{CardEvent, CardEventHandler, ReaderStateTracker, TrackerConfig};

/// ATR registered as the `PIV` card type.
pub const PIV_ATR: [u8; 4] = [0x3B, 0x8F, 0x80, 0x01];

/// How long to wait for an expected event.
pub const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

/// How long to watch for unexpected events.
pub const QUIET_PERIOD: Duration = Duration::from_millis(200);

/// Simplified view of a delivered event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Seen {
    Inserted { reader: String, card_type: String },
    Removed { reader: String },
}

impl Seen {
    pub fn inserted(reader: &str) -> Self {
        Self::Inserted {
            reader: reader.to_string(),
            card_type: "PIV".to_string(),
        }
    }

    pub fn removed(reader: &str) -> Self {
        Self::Removed {
            reader: reader.to_string(),
        }
    }

    pub fn reader(&self) -> &str {
        match self {
            Self::Inserted { reader, .. } | Self::Removed { reader } => reader,
        }
    }
}

impl From<&CardEvent> for Seen {
    fn from(event: &CardEvent) -> Self {
        match event {
            CardEvent::Inserted { reader, card, .. } => Self::Inserted {
                reader: reader.clone(),
                card_type: card.card_type().to_string(),
            },
            CardEvent::Removed { reader, .. } => Self::Removed {
                reader: reader.clone(),
            },
        }
    }
}

/// Receiving side of a recording handler.
pub struct Recorder {
    rx: mpsc::Receiver<Seen>,
}

impl Recorder {
    /// Wait for the next event.
    ///
    /// # Panics
    ///
    /// Panics if no event arrives within [`EVENT_TIMEOUT`].
    pub fn next(&self) -> Seen {
        self.rx
            .recv_timeout(EVENT_TIMEOUT)
            .expect("Test helper: expected a card event")
    }

    /// Assert that no event arrives within [`QUIET_PERIOD`].
    pub fn assert_quiet(&self) {
        if let Ok(event) = self.rx.recv_timeout(QUIET_PERIOD) {
            panic!("unexpected event {event:?}");
        }
    }

    /// Every event delivered so far.
    pub fn drain(&self) -> Vec<Seen> {
        self.rx.try_iter().collect()
    }
}

/// Create a handler that records events, and its receiving side.
pub fn recorder() -> (impl CardEventHandler, Recorder) {
    let (tx, rx) = mpsc::channel();
    let handler = move |event: CardEvent| {
        let seen = Seen::from(&event);
        // Release the card before the test can observe the event.
        drop(event);
        let _ = tx.send(seen);
    };
    (handler, Recorder { rx })
}

/// Tracker tuning that keeps tests fast.
pub fn fast_config() -> TrackerConfig {
    TrackerConfig {
        recovery_backoff: Duration::from_millis(20),
        cancel_retry: Duration::from_millis(5),
    }
}

/// A running subsystem with the `PIV` card type and the given readers.
pub fn world(readers: &[&str]) -> (Arc<MockSubsystem>, MockSubsystemHandle) {
    let (subsystem, handle) = MockSubsystem::new();
    handle.register_card_type("PIV", &PIV_ATR);
    for reader in readers {
        handle.attach_reader(reader);
    }
    (Arc::new(subsystem), handle)
}

/// A PIV card with one certificate.
pub fn card(subject: &str) -> MockCard {
    MockCard::new(PIV_ATR.to_vec()).with_certificate(subject)
}

/// Create a tracker over `subsystem`.
///
/// # Panics
///
/// Panics if the context cannot be established.
pub fn tracker(subsystem: &Arc<MockSubsystem>) -> ReaderStateTracker<MockSubsystem> {
    ReaderStateTracker::new(Arc::clone(subsystem), fast_config())
        .expect("Test helper: failed to create tracker")
}

/// Wait until `token` is cancelled.
///
/// Returns `false` if it is still live after [`EVENT_TIMEOUT`].
pub fn wait_cancelled(token: &tokio_util::sync::CancellationToken) -> bool {
    let deadline = std::time::Instant::now() + EVENT_TIMEOUT;
    while !token.is_cancelled() {
        if std::time::Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    true
}
