//! Mock smartcard subsystem.
//!
//! A single simulated world is shared between the [`MockSubsystem`] handed to
//! the tracker and the [`MockSubsystemHandle`] kept by the test. Status-change
//! waits block on a condition variable and wake whenever the handle changes
//! the world or a canceller fires.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use cardtrigger_core::{AtrPattern, CardTypeTable};
use parking_lot::{Condvar, Mutex};
use secrecy::{ExposeSecret, SecretString};

use crate::card::Certificate;
use crate::error::{HardwareError, Result};
use crate::traits::{CardSession, CardSubsystem, ContextCanceller, SubsystemContext};
use crate::types::{PNP_NOTIFICATION, ReaderStatus, StateFlags, StatusCode};

/// A simulated card.
///
/// # Examples
///
/// ```
/// use cardtrigger_hardware::mock::MockCard;
///
/// let card = MockCard::new(vec![0x3B, 0x02])
///     .with_certificate("CN=Alice")
///     .with_pin("1234");
/// assert_eq!(card.certificates()[0].subject(), "CN=Alice");
/// ```
#[derive(Debug, Clone)]
pub struct MockCard {
    atr: Vec<u8>,
    certificates: Vec<Certificate>,
    pin: Option<String>,
}

impl MockCard {
    pub fn new(atr: Vec<u8>) -> Self {
        Self {
            atr,
            certificates: Vec::new(),
            pin: None,
        }
    }

    /// Add a certificate with `subject`. The DER bytes are synthetic.
    pub fn with_certificate(mut self, subject: &str) -> Self {
        let der = format!("mock-der:{subject}").into_bytes();
        self.certificates.push(Certificate::new(subject, der));
        self
    }

    /// Require `pin` for unlock. Without it any PIN is accepted.
    pub fn with_pin(mut self, pin: &str) -> Self {
        self.pin = Some(pin.to_string());
        self
    }

    pub fn certificates(&self) -> &[Certificate] {
        &self.certificates
    }
}

/// Call counters of the simulated subsystem.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MockStats {
    pub establish_calls: usize,
    pub list_readers_calls: usize,
    pub list_card_types_calls: usize,
    pub status_waits: usize,
    pub certificate_reads: usize,
}

#[derive(Debug)]
struct MockReader {
    name: String,
    card: Option<MockCard>,
    events: u16,
}

impl MockReader {
    fn state(&self) -> StateFlags {
        let flags = if self.card.is_some() {
            StateFlags::PRESENT
        } else {
            StateFlags::EMPTY
        };
        StateFlags::with_event_count(flags, self.events)
    }
}

#[derive(Debug)]
struct World {
    running: bool,
    epoch: u64,
    readers: Vec<MockReader>,
    topology: u16,
    card_types: CardTypeTable,
    injected: VecDeque<StatusCode>,
    stats: MockStats,
    open_sessions: usize,
    unlocks: Vec<(String, String)>,
}

impl World {
    fn reader(&self, name: &str) -> Option<&MockReader> {
        self.readers.iter().find(|r| r.name == name)
    }

    fn reader_mut(&mut self, name: &str) -> Result<&mut MockReader> {
        self.readers
            .iter_mut()
            .find(|r| r.name == name)
            .ok_or_else(|| HardwareError::invalid_data(format!("unknown mock reader {name}")))
    }

    fn actual_state(&self, name: &str) -> (StateFlags, Vec<u8>) {
        if name == PNP_NOTIFICATION {
            return (
                StateFlags::with_event_count(StateFlags::UNAWARE, self.topology),
                Vec::new(),
            );
        }
        match self.reader(name) {
            Some(reader) => (
                reader.state(),
                reader
                    .card
                    .as_ref()
                    .map(|c| c.atr.clone())
                    .unwrap_or_default(),
            ),
            None => (StateFlags::UNKNOWN | StateFlags::UNAVAILABLE, Vec::new()),
        }
    }

    /// Fill every entry with its actual state. Returns whether any entry
    /// differs from what the caller believes.
    fn report(&self, entries: &mut [ReaderStatus]) -> bool {
        let mut any_changed = false;
        for entry in entries.iter_mut() {
            let (actual, atr) = self.actual_state(&entry.name);
            let changed = if entry.name == PNP_NOTIFICATION {
                entry.current_state.event_count() != actual.event_count()
            } else {
                differs(entry.current_state, actual)
            };
            entry.event_state = if changed {
                actual | StateFlags::CHANGED
            } else {
                actual
            };
            entry.atr = atr;
            any_changed |= changed;
        }
        any_changed
    }
}

fn differs(current: StateFlags, actual: StateFlags) -> bool {
    let ignored = StateFlags::CHANGED | StateFlags::IGNORE;
    if current.flags().without(ignored) != actual.flags().without(ignored) {
        return true;
    }
    current.event_count() != 0 && current.event_count() != actual.event_count()
}

#[derive(Debug)]
struct Shared {
    world: Mutex<World>,
    changed: Condvar,
}

impl Shared {
    fn update<T>(&self, f: impl FnOnce(&mut World) -> T) -> T {
        let mut world = self.world.lock();
        let result = f(&mut world);
        self.changed.notify_all();
        result
    }
}

/// Simulated smartcard subsystem.
///
/// # Examples
///
/// ```
/// use cardtrigger_hardware::mock::{MockCard, MockSubsystem};
/// use cardtrigger_hardware::traits::{CardSubsystem, SubsystemContext};
///
/// let (subsystem, handle) = MockSubsystem::new();
/// handle.attach_reader("Reader0");
/// handle.register_card_type("PIV", &[0x3B, 0x02]);
/// handle.insert_card("Reader0", MockCard::new(vec![0x3B, 0x02])).unwrap();
///
/// let context = subsystem.establish_context().unwrap();
/// assert_eq!(context.list_readers().unwrap(), vec!["Reader0"]);
/// assert_eq!(subsystem.list_card_types_by_atr(&[0x3B, 0x02]).unwrap(), vec!["PIV"]);
/// ```
#[derive(Debug, Clone)]
pub struct MockSubsystem {
    shared: Arc<Shared>,
}

impl MockSubsystem {
    /// Create a running subsystem with no readers.
    ///
    /// Returns a tuple of (MockSubsystem, MockSubsystemHandle) where the
    /// handle drives the simulation.
    pub fn new() -> (Self, MockSubsystemHandle) {
        let shared = Arc::new(Shared {
            world: Mutex::new(World {
                running: true,
                epoch: 0,
                readers: Vec::new(),
                topology: 0,
                card_types: CardTypeTable::default(),
                injected: VecDeque::new(),
                stats: MockStats::default(),
                open_sessions: 0,
                unlocks: Vec::new(),
            }),
            changed: Condvar::new(),
        });

        (
            Self {
                shared: Arc::clone(&shared),
            },
            MockSubsystemHandle { shared },
        )
    }
}

impl CardSubsystem for MockSubsystem {
    type Context = MockContext;

    fn establish_context(&self) -> std::result::Result<MockContext, StatusCode> {
        let mut world = self.shared.world.lock();
        world.stats.establish_calls += 1;
        if !world.running {
            return Err(StatusCode::NO_SERVICE);
        }
        Ok(MockContext {
            shared: Arc::clone(&self.shared),
            epoch: world.epoch,
            cancels: Arc::new(AtomicU64::new(0)),
        })
    }

    fn list_card_types_by_atr(&self, atr: &[u8]) -> std::result::Result<Vec<String>, StatusCode> {
        Ok(self.shared.world.lock().card_types.card_types_for_atr(atr))
    }

    fn open_card(&self, reader: &str, _card_type: &str) -> Result<Box<dyn CardSession>> {
        let mut world = self.shared.world.lock();
        let card = world
            .reader(reader)
            .and_then(|r| r.card.clone())
            .ok_or_else(|| HardwareError::card_session(format!("no card in {reader}")))?;
        world.open_sessions += 1;

        Ok(Box::new(MockSession {
            shared: Arc::clone(&self.shared),
            reader: reader.to_string(),
            card,
        }))
    }
}

/// Context of the simulated subsystem.
#[derive(Debug)]
pub struct MockContext {
    shared: Arc<Shared>,
    epoch: u64,
    cancels: Arc<AtomicU64>,
}

impl MockContext {
    fn check_alive(&self, world: &World) -> std::result::Result<(), StatusCode> {
        if !world.running || world.epoch != self.epoch {
            return Err(StatusCode::SERVICE_STOPPED);
        }
        Ok(())
    }
}

impl SubsystemContext for MockContext {
    type Canceller = MockCanceller;

    fn list_readers(&self) -> std::result::Result<Vec<String>, StatusCode> {
        let mut world = self.shared.world.lock();
        world.stats.list_readers_calls += 1;
        self.check_alive(&world)?;
        Ok(world.readers.iter().map(|r| r.name.clone()).collect())
    }

    fn list_card_types(&self) -> std::result::Result<Vec<String>, StatusCode> {
        let mut world = self.shared.world.lock();
        world.stats.list_card_types_calls += 1;
        self.check_alive(&world)?;
        Ok(world
            .card_types
            .patterns()
            .iter()
            .map(|p| p.name().to_string())
            .collect())
    }

    fn get_status_change(
        &mut self,
        timeout: Option<Duration>,
        readers: &mut [ReaderStatus],
    ) -> std::result::Result<(), StatusCode> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let cancels_at_entry = self.cancels.load(Ordering::SeqCst);

        let mut world = self.shared.world.lock();
        world.stats.status_waits += 1;

        if let Some(status) = world.injected.pop_front() {
            return Err(status);
        }

        let unknown = readers
            .iter()
            .any(|r| r.name != PNP_NOTIFICATION && world.reader(&r.name).is_none());
        if unknown {
            return Err(StatusCode::UNKNOWN_READER);
        }

        loop {
            self.check_alive(&world)?;
            if self.cancels.load(Ordering::SeqCst) != cancels_at_entry {
                return Err(StatusCode::CANCELLED);
            }
            if world.report(readers) {
                return Ok(());
            }

            let timed_out = match deadline {
                Some(deadline) => self
                    .shared
                    .changed
                    .wait_until(&mut world, deadline)
                    .timed_out(),
                None => {
                    self.shared.changed.wait(&mut world);
                    false
                }
            };

            if timed_out {
                self.check_alive(&world)?;
                return if world.report(readers) {
                    Ok(())
                } else {
                    Err(StatusCode::TIMEOUT)
                };
            }
        }
    }

    fn canceller(&self) -> MockCanceller {
        MockCanceller {
            shared: Arc::clone(&self.shared),
            cancels: Arc::clone(&self.cancels),
        }
    }
}

/// Canceller of a [`MockContext`].
///
/// Only a wait that is already pending observes the cancel, like the native
/// primitive.
#[derive(Debug, Clone)]
pub struct MockCanceller {
    shared: Arc<Shared>,
    cancels: Arc<AtomicU64>,
}

impl ContextCanceller for MockCanceller {
    fn cancel(&self) {
        self.cancels.fetch_add(1, Ordering::SeqCst);
        self.shared.update(|_| ());
    }
}

struct MockSession {
    shared: Arc<Shared>,
    reader: String,
    card: MockCard,
}

impl CardSession for MockSession {
    fn certificates(&mut self) -> Result<Vec<Certificate>> {
        self.shared.world.lock().stats.certificate_reads += 1;
        Ok(self.card.certificates.clone())
    }

    fn unlock(&mut self, pin: &SecretString) -> Result<()> {
        let pin = pin.expose_secret();
        self.shared
            .world
            .lock()
            .unlocks
            .push((self.reader.clone(), pin.to_string()));

        match &self.card.pin {
            Some(expected) if expected != pin => Err(HardwareError::card_session("PIN rejected")),
            _ => Ok(()),
        }
    }
}

impl Drop for MockSession {
    fn drop(&mut self) {
        let mut world = self.shared.world.lock();
        world.open_sessions = world.open_sessions.saturating_sub(1);
    }
}

/// Handle for driving a [`MockSubsystem`].
#[derive(Debug, Clone)]
pub struct MockSubsystemHandle {
    shared: Arc<Shared>,
}

impl MockSubsystemHandle {
    /// Attach an empty reader.
    pub fn attach_reader(&self, name: &str) {
        self.shared.update(|world| {
            world.readers.push(MockReader {
                name: name.to_string(),
                card: None,
                events: 0,
            });
            world.topology = world.topology.wrapping_add(1);
        });
    }

    /// Detach a reader, together with any card in it.
    pub fn detach_reader(&self, name: &str) {
        self.shared.update(|world| {
            world.readers.retain(|r| r.name != name);
            world.topology = world.topology.wrapping_add(1);
        });
    }

    /// Insert `card` into `reader`, replacing any card already there.
    ///
    /// # Errors
    ///
    /// Returns an error if the reader is not attached.
    pub fn insert_card(&self, reader: &str, card: MockCard) -> Result<()> {
        self.shared.update(|world| {
            let reader = world.reader_mut(reader)?;
            if reader.card.is_some() {
                reader.events = reader.events.wrapping_add(1);
            }
            reader.card = Some(card);
            reader.events = reader.events.wrapping_add(1);
            Ok(())
        })
    }

    /// Remove the card from `reader`.
    ///
    /// # Errors
    ///
    /// Returns an error if the reader is not attached.
    pub fn remove_card(&self, reader: &str) -> Result<()> {
        self.shared.update(|world| {
            let reader = world.reader_mut(reader)?;
            if reader.card.take().is_some() {
                reader.events = reader.events.wrapping_add(1);
            }
            Ok(())
        })
    }

    /// Stop the service. Pending waits fail with a service-stopped status
    /// and new contexts cannot be established until [`start_service`].
    ///
    /// [`start_service`]: Self::start_service
    pub fn stop_service(&self) {
        self.shared.update(|world| {
            world.running = false;
            world.epoch += 1;
        });
    }

    pub fn start_service(&self) {
        self.shared.update(|world| world.running = true);
    }

    /// Restart the service. Existing contexts become stale.
    pub fn restart_service(&self) {
        self.shared.update(|world| world.epoch += 1);
    }

    /// Add an ATR pattern to the simulated card database.
    pub fn register_card_type(&self, name: &str, atr: &[u8]) {
        self.shared.update(|world| {
            if let Ok(pattern) = AtrPattern::new(name, atr.to_vec(), None) {
                world.card_types.push(pattern);
            }
        });
    }

    /// Make the next status-change wait fail with `status`.
    pub fn inject_status(&self, status: StatusCode) {
        self.shared.update(|world| world.injected.push_back(status));
    }

    pub fn stats(&self) -> MockStats {
        self.shared.world.lock().stats
    }

    /// Number of card sessions opened and not yet dropped.
    pub fn open_sessions(&self) -> usize {
        self.shared.world.lock().open_sessions
    }

    pub fn certificate_reads(&self) -> usize {
        self.shared.world.lock().stats.certificate_reads
    }

    /// Every unlock attempt as `(reader, pin)`, in order.
    pub fn unlocks(&self) -> Vec<(String, String)> {
        self.shared.world.lock().unlocks.clone()
    }
}
