//! Reader and card state tracker.
//!
//! The [`ReaderStateTracker`] owns a subsystem context, keeps the list of
//! known readers with their last confirmed state, and turns the subsystem's
//! state-bit reports into a clean stream of [`CardEvent`]s.
//!
//! # Architecture
//!
//! ```text
//!                 ┌──────────────────────┐
//!  cancel token ─►│ cancel watcher       │── canceller.cancel() ──┐
//!                 │ (re-issues cancel)   │                        │
//!                 └──────────────────────┘                        ▼
//!                 ┌──────────────────────┐   get_status_change ┌───────────┐
//!  CardEvent ◄────│ monitor thread       │◄───────────────────►│ subsystem │
//!                 │ (diff, reset, events)│                     └───────────┘
//!                 └──────────────────────┘
//! ```
//!
//! The monitor thread is the only one touching the context and the reader
//! list. Each iteration makes exactly one blocking call and checks the stop
//! token before and after it. When the service stops, every open card
//! episode is closed with a synthetic remove and the context is rebuilt from
//! scratch.
//!
//! # Examples
//!
//! ```
//! use std::sync::Arc;
//! use std::sync::mpsc;
//! use std::time::Duration;
//!
//! use cardtrigger_hardware::mock::{MockCard, MockSubsystem};
//! use cardtrigger_hardware::tracker::{CardEvent, ReaderStateTracker, TrackerConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! let (subsystem, handle) = MockSubsystem::new();
//! handle.attach_reader("Reader0");
//! handle.register_card_type("PIV", &[0x3B, 0x02]);
//!
//! let mut tracker = ReaderStateTracker::new(Arc::new(subsystem), TrackerConfig::default())?;
//! let (tx, rx) = mpsc::channel();
//! tracker.start_monitoring(&CancellationToken::new(), move |event: CardEvent| {
//!     let _ = tx.send(event);
//! })?;
//!
//! handle.insert_card("Reader0", MockCard::new(vec![0x3B, 0x02]))?;
//! let event = rx.recv_timeout(Duration::from_secs(5)).unwrap();
//! assert!(matches!(event, CardEvent::Inserted { ref reader, .. } if reader == "Reader0"));
//!
//! tracker.stop_monitoring()?;
//! # Ok::<(), cardtrigger_hardware::HardwareError>(())
//! ```

use std::iter;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use cardtrigger_core::MonitorSettings;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::card::{Card, CardIdentity};
use crate::error::{HardwareError, Result};
use crate::traits::{CardSubsystem, ContextCanceller, SubsystemContext};
use crate::transition::{Transition, classify};
use crate::types::{PNP_NOTIFICATION, ReaderStatus, StateFlags, StatusCode, StatusKind};

/// Attempts at the initial state fetch when readers vanish mid-enumeration.
const INITIAL_FETCH_ATTEMPTS: usize = 3;

/// Tracker tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackerConfig {
    /// Delay between context re-establishment attempts while the service is
    /// down.
    pub recovery_backoff: Duration,

    /// Interval between repeated cancel requests while stopping.
    pub cancel_retry: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self::from(&MonitorSettings::default())
    }
}

impl From<&MonitorSettings> for TrackerConfig {
    fn from(settings: &MonitorSettings) -> Self {
        Self {
            recovery_backoff: settings.recovery_backoff,
            cancel_retry: settings.cancel_retry,
        }
    }
}

/// A card presence event.
#[derive(Debug, Clone)]
pub enum CardEvent {
    /// A card was inserted and identified.
    Inserted {
        reader: String,
        card: Arc<Card>,
        observed_at: DateTime<Utc>,
    },

    /// The card of an earlier [`CardEvent::Inserted`] was removed, or its
    /// reader went away.
    Removed {
        reader: String,
        observed_at: DateTime<Utc>,
    },
}

impl CardEvent {
    fn inserted(reader: &str, card: Card) -> Self {
        Self::Inserted {
            reader: reader.to_string(),
            card: Arc::new(card),
            observed_at: Utc::now(),
        }
    }

    fn removed(reader: &str) -> Self {
        Self::Removed {
            reader: reader.to_string(),
            observed_at: Utc::now(),
        }
    }

    /// Name of the reader the event happened in.
    pub fn reader(&self) -> &str {
        match self {
            Self::Inserted { reader, .. } | Self::Removed { reader, .. } => reader,
        }
    }
}

/// Receiver of card events.
///
/// Events are delivered in order, on the thread that observed them. A
/// handler that blocks stalls the monitor.
pub trait CardEventHandler: Send + 'static {
    fn handle(&mut self, event: CardEvent);
}

impl<F> CardEventHandler for F
where
    F: FnMut(CardEvent) + Send + 'static,
{
    fn handle(&mut self, event: CardEvent) {
        self(event)
    }
}

#[derive(Debug)]
struct TrackedReader {
    status: ReaderStatus,
    episode_open: bool,
}

impl TrackedReader {
    fn new(name: String) -> Self {
        Self {
            status: ReaderStatus::unaware(name),
            episode_open: false,
        }
    }

    fn name(&self) -> &str {
        &self.status.name
    }

    fn open_episode<S: CardSubsystem, H: CardEventHandler>(&mut self, subsystem: &S, handler: &mut H) {
        if self.episode_open {
            self.close_episode(handler);
        }

        match CardIdentity::new(subsystem).open(self.name(), &self.status.atr) {
            Ok(card) => {
                info!(
                    reader = %self.name(),
                    card_type = %card.card_type(),
                    "Card inserted"
                );
                self.episode_open = true;
                handler.handle(CardEvent::inserted(self.name(), card));
            }
            Err(e) => {
                warn!(
                    reader = %self.name(),
                    atr = %hex::encode_upper(&self.status.atr),
                    error = %e,
                    "Ignoring card that could not be identified"
                );
            }
        }
    }

    fn close_episode<H: CardEventHandler>(&mut self, handler: &mut H) {
        if !self.episode_open {
            return;
        }
        self.episode_open = false;
        info!(reader = %self.name(), "Card removed");
        handler.handle(CardEvent::removed(self.name()));
    }
}

struct MonitorState<C> {
    context: C,
    readers: Vec<TrackedReader>,
    pnp: StateFlags,
    card_types: Vec<String>,
}

impl<C: SubsystemContext> MonitorState<C> {
    /// Establish a context, enumerate readers and card types, and fetch
    /// every reader's current state without blocking.
    fn establish<S>(subsystem: &S) -> std::result::Result<Self, StatusCode>
    where
        S: CardSubsystem<Context = C>,
    {
        let context = subsystem.establish_context()?;
        let card_types = context.list_card_types()?;

        let mut state = Self {
            context,
            readers: Vec::new(),
            pnp: StateFlags::UNAWARE,
            card_types,
        };

        let mut attempts = 0;
        loop {
            attempts += 1;
            state.readers = state
                .context
                .list_readers()?
                .into_iter()
                .map(TrackedReader::new)
                .collect();

            match state.fetch_initial() {
                Ok(()) => return Ok(state),
                Err(status)
                    if status.kind() == StatusKind::UnknownReader
                        && attempts < INITIAL_FETCH_ATTEMPTS =>
                {
                    debug!("Reader vanished during enumeration, retrying");
                }
                Err(status) => return Err(status),
            }
        }
    }

    fn fetch_initial(&mut self) -> std::result::Result<(), StatusCode> {
        let mut entries = self.wait_entries();
        match self
            .context
            .get_status_change(Some(Duration::ZERO), &mut entries)
        {
            Ok(()) => {}
            Err(status) if status.kind() == StatusKind::Timeout => return Ok(()),
            Err(status) => return Err(status),
        }

        if let Some(pnp) = entries.pop() {
            self.pnp = pnp.event_state.without(StateFlags::CHANGED);
        }
        for (tracked, entry) in self.readers.iter_mut().zip(entries) {
            tracked.status.event_state = entry.event_state;
            tracked.status.atr = entry.atr;
            tracked.status.commit();
        }
        Ok(())
    }

    /// Wait entries for every known reader, followed by the notification
    /// pseudo-reader.
    fn wait_entries(&self) -> Vec<ReaderStatus> {
        self.readers
            .iter()
            .map(|r| ReaderStatus::with_state(r.name(), r.status.current_state))
            .chain(iter::once(ReaderStatus::with_state(
                PNP_NOTIFICATION,
                self.pnp,
            )))
            .collect()
    }

    fn reader_names(&self) -> Vec<String> {
        self.readers.iter().map(|r| r.name().to_string()).collect()
    }
}

type SharedCanceller<C> = Arc<Mutex<<C as SubsystemContext>::Canceller>>;

struct MonitorLoop<S: CardSubsystem, H> {
    subsystem: Arc<S>,
    state: MonitorState<S::Context>,
    handler: H,
    stop: CancellationToken,
    canceller: SharedCanceller<S::Context>,
    config: TrackerConfig,
}

impl<S: CardSubsystem, H: CardEventHandler> MonitorLoop<S, H> {
    fn run(mut self) -> (MonitorState<S::Context>, Result<()>) {
        let result = self.poll();
        if let Err(e) = &result {
            error!(error = %e, "Monitor loop terminated");
        }
        (self.state, result)
    }

    fn poll(&mut self) -> Result<()> {
        loop {
            if self.stop.is_cancelled() {
                return Ok(());
            }

            let mut entries = self.state.wait_entries();
            let outcome = self.state.context.get_status_change(None, &mut entries);

            if self.stop.is_cancelled() {
                debug!("Stop requested, leaving monitor loop");
                return Ok(());
            }

            let status = match outcome {
                Ok(()) => {
                    self.apply(entries)?;
                    continue;
                }
                Err(status) => status,
            };

            debug!(status = %status, kind = ?status.kind(), "Status change wait returned");
            match status.kind() {
                StatusKind::Timeout => trace!("Status change wait timed out"),
                StatusKind::Cancelled => {
                    debug!("Status change wait cancelled");
                    return Ok(());
                }
                StatusKind::ServiceUnavailable => self.recover()?,
                StatusKind::UnknownReader | StatusKind::NoReaders => {
                    warn!(status = %status, "Reader set changed under the wait, refreshing");
                    self.refresh_topology()?;
                }
                StatusKind::Fatal => {
                    error!(status = %status, "Status change wait failed");
                    return Err(HardwareError::native("get_status_change", status));
                }
            }
        }
    }

    /// Process one successful wait.
    fn apply(&mut self, mut entries: Vec<ReaderStatus>) -> Result<()> {
        let pnp = entries.pop();

        for entry in entries.iter().filter(|e| e.is_changed()) {
            debug!(
                reader = %entry.name,
                "{}: {} => {}",
                entry.name,
                entry.current_state,
                entry.event_state
            );
        }

        let mut vanished = Vec::new();
        for (tracked, entry) in self.state.readers.iter_mut().zip(entries) {
            if !entry.is_changed() {
                continue;
            }

            let transition = classify(tracked.status.current_state, entry.event_state);
            tracked.status.event_state = entry.event_state;
            tracked.status.atr = entry.atr;

            match transition {
                Transition::None => {}
                Transition::Inserted => {
                    tracked.open_episode(self.subsystem.as_ref(), &mut self.handler);
                }
                Transition::Removed => tracked.close_episode(&mut self.handler),
                Transition::Swapped => {
                    debug!(reader = %tracked.name(), "Card swapped between observations");
                    tracked.close_episode(&mut self.handler);
                    tracked.open_episode(self.subsystem.as_ref(), &mut self.handler);
                }
                Transition::Vanished => {
                    tracked.close_episode(&mut self.handler);
                    vanished.push(tracked.name().to_string());
                }
            }

            tracked.status.commit();
        }

        if !vanished.is_empty() {
            self.state
                .readers
                .retain(|r| !vanished.iter().any(|name| name == r.name()));
            for name in &vanished {
                info!(reader = %name, "Reader unavailable");
            }
        }

        if let Some(pnp) = pnp
            && pnp.is_changed()
        {
            self.state.pnp = pnp.event_state.without(StateFlags::CHANGED);
            self.refresh_topology()?;
        }

        Ok(())
    }

    /// Re-enumerate readers: drop the missing ones, start tracking new ones.
    fn refresh_topology(&mut self) -> Result<()> {
        let names = match self.state.context.list_readers() {
            Ok(names) => names,
            Err(status) if status.kind() == StatusKind::ServiceUnavailable => {
                // The next wait reports the stop and triggers a reset.
                return Ok(());
            }
            Err(status) => {
                error!(status = %status, "Failed to enumerate readers");
                return Err(HardwareError::native("list_readers", status));
            }
        };

        let handler = &mut self.handler;
        self.state.readers.retain_mut(|tracked| {
            if names.iter().any(|n| n == tracked.name()) {
                return true;
            }
            tracked.close_episode(handler);
            info!(reader = %tracked.name(), "Reader detached");
            false
        });

        for name in names {
            if !self.state.readers.iter().any(|r| r.name() == name) {
                info!(reader = %name, "Reader attached");
                self.state.readers.push(TrackedReader::new(name));
            }
        }

        Ok(())
    }

    /// Recover from a stopped service: close every open episode, rebuild the
    /// context, then announce the cards that are present.
    fn recover(&mut self) -> Result<()> {
        info!("Smartcard service stopped, resetting context");
        for tracked in &mut self.state.readers {
            tracked.close_episode(&mut self.handler);
        }

        loop {
            if self.stop.is_cancelled() {
                return Ok(());
            }

            match MonitorState::establish(self.subsystem.as_ref()) {
                Ok(state) => {
                    *self.canceller.lock() = state.context.canceller();
                    self.state = state;
                    info!(
                        readers = self.state.readers.len(),
                        card_types = self.state.card_types.len(),
                        "Smartcard context re-established"
                    );
                    self.announce_present();
                    return Ok(());
                }
                Err(status) if status.kind() == StatusKind::ServiceUnavailable => {
                    debug!(
                        backoff_ms = self.config.recovery_backoff.as_millis() as u64,
                        "Smartcard service still unavailable"
                    );
                    self.sleep_unless_stopped(self.config.recovery_backoff);
                }
                Err(status) => {
                    error!(status = %status, "Failed to re-establish smartcard context");
                    return Err(HardwareError::native("establish_context", status));
                }
            }
        }
    }

    /// Fire inserts for cards already present in readers without an open
    /// episode.
    fn announce_present(&mut self) {
        for tracked in &mut self.state.readers {
            if tracked.status.current_state.contains(StateFlags::PRESENT) && !tracked.episode_open {
                tracked.open_episode(self.subsystem.as_ref(), &mut self.handler);
            }
        }
    }

    fn sleep_unless_stopped(&self, duration: Duration) {
        let deadline = Instant::now() + duration;
        while !self.stop.is_cancelled() {
            let now = Instant::now();
            if now >= deadline {
                return;
            }
            thread::sleep((deadline - now).min(self.config.cancel_retry));
        }
    }
}

/// Marks the monitor as finished when the monitor thread ends, including by
/// panic.
struct ExitGuard {
    finished: Arc<AtomicBool>,
    stop: CancellationToken,
    exit: CancellationToken,
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        self.finished.store(true, Ordering::SeqCst);
        self.stop.cancel();
        self.exit.cancel();
    }
}

/// Wait for a stop request, then cancel the context's pending wait until the
/// monitor thread has finished.
fn watch_for_stop<K: ContextCanceller>(
    stop: CancellationToken,
    finished: Arc<AtomicBool>,
    canceller: Arc<Mutex<K>>,
    retry: Duration,
) {
    futures::executor::block_on(stop.cancelled());
    while !finished.load(Ordering::SeqCst) {
        canceller.lock().cancel();
        thread::sleep(retry);
    }
}

struct RunningMonitor<C> {
    stop: CancellationToken,
    monitor: JoinHandle<(MonitorState<C>, Result<()>)>,
    watcher: JoinHandle<()>,
}

/// Tracks readers and cards of a smartcard subsystem.
///
/// # Lifecycle
///
/// 1. [`new`](Self::new) establishes a context and fetches the state of
///    every attached reader.
/// 2. [`start_monitoring`](Self::start_monitoring) announces cards already
///    present, then starts the monitor thread.
/// 3. [`stop_monitoring`](Self::stop_monitoring) stops and joins it. The
///    tracker can then be started again.
///
/// Dropping a running tracker stops it.
pub struct ReaderStateTracker<S: CardSubsystem> {
    subsystem: Arc<S>,
    config: TrackerConfig,
    state: Option<MonitorState<S::Context>>,
    running: Option<RunningMonitor<S::Context>>,
    exit: CancellationToken,
}

impl<S: CardSubsystem> ReaderStateTracker<S> {
    /// Create a tracker and establish its context.
    ///
    /// # Errors
    ///
    /// Returns [`HardwareError::Native`] if the context cannot be
    /// established or the readers cannot be enumerated.
    pub fn new(subsystem: Arc<S>, config: TrackerConfig) -> Result<Self> {
        let state = MonitorState::establish(subsystem.as_ref())
            .map_err(|status| HardwareError::native("establish_context", status))?;

        info!(
            readers = state.readers.len(),
            card_types = state.card_types.len(),
            "Smartcard context established"
        );

        Ok(Self {
            subsystem,
            config,
            state: Some(state),
            running: None,
            exit: CancellationToken::new(),
        })
    }

    /// Whether the monitor thread is running.
    pub fn is_monitoring(&self) -> bool {
        self.running
            .as_ref()
            .is_some_and(|running| !running.monitor.is_finished())
    }

    /// Known readers. Empty while monitoring.
    pub fn readers(&self) -> Vec<String> {
        self.state
            .as_ref()
            .map(MonitorState::reader_names)
            .unwrap_or_default()
    }

    /// Token cancelled when the current (or next) monitor run ends for any
    /// reason, including a fatal error.
    ///
    /// A token taken before [`start_monitoring`](Self::start_monitoring)
    /// belongs to the run it starts. [`stop_monitoring`](Self::stop_monitoring)
    /// moves on to a fresh token for the run after.
    pub fn exit_signal(&self) -> CancellationToken {
        self.exit.clone()
    }

    /// Start monitoring.
    ///
    /// Inserts for cards already present are delivered to `handler` before
    /// this returns. Cancelling `cancel` stops the monitor like
    /// [`stop_monitoring`](Self::stop_monitoring), except that the thread is
    /// not joined.
    ///
    /// Returns `Ok(false)` without doing anything if a monitor is already
    /// running.
    ///
    /// # Errors
    ///
    /// Returns an error if a lost context cannot be re-established or a
    /// thread cannot be spawned.
    pub fn start_monitoring<H: CardEventHandler>(
        &mut self,
        cancel: &CancellationToken,
        handler: H,
    ) -> Result<bool> {
        if self.is_monitoring() {
            warn!("Monitoring already running");
            return Ok(false);
        }
        if self.running.is_some()
            && let Err(e) = self.stop_monitoring()
        {
            warn!(error = %e, "Previous monitor run ended with an error");
        }

        let state = match self.state.take() {
            Some(state) => state,
            None => MonitorState::establish(self.subsystem.as_ref())
                .map_err(|status| HardwareError::native("establish_context", status))?,
        };

        let stop = cancel.child_token();
        let exit = self.exit.clone();
        let finished = Arc::new(AtomicBool::new(false));
        let canceller = Arc::new(Mutex::new(state.context.canceller()));

        let watcher = {
            let stop = stop.clone();
            let finished = Arc::clone(&finished);
            let canceller = Arc::clone(&canceller);
            let retry = self.config.cancel_retry;
            thread::Builder::new()
                .name("cardtrigger-cancel".to_string())
                .spawn(move || watch_for_stop(stop, finished, canceller, retry))?
        };

        let mut monitor = MonitorLoop {
            subsystem: Arc::clone(&self.subsystem),
            state,
            handler,
            stop: stop.clone(),
            canceller,
            config: self.config,
        };
        monitor.announce_present();

        let guard = ExitGuard {
            finished,
            stop: stop.clone(),
            exit,
        };
        let monitor = thread::Builder::new()
            .name("cardtrigger-monitor".to_string())
            .spawn(move || {
                let _guard = guard;
                monitor.run()
            });

        let monitor = match monitor {
            Ok(monitor) => monitor,
            Err(e) => {
                // The guard was dropped with the closure, releasing the watcher.
                let _ = watcher.join();
                self.exit = CancellationToken::new();
                return Err(HardwareError::Thread(e));
            }
        };

        self.running = Some(RunningMonitor {
            stop,
            monitor,
            watcher,
        });
        info!("Monitoring started");
        Ok(true)
    }

    /// Stop monitoring and wait for the monitor thread to exit.
    ///
    /// Does nothing if no monitor is running. No events are delivered after
    /// this returns, and the handler has been dropped.
    ///
    /// # Errors
    ///
    /// Returns the error that terminated the monitor loop, or
    /// [`HardwareError::MonitorPanicked`] if the thread panicked.
    pub fn stop_monitoring(&mut self) -> Result<()> {
        let Some(running) = self.running.take() else {
            return Ok(());
        };

        running.stop.cancel();
        let joined = running.monitor.join();
        if running.watcher.join().is_err() {
            warn!("Cancel watcher panicked");
        }
        self.exit = CancellationToken::new();

        match joined {
            Ok((state, result)) => {
                self.state = Some(state);
                info!("Monitoring stopped");
                result
            }
            Err(_) => {
                error!("Monitor thread panicked");
                Err(HardwareError::MonitorPanicked)
            }
        }
    }
}

impl<S: CardSubsystem> Drop for ReaderStateTracker<S> {
    fn drop(&mut self) {
        if let Err(e) = self.stop_monitoring() {
            warn!(error = %e, "Monitor ended with an error");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockCard, MockSubsystem};
    use std::sync::mpsc;

    const ATR: [u8; 2] = [0x3B, 0x02];

    fn setup() -> (
        ReaderStateTracker<MockSubsystem>,
        crate::mock::MockSubsystemHandle,
    ) {
        let (subsystem, handle) = MockSubsystem::new();
        handle.register_card_type("PIV", &ATR);
        handle.attach_reader("Reader0");
        let tracker = ReaderStateTracker::new(Arc::new(subsystem), TrackerConfig::default()).unwrap();
        (tracker, handle)
    }

    #[test]
    fn test_new_enumerates_readers() {
        let (tracker, _handle) = setup();
        assert_eq!(tracker.readers(), vec!["Reader0"]);
        assert!(!tracker.is_monitoring());
    }

    #[test]
    fn test_present_card_announced_synchronously() {
        let (subsystem, handle) = MockSubsystem::new();
        handle.register_card_type("PIV", &ATR);
        handle.attach_reader("Reader0");
        handle.insert_card("Reader0", MockCard::new(ATR.to_vec())).unwrap();

        let mut tracker =
            ReaderStateTracker::new(Arc::new(subsystem), TrackerConfig::default()).unwrap();
        let (tx, rx) = mpsc::channel();
        let started = tracker
            .start_monitoring(&CancellationToken::new(), move |event: CardEvent| {
                let _ = tx.send(event);
            })
            .unwrap();

        assert!(started);
        let event = rx.try_recv().unwrap();
        assert!(matches!(event, CardEvent::Inserted { ref reader, .. } if reader == "Reader0"));

        tracker.stop_monitoring().unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_second_start_returns_false() {
        let (mut tracker, _handle) = setup();
        let cancel = CancellationToken::new();

        assert!(tracker.start_monitoring(&cancel, |_: CardEvent| {}).unwrap());
        assert!(!tracker.start_monitoring(&cancel, |_: CardEvent| {}).unwrap());

        tracker.stop_monitoring().unwrap();
    }

    #[test]
    fn test_stop_when_idle_is_noop() {
        let (mut tracker, _handle) = setup();
        tracker.stop_monitoring().unwrap();
        tracker.stop_monitoring().unwrap();
    }

    #[test]
    fn test_exit_signal_fires_on_stop() {
        let (mut tracker, _handle) = setup();
        tracker
            .start_monitoring(&CancellationToken::new(), |_: CardEvent| {})
            .unwrap();
        let exit = tracker.exit_signal();
        assert!(!exit.is_cancelled());

        tracker.stop_monitoring().unwrap();
        assert!(exit.is_cancelled());
    }
}
