//! Reader state bits and native status codes.
//!
//! These mirror the PC/SC `SCARD_STATE_*` flags and `SCARD_E_*` status codes
//! so that every backend, real or simulated, speaks the same vocabulary.

use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign, Not};

/// Name of the pseudo-reader that reports reader attach/detach.
pub const PNP_NOTIFICATION: &str = r"\\?PnP?\Notification";

/// Reader state bitmask.
///
/// The low 16 bits are state flags. The high 16 bits carry the reader's
/// event counter, which the subsystem increments on every card insertion or
/// removal (for the notification pseudo-reader, on every topology change).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct StateFlags(u32);

impl StateFlags {
    pub const UNAWARE: Self = Self(0x0000);
    pub const IGNORE: Self = Self(0x0001);
    pub const CHANGED: Self = Self(0x0002);
    pub const UNKNOWN: Self = Self(0x0004);
    pub const UNAVAILABLE: Self = Self(0x0008);
    pub const EMPTY: Self = Self(0x0010);
    pub const PRESENT: Self = Self(0x0020);
    pub const ATRMATCH: Self = Self(0x0040);
    pub const EXCLUSIVE: Self = Self(0x0080);
    pub const INUSE: Self = Self(0x0100);
    pub const MUTE: Self = Self(0x0200);
    pub const UNPOWERED: Self = Self(0x0400);

    const FLAG_MASK: u32 = 0x0000_FFFF;

    #[must_use]
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Build a state from flags and an event counter.
    #[must_use]
    pub const fn with_event_count(flags: Self, count: u16) -> Self {
        Self((flags.0 & Self::FLAG_MASK) | ((count as u32) << 16))
    }

    /// State flags without the event counter.
    #[must_use]
    pub const fn flags(self) -> Self {
        Self(self.0 & Self::FLAG_MASK)
    }

    /// Event counter from the high 16 bits.
    #[must_use]
    pub const fn event_count(self) -> u16 {
        (self.0 >> 16) as u16
    }

    /// Check whether every bit of `other` is set. `UNAWARE` is only
    /// contained in itself.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        if other.0 == 0 {
            return self.flags().0 == 0;
        }
        self.0 & other.0 == other.0
    }

    /// Check whether any bit of `other` is set.
    #[must_use]
    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    /// State with the bits of `other` cleared.
    #[must_use]
    pub const fn without(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }
}

impl BitOr for StateFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for StateFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for StateFlags {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl Not for StateFlags {
    type Output = Self;

    fn not(self) -> Self {
        Self(!self.0)
    }
}

impl fmt::Debug for StateFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(StateFlags, &str); 11] = [
            (StateFlags::IGNORE, "IGNORE"),
            (StateFlags::CHANGED, "CHANGED"),
            (StateFlags::UNKNOWN, "UNKNOWN"),
            (StateFlags::UNAVAILABLE, "UNAVAILABLE"),
            (StateFlags::EMPTY, "EMPTY"),
            (StateFlags::PRESENT, "PRESENT"),
            (StateFlags::ATRMATCH, "ATRMATCH"),
            (StateFlags::EXCLUSIVE, "EXCLUSIVE"),
            (StateFlags::INUSE, "INUSE"),
            (StateFlags::MUTE, "MUTE"),
            (StateFlags::UNPOWERED, "UNPOWERED"),
        ];

        let names: Vec<&str> = NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();

        if names.is_empty() {
            write!(f, "UNAWARE")?;
        } else {
            write!(f, "{}", names.join("|"))?;
        }
        if self.event_count() != 0 {
            write!(f, "#{}", self.event_count())?;
        }
        Ok(())
    }
}

impl fmt::Display for StateFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Classification of a native status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusKind {
    /// The wait timed out. Retry.
    Timeout,
    /// The wait was cancelled through the context's canceller.
    Cancelled,
    /// The service stopped or is not running. Reset the context.
    ServiceUnavailable,
    /// No readers are attached.
    NoReaders,
    /// A reader named in the wait is gone.
    UnknownReader,
    /// Anything else.
    Fatal,
}

/// Raw 32-bit native status code.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct StatusCode(u32);

impl StatusCode {
    pub const CANCELLED: Self = Self(0x8010_0002);
    pub const UNKNOWN_READER: Self = Self(0x8010_0009);
    pub const TIMEOUT: Self = Self(0x8010_000A);
    pub const CARD_UNSUPPORTED: Self = Self(0x8010_001C);
    pub const NO_SERVICE: Self = Self(0x8010_001D);
    pub const SERVICE_STOPPED: Self = Self(0x8010_001E);
    pub const UNEXPECTED: Self = Self(0x8010_001F);
    pub const NO_READERS_AVAILABLE: Self = Self(0x8010_002E);

    #[must_use]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }

    #[must_use]
    pub fn kind(self) -> StatusKind {
        match self {
            Self::TIMEOUT => StatusKind::Timeout,
            Self::CANCELLED => StatusKind::Cancelled,
            Self::NO_SERVICE | Self::SERVICE_STOPPED => StatusKind::ServiceUnavailable,
            Self::NO_READERS_AVAILABLE => StatusKind::NoReaders,
            Self::UNKNOWN_READER => StatusKind::UnknownReader,
            _ => StatusKind::Fatal,
        }
    }
}

impl fmt::Debug for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StatusCode({:#010X})", self.0)
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08X}", self.0)
    }
}

/// One entry of a status-change wait.
///
/// The caller fills `name` and `current_state`; the subsystem fills
/// `event_state` and `atr`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReaderStatus {
    pub name: String,
    pub current_state: StateFlags,
    pub event_state: StateFlags,
    pub atr: Vec<u8>,
}

impl ReaderStatus {
    /// Create an entry for a reader nothing is known about yet.
    pub fn unaware(name: impl Into<String>) -> Self {
        Self::with_state(name, StateFlags::UNAWARE)
    }

    pub fn with_state(name: impl Into<String>, current_state: StateFlags) -> Self {
        Self {
            name: name.into(),
            current_state,
            event_state: StateFlags::UNAWARE,
            atr: Vec::new(),
        }
    }

    /// Whether the subsystem flagged this entry for re-evaluation.
    #[must_use]
    pub fn is_changed(&self) -> bool {
        self.event_state.contains(StateFlags::CHANGED)
    }

    /// Accept the reported event state as the new current state.
    pub fn commit(&mut self) {
        self.current_state = self.event_state.without(StateFlags::CHANGED);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(StatusCode::TIMEOUT, StatusKind::Timeout)]
    #[case(StatusCode::CANCELLED, StatusKind::Cancelled)]
    #[case(StatusCode::NO_SERVICE, StatusKind::ServiceUnavailable)]
    #[case(StatusCode::SERVICE_STOPPED, StatusKind::ServiceUnavailable)]
    #[case(StatusCode::NO_READERS_AVAILABLE, StatusKind::NoReaders)]
    #[case(StatusCode::UNKNOWN_READER, StatusKind::UnknownReader)]
    #[case(StatusCode::UNEXPECTED, StatusKind::Fatal)]
    #[case(StatusCode::CARD_UNSUPPORTED, StatusKind::Fatal)]
    fn test_status_kind(#[case] code: StatusCode, #[case] kind: StatusKind) {
        assert_eq!(code.kind(), kind);
    }

    #[test]
    fn test_status_display() {
        assert_eq!(StatusCode::SERVICE_STOPPED.to_string(), "0x8010001E");
        assert_eq!(StatusCode::from_raw(0x8010_001E), StatusCode::SERVICE_STOPPED);
    }

    #[test]
    fn test_event_count() {
        let state = StateFlags::with_event_count(StateFlags::PRESENT | StateFlags::CHANGED, 7);
        assert_eq!(state.event_count(), 7);
        assert_eq!(state.flags(), StateFlags::PRESENT | StateFlags::CHANGED);
        assert!(state.contains(StateFlags::PRESENT));
        assert_eq!(state.bits(), 0x0007_0022);
    }

    #[test]
    fn test_unaware_contains() {
        assert!(StateFlags::UNAWARE.contains(StateFlags::UNAWARE));
        assert!(StateFlags::with_event_count(StateFlags::UNAWARE, 3).contains(StateFlags::UNAWARE));
        assert!(!StateFlags::EMPTY.contains(StateFlags::UNAWARE));
    }

    #[test]
    fn test_state_debug() {
        let state = StateFlags::with_event_count(StateFlags::PRESENT | StateFlags::INUSE, 2);
        assert_eq!(format!("{state:?}"), "PRESENT|INUSE#2");
        assert_eq!(format!("{:?}", StateFlags::UNAWARE), "UNAWARE");
    }

    #[test]
    fn test_commit_strips_changed() {
        let mut status = ReaderStatus::unaware("Reader0");
        status.event_state = StateFlags::PRESENT | StateFlags::CHANGED;
        assert!(status.is_changed());

        status.commit();
        assert_eq!(status.current_state, StateFlags::PRESENT);
    }
}
