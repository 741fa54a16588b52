//! Certificate policy model.
//!
//! A [`Policy`] is an ordered list of [`CertificatePolicy`] entries, each
//! binding a certificate subject to the actions that fire when a card holding
//! that certificate is inserted or removed. The types here are the validated
//! form; raw configuration goes through [`crate::config`] first.

use crate::error::{Error, Result};
use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::str::FromStr;

/// Card events an action is bound to.
///
/// The flags are non-exclusive: an action may fire on insert, on remove, or
/// on both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct EventFlags(u8);

impl EventFlags {
    /// No events.
    pub const NONE: Self = Self(0);

    /// Card inserted.
    pub const INSERT: Self = Self(0x01);

    /// Card removed.
    pub const REMOVE: Self = Self(0x02);

    const ALL_BITS: u8 = 0x03;

    /// Check whether every flag in `other` is also set in `self`.
    #[must_use]
    pub fn contains(self, other: Self) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }

    /// Check whether no flag is set.
    #[must_use]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Raw bit value.
    #[must_use]
    pub fn bits(self) -> u8 {
        self.0
    }

    /// Build flags from raw bits, rejecting unknown bits.
    #[must_use]
    pub fn from_bits(bits: u8) -> Option<Self> {
        if bits & !Self::ALL_BITS != 0 {
            return None;
        }
        Some(Self(bits))
    }
}

impl BitOr for EventFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for EventFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for EventFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.contains(Self::INSERT), self.contains(Self::REMOVE)) {
            (true, true) => write!(f, "insert,remove"),
            (true, false) => write!(f, "insert"),
            (false, true) => write!(f, "remove"),
            (false, false) => write!(f, "none"),
        }
    }
}

impl FromStr for EventFlags {
    type Err = Error;

    /// Decode `"insert"`, `"remove"` or a combination separated by `,` or
    /// `|`. Tokens are case-insensitive; an unknown or empty token rejects
    /// the whole value.
    fn from_str(s: &str) -> Result<Self> {
        let mut flags = Self::NONE;

        for token in s.split([',', '|']) {
            let token = token.trim();
            flags |= match token.to_ascii_lowercase().as_str() {
                "insert" => Self::INSERT,
                "remove" => Self::REMOVE,
                _ => return Err(Error::invalid_event_flags(s, token)),
            };
        }

        Ok(flags)
    }
}

/// A named action parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Parameter {
    pub name: String,
    pub value: String,
}

impl Parameter {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Ordered action parameters.
///
/// Order is preserved as configured. Lookups return the first parameter with
/// a matching name.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Parameters(Vec<Parameter>);

impl Parameters {
    pub fn new(parameters: Vec<Parameter>) -> Self {
        Self(parameters)
    }

    /// Get the value of the first parameter named `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.value.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Parameter> {
        self.0.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, String)> for Parameters {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(name, value)| Parameter { name, value })
                .collect(),
        )
    }
}

/// One configured action for a certificate subject.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionConfig {
    on: EventFlags,
    target: String,
    require_pin: bool,
    parameters: Parameters,
}

impl ActionConfig {
    /// Create a validated action configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if `on` has no flag set or `target` is blank.
    pub fn new(
        on: EventFlags,
        target: impl Into<String>,
        require_pin: bool,
        parameters: Parameters,
    ) -> Result<Self> {
        let target = target.into();
        if on.is_empty() {
            return Err(Error::invalid_event_flags("", ""));
        }
        if target.trim().is_empty() {
            return Err(Error::EmptyTarget {
                subject: String::new(),
            });
        }
        Ok(Self {
            on,
            target,
            require_pin,
            parameters,
        })
    }

    /// Events this action fires on.
    #[must_use]
    pub fn on(&self) -> EventFlags {
        self.on
    }

    /// Identifier of the action handler to invoke.
    #[must_use]
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Whether the handler needs the card PIN.
    #[must_use]
    pub fn require_pin(&self) -> bool {
        self.require_pin
    }

    #[must_use]
    pub fn parameters(&self) -> &Parameters {
        &self.parameters
    }

    /// Check whether this action fires on `event`.
    #[must_use]
    pub fn fires_on(&self, event: EventFlags) -> bool {
        self.on.contains(event)
    }
}

/// Actions bound to one certificate subject.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificatePolicy {
    subject: String,
    actions: Vec<ActionConfig>,
}

impl CertificatePolicy {
    /// # Errors
    ///
    /// Returns [`Error::EmptySubject`] if the subject is blank.
    pub fn new(subject: impl Into<String>, actions: Vec<ActionConfig>) -> Result<Self> {
        let subject = subject.into();
        if subject.trim().is_empty() {
            return Err(Error::EmptySubject);
        }
        Ok(Self { subject, actions })
    }

    #[must_use]
    pub fn subject(&self) -> &str {
        &self.subject
    }

    #[must_use]
    pub fn actions(&self) -> &[ActionConfig] {
        &self.actions
    }
}

/// The full certificate policy, in configuration order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Policy {
    entries: Vec<CertificatePolicy>,
}

impl Policy {
    pub fn new(entries: Vec<CertificatePolicy>) -> Self {
        Self { entries }
    }

    #[must_use]
    pub fn entries(&self) -> &[CertificatePolicy] {
        &self.entries
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Actions that fire on `event` for a certificate with exactly `subject`.
    ///
    /// Subjects are compared byte for byte. Entries and their actions are
    /// yielded in configuration order.
    pub fn matching<'a>(
        &'a self,
        subject: &'a str,
        event: EventFlags,
    ) -> impl Iterator<Item = &'a ActionConfig> + 'a {
        self.entries
            .iter()
            .filter(move |entry| entry.subject == subject)
            .flat_map(|entry| entry.actions.iter())
            .filter(move |action| action.fires_on(event))
    }

    /// Every distinct action target referenced by the policy.
    pub fn targets(&self) -> impl Iterator<Item = &str> {
        self.entries
            .iter()
            .flat_map(|entry| entry.actions.iter())
            .map(ActionConfig::target)
    }
}
