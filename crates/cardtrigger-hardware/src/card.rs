//! Card identity and card handles.

use std::sync::OnceLock;

use parking_lot::Mutex;
use secrecy::SecretString;
use sha1::{Digest, Sha1};
use tracing::debug;

use crate::error::{HardwareError, Result};
use crate::traits::{CardSession, CardSubsystem};

/// A certificate read from a card.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Certificate {
    subject: String,
    thumbprint: String,
    der: Vec<u8>,
}

impl Certificate {
    /// Create a certificate from its subject and DER encoding. The
    /// thumbprint is the upper-case hex SHA-1 of the DER bytes.
    pub fn new(subject: impl Into<String>, der: Vec<u8>) -> Self {
        let thumbprint = hex::encode_upper(Sha1::digest(&der));
        Self {
            subject: subject.into(),
            thumbprint,
            der,
        }
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn thumbprint(&self) -> &str {
        &self.thumbprint
    }

    pub fn der(&self) -> &[u8] {
        &self.der
    }
}

/// A card inserted in a reader.
///
/// The certificate store is fetched on first use and cached for the life of
/// the handle. The underlying session is closed when the handle is dropped.
pub struct Card {
    reader: String,
    card_type: String,
    atr: Vec<u8>,
    session: Mutex<Box<dyn CardSession>>,
    certificates: OnceLock<Vec<Certificate>>,
}

impl Card {
    pub fn new(
        reader: impl Into<String>,
        card_type: impl Into<String>,
        atr: Vec<u8>,
        session: Box<dyn CardSession>,
    ) -> Self {
        Self {
            reader: reader.into(),
            card_type: card_type.into(),
            atr,
            session: Mutex::new(session),
            certificates: OnceLock::new(),
        }
    }

    pub fn reader(&self) -> &str {
        &self.reader
    }

    pub fn card_type(&self) -> &str {
        &self.card_type
    }

    pub fn atr(&self) -> &[u8] {
        &self.atr
    }

    /// Certificates on the card.
    ///
    /// # Errors
    ///
    /// Returns an error if the store has not been read yet and reading it
    /// fails. A failed read is retried on the next call.
    pub fn certificates(&self) -> Result<&[Certificate]> {
        if let Some(certificates) = self.certificates.get() {
            return Ok(certificates);
        }

        let fetched = self.session.lock().certificates()?;
        debug!(
            reader = %self.reader,
            count = fetched.len(),
            "Read certificate store"
        );
        Ok(self.certificates.get_or_init(|| fetched))
    }

    /// Unlock the card with `pin`.
    ///
    /// # Errors
    ///
    /// Returns an error if the PIN is rejected.
    pub fn unlock(&self, pin: &SecretString) -> Result<()> {
        self.session.lock().unlock(pin)
    }
}

impl std::fmt::Debug for Card {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Card")
            .field("reader", &self.reader)
            .field("card_type", &self.card_type)
            .field("atr", &hex::encode_upper(&self.atr))
            .finish_non_exhaustive()
    }
}

/// Resolves cards to card types and opens them.
pub struct CardIdentity<'a, S: CardSubsystem> {
    subsystem: &'a S,
}

impl<'a, S: CardSubsystem> CardIdentity<'a, S> {
    pub fn new(subsystem: &'a S) -> Self {
        Self { subsystem }
    }

    /// Resolve `atr` to exactly one card type name.
    ///
    /// # Errors
    ///
    /// - [`HardwareError::UnsupportedCard`] if no card type matches
    /// - [`HardwareError::AmbiguousCard`] if more than one matches
    /// - [`HardwareError::Native`] if the lookup itself fails
    pub fn resolve_card_type(&self, atr: &[u8]) -> Result<String> {
        let mut card_types = self
            .subsystem
            .list_card_types_by_atr(atr)
            .map_err(|status| HardwareError::native("list_card_types_by_atr", status))?;

        match card_types.len() {
            0 => Err(HardwareError::unsupported_card(atr)),
            1 => Ok(card_types.remove(0)),
            _ => Err(HardwareError::ambiguous_card(atr, card_types)),
        }
    }

    /// Resolve the card in `reader` and open a handle to it.
    ///
    /// # Errors
    ///
    /// Returns an error if the card type cannot be resolved or the card
    /// cannot be opened.
    pub fn open(&self, reader: &str, atr: &[u8]) -> Result<Card> {
        let card_type = self.resolve_card_type(atr)?;
        let session = self.subsystem.open_card(reader, &card_type)?;
        Ok(Card::new(reader, card_type, atr.to_vec(), session))
    }
}
