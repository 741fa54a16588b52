//! ATR table used to name card types.
//!
//! The platform card database maps an Answer-To-Reset to zero or more card
//! type names. Backends without such a database (and the mock subsystem) use a
//! [`CardTypeTable`] built from configuration instead.

use crate::error::{Error, Result};

/// One named ATR pattern with an optional mask.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AtrPattern {
    name: String,
    atr: Vec<u8>,
    mask: Option<Vec<u8>>,
}

impl AtrPattern {
    /// Create a pattern from raw bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidAtr`] if the ATR is empty or the mask length
    /// does not match the ATR length.
    pub fn new(name: impl Into<String>, atr: Vec<u8>, mask: Option<Vec<u8>>) -> Result<Self> {
        let name = name.into();
        if atr.is_empty() {
            return Err(Error::invalid_atr(name, "ATR is empty"));
        }
        if let Some(mask) = &mask
            && mask.len() != atr.len()
        {
            return Err(Error::invalid_atr(
                name,
                format!("mask has {} bytes, ATR has {}", mask.len(), atr.len()),
            ));
        }
        Ok(Self { name, atr, mask })
    }

    /// Create a pattern from hex strings. Whitespace and `:` separators are
    /// ignored.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidAtr`] on malformed hex.
    pub fn from_hex(name: impl Into<String>, atr: &str, mask: Option<&str>) -> Result<Self> {
        let name = name.into();
        let atr = decode_hex(&name, atr)?;
        let mask = mask.map(|m| decode_hex(&name, m)).transpose()?;
        Self::new(name, atr, mask)
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn atr(&self) -> &[u8] {
        &self.atr
    }

    /// Check whether `atr` matches this pattern.
    ///
    /// Without a mask the ATR must be identical. With a mask, both sides are
    /// ANDed with it before comparing.
    #[must_use]
    pub fn matches(&self, atr: &[u8]) -> bool {
        if atr.len() != self.atr.len() {
            return false;
        }
        match &self.mask {
            None => atr == self.atr.as_slice(),
            Some(mask) => atr
                .iter()
                .zip(&self.atr)
                .zip(mask)
                .all(|((a, b), m)| a & m == b & m),
        }
    }
}

fn decode_hex(name: &str, value: &str) -> Result<Vec<u8>> {
    let cleaned: String = value
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ':')
        .collect();
    hex::decode(&cleaned).map_err(|e| Error::invalid_atr(name, e.to_string()))
}

/// Ordered collection of ATR patterns.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CardTypeTable {
    patterns: Vec<AtrPattern>,
}

impl CardTypeTable {
    pub fn new(patterns: Vec<AtrPattern>) -> Self {
        Self { patterns }
    }

    /// Names of every card type whose pattern matches `atr`, in table order.
    #[must_use]
    pub fn card_types_for_atr(&self, atr: &[u8]) -> Vec<String> {
        self.patterns
            .iter()
            .filter(|p| p.matches(atr))
            .map(|p| p.name.clone())
            .collect()
    }

    pub fn push(&mut self, pattern: AtrPattern) {
        self.patterns.push(pattern);
    }

    #[must_use]
    pub fn patterns(&self) -> &[AtrPattern] {
        &self.patterns
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}
