//! PC/SC backend.
//!
//! PC/SC-lite has no card-type database, so card types are resolved from a
//! configured [`CardTypeTable`]. Certificates are read from the card's PIV
//! applet.

use std::ffi::CString;
use std::time::Duration;

use cardtrigger_core::CardTypeTable;
use pcsc::{Context, Protocols, ReaderState, Scope, ShareMode, State};
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, warn};

use crate::card::Certificate;
use crate::error::{HardwareError, Result};
use crate::piv::{ApduTransport, PivApplet, PivSlot};
use crate::traits::{CardSession, CardSubsystem, ContextCanceller, SubsystemContext};
use crate::types::{ReaderStatus, StateFlags, StatusCode};

fn status(error: pcsc::Error) -> StatusCode {
    StatusCode::from_raw(error as u32)
}

/// PC/SC smartcard subsystem.
#[derive(Debug, Clone)]
pub struct PcscSubsystem {
    card_types: CardTypeTable,
}

impl PcscSubsystem {
    pub fn new(card_types: CardTypeTable) -> Self {
        Self { card_types }
    }
}

impl CardSubsystem for PcscSubsystem {
    type Context = PcscContext;

    fn establish_context(&self) -> std::result::Result<PcscContext, StatusCode> {
        let context = Context::establish(Scope::User).map_err(status)?;
        Ok(PcscContext {
            context,
            card_types: self
                .card_types
                .patterns()
                .iter()
                .map(|p| p.name().to_string())
                .collect(),
        })
    }

    fn list_card_types_by_atr(&self, atr: &[u8]) -> std::result::Result<Vec<String>, StatusCode> {
        Ok(self.card_types.card_types_for_atr(atr))
    }

    fn open_card(&self, reader: &str, card_type: &str) -> Result<Box<dyn CardSession>> {
        let context = Context::establish(Scope::User)
            .map_err(|e| HardwareError::native("establish_context", status(e)))?;
        let name = CString::new(reader)
            .map_err(|_| HardwareError::invalid_data(format!("reader name {reader:?}")))?;
        let card = context
            .connect(&name, ShareMode::Shared, Protocols::ANY)
            .map_err(|e| HardwareError::native("connect", status(e)))?;

        debug!(reader = %reader, card_type = %card_type, "Connected to card");
        Ok(Box::new(PcscSession {
            card,
            _context: context,
            reader: reader.to_string(),
        }))
    }
}

/// An established PC/SC context.
pub struct PcscContext {
    context: Context,
    card_types: Vec<String>,
}

impl SubsystemContext for PcscContext {
    type Canceller = PcscCanceller;

    fn list_readers(&self) -> std::result::Result<Vec<String>, StatusCode> {
        match self.context.list_readers_owned() {
            Ok(readers) => Ok(readers
                .into_iter()
                .map(|r| r.to_string_lossy().into_owned())
                .collect()),
            Err(pcsc::Error::NoReadersAvailable) => Ok(Vec::new()),
            Err(e) => Err(status(e)),
        }
    }

    fn list_card_types(&self) -> std::result::Result<Vec<String>, StatusCode> {
        Ok(self.card_types.clone())
    }

    fn get_status_change(
        &mut self,
        timeout: Option<Duration>,
        readers: &mut [ReaderStatus],
    ) -> std::result::Result<(), StatusCode> {
        let mut states = readers
            .iter()
            .map(|r| {
                let name = CString::new(r.name.as_str()).map_err(|_| StatusCode::UNKNOWN_READER)?;
                // The high bits carry the event counter and must reach the
                // service untouched.
                let current = State::from_bits_retain(r.current_state.bits() as _);
                Ok(ReaderState::new(name, current))
            })
            .collect::<std::result::Result<Vec<_>, StatusCode>>()?;

        self.context
            .get_status_change(timeout, &mut states)
            .map_err(status)?;

        for (entry, state) in readers.iter_mut().zip(&states) {
            let flags = StateFlags::from_bits(state.event_state().bits() as u32);
            entry.event_state = StateFlags::with_event_count(flags, state.event_count() as u16);
            entry.atr = state.atr().to_vec();
        }
        Ok(())
    }

    fn canceller(&self) -> PcscCanceller {
        PcscCanceller {
            context: self.context.clone(),
        }
    }
}

/// Cancels a pending wait of a [`PcscContext`].
#[derive(Clone)]
pub struct PcscCanceller {
    context: Context,
}

impl ContextCanceller for PcscCanceller {
    fn cancel(&self) {
        if let Err(e) = self.context.cancel() {
            debug!(status = %status(e), "Cancel request failed");
        }
    }
}

struct PcscSession {
    card: pcsc::Card,
    _context: Context,
    reader: String,
}

impl ApduTransport for PcscSession {
    fn transmit(&mut self, apdu: &[u8]) -> Result<Vec<u8>> {
        let mut buffer = [0; pcsc::MAX_BUFFER_SIZE_EXTENDED];
        let response = self
            .card
            .transmit(apdu, &mut buffer)
            .map_err(|e| HardwareError::native("transmit", status(e)))?;
        Ok(response.to_vec())
    }
}

impl CardSession for PcscSession {
    fn certificates(&mut self) -> Result<Vec<Certificate>> {
        let reader = self.reader.clone();
        let mut applet = PivApplet::select(self)?;
        let mut certificates = Vec::new();

        for slot in PivSlot::ALL {
            let der = match applet.read_certificate(slot) {
                Ok(Some(der)) => der,
                Ok(None) => continue,
                Err(e) => {
                    warn!(reader = %reader, slot = %format!("{:02X}", slot.id()), error = %e, "Skipping unreadable certificate slot");
                    continue;
                }
            };

            match x509_parser::parse_x509_certificate(&der) {
                Ok((_, parsed)) => {
                    let subject = parsed.subject().to_string();
                    certificates.push(Certificate::new(subject, der));
                }
                Err(e) => {
                    warn!(reader = %reader, slot = %format!("{:02X}", slot.id()), error = %e, "Skipping malformed certificate");
                }
            }
        }

        Ok(certificates)
    }

    fn unlock(&mut self, pin: &SecretString) -> Result<()> {
        PivApplet::select(self)?.verify(pin.expose_secret())
    }
}
