//! PIV applet access over APDUs.
//!
//! Only what certificate-based triggering needs: select the applet, read the
//! certificate objects of the standard key slots, and verify the PIN.

use crate::error::{HardwareError, Result};

/// PIV application identifier.
pub const PIV_AID: [u8; 9] = [0xA0, 0x00, 0x00, 0x03, 0x08, 0x00, 0x00, 0x10, 0x00];

/// PIV key slots whose certificates are read, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PivSlot {
    /// 9A: PIV authentication.
    Authentication,
    /// 9C: digital signature.
    Signature,
    /// 9D: key management.
    KeyManagement,
    /// 9E: card authentication.
    CardAuthentication,
}

impl PivSlot {
    pub const ALL: [PivSlot; 4] = [
        PivSlot::Authentication,
        PivSlot::Signature,
        PivSlot::KeyManagement,
        PivSlot::CardAuthentication,
    ];

    /// Slot identifier byte.
    pub fn id(self) -> u8 {
        match self {
            Self::Authentication => 0x9A,
            Self::Signature => 0x9C,
            Self::KeyManagement => 0x9D,
            Self::CardAuthentication => 0x9E,
        }
    }

    /// Tag of the data object holding the slot's certificate.
    fn object_tag(self) -> [u8; 3] {
        match self {
            Self::Authentication => [0x5F, 0xC1, 0x05],
            Self::Signature => [0x5F, 0xC1, 0x0A],
            Self::KeyManagement => [0x5F, 0xC1, 0x0B],
            Self::CardAuthentication => [0x5F, 0xC1, 0x01],
        }
    }
}

/// Sends raw command APDUs to a card.
pub trait ApduTransport {
    /// Transmit `apdu` and return the raw response including the status
    /// word.
    ///
    /// # Errors
    ///
    /// Returns an error if the card cannot be reached.
    fn transmit(&mut self, apdu: &[u8]) -> Result<Vec<u8>>;
}

/// APDU response split into data and status word.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApduResponse {
    pub data: Vec<u8>,
    pub sw1: u8,
    pub sw2: u8,
}

impl ApduResponse {
    fn parse(raw: &[u8]) -> Result<Self> {
        if raw.len() < 2 {
            return Err(HardwareError::invalid_data("response shorter than status word"));
        }
        let (data, sw) = raw.split_at(raw.len() - 2);
        Ok(Self {
            data: data.to_vec(),
            sw1: sw[0],
            sw2: sw[1],
        })
    }

    pub fn is_success(&self) -> bool {
        self.sw1 == 0x90 && self.sw2 == 0x00
    }

    pub fn status_word(&self) -> u16 {
        u16::from_be_bytes([self.sw1, self.sw2])
    }
}

/// PIV applet on a card reachable through `T`.
pub struct PivApplet<'a, T: ApduTransport> {
    transport: &'a mut T,
}

impl<'a, T: ApduTransport> PivApplet<'a, T> {
    /// Select the PIV applet.
    ///
    /// # Errors
    ///
    /// Returns an error if the card has no PIV applet.
    pub fn select(transport: &'a mut T) -> Result<Self> {
        let mut apdu = vec![0x00, 0xA4, 0x04, 0x00, PIV_AID.len() as u8];
        apdu.extend_from_slice(&PIV_AID);
        apdu.push(0x00);

        let mut applet = Self { transport };
        let response = applet.exchange(&apdu)?;
        if !response.is_success() {
            return Err(HardwareError::card_session(format!(
                "PIV applet not selectable (SW {:04X})",
                response.status_word()
            )));
        }
        Ok(applet)
    }

    /// Read the DER certificate stored for `slot`. Returns `None` if the
    /// slot is empty.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure or a malformed object.
    pub fn read_certificate(&mut self, slot: PivSlot) -> Result<Option<Vec<u8>>> {
        let tag = slot.object_tag();
        let apdu = [
            0x00, 0xCB, 0x3F, 0xFF, 0x05, 0x5C, 0x03, tag[0], tag[1], tag[2], 0x00,
        ];

        let response = self.exchange(&apdu)?;
        match response.status_word() {
            0x9000 => {}
            0x6A82 => return Ok(None),
            sw => {
                return Err(HardwareError::card_session(format!(
                    "GET DATA for slot {:02X} failed (SW {sw:04X})",
                    slot.id()
                )));
            }
        }

        let (tag, object) = read_tlv(&response.data)?;
        if tag != 0x53 {
            return Err(HardwareError::invalid_data(format!(
                "unexpected data object tag {tag:02X}"
            )));
        }

        let mut certificate = None;
        let mut compressed = false;
        let mut rest = object;
        while !rest.is_empty() {
            let (tag, value) = read_tlv(rest)?;
            match tag {
                0x70 => certificate = Some(value.to_vec()),
                0x71 => compressed = value.first().is_some_and(|info| info & 0x01 != 0),
                _ => {}
            }
            rest = &rest[tlv_len(rest)?..];
        }

        if compressed {
            return Err(HardwareError::invalid_data(format!(
                "compressed certificate in slot {:02X} is not supported",
                slot.id()
            )));
        }
        Ok(certificate.filter(|der| !der.is_empty()))
    }

    /// Verify the PIV application PIN.
    ///
    /// # Errors
    ///
    /// Returns an error if the PIN is too long, rejected, or blocked.
    pub fn verify(&mut self, pin: &str) -> Result<()> {
        let pin = pin.as_bytes();
        if pin.is_empty() || pin.len() > 8 {
            return Err(HardwareError::invalid_data("PIV PIN must be 1 to 8 bytes"));
        }

        let mut apdu = vec![0x00, 0x20, 0x00, 0x80, 0x08];
        apdu.extend_from_slice(pin);
        apdu.resize(13, 0xFF);

        let response = self.exchange(&apdu)?;
        match response.status_word() {
            0x9000 => Ok(()),
            0x6983 => Err(HardwareError::card_session("PIN blocked")),
            sw if sw & 0xFFF0 == 0x63C0 => Err(HardwareError::card_session(format!(
                "PIN rejected, {} retries left",
                sw & 0x000F
            ))),
            sw => Err(HardwareError::card_session(format!(
                "VERIFY failed (SW {sw:04X})"
            ))),
        }
    }

    /// Transmit `apdu`, following `61xx` response chaining.
    fn exchange(&mut self, apdu: &[u8]) -> Result<ApduResponse> {
        let mut response = ApduResponse::parse(&self.transport.transmit(apdu)?)?;
        let mut data = std::mem::take(&mut response.data);

        while response.sw1 == 0x61 {
            let get_response = [0x00, 0xC0, 0x00, 0x00, response.sw2];
            response = ApduResponse::parse(&self.transport.transmit(&get_response)?)?;
            data.append(&mut response.data);
        }

        response.data = data;
        Ok(response)
    }
}

/// Parse one BER-TLV with a single-byte tag. Returns the tag and value.
fn read_tlv(input: &[u8]) -> Result<(u8, &[u8])> {
    let (header, length) = tlv_header(input)?;
    let tag = input[0];
    input
        .get(header..header + length)
        .map(|value| (tag, value))
        .ok_or_else(|| HardwareError::invalid_data("TLV value truncated"))
}

/// Total encoded length of the first TLV in `input`.
fn tlv_len(input: &[u8]) -> Result<usize> {
    let (header, length) = tlv_header(input)?;
    Ok(header + length)
}

fn tlv_header(input: &[u8]) -> Result<(usize, usize)> {
    let truncated = || HardwareError::invalid_data("TLV header truncated");
    let first = *input.get(1).ok_or_else(truncated)?;

    match first {
        0x00..=0x7F => Ok((2, first as usize)),
        0x81 => Ok((3, *input.get(2).ok_or_else(truncated)? as usize)),
        0x82 => {
            let hi = *input.get(2).ok_or_else(truncated)? as usize;
            let lo = *input.get(3).ok_or_else(truncated)? as usize;
            Ok((4, (hi << 8) | lo))
        }
        other => Err(HardwareError::invalid_data(format!(
            "unsupported TLV length form {other:02X}"
        ))),
    }
}
