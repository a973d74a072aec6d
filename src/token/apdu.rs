//! ISO 7816-4 command and response APDUs used by the eID card.
use super::{Result, TokenError};
use zeroize::Zeroizing;

/// Instruction codes.
mod ins {
    pub const SELECT: u8 = 0xA4;
    pub const READ_BINARY: u8 = 0xB0;
    pub const MSE: u8 = 0x22;
    pub const VERIFY: u8 = 0x20;
    pub const CHANGE_REFERENCE_DATA: u8 = 0x24;
    pub const RESET_RETRY_COUNTER: u8 = 0x2C;
    pub const PSO: u8 = 0x2A;
    pub const GET_RESPONSE: u8 = 0xC0;
    pub const LOGOFF: u8 = 0xE6;
}

/// Private key references for `MSE SET`.
pub mod key {
    pub const AUTHENTICATION: u8 = 0x82;
    pub const NON_REPUDIATION: u8 = 0x83;
}

/// Largest block the card returns for one `READ BINARY`.
pub const BLOCK_SIZE: u8 = 0xF8;

/// Reference of the cardholder PIN.
const PIN_REFERENCE: u8 = 0x01;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    header: [u8; 4],
    data: Vec<u8>,
    le: Option<u8>,
}

impl Command {
    pub fn new(cla: u8, ins: u8, p1: u8, p2: u8) -> Command {
        Command {
            header: [cla, ins, p1, p2],
            data: vec![],
            le: None,
        }
    }

    pub fn with_data(mut self, data: &[u8]) -> Command {
        self.data = data.to_vec();
        self
    }

    pub fn with_le(mut self, le: u8) -> Command {
        self.le = Some(le);
        self
    }

    pub fn ins(&self) -> u8 {
        self.header[1]
    }

    /// Short APDU encoding. The returned buffer is wiped on drop since it may carry a PIN.
    pub fn to_bytes(&self) -> Zeroizing<Vec<u8>> {
        let mut bytes = Zeroizing::new(Vec::with_capacity(6 + self.data.len()));
        bytes.extend_from_slice(&self.header);
        if !self.data.is_empty() {
            bytes.push(self.data.len() as u8);
            bytes.extend_from_slice(&self.data);
        }
        if let Some(le) = self.le {
            bytes.push(le);
        }
        bytes
    }
}

impl Drop for Command {
    fn drop(&mut self) {
        zeroize::Zeroize::zeroize(&mut self.data);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusWord(pub u16);

impl StatusWord {
    pub const SUCCESS: StatusWord = StatusWord(0x9000);
    pub const END_OF_FILE: StatusWord = StatusWord(0x6B00);
    pub const SECURITY_STATUS_NOT_SATISFIED: StatusWord = StatusWord(0x6982);
    pub const AUTHENTICATION_BLOCKED: StatusWord = StatusWord(0x6983);

    pub fn sw1(&self) -> u8 {
        (self.0 >> 8) as u8
    }

    pub fn sw2(&self) -> u8 {
        self.0 as u8
    }

    pub fn is_success(&self) -> bool {
        *self == Self::SUCCESS
    }

    /// Map an error status to the stable token errors.
    pub fn check(&self, context: &str) -> Result<()> {
        match (self.sw1(), self.sw2()) {
            (0x90, 0x00) => Ok(()),
            (0x63, sw2) if sw2 & 0xF0 == 0xC0 => Err(TokenError::PinIncorrect {
                retries_left: Some(sw2 & 0x0F),
            }),
            (0x69, 0x83) => Err(TokenError::PinBlocked),
            _ => Err(TokenError::Device(format!("{context} failed: SW={:04X}", self.0))),
        }
    }
}

impl std::fmt::Display for StatusWord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:04X}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub data: Vec<u8>,
    pub sw: StatusWord,
}

impl Response {
    pub fn parse(raw: &[u8]) -> Result<Response> {
        if raw.len() < 2 {
            return Err(TokenError::Device("response too short".to_string()));
        }
        let (data, sw) = raw.split_at(raw.len() - 2);
        Ok(Response {
            data: data.to_vec(),
            sw: StatusWord(u16::from_be_bytes([sw[0], sw[1]])),
        })
    }
}

/// ISO 9564 format-2 PIN block: `2L` followed by BCD digits padded with `F`.
pub fn pin_block(pin: &str) -> Result<Zeroizing<[u8; 8]>> {
    if !(4..=12).contains(&pin.len()) || !pin.bytes().all(|b| b.is_ascii_digit()) {
        return Err(TokenError::Device(
            "PIN must be 4 to 12 decimal digits".to_string(),
        ));
    }
    let mut block = Zeroizing::new([0xFFu8; 8]);
    block[0] = 0x20 | pin.len() as u8;
    for (i, digit) in pin.bytes().map(|b| b - b'0').enumerate() {
        let byte = &mut block[1 + i / 2];
        if i % 2 == 0 {
            *byte = (digit << 4) | 0x0F;
        } else {
            *byte = (*byte & 0xF0) | digit;
        }
    }
    Ok(block)
}

pub fn select_file(path: &[u8]) -> Command {
    Command::new(0x00, ins::SELECT, 0x08, 0x0C).with_data(path)
}

pub fn read_binary(offset: usize, len: u8) -> Command {
    Command::new(0x00, ins::READ_BINARY, (offset >> 8) as u8, offset as u8).with_le(len)
}

pub fn mse_set(key_reference: u8) -> Command {
    // algorithm 0x01: RSA PKCS#1 over a caller supplied DigestInfo
    Command::new(0x00, ins::MSE, 0x41, 0xB6).with_data(&[0x04, 0x80, 0x01, 0x84, key_reference])
}

pub fn verify_pin(block: &[u8; 8]) -> Command {
    Command::new(0x00, ins::VERIFY, 0x00, PIN_REFERENCE).with_data(block)
}

pub fn change_pin(old: &[u8; 8], new: &[u8; 8]) -> Command {
    let mut data = Zeroizing::new([0u8; 16]);
    data[..8].copy_from_slice(old);
    data[8..].copy_from_slice(new);
    Command::new(0x00, ins::CHANGE_REFERENCE_DATA, 0x00, PIN_REFERENCE).with_data(&data[..])
}

pub fn unblock_pin(puk: &[u8; 8]) -> Command {
    Command::new(0x00, ins::RESET_RETRY_COUNTER, 0x00, PIN_REFERENCE).with_data(puk)
}

pub fn compute_signature(digest_info: &[u8]) -> Command {
    Command::new(0x00, ins::PSO, 0x9E, 0x9A).with_data(digest_info)
}

pub fn get_response(len: u8) -> Command {
    Command::new(0x00, ins::GET_RESPONSE, 0x00, 0x00).with_le(len)
}

pub fn logoff() -> Command {
    Command::new(0x80, ins::LOGOFF, 0x00, 0x00)
}
