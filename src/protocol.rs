//! Boot-ROM ISP frame codec.
//!
//! Request: `[cmd, checksum, len_lo, len_hi, payload...]` where the checksum is
//! the wrapping byte sum of the length field and payload.
//!
//! Response: `OK` on success, optionally followed by a little-endian `u16`
//! length and that many payload bytes, or `FL` followed by a little-endian
//! `u16` error code.

use thiserror::Error;

use crate::chip;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    GetBootInfo = 0x10,
    Reset = 0x21,
    FlashErase = 0x30,
    FlashWrite = 0x31,
    FlashReadJedecId = 0x36,
    FlashWriteCheck = 0x3A,
    FlashChipErase = 0x3C,
    FlashReadSha = 0x3D,
    FlashXipReadSha = 0x3E,
    XipReadStart = 0x60,
    XipReadFinish = 0x61,
}

impl Command {
    pub fn id(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            Command::GetBootInfo => "get_boot_info",
            Command::Reset => "reset",
            Command::FlashErase => "flash_erase",
            Command::FlashWrite => "flash_write",
            Command::FlashReadJedecId => "flash_read_jid",
            Command::FlashWriteCheck => "flash_write_check",
            Command::FlashChipErase => "flash_chiperase",
            Command::FlashReadSha => "flash_readSha",
            Command::FlashXipReadSha => "flash_xip_readSha",
            Command::XipReadStart => "xip_read_start",
            Command::XipReadFinish => "xip_read_finish",
        }
    }
}

/// Largest request payload: a flash write carries a 4-byte address plus data.
pub const MAX_REQUEST_PAYLOAD: usize = chip::MAX_WRITE_CHUNK + 4;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("request payload too large: {len} > {max}")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("unexpected response status {0:02X?}")]
    BadStatus([u8; 2]),

    #[error("response length {len} exceeds receive buffer ({max} bytes)")]
    ResponseTooLong { len: usize, max: usize },
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Status {
    Ack,
    Nak,
}

pub fn checksum(len_and_payload: &[u8]) -> u8 {
    len_and_payload
        .iter()
        .fold(0u8, |acc, b| acc.wrapping_add(*b))
}

pub fn encode_frame(cmd: Command, payload: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    if payload.len() > MAX_REQUEST_PAYLOAD {
        return Err(ProtocolError::PayloadTooLarge {
            len: payload.len(),
            max: MAX_REQUEST_PAYLOAD,
        });
    }

    let len = (payload.len() as u16).to_le_bytes();
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.push(cmd.id());
    frame.push(0);
    frame.extend_from_slice(&len);
    frame.extend_from_slice(payload);
    frame[1] = checksum(&frame[2..]);
    Ok(frame)
}

pub fn parse_status(bytes: [u8; 2]) -> Result<Status, ProtocolError> {
    if bytes == chip::ACK {
        Ok(Status::Ack)
    } else if bytes == chip::NAK {
        Ok(Status::Nak)
    } else {
        Err(ProtocolError::BadStatus(bytes))
    }
}

pub fn parse_length(bytes: [u8; 2]) -> Result<usize, ProtocolError> {
    let len = u16::from_le_bytes(bytes) as usize;
    if len > chip::MAX_RESPONSE_PAYLOAD {
        return Err(ProtocolError::ResponseTooLong {
            len,
            max: chip::MAX_RESPONSE_PAYLOAD,
        });
    }
    Ok(len)
}

pub fn parse_error_code(bytes: [u8; 2]) -> u16 {
    u16::from_le_bytes(bytes)
}

pub fn addr_len_payload(addr: u32, len: u32) -> [u8; 8] {
    let mut out = [0u8; 8];
    out[..4].copy_from_slice(&addr.to_le_bytes());
    out[4..].copy_from_slice(&len.to_le_bytes());
    out
}

pub fn write_payload(addr: u32, data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + data.len());
    out.extend_from_slice(&addr.to_le_bytes());
    out.extend_from_slice(data);
    out
}
