use std::time::Duration;

pub const HANDSHAKE_BYTE: u8 = 0x55;
pub const HANDSHAKE_LEN: usize = 32;
pub const HANDSHAKE_RETRY: u32 = 2;
pub const HANDSHAKE_RETRY_DELAY: Duration = Duration::from_millis(2200);

pub const ACK: [u8; 2] = *b"OK";
pub const NAK: [u8; 2] = *b"FL";

pub const RX_BUFFER_SIZE: usize = 36;
pub const MAX_RESPONSE_PAYLOAD: usize = RX_BUFFER_SIZE - 4; // 32

pub const MAX_WRITE_CHUNK: usize = 2048;
pub const SHA256_LEN: usize = 32;

pub const DEFAULT_BAUD: u32 = 115_200;
pub const FLASH_SECTOR_SIZE: u32 = 4096;
pub const DEFAULT_FLASH_SIZE: u32 = 4 * 1024 * 1024;

// Common USB-UART bridges found on Bouffalo Lab dev boards.
pub const VID_WCH: u16 = 0x1A86;
pub const VID_SILABS: u16 = 0x10C4;
pub const VID_FTDI: u16 = 0x0403;
pub const VID_BOUFFALO: u16 = 0xFFFF;

/// Bus address of flash when mapped for execute-in-place.
pub const FLASH_XIP_BASE: u32 = 0x2300_0000;
