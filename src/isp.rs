use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::chip;
use crate::protocol::{self, Command, ProtocolError, Status};
use crate::transport::{Transport, TransportError};

#[derive(Debug, Clone, Copy)]
pub struct IspTimeouts {
    /// Wait for the `OK` answering a handshake burst.
    pub handshake: Duration,
    /// Default wait for a command response.
    pub response: Duration,
    /// Sector/range and chip erase.
    pub erase: Duration,
    /// Digest computation on the target.
    pub sha: Duration,
}

impl Default for IspTimeouts {
    fn default() -> Self {
        Self {
            handshake: Duration::from_millis(200),
            response: Duration::from_millis(2000),
            erase: Duration::from_secs(60),
            sha: Duration::from_secs(10),
        }
    }
}

#[derive(Error, Debug)]
pub enum IspError {
    #[error("{cmd}: {source}")]
    Transport {
        cmd: &'static str,
        #[source]
        source: TransportError,
    },

    #[error("{cmd}: no response within {timeout_ms}ms")]
    Timeout { cmd: &'static str, timeout_ms: u64 },

    #[error("{cmd}: {source}")]
    Protocol {
        cmd: &'static str,
        #[source]
        source: ProtocolError,
    },

    #[error("{cmd}: boot ROM returned error 0x{code:04X}")]
    Nak { cmd: &'static str, code: u16 },

    #[error("handshake failed after {attempts} attempts")]
    HandshakeFailed { attempts: u32 },

    #[error("{cmd}: expected at least {expected} payload bytes, got {got}")]
    ShortPayload {
        cmd: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("erase range start 0x{start:08X} is past its end 0x{end:08X}")]
    InvalidRange { start: u32, end: u32 },

    #[error("write chunk too large: {len} > {max}")]
    ChunkTooLarge { len: usize, max: usize },
}

impl IspError {
    fn from_transport(cmd: &'static str, e: TransportError) -> Self {
        match e {
            TransportError::Timeout { timeout_ms, .. } => IspError::Timeout { cmd, timeout_ms },
            other => IspError::Transport { cmd, source: other },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BootInfo {
    pub bootrom_version: u32,
    /// Raw chip info bytes (OTP/eFuse summary), hex encoded.
    pub chip_info: String,
}

impl BootInfo {
    pub fn parse(payload: &[u8]) -> Result<Self, IspError> {
        if payload.len() < 4 {
            return Err(IspError::ShortPayload {
                cmd: Command::GetBootInfo.name(),
                expected: 4,
                got: payload.len(),
            });
        }
        Ok(Self {
            bootrom_version: u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]),
            chip_info: hex::encode(&payload[4..]),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct JedecId {
    pub manufacturer: u8,
    pub memory_type: u8,
    pub capacity: u8,
}

impl JedecId {
    /// Flash size implied by the capacity byte (2^capacity bytes).
    pub fn flash_size(&self) -> Option<u32> {
        if (10..32).contains(&self.capacity) {
            Some(1u32 << self.capacity)
        } else {
            None
        }
    }
}

pub type Digest = [u8; chip::SHA256_LEN];

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Reply {
    Ack,
    Payload,
}

pub struct IspClient<T: Transport> {
    transport: T,
    timeouts: IspTimeouts,
}

impl<T: Transport> IspClient<T> {
    pub fn new(transport: T, timeouts: IspTimeouts) -> Self {
        Self {
            transport,
            timeouts,
        }
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn into_inner(self) -> T {
        self.transport
    }

    /// Sync with the boot ROM. `on_attempt(attempt, attempts)` fires before
    /// each burst.
    pub fn handshake<F>(
        &mut self,
        attempts: u32,
        delay: Duration,
        mut on_attempt: F,
    ) -> Result<u32, IspError>
    where
        F: FnMut(u32, u32),
    {
        let attempts = attempts.max(1);
        let burst = [chip::HANDSHAKE_BYTE; chip::HANDSHAKE_LEN];

        for attempt in 1..=attempts {
            on_attempt(attempt, attempts);
            match self.handshake_once(&burst) {
                Ok(()) => {
                    tracing::info!(attempt, "handshake ok");
                    return Ok(attempt);
                }
                Err(e) => {
                    tracing::debug!(attempt, error = %e, "handshake attempt failed");
                }
            }
            if attempt < attempts {
                std::thread::sleep(delay);
            }
        }

        Err(IspError::HandshakeFailed { attempts })
    }

    fn handshake_once(&mut self, burst: &[u8]) -> Result<(), IspError> {
        const CMD: &str = "handshake";
        self.transport
            .clear_input()
            .map_err(|e| IspError::from_transport(CMD, e))?;
        self.transport
            .write_all(burst)
            .map_err(|e| IspError::from_transport(CMD, e))?;

        let mut status = [0u8; 2];
        self.transport
            .read_exact_timeout(&mut status, self.timeouts.handshake)
            .map_err(|e| IspError::from_transport(CMD, e))?;
        match protocol::parse_status(status) {
            Ok(Status::Ack) => Ok(()),
            Ok(Status::Nak) => Err(IspError::Nak { cmd: CMD, code: 0 }),
            Err(e) => Err(IspError::Protocol {
                cmd: CMD,
                source: e,
            }),
        }
    }

    fn command(
        &mut self,
        cmd: Command,
        payload: &[u8],
        reply: Reply,
        timeout: Duration,
    ) -> Result<Vec<u8>, IspError> {
        let name = cmd.name();
        let frame = protocol::encode_frame(cmd, payload).map_err(|e| IspError::Protocol {
            cmd: name,
            source: e,
        })?;

        tracing::debug!(cmd = name, len = payload.len(), "send");
        self.transport
            .clear_input()
            .map_err(|e| IspError::from_transport(name, e))?;
        self.transport
            .write_all(&frame)
            .map_err(|e| IspError::from_transport(name, e))?;

        let mut head = [0u8; 2];
        self.transport
            .read_exact_timeout(&mut head, timeout)
            .map_err(|e| IspError::from_transport(name, e))?;

        let status = protocol::parse_status(head).map_err(|e| IspError::Protocol {
            cmd: name,
            source: e,
        })?;

        if status == Status::Nak {
            let mut code = [0u8; 2];
            self.transport
                .read_exact_timeout(&mut code, self.timeouts.response)
                .map_err(|e| IspError::from_transport(name, e))?;
            let code = protocol::parse_error_code(code);
            tracing::debug!(cmd = name, code, "nak");
            return Err(IspError::Nak { cmd: name, code });
        }

        if reply == Reply::Ack {
            return Ok(Vec::new());
        }

        self.transport
            .read_exact_timeout(&mut head, self.timeouts.response)
            .map_err(|e| IspError::from_transport(name, e))?;
        let len = protocol::parse_length(head).map_err(|e| IspError::Protocol {
            cmd: name,
            source: e,
        })?;

        let mut data = vec![0u8; len];
        self.transport
            .read_exact_timeout(&mut data, self.timeouts.response)
            .map_err(|e| IspError::from_transport(name, e))?;
        Ok(data)
    }

    pub fn boot_info(&mut self) -> Result<BootInfo, IspError> {
        let data = self.command(
            Command::GetBootInfo,
            &[],
            Reply::Payload,
            self.timeouts.response,
        )?;
        BootInfo::parse(&data)
    }

    pub fn jedec_id(&mut self) -> Result<JedecId, IspError> {
        let cmd = Command::FlashReadJedecId;
        let data = self.command(cmd, &[], Reply::Payload, self.timeouts.response)?;
        if data.len() < 3 {
            return Err(IspError::ShortPayload {
                cmd: cmd.name(),
                expected: 3,
                got: data.len(),
            });
        }
        Ok(JedecId {
            manufacturer: data[0],
            memory_type: data[1],
            capacity: data[2],
        })
    }

    /// Erase `[start, end]` (end inclusive).
    pub fn erase(&mut self, start: u32, end: u32) -> Result<(), IspError> {
        if start > end {
            return Err(IspError::InvalidRange { start, end });
        }
        let payload = protocol::addr_len_payload(start, end);
        self.command(Command::FlashErase, &payload, Reply::Ack, self.timeouts.erase)?;
        Ok(())
    }

    pub fn chip_erase(&mut self) -> Result<(), IspError> {
        self.command(Command::FlashChipErase, &[], Reply::Ack, self.timeouts.erase)?;
        Ok(())
    }

    pub fn write(&mut self, addr: u32, data: &[u8]) -> Result<(), IspError> {
        if data.len() > chip::MAX_WRITE_CHUNK {
            return Err(IspError::ChunkTooLarge {
                len: data.len(),
                max: chip::MAX_WRITE_CHUNK,
            });
        }
        let payload = protocol::write_payload(addr, data);
        self.command(
            Command::FlashWrite,
            &payload,
            Reply::Ack,
            self.timeouts.response,
        )?;
        Ok(())
    }

    pub fn write_check(&mut self) -> Result<(), IspError> {
        self.command(
            Command::FlashWriteCheck,
            &[],
            Reply::Ack,
            self.timeouts.response,
        )?;
        Ok(())
    }

    pub fn read_sha(&mut self, addr: u32, len: u32) -> Result<Digest, IspError> {
        self.sha_command(Command::FlashReadSha, addr, len)
    }

    /// SHA-256 computed by the target while reading flash in XIP mode.
    pub fn xip_read_sha(&mut self, addr: u32, len: u32) -> Result<Digest, IspError> {
        self.command(
            Command::XipReadStart,
            &[],
            Reply::Ack,
            self.timeouts.response,
        )?;
        let digest = self.sha_command(Command::FlashXipReadSha, addr, len);
        let finish = self.command(
            Command::XipReadFinish,
            &[],
            Reply::Ack,
            self.timeouts.response,
        );
        let digest = digest?;
        finish?;
        Ok(digest)
    }

    fn sha_command(&mut self, cmd: Command, addr: u32, len: u32) -> Result<Digest, IspError> {
        let payload = protocol::addr_len_payload(addr, len);
        let data = self.command(cmd, &payload, Reply::Payload, self.timeouts.sha)?;
        let digest: Digest = data
            .as_slice()
            .try_into()
            .map_err(|_| IspError::ShortPayload {
                cmd: cmd.name(),
                expected: chip::SHA256_LEN,
                got: data.len(),
            })?;
        Ok(digest)
    }

    /// Ask the boot ROM to reset. The target may drop off the line before
    /// acknowledging, so a missing reply is not an error.
    pub fn reset(&mut self) -> Result<(), IspError> {
        match self.command(Command::Reset, &[], Reply::Ack, self.timeouts.response) {
            Ok(_) | Err(IspError::Timeout { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use sha2::{Digest as _, Sha256};

    use super::*;
    use crate::testing::{fake_rom, FakeRomState, FAKE_BOOT_INFO};
    use crate::transport::mock::MockTransport;

    fn client(state: FakeRomState) -> (
        IspClient<MockTransport>,
        std::rc::Rc<std::cell::RefCell<FakeRomState>>,
    ) {
        let (t, st) = fake_rom(state);
        (IspClient::new(t, IspTimeouts::default()), st)
    }

    #[test]
    fn handshake_sends_sync_burst() {
        let (mut c, st) = client(FakeRomState::default());
        let attempt = c.handshake(2, Duration::ZERO, |_, _| {}).unwrap();
        assert_eq!(attempt, 1);
        assert_eq!(st.borrow().handshakes, 1);

        let w = &c.transport_mut().writes[0];
        assert_eq!(w.len(), chip::HANDSHAKE_LEN);
        assert!(w.iter().all(|b| *b == 0x55));
    }

    #[test]
    fn handshake_retries_then_succeeds() {
        let (mut c, _st) = client(FakeRomState {
            fail_handshakes: 1,
            ..Default::default()
        });
        let mut seen = Vec::new();
        let attempt = c
            .handshake(2, Duration::ZERO, |a, n| seen.push((a, n)))
            .unwrap();
        assert_eq!(attempt, 2);
        assert_eq!(seen, vec![(1, 2), (2, 2)]);
    }

    #[test]
    fn handshake_gives_up_after_attempts() {
        let (mut c, st) = client(FakeRomState {
            fail_handshakes: 5,
            ..Default::default()
        });
        let err = c.handshake(2, Duration::ZERO, |_, _| {}).unwrap_err();
        assert!(matches!(err, IspError::HandshakeFailed { attempts: 2 }));
        assert_eq!(st.borrow().handshakes, 2);
    }

    #[test]
    fn boot_info_strips_length_field() {
        let (mut c, _st) = client(FakeRomState::default());
        let info = c.boot_info().unwrap();
        assert_eq!(info.bootrom_version, 1);
        assert_eq!(info.chip_info, hex::encode(&FAKE_BOOT_INFO[4..]));
    }

    #[test]
    fn write_then_read_sha_matches_local_digest() {
        let (mut c, _st) = client(FakeRomState::default());
        let data: Vec<u8> = (0..300u32).map(|i| i as u8).collect();
        c.erase(0x1000, 0x1FFF).unwrap();
        c.write(0x1000, &data).unwrap();

        let local: [u8; 32] = Sha256::digest(&data).into();
        assert_eq!(c.read_sha(0x1000, data.len() as u32).unwrap(), local);
        assert_eq!(c.xip_read_sha(0x1000, data.len() as u32).unwrap(), local);
    }

    #[test]
    fn xip_sha_brackets_with_start_and_finish() {
        let (mut c, st) = client(FakeRomState::default());
        c.xip_read_sha(0, 16).unwrap();
        assert_eq!(st.borrow().commands, vec![0x60, 0x3E, 0x61]);
    }

    #[test]
    fn nak_carries_error_code() {
        let (mut c, _st) = client(FakeRomState {
            fail_writes: 1,
            ..Default::default()
        });
        let err = c.write(0, &[1, 2, 3]).unwrap_err();
        assert!(matches!(
            err,
            IspError::Nak {
                cmd: "flash_write",
                code: 0x0101
            }
        ));
    }

    #[test]
    fn erase_rejects_inverted_range() {
        let (mut c, st) = client(FakeRomState::default());
        assert!(matches!(
            c.erase(0x2000, 0x1000).unwrap_err(),
            IspError::InvalidRange {
                start: 0x2000,
                end: 0x1000
            }
        ));
        assert!(st.borrow().commands.is_empty());
    }

    #[test]
    fn handshake_sleeps_only_between_attempts() {
        let delay = Duration::from_millis(60);

        let (mut c, _st) = client(FakeRomState {
            fail_handshakes: 1,
            ..Default::default()
        });
        let started = std::time::Instant::now();
        assert_eq!(c.handshake(3, delay, |_, _| {}).unwrap(), 2);
        let elapsed = started.elapsed();
        assert!(elapsed >= delay, "{elapsed:?}");
        assert!(elapsed < delay * 2, "{elapsed:?}");

        let (mut c, _st) = client(FakeRomState {
            fail_handshakes: 10,
            ..Default::default()
        });
        let started = std::time::Instant::now();
        assert!(c.handshake(3, delay, |_, _| {}).is_err());
        let elapsed = started.elapsed();
        assert!(elapsed >= delay * 2, "{elapsed:?}");
        assert!(elapsed < delay * 3, "{elapsed:?}");
    }

    #[test]
    fn write_rejects_oversized_chunk() {
        let (mut c, st) = client(FakeRomState::default());
        let data = vec![0u8; chip::MAX_WRITE_CHUNK + 1];
        assert!(matches!(
            c.write(0, &data).unwrap_err(),
            IspError::ChunkTooLarge { .. }
        ));
        assert!(st.borrow().commands.is_empty());
    }

    #[test]
    fn garbage_status_is_protocol_error() {
        let t = MockTransport::new(|_| vec![0x00, 0x11]);
        let mut c = IspClient::new(t, IspTimeouts::default());
        let err = c.write_check().unwrap_err();
        assert!(matches!(
            err,
            IspError::Protocol {
                source: ProtocolError::BadStatus([0x00, 0x11]),
                ..
            }
        ));
    }

    #[test]
    fn silent_target_times_out() {
        let t = MockTransport::new(|_| Vec::new());
        let mut c = IspClient::new(t, IspTimeouts::default());
        assert!(matches!(
            c.jedec_id().unwrap_err(),
            IspError::Timeout { .. }
        ));
        // Reset tolerates a target that is already gone.
        assert!(c.reset().is_ok());
    }

    #[test]
    fn oversized_length_field_is_rejected() {
        let t = MockTransport::new(|_| vec![b'O', b'K', 40, 0]);
        let mut c = IspClient::new(t, IspTimeouts::default());
        assert!(matches!(
            c.boot_info().unwrap_err(),
            IspError::Protocol {
                source: ProtocolError::ResponseTooLong { len: 40, .. },
                ..
            }
        ));
    }

    #[test]
    fn jedec_flash_size() {
        let id = JedecId {
            manufacturer: 0xEF,
            memory_type: 0x40,
            capacity: 0x16,
        };
        assert_eq!(id.flash_size(), Some(4 * 1024 * 1024));
    }
}
