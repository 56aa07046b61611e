//! In-memory boot ROM used by unit tests.

use std::cell::RefCell;
use std::rc::Rc;

use sha2::{Digest, Sha256};

use crate::chip;
use crate::protocol::{self, Command};
use crate::transport::mock::MockTransport;

pub const FAKE_FLASH_SIZE: usize = 64 * 1024;
pub const FAKE_BOOT_INFO: [u8; 24] = [
    0x01, 0x00, 0x00, 0x00, // boot ROM version
    0x00, 0x00, 0x00, 0x00, 0x0F, 0x00, 0x00, 0x00, // chip info
    0x2A, 0xB1, 0x3C, 0x00, 0x0F, 0x00, 0x00, 0x00, 0xAA, 0xBB, 0xCC, 0xDD,
];
pub const FAKE_JEDEC: [u8; 4] = [0xEF, 0x40, 0x16, 0x00];

pub struct FakeRomState {
    pub flash: Vec<u8>,
    pub fail_handshakes: u32,
    pub fail_writes: u32,
    pub fail_write_check: bool,
    pub fail_erase: bool,
    pub corrupt_digest: bool,
    pub handshakes: u32,
    pub erases: Vec<(u32, u32)>,
    pub chip_erases: u32,
    pub writes: Vec<(u32, usize)>,
    pub commands: Vec<u8>,
    pub resets: u32,
}

impl Default for FakeRomState {
    fn default() -> Self {
        Self {
            flash: vec![0xA5; FAKE_FLASH_SIZE],
            fail_handshakes: 0,
            fail_writes: 0,
            fail_write_check: false,
            fail_erase: false,
            corrupt_digest: false,
            handshakes: 0,
            erases: Vec::new(),
            chip_erases: 0,
            writes: Vec::new(),
            commands: Vec::new(),
            resets: 0,
        }
    }
}

pub fn fake_rom(state: FakeRomState) -> (MockTransport, Rc<RefCell<FakeRomState>>) {
    let state = Rc::new(RefCell::new(state));
    let shared = Rc::clone(&state);
    let transport = MockTransport::new(move |bytes| respond(&mut shared.borrow_mut(), bytes));
    (transport, state)
}

fn ok() -> Vec<u8> {
    chip::ACK.to_vec()
}

fn ok_with(payload: &[u8]) -> Vec<u8> {
    let mut out = chip::ACK.to_vec();
    out.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    out.extend_from_slice(payload);
    out
}

fn fail(code: u16) -> Vec<u8> {
    let mut out = chip::NAK.to_vec();
    out.extend_from_slice(&code.to_le_bytes());
    out
}

fn le32(b: &[u8]) -> u32 {
    u32::from_le_bytes([b[0], b[1], b[2], b[3]])
}

fn respond(st: &mut FakeRomState, bytes: &[u8]) -> Vec<u8> {
    if !bytes.is_empty() && bytes.iter().all(|b| *b == chip::HANDSHAKE_BYTE) {
        st.handshakes += 1;
        if st.fail_handshakes > 0 {
            st.fail_handshakes -= 1;
            return Vec::new();
        }
        return ok();
    }

    if bytes.len() < 4 {
        return fail(0x0001);
    }
    let len = u16::from_le_bytes([bytes[2], bytes[3]]) as usize;
    let payload = &bytes[4..];
    if payload.len() != len || protocol::checksum(&bytes[2..]) != bytes[1] {
        return fail(0x0004);
    }
    st.commands.push(bytes[0]);

    let sha = |st: &FakeRomState, payload: &[u8]| {
        let addr = le32(&payload[0..4]) as usize;
        let n = le32(&payload[4..8]) as usize;
        let mut digest: Vec<u8> = Sha256::digest(&st.flash[addr..addr + n]).to_vec();
        if st.corrupt_digest {
            digest[0] ^= 0xFF;
        }
        ok_with(&digest)
    };

    match bytes[0] {
        b if b == Command::GetBootInfo.id() => ok_with(&FAKE_BOOT_INFO),
        b if b == Command::FlashReadJedecId.id() => ok_with(&FAKE_JEDEC),
        b if st.fail_erase
            && (b == Command::FlashErase.id() || b == Command::FlashChipErase.id()) =>
        {
            fail(0x0201)
        }
        b if b == Command::FlashWriteCheck.id() && st.fail_write_check => fail(0x0103),
        b if b == Command::FlashErase.id() => {
            let start = le32(&payload[0..4]);
            let end = le32(&payload[4..8]);
            st.erases.push((start, end));
            for b in &mut st.flash[start as usize..=end as usize] {
                *b = 0xFF;
            }
            ok()
        }
        b if b == Command::FlashChipErase.id() => {
            st.chip_erases += 1;
            st.flash.iter_mut().for_each(|b| *b = 0xFF);
            ok()
        }
        b if b == Command::FlashWrite.id() => {
            if st.fail_writes > 0 {
                st.fail_writes -= 1;
                return fail(0x0101);
            }
            let addr = le32(&payload[0..4]) as usize;
            let data = &payload[4..];
            st.flash[addr..addr + data.len()].copy_from_slice(data);
            st.writes.push((addr as u32, data.len()));
            ok()
        }
        b if b == Command::FlashWriteCheck.id()
            || b == Command::XipReadStart.id()
            || b == Command::XipReadFinish.id() =>
        {
            ok()
        }
        b if b == Command::FlashReadSha.id() || b == Command::FlashXipReadSha.id() => {
            sha(st, payload)
        }
        b if b == Command::Reset.id() => {
            st.resets += 1;
            ok()
        }
        _ => fail(0x0102),
    }
}
