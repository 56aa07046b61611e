use crate::isp::{BootInfo, JedecId};
use crate::targets::Target;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifySource {
    Xip,
    Flash,
}

#[derive(Debug, Clone)]
pub enum OperationEvent {
    DiscoverStart,
    TargetDetected {
        index: usize,
        target: Target,
    },
    DiscoverDone {
        count: usize,
    },
    TargetSelected {
        target_id: String,
    },

    ImageLoaded {
        bytes: usize,
        address: u32,
        sha256: String,
    },

    TargetStart {
        target_id: String,
    },
    TargetDone {
        target_id: String,
        ok: bool,
        message: Option<String>,
    },

    PortOpen {
        target_id: String,
        port: String,
        baud: u32,
    },
    BootPins {
        target_id: String,
    },
    HandshakeAttempt {
        target_id: String,
        attempt: u32,
        attempts: u32,
    },
    HandshakeOk {
        target_id: String,
        attempt: u32,
    },
    BootInfo {
        target_id: String,
        info: BootInfo,
    },
    JedecId {
        target_id: String,
        id: JedecId,
    },

    EraseStart {
        target_id: String,
        start: u32,
        end: u32,
        chip: bool,
    },
    EraseDone {
        target_id: String,
        elapsed_ms: u64,
    },

    /// A chunk is about to be written. `written` counts bytes before this chunk.
    Chunk {
        target_id: String,
        index: usize,
        total: usize,
        addr: u32,
        len: usize,
        written: usize,
        bytes: usize,
    },
    /// A chunk was acknowledged. `done` counts bytes written so far.
    ChunkWritten {
        target_id: String,
        index: usize,
        total: usize,
        addr: u32,
        len: usize,
        done: usize,
        bytes: usize,
    },
    Retry {
        target_id: String,
        addr: u32,
        attempt: u32,
        retries: u32,
        error: String,
    },
    WriteCheck {
        target_id: String,
    },

    VerifyStart {
        target_id: String,
        source: VerifySource,
    },
    Verified {
        target_id: String,
        sha256: String,
    },

    Reset {
        target_id: String,
    },
    Done {
        target_id: String,
    },
}

/// Progress through an image, in percent, after `written` of `bytes`.
pub fn percent(written: usize, bytes: usize) -> u64 {
    (written as u64).saturating_mul(100) / (bytes.max(1) as u64)
}
