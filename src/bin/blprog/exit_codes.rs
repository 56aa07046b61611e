use blprog::api::OpErrorKind;

pub const EXIT_OK: i32 = 0;
pub const EXIT_NO_DEVICE: i32 = 10;
pub const EXIT_INVALID_IMAGE: i32 = 11;
pub const EXIT_WRITE_FAILED: i32 = 12;
pub const EXIT_AMBIGUOUS: i32 = 13;
pub const EXIT_HANDSHAKE_FAILED: i32 = 14;
pub const EXIT_VERIFY_MISMATCH: i32 = 15;
pub const EXIT_INVALID_RANGE: i32 = 16;
pub const EXIT_UNEXPECTED: i32 = 20;

pub fn for_kind(kind: OpErrorKind) -> i32 {
    match kind {
        OpErrorKind::NoDevice => EXIT_NO_DEVICE,
        OpErrorKind::AmbiguousTarget => EXIT_AMBIGUOUS,
        OpErrorKind::InvalidImage => EXIT_INVALID_IMAGE,
        OpErrorKind::InvalidRange => EXIT_INVALID_RANGE,
        OpErrorKind::HandshakeFailed => EXIT_HANDSHAKE_FAILED,
        OpErrorKind::WriteFailed => EXIT_WRITE_FAILED,
        OpErrorKind::VerifyMismatch => EXIT_VERIFY_MISMATCH,
        OpErrorKind::Unexpected => EXIT_UNEXPECTED,
    }
}
