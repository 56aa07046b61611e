use std::path::Path;
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::{
    boot_mode, chip,
    image::{self, FirmwareImage},
    isp::{self, IspClient, IspTimeouts},
    operation::{OperationEvent, VerifySource},
    operation_runner, selector, targets,
    targets::Target,
    transport::{SerialTransport, Transport, TransportError},
};

#[derive(Debug, Clone)]
pub enum Selection {
    Auto,
    All,
    Device(String),
}

/// How to reach a target and get it talking.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Preferred serial port name, used as is even when enumeration misses it.
    ///
    /// Example: "COM6" or "/dev/ttyUSB0".
    pub port: Option<String>,
    pub baud: u32,

    /// Wait for at least one serial port to be detected.
    pub wait: bool,
    /// Max time to wait when `wait=true` (None = forever).
    pub wait_timeout: Option<Duration>,

    /// Total handshake attempts.
    pub handshake_attempts: u32,
    pub handshake_delay: Duration,
    pub timeouts: IspTimeouts,

    /// Toggle DTR/RTS to put the chip into its boot ROM before the handshake.
    pub boot_pins: bool,
    pub boot_pin_delay: Duration,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            port: None,
            baud: chip::DEFAULT_BAUD,
            wait: false,
            wait_timeout: None,
            handshake_attempts: chip::HANDSHAKE_RETRY,
            handshake_delay: chip::HANDSHAKE_RETRY_DELAY,
            timeouts: IspTimeouts::default(),
            boot_pins: true,
            boot_pin_delay: boot_mode::DEFAULT_PIN_DELAY,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum EraseMode {
    /// Erase the sectors covered by the image.
    Range,
    Chip,
    Skip,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum VerifyMode {
    Xip,
    Flash,
    Skip,
}

impl VerifyMode {
    fn source(self) -> Option<VerifySource> {
        match self {
            VerifyMode::Xip => Some(VerifySource::Xip),
            VerifyMode::Flash => Some(VerifySource::Flash),
            VerifyMode::Skip => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FlashOptions {
    pub connect: ConnectOptions,
    pub image: image::LoadOptions,

    /// Largest write command payload (clamped to the ROM limit).
    pub chunk_size: usize,
    /// Retries per chunk on write failure.
    pub retries: u32,
    pub retry_delay: Duration,

    pub erase: EraseMode,
    pub verify: VerifyMode,

    /// Restart into the application when done.
    pub reset: bool,
}

impl Default for FlashOptions {
    fn default() -> Self {
        Self {
            connect: ConnectOptions::default(),
            image: image::LoadOptions::default(),
            chunk_size: chip::MAX_WRITE_CHUNK,
            retries: 2,
            retry_delay: Duration::from_millis(100),
            erase: EraseMode::Range,
            verify: VerifyMode::Xip,
            reset: true,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum OpErrorKind {
    NoDevice,
    AmbiguousTarget,
    InvalidImage,
    InvalidRange,
    HandshakeFailed,
    WriteFailed,
    VerifyMismatch,
    Unexpected,
}

#[derive(Error, Debug)]
pub enum OpError {
    #[error("no serial port found")]
    NoTargets,

    #[error("ambiguous target: {message}")]
    AmbiguousTarget { message: String },

    #[error("target discovery failed: {source}")]
    DiscoveryFailed {
        #[source]
        source: targets::DiscoverError,
    },

    #[error("invalid image: {source}")]
    InvalidImage {
        #[source]
        source: image::ImageError,
    },

    #[error("unable to open {port}: {source}")]
    Open {
        port: String,
        #[source]
        source: TransportError,
    },

    #[error("boot pin sequence failed on {port}: {source}")]
    BootPins {
        port: String,
        #[source]
        source: TransportError,
    },

    #[error("no boot ROM answered on {port}: {source}")]
    Handshake {
        port: String,
        #[source]
        source: isp::IspError,
    },

    #[error("erase range 0x{start:08X}..=0x{end:08X} is invalid for {flash_size} bytes of flash")]
    InvalidRange {
        start: u32,
        end: u32,
        flash_size: u32,
    },

    #[error("erase failed on {port}: {source}")]
    EraseFailed {
        port: String,
        #[source]
        source: isp::IspError,
    },

    #[error("write check failed on {port}: {source}")]
    WriteCheckFailed {
        port: String,
        #[source]
        source: isp::IspError,
    },

    #[error("{port}: {source}")]
    Command {
        port: String,
        #[source]
        source: isp::IspError,
    },

    #[error("write failed at addr=0x{addr:08X} after {attempts} attempts: {source}")]
    WriteFailed {
        addr: u32,
        attempts: u32,
        #[source]
        source: isp::IspError,
    },

    #[error("SHA-256 mismatch: image {expected}, target {actual}")]
    VerifyMismatch { expected: String, actual: String },

    #[error("operation failed for {failed}/{total} targets")]
    MultiTargetFailed { failed: usize, total: usize },
}

impl OpError {
    pub fn kind(&self) -> OpErrorKind {
        match self {
            OpError::NoTargets | OpError::Open { .. } | OpError::BootPins { .. } => {
                OpErrorKind::NoDevice
            }
            OpError::AmbiguousTarget { .. } => OpErrorKind::AmbiguousTarget,
            OpError::DiscoveryFailed { .. } | OpError::Command { .. } => OpErrorKind::Unexpected,
            OpError::InvalidImage { .. } => OpErrorKind::InvalidImage,
            OpError::InvalidRange { .. } => OpErrorKind::InvalidRange,
            OpError::Handshake { .. } => OpErrorKind::HandshakeFailed,
            OpError::WriteFailed { .. }
            | OpError::EraseFailed { .. }
            | OpError::WriteCheckFailed { .. }
            | OpError::MultiTargetFailed { .. } => OpErrorKind::WriteFailed,
            OpError::VerifyMismatch { .. } => OpErrorKind::VerifyMismatch,
        }
    }
}

pub struct FlashPlan {
    pub firmware: FirmwareImage,
    pub selected_targets: Vec<Target>,
}

#[tracing::instrument(skip(opts, on_event))]
pub fn plan_with_selection<F>(
    image_path: &Path,
    opts: &FlashOptions,
    selection: Selection,
    mut on_event: F,
) -> Result<FlashPlan, OpError>
where
    F: FnMut(OperationEvent),
{
    let firmware = load_image(image_path, opts, &mut on_event)?;
    let selected = discover_and_select(&opts.connect, selection, &mut on_event)?;
    Ok(FlashPlan {
        firmware,
        selected_targets: selected,
    })
}

#[tracing::instrument(skip(opts, on_event))]
pub fn flash_with_selection<F>(
    image_path: &Path,
    opts: &FlashOptions,
    selection: Selection,
    mut on_event: F,
) -> Result<(), OpError>
where
    F: FnMut(OperationEvent),
{
    let plan = plan_with_selection(image_path, opts, selection, &mut on_event)?;
    let fw = plan.firmware;

    operation_runner::run_targets(
        plan.selected_targets,
        |target, target_id, on_event| {
            let mut client = open_and_connect(target, target_id, &opts.connect, on_event)?;
            program(&mut client, &fw, opts, target_id, on_event)
        },
        |failed, total| OpError::MultiTargetFailed { failed, total },
        &mut on_event,
    )
}

#[tracing::instrument(skip(opts, on_event))]
pub fn verify_with_selection<F>(
    image_path: &Path,
    opts: &FlashOptions,
    source: VerifySource,
    selection: Selection,
    mut on_event: F,
) -> Result<(), OpError>
where
    F: FnMut(OperationEvent),
{
    let plan = plan_with_selection(image_path, opts, selection, &mut on_event)?;
    let fw = plan.firmware;

    operation_runner::run_targets(
        plan.selected_targets,
        |target, target_id, on_event| {
            let mut client = open_and_connect(target, target_id, &opts.connect, on_event)?;
            verify(&mut client, &fw, source, target_id, on_event)?;
            on_event(OperationEvent::Done {
                target_id: target_id.to_string(),
            });
            Ok(())
        },
        |failed, total| OpError::MultiTargetFailed { failed, total },
        &mut on_event,
    )
}

/// Erase a range (`Some((start, end))`, end inclusive) or the whole chip.
///
/// The range is checked against `flash_size` before any port is opened.
#[tracing::instrument(skip(opts, on_event))]
pub fn erase_with_selection<F>(
    range: Option<(u32, u32)>,
    flash_size: u32,
    opts: &ConnectOptions,
    selection: Selection,
    mut on_event: F,
) -> Result<(), OpError>
where
    F: FnMut(OperationEvent),
{
    if let Some((start, end)) = range {
        check_erase_range(start, end, flash_size)?;
    }

    let selected = discover_and_select(opts, selection, &mut on_event)?;
    operation_runner::run_targets(
        selected,
        |target, target_id, on_event| {
            let mut client = open_and_connect(target, target_id, opts, on_event)?;
            let mode = if range.is_some() {
                EraseMode::Range
            } else {
                EraseMode::Chip
            };
            erase(&mut client, mode, range.unwrap_or((0, 0)), target_id, on_event)?;
            on_event(OperationEvent::Done {
                target_id: target_id.to_string(),
            });
            Ok(())
        },
        |failed, total| OpError::MultiTargetFailed { failed, total },
        &mut on_event,
    )
}

#[tracing::instrument(skip(opts, on_event))]
pub fn info_with_selection<F>(
    opts: &ConnectOptions,
    selection: Selection,
    mut on_event: F,
) -> Result<(), OpError>
where
    F: FnMut(OperationEvent),
{
    let selected = discover_and_select(opts, selection, &mut on_event)?;
    operation_runner::run_targets(
        selected,
        |target, target_id, on_event| {
            let mut client = open_and_connect(target, target_id, opts, on_event)?;
            read_info(&mut client, &target.port_name, target_id, on_event)?;
            on_event(OperationEvent::Done {
                target_id: target_id.to_string(),
            });
            Ok(())
        },
        |failed, total| OpError::MultiTargetFailed { failed, total },
        &mut on_event,
    )
}

#[tracing::instrument(skip(opts, on_event))]
pub fn reset_with_selection<F>(
    opts: &ConnectOptions,
    selection: Selection,
    mut on_event: F,
) -> Result<(), OpError>
where
    F: FnMut(OperationEvent),
{
    let selected = discover_and_select(opts, selection, &mut on_event)?;
    operation_runner::run_targets(
        selected,
        |target, target_id, on_event| {
            let mut client = open_and_connect(target, target_id, opts, on_event)?;
            reset(&mut client, opts, &target.port_name, target_id, on_event)?;
            on_event(OperationEvent::Done {
                target_id: target_id.to_string(),
            });
            Ok(())
        },
        |failed, total| OpError::MultiTargetFailed { failed, total },
        &mut on_event,
    )
}

/// `start..=end` must be ordered and lie inside the flash.
pub fn check_erase_range(start: u32, end: u32, flash_size: u32) -> Result<(), OpError> {
    if start > end || end as u64 >= flash_size as u64 {
        return Err(OpError::InvalidRange {
            start,
            end,
            flash_size,
        });
    }
    Ok(())
}

fn load_image<F>(
    image_path: &Path,
    opts: &FlashOptions,
    on_event: &mut F,
) -> Result<FirmwareImage, OpError>
where
    F: FnMut(OperationEvent),
{
    let fw = FirmwareImage::load(image_path, &opts.image)
        .map_err(|e| OpError::InvalidImage { source: e })?;

    tracing::info!(
        bytes = fw.len(),
        address = fw.address,
        sha256 = %fw.sha256_hex(),
        "image loaded"
    );
    on_event(OperationEvent::ImageLoaded {
        bytes: fw.len(),
        address: fw.address,
        sha256: fw.sha256_hex(),
    });
    Ok(fw)
}

fn discover_and_select<F>(
    opts: &ConnectOptions,
    selection: Selection,
    on_event: &mut F,
) -> Result<Vec<Target>, OpError>
where
    F: FnMut(OperationEvent),
{
    let targets = discover_targets_with_wait(opts, on_event)?;
    select_targets(selection, opts.port.as_deref(), &targets, on_event)
}

fn discover_targets_with_wait<F>(
    opts: &ConnectOptions,
    on_event: &mut F,
) -> Result<Vec<Target>, OpError>
where
    F: FnMut(OperationEvent),
{
    on_event(OperationEvent::DiscoverStart);

    let start = Instant::now();
    loop {
        let targets =
            targets::discover_targets().map_err(|e| OpError::DiscoveryFailed { source: e })?;

        for (i, t) in targets.iter().cloned().enumerate() {
            on_event(OperationEvent::TargetDetected {
                index: i,
                target: t,
            });
        }
        on_event(OperationEvent::DiscoverDone {
            count: targets.len(),
        });

        // An explicit port does not depend on enumeration.
        if !targets.is_empty() || opts.port.is_some() {
            return Ok(targets);
        }
        if !opts.wait {
            return Err(OpError::NoTargets);
        }
        if let Some(t) = opts.wait_timeout {
            if start.elapsed() >= t {
                return Err(OpError::NoTargets);
            }
        }
        std::thread::sleep(Duration::from_millis(250));
    }
}

pub(crate) fn select_targets<F>(
    selection: Selection,
    preferred_port: Option<&str>,
    targets: &[Target],
    on_event: &mut F,
) -> Result<Vec<Target>, OpError>
where
    F: FnMut(OperationEvent),
{
    let selected: Vec<Target> = match selection {
        Selection::All => {
            if targets.is_empty() {
                return Err(OpError::NoTargets);
            }
            targets.to_vec()
        }

        Selection::Device(sel) => {
            let parsed = selector::parse_selector(&sel).map_err(|e| OpError::AmbiguousTarget {
                message: e.to_string(),
            })?;
            let idx = selector::resolve_one(&parsed, targets).map_err(|e| {
                OpError::AmbiguousTarget {
                    message: e.to_string(),
                }
            })?;
            vec![targets[idx].clone()]
        }

        Selection::Auto => {
            let bridges: Vec<&Target> = targets.iter().filter(|t| t.bridge.is_some()).collect();

            if let Some(port) = preferred_port {
                let found = targets.iter().find(|t| t.matches_port(port));
                vec![found
                    .cloned()
                    .unwrap_or_else(|| Target::from_port_name(port))]
            } else if bridges.len() == 1 {
                // A single known USB-UART bridge is almost certainly the board.
                vec![bridges[0].clone()]
            } else if targets.len() == 1 {
                vec![targets[0].clone()]
            } else if targets.is_empty() {
                return Err(OpError::NoTargets);
            } else if !bridges.is_empty() {
                return Err(OpError::AmbiguousTarget {
                    message: format!(
                        "multiple USB-UART bridges detected ({}); use --port, --device or --all",
                        bridges.len()
                    ),
                });
            } else {
                return Err(OpError::AmbiguousTarget {
                    message: format!(
                        "multiple serial ports detected ({}); use --port, --device or --all",
                        targets.len()
                    ),
                });
            }
        }
    };

    if selected.len() == 1 {
        on_event(OperationEvent::TargetSelected {
            target_id: selected[0].id(),
        });
    }

    Ok(selected)
}

fn open_and_connect<F>(
    target: &Target,
    target_id: &str,
    opts: &ConnectOptions,
    on_event: &mut F,
) -> Result<IspClient<SerialTransport>, OpError>
where
    F: FnMut(OperationEvent),
{
    let transport =
        SerialTransport::open(&target.port_name, opts.baud).map_err(|e| OpError::Open {
            port: target.port_name.clone(),
            source: e,
        })?;
    on_event(OperationEvent::PortOpen {
        target_id: target_id.to_string(),
        port: target.port_name.clone(),
        baud: opts.baud,
    });
    connect(transport, opts, target_id, on_event)
}

/// Put the chip into its boot ROM (optionally) and handshake.
pub fn connect<T, F>(
    mut transport: T,
    opts: &ConnectOptions,
    target_id: &str,
    on_event: &mut F,
) -> Result<IspClient<T>, OpError>
where
    T: Transport,
    F: FnMut(OperationEvent),
{
    let port = transport.name().to_string();

    if opts.boot_pins {
        boot_mode::enter_boot_rom(&mut transport, opts.boot_pin_delay).map_err(|e| {
            OpError::BootPins {
                port: port.clone(),
                source: e,
            }
        })?;
        on_event(OperationEvent::BootPins {
            target_id: target_id.to_string(),
        });
    }

    let mut client = IspClient::new(transport, opts.timeouts);
    let attempt = client
        .handshake(opts.handshake_attempts, opts.handshake_delay, |attempt, attempts| {
            on_event(OperationEvent::HandshakeAttempt {
                target_id: target_id.to_string(),
                attempt,
                attempts,
            })
        })
        .map_err(|e| OpError::Handshake {
            port: port.clone(),
            source: e,
        })?;

    on_event(OperationEvent::HandshakeOk {
        target_id: target_id.to_string(),
        attempt,
    });
    Ok(client)
}

/// Erase, write, check and verify `fw` on a connected target.
pub fn program<T, F>(
    client: &mut IspClient<T>,
    fw: &FirmwareImage,
    opts: &FlashOptions,
    target_id: &str,
    on_event: &mut F,
) -> Result<(), OpError>
where
    T: Transport,
    F: FnMut(OperationEvent),
{
    let port = client.transport_mut().name().to_string();
    let cmd_err = |e| OpError::Command {
        port: port.clone(),
        source: e,
    };

    let info = client.boot_info().map_err(cmd_err)?;
    tracing::info!(bootrom_version = info.bootrom_version, "boot info");
    on_event(OperationEvent::BootInfo {
        target_id: target_id.to_string(),
        info,
    });

    erase(client, opts.erase, fw.erase_range(), target_id, on_event)?;
    write_image(client, fw, opts, target_id, on_event)?;

    client
        .write_check()
        .map_err(|e| OpError::WriteCheckFailed {
            port: port.clone(),
            source: e,
        })?;
    on_event(OperationEvent::WriteCheck {
        target_id: target_id.to_string(),
    });

    if let Some(source) = opts.verify.source() {
        verify(client, fw, source, target_id, on_event)?;
    }

    if opts.reset {
        reset(client, &opts.connect, &port, target_id, on_event)?;
    }

    on_event(OperationEvent::Done {
        target_id: target_id.to_string(),
    });
    Ok(())
}

fn erase<T, F>(
    client: &mut IspClient<T>,
    mode: EraseMode,
    (start, end): (u32, u32),
    target_id: &str,
    on_event: &mut F,
) -> Result<(), OpError>
where
    T: Transport,
    F: FnMut(OperationEvent),
{
    let chip = match mode {
        EraseMode::Skip => return Ok(()),
        EraseMode::Chip => true,
        EraseMode::Range => false,
    };

    on_event(OperationEvent::EraseStart {
        target_id: target_id.to_string(),
        start,
        end,
        chip,
    });

    let started = Instant::now();
    let r = if chip {
        client.chip_erase()
    } else {
        client.erase(start, end)
    };
    r.map_err(|e| OpError::EraseFailed {
        port: client.transport_mut().name().to_string(),
        source: e,
    })?;

    let elapsed_ms = started.elapsed().as_millis() as u64;
    tracing::info!(start, end, chip, elapsed_ms, "erase done");
    on_event(OperationEvent::EraseDone {
        target_id: target_id.to_string(),
        elapsed_ms,
    });
    Ok(())
}

fn write_image<T, F>(
    client: &mut IspClient<T>,
    fw: &FirmwareImage,
    opts: &FlashOptions,
    target_id: &str,
    on_event: &mut F,
) -> Result<(), OpError>
where
    T: Transport,
    F: FnMut(OperationEvent),
{
    let chunk_size = opts.chunk_size.clamp(1, chip::MAX_WRITE_CHUNK);
    let bytes = fw.len();
    let total = bytes.div_ceil(chunk_size);

    for (index, (offset, chunk)) in fw.chunks(chunk_size).enumerate() {
        let addr = fw.address + offset as u32;
        on_event(OperationEvent::Chunk {
            target_id: target_id.to_string(),
            index,
            total,
            addr,
            len: chunk.len(),
            written: offset,
            bytes,
        });

        let mut attempt: u32 = 0;
        loop {
            attempt = attempt.saturating_add(1);
            match client.write(addr, chunk) {
                Ok(()) => {
                    on_event(OperationEvent::ChunkWritten {
                        target_id: target_id.to_string(),
                        index,
                        total,
                        addr,
                        len: chunk.len(),
                        done: offset + chunk.len(),
                        bytes,
                    });
                    break;
                }
                Err(e) => {
                    if attempt > opts.retries {
                        return Err(OpError::WriteFailed {
                            addr,
                            attempts: attempt,
                            source: e,
                        });
                    }

                    tracing::warn!(addr, attempt, error = %e, "chunk write failed, retrying");
                    on_event(OperationEvent::Retry {
                        target_id: target_id.to_string(),
                        addr,
                        attempt,
                        retries: opts.retries,
                        error: e.to_string(),
                    });
                    std::thread::sleep(opts.retry_delay);
                }
            }
        }
    }
    Ok(())
}

fn verify<T, F>(
    client: &mut IspClient<T>,
    fw: &FirmwareImage,
    source: VerifySource,
    target_id: &str,
    on_event: &mut F,
) -> Result<(), OpError>
where
    T: Transport,
    F: FnMut(OperationEvent),
{
    on_event(OperationEvent::VerifyStart {
        target_id: target_id.to_string(),
        source,
    });

    let len = fw.len() as u32;
    let digest = match source {
        VerifySource::Xip => client.xip_read_sha(fw.address, len),
        VerifySource::Flash => client.read_sha(fw.address, len),
    }
    .map_err(|e| OpError::Command {
        port: client.transport_mut().name().to_string(),
        source: e,
    })?;

    if digest != fw.sha256 {
        return Err(OpError::VerifyMismatch {
            expected: fw.sha256_hex(),
            actual: hex::encode(digest),
        });
    }

    tracing::info!(sha256 = %fw.sha256_hex(), "verified");
    on_event(OperationEvent::Verified {
        target_id: target_id.to_string(),
        sha256: fw.sha256_hex(),
    });
    Ok(())
}

fn read_info<T, F>(
    client: &mut IspClient<T>,
    port: &str,
    target_id: &str,
    on_event: &mut F,
) -> Result<(), OpError>
where
    T: Transport,
    F: FnMut(OperationEvent),
{
    let cmd_err = |e| OpError::Command {
        port: port.to_string(),
        source: e,
    };

    let info = client.boot_info().map_err(cmd_err)?;
    on_event(OperationEvent::BootInfo {
        target_id: target_id.to_string(),
        info,
    });

    let id = client.jedec_id().map_err(cmd_err)?;
    on_event(OperationEvent::JedecId {
        target_id: target_id.to_string(),
        id,
    });
    Ok(())
}

fn reset<T, F>(
    client: &mut IspClient<T>,
    opts: &ConnectOptions,
    port: &str,
    target_id: &str,
    on_event: &mut F,
) -> Result<(), OpError>
where
    T: Transport,
    F: FnMut(OperationEvent),
{
    on_event(OperationEvent::Reset {
        target_id: target_id.to_string(),
    });

    client.reset().map_err(|e| OpError::Command {
        port: port.to_string(),
        source: e,
    })?;

    if opts.boot_pins {
        // BOOT is already released; the pulse covers ROMs that ignore the command.
        boot_mode::reset_to_app(client.transport_mut(), opts.boot_pin_delay).map_err(|e| {
            OpError::BootPins {
                port: port.to_string(),
                source: e,
            }
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::targets::{PortKind, UsbBridge};
    use crate::testing::{fake_rom, FakeRomState};

    fn usb(port: &str, bridge: Option<UsbBridge>) -> Target {
        Target {
            kind: PortKind::Usb,
            vid: Some(0x1A86),
            pid: Some(0x7523),
            bridge,
            ..Target::from_port_name(port)
        }
    }

    fn fast_opts() -> FlashOptions {
        FlashOptions {
            connect: ConnectOptions {
                handshake_delay: Duration::ZERO,
                boot_pin_delay: Duration::ZERO,
                ..Default::default()
            },
            retry_delay: Duration::ZERO,
            ..Default::default()
        }
    }

    fn image(len: usize, address: u32) -> FirmwareImage {
        let data: Vec<u8> = (0..len).map(|i| (i * 7 + 3) as u8).collect();
        FirmwareImage::from_bytes(address, data, 64 * 1024).unwrap()
    }

    #[test]
    fn select_auto_prefers_single_bridge() {
        let targets = vec![
            usb("/dev/ttyACM0", None),
            usb("/dev/ttyUSB0", Some(UsbBridge::Ch34x)),
        ];
        let mut events: Vec<OperationEvent> = Vec::new();

        let selected =
            select_targets(Selection::Auto, None, &targets, &mut |e| events.push(e)).unwrap();

        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].id(), "serial:/dev/ttyUSB0");
        assert!(events.iter().any(|e| matches!(
            e,
            OperationEvent::TargetSelected { target_id } if target_id == "serial:/dev/ttyUSB0"
        )));
    }

    #[test]
    fn select_auto_uses_preferred_port_even_if_not_enumerated() {
        let targets = vec![usb("/dev/ttyUSB0", Some(UsbBridge::Ch34x))];
        let selected =
            select_targets(Selection::Auto, Some("/dev/ttyS3"), &targets, &mut |_| {}).unwrap();
        assert_eq!(selected[0].port_name, "/dev/ttyS3");
        assert_eq!(selected[0].kind, PortKind::Unknown);
    }

    #[test]
    fn select_auto_rejects_multiple_bridges() {
        let targets = vec![
            usb("/dev/ttyUSB0", Some(UsbBridge::Ch34x)),
            usb("/dev/ttyUSB1", Some(UsbBridge::Cp210x)),
        ];
        let err = select_targets(Selection::Auto, None, &targets, &mut |_| {}).unwrap_err();
        assert_eq!(err.kind(), OpErrorKind::AmbiguousTarget);
    }

    #[test]
    fn select_device_by_index() {
        let targets = vec![usb("A", None), usb("B", None)];
        let selected = select_targets(
            Selection::Device("index:1".to_string()),
            None,
            &targets,
            &mut |_| {},
        )
        .unwrap();
        assert_eq!(selected[0].port_name, "B");
    }

    #[test]
    fn select_nothing_is_no_device() {
        let err = select_targets(Selection::Auto, None, &[], &mut |_| {}).unwrap_err();
        assert_eq!(err.kind(), OpErrorKind::NoDevice);
    }

    #[test]
    fn connect_toggles_boot_pins_and_handshakes() {
        let (t, st) = fake_rom(FakeRomState {
            fail_handshakes: 1,
            ..Default::default()
        });
        let mut events = Vec::new();
        let client = connect(t, &fast_opts().connect, "serial:mock", &mut |e| events.push(e))
            .unwrap();

        assert_eq!(st.borrow().handshakes, 2);
        assert!(!client.into_inner().line_changes.is_empty());
        assert!(matches!(events[0], OperationEvent::BootPins { .. }));
        assert!(events
            .iter()
            .any(|e| matches!(e, OperationEvent::HandshakeOk { attempt: 2, .. })));
    }

    #[test]
    fn connect_reports_handshake_failure() {
        let (t, _st) = fake_rom(FakeRomState {
            fail_handshakes: 10,
            ..Default::default()
        });
        let err = match connect(t, &fast_opts().connect, "serial:mock", &mut |_| {}) {
            Ok(_) => panic!("expected handshake failure"),
            Err(e) => e,
        };
        assert_eq!(err.kind(), OpErrorKind::HandshakeFailed);
    }

    #[test]
    fn program_writes_chunks_and_verifies() {
        let (t, st) = fake_rom(FakeRomState::default());
        let opts = fast_opts();
        let fw = image(5000, 0x1100);
        let mut events = Vec::new();

        let mut client = connect(t, &opts.connect, "serial:mock", &mut |e| events.push(e)).unwrap();
        program(&mut client, &fw, &opts, "serial:mock", &mut |e| events.push(e)).unwrap();

        let st = st.borrow();
        assert_eq!(st.erases, vec![(0x1000, 0x2FFF)]);
        assert_eq!(
            st.writes,
            vec![(0x1100, 2048), (0x1900, 2048), (0x2100, 904)]
        );
        assert_eq!(&st.flash[0x1100..0x1100 + 5000], fw.data.as_slice());
        assert_eq!(st.resets, 1);

        let chunks: Vec<(usize, usize)> = events
            .iter()
            .filter_map(|e| match e {
                OperationEvent::Chunk {
                    index, written, ..
                } => Some((*index, *written)),
                _ => None,
            })
            .collect();
        assert_eq!(chunks, vec![(0, 0), (1, 2048), (2, 4096)]);
        let done: Vec<usize> = events
            .iter()
            .filter_map(|e| match e {
                OperationEvent::ChunkWritten { done, .. } => Some(*done),
                _ => None,
            })
            .collect();
        assert_eq!(done, vec![2048, 4096, 5000]);
        assert!(events
            .iter()
            .any(|e| matches!(e, OperationEvent::Verified { sha256, .. } if *sha256 == fw.sha256_hex())));
        assert!(matches!(events.last(), Some(OperationEvent::Done { .. })));
    }

    #[test]
    fn program_retries_failed_chunk() {
        let (t, st) = fake_rom(FakeRomState {
            fail_writes: 2,
            ..Default::default()
        });
        let opts = fast_opts();
        let fw = image(100, 0);
        let mut retries = 0;

        let mut client = connect(t, &opts.connect, "serial:mock", &mut |_| {}).unwrap();
        program(&mut client, &fw, &opts, "serial:mock", &mut |e| {
            if matches!(e, OperationEvent::Retry { .. }) {
                retries += 1;
            }
        })
        .unwrap();

        assert_eq!(retries, 2);
        assert_eq!(st.borrow().writes.len(), 1);
    }

    #[test]
    fn program_gives_up_after_retries() {
        let (t, _st) = fake_rom(FakeRomState {
            fail_writes: 10,
            ..Default::default()
        });
        let opts = fast_opts();
        let fw = image(100, 0);

        let mut client = connect(t, &opts.connect, "serial:mock", &mut |_| {}).unwrap();
        let err = program(&mut client, &fw, &opts, "serial:mock", &mut |_| {}).unwrap_err();
        assert!(matches!(
            err,
            OpError::WriteFailed {
                addr: 0,
                attempts: 3,
                ..
            }
        ));
        assert_eq!(err.kind(), OpErrorKind::WriteFailed);
    }

    #[test]
    fn failed_chunk_reports_no_written_progress() {
        let (t, st) = fake_rom(FakeRomState {
            fail_writes: 100,
            ..Default::default()
        });
        let opts = fast_opts();
        let fw = image(100, 0);
        let mut events = Vec::new();

        let mut client = connect(t, &opts.connect, "serial:mock", &mut |_| {}).unwrap();
        assert!(program(&mut client, &fw, &opts, "serial:mock", &mut |e| events.push(e)).is_err());

        assert!(st.borrow().writes.is_empty());
        assert!(!events
            .iter()
            .any(|e| matches!(e, OperationEvent::ChunkWritten { .. })));
    }

    #[test]
    fn write_check_nak_is_write_failure() {
        let (t, st) = fake_rom(FakeRomState {
            fail_write_check: true,
            ..Default::default()
        });
        let opts = fast_opts();
        let fw = image(100, 0);

        let mut client = connect(t, &opts.connect, "serial:mock", &mut |_| {}).unwrap();
        let err = program(&mut client, &fw, &opts, "serial:mock", &mut |_| {}).unwrap_err();
        assert!(matches!(err, OpError::WriteCheckFailed { .. }));
        assert_eq!(err.kind(), OpErrorKind::WriteFailed);
        assert_eq!(st.borrow().resets, 0);
    }

    #[test]
    fn erase_nak_is_write_failure() {
        let (t, st) = fake_rom(FakeRomState {
            fail_erase: true,
            ..Default::default()
        });
        let opts = fast_opts();
        let fw = image(100, 0);

        let mut client = connect(t, &opts.connect, "serial:mock", &mut |_| {}).unwrap();
        let err = program(&mut client, &fw, &opts, "serial:mock", &mut |_| {}).unwrap_err();
        assert!(matches!(err, OpError::EraseFailed { .. }));
        assert_eq!(err.kind(), OpErrorKind::WriteFailed);
        assert!(st.borrow().writes.is_empty());
    }

    #[test]
    fn inverted_erase_range_is_refused_before_connecting() {
        let mut events = Vec::new();
        let err = erase_with_selection(
            Some((0x2000, 0x1000)),
            chip::DEFAULT_FLASH_SIZE,
            &fast_opts().connect,
            Selection::Auto,
            |e| events.push(e),
        )
        .unwrap_err();

        assert!(matches!(
            err,
            OpError::InvalidRange {
                start: 0x2000,
                end: 0x1000,
                ..
            }
        ));
        assert_eq!(err.kind(), OpErrorKind::InvalidRange);
        assert!(events.is_empty());
    }

    #[test]
    fn erase_range_must_fit_flash() {
        assert!(check_erase_range(0, 0xFFF, 0x1000).is_ok());
        assert!(check_erase_range(0x1000, 0x1000, 0x1000).is_err());
        assert!(check_erase_range(0, 0x40_0000, chip::DEFAULT_FLASH_SIZE).is_err());
        assert!(check_erase_range(0x10, 0x0F, chip::DEFAULT_FLASH_SIZE).is_err());
    }

    #[test]
    fn program_detects_digest_mismatch() {
        let (t, st) = fake_rom(FakeRomState {
            corrupt_digest: true,
            ..Default::default()
        });
        let opts = fast_opts();
        let fw = image(64, 0);

        let mut client = connect(t, &opts.connect, "serial:mock", &mut |_| {}).unwrap();
        let err = program(&mut client, &fw, &opts, "serial:mock", &mut |_| {}).unwrap_err();
        match &err {
            OpError::VerifyMismatch { expected, actual } => {
                assert_eq!(*expected, fw.sha256_hex());
                assert_ne!(expected, actual);
            }
            other => panic!("expected VerifyMismatch, got {other:?}"),
        }
        assert_eq!(err.kind(), OpErrorKind::VerifyMismatch);
        assert_eq!(st.borrow().resets, 0);
    }

    #[test]
    fn program_chip_erase_and_flash_sha() {
        let (t, st) = fake_rom(FakeRomState::default());
        let opts = FlashOptions {
            erase: EraseMode::Chip,
            verify: VerifyMode::Flash,
            reset: false,
            ..fast_opts()
        };
        let fw = image(10, 0x400);

        let mut client = connect(t, &opts.connect, "serial:mock", &mut |_| {}).unwrap();
        program(&mut client, &fw, &opts, "serial:mock", &mut |_| {}).unwrap();

        let st = st.borrow();
        assert_eq!(st.chip_erases, 1);
        assert!(st.erases.is_empty());
        assert!(st.commands.contains(&0x3D));
        assert!(!st.commands.contains(&0x60));
        assert_eq!(st.resets, 0);
    }
}
