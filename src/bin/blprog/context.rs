use std::time::Duration;

use blprog::api::{ConnectOptions, EraseMode, FlashOptions, Selection, VerifyMode};
use blprog::image::{ImageFormat, LoadOptions};
use blprog::operation::VerifySource;
use blprog::isp::IspTimeouts;

use crate::cli;

pub fn wait_timeout(ms: u64) -> Option<Duration> {
    if ms == 0 {
        None
    } else {
        Some(Duration::from_millis(ms))
    }
}

pub fn selection(args: &cli::ConnectArgs) -> Selection {
    if args.all {
        Selection::All
    } else if let Some(sel) = args.device.clone() {
        Selection::Device(sel)
    } else {
        Selection::Auto
    }
}

pub fn connect_opts(args: &cli::ConnectArgs) -> ConnectOptions {
    let defaults = ConnectOptions::default();
    ConnectOptions {
        port: args.port.clone(),
        baud: args.baud,
        wait: args.wait,
        wait_timeout: wait_timeout(args.wait_timeout_ms),
        handshake_attempts: args.handshake_attempts,
        handshake_delay: Duration::from_millis(args.handshake_delay_ms),
        timeouts: IspTimeouts {
            response: Duration::from_millis(args.response_timeout_ms),
            erase: Duration::from_millis(args.erase_timeout_ms),
            ..IspTimeouts::default()
        },
        boot_pins: !args.no_boot_pins,
        ..defaults
    }
}

pub fn load_opts(args: &cli::ImageArgs) -> LoadOptions {
    LoadOptions {
        format: match args.format {
            cli::FormatArg::Auto => ImageFormat::Auto,
            cli::FormatArg::Bin => ImageFormat::Bin,
            cli::FormatArg::Hex => ImageFormat::IntelHex,
        },
        address: args.addr,
        flash_size: args.flash_size,
    }
}

pub fn verify_mode(arg: cli::VerifyArg) -> VerifyMode {
    match arg {
        cli::VerifyArg::Xip => VerifyMode::Xip,
        cli::VerifyArg::Flash => VerifyMode::Flash,
        cli::VerifyArg::Skip => VerifyMode::Skip,
    }
}

pub fn flash_opts(args: &cli::FlashArgs) -> FlashOptions {
    FlashOptions {
        connect: connect_opts(&args.connect),
        image: load_opts(&args.image),
        chunk_size: args.chunk_size as usize,
        retries: args.retries,
        erase: match args.erase {
            cli::EraseArg::Range => EraseMode::Range,
            cli::EraseArg::Chip => EraseMode::Chip,
            cli::EraseArg::Skip => EraseMode::Skip,
        },
        verify: verify_mode(args.verify),
        reset: !args.no_reset,
        ..Default::default()
    }
}

pub fn verify_source(arg: cli::VerifySourceArg) -> VerifySource {
    match arg {
        cli::VerifySourceArg::Xip => VerifySource::Xip,
        cli::VerifySourceArg::Flash => VerifySource::Flash,
    }
}

pub fn verify_opts(args: &cli::VerifyArgs) -> FlashOptions {
    FlashOptions {
        connect: connect_opts(&args.connect),
        image: load_opts(&args.image),
        ..Default::default()
    }
}
