use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum JsonProgressArg {
    /// Emit a JSON event for every written chunk.
    Chunks,
    /// Emit fewer JSON events by throttling chunk output to percent changes.
    Percent,
    /// Do not emit per-chunk progress events.
    None,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum FormatArg {
    Auto,
    Bin,
    Hex,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum EraseArg {
    /// Erase only the sectors covered by the image.
    Range,
    /// Erase the whole flash.
    Chip,
    /// Do not erase (flash must already be blank).
    Skip,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum VerifyArg {
    /// Target hashes flash through the XIP read path.
    Xip,
    /// Target hashes flash through the normal read path.
    Flash,
    Skip,
}

/// Read path for the `verify` command, which always checks.
#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum VerifySourceArg {
    Xip,
    Flash,
}

#[derive(Parser)]
#[command(name = "blprog")]
#[command(about = "Bouffalo Lab UART boot-ROM flasher")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Erase, write and verify a firmware image.
    Flash(FlashArgs),

    /// Compare the target's flash SHA-256 against an image without writing.
    Verify(VerifyArgs),

    /// Erase a flash range or the whole chip.
    Erase(EraseArgs),

    /// Print boot ROM and flash identification.
    Info(SessionArgs),

    /// Reset the target into its application.
    Reset(SessionArgs),

    /// List serial ports that may reach a boot ROM.
    List(ListArgs),
}

#[derive(Args, Clone)]
pub struct ConnectArgs {
    /// Serial port to use (e.g. /dev/ttyUSB0, COM6).
    #[arg(long, conflicts_with_all = ["device", "all"])]
    pub port: Option<String>,

    /// Select a detected port (e.g. serial:/dev/ttyUSB0, index:0).
    #[arg(long, conflicts_with = "all")]
    pub device: Option<String>,

    /// Run on every detected port sequentially.
    #[arg(long)]
    pub all: bool,

    /// UART baud rate.
    #[arg(long, default_value_t = blprog::chip::DEFAULT_BAUD)]
    pub baud: u32,

    /// Wait for a serial port to appear.
    #[arg(long)]
    pub wait: bool,

    /// Max time to wait for a port (0 = forever).
    #[arg(long, default_value_t = 0)]
    pub wait_timeout_ms: u64,

    /// Handshake attempts before giving up.
    #[arg(long, default_value_t = blprog::chip::HANDSHAKE_RETRY)]
    pub handshake_attempts: u32,

    /// Delay between handshake attempts.
    #[arg(long, default_value_t = blprog::chip::HANDSHAKE_RETRY_DELAY.as_millis() as u64)]
    pub handshake_delay_ms: u64,

    /// Max time to wait for a command response.
    #[arg(long, default_value_t = 2000)]
    pub response_timeout_ms: u64,

    /// Max time to wait for an erase to complete.
    #[arg(long, default_value_t = 60000)]
    pub erase_timeout_ms: u64,

    /// Do not drive DTR/RTS to enter the boot ROM (BOOT strapped by hand).
    #[arg(long)]
    pub no_boot_pins: bool,
}

#[derive(Args, Clone)]
pub struct OutputArgs {
    /// Emit JSON line events to stdout.
    #[arg(long)]
    pub json: bool,

    /// Include monotonic timestamps in JSON events (milliseconds since process start).
    #[arg(long, requires = "json")]
    pub json_timestamps: bool,

    /// Reduce output (only errors).
    #[arg(long, conflicts_with = "verbose")]
    pub quiet: bool,

    /// More logs to stderr.
    #[arg(long, short)]
    pub verbose: bool,
}

#[derive(Args, Clone)]
pub struct ImageArgs {
    /// Firmware image (.bin or Intel .hex).
    pub image: PathBuf,

    /// Image format.
    #[arg(long, value_enum, default_value_t = FormatArg::Auto)]
    pub format: FormatArg,

    /// Flash offset for raw binaries (e.g. 0x10000).
    #[arg(long, value_parser = parse_u32, default_value = "0x0")]
    pub addr: u32,

    /// Flash size used to bound the image.
    #[arg(long, value_parser = parse_u32, default_value = "0x400000")]
    pub flash_size: u32,
}

#[derive(Parser)]
pub struct FlashArgs {
    #[command(flatten)]
    pub image: ImageArgs,

    #[command(flatten)]
    pub connect: ConnectArgs,

    /// Erase strategy before writing.
    #[arg(long, value_enum, default_value_t = EraseArg::Range)]
    pub erase: EraseArg,

    /// Read-back verification.
    #[arg(long, value_enum, default_value_t = VerifyArg::Xip)]
    pub verify: VerifyArg,

    /// Bytes per write command (max 2048).
    #[arg(long, default_value_t = blprog::chip::MAX_WRITE_CHUNK as u16,
          value_parser = clap::value_parser!(u16).range(1..=blprog::chip::MAX_WRITE_CHUNK as i64))]
    pub chunk_size: u16,

    /// Retries per chunk on write failure.
    #[arg(long, default_value_t = 2)]
    pub retries: u32,

    /// Stay in the boot ROM after programming.
    #[arg(long)]
    pub no_reset: bool,

    /// Validate the image and port selection without touching the target.
    #[arg(long)]
    pub dry_run: bool,

    /// JSON progress verbosity.
    ///
    /// - chunks: emit every chunk (most verbose)
    /// - percent: emit fewer progress events
    /// - none: no per-chunk progress events
    #[arg(long, value_enum, default_value_t = JsonProgressArg::Percent, requires = "json")]
    pub json_progress: JsonProgressArg,

    #[command(flatten)]
    pub output: OutputArgs,
}

#[derive(Parser)]
pub struct VerifyArgs {
    #[command(flatten)]
    pub image: ImageArgs,

    #[command(flatten)]
    pub connect: ConnectArgs,

    /// Which read path the target hashes through.
    #[arg(long, value_enum, default_value_t = VerifySourceArg::Xip)]
    pub verify: VerifySourceArg,

    #[command(flatten)]
    pub output: OutputArgs,
}

#[derive(Parser)]
pub struct EraseArgs {
    /// First byte to erase.
    #[arg(long, value_parser = parse_u32, requires = "end", conflicts_with = "chip")]
    pub start: Option<u32>,

    /// Last byte to erase (inclusive).
    #[arg(long, value_parser = parse_u32, requires = "start")]
    pub end: Option<u32>,

    /// Erase the whole flash.
    #[arg(long, required_unless_present = "start")]
    pub chip: bool,

    /// Flash size used to bound the range.
    #[arg(long, value_parser = parse_u32, default_value = "0x400000")]
    pub flash_size: u32,

    #[command(flatten)]
    pub connect: ConnectArgs,

    #[command(flatten)]
    pub output: OutputArgs,
}

#[derive(Parser)]
pub struct SessionArgs {
    #[command(flatten)]
    pub connect: ConnectArgs,

    #[command(flatten)]
    pub output: OutputArgs,
}

#[derive(Parser)]
pub struct ListArgs {
    /// Emit JSON line output.
    #[arg(long)]
    pub json: bool,
}

/// Decimal or `0x`-prefixed hexadecimal.
pub fn parse_u32(s: &str) -> Result<u32, String> {
    let s = s.trim();
    let r = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(h) => u32::from_str_radix(&h.replace('_', ""), 16),
        None => s.replace('_', "").parse(),
    };
    r.map_err(|e| format!("invalid number '{s}': {e}"))
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parse_u32_accepts_hex_and_decimal() {
        assert_eq!(parse_u32("0x10000").unwrap(), 0x10000);
        assert_eq!(parse_u32("0X23_000000").unwrap(), 0x2300_0000);
        assert_eq!(parse_u32("4096").unwrap(), 4096);
        assert!(parse_u32("0xZZ").is_err());
    }

    #[test]
    fn flash_defaults_follow_protocol_constants() {
        let cli = Cli::try_parse_from(["blprog", "flash", "fw.bin", "--port", "/dev/ttyUSB0"])
            .unwrap();
        let Command::Flash(args) = cli.command else {
            panic!("expected flash");
        };
        assert_eq!(args.connect.handshake_attempts, 2);
        assert_eq!(args.connect.handshake_delay_ms, 2200);
        assert_eq!(args.chunk_size, 2048);
        assert_eq!(args.image.addr, 0);
    }

    #[test]
    fn erase_needs_range_or_chip() {
        assert!(Cli::try_parse_from(["blprog", "erase"]).is_err());
        assert!(Cli::try_parse_from(["blprog", "erase", "--chip"]).is_ok());
        assert!(Cli::try_parse_from(["blprog", "erase", "--start", "0x0", "--end", "0xFFF"]).is_ok());
        assert!(Cli::try_parse_from(["blprog", "erase", "--start", "0x0"]).is_err());
    }

    #[test]
    fn verify_command_cannot_skip() {
        assert!(Cli::try_parse_from(["blprog", "verify", "fw.bin", "--verify", "skip"]).is_err());
        assert!(Cli::try_parse_from(["blprog", "verify", "fw.bin", "--verify", "flash"]).is_ok());
    }
}
