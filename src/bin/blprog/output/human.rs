use std::io::{IsTerminal, Write};

use blprog::operation::{self, OperationEvent};
use blprog::targets;

use crate::output::{
    format_target_line, DryRunSummary, Event, OutputOptions, PlannedErase, Reporter,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Quiet,
    Verbose,
    Progress,
}

pub struct HumanOutput {
    opts: OutputOptions,
    is_tty: bool,
    wait_enabled: bool,
    waiting_printed: bool,
    progress_active: bool,
    last_percent: Option<u64>,
    detected: Vec<Option<targets::Target>>,
}

impl HumanOutput {
    pub fn new(opts: OutputOptions) -> Self {
        Self {
            opts,
            is_tty: std::io::stderr().is_terminal(),
            wait_enabled: false,
            waiting_printed: false,
            progress_active: false,
            last_percent: None,
            detected: Vec::new(),
        }
    }

    pub fn with_wait(mut self, wait: bool) -> Self {
        self.wait_enabled = wait;
        self
    }

    fn mode(&self) -> Mode {
        if self.opts.quiet {
            Mode::Quiet
        } else if self.opts.verbose {
            Mode::Verbose
        } else {
            Mode::Progress
        }
    }

    fn remember_target(&mut self, index: usize, target: targets::Target) {
        if self.detected.len() <= index {
            self.detected.resize_with(index + 1, || None);
        }
        self.detected[index] = Some(target);
    }

    fn finish_line(&mut self) {
        if self.progress_active {
            eprintln!();
            self.progress_active = false;
        }
    }

    fn println(&mut self, msg: &str) {
        if self.mode() == Mode::Quiet {
            return;
        }
        self.finish_line();
        eprintln!("{msg}");
    }

    fn progress_update(&mut self, percent: u64, done: usize, bytes: usize, addr: u32) {
        if self.mode() != Mode::Progress {
            return;
        }

        if self.is_tty {
            eprint!("\r  writing {percent:3}% ({done}/{bytes} bytes) @ 0x{addr:08X}");
            let _ = std::io::stderr().flush();
            self.progress_active = true;
            self.last_percent = Some(percent);
            return;
        }

        let last = self.last_percent;
        if last.is_none() || percent == 100 || percent >= last.unwrap_or(0) + 10 {
            self.last_percent = Some(percent);
            self.println(&format!("  writing {percent:3}% ({done}/{bytes} bytes)"));
        }
    }

    pub(crate) fn ambiguous_help_lines(detected: &[Option<targets::Target>]) -> Vec<String> {
        detected
            .iter()
            .enumerate()
            .filter_map(|(i, t)| t.as_ref().map(|t| format_target_line(i, t)))
            .collect()
    }

    fn print_ambiguous_help(&mut self) {
        if self.mode() == Mode::Quiet {
            return;
        }

        let lines = Self::ambiguous_help_lines(&self.detected);
        if lines.is_empty() {
            return;
        }

        self.println("");
        self.println("Detected ports:");
        for line in lines {
            self.println(&line);
        }
        self.println(
            "\nHint: use --port <name>, --device index:<n> (e.g. index:0), or --all, or run `blprog list`.",
        );
    }

    fn on_operation_event(&mut self, ev: OperationEvent) {
        let mode = self.mode();
        match ev {
            OperationEvent::DiscoverStart => {
                if mode == Mode::Verbose {
                    self.println("discover serial ports...");
                }
            }
            OperationEvent::TargetDetected { index, target } => {
                let line = format_target_line(index, &target);
                self.remember_target(index, target);
                if mode == Mode::Verbose {
                    self.println(&line);
                }
            }
            OperationEvent::DiscoverDone { count } => {
                if mode == Mode::Progress
                    && count == 0
                    && self.wait_enabled
                    && !self.waiting_printed
                {
                    self.println("waiting for serial port... (use --wait-timeout-ms to limit)");
                    self.waiting_printed = true;
                }
            }
            OperationEvent::TargetSelected { target_id } => {
                self.println(&format!("selected: {target_id}"));
            }
            OperationEvent::ImageLoaded {
                bytes,
                address,
                sha256,
            } => {
                self.println(&format!("image: {bytes} bytes @ 0x{address:08X}"));
                if mode == Mode::Verbose {
                    self.println(&format!("  sha256 {sha256}"));
                }
            }
            OperationEvent::TargetStart { target_id } => {
                if mode == Mode::Verbose {
                    self.println(&format!("target start: {target_id}"));
                }
                self.last_percent = None;
            }
            OperationEvent::TargetDone {
                target_id,
                ok,
                message,
            } => {
                self.finish_line();
                if ok {
                    self.println(&format!("ok: {target_id}"));
                } else {
                    self.println(&format!(
                        "failed: {target_id}: {}",
                        message.unwrap_or_default()
                    ));
                }
            }
            OperationEvent::PortOpen { port, baud, .. } => {
                if mode == Mode::Verbose {
                    self.println(&format!("open {port} @ {baud} baud"));
                }
            }
            OperationEvent::BootPins { .. } => {
                if mode == Mode::Verbose {
                    self.println("boot pins: BOOT held across reset (DTR/RTS)");
                }
            }
            OperationEvent::HandshakeAttempt {
                attempt, attempts, ..
            } => {
                if mode == Mode::Verbose || attempt > 1 {
                    self.println(&format!("handshake {attempt}/{attempts}..."));
                }
            }
            OperationEvent::HandshakeOk { .. } => {
                if mode == Mode::Verbose {
                    self.println("handshake ok");
                }
            }
            OperationEvent::BootInfo { info, .. } => {
                self.println(&format!(
                    "boot ROM version: 0x{:08X}",
                    info.bootrom_version
                ));
                if mode == Mode::Verbose || !info.chip_info.is_empty() {
                    self.println(&format!("chip info: {}", info.chip_info));
                }
            }
            OperationEvent::JedecId { id, .. } => {
                let size = id
                    .flash_size()
                    .map(|s| format!(" ({} KiB)", s / 1024))
                    .unwrap_or_default();
                self.println(&format!(
                    "flash JEDEC id: {:02X} {:02X} {:02X}{size}",
                    id.manufacturer, id.memory_type, id.capacity
                ));
            }
            OperationEvent::EraseStart {
                start, end, chip, ..
            } => {
                if chip {
                    self.println("erasing chip...");
                } else {
                    self.println(&format!("erasing 0x{start:08X}..=0x{end:08X}..."));
                }
            }
            OperationEvent::EraseDone { elapsed_ms, .. } => {
                if mode == Mode::Verbose {
                    self.println(&format!("erase done in {elapsed_ms}ms"));
                }
            }
            OperationEvent::Chunk {
                index,
                total,
                addr,
                len,
                ..
            } => {
                if mode == Mode::Verbose {
                    self.println(&format!(
                        "write chunk {}/{} @ 0x{addr:08X} ({len} bytes)",
                        index + 1,
                        total
                    ));
                }
            }
            OperationEvent::ChunkWritten {
                addr, done, bytes, ..
            } => {
                self.progress_update(operation::percent(done, bytes), done, bytes, addr);
            }
            OperationEvent::Retry {
                addr,
                attempt,
                retries,
                error,
                ..
            } => {
                self.println(&format!(
                    "retry write at 0x{addr:08X} ({attempt}/{retries}): {error}"
                ));
            }
            OperationEvent::WriteCheck { .. } => {
                if mode == Mode::Verbose {
                    self.println("write check ok");
                }
            }
            OperationEvent::VerifyStart { source, .. } => {
                if mode == Mode::Verbose {
                    self.println(&format!("verify sha256 ({source:?})..."));
                }
            }
            OperationEvent::Verified { sha256, .. } => {
                self.println(&format!("verified sha256 {sha256}"));
            }
            OperationEvent::Reset { .. } => {
                self.println("resetting device...");
            }
            OperationEvent::Done { .. } => {
                self.finish_line();
            }
        }
    }
}

impl Reporter for HumanOutput {
    fn emit(&mut self, event: Event) {
        match event {
            Event::Operation(ev) => self.on_operation_event(ev),
            Event::OperationSummary(summary) => {
                if self.mode() == Mode::Verbose {
                    self.println(&format!(
                        "{}: {} ok, {} failed, {} chunks, {} retries",
                        summary.operation,
                        summary.targets_ok.len(),
                        summary.targets_failed.len(),
                        summary.chunks,
                        summary.retries
                    ));
                }
            }
            Event::DryRun(summary) => emit_dry_run(summary, self),
            Event::ListTargets(targets) => emit_list_targets(&targets, self),
            Event::Error { code: _, message } => {
                self.finish_line();
                eprintln!("error: {message}");
            }
            Event::HintAmbiguousTargets => self.print_ambiguous_help(),
        }
    }

    fn finish(&mut self) {
        self.finish_line();
    }
}

fn emit_list_targets(targets: &[targets::Target], out: &mut HumanOutput) {
    if targets.is_empty() {
        out.println("No serial ports found");
        return;
    }

    for (i, t) in targets.iter().enumerate() {
        out.println(&format_target_line(i, t));
    }
}

fn emit_dry_run(summary: DryRunSummary, out: &mut HumanOutput) {
    if out.mode() == Mode::Quiet {
        return;
    }

    out.println("Dry run OK");
    out.println(&format!(
        "Image: {} bytes @ 0x{:08X}, {} chunks, sha256 {}",
        summary.bytes, summary.address, summary.chunks, summary.sha256
    ));
    match summary.erase {
        PlannedErase::Range { start, end } => {
            out.println(&format!("Erase: 0x{start:08X}..=0x{end:08X}"));
        }
        PlannedErase::Chip => out.println("Erase: whole chip"),
        PlannedErase::Skip => out.println("Erase: skipped"),
    }
    out.println(&format!("Targets: {}", summary.target_ids.len()));
    for id in &summary.target_ids {
        out.println(&format!("- {id}"));
    }
}
