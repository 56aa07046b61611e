use crate::cli;

use blprog::{operation::OperationEvent, targets};

pub mod human;
pub mod json;


#[derive(Debug, Clone, Copy)]
pub struct OutputOptions {
    pub verbose: bool,
    pub quiet: bool,
    pub json_timestamps: bool,
    pub json_progress: JsonProgressMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JsonProgressMode {
    Chunks,
    Percent,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlannedErase {
    Range { start: u32, end: u32 },
    Chip,
    Skip,
}

#[derive(Debug, Clone)]
pub struct DryRunSummary {
    pub bytes: usize,
    pub address: u32,
    pub sha256: String,
    pub chunks: usize,
    pub erase: PlannedErase,
    pub target_ids: Vec<String>,
}

#[derive(Debug, Clone)]
pub enum Event {
    Operation(OperationEvent),
    OperationSummary(OperationSummary),
    DryRun(DryRunSummary),
    ListTargets(Vec<targets::Target>),
    Error { code: i32, message: String },
    HintAmbiguousTargets,
}

#[derive(Debug, Clone)]
pub struct OperationSummary {
    pub operation: &'static str,
    pub exit_code: i32,
    pub message: Option<String>,

    pub targets_ok: Vec<String>,
    pub targets_failed: Vec<String>,

    pub chunks: u64,
    pub bytes_written: u64,
    pub retries: u64,
    pub handshake_attempts: u64,
    pub verified: u64,
}

pub struct OperationRecorder {
    operation: &'static str,
    targets_ok: Vec<String>,
    targets_failed: Vec<String>,
    chunks: u64,
    bytes_written: u64,
    retries: u64,
    handshake_attempts: u64,
    verified: u64,
}

impl OperationRecorder {
    pub fn new(operation: &'static str) -> Self {
        Self {
            operation,
            targets_ok: Vec::new(),
            targets_failed: Vec::new(),
            chunks: 0,
            bytes_written: 0,
            retries: 0,
            handshake_attempts: 0,
            verified: 0,
        }
    }

    pub fn observe(&mut self, ev: &OperationEvent) {
        match ev {
            OperationEvent::TargetDone { target_id, ok, .. } => {
                if *ok {
                    self.targets_ok.push(target_id.clone());
                } else {
                    self.targets_failed.push(target_id.clone());
                }
            }
            OperationEvent::HandshakeAttempt { .. } => {
                self.handshake_attempts = self.handshake_attempts.saturating_add(1);
            }
            OperationEvent::ChunkWritten { len, .. } => {
                self.chunks = self.chunks.saturating_add(1);
                self.bytes_written = self.bytes_written.saturating_add(*len as u64);
            }
            OperationEvent::Retry { .. } => {
                self.retries = self.retries.saturating_add(1);
            }
            OperationEvent::Verified { .. } => {
                self.verified = self.verified.saturating_add(1);
            }
            _ => {}
        }
    }

    pub fn finish(self, exit_code: i32, message: Option<String>) -> OperationSummary {
        OperationSummary {
            operation: self.operation,
            exit_code,
            message,
            targets_ok: self.targets_ok,
            targets_failed: self.targets_failed,
            chunks: self.chunks,
            bytes_written: self.bytes_written,
            retries: self.retries,
            handshake_attempts: self.handshake_attempts,
            verified: self.verified,
        }
    }
}

pub trait Reporter {
    fn emit(&mut self, event: Event);
    fn finish(&mut self);
}

fn options(args: &cli::OutputArgs, json_progress: JsonProgressMode) -> OutputOptions {
    OutputOptions {
        verbose: args.verbose,
        quiet: args.quiet,
        json_timestamps: args.json_timestamps,
        json_progress,
    }
}

pub fn make(args: &cli::OutputArgs, json_progress: JsonProgressMode) -> Box<dyn Reporter> {
    let opts = options(args, json_progress);
    if args.json {
        Box::new(json::JsonOutput::new(opts))
    } else {
        Box::new(human::HumanOutput::new(opts))
    }
}

pub fn make_for_flash(args: &cli::FlashArgs) -> Box<dyn Reporter> {
    let json_progress = match args.json_progress {
        cli::JsonProgressArg::Chunks => JsonProgressMode::Chunks,
        cli::JsonProgressArg::Percent => JsonProgressMode::Percent,
        cli::JsonProgressArg::None => JsonProgressMode::None,
    };
    let opts = options(&args.output, json_progress);
    if args.output.json {
        Box::new(json::JsonOutput::new(opts))
    } else {
        Box::new(human::HumanOutput::new(opts).with_wait(args.connect.wait))
    }
}

pub fn make_for_list(args: &cli::ListArgs) -> Box<dyn Reporter> {
    let opts = OutputOptions {
        verbose: false,
        quiet: false,
        json_timestamps: false,
        json_progress: JsonProgressMode::None,
    };
    if args.json {
        Box::new(json::JsonOutput::new(opts))
    } else {
        Box::new(human::HumanOutput::new(opts))
    }
}

pub fn target_to_value(index: usize, t: &targets::Target) -> serde_json::Value {
    let mut v = serde_json::to_value(t)
        .unwrap_or_else(|_| serde_json::Value::Object(serde_json::Map::new()));
    if let serde_json::Value::Object(obj) = &mut v {
        obj.insert("index".to_string(), serde_json::Value::from(index as u64));
        obj.insert("target_id".to_string(), serde_json::Value::from(t.id()));
    }
    v
}

pub fn format_target_line(index: usize, t: &targets::Target) -> String {
    let ids = match (t.vid, t.pid) {
        (Some(vid), Some(pid)) => format!(" {vid:04X}:{pid:04X}"),
        _ => String::new(),
    };
    let bridge = t.bridge.map(|b| format!(" [{}]", b.label())).unwrap_or_default();
    let product = t
        .product
        .as_deref()
        .map(|p| format!(" {p}"))
        .unwrap_or_default();
    format!("[{index}] {}{ids}{bridge}{product}", t.id())
}
