use std::collections::BTreeMap;
use std::time::Instant;

use blprog::operation::{self, OperationEvent, VerifySource};
use blprog::targets;

use crate::output::{
    target_to_value, DryRunSummary, Event, JsonProgressMode, OperationSummary, OutputOptions,
    PlannedErase, Reporter,
};

#[derive(serde::Serialize)]
pub struct JsonEvent {
    schema: u32,
    event: &'static str,
    #[serde(flatten)]
    fields: BTreeMap<&'static str, serde_json::Value>,
}

impl JsonEvent {
    pub fn status(event: &'static str) -> Self {
        Self {
            schema: 1,
            event,
            fields: BTreeMap::new(),
        }
    }

    pub fn with_u64(mut self, k: &'static str, v: u64) -> Self {
        self.fields.insert(k, serde_json::Value::from(v));
        self
    }

    pub fn with_bool(mut self, k: &'static str, v: bool) -> Self {
        self.fields.insert(k, serde_json::Value::from(v));
        self
    }

    pub fn with_str(mut self, k: &'static str, v: &str) -> Self {
        self.fields.insert(k, serde_json::Value::from(v));
        self
    }

    pub fn with_value(mut self, k: &'static str, v: serde_json::Value) -> Self {
        self.fields.insert(k, v);
        self
    }
}

pub struct JsonOutput {
    opts: OutputOptions,
    start: Instant,
    last_percent: Option<u64>,
}

impl JsonOutput {
    pub fn new(opts: OutputOptions) -> Self {
        Self {
            opts,
            start: Instant::now(),
            last_percent: None,
        }
    }

    pub(crate) fn render_event_json(&mut self, ev: JsonEvent) -> String {
        let mut ev = ev;
        if self.opts.json_timestamps {
            ev.fields.insert(
                "t_ms",
                serde_json::Value::from(self.start.elapsed().as_millis() as u64),
            );
        }
        serde_json::to_string(&ev).unwrap_or_else(|_| "{}".to_string())
    }

    fn json_event(&mut self, ev: JsonEvent) {
        println!("{}", self.render_event_json(ev));
    }

    fn error_event(&mut self, code: i32, msg: &str) {
        self.json_event(
            JsonEvent::status("error")
                .with_u64("code", code.max(0) as u64)
                .with_str("message", msg),
        );

        if self.opts.verbose {
            eprintln!("error: {msg}");
        }
    }

    /// Whether a chunk event passes the configured progress throttle.
    pub(crate) fn should_emit_chunk(&mut self, index: usize, total: usize, percent: u64) -> bool {
        match self.opts.json_progress {
            JsonProgressMode::Chunks => true,
            JsonProgressMode::None => false,
            JsonProgressMode::Percent => {
                let emit = index == 0
                    || index + 1 == total
                    || self.last_percent.map(|p| p != percent).unwrap_or(true);
                if emit {
                    self.last_percent = Some(percent);
                }
                emit
            }
        }
    }

    fn emit_operation(&mut self, ev: OperationEvent) {
        match &ev {
            OperationEvent::TargetStart { .. } => {
                self.last_percent = None;
            }
            OperationEvent::Chunk { .. } => {
                if self.opts.json_progress != JsonProgressMode::Chunks {
                    return;
                }
            }
            OperationEvent::ChunkWritten {
                index,
                total,
                done,
                bytes,
                ..
            } => {
                let percent = operation::percent(*done, *bytes);
                if !self.should_emit_chunk(*index, *total, percent) {
                    return;
                }
            }
            _ => {}
        }

        self.json_event(operation_event_to_json(ev));
    }
}

impl Reporter for JsonOutput {
    fn emit(&mut self, event: Event) {
        match event {
            Event::Operation(ev) => self.emit_operation(ev),
            Event::OperationSummary(summary) => {
                self.json_event(operation_summary_to_json(summary));
            }
            Event::DryRun(summary) => self.json_event(dry_run_to_json(summary)),
            Event::ListTargets(targets) => self.json_event(list_to_json(&targets)),
            Event::Error { code, message } => self.error_event(code, &message),
            Event::HintAmbiguousTargets => {}
        }
    }

    fn finish(&mut self) {}
}

pub fn list_to_json(targets: &[targets::Target]) -> JsonEvent {
    JsonEvent::status("list")
        .with_u64("count", targets.len() as u64)
        .with_value(
            "targets",
            serde_json::Value::Array(
                targets
                    .iter()
                    .enumerate()
                    .map(|(i, t)| target_to_value(i, t))
                    .collect(),
            ),
        )
}

pub fn dry_run_to_json(summary: DryRunSummary) -> JsonEvent {
    let mut ev = JsonEvent::status("dry_run");
    ev = match summary.erase {
        PlannedErase::Range { start, end } => ev
            .with_str("erase", "range")
            .with_u64("erase_start", start as u64)
            .with_u64("erase_end", end as u64),
        PlannedErase::Chip => ev.with_str("erase", "chip"),
        PlannedErase::Skip => ev.with_str("erase", "skip"),
    };

    ev.with_u64("bytes", summary.bytes as u64)
        .with_u64("address", summary.address as u64)
        .with_str("sha256", &summary.sha256)
        .with_u64("chunks", summary.chunks as u64)
        .with_u64("targets", summary.target_ids.len() as u64)
        .with_value(
            "target_ids",
            serde_json::Value::Array(
                summary
                    .target_ids
                    .into_iter()
                    .map(serde_json::Value::from)
                    .collect(),
            ),
        )
}

pub fn operation_summary_to_json(summary: OperationSummary) -> JsonEvent {
    let OperationSummary {
        operation,
        exit_code,
        message,
        targets_ok,
        targets_failed,
        chunks,
        bytes_written,
        retries,
        handshake_attempts,
        verified,
    } = summary;

    let total = targets_ok.len() + targets_failed.len();

    let mut ev = JsonEvent::status("operation_summary")
        .with_str("operation", operation)
        .with_bool("ok", exit_code == 0)
        .with_u64("exit_code", exit_code.max(0) as u64)
        .with_u64("targets_total", total as u64)
        .with_u64("targets_ok", targets_ok.len() as u64)
        .with_u64("targets_failed", targets_failed.len() as u64)
        .with_u64("chunks", chunks)
        .with_u64("bytes_written", bytes_written)
        .with_u64("retries", retries)
        .with_u64("handshake_attempts", handshake_attempts)
        .with_u64("verified", verified)
        .with_value(
            "targets_ok_ids",
            serde_json::Value::Array(targets_ok.into_iter().map(Into::into).collect()),
        )
        .with_value(
            "targets_failed_ids",
            serde_json::Value::Array(targets_failed.into_iter().map(Into::into).collect()),
        );

    if let Some(msg) = &message {
        ev = ev.with_str("message", msg);
    }

    ev
}

fn verify_source_str(source: VerifySource) -> &'static str {
    match source {
        VerifySource::Xip => "xip",
        VerifySource::Flash => "flash",
    }
}

pub fn operation_event_to_json(ev: OperationEvent) -> JsonEvent {
    match ev {
        OperationEvent::DiscoverStart => JsonEvent::status("discover_start"),
        OperationEvent::TargetDetected { index, target } => JsonEvent::status("target_detected")
            .with_value("target", target_to_value(index, &target)),
        OperationEvent::DiscoverDone { count } => {
            JsonEvent::status("discover_done").with_u64("count", count as u64)
        }
        OperationEvent::TargetSelected { target_id } => {
            JsonEvent::status("target_selected").with_str("target_id", &target_id)
        }
        OperationEvent::ImageLoaded {
            bytes,
            address,
            sha256,
        } => JsonEvent::status("image_loaded")
            .with_u64("bytes", bytes as u64)
            .with_u64("address", address as u64)
            .with_str("sha256", &sha256),
        OperationEvent::TargetStart { target_id } => {
            JsonEvent::status("target_start").with_str("target_id", &target_id)
        }
        OperationEvent::TargetDone {
            target_id,
            ok,
            message,
        } => {
            let mut ev = JsonEvent::status("target_done")
                .with_str("target_id", &target_id)
                .with_bool("ok", ok);
            if let Some(m) = &message {
                ev = ev.with_str("message", m);
            }
            ev
        }
        OperationEvent::PortOpen {
            target_id,
            port,
            baud,
        } => JsonEvent::status("port_open")
            .with_str("target_id", &target_id)
            .with_str("port", &port)
            .with_u64("baud", baud as u64),
        OperationEvent::BootPins { target_id } => {
            JsonEvent::status("boot_pins").with_str("target_id", &target_id)
        }
        OperationEvent::HandshakeAttempt {
            target_id,
            attempt,
            attempts,
        } => JsonEvent::status("handshake_attempt")
            .with_str("target_id", &target_id)
            .with_u64("attempt", attempt as u64)
            .with_u64("attempts", attempts as u64),
        OperationEvent::HandshakeOk { target_id, attempt } => JsonEvent::status("handshake_ok")
            .with_str("target_id", &target_id)
            .with_u64("attempt", attempt as u64),
        OperationEvent::BootInfo { target_id, info } => JsonEvent::status("boot_info")
            .with_str("target_id", &target_id)
            .with_u64("bootrom_version", info.bootrom_version as u64)
            .with_str("chip_info", &info.chip_info),
        OperationEvent::JedecId { target_id, id } => {
            let mut ev = JsonEvent::status("jedec_id")
                .with_str("target_id", &target_id)
                .with_u64("manufacturer", id.manufacturer as u64)
                .with_u64("memory_type", id.memory_type as u64)
                .with_u64("capacity", id.capacity as u64);
            if let Some(size) = id.flash_size() {
                ev = ev.with_u64("flash_size", size as u64);
            }
            ev
        }
        OperationEvent::EraseStart {
            target_id,
            start,
            end,
            chip,
        } => JsonEvent::status("erase_start")
            .with_str("target_id", &target_id)
            .with_u64("start", start as u64)
            .with_u64("end", end as u64)
            .with_bool("chip", chip),
        OperationEvent::EraseDone {
            target_id,
            elapsed_ms,
        } => JsonEvent::status("erase_done")
            .with_str("target_id", &target_id)
            .with_u64("elapsed_ms", elapsed_ms),
        OperationEvent::Chunk {
            target_id,
            index,
            total,
            addr,
            len,
            written,
            bytes,
        } => JsonEvent::status("chunk")
            .with_str("target_id", &target_id)
            .with_u64("i", index as u64)
            .with_u64("n", total as u64)
            .with_u64("addr", addr as u64)
            .with_u64("len", len as u64)
            .with_u64("percent", operation::percent(written, bytes)),
        OperationEvent::ChunkWritten {
            target_id,
            index,
            total,
            addr,
            len,
            done,
            bytes,
        } => JsonEvent::status("chunk_written")
            .with_str("target_id", &target_id)
            .with_u64("i", index as u64)
            .with_u64("n", total as u64)
            .with_u64("addr", addr as u64)
            .with_u64("len", len as u64)
            .with_u64("done", done as u64)
            .with_u64("percent", operation::percent(done, bytes)),
        OperationEvent::Retry {
            target_id,
            addr,
            attempt,
            retries,
            error,
        } => JsonEvent::status("retry")
            .with_str("target_id", &target_id)
            .with_u64("addr", addr as u64)
            .with_u64("attempt", attempt as u64)
            .with_u64("retries", retries as u64)
            .with_str("error", &error),
        OperationEvent::WriteCheck { target_id } => {
            JsonEvent::status("write_check").with_str("target_id", &target_id)
        }
        OperationEvent::VerifyStart { target_id, source } => JsonEvent::status("verify_start")
            .with_str("target_id", &target_id)
            .with_str("source", verify_source_str(source)),
        OperationEvent::Verified { target_id, sha256 } => JsonEvent::status("verified")
            .with_str("target_id", &target_id)
            .with_str("sha256", &sha256),
        OperationEvent::Reset { target_id } => {
            JsonEvent::status("reset").with_str("target_id", &target_id)
        }
        OperationEvent::Done { target_id } => {
            JsonEvent::status("done").with_str("target_id", &target_id)
        }
    }
}
