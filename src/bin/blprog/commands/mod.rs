use blprog::api::OpError;
use blprog::operation::OperationEvent;

use crate::exit_codes;
use crate::output::{Event, OperationRecorder, Reporter};

pub mod erase;
pub mod flash;
pub mod info;
pub mod list;
pub mod reset;
pub mod verify;

/// Runs one library operation, forwarding its events to `out` and closing
/// with an error line (if any) and the operation summary.
pub(crate) fn run_operation<F>(name: &'static str, out: &mut dyn Reporter, op: F) -> i32
where
    F: FnOnce(&mut dyn FnMut(OperationEvent)) -> Result<(), OpError>,
{
    let mut rec = OperationRecorder::new(name);
    let r = op(&mut |ev: OperationEvent| {
        rec.observe(&ev);
        out.emit(Event::Operation(ev));
    });
    finish(rec, r, out)
}

pub(crate) fn finish(rec: OperationRecorder, r: Result<(), OpError>, out: &mut dyn Reporter) -> i32 {
    let (code, message) = match r {
        Ok(()) => (exit_codes::EXIT_OK, None),
        Err(e) => {
            let code = exit_codes::for_kind(e.kind());
            let message = e.to_string();
            out.emit(Event::Error {
                code,
                message: message.clone(),
            });
            if code == exit_codes::EXIT_AMBIGUOUS {
                out.emit(Event::HintAmbiguousTargets);
            }
            (code, Some(message))
        }
    };

    out.emit(Event::OperationSummary(rec.finish(code, message)));
    code
}
