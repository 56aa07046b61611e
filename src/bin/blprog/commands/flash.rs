use blprog::api;

use crate::cli;
use crate::commands::{finish, run_operation};
use crate::context;
use crate::output::{DryRunSummary, Event, OperationRecorder, PlannedErase, Reporter};

pub fn run(args: cli::FlashArgs, out: &mut dyn Reporter) -> i32 {
    let opts = context::flash_opts(&args);
    let selection = context::selection(&args.connect);

    if args.dry_run {
        return dry_run(&args, &opts, selection, out);
    }

    run_operation("flash", out, |on_event| {
        api::flash_with_selection(&args.image.image, &opts, selection, on_event)
    })
}

fn dry_run(
    args: &cli::FlashArgs,
    opts: &api::FlashOptions,
    selection: api::Selection,
    out: &mut dyn Reporter,
) -> i32 {
    let mut rec = OperationRecorder::new("flash");
    let r = api::plan_with_selection(&args.image.image, opts, selection, |ev| {
        rec.observe(&ev);
        out.emit(Event::Operation(ev));
    });

    let r = r.map(|plan| out.emit(Event::DryRun(dry_run_summary(&plan, opts))));
    finish(rec, r, out)
}

fn dry_run_summary(plan: &api::FlashPlan, opts: &api::FlashOptions) -> DryRunSummary {
    let fw = &plan.firmware;
    let erase = match opts.erase {
        api::EraseMode::Range => {
            let (start, end) = fw.erase_range();
            PlannedErase::Range { start, end }
        }
        api::EraseMode::Chip => PlannedErase::Chip,
        api::EraseMode::Skip => PlannedErase::Skip,
    };

    DryRunSummary {
        bytes: fw.len(),
        address: fw.address,
        sha256: fw.sha256_hex(),
        chunks: fw.chunks(opts.chunk_size).count(),
        erase,
        target_ids: plan.selected_targets.iter().map(|t| t.id()).collect(),
    }
}
