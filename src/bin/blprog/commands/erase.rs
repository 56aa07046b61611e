use blprog::api;

use crate::cli;
use crate::commands::run_operation;
use crate::context;
use crate::output::Reporter;

pub fn run(args: cli::EraseArgs, out: &mut dyn Reporter) -> i32 {
    let opts = context::connect_opts(&args.connect);
    let selection = context::selection(&args.connect);
    let range = if args.chip {
        None
    } else {
        args.start.zip(args.end)
    };

    run_operation("erase", out, |on_event| {
        api::erase_with_selection(range, args.flash_size, &opts, selection, on_event)
    })
}
