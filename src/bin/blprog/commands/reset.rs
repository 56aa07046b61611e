use blprog::api;

use crate::cli;
use crate::commands::run_operation;
use crate::context;
use crate::output::Reporter;

pub fn run(args: cli::SessionArgs, out: &mut dyn Reporter) -> i32 {
    let opts = context::connect_opts(&args.connect);
    let selection = context::selection(&args.connect);

    run_operation("reset", out, |on_event| {
        api::reset_with_selection(&opts, selection, on_event)
    })
}
