use blprog::api;

use crate::cli;
use crate::commands::run_operation;
use crate::context;
use crate::output::Reporter;

pub fn run(args: cli::VerifyArgs, out: &mut dyn Reporter) -> i32 {
    let opts = context::verify_opts(&args);
    let source = context::verify_source(args.verify);
    let selection = context::selection(&args.connect);

    run_operation("verify", out, |on_event| {
        api::verify_with_selection(&args.image.image, &opts, source, selection, on_event)
    })
}
