use std::process;

use clap::Parser;

mod cli;
mod commands;
mod context;
mod exit_codes;
mod logging;
mod output;

fn main() {
    logging::init_tracing();

    let cli = cli::Cli::parse();

    let exit_code = match cli.command {
        cli::Command::Flash(args) => {
            let mut out = output::make_for_flash(&args);
            let code = commands::flash::run(args, &mut *out);
            out.finish();
            code
        }
        cli::Command::Verify(args) => {
            let mut out = output::make(&args.output, output::JsonProgressMode::None);
            let code = commands::verify::run(args, &mut *out);
            out.finish();
            code
        }
        cli::Command::Erase(args) => {
            let mut out = output::make(&args.output, output::JsonProgressMode::None);
            let code = commands::erase::run(args, &mut *out);
            out.finish();
            code
        }
        cli::Command::Info(args) => {
            let mut out = output::make(&args.output, output::JsonProgressMode::None);
            let code = commands::info::run(args, &mut *out);
            out.finish();
            code
        }
        cli::Command::Reset(args) => {
            let mut out = output::make(&args.output, output::JsonProgressMode::None);
            let code = commands::reset::run(args, &mut *out);
            out.finish();
            code
        }
        cli::Command::List(args) => {
            let mut out = output::make_for_list(&args);
            let code = commands::list::run(args, &mut *out);
            out.finish();
            code
        }
    };

    process::exit(exit_code);
}
