use std::process::ExitCode;

use clap::Parser;

use strata::{cli, logger};

fn main() -> ExitCode {
    logger::init();
    let args = cli::CliArgs::parse();
    cli::run(args)
}
