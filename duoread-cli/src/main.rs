use std::process::ExitCode;

use clap::Parser;
use duoread_lib::cli::Args;

fn main() -> ExitCode {
    let args = Args::parse();
    duoread_lib::run(args)
}
