// This file is part of LightNVR, a lightweight network video recorder.
// SPDX-License-Identifier: GPL-3.0-or-later

use base::Error;
use bpaf::{Bpaf, Parser};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use tracing::{debug, error};

mod cmds;
mod mp4;
mod normalize;
mod recorder;
mod segment;
mod stream;
mod supervisor;

const DEFAULT_DB_PATH: &str = "/var/lib/lightnvr/db.sqlite";

/// LightNVR: a lightweight network video recorder.
#[derive(Bpaf, Debug)]
#[bpaf(options, version)]
enum Args {
    // See docstrings of `cmds::*::Args` structs for a description of the
    // respective subcommands.
    #[bpaf(command)]
    Init(#[bpaf(external(cmds::init::args))] cmds::init::Args),
    #[bpaf(command)]
    Run(#[bpaf(external(cmds::run::args))] cmds::run::Args),
    #[bpaf(command)]
    Streams(#[bpaf(external(cmds::streams::args))] cmds::streams::Args),
}

impl Args {
    fn run(self) -> Result<i32, Error> {
        match self {
            Args::Init(a) => cmds::init::run(a),
            Args::Run(a) => cmds::run::run(a),
            Args::Streams(a) => cmds::streams::run(a),
        }
    }
}

fn parse_db_path() -> impl Parser<PathBuf> {
    bpaf::long("db")
        .help("Path of the SQLite catalog database.")
        .argument::<PathBuf>("PATH")
        .fallback(DEFAULT_DB_PATH.into())
        .debug_fallback()
}

fn main() {
    // If using the clock will fail, find out now *before* trying to log
    // anything (with timestamps...) so we can print a helpful error.
    if let Err(e) = nix::time::clock_gettime(nix::time::ClockId::CLOCK_MONOTONIC) {
        eprintln!(
            "clock_gettime failed: {e}\n\n\
             This indicates a broken environment."
        );
        std::process::exit(1);
    }

    base::tracing_setup::install();

    // Get the program name from the OS (e.g. if invoked as
    // `target/debug/lightnvr`: `lightnvr`), falling back to the crate name
    // if conversion to a path/UTF-8 string fails.
    let progname = std::env::args_os().next().map(PathBuf::from);
    let progname = progname
        .as_deref()
        .and_then(Path::file_name)
        .and_then(OsStr::to_str)
        .unwrap_or(env!("CARGO_PKG_NAME"));

    let args = match args()
        .fallback_to_usage()
        .run_inner(bpaf::Args::current_args().set_name(progname))
    {
        Ok(a) => a,
        Err(e) => std::process::exit(e.exit_code()),
    };
    tracing::trace!("Parsed command-line arguments: {args:#?}");

    match args.run() {
        Err(e) => {
            error!(err = %e.chain(), "exiting due to error");
            ::std::process::exit(1);
        }
        Ok(rv) => {
            debug!("exiting with status {rv}");
            std::process::exit(rv)
        }
    }
}
