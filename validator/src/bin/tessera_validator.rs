//! The validator subprocess entry point. Invoked by the node as
//! `tessera_validator --socket-dir <dir>`; connects back over the Unix
//! socket whose name carries the parent pid.

use std::{path::PathBuf, process::ExitCode};

use tessera_validator::external::child;

fn parse_socket_dir() -> Option<PathBuf> {
    let mut args = std::env::args_os().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--socket-dir" {
            return args.next().map(PathBuf::from);
        }
    }
    None
}

fn main() -> ExitCode {
    let _ = tessera_logger::init(&tessera_logger::Config::default());

    let Some(socket_dir) = parse_socket_dir() else {
        eprintln!("usage: tessera_validator --socket-dir <dir>");
        return ExitCode::from(2);
    };

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            eprintln!("failed to start the validator runtime: {error}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(child::run(&socket_dir)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("validator subprocess failed: {error}");
            ExitCode::FAILURE
        }
    }
}
