use std::fs::File;
use std::io;
use std::thread;

use log::debug;

use subproc::cli::Cli;
use subproc::{ExitStatus, StdStream, Subprocess};

fn main() {
    env_logger::init();
    std::process::exit(run());
}

fn run() -> i32 {
    let args = Cli::parse_args();

    if let Err(e) = args.validate() {
        eprintln!("subproc: {}", e);
        eprintln!("Use \"subproc -h\" to get help");
        return e.exit_code();
    }

    let opts = args.spawn_options();
    let mut child = match Subprocess::spawn(&args.command, &opts) {
        Ok(child) => child,
        Err(e) => {
            eprintln!("subproc: {}", e);
            return e.exit_code();
        }
    };
    debug!("running {} as pid {}", args.command[0], child.pid());

    // Piped child streams are pumped through this process on plain
    // threads; the output pumps are joined so nothing buffered is lost.
    let mut output_pumps = Vec::new();
    if let Some(fd) = child.take_pipe(StdStream::Stdout) {
        output_pumps.push(thread::spawn(move || pump(File::from(fd), io::stdout())));
    }
    if let Some(fd) = child.take_pipe(StdStream::Stderr) {
        output_pumps.push(thread::spawn(move || pump(File::from(fd), io::stderr())));
    }
    if let Some(fd) = child.take_pipe(StdStream::Stdin) {
        // Never joined: a read from our stdin can outlive the child, and
        // process exit tears the thread down.
        thread::spawn(move || pump(io::stdin(), File::from(fd)));
    }

    let status = match child.wait() {
        Ok(status) => status,
        Err(e) => {
            eprintln!("subproc: {}", e);
            return e.exit_code();
        }
    };

    for handle in output_pumps {
        let _ = handle.join();
    }
    exit_code_for(status)
}

/// Copy bytes until EOF, swallowing errors; a broken pipe just ends the
/// stream early.
fn pump<R: io::Read, W: io::Write>(mut from: R, mut to: W) {
    let _ = io::copy(&mut from, &mut to);
}

fn exit_code_for(status: ExitStatus) -> i32 {
    match status {
        ExitStatus::Exited(code) => code,
        // Shell convention for signal deaths.
        ExitStatus::Signaled(signal) => 128 + signal as i32,
    }
}
