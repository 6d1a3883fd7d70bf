use std::fs::File;
use std::io::{ErrorKind, Read, Write};
use std::os::fd::FromRawFd;

use clap::Parser;

/// Tee for pipes and fds: read one stream, replicate it to every output fd.
#[derive(Parser, Debug)]
#[command(
    name = "ptee",
    version,
    about = "Replicate bytes from one fd to a set of fds"
)]
struct Cli {
    /// Fd to read from
    #[arg(short = 'r', value_name = "FD", default_value_t = 0)]
    read_fd: i32,

    /// Fds to write to
    #[arg(required = true, value_name = "FD")]
    out_fds: Vec<i32>,
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            std::process::exit(if err.use_stderr() { 1 } else { 0 });
        }
    };

    // SAFETY: the fds were handed over on the command line; this process
    // owns them from here on.
    let mut input = unsafe { File::from_raw_fd(cli.read_fd) };
    let mut outputs: Vec<Option<File>> = cli
        .out_fds
        .iter()
        .map(|&fd| Some(unsafe { File::from_raw_fd(fd) }))
        .collect();

    let mut buffer = [0u8; 4096];
    loop {
        let count = match input.read(&mut buffer) {
            Ok(0) => break,
            Ok(count) => count,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(_) => break,
        };
        for slot in outputs.iter_mut() {
            if let Some(output) = slot {
                // A sink that stops accepting data is dropped; the
                // remaining ones keep receiving the stream.
                if output.write_all(&buffer[..count]).is_err() {
                    *slot = None;
                }
            }
        }
    }
}
