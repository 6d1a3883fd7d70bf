use std::fs::File;
use std::io::{ErrorKind, Read, Write};
use std::os::fd::{AsFd, AsRawFd, FromRawFd};

use clap::Parser;
use nix::errno::Errno;
use nix::libc;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};

/// Reverse tee for pipes and fds: funnel a set of input fds into one output.
#[derive(Parser, Debug)]
#[command(
    name = "peet",
    version,
    about = "Multiplex bytes from a set of fds onto one fd"
)]
struct Cli {
    /// Fd to write to
    #[arg(short = 'w', value_name = "FD", default_value_t = 1)]
    write_fd: i32,

    /// Align writes to this block size
    #[arg(short = 'b', value_name = "BYTES")]
    block_size: Option<usize>,

    /// Fds to read from
    #[arg(required = true, value_name = "FD")]
    in_fds: Vec<i32>,
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
    let mut output = unsafe { File::from_raw_fd(cli.write_fd) };
    let mut inputs: Vec<File> = cli
        .in_fds
        .iter()
        .map(|&fd| unsafe { File::from_raw_fd(fd) })
        .collect();
    for input in &inputs {
        set_nonblocking(input.as_raw_fd());
    }

    let block_size = cli.block_size.filter(|&size| size > 0);
    let mut carry: Vec<u8> = Vec::new();

    while !inputs.is_empty() {
        let ready = match poll_ready(&inputs) {
            Some(ready) => ready,
            None => continue,
        };

        let mut finished = vec![false; inputs.len()];
        for (index, input) in inputs.iter_mut().enumerate() {
            if !ready[index] {
                continue;
            }
            let mut buffer = [0u8; 4096];
            loop {
                match input.read(&mut buffer) {
                    Ok(0) => {
                        finished[index] = true;
                        break;
                    }
                    Ok(count) => forward(&mut output, &mut carry, block_size, &buffer[..count]),
                    Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                    Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                    Err(_) => {
                        finished[index] = true;
                        break;
                    }
                }
            }
        }

        let mut index = 0;
        inputs.retain(|_| {
            let keep = !finished[index];
            index += 1;
            keep
        });
    }

    // Whatever is left below one block goes out as a final short write.
    if !carry.is_empty() {
        write_out(&mut output, &carry);
    }
}

/// Block until at least one input has data or hung up. Returns one readiness
/// flag per input, or None when the poll was interrupted.
fn poll_ready(inputs: &[File]) -> Option<Vec<bool>> {
    let mut pollfds: Vec<PollFd> = inputs
        .iter()
        .map(|input| PollFd::new(input.as_fd(), PollFlags::POLLIN))
        .collect();
    match poll(&mut pollfds, PollTimeout::NONE) {
        Ok(_) => {}
        Err(Errno::EINTR) => return None,
        Err(err) => {
            eprintln!("peet: poll: {err}");
            std::process::exit(2);
        }
    }
    let wake = PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR;
    Some(
        pollfds
            .iter()
            .map(|pollfd| {
                pollfd
                    .revents()
                    .map(|revents| revents.intersects(wake))
                    .unwrap_or(false)
            })
            .collect(),
    )
}

fn forward(output: &mut File, carry: &mut Vec<u8>, block_size: Option<usize>, data: &[u8]) {
    match block_size {
        None => write_out(output, data),
        Some(size) => {
            carry.extend_from_slice(data);
            let aligned = carry.len() - carry.len() % size;
            if aligned > 0 {
                write_out(output, &carry[..aligned]);
                carry.drain(..aligned);
            }
        }
    }
}

fn write_out(output: &mut File, data: &[u8]) {
    if let Err(err) = output.write_all(data) {
        eprintln!("peet: write: {err}");
        std::process::exit(2);
    }
}

fn set_nonblocking(fd: i32) {
    // SAFETY: fcntl on a caller-supplied fd; a bad fd fails the call.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
    if flags == -1 || unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } == -1 {
        eprintln!("peet: fcntl nonblocking failed on fd {fd}");
        std::process::exit(2);
    }
}
