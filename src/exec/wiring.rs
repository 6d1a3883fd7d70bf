use std::os::fd::AsRawFd;

use nix::libc;
use nix::sys::signal::{self, SigHandler, Signal};
use nix::unistd;

use crate::graph::{Command, PipeEdge, PipeEndpoint};
use crate::logging::{self, LogId, Severity};

/// Child-side half of the launcher: runs between fork and exec.
///
/// Signal dispositions are reset first; the supervisor's handlers poke at
/// supervisor state and must not fire inside a child between fork and exec.
/// Then every edge pipe is either dup2'd onto the fd this command declared
/// or closed, and the process image is replaced.
pub fn wire_and_exec(command: &Command, edges: &[PipeEdge], close_unused: bool) -> ! {
    reset_signal_handlers();

    for (index, edge) in edges.iter().enumerate() {
        let Some(fds) = &edge.fds else { continue };
        wire_end(index, command, &edge.from, fds.write.as_raw_fd(), close_unused);
        wire_end(index, command, &edge.to, fds.read.as_raw_fd(), close_unused);
    }

    logging::log_event(
        LogId::Internal,
        "exec",
        Severity::Info,
        "calling execv",
        &[
            ("command", &command.name),
            ("path", &command.path.to_string_lossy()),
        ],
    );

    let errno = match unistd::execv(&command.path, &command.argv) {
        Err(errno) => errno,
        Ok(never) => match never {},
    };
    logging::log_event(
        LogId::Internal,
        "exec",
        Severity::Error,
        "execv failed",
        &[
            ("command", &command.name),
            ("path", &command.path.to_string_lossy()),
            ("error", errno.desc()),
        ],
    );
    std::process::abort();
}

/// Wire one end of one edge in the child for `command`.
///
/// If the endpoint belongs to this command, the requested fd number holds a
/// blocking placeholder; closing it and dup2'ing the pipe end over it puts
/// the pipe where the exec'd program expects it. Otherwise this child has no
/// business with that pipe end and closes it.
fn wire_end(
    index: usize,
    command: &Command,
    endpoint: &PipeEndpoint,
    pipe_fd: i32,
    close_unused: bool,
) {
    if endpoint.name == command.name {
        logging::log_event(
            LogId::Internal,
            "pipe",
            Severity::Info,
            "dup",
            &[
                ("pipe_index", &index.to_string()),
                ("command", &command.name),
                ("from_pipe_fd", &pipe_fd.to_string()),
                ("to_pipe_fd", &endpoint.fd.to_string()),
            ],
        );
        // SAFETY: raw close + dup2 on fds this child owns after fork; the
        // target number holds either a placeholder or nothing.
        unsafe {
            libc::close(endpoint.fd);
        }
        if unsafe { libc::dup2(pipe_fd, endpoint.fd) } != endpoint.fd {
            logging::log_event(
                LogId::Internal,
                "pipe",
                Severity::Error,
                "dup2 failed",
                &[
                    ("pipe_index", &index.to_string()),
                    ("command", &command.name),
                    ("from_pipe_fd", &pipe_fd.to_string()),
                    ("to_pipe_fd", &endpoint.fd.to_string()),
                ],
            );
            std::process::abort();
        }
    } else if close_unused {
        // SAFETY: closing a pipe end this child will never use.
        unsafe {
            libc::close(pipe_fd);
        }
    }
}

fn reset_signal_handlers() {
    for sig in [Signal::SIGHUP, Signal::SIGINT, Signal::SIGQUIT, Signal::SIGTERM] {
        // SAFETY: restoring the default disposition is always sound.
        let _ = unsafe { signal::signal(sig, SigHandler::SigDfl) };
    }
}
