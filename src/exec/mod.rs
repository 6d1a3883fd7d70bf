mod wiring;

use std::fmt;
use std::os::fd::{AsRawFd, IntoRawFd};

use anyhow::Result;
use nix::errno::Errno;
use nix::libc;
use nix::unistd::{ForkResult, Pid, fork, pipe};

use crate::graph::{Command, PipeEdge, PipeFds};
use crate::logging::{self, LogId, Severity};

/// A failed pipe(2), fork(2) or dup2(2) in the parent. The supervisor cannot
/// recover from these; main maps them to the resource exit code.
#[derive(Debug)]
pub struct ResourceError {
    call: &'static str,
    errno: Errno,
}

impl ResourceError {
    fn new(call: &'static str, errno: Errno) -> Self {
        ResourceError { call, errno }
    }
}

impl fmt::Display for ResourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed: {}", self.call, self.errno)
    }
}

impl std::error::Error for ResourceError {}

/// Launch the whole graph once.
///
/// Every pipe is created in the parent before the first fork, so every child
/// inherits every pipe and can wire its own ends. `record` is invoked with
/// the command index and pid immediately after each fork; a signal arriving
/// mid-launch therefore sees every child started so far.
///
/// After the last fork the parent closes all of its pipe ends; pipe liveness
/// is determined solely by the children holding them.
pub fn launch(
    commands: &[Command],
    edges: &mut [PipeEdge],
    record: &mut dyn FnMut(usize, Pid),
) -> Result<()> {
    block_used_fds(edges)?;
    create_pipes(edges)?;

    for (index, command) in commands.iter().enumerate() {
        let pid = fork_one(command, edges)?;
        record(index, pid);
    }

    close_all(edges);
    Ok(())
}

fn fork_one(command: &Command, edges: &[PipeEdge]) -> Result<Pid> {
    // SAFETY: the supervisor is single-threaded; the child branch only runs
    // signal resets, fd surgery and execv before it either replaces the
    // process image or aborts.
    match unsafe { fork() } {
        Ok(ForkResult::Parent { child }) => {
            logging::log_event(
                LogId::CommandPid,
                "exec",
                Severity::Info,
                "new child",
                &[("command", &command.name), ("pid", &child.to_string())],
            );
            Ok(child)
        }
        Ok(ForkResult::Child) => wiring::wire_and_exec(command, edges, true),
        Err(errno) => Err(ResourceError::new("fork", errno).into()),
    }
}

/// Pre-occupy every endpoint fd number above the stdio range with a copy of
/// a throwaway pipe end. pipe(2) hands out the lowest free descriptors, so
/// without this an edge pipe could land exactly on a number a child is about
/// to claim, and the post-fork dup2 would clobber a live pipe end instead of
/// a harmless placeholder.
///
/// The throwaway read end stays open for the life of the supervisor.
fn block_used_fds(edges: &[PipeEdge]) -> Result<()> {
    logging::log_event(
        LogId::Internal,
        "pipe",
        Severity::Info,
        "blocking used fds",
        &[],
    );

    let (read, write) = pipe().map_err(|errno| ResourceError::new("pipe", errno))?;
    drop(write);
    let blocking_fd = read.into_raw_fd();

    for edge in edges.iter() {
        for endpoint in [&edge.from, &edge.to] {
            if endpoint.fd > 2 && endpoint.fd != blocking_fd {
                logging::log_event(
                    LogId::Internal,
                    "pipe",
                    Severity::Info,
                    "blocking fd",
                    &[
                        ("pipe_fd", &endpoint.fd.to_string()),
                        ("blocking_fd", &blocking_fd.to_string()),
                    ],
                );
                // SAFETY: dup2 onto a number that is either free or holds an
                // earlier placeholder; both are safe to replace.
                if unsafe { libc::dup2(blocking_fd, endpoint.fd) } != endpoint.fd {
                    return Err(ResourceError::new("dup2", Errno::last()).into());
                }
            }
        }
    }
    Ok(())
}

fn create_pipes(edges: &mut [PipeEdge]) -> Result<()> {
    for (index, edge) in edges.iter_mut().enumerate() {
        let (read, write) = pipe().map_err(|errno| ResourceError::new("pipe", errno))?;
        logging::log_event(
            LogId::Internal,
            "pipe",
            Severity::Info,
            "pipe created",
            &[
                ("pipe_index", &index.to_string()),
                ("from_fd", &write.as_raw_fd().to_string()),
                ("to_fd", &read.as_raw_fd().to_string()),
            ],
        );
        edge.fds = Some(PipeFds { read, write });
    }
    Ok(())
}

/// Drop every pipe end the parent still holds.
fn close_all(edges: &mut [PipeEdge]) {
    for (index, edge) in edges.iter_mut().enumerate() {
        if edge.fds.take().is_some() {
            logging::log_event(
                LogId::Internal,
                "pipe",
                Severity::Info,
                "closing pipe in parent",
                &[("pipe_index", &index.to_string())],
            );
        }
    }
}
