mod parse;

pub use parse::parse_graph;

use std::ffi::CString;
use std::os::fd::OwnedFd;

use anyhow::{Context, Result};

/// One node of the process graph: a named command with the argv it execs.
///
/// argv[0] is the path token itself, matching what a shell would pass.
/// The strings are converted once at parse time so the post-fork child has
/// nothing left to prepare.
#[derive(Debug)]
pub struct Command {
    pub name: String,
    pub path: CString,
    pub argv: Vec<CString>,
}

impl Command {
    pub fn new(name: String, argv_tokens: Vec<String>) -> Result<Self> {
        let argv = argv_tokens
            .into_iter()
            .map(|tok| {
                CString::new(tok).with_context(|| format!("command [{name}]: argument contains a NUL byte"))
            })
            .collect::<Result<Vec<_>>>()?;
        let path = argv[0].clone();
        Ok(Command { name, path, argv })
    }
}

/// One side of a pipe as the child will see it: the command name and the fd
/// number that ends up wired in that child.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipeEndpoint {
    pub name: String,
    pub fd: i32,
}

/// The two host-side descriptors backing an edge during one launch cycle.
#[derive(Debug)]
pub struct PipeFds {
    pub read: OwnedFd,
    pub write: OwnedFd,
}

/// A pipe edge from one endpoint to another. `fds` is populated by the
/// launcher when the pipes are allocated and cleared again when the parent
/// closes its copies.
#[derive(Debug)]
pub struct PipeEdge {
    pub from: PipeEndpoint,
    pub to: PipeEndpoint,
    pub fds: Option<PipeFds>,
}

/// The parsed process graph.
#[derive(Debug)]
pub struct Graph {
    pub commands: Vec<Command>,
    pub edges: Vec<PipeEdge>,
}
