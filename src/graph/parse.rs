use anyhow::{Result, bail};

use super::{Command, Graph, PipeEdge, PipeEndpoint};
use crate::logging::{self, LogId, Severity};

/// Parse the positional tokens following `--` into the process graph.
///
/// Grammar: `[ NAME path args ]` or `[NAME path args ]` declares a command;
/// `{FROM:FD>TO:FD}` declares a pipe edge. Anything else is rejected.
///
/// Endpoint names are deliberately not checked against the declared
/// commands; an endpoint that matches no command produces no wiring action.
/// That permissiveness is kept for compatibility and only logged as a
/// warning.
pub fn parse_graph(tokens: &[String]) -> Result<Graph> {
    let command_count = tokens.iter().filter(|t| t.starts_with('[')).count();
    let edge_count = tokens
        .iter()
        .filter(|t| t.starts_with('{') && t.contains('>'))
        .count();

    let mut commands: Vec<Command> = Vec::with_capacity(command_count);
    let mut edges: Vec<PipeEdge> = Vec::with_capacity(edge_count);

    let mut i = 0;
    while i < tokens.len() {
        let token = &tokens[i];
        if let Some(inline_name) = token.strip_prefix('[') {
            let name = if inline_name.is_empty() {
                i += 1;
                match tokens.get(i) {
                    Some(t) if t != "]" => t.clone(),
                    _ => bail!("command declaration without a name"),
                }
            } else {
                inline_name.to_string()
            };
            i += 1;
            let path = match tokens.get(i) {
                Some(t) if t != "]" => t.clone(),
                _ => bail!("command [{name}] has no executable path"),
            };
            let mut argv = vec![path];
            i += 1;
            loop {
                match tokens.get(i) {
                    Some(t) if t == "]" => break,
                    Some(t) => {
                        argv.push(t.clone());
                        i += 1;
                    }
                    None => bail!("command [{name}] is not terminated with `]`"),
                }
            }
            i += 1;
            commands.push(Command::new(name, argv)?);
        } else if token.starts_with('{') && token.contains('>') {
            edges.push(parse_edge(token)?);
            i += 1;
        } else if token == "]" {
            // Stray end markers are consumed, matching the counting rules.
            i += 1;
        } else {
            bail!("unparsable token [{token}] in process graph");
        }
    }

    check_duplicate_endpoints(&edges)?;
    warn_unknown_endpoints(&commands, &edges);

    Ok(Graph { commands, edges })
}

/// Extract `{FROM:FD>TO:FD}` fields from one token.
fn parse_edge(token: &str) -> Result<PipeEdge> {
    let (from, rest) = split_endpoint(&token[1..], token)?;
    let Some(rest) = rest.strip_prefix('>') else {
        bail!("invalid pipe descriptor [{token}]: no `>` found");
    };
    let (to, rest) = split_endpoint(rest, token)?;
    if !rest.starts_with('}') {
        bail!("invalid pipe descriptor [{token}]: no closing `}}` found");
    }
    Ok(PipeEdge {
        from,
        to,
        fds: None,
    })
}

/// Split `NAME:FD` off the front of `s`, returning the endpoint and the
/// remainder starting at the first character after the number.
fn split_endpoint<'a>(s: &'a str, token: &str) -> Result<(PipeEndpoint, &'a str)> {
    let Some(colon) = s.find(':') else {
        bail!("invalid pipe descriptor [{token}]: no colon found");
    };
    let name = s[..colon].to_string();
    let (fd, rest) = take_decimal(&s[colon + 1..]);
    Ok((PipeEndpoint { name, fd }, rest))
}

/// Take a leading signed decimal, strtol style: an unparsable or empty
/// number yields 0 and consumes nothing past the sign and digits.
fn take_decimal(s: &str) -> (i32, &str) {
    let bytes = s.as_bytes();
    let mut end = 0;
    if matches!(bytes.first(), Some(b'+') | Some(b'-')) {
        end += 1;
    }
    while end < bytes.len() && bytes[end].is_ascii_digit() {
        end += 1;
    }
    (s[..end].parse().unwrap_or(0), &s[end..])
}

/// Two edges sharing a `from` endpoint or sharing a `to` endpoint cannot be
/// wired; both fds would claim the same number in the same child.
fn check_duplicate_endpoints(edges: &[PipeEdge]) -> Result<()> {
    for (i, a) in edges.iter().enumerate() {
        for b in &edges[i + 1..] {
            if a.from == b.from {
                bail!(
                    "duplicate pipe endpoint in command line: [from] [{}] [{}]",
                    a.from.name,
                    a.from.fd
                );
            }
            if a.to == b.to {
                bail!(
                    "duplicate pipe endpoint in command line: [to] [{}] [{}]",
                    a.to.name,
                    a.to.fd
                );
            }
        }
    }
    Ok(())
}

fn warn_unknown_endpoints(commands: &[Command], edges: &[PipeEdge]) {
    for edge in edges {
        for endpoint in [&edge.from, &edge.to] {
            if !commands.iter().any(|c| c.name == endpoint.name) {
                logging::log_event(
                    LogId::Internal,
                    "command_line",
                    Severity::Warning,
                    "pipe endpoint references no declared command",
                    &[
                        ("name", &endpoint.name),
                        ("fd", &endpoint.fd.to_string()),
                    ],
                );
            }
        }
    }
}
