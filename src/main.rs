mod exec;
mod graph;
mod logging;
mod pidfile;
mod supervisor;

use std::path::PathBuf;

use clap::Parser;

use exec::ResourceError;
use logging::{LogId, LogTarget, Severity};

const EXIT_FAILURE: i32 = 1;
const EXIT_RESOURCE: i32 = 10;

/// Build up a directed graph of processes and pipes.
#[derive(Parser, Debug)]
#[command(
    name = "pipexec",
    version,
    about = "Build up a directed graph of processes and pipes",
    after_help = "The process-pipe-graph is a list of process descriptions and pipe descriptions.\n\
                  process description: '[ NAME /path/to/proc args ]'\n\
                  pipe description: '{NAME1:fd1>NAME2:fd2}'"
)]
struct Cli {
    /// Kill all child processes when one terminates abnormally
    #[arg(short = 'k')]
    kill_child_processes: bool,

    /// Log in text form to the given fd, or to syslog with `s`
    #[arg(short = 'l', value_name = "FD|s")]
    text_log: Option<LogTarget>,

    /// Log in JSON form to the given fd, or to syslog with `s`
    #[arg(short = 'j', value_name = "FD|s")]
    json_log: Option<LogTarget>,

    /// Write the supervisor pid to this file; removed on clean exit
    #[arg(short = 'p', value_name = "PIDFILE")]
    pid_file: Option<PathBuf>,

    /// Seconds to wait before a restart; 0 disables restarting
    #[arg(short = 's', value_name = "SECONDS", default_value_t = 0)]
    sleep_time: u32,

    /// The process-pipe-graph, given after `--`
    #[arg(last = true, required = true, value_name = "GRAPH")]
    graph: Vec<String>,
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            // Help and version requests are not usage errors.
            std::process::exit(if err.use_stderr() { EXIT_FAILURE } else { 0 });
        }
    };
    std::process::exit(run(cli));
}

fn run(cli: Cli) -> i32 {
    if let Some(target) = cli.text_log {
        logging::enable_text(target);
    }
    if let Some(target) = cli.json_log {
        logging::enable_json(target);
    }

    logging::log_event(
        LogId::Internal,
        "start",
        Severity::Info,
        "pipexec",
        &[("version", env!("CARGO_PKG_VERSION"))],
    );

    // No restart timer means one pass: the supervisor is done as soon as
    // the graph is, whatever the children's fate was.
    if cli.sleep_time == 0 {
        supervisor::set_restart(false);
        supervisor::set_terminate();
    }

    let mut graph = match graph::parse_graph(&cli.graph) {
        Ok(graph) => graph,
        Err(err) => {
            logging::log_event(
                LogId::Internal,
                "command_line",
                Severity::Error,
                &err.to_string(),
                &[],
            );
            eprintln!("pipexec: {err}");
            return EXIT_FAILURE;
        }
    };

    logging::log_event(
        LogId::Internal,
        "command_line",
        Severity::Info,
        "parsed process graph",
        &[
            ("commands", &graph.commands.len().to_string()),
            ("pipes", &graph.edges.len().to_string()),
        ],
    );

    supervisor::init(graph.commands.len(), cli.kill_child_processes);

    if let Some(path) = &cli.pid_file {
        pidfile::write(path);
    }

    if let Err(err) = supervisor::install_signal_handlers() {
        eprintln!("pipexec: {err}");
        return EXIT_RESOURCE;
    }

    let code = match supervisor::run(&mut graph, cli.sleep_time) {
        Ok(code) => code,
        Err(err) => {
            logging::log_event(
                LogId::Internal,
                "supervisor",
                Severity::Error,
                &err.to_string(),
                &[],
            );
            eprintln!("pipexec: {err}");
            return if err.downcast_ref::<ResourceError>().is_some() {
                EXIT_RESOURCE
            } else {
                EXIT_FAILURE
            };
        }
    };

    if let Some(path) = &cli.pid_file {
        pidfile::remove(path);
    }

    logging::log_event(LogId::Internal, "supervisor", Severity::Info, "exiting", &[]);
    code
}
