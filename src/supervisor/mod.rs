use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use nix::errno::Errno;
use nix::libc;
use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, kill, sigaction};
use nix::sys::wait::{WaitStatus, wait, waitpid};
use nix::unistd::Pid;

use crate::exec;
use crate::graph::Graph;
use crate::logging::{self, LogId, Severity};

// Shared between the main flow and the signal handlers, which receive no
// context pointer. All access is single-word atomic loads and stores.
static TERMINATE: AtomicBool = AtomicBool::new(false);
static RESTART: AtomicBool = AtomicBool::new(false);
static KILL_CHILDREN: AtomicBool = AtomicBool::new(false);
static CHILD_FAILED: AtomicBool = AtomicBool::new(false);

/// One slot per command, holding the pid of the running child or 0.
/// Sized once before the handlers are installed; the handlers only ever
/// iterate it read/compare-exchange, never resize it.
static CHILD_PIDS: OnceLock<Box<[AtomicI32]>> = OnceLock::new();

/// Size the slot table and record the kill policy.
pub fn init(child_count: usize, kill_children: bool) {
    KILL_CHILDREN.store(kill_children, Ordering::SeqCst);
    CHILD_PIDS.get_or_init(|| (0..child_count).map(|_| AtomicI32::new(0)).collect());
}

fn slots() -> &'static [AtomicI32] {
    CHILD_PIDS.get().map(|table| &**table).unwrap_or(&[])
}

/// Request a restart. Has no effect once the process is terminating.
pub fn set_restart(on: bool) {
    if TERMINATE.load(Ordering::SeqCst) {
        logging::raw_note(b";pipexec;;0;signal;info;cannot set restart flag - process will terminate;\n");
        return;
    }
    RESTART.store(on, Ordering::SeqCst);
}

/// Start terminating. Sticky: once set, restart requests are ignored.
pub fn set_terminate() {
    TERMINATE.store(true, Ordering::SeqCst);
    RESTART.store(false, Ordering::SeqCst);
}

fn record_child(index: usize, pid: Pid) {
    if let Some(slot) = slots().get(index) {
        slot.store(pid.as_raw(), Ordering::SeqCst);
    }
}

fn unset_child(pid: Pid) {
    for slot in slots() {
        if slot
            .compare_exchange(pid.as_raw(), 0, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            return;
        }
    }
    logging::raw_note(b";pipexec;;0;signal;warning;pid not found in child list;\n");
}

fn running_count() -> usize {
    slots()
        .iter()
        .filter(|slot| slot.load(Ordering::SeqCst) != 0)
        .count()
}

/// A child that did not reach _exit: killed by a signal or stopped some
/// other way. A nonzero exit code alone is not abnormal.
fn abnormal(status: &WaitStatus) -> bool {
    !matches!(status, WaitStatus::Exited(..))
}

extern "C" fn sh_term(_signum: libc::c_int) {
    logging::raw_note(b";pipexec;;0;signal;info;terminate signal received;\n");
    set_terminate();
    kill_and_reap(true);
}

extern "C" fn sh_restart(_signum: libc::c_int) {
    logging::raw_note(b";pipexec;;0;signal;info;restart signal received;\n");
    set_restart(true);
    kill_and_reap(true);
}

/// Install the supervisor handlers: SIGHUP restarts the graph, SIGINT,
/// SIGQUIT and SIGTERM terminate it.
///
/// SA_NODEFER because the handlers run waitpid loops that may themselves be
/// interrupted; re-entry is tolerated since both handlers are idempotent on
/// the supervisor state.
pub fn install_signal_handlers() -> Result<()> {
    let term = SigAction::new(
        SigHandler::Handler(sh_term),
        SaFlags::SA_NODEFER,
        SigSet::empty(),
    );
    let restart = SigAction::new(
        SigHandler::Handler(sh_restart),
        SaFlags::SA_NODEFER,
        SigSet::empty(),
    );
    // SAFETY: the handlers restrict themselves to flag stores, kill,
    // waitpid and raw write.
    unsafe {
        sigaction(Signal::SIGHUP, &restart).context("sigaction SIGHUP")?;
        sigaction(Signal::SIGINT, &term).context("sigaction SIGINT")?;
        sigaction(Signal::SIGQUIT, &term).context("sigaction SIGQUIT")?;
        sigaction(Signal::SIGTERM, &term).context("sigaction SIGTERM")?;
    }
    Ok(())
}

/// SIGTERM every running child and reap each one.
pub fn kill_all_and_wait() {
    kill_and_reap(false);
}

/// Shared core of the kill phase. With `in_handler` set this runs in signal
/// context: only flag stores, kill, waitpid and raw writes are allowed then.
fn kill_and_reap(in_handler: bool) {
    if !KILL_CHILDREN.load(Ordering::SeqCst) {
        // Children are left to drain on their own and get reaped by the
        // main wait loop.
        if in_handler {
            logging::raw_note(b";pipexec;;0;signal;info;do not kill child processes;\n");
        } else {
            logging::log_event(
                LogId::Internal,
                "signal",
                Severity::Info,
                "do not kill child processes",
                &[],
            );
        }
        return;
    }

    for slot in slots() {
        let pid = slot.load(Ordering::SeqCst);
        if pid != 0 {
            if !in_handler {
                logging::log_event(
                    LogId::Internal,
                    "signal",
                    Severity::Info,
                    "sending SIGTERM",
                    &[("pid", &pid.to_string())],
                );
            }
            // ESRCH just means the child is already gone; it still gets
            // reaped below.
            let _ = kill(Pid::from_raw(pid), Signal::SIGTERM);
        }
    }

    for slot in slots() {
        let raw = slot.load(Ordering::SeqCst);
        if raw == 0 {
            continue;
        }
        let pid = Pid::from_raw(raw);
        loop {
            match waitpid(pid, None) {
                Err(Errno::EINTR) => continue,
                Err(_) => break, // ECHILD: a re-entered handler reaped it first
                Ok(status) => {
                    if let WaitStatus::Exited(_, code) = status {
                        if code != 0 {
                            CHILD_FAILED.store(true, Ordering::SeqCst);
                        }
                    }
                    if let WaitStatus::Signaled(_, sig, _) = status {
                        if sig != Signal::SIGTERM {
                            // An ordered SIGTERM kill is expected here; any
                            // other kill reason is a terminal condition.
                            if in_handler {
                                logging::raw_note(b";pipexec;;0;signal;warning;child terminated by a different signal - do not restart;\n");
                            } else {
                                logging::log_event(
                                    LogId::ChildExit,
                                    "signal",
                                    Severity::Warning,
                                    "child terminated by a different signal - do not restart",
                                    &[("pid", &raw.to_string()), ("signal", sig.as_str())],
                                );
                            }
                            set_terminate();
                        }
                    }
                    break;
                }
            }
        }
        unset_child(pid);
    }
}

/// The supervisor loop: launch the graph when idle, park in wait(2) while it
/// runs, apply the restart policy, and report the aggregated exit code.
pub fn run(graph: &mut Graph, sleep_time: u32) -> Result<i32> {
    loop {
        if running_count() == 0 {
            set_restart(false);
            logging::log_event(
                LogId::Internal,
                "start",
                Severity::Info,
                "starting all children",
                &[("count", &graph.commands.len().to_string())],
            );
            exec::launch(&graph.commands, &mut graph.edges, &mut record_child)?;
        }

        while running_count() > 0 {
            match wait() {
                Err(Errno::EINTR) => {
                    // A handler ran; the slot table is re-checked above.
                    continue;
                }
                Err(errno) => {
                    logging::log_event(
                        LogId::Internal,
                        "supervisor",
                        Severity::Error,
                        "wait failed",
                        &[("error", errno.desc())],
                    );
                    continue;
                }
                Ok(status) => {
                    let Some(pid) = status.pid() else { continue };
                    log_child_exit(pid, &status);
                    unset_child(pid);
                    if !matches!(status, WaitStatus::Exited(_, 0)) {
                        CHILD_FAILED.store(true, Ordering::SeqCst);
                    }
                    if abnormal(&status) {
                        logging::log_event(
                            LogId::ChildExit,
                            "child",
                            Severity::Warning,
                            "abnormal termination of child - restarting",
                            &[("pid", &pid.to_string())],
                        );
                        set_restart(true);
                        kill_all_and_wait();
                    }
                }
            }
        }

        if !RESTART.load(Ordering::SeqCst) {
            break;
        }
        if sleep_time > 0 {
            logging::log_event(
                LogId::Internal,
                "supervisor",
                Severity::Info,
                "waiting before restart",
                &[("seconds", &sleep_time.to_string())],
            );
            thread::sleep(Duration::from_secs(u64::from(sleep_time)));
        }
        // A terminate that arrived during the sleep wins over the restart.
        if !RESTART.load(Ordering::SeqCst) {
            break;
        }
    }

    Ok(if CHILD_FAILED.load(Ordering::SeqCst) { 1 } else { 0 })
}

fn log_child_exit(pid: Pid, status: &WaitStatus) {
    let (exited, code, signaled) = match status {
        WaitStatus::Exited(_, code) => (true, *code, false),
        WaitStatus::Signaled(..) => (false, 0, true),
        _ => (false, 0, false),
    };
    logging::log_event(
        LogId::ChildExit,
        "child",
        Severity::Info,
        "child exited",
        &[
            ("pid", &pid.to_string()),
            ("normal_exit", if exited { "1" } else { "0" }),
            ("child_status", &code.to_string()),
            ("child_signaled", if signaled { "1" } else { "0" }),
        ],
    );
}
