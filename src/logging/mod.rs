use std::collections::BTreeMap;
use std::ffi::CString;
use std::str::FromStr;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use nix::libc;
use serde::Serialize;
use time::OffsetDateTime;
use time::format_description::FormatItem;

/// A single event emission never exceeds this many bytes.
const EVENT_BUF_BYTES: usize = 4096;

/// Text channel target. -1 means the channel is disabled.
static TEXT_FD: AtomicI32 = AtomicI32::new(-1);
static TEXT_SYSLOG: AtomicBool = AtomicBool::new(false);

/// JSON channel target. -1 means the channel is disabled.
static JSON_FD: AtomicI32 = AtomicI32::new(-1);
static JSON_SYSLOG: AtomicBool = AtomicBool::new(false);

static SYSLOG_OPENED: AtomicBool = AtomicBool::new(false);

/// Where one log channel sends its lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogTarget {
    Fd(i32),
    Syslog,
}

impl FromStr for LogTarget {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "s" {
            return Ok(LogTarget::Syslog);
        }
        s.parse::<i32>()
            .map(LogTarget::Fd)
            .map_err(|_| format!("expected a file descriptor number or `s`, got [{s}]"))
    }
}

/// Numeric event class carried by every log line.
#[derive(Debug, Clone, Copy)]
pub enum LogId {
    Internal = 0,
    CommandPid = 1,
    ChildExit = 2,
}

#[derive(Debug, Clone, Copy)]
pub enum Severity {
    Info,
    Warning,
    Error,
    Debug,
}

impl Severity {
    fn as_str(self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Debug => "debug",
        }
    }

    fn syslog_priority(self) -> libc::c_int {
        match self {
            Severity::Info => libc::LOG_INFO,
            Severity::Warning => libc::LOG_WARNING,
            Severity::Error => libc::LOG_ERR,
            Severity::Debug => libc::LOG_DEBUG,
        }
    }
}

/// Enable the text channel.
pub fn enable_text(target: LogTarget) {
    match target {
        LogTarget::Fd(fd) => TEXT_FD.store(fd, Ordering::SeqCst),
        LogTarget::Syslog => {
            open_syslog();
            TEXT_SYSLOG.store(true, Ordering::SeqCst);
        }
    }
}

/// Enable the JSON channel.
pub fn enable_json(target: LogTarget) {
    match target {
        LogTarget::Fd(fd) => JSON_FD.store(fd, Ordering::SeqCst),
        LogTarget::Syslog => {
            open_syslog();
            JSON_SYSLOG.store(true, Ordering::SeqCst);
        }
    }
}

fn open_syslog() {
    if SYSLOG_OPENED.swap(true, Ordering::SeqCst) {
        return;
    }
    // SAFETY: the ident is a static C string, so the pointer openlog keeps
    // stays valid for the life of the process.
    unsafe {
        libc::openlog(c"pipexec".as_ptr(), libc::LOG_PID, libc::LOG_DAEMON);
    }
}

#[derive(Serialize)]
struct JsonEvent<'a> {
    timestamp: u64,
    pipexec_pid: u32,
    id: u8,
    #[serde(rename = "type")]
    kind: &'a str,
    severity: &'a str,
    message: &'a str,
    #[serde(flatten)]
    fields: BTreeMap<&'a str, &'a str>,
}

/// Log one event to every enabled channel.
///
/// Both channels are independent: an event goes out as a text line and as a
/// single-line JSON object when both are configured. Write failures are
/// dropped; there is nowhere left to report them.
pub fn log_event(id: LogId, kind: &str, severity: Severity, msg: &str, fields: &[(&str, &str)]) {
    let text_fd = TEXT_FD.load(Ordering::SeqCst);
    let text_syslog = TEXT_SYSLOG.load(Ordering::SeqCst);
    let json_fd = JSON_FD.load(Ordering::SeqCst);
    let json_syslog = JSON_SYSLOG.load(Ordering::SeqCst);

    if text_fd >= 0 || text_syslog {
        let line = format_text(id, kind, severity, msg, fields);
        emit(&line, text_fd, text_syslog, severity);
    }

    if json_fd >= 0 || json_syslog {
        let line = format_json(id, kind, severity, msg, fields);
        emit(&line, json_fd, json_syslog, severity);
    }
}

/// Write a pre-formatted line to the text channel fd.
///
/// Runs from signal handlers: nothing here allocates or formats, the only
/// call is `write(2)` and the result is ignored.
pub fn raw_note(line: &[u8]) {
    let fd = TEXT_FD.load(Ordering::SeqCst);
    if fd >= 0 {
        // SAFETY: plain write(2) on a caller-provided buffer; a bad fd only
        // makes the write fail, which is ignored.
        unsafe {
            libc::write(fd, line.as_ptr() as *const libc::c_void, line.len());
        }
    }
}

fn timestamp_format() -> &'static [FormatItem<'static>] {
    static FORMAT: OnceLock<Vec<FormatItem<'static>>> = OnceLock::new();
    FORMAT.get_or_init(|| {
        time::format_description::parse("[year]-[month]-[day] [hour]:[minute]:[second]")
            .unwrap_or_default()
    })
}

fn epoch_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn format_text(
    id: LogId,
    kind: &str,
    severity: Severity,
    msg: &str,
    fields: &[(&str, &str)],
) -> Vec<u8> {
    // Local time like the original text lines; UTC when the local offset
    // cannot be determined.
    let timestamp = OffsetDateTime::now_local()
        .unwrap_or_else(|_| OffsetDateTime::now_utc())
        .format(&timestamp_format())
        .unwrap_or_default();
    let mut line = format!(
        "{timestamp};pipexec;{};{};{kind};{};{msg};",
        std::process::id(),
        id as u8,
        severity.as_str(),
    );
    for (key, value) in fields {
        line.push_str(&format!("[{key}]=[{value}];"));
    }
    finish_line(line.into_bytes())
}

fn format_json(
    id: LogId,
    kind: &str,
    severity: Severity,
    msg: &str,
    fields: &[(&str, &str)],
) -> Vec<u8> {
    let event = JsonEvent {
        timestamp: epoch_seconds(),
        pipexec_pid: std::process::id(),
        id: id as u8,
        kind,
        severity: severity.as_str(),
        message: msg,
        fields: fields.iter().copied().collect(),
    };
    let line = serde_json::to_vec(&event).unwrap_or_default();
    finish_line(line)
}

/// Cap the line at the event buffer size and terminate it with a newline.
fn finish_line(mut line: Vec<u8>) -> Vec<u8> {
    line.truncate(EVENT_BUF_BYTES - 1);
    line.push(b'\n');
    line
}

fn emit(line: &[u8], fd: i32, to_syslog: bool, severity: Severity) {
    if fd >= 0 {
        // SAFETY: write(2) on the configured fd; failures (EBADF, EPIPE, a
        // short write) are silently dropped.
        unsafe {
            libc::write(fd, line.as_ptr() as *const libc::c_void, line.len());
        }
    }
    if to_syslog {
        // The trailing newline is for fd output only.
        let trimmed = &line[..line.len().saturating_sub(1)];
        if let Ok(msg) = CString::new(trimmed) {
            // SAFETY: both pointers are valid NUL-terminated strings and
            // syslog(3) does not retain them.
            unsafe {
                libc::syslog(
                    severity.syslog_priority() | libc::LOG_DAEMON,
                    c"%s".as_ptr(),
                    msg.as_ptr(),
                );
            }
        }
    }
}
