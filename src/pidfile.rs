use std::fs;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use crate::logging::{self, LogId, Severity};

/// Write the supervisor pid to the pidfile, mode 0444.
///
/// Failures are logged and otherwise ignored; a missing pidfile is not
/// worth refusing to supervise over.
pub fn write(path: &Path) {
    let pid = std::process::id();
    logging::log_event(
        LogId::Internal,
        "pidfile",
        Severity::Info,
        "writing pid file",
        &[("path", &path.display().to_string()), ("pid", &pid.to_string())],
    );
    let result = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o444)
        .open(path)
        .and_then(|mut file| file.write_all(format!("{pid}\n").as_bytes()));
    if let Err(err) = result {
        logging::log_event(
            LogId::Internal,
            "pidfile",
            Severity::Error,
            "cannot write pid file",
            &[
                ("path", &path.display().to_string()),
                ("error", &err.to_string()),
            ],
        );
    }
}

/// Remove the pidfile on clean shutdown.
pub fn remove(path: &Path) {
    logging::log_event(
        LogId::Internal,
        "pidfile",
        Severity::Info,
        "removing pid file",
        &[("path", &path.display().to_string())],
    );
    if let Err(err) = fs::remove_file(path) {
        logging::log_event(
            LogId::Internal,
            "pidfile",
            Severity::Error,
            "cannot remove pid file",
            &[
                ("path", &path.display().to_string()),
                ("error", &err.to_string()),
            ],
        );
    }
}
