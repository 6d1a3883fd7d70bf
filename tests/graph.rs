use std::fs;
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

fn pipexec() -> Command {
    Command::new(env!("CARGO_BIN_EXE_pipexec"))
}

fn temp_path(name: &str) -> PathBuf {
    let mut path = std::env::temp_dir();
    path.push(format!("pipexec-test-{}-{name}", std::process::id()));
    path
}

fn wait_with_deadline(child: &mut Child, deadline: Duration) -> ExitStatus {
    let start = Instant::now();
    loop {
        if let Some(status) = child.try_wait().unwrap() {
            return status;
        }
        if start.elapsed() > deadline {
            let _ = child.kill();
            let _ = child.wait();
            panic!("supervisor did not exit in time");
        }
        thread::sleep(Duration::from_millis(20));
    }
}

fn wait_for<F: Fn() -> bool>(what: &str, deadline: Duration, check: F) {
    let start = Instant::now();
    while !check() {
        assert!(start.elapsed() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(20));
    }
}

fn sigterm(child: &Child) {
    // SAFETY: signalling a child this test spawned.
    unsafe {
        libc::kill(child.id() as libc::pid_t, libc::SIGTERM);
    }
}

#[test]
fn linear_pipeline_delivers_bytes() {
    let output = pipexec()
        .args([
            "-s", "0", "--", "[", "A", "/bin/echo", "hello", "]", "[", "B", "/bin/cat", "]",
            "{A:1>B:0}",
        ])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(0));
    assert_eq!(output.stdout, b"hello\n");
}

#[test]
fn all_children_zero_means_exit_zero() {
    let output = pipexec()
        .args(["-s", "0", "--", "[", "A", "/bin/true", "]"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(0));
}

#[test]
fn nonzero_child_exit_sets_exit_code() {
    let output = pipexec()
        .args(["-s", "0", "--", "[", "A", "/bin/false", "]"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(1));
}

#[test]
fn duplicate_edge_rejected_before_any_fork() {
    let marker = temp_path("dup-marker");
    let _ = fs::remove_file(&marker);
    let output = pipexec()
        .args([
            "-s",
            "0",
            "--",
            "[",
            "A",
            "/bin/touch",
            marker.to_str().unwrap(),
            "]",
            "{A:1>B:0}",
            "{A:1>C:0}",
        ])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("duplicate pipe endpoint"), "stderr: {stderr}");
    assert!(!marker.exists(), "a child ran despite the parse error");
}

#[test]
fn usage_error_without_graph() {
    let output = pipexec().output().unwrap();
    assert_eq!(output.status.code(), Some(1));
    assert!(!output.stderr.is_empty());
}

#[test]
fn clean_sigterm_reaps_children_and_removes_pidfile() {
    let pid_file = temp_path("pidfile");
    let _ = fs::remove_file(&pid_file);
    let mut child = pipexec()
        .args([
            "-k",
            "-p",
            pid_file.to_str().unwrap(),
            "-s",
            "0",
            "--",
            "[",
            "A",
            "/bin/sleep",
            "30",
            "]",
        ])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .unwrap();

    wait_for("pidfile", Duration::from_secs(5), || pid_file.exists());
    let written: u32 = fs::read_to_string(&pid_file).unwrap().trim().parse().unwrap();
    assert_eq!(written, child.id());

    sigterm(&child);
    let status = wait_with_deadline(&mut child, Duration::from_secs(5));
    assert_eq!(status.code(), Some(0));
    assert!(!pid_file.exists(), "pidfile survived a clean shutdown");
}

#[test]
fn abnormal_exit_restarts_the_graph() {
    let marker = temp_path("restart-marker");
    let _ = fs::remove_file(&marker);
    let script = format!("echo run >> {}; kill -ABRT $$", marker.display());
    let mut child = pipexec()
        .args([
            "-k", "-s", "1", "--", "[", "A", "/bin/sh", "-c", &script, "]", "[", "B",
            "/bin/sleep", "30", "]", "{A:1>B:0}",
        ])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .unwrap();

    wait_for("two launch cycles", Duration::from_secs(10), || {
        fs::read_to_string(&marker)
            .map(|runs| runs.lines().count() >= 2)
            .unwrap_or(false)
    });

    sigterm(&child);
    let status = wait_with_deadline(&mut child, Duration::from_secs(5));
    // The aborting child counts as failed, whatever run it happened in.
    assert_eq!(status.code(), Some(1));
}

#[test]
fn sighup_restarts_the_graph() {
    let marker = temp_path("sighup-marker");
    let _ = fs::remove_file(&marker);
    let script = format!("echo run >> {}; exec /bin/sleep 30", marker.display());
    let mut child = pipexec()
        .args(["-k", "-s", "1", "--", "[", "A", "/bin/sh", "-c", &script, "]"])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .unwrap();

    wait_for("first launch", Duration::from_secs(5), || {
        fs::read_to_string(&marker)
            .map(|runs| runs.lines().count() >= 1)
            .unwrap_or(false)
    });

    // SAFETY: signalling a child this test spawned.
    unsafe {
        libc::kill(child.id() as libc::pid_t, libc::SIGHUP);
    }

    wait_for("relaunch after SIGHUP", Duration::from_secs(10), || {
        fs::read_to_string(&marker)
            .map(|runs| runs.lines().count() >= 2)
            .unwrap_or(false)
    });

    sigterm(&child);
    let status = wait_with_deadline(&mut child, Duration::from_secs(5));
    assert_eq!(status.code(), Some(0));
}

#[test]
fn parent_holds_no_edge_pipe_fds_after_launch() {
    let pid_file = temp_path("fd-pidfile");
    let _ = fs::remove_file(&pid_file);
    let mut child = pipexec()
        .args([
            "-k",
            "-p",
            pid_file.to_str().unwrap(),
            "-s",
            "0",
            "--",
            "[",
            "A",
            "/bin/sleep",
            "30",
            "]",
            "[",
            "B",
            "/bin/sleep",
            "30",
            "]",
            "{A:1>B:0}",
            "{A:4>B:5}",
        ])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .unwrap();

    wait_for("pidfile", Duration::from_secs(5), || pid_file.exists());
    let pid: u32 = fs::read_to_string(&pid_file).unwrap().trim().parse().unwrap();

    // The supervisor keeps the blocking-pipe read end plus one placeholder
    // copy per endpoint fd above 2 (here A:4 and B:5). The four fds of the
    // two edge pipes must all be closed once the launch is done.
    wait_for("parent pipe fds to settle", Duration::from_secs(5), || {
        count_pipe_fds(pid) == Some(3)
    });

    sigterm(&child);
    wait_with_deadline(&mut child, Duration::from_secs(5));
}

fn count_pipe_fds(pid: u32) -> Option<usize> {
    let entries = fs::read_dir(format!("/proc/{pid}/fd")).ok()?;
    let mut count = 0;
    for entry in entries.flatten() {
        if let Ok(target) = fs::read_link(entry.path()) {
            if target.to_string_lossy().starts_with("pipe:") {
                count += 1;
            }
        }
    }
    Some(count)
}

#[test]
fn text_log_written_to_requested_fd() {
    let output = pipexec()
        .args(["-l", "2", "-s", "0", "--", "[", "A", "/bin/true", "]"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(0));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains(";pipexec;"), "stderr: {stderr}");
    assert!(stderr.contains("new child"), "stderr: {stderr}");
}

#[test]
fn json_log_written_to_requested_fd() {
    let output = pipexec()
        .args(["-j", "2", "-s", "0", "--", "[", "A", "/bin/true", "]"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(0));
    let stderr = String::from_utf8_lossy(&output.stderr);
    let line = stderr
        .lines()
        .find(|line| line.starts_with('{') && line.contains("new child"))
        .expect("no json event line on the log fd");
    assert!(line.contains("\"pipexec_pid\""), "line: {line}");
    assert!(line.contains("\"severity\":\"info\""), "line: {line}");
}

#[test]
fn fanout_replicates_producer_stream() {
    let sink_one = temp_path("fanout-1");
    let sink_two = temp_path("fanout-2");
    let _ = fs::remove_file(&sink_one);
    let _ = fs::remove_file(&sink_two);
    let catcher_one = format!("exec cat > {}", sink_one.display());
    let catcher_two = format!("exec cat > {}", sink_two.display());

    let output = pipexec()
        .args([
            "-s",
            "0",
            "--",
            "[",
            "P",
            "/bin/echo",
            "hello",
            "]",
            "[",
            "T",
            env!("CARGO_BIN_EXE_ptee"),
            "3",
            "4",
            "]",
            "[",
            "C1",
            "/bin/sh",
            "-c",
            &catcher_one,
            "]",
            "[",
            "C2",
            "/bin/sh",
            "-c",
            &catcher_two,
            "]",
            "{P:1>T:0}",
            "{T:3>C1:0}",
            "{T:4>C2:0}",
        ])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(0));
    assert_eq!(fs::read_to_string(&sink_one).unwrap(), "hello\n");
    assert_eq!(fs::read_to_string(&sink_two).unwrap(), "hello\n");
}

#[test]
fn fanin_concatenates_producer_streams() {
    let output = pipexec()
        .args([
            "-s",
            "0",
            "--",
            "[",
            "P1",
            "/bin/echo",
            "one",
            "]",
            "[",
            "P2",
            "/bin/echo",
            "two",
            "]",
            "[",
            "M",
            env!("CARGO_BIN_EXE_peet"),
            "3",
            "4",
            "]",
            "{P1:1>M:3}",
            "{P2:1>M:4}",
        ])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(0));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_eq!(output.stdout.len(), b"one\ntwo\n".len());
    assert!(stdout.contains("one\n"), "stdout: {stdout:?}");
    assert!(stdout.contains("two\n"), "stdout: {stdout:?}");
}
