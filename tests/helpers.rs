use std::io::Write;
use std::process::{Command, Stdio};

fn ptee() -> Command {
    Command::new(env!("CARGO_BIN_EXE_ptee"))
}

fn peet() -> Command {
    Command::new(env!("CARGO_BIN_EXE_peet"))
}

#[test]
fn ptee_replicates_input_until_eof() {
    let mut child = ptee()
        .arg("1")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .spawn()
        .unwrap();

    let payload = b"replicated bytes\nwith a second line\n";
    child.stdin.take().unwrap().write_all(payload).unwrap();
    let output = child.wait_with_output().unwrap();
    assert!(output.status.success());
    assert_eq!(output.stdout, payload);
}

#[test]
fn ptee_rejects_missing_output_fds() {
    let output = ptee().output().unwrap();
    assert_eq!(output.status.code(), Some(1));
}

#[test]
fn peet_funnels_a_single_input() {
    let mut child = peet()
        .arg("0")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .spawn()
        .unwrap();

    let payload = b"funnelled bytes";
    child.stdin.take().unwrap().write_all(payload).unwrap();
    let output = child.wait_with_output().unwrap();
    assert!(output.status.success());
    assert_eq!(output.stdout, payload);
}

#[test]
fn peet_block_mode_flushes_the_remainder() {
    let mut child = peet()
        .args(["-b", "4", "0"])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .spawn()
        .unwrap();

    // Ten bytes with a block size of four: two aligned writes plus a final
    // short flush; nothing may be lost.
    let payload = b"0123456789";
    child.stdin.take().unwrap().write_all(payload).unwrap();
    let output = child.wait_with_output().unwrap();
    assert!(output.status.success());
    assert_eq!(output.stdout, payload);
}
