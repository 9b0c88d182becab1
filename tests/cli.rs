use std::process::Command;

use weft::{Handle, Op, Program, Value};

fn weft() -> Command {
    Command::new(env!("CARGO_BIN_EXE_weft"))
}

fn echo_program() -> Program {
    Program::new(vec![Op::GetSelf, Op::AppendValue, Op::Return], vec![])
        .with_entry("main", Handle(0))
}

#[test]
fn renders_a_program_against_a_data_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let program_path = dir.path().join("echo.json");
    let data_path = dir.path().join("data.json");
    std::fs::write(&program_path, serde_json::to_string(&echo_program()).unwrap()).unwrap();
    std::fs::write(&data_path, serde_json::to_string(&Value::Text("hello".into())).unwrap())
        .unwrap();

    let out = weft()
        .arg(&program_path)
        .arg("--data")
        .arg(&data_path)
        .output()
        .expect("failed to run weft");
    assert!(out.status.success(), "stderr: {}", String::from_utf8_lossy(&out.stderr));
    assert_eq!(String::from_utf8_lossy(&out.stdout).trim(), "hello");
}

#[test]
fn step_mode_reports_the_step_count() {
    let dir = tempfile::tempdir().expect("tempdir");
    let program_path = dir.path().join("echo.json");
    std::fs::write(&program_path, serde_json::to_string(&echo_program()).unwrap()).unwrap();

    let out = weft()
        .arg(&program_path)
        .arg("--steps")
        .output()
        .expect("failed to run weft");
    assert!(out.status.success(), "stderr: {}", String::from_utf8_lossy(&out.stderr));
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.starts_with("steps: 3"), "unexpected output: {}", stdout);
}

#[test]
fn unknown_entry_fails_with_a_message() {
    let dir = tempfile::tempdir().expect("tempdir");
    let program_path = dir.path().join("echo.json");
    std::fs::write(&program_path, serde_json::to_string(&echo_program()).unwrap()).unwrap();

    let out = weft()
        .arg(&program_path)
        .args(["--entry", "missing"])
        .output()
        .expect("failed to run weft");
    assert!(!out.status.success());
    assert!(String::from_utf8_lossy(&out.stderr).contains("unknown entry point"));
}
