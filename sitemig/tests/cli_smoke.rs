use std::process::Command;

fn run_cli(args: &[&str]) -> std::process::Output {
    let exe = env!("CARGO_BIN_EXE_sitemig");
    Command::new(exe)
        .args(args)
        .env_remove("SITEMIG_DRIVE_TOKEN")
        .output()
        .expect("sitemig should execute")
}

#[test]
fn help_lists_commands() {
    let output = run_cli(&["--help"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for command in ["import", "upload", "publish", "urls"] {
        assert!(stdout.contains(command), "missing {command} in help");
    }
    assert!(stdout.contains("--concurrency"));
}

#[test]
fn upload_help_lists_modes() {
    let output = run_cli(&["upload", "--help"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("--mode"));
    assert!(stdout.contains("overwriteOlder"));
    assert!(stdout.contains("--no-convert"));
}

#[test]
fn unknown_mode_exits_non_zero() {
    let dir = tempfile::tempdir().expect("tempdir");
    let output = run_cli(&[
        "upload",
        "--target",
        "folder",
        "--source",
        dir.path().to_str().expect("utf-8 path"),
        "--token",
        "t",
        "--mode",
        "mirror",
        "--report-dir",
        dir.path().to_str().expect("utf-8 path"),
    ]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("unknown sync mode"));
}

#[test]
fn missing_url_list_exits_non_zero() {
    let dir = tempfile::tempdir().expect("tempdir");
    let output = run_cli(&[
        "import",
        "--urls",
        dir.path().join("missing.json").to_str().expect("utf-8 path"),
        "--target",
        dir.path().join("docs").to_str().expect("utf-8 path"),
    ]);
    assert_eq!(output.status.code(), Some(1));
}
