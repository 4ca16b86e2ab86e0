use anyhow::{Context, Result};
use std::io::{BufRead, BufReader};
use std::process::{Command, Stdio};
use std::sync::mpsc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

/// Helper to run the CLI binary with given args
fn run_cli(temp_dir: &TempDir, args: &[&str]) -> Result<std::process::Output> {
    let mut cmd = Command::new("cargo");
    cmd.args(["run", "-p", "harmonica-refresh", "--"])
        .arg("--base-dir")
        .arg(temp_dir.path().to_string_lossy().as_ref())
        .args(args)
        .env("RUST_LOG", "error"); // Reduce log noise

    let output = cmd.output()?;
    Ok(output)
}

/// Helper to write a config that summarizes with `echo`
fn write_echo_config(temp_dir: &TempDir) -> Result<String> {
    let path = temp_dir.path().join("refresh.toml");
    std::fs::write(
        &path,
        "debounce_secs = 1\npoll_interval_secs = 1\nsummarizer_command = [\"echo\"]\n",
    )?;
    Ok(path.to_string_lossy().into_owned())
}

/// Helper to seed two sessions, a participant, and a project
fn seed(temp_dir: &TempDir) -> Result<()> {
    for args in [
        vec!["add-session", "sess-1"],
        vec!["add-session", "sess-2"],
        vec!["add-participant", "user-1", "sess-2"],
        vec!["add-project", "proj-1", "sess-1", "sess-2"],
    ] {
        let output = run_cli(temp_dir, &args)?;
        assert!(
            output.status.success(),
            "{args:?} failed: {}",
            String::from_utf8_lossy(&output.stderr)
        );
    }
    Ok(())
}

fn status_json(temp_dir: &TempDir, args: &[&str]) -> Result<serde_json::Value> {
    let output = run_cli(temp_dir, args)?;
    assert!(output.status.success());
    Ok(serde_json::from_slice(&output.stdout)?)
}

#[test]
fn test_cli_init() -> Result<()> {
    let temp_dir = TempDir::new()?;

    let output = run_cli(&temp_dir, &["init"])?;
    assert!(output.status.success());

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Initialized summary database"));
    assert!(temp_dir.path().join(".harmonica.db").exists());

    Ok(())
}

#[test]
fn test_cli_edit_marks_session_stale() -> Result<()> {
    let temp_dir = TempDir::new()?;
    seed(&temp_dir)?;

    let status = status_json(&temp_dir, &["status", "sess-1", "--format", "json"])?;
    assert_eq!(status["stale"], false);
    assert_eq!(status["summary"], serde_json::Value::Null);

    let output = run_cli(&temp_dir, &["edit", "sess-1"])?;
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("Recorded edit on sess-1"));

    let status = status_json(&temp_dir, &["status", "sess-1", "--format", "json"])?;
    assert_eq!(status["stale"], true);
    assert_eq!(status["kind"], "session");

    Ok(())
}

#[test]
fn test_cli_participant_edit_marks_project_stale() -> Result<()> {
    let temp_dir = TempDir::new()?;
    seed(&temp_dir)?;

    let output = run_cli(&temp_dir, &["edit", "sess-2", "--participant", "user-1"])?;
    assert!(output.status.success());

    let project = status_json(&temp_dir, &["status", "proj-1", "--project", "--format", "json"])?;
    assert_eq!(project["stale"], true);
    assert_eq!(project["kind"], "project");

    let untouched = status_json(&temp_dir, &["status", "sess-1", "--format", "json"])?;
    assert_eq!(untouched["stale"], false);

    Ok(())
}

#[cfg(unix)]
#[test]
fn test_cli_refresh_with_command_summarizer() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let config = write_echo_config(&temp_dir)?;
    seed(&temp_dir)?;
    run_cli(&temp_dir, &["edit", "sess-1"])?;

    let output = run_cli(&temp_dir, &["--config", &config, "refresh", "sess-1"])?;
    assert!(
        output.status.success(),
        "refresh failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    assert!(String::from_utf8_lossy(&output.stdout).contains("Refreshed summary for sess-1"));

    let status = status_json(&temp_dir, &["status", "sess-1", "--format", "json"])?;
    assert_eq!(status["stale"], false);
    assert_eq!(status["summary"], "sess-1");

    // Project refresh defaults to the linked sessions
    let output = run_cli(
        &temp_dir,
        &["--config", &config, "refresh", "proj-1", "--project"],
    )?;
    assert!(output.status.success());
    let project = status_json(&temp_dir, &["status", "proj-1", "--project", "--format", "json"])?;
    assert_eq!(project["summary"], "proj-1 sess-1 sess-2");

    Ok(())
}

#[cfg(unix)]
#[test]
fn test_cli_watch_prints_status_changes() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let config = write_echo_config(&temp_dir)?;
    seed(&temp_dir)?;
    run_cli(&temp_dir, &["edit", "sess-1"])?;

    // Run the built binary directly so killing it leaves nothing behind
    let mut child = Command::new(env!("CARGO_BIN_EXE_harmonica-refresh"))
        .arg("--base-dir")
        .arg(temp_dir.path())
        .args(["--config", &config, "watch", "sess-1", "--immediate"])
        .env("RUST_LOG", "error")
        .stdout(Stdio::piped())
        .spawn()?;
    let stdout = child.stdout.take().context("watch stdout not captured")?;

    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        for line in BufReader::new(stdout).lines().map_while(|line| line.ok()) {
            if tx.send(line).is_err() {
                break;
            }
        }
    });

    let mut lines: Vec<String> = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(30);
    while !lines.iter().any(|line| line.ends_with("sess-1 up_to_date")) {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match rx.recv_timeout(remaining) {
            Ok(line) => lines.push(line),
            Err(_) => break,
        }
    }
    child.kill()?;
    child.wait()?;

    assert!(lines[0].contains("Watching sess-1"), "{lines:?}");
    assert!(
        lines.iter().any(|line| line.ends_with("sess-1 update_started")),
        "{lines:?}"
    );
    assert!(
        lines.iter().any(|line| line.ends_with("sess-1 up_to_date")),
        "{lines:?}"
    );

    let status = status_json(&temp_dir, &["status", "sess-1", "--format", "json"])?;
    assert_eq!(status["summary"], "sess-1");

    Ok(())
}

#[test]
fn test_cli_refresh_requires_summarizer() -> Result<()> {
    let temp_dir = TempDir::new()?;
    seed(&temp_dir)?;

    let output = run_cli(&temp_dir, &["refresh", "sess-1"])?;
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("No summarizer_command configured"));

    Ok(())
}

#[test]
fn test_cli_status_summary_format() -> Result<()> {
    let temp_dir = TempDir::new()?;
    seed(&temp_dir)?;

    let output = run_cli(&temp_dir, &["status", "sess-1"])?;
    assert!(output.status.success());

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("session sess-1"));
    assert!(stdout.contains("Last edit: never"));
    assert!(stdout.contains("Summary: (none)"));

    Ok(())
}

#[test]
fn test_cli_error_handling() -> Result<()> {
    let temp_dir = TempDir::new()?;
    run_cli(&temp_dir, &["init"])?;

    // Unknown session
    let output = run_cli(&temp_dir, &["status", "missing"])?;
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("Unknown session: missing"));

    // Invalid format
    let output = run_cli(&temp_dir, &["status", "missing", "--format", "invalid"])?;
    assert!(!output.status.success());

    // Invalid config
    let bad_config = temp_dir.path().join("bad.toml");
    std::fs::write(&bad_config, "debounce_secs = 0\n")?;
    let output = run_cli(
        &temp_dir,
        &["--config", &bad_config.to_string_lossy(), "status", "missing"],
    )?;
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("debounce_secs must be positive"));

    Ok(())
}
