//! CLI and process-level shutdown tests.
//!
//! Tests:
//! - CLI help and version output
//! - SIGINT drains the server and exits cleanly
//! - Startup fails fast on a malformed collector endpoint

use std::net::TcpListener;
use std::process::Command;
use std::time::Duration;

const DICE_BIN: &str = env!("CARGO_BIN_EXE_dice");

/// Pick a loopback port that is free right now.
fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("failed to bind probe listener");
    listener.local_addr().expect("no local addr").port()
}

/// CLI --help output should show expected options.
#[test]
fn test_cli_help_output() {
    let output = Command::new(DICE_BIN)
        .arg("--help")
        .output()
        .expect("failed to run");

    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(stdout.contains("--port"), "help should mention --port option");
    assert!(
        stdout.contains("--otel-endpoint"),
        "help should mention --otel-endpoint option"
    );
    assert!(
        stdout.contains("--drain-timeout-ms"),
        "help should mention --drain-timeout-ms option"
    );
    assert!(
        stdout.contains("dice") || stdout.contains("Dice"),
        "help should mention dice"
    );
}

/// CLI --version should show version.
#[test]
fn test_cli_version_output() {
    let output = Command::new(DICE_BIN)
        .arg("--version")
        .output()
        .expect("failed to run");

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(
        stdout.contains(env!("CARGO_PKG_VERSION")),
        "version output should contain version number: {}",
        stdout
    );
}

/// A malformed collector endpoint aborts startup with a non-zero exit.
#[test]
fn test_malformed_endpoint_fails_startup() {
    let output = Command::new(DICE_BIN)
        .args(["--host", "127.0.0.1", "--port", &free_port().to_string()])
        .args(["--otel-endpoint", "not a url"])
        .env_remove("RUST_LOG")
        .output()
        .expect("failed to run");

    assert!(!output.status.success(), "startup should fail");
}

/// SIGINT triggers graceful shutdown and a zero exit code.
#[cfg(unix)]
#[tokio::test]
async fn test_graceful_shutdown_on_sigint() {
    use std::process::Stdio;
    use tokio::process::Command as TokioCommand;
    use tokio::time::timeout;

    let port = free_port();
    let mut child = TokioCommand::new(DICE_BIN)
        .args(["--host", "127.0.0.1", "--port", &port.to_string()])
        .env_remove("OTEL_EXPORTER_OTLP_ENDPOINT")
        .env_remove("RUST_LOG")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .expect("failed to spawn server");

    // Wait for the listener to come up
    let addr = format!("127.0.0.1:{port}");
    let mut ready = false;
    for _ in 0..100 {
        if tokio::net::TcpStream::connect(&addr).await.is_ok() {
            ready = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(ready, "server did not start listening");
    // Give the signal handler task time to install
    tokio::time::sleep(Duration::from_millis(200)).await;

    let pid = child.id().expect("no pid");
    let _ = std::process::Command::new("kill")
        .args(["-INT", &pid.to_string()])
        .status();

    match timeout(Duration::from_secs(10), child.wait()).await {
        Ok(Ok(status)) => {
            assert!(status.success(), "server should exit cleanly, got {status}");
        }
        Ok(Err(e)) => panic!("failed to wait for child: {}", e),
        Err(_) => {
            child.kill().await.expect("failed to kill");
            panic!("server did not respond to SIGINT within timeout");
        }
    }
}
