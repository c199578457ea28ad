//! Tests for server startup and shutdown: the in-process server over TCP,
//! and the binary's startup validation.

mod common;

use stanza::start_server;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::process::{Command, Stdio};
use std::time::Duration;

/// Send a JSON POST over a plain TCP connection and return the raw response.
async fn post_json(addr: SocketAddr, path: &str, body: &str) -> String {
    let request = format!(
        "POST {} HTTP/1.1\r\nHost: {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        path,
        addr,
        body.len(),
        body
    );
    tokio::task::spawn_blocking(move || {
        let mut stream = TcpStream::connect(addr).expect("Failed to connect");
        stream
            .set_read_timeout(Some(Duration::from_secs(10)))
            .unwrap();
        stream.write_all(request.as_bytes()).unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).unwrap();
        response
    })
    .await
    .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_server_serves_and_shuts_down() {
    let config = common::test_config().await;
    let db = config.db.clone();
    let alice = db.users().create("alice", "pw-alice-123").await.unwrap();
    let poem = db
        .content()
        .create_poem(&alice.uuid, "alice", "Spring", "...")
        .await
        .unwrap();

    let server = start_server(config, 0).await.unwrap();
    let addr = server.addr;

    let response = post_json(
        addr,
        "/api/session/login",
        r#"{"username":"alice","password":"pw-alice-123"}"#,
    )
    .await;
    assert!(response.starts_with("HTTP/1.1 200"), "got: {}", response);
    assert!(response.contains("refresh_token="));

    // The server's consumers pick up renames
    db.users().rename(&alice.uuid, "alicia").await.unwrap();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let current = db.content().get_poem(&poem.uuid).await.unwrap().unwrap();
        if current.author_name == "alicia" {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "rename not propagated");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    tokio::time::timeout(Duration::from_secs(10), server.shutdown())
        .await
        .expect("Shutdown did not finish");

    assert!(TcpStream::connect(addr).is_err());
}

#[test]
fn test_missing_jwt_secret_exits_with_error() {
    let output = Command::new(env!("CARGO_BIN_EXE_stanza"))
        .env_remove("JWT_SECRET")
        .env_remove("RUST_LOG")
        .stderr(Stdio::piped())
        .stdout(Stdio::piped())
        .output()
        .expect("Failed to run binary");

    assert!(
        !output.status.success(),
        "Should exit with error when JWT_SECRET is missing"
    );

    // tracing logs to stdout by default
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    let combined = format!("{}{}", stdout, stderr);
    assert!(
        combined.contains("JWT_SECRET") && combined.contains("required"),
        "Should mention JWT_SECRET is required, got: {}",
        combined
    );
}

#[test]
fn test_short_jwt_secret_exits_with_error() {
    let output = Command::new(env!("CARGO_BIN_EXE_stanza"))
        .env("JWT_SECRET", "too-short")
        .env_remove("RUST_LOG")
        .stderr(Stdio::piped())
        .stdout(Stdio::piped())
        .output()
        .expect("Failed to run binary");

    assert!(!output.status.success());
    let combined = format!(
        "{}{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
    assert!(combined.contains("shorter than"), "got: {}", combined);
}

#[test]
fn test_valid_config_starts() {
    let database = std::env::temp_dir().join(format!("stanza-startup-{}.db", std::process::id()));

    let mut child = Command::new(env!("CARGO_BIN_EXE_stanza"))
        .env("JWT_SECRET", "test-secret-that-is-long-enough!!")
        .args(["--port", "0", "--database"])
        .arg(&database)
        .stderr(Stdio::piped())
        .stdout(Stdio::piped())
        .spawn()
        .expect("Failed to run binary");

    // Give it a moment to start or fail
    std::thread::sleep(Duration::from_millis(500));

    let status = child.try_wait().expect("Failed to check process");
    let _ = child.kill();
    let _ = child.wait();
    let _ = std::fs::remove_file(&database);

    assert!(status.is_none(), "Server exited early: {:?}", status);
}
