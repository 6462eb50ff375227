//! Integration tests for spawning and stopping a real child process.
//!
//! The child is a small `sh` script standing in for the chat client. These
//! tests spawn processes, so they run serially.

#![cfg(unix)]

use std::time::{Duration, Instant};

use nix::sys::signal::kill;
use nix::unistd::Pid;
use serial_test::serial;

use stdio_bridge::bridge::supervisor::ProcessState;
use stdio_bridge::bus::ChannelNotice;
use stdio_bridge::AppError;

use super::test_helpers::{harness, make_executable, recv, test_config, write_script, WAIT};

fn sh_config(script: &std::path::Path) -> stdio_bridge::BridgeConfig {
    let mut config = test_config(script);
    config.interpreter = "sh".into();
    config
}

/// Poll `path` until it contains `needle` or [`WAIT`] elapses.
async fn wait_for_contents(path: &std::path::Path, needle: &str) -> String {
    let deadline = Instant::now() + WAIT;
    loop {
        let contents = std::fs::read_to_string(path).unwrap_or_default();
        if contents.contains(needle) || Instant::now() >= deadline {
            return contents;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[tokio::test]
#[serial]
async fn empty_token_keeps_channel_inert() {
    let dir = tempfile::tempdir().expect("tempdir");
    let script = write_script(dir.path(), "client.sh", "exit 0\n");
    let mut config = sh_config(&script);
    config.token = String::new();
    let h = harness(config);

    let result = h.channel.start().await;

    match result {
        Err(AppError::Config(msg)) => assert!(msg.contains("credential"), "got: {msg}"),
        other => panic!("expected Err(AppError::Config), got: {other:?}"),
    }
    assert_eq!(h.channel.state(), ProcessState::Stopped);
    h.channel.send("C1", "hello").await.expect("inert send is a no-op");
}

#[tokio::test]
#[serial]
async fn missing_script_is_config_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let h = harness(sh_config(&dir.path().join("absent.sh")));

    let result = h.channel.start().await;

    match result {
        Err(AppError::Config(msg)) => assert!(msg.contains("not found"), "got: {msg}"),
        other => panic!("expected Err(AppError::Config), got: {other:?}"),
    }
    assert_eq!(h.channel.state(), ProcessState::Stopped);
}

#[tokio::test]
#[serial]
async fn direct_launch_requires_exec_bit() {
    let dir = tempfile::tempdir().expect("tempdir");
    let script = write_script(dir.path(), "client", "#!/bin/sh\nexit 0\n");
    let mut config = test_config(&script);
    config.interpreter = String::new();
    let h = harness(config);

    let result = h.channel.start().await;

    match result {
        Err(AppError::Config(msg)) => assert!(msg.contains("not executable"), "got: {msg}"),
        other => panic!("expected Err(AppError::Config), got: {other:?}"),
    }
}

#[tokio::test]
#[serial]
async fn unlaunchable_interpreter_is_spawn_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let script = write_script(dir.path(), "client.js", "// client\n");
    let mut config = test_config(&script);
    config.interpreter = dir.path().join("no-such-runtime").display().to_string();
    let h = harness(config);

    let result = h.channel.start().await;

    assert!(matches!(result, Err(AppError::Spawn(_))), "got: {result:?}");
    assert_eq!(h.channel.state(), ProcessState::Stopped);
}

#[tokio::test]
#[serial]
async fn round_trip_with_child_process() {
    let dir = tempfile::tempdir().expect("tempdir");
    let log = dir.path().join("received.log");
    let body = format!(
        r#"trap '' TERM
echo '{{"type":"starting"}}'
echo "client booting" >&2
printf '{{"type":"ready","data":{{"user_id":"B1","username":"%s"}}}}\n' "$1"
echo '{{"type":"message","data":{{"channel_id":"C1","sender_id":"U1","sender_name":"Bob","content":"hi","message_id":"M1","is_dm":false}}}}'
while IFS= read -r line; do
  printf '%s\n' "$line" >> '{log}'
  case "$line" in
    *'"type":"stop"'*) exit 0 ;;
  esac
done
"#,
        log = log.display()
    );
    let script = write_script(dir.path(), "client.sh", &body);
    let mut h = harness(sh_config(&script));

    h.channel.start().await.expect("start");
    assert!(h.channel.is_running().await);

    match recv(&mut h.notices).await {
        ChannelNotice::Ready { username, .. } => {
            assert_eq!(username, "test-token", "credential is the first argument");
        }
        other => panic!("expected Ready, got: {other:?}"),
    }
    let msg = recv(&mut h.inbound).await;
    assert_eq!(msg.sender_id, "U1|Bob");
    assert_eq!(msg.chat_id, "C1");

    h.channel
        .send_to_sender("U1", "hello back")
        .await
        .expect("send");
    let received = wait_for_contents(&log, "hello back").await;
    assert!(
        received.contains(r#"{"type":"send","data":{"channel_id":"C1","content":"hello back"}}"#),
        "got: {received}"
    );

    h.channel.stop().await.expect("stop");

    let received = std::fs::read_to_string(&log).expect("log");
    assert!(received.ends_with("{\"type\":\"stop\"}\n"), "got: {received}");
    assert_eq!(h.channel.state(), ProcessState::Stopped);
    assert!(!h.channel.is_running().await);
}

#[tokio::test]
#[serial]
async fn direct_launch_passes_token() {
    let dir = tempfile::tempdir().expect("tempdir");
    let script = write_script(
        dir.path(),
        "client",
        "#!/bin/sh\nprintf '{\"type\":\"ready\",\"data\":{\"user_id\":\"B1\",\"username\":\"%s\"}}\\n' \"$1\"\nwhile read -r line; do :; done\n",
    );
    make_executable(&script);
    let mut config = test_config(&script);
    config.interpreter = String::new();
    let mut h = harness(config);

    h.channel.start().await.expect("start");

    match recv(&mut h.notices).await {
        ChannelNotice::Ready { username, .. } => assert_eq!(username, "test-token"),
        other => panic!("expected Ready, got: {other:?}"),
    }

    h.channel.stop().await.expect("stop");
}

#[tokio::test]
#[serial]
async fn unexpected_exit_is_reported() {
    let dir = tempfile::tempdir().expect("tempdir");
    let script = write_script(
        dir.path(),
        "client.sh",
        "echo '{\"type\":\"ready\",\"data\":{\"user_id\":\"B1\",\"username\":\"bot\"}}'\nexit 3\n",
    );
    let mut h = harness(sh_config(&script));
    let mut state = h.channel.subscribe_state();

    h.channel.start().await.expect("start");

    assert!(matches!(
        recv(&mut h.notices).await,
        ChannelNotice::Ready { .. }
    ));
    match recv(&mut h.notices).await {
        ChannelNotice::Disconnected { reason, .. } => {
            assert!(reason.contains("exited with code 3"), "got: {reason}");
        }
        other => panic!("expected Disconnected, got: {other:?}"),
    }

    tokio::time::timeout(WAIT, state.wait_for(|s| *s == ProcessState::Stopped))
        .await
        .expect("stopped within timeout")
        .expect("state channel open");

    h.channel.send("C1", "late").await.expect("no-op send");
    h.channel.stop().await.expect("stop after exit");
}

#[tokio::test]
#[serial]
async fn restart_after_stop_spawns_new_child() {
    let dir = tempfile::tempdir().expect("tempdir");
    let script = write_script(dir.path(), "client.sh", "while read -r line; do :; done\n");
    let h = harness(sh_config(&script));

    h.channel.start().await.expect("first start");
    let again = h.channel.start().await;
    assert!(matches!(again, Err(AppError::Spawn(_))), "got: {again:?}");

    h.channel.stop().await.expect("stop");
    h.channel.start().await.expect("second start");
    assert!(h.channel.is_running().await);
    h.channel.stop().await.expect("final stop");
}

#[tokio::test]
#[serial]
async fn child_ignoring_term_is_killed_after_timeout() {
    let dir = tempfile::tempdir().expect("tempdir");
    let script = write_script(
        dir.path(),
        "client.sh",
        "trap '' TERM\necho '{\"type\":\"starting\"}'\nwhile true; do :; done\n",
    );
    let h = harness(sh_config(&script));

    h.channel.start().await.expect("start");
    assert!(h.channel.is_running().await);

    let started = Instant::now();
    h.channel.stop().await.expect("stop");
    let elapsed = started.elapsed();

    assert!(
        elapsed >= Duration::from_millis(900),
        "SIGTERM is ignored, so stop waits out the timeout: {elapsed:?}"
    );
    assert!(elapsed < WAIT, "stop must escalate to a kill: {elapsed:?}");
    assert_eq!(h.channel.state(), ProcessState::Stopped);
}

#[tokio::test]
#[serial]
async fn stop_stays_within_timeout_when_everything_is_stuck() {
    let dir = tempfile::tempdir().expect("tempdir");
    // Ignores SIGTERM and floods stdout faster than anyone drains the bus.
    let script = write_script(
        dir.path(),
        "client.sh",
        "trap '' TERM\nwhile true; do echo '{\"type\":\"message\",\"data\":{\"channel_id\":\"C1\",\"sender_id\":\"U1\",\"content\":\"spam\"}}'; done\n",
    );
    let mut h = harness(sh_config(&script));

    h.channel.start().await.expect("start");
    recv(&mut h.inbound).await;
    // Let the bus, the event queue and the pipe fill up.
    tokio::time::sleep(Duration::from_millis(300)).await;

    let timeout = h.channel.config().stop_timeout();
    let started = Instant::now();
    h.channel.stop().await.expect("stop");
    let elapsed = started.elapsed();

    assert!(
        elapsed < timeout + Duration::from_millis(200),
        "stop overran its {timeout:?} timeout: {elapsed:?}"
    );
    assert_eq!(h.channel.state(), ProcessState::Stopped);
}

#[tokio::test]
#[serial]
async fn supervisor_kill_reaps_process() {
    use stdio_bridge::bridge::reader::StreamEvent;
    use stdio_bridge::bridge::supervisor::{LaunchSpec, ProcessSupervisor};

    let dir = tempfile::tempdir().expect("tempdir");
    let script = write_script(
        dir.path(),
        "client.sh",
        "trap '' TERM\nwhile true; do :; done\n",
    );
    let launch = LaunchSpec::from_config(&sh_config(&script));
    let supervisor = ProcessSupervisor::new();
    let (tx, _rx) = tokio::sync::mpsc::channel::<StreamEvent>(8);

    supervisor.start(&launch, tx).await.expect("start");
    let pid = supervisor.pid().await.expect("pid");
    assert!(supervisor.session_id().await.is_some());

    supervisor
        .stop(Duration::from_millis(300))
        .await
        .expect("stop");

    let raw = i32::try_from(pid).expect("pid fits");
    assert!(
        kill(Pid::from_raw(raw), None).is_err(),
        "child {pid} must be gone after stop"
    );
    assert_eq!(supervisor.state(), ProcessState::Stopped);
    assert!(supervisor.pid().await.is_none());
}
