//! Integration tests for subprocess sessions against a scripted program.

use std::time::Duration;

use rtm_relay::process::session::{ExitState, ProcessSession, SessionConfig};
use rtm_relay::AppError;

use super::test_helpers::{script_config, wait_until_exited, BANNER};

async fn start() -> ProcessSession {
    let (session, banner) = ProcessSession::start(&script_config())
        .await
        .expect("session starts");
    assert_eq!(banner, BANNER);
    session
}

#[tokio::test]
async fn start_returns_banner_and_live_session() {
    let session = start().await;

    assert!(session.is_alive());
    assert!(session.pid().is_some());
    assert!(session.exit_state().is_none());
    assert!(!session.session_id().is_empty());

    session.close().await;
}

#[tokio::test]
async fn execute_returns_the_next_turn() {
    let session = start().await;

    let reply = session.execute("go north").await.expect("command runs");
    assert_eq!(reply, "You said: go north\n");

    let reply = session.execute("open mailbox").await.expect("command runs");
    assert_eq!(reply, "You said: open mailbox\n");
    assert!(session.is_alive());

    session.close().await;
}

#[tokio::test]
async fn clean_exit_delivers_final_words_then_reports_clean_exit() {
    let session = start().await;

    let farewell = session.execute("quit").await.expect("final turn delivered");
    assert_eq!(farewell, "Goodbye\n");

    wait_until_exited(&session).await;
    assert_eq!(session.exit_state(), Some(ExitState::Clean));

    let err = session.execute("look").await.expect_err("program is gone");
    assert!(matches!(err, AppError::CleanExit), "got {err:?}");

    let err = session.execute("look").await.expect_err("still gone");
    assert!(matches!(err, AppError::CleanExit), "got {err:?}");
}

#[tokio::test]
async fn abnormal_exit_is_an_execution_error() {
    let session = start().await;

    let err = session.execute("crash").await.expect_err("program crashed");
    match err {
        AppError::Execution(reason) => assert!(reason.contains("code 3"), "got {reason}"),
        other => panic!("expected execution error, got {other:?}"),
    }
    assert!(!session.is_alive());
}

#[tokio::test]
async fn close_is_idempotent() {
    let session = start().await;

    session.close().await;
    assert!(!session.is_alive());
    assert_eq!(session.exit_state(), Some(ExitState::Killed));

    session.close().await;

    let err = session.execute("look").await.expect_err("closed session");
    assert!(matches!(err, AppError::Execution(ref msg) if msg == "session closed"));
}

#[tokio::test]
async fn close_after_natural_exit_is_a_no_op() {
    let session = start().await;
    session.execute("quit").await.expect("final turn delivered");
    wait_until_exited(&session).await;

    session.close().await;
    assert_eq!(session.exit_state(), Some(ExitState::Clean));
}

#[tokio::test]
async fn missing_executable_is_a_spawn_error() {
    let config = SessionConfig {
        executable: "/nonexistent/rtm-relay-test-program".into(),
        ..script_config()
    };

    let err = ProcessSession::start(&config)
        .await
        .expect_err("spawn fails");
    assert!(matches!(err, AppError::Spawn(ref msg) if msg.starts_with("failed to spawn")));
}

#[tokio::test]
async fn program_exiting_silently_is_a_spawn_error() {
    let config = SessionConfig {
        executable: "sh".into(),
        args: vec!["-c".into(), "exit 0".into()],
        ..script_config()
    };

    let err = ProcessSession::start(&config)
        .await
        .expect_err("no banner");
    assert!(
        matches!(err, AppError::Spawn(ref msg) if msg.contains("exited before producing output")),
        "got {err:?}"
    );
}

#[tokio::test]
async fn silent_program_times_out_at_startup() {
    let config = SessionConfig {
        executable: "sh".into(),
        args: vec!["-c".into(), "sleep 30".into()],
        startup_timeout: Duration::from_millis(200),
        ..script_config()
    };

    let err = ProcessSession::start(&config)
        .await
        .expect_err("no banner in time");
    assert!(
        matches!(err, AppError::Spawn(ref msg) if msg.contains("no output within")),
        "got {err:?}"
    );
}

#[tokio::test]
#[serial_test::serial]
async fn credential_is_not_passed_to_the_program() {
    std::env::set_var("SLACK_TOKEN_LEAK_CHECK", "xoxb-secret");
    let config = SessionConfig {
        executable: "sh".into(),
        args: vec![
            "-c".into(),
            r#"echo "token=${SLACK_TOKEN_LEAK_CHECK:-unset}"; read -r _"#.into(),
        ],
        ..script_config()
    };

    let (session, banner) = ProcessSession::start(&config)
        .await
        .expect("session starts");
    std::env::remove_var("SLACK_TOKEN_LEAK_CHECK");

    assert_eq!(banner, "token=unset\n");
    session.close().await;
}

#[tokio::test]
async fn oversized_stderr_line_does_not_break_the_program() {
    let script = r#"
head -c 9000 /dev/zero | tr '\0' x >&2
echo >&2
sleep 0.2
echo "still logging" >&2
echo "Ready"
while IFS= read -r line; do
  echo "warning: $line" >&2
  echo "ok $line"
done
"#;
    let config = SessionConfig {
        executable: "sh".into(),
        args: vec!["-c".into(), script.into()],
        ..script_config()
    };

    let (session, banner) = ProcessSession::start(&config)
        .await
        .expect("stderr keeps draining after an over-long line");
    assert_eq!(banner, "Ready\n");

    let reply = session.execute("look").await.expect("command runs");
    assert_eq!(reply, "ok look\n");
    assert!(session.is_alive());

    session.close().await;
}
