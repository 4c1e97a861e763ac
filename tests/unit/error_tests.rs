//! Unit tests for `AppError` display format and classification.

use rtm_relay::AppError;

#[test]
fn display_prefixes_name_the_category() {
    assert_eq!(AppError::Auth("no url".into()).to_string(), "auth: no url");
    assert_eq!(
        AppError::Transport("reset".into()).to_string(),
        "transport: reset"
    );
    assert_eq!(
        AppError::Spawn("not found".into()).to_string(),
        "spawn: not found"
    );
    assert_eq!(
        AppError::Execution("process exited with code 2".into()).to_string(),
        "execution: process exited with code 2"
    );
    assert_eq!(AppError::CleanExit.to_string(), "clean exit");
    assert_eq!(
        AppError::FrameParse("bad".into()).to_string(),
        "frame parse: bad"
    );
}

#[test]
fn error_messages_have_no_trailing_period() {
    let err = AppError::Config("executable must not be empty".into());
    let s = err.to_string();
    assert!(!s.ends_with('.'), "error message must not end with a period: {s}");
}

#[test]
fn only_exit_outcomes_end_a_session() {
    assert!(AppError::CleanExit.ends_session());
    assert!(AppError::Execution("write failed".into()).ends_session());
    assert!(!AppError::Spawn("x".into()).ends_session());
    assert!(!AppError::Transport("x".into()).ends_session());
}

#[test]
fn io_errors_convert_to_io_variant() {
    let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed");
    let err = AppError::from(io);
    assert!(matches!(err, AppError::Io(ref msg) if msg.contains("pipe closed")));
}

#[test]
fn toml_errors_convert_to_config_variant() {
    let toml_err = toml::from_str::<toml::Value>("= broken").expect_err("invalid toml");
    let err = AppError::from(toml_err);
    assert!(err.to_string().starts_with("config: invalid config"));
}
