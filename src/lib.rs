#![forbid(unsafe_code)]

//! `rtm-relay` bridges Slack direct messages to per-user sessions of an
//! interactive line-oriented program.

pub mod config;
pub mod errors;
pub mod orchestrator;
pub mod process;
pub mod slack;

pub use config::GlobalConfig;
pub use errors::{AppError, Result};
