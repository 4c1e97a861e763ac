//! Slack RTM bridge layer modules.

pub mod auth;
pub mod connection;
pub mod message;
pub mod stream;
