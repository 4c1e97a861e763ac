//! Session orchestration modules.
//!
//! Covers the per-user session registry and the dispatcher that turns
//! direct messages into program commands.

pub mod dispatcher;
pub mod registry;
