//! Interactive subprocess handling.
//!
//! - `framer`: splits unframed program output into turns by quiescence.
//! - `session`: owns one program instance and exposes a request/response
//!   `execute` call on top of its pipes.

pub mod framer;
pub mod session;
