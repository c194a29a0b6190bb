//! Command handlers.
//!
//! Each handler is `execute(ctx, ...)`: validate CLI input, build what it
//! needs through the [`CliContext`](crate::CliContext), format output for the
//! terminal.

pub mod chat;
pub mod config;
pub mod say;
