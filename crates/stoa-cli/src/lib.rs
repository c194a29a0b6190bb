//! `stoa` command-line front end.
//!
//! Wires the voice engine to hosted generation and synthesis services and a
//! terminal "microphone" (typed lines stand in for recognizer finals), or to
//! real microphone dictation with the `microphone` feature.

#![deny(unsafe_code)]

#[cfg(test)]
use tokio_test as _;

pub mod bootstrap;
pub mod commands;
pub mod config;
pub mod error;
pub mod handlers;
pub mod keyboard;
pub mod parser;

pub use bootstrap::{CliConfig, CliContext, bootstrap};
pub use commands::Commands;
pub use config::StoaSettings;
pub use error::CliError;
pub use keyboard::KeyboardRecognizer;
pub use parser::Cli;
