//! Main CLI parser and top-level argument handling.

use std::path::PathBuf;

use clap::Parser;

use crate::commands::Commands;

/// Talk to a Stoic mentor, by voice or keyboard.
#[derive(Debug, Parser)]
#[command(name = "stoa")]
#[command(about = "Half-duplex voice conversations with a hosted language model")]
#[command(version)]
pub struct Cli {
    /// Settings file (TOML); defaults to ./stoa.toml when present
    #[arg(long = "config", short = 'c', global = true, env = "STOA_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable verbose/debug output
    #[arg(short = 'v', long = "verbose", global = true)]
    pub verbose: bool,

    /// Never open an audio device; playback is paced silently
    #[arg(long = "no-audio", global = true)]
    pub no_audio: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}
