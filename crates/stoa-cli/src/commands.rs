//! Subcommands.

use clap::Subcommand;

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Start an interactive conversation
    Chat {
        /// Display replies without speaking them
        #[arg(long)]
        no_speak: bool,

        /// Go idle after each reply instead of listening again
        #[arg(long)]
        single_turn: bool,

        /// Override the system prompt
        #[arg(long)]
        system_prompt: Option<String>,

        /// Dictate through the microphone (needs the `microphone` feature)
        #[arg(long)]
        mic: bool,

        /// Open with quick question N (1-5) instead of listening
        #[arg(long, value_name = "N", value_parser = clap::value_parser!(u8).range(1..=5))]
        preset: Option<u8>,
    },

    /// Speak a line of text and exit once playback has finished
    Say {
        /// Text to speak
        #[arg(required = true, num_args = 1..)]
        text: Vec<String>,
    },

    /// Print the effective settings
    Config,
}
