//! Config command handler.

use anyhow::{Context, Result};

use crate::bootstrap::CliContext;

/// Print the effective settings as TOML. API keys are reported as set or
/// missing, never printed.
pub fn execute(ctx: &CliContext) -> Result<()> {
    let effective = ctx.settings().effective()?;
    let text = toml::to_string_pretty(&effective).context("Failed to render settings")?;
    println!("{text}");

    let status = |set: bool| if set { "set" } else { "missing" };
    println!("# OPENAI_API_KEY: {}", status(ctx.settings().llm.api_key.is_some()));
    println!("# ELEVENLABS_API_KEY: {}", status(ctx.settings().tts.api_key.is_some()));
    Ok(())
}
