//! Say command handler.
//!
//! Synthesizes one line and waits until it has actually been played, not just
//! received. Ctrl-C stops playback.

use anyhow::Result;
use stoa_voice::{AudioArbiter, AudioMode, PlaybackOutcome, SpeechSynthesizer, StreamingPlayer};
use tokio_util::sync::CancellationToken;

use crate::bootstrap::CliContext;
use crate::error::CliError;

pub async fn execute(ctx: &CliContext, text: &str) -> Result<()> {
    let text = text.trim();
    if text.is_empty() {
        return Err(CliError::Arguments("nothing to say".into()).into());
    }

    let synthesizer = ctx.synthesizer()?;
    let format = synthesizer.format();
    let renderer = ctx.renderer(stoa_voice::OutputFormat {
        sample_rate: format.sample_rate,
        channels: format.channels,
    })?;

    let arbiter = AudioArbiter::desktop();
    arbiter.request(AudioMode::Playback).map_err(CliError::from)?;

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_interrupt.cancel();
        }
    });

    let (mut player, mut notices) = StreamingPlayer::new(renderer, ctx.voice().effective_gain());
    let outcome = match synthesizer.synthesize(text).await {
        Ok(chunks) => player.play_stream(text, chunks, &mut notices, &cancel).await,
        Err(e) => Err(e),
    };
    arbiter.release();

    match outcome.map_err(CliError::from)? {
        PlaybackOutcome::Completed => tracing::debug!("Playback complete"),
        PlaybackOutcome::Cancelled => println!("Interrupted."),
    }
    Ok(())
}
