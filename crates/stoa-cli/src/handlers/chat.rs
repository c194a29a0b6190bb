//! Chat command handler.
//!
//! Runs a conversation with the keyboard as microphone, or with real
//! dictation under `--mic`. Typed lines are delivered as speech while the
//! keyboard session is listening; at any other time they interrupt whatever
//! is happening and start a typed turn. Lines starting with `/` are REPL
//! commands (see [`HELP`]).

use std::io::Write;
use std::sync::Arc;

use anyhow::Result;
use stoa_voice::{
    Conversation, ConversationEvent, ConversationHandle, ConversationState, PlaybackOutcome,
    SpeechRecognizer, TurnTrigger,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use crate::bootstrap::CliContext;
use crate::error::CliError;
use crate::keyboard::KeyboardRecognizer;

pub const HELP: &str = "\
Commands:
  /start            start listening
  /stop             stop and go idle
  /interrupt        cut the reply short and listen again
  /speak on|off     speak replies aloud
  /continuous on|off
                    keep listening after each reply
  /ask [n]          list the quick questions, or ask number n
  /help             show this help
  /quit             leave";

/// Ready-made openers for `/ask` and `--preset`.
pub const QUICK_QUESTIONS: [&str; 5] = [
    "How do I deal with stress?",
    "What would Marcus Aurelius say about failure?",
    "How can I be more resilient?",
    "Stoic view on dealing with anger?",
    "How do I find peace in difficult times?",
];

/// The quick question numbered `n` (1-based).
pub fn quick_question(n: usize) -> Option<&'static str> {
    n.checked_sub(1).and_then(|i| QUICK_QUESTIONS.get(i)).copied()
}

/// Arguments for the chat command.
#[derive(Debug, Clone, Default)]
pub struct ChatArgs {
    pub no_speak: bool,
    pub single_turn: bool,
    pub system_prompt: Option<String>,
    /// Dictate through the microphone instead of typing.
    pub mic: bool,
    /// Open with this quick question instead of listening.
    pub preset: Option<usize>,
}

/// One line of REPL input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplInput {
    Text(String),
    Start,
    Stop,
    Interrupt,
    Speak(bool),
    Continuous(bool),
    /// `None` lists the quick questions.
    Ask(Option<usize>),
    Help,
    Quit,
    Empty,
    Unknown(String),
}

impl ReplInput {
    pub fn parse(line: &str) -> Self {
        let line = line.trim();
        if line.is_empty() {
            return Self::Empty;
        }
        let Some(command) = line.strip_prefix('/') else {
            return Self::Text(line.to_string());
        };

        let mut words = command.split_whitespace();
        let name = words.next().unwrap_or_default().to_ascii_lowercase();
        let argument = words.next();
        if name == "ask" {
            return match argument.map(str::parse::<usize>) {
                None => Self::Ask(None),
                Some(Ok(n)) => Self::Ask(Some(n)),
                Some(Err(_)) => Self::Unknown(line.to_string()),
            };
        }
        let toggle = argument.and_then(parse_toggle);
        match (name.as_str(), toggle) {
            ("start" | "listen", _) => Self::Start,
            ("stop", _) => Self::Stop,
            ("interrupt" | "i", _) => Self::Interrupt,
            ("speak", Some(on)) => Self::Speak(on),
            ("continuous", Some(on)) => Self::Continuous(on),
            ("help" | "?", _) => Self::Help,
            ("quit" | "exit" | "q", _) => Self::Quit,
            _ => Self::Unknown(line.to_string()),
        }
    }
}

fn parse_toggle(word: &str) -> Option<bool> {
    match word.to_ascii_lowercase().as_str() {
        "on" | "true" | "yes" => Some(true),
        "off" | "false" | "no" => Some(false),
        _ => None,
    }
}

/// Execute the chat command.
pub async fn execute(ctx: &CliContext, args: ChatArgs) -> Result<()> {
    let mut config = ctx.conversation_config()?;
    if args.no_speak {
        config.auto_speak = false;
    }
    if args.single_turn {
        config.continuous = false;
    }

    let opener = match args.preset {
        Some(n) => Some(quick_question(n).ok_or_else(|| {
            CliError::Arguments(format!(
                "--preset must be between 1 and {}",
                QUICK_QUESTIONS.len()
            ))
        })?),
        None => None,
    };

    // Under --mic the keyboard never opens a session, so typed lines become typed turns
    let keyboard = Arc::new(KeyboardRecognizer::new());
    let recognizer: Arc<dyn SpeechRecognizer> = if args.mic {
        ctx.microphone()?
    } else {
        keyboard.clone()
    };
    let generator = ctx.generator(args.system_prompt)?;
    let (synthesizer, format) = ctx.optional_synthesizer()?;
    let renderer = ctx.renderer(format)?;
    let deps = ctx.collaborators(recognizer, generator, synthesizer, renderer);

    let (handle, events) = Conversation::spawn(config, deps);
    let printer = tokio::spawn(print_events(events, args.mic));

    if args.mic {
        println!("Stoa - speak, or type to send a message. /help for commands, /quit to leave.");
    } else {
        println!("Stoa - type to speak, /help for commands, /quit to leave.");
    }
    match opener {
        Some(question) => {
            println!("> {question}");
            handle.submit_text(question)?;
        }
        None => handle.start()?,
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else { break };

        if !dispatch(&handle, &keyboard, ReplInput::parse(&line))? {
            break;
        }
    }

    handle.shutdown().await;
    let _ = printer.await;
    println!("Farewell.");
    Ok(())
}

/// Apply one REPL input. Returns `false` to leave.
fn dispatch(handle: &ConversationHandle, keyboard: &KeyboardRecognizer, input: ReplInput) -> Result<bool> {
    match input {
        ReplInput::Text(text) => {
            if !keyboard.deliver(&text) {
                handle.submit_text(text)?;
            }
        }
        ReplInput::Start => handle.start()?,
        ReplInput::Stop => handle.stop()?,
        ReplInput::Interrupt => handle.interrupt()?,
        ReplInput::Speak(on) => {
            handle.set_auto_speak(on)?;
            println!("Speaking {}.", if on { "on" } else { "off" });
        }
        ReplInput::Continuous(on) => {
            handle.set_continuous(on)?;
            println!("Continuous listening {}.", if on { "on" } else { "off" });
        }
        ReplInput::Ask(None) => {
            for (n, question) in QUICK_QUESTIONS.iter().enumerate() {
                println!("  {}. {question}", n + 1);
            }
        }
        ReplInput::Ask(Some(n)) => match quick_question(n) {
            Some(question) => {
                println!("> {question}");
                handle.submit_text(question)?;
            }
            None => println!("No quick question {n} (try /ask)"),
        },
        ReplInput::Help => println!("{HELP}"),
        ReplInput::Quit => return Ok(false),
        ReplInput::Empty => {}
        ReplInput::Unknown(line) => println!("Unknown command: {line} (try /help)"),
    }
    Ok(true)
}

/// Print conversation progress. With `show_turns`, spoken turns are echoed
/// since nothing was typed.
async fn print_events(mut events: mpsc::UnboundedReceiver<ConversationEvent>, show_turns: bool) {
    let mut stdout = std::io::stdout();
    while let Some(event) = events.recv().await {
        match event {
            ConversationEvent::StateChanged(state) => {
                tracing::debug!(%state, "Conversation state");
                if state == ConversationState::Listening {
                    print!("> ");
                }
            }
            ConversationEvent::ResponseDelta(delta) => print!("{delta}"),
            ConversationEvent::Response(_) => println!(),
            ConversationEvent::Notice(notice) => println!("\n⚠️  {notice}"),
            ConversationEvent::SpeakingFinished(PlaybackOutcome::Cancelled) => {
                println!("(interrupted)");
            }
            ConversationEvent::UserTurn(utterance) => {
                tracing::debug!(trigger = %utterance.trigger, "User turn");
                if show_turns && utterance.trigger != TurnTrigger::Typed {
                    println!("{}", utterance.text);
                }
            }
            ConversationEvent::Transcript { .. }
            | ConversationEvent::SpeakingStarted
            | ConversationEvent::SpeakingFinished(PlaybackOutcome::Completed) => {}
        }
        let _ = stdout.flush();
    }
}
