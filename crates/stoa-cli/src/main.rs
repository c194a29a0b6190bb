//! `stoa` entry point - the composition root.

use clap::{CommandFactory, Parser};
use tracing_subscriber::EnvFilter;

use stoa_cli::{Cli, CliConfig, CliError, Commands, bootstrap, handlers};

#[tokio::main]
async fn main() {
    // Load environment variables (API keys) before clap reads `env` defaults
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Err(e) = run(cli).await {
        eprintln!("Error: {e:#}");
        let code = e.downcast_ref::<CliError>().map_or(1, CliError::exit_code);
        std::process::exit(code);
    }
}

/// `RUST_LOG` wins unless `-v` asks for debug output.
fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("stoa_voice=debug,stoa_cli=debug,warn")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let Some(command) = cli.command else {
        Cli::command().print_help()?;
        return Ok(());
    };

    let ctx = bootstrap(CliConfig {
        config_path: cli.config,
        no_audio: cli.no_audio,
    })?;

    match command {
        Commands::Chat {
            no_speak,
            single_turn,
            system_prompt,
            mic,
            preset,
        } => {
            let args = handlers::chat::ChatArgs {
                no_speak,
                single_turn,
                system_prompt,
                mic,
                preset: preset.map(usize::from),
            };
            handlers::chat::execute(&ctx, args).await?;
        }
        Commands::Say { text } => handlers::say::execute(&ctx, &text.join(" ")).await?,
        Commands::Config => handlers::config::execute(&ctx)?,
    }
    Ok(())
}
