//! Tandem CLI — an interactive REPL over the agent loop.
//!
//! Reads lines from stdin, runs each one as a user turn against the
//! configured provider, and prints the reply. `:q` quits and prints the
//! session's accumulated usage.

use std::io::{BufRead, Write};
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;

use tandem_agent::{Agent, Tool};
use tandem_core::error::ToolError;
use tandem_core::model::Model;
use tandem_core::response::Usage;
use tandem_core::tool::ToolSpec;
use tandem_core::Store;
use tandem_providers::{AnthropicModel, OpenAiModel};
use tandem_store::SqliteStore;

const SYS_PROMPT: &str = "You are a concise, helpful assistant. Use the \
    available tools when they help you answer, and answer directly when \
    they don't.";

#[derive(Parser)]
#[command(name = "tandem", about = "Tandem — interactive agent REPL", version)]
struct Cli {
    /// Which provider to talk to
    #[arg(short, long, value_enum, default_value = "openai")]
    provider: Provider,

    /// Model id (defaults to a provider-appropriate one)
    #[arg(short, long)]
    model: Option<String>,

    /// Reasoning effort, for the OpenAI provider
    #[arg(long, default_value = "minimal")]
    effort: String,

    /// SQLite database path, or ":memory:" for a throwaway session store
    #[arg(long, default_value = ":memory:")]
    db: String,

    /// Session key to converse under
    #[arg(short, long, default_value = "default")]
    session: String,

    /// Render tool calls, tool results, and reasoning into the transcript
    #[arg(long)]
    internals: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum Provider {
    Openai,
    Anthropic,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(false)
        .init();

    let model: Arc<dyn Model> = match cli.provider {
        Provider::Openai => Arc::new(OpenAiModel::new(
            cli.model.as_deref().unwrap_or("gpt-5-mini"),
            Some(&cli.effort),
        )?),
        Provider::Anthropic => Arc::new(
            AnthropicModel::new(
                cli.model.as_deref().unwrap_or("claude-sonnet-4-5-20250929"),
                4096,
            )?
            .with_thinking(2048),
        ),
    };

    let store = Arc::new(SqliteStore::open(&cli.db).await?);
    let agent = Agent::new(SYS_PROMPT, model, store.clone(), vec![clock_tool()]);
    let http = reqwest::Client::new();

    let stdin = std::io::stdin();
    let mut lines = stdin.lock().lines();

    loop {
        print!("\x1b[34mYou:\x1b[0m ");
        std::io::stdout().flush()?;

        let Some(line) = lines.next() else { break };
        let input = line?;
        let input = input.trim();

        if input == ":q" {
            break;
        }
        if input.is_empty() {
            continue;
        }

        match agent
            .run(
                CancellationToken::new(),
                &http,
                &cli.session,
                input,
                cli.internals,
            )
            .await
        {
            Ok(reply) => println!("\x1b[32mAssistant:\x1b[0m\n{reply}\n"),
            // A failed turn keeps the session usable; the transcript up to
            // the failure is preserved in the store.
            Err(e) => eprintln!("\x1b[31merror:\x1b[0m {e}\n"),
        }
    }

    print_usage(store.usage(&cli.session).await);
    store.close().await?;

    Ok(())
}

fn print_usage(u: Usage) {
    println!("\n\x1b[33;1mUsage:\x1b[0m");
    println!("  \x1b[33mInput:\x1b[0m {}", u.input);
    println!("    \x1b[33mCached:\x1b[0m {}", u.cached);
    println!("  \x1b[33mOutput:\x1b[0m {}", u.output);
    println!("  \x1b[33;1mCost:\x1b[0m ${:.3}", u.cost as f64 / 1e9);
}

#[derive(serde::Deserialize)]
#[serde(deny_unknown_fields)]
struct ClockArgs {}

/// A tiny built-in tool so the tool path works out of the box.
fn clock_tool() -> Tool {
    Tool::new(
        ToolSpec::new(
            "currentTime",
            "Returns the current local date and time of the user's machine",
        ),
        |_cancel, _args: ClockArgs| async move {
            Ok::<String, ToolError>(
                chrono::Local::now()
                    .format("%Y-%m-%d %H:%M:%S %z")
                    .to_string(),
            )
        },
    )
}
