//! CLI entrypoint for toolrelay.
//!
//! Answers one prompt end to end, streaming the answer to stdout. Logs and
//! diagnostics go to stderr.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

use toolrelay::agent_core::{ConversationContext, TerminalStatus, ToolOrchestrator};
use toolrelay::config::{load_config, load_config_file};
use toolrelay::{init_tracing, LogFormat, DEFAULT_LOG_FILTER};

#[derive(Parser, Debug)]
#[command(name = "toolrelay")]
#[command(author, version, about = "Answer a prompt with live tool data when it helps")]
#[command(long_about = r#"
Classifies the prompt (weather, stock, web search, or none), calls the
matching tool on the tool server, and streams a model answer that uses
its result. Without a usable tool result the answer is still produced,
with a notice.

Configuration is loaded from (in priority order):
1. --config <path>
2. $TOOLRELAY_CONFIG
3. ./toolrelay.yaml or ./config/toolrelay.yaml, searching upward
4. ~/.config/toolrelay/toolrelay.yaml
5. Built-in defaults

Example:
  toolrelay "What's the weather in Seoul tomorrow?"
  toolrelay --classify "삼성전자 주가 알려줘"
  toolrelay --health
"#)]
struct Cli {
    /// The prompt to answer
    prompt: Option<String>,

    /// Explicit config file
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Print the classification verdict as JSON and exit
    #[arg(long)]
    classify: bool,

    /// Probe the tool and model servers and exit
    #[arg(long)]
    health: bool,

    /// Model name for this request (defaults to the configured one)
    #[arg(short, long, value_name = "MODEL")]
    model: Option<String>,

    /// Verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => DEFAULT_LOG_FILTER,
        1 => "toolrelay=debug,info",
        _ => "toolrelay=trace,debug",
    };
    let format = if cli.json_logs { LogFormat::Json } else { LogFormat::from_env() };
    init_tracing(filter, format);

    let config = match &cli.config {
        Some(path) => load_config_file(path).with_context(|| format!("loading {}", path.display()))?,
        None => load_config().context("loading configuration")?,
    };
    let orchestrator = ToolOrchestrator::from_config(&config)?;

    if cli.health {
        let report = orchestrator.health().await;
        println!("{}", serde_json::to_string_pretty(&report)?);
        if !(report.tool_server && report.model_server) {
            bail!("one or more servers are unreachable");
        }
        return Ok(());
    }

    let prompt = match cli.prompt {
        Some(p) if !p.trim().is_empty() => p,
        _ => bail!("A prompt is required. Use --help for usage."),
    };

    if cli.classify {
        let verdict = orchestrator.classify(&prompt).await;
        println!("{}", serde_json::to_string_pretty(&verdict)?);
        return Ok(());
    }

    let context = ConversationContext::new(cli.model.unwrap_or_default());
    let (tx, mut rx) = mpsc::channel::<String>(32);

    let printer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(chunk) = rx.recv().await {
            stdout.write_all(chunk.as_bytes()).await?;
            stdout.flush().await?;
        }
        stdout.write_all(b"\n").await?;
        stdout.flush().await
    });

    let outcome = orchestrator.classify_and_respond(&prompt, &context, tx).await;
    printer.await.context("output task panicked")??;

    tracing::info!(
        status = ?outcome.status,
        domain = outcome.verdict.domain.map(|d| d.as_str()).unwrap_or("none"),
        trace = ?outcome.trace,
        "done"
    );

    match outcome.status {
        TerminalStatus::Failed => bail!("the model server could not produce an answer"),
        TerminalStatus::Done | TerminalStatus::Cancelled => Ok(()),
    }
}
