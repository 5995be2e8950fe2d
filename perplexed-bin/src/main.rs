use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use perplexed_core::{
    config::Config,
    reconciler::{Phase, SessionView},
    session::SessionHandle,
    transport::{HttpTransport, ScriptedTransport, SearchTransport},
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about = "perplexed conversational search client", long_about = None)]
struct Cli {
    /// Config file (JSON or TOML). Defaults are used when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Override the search endpoint URL.
    #[arg(long, global = true)]
    endpoint: Option<String>,
    /// Replay a captured response body instead of calling the endpoint (one per query).
    #[arg(long, global = true)]
    replay: Vec<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ask one question, optionally followed by follow-up questions
    Ask {
        prompt: String,
        #[arg(short, long = "follow-up", help = "Follow-up question (repeatable)")]
        follow_up: Vec<String>,
    },
    /// Interactive session: every line is a (follow-up) question
    Repl,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut cfg = match &cli.config {
        Some(path) => Config::from_path(path)?,
        None => Config::default(),
    };
    if let Some(url) = cli.endpoint {
        cfg.endpoint.url = url;
    }

    let transport: Arc<dyn SearchTransport> = if cli.replay.is_empty() {
        Arc::new(HttpTransport::from_config(&cfg)?)
    } else {
        let scripted = ScriptedTransport::new();
        for path in &cli.replay {
            scripted.push_body([std::fs::read(path)?]);
        }
        Arc::new(scripted)
    };
    let session = SessionHandle::spawn(transport, cfg.stream.clone());

    match cli.command {
        Commands::Ask { prompt, follow_up } => {
            for p in std::iter::once(prompt).chain(follow_up) {
                let view = run_query(&session, &p).await?;
                if view.phase != Phase::Completed {
                    break;
                }
            }
        }
        Commands::Repl => {
            eprintln!("Ask anything. `:reset` starts over, `:quit` exits.");
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            while let Some(line) = lines.next_line().await? {
                match line.trim() {
                    "" => continue,
                    ":quit" | ":q" => break,
                    ":reset" => {
                        session.reset().await?;
                        eprintln!("[session reset]");
                    }
                    prompt => {
                        if let Err(e) = run_query(&session, prompt).await {
                            eprintln!("[error: {}]", e.user_message());
                        }
                    }
                }
            }
        }
    }

    Ok(())
}

/// Submit one prompt and render every projection until the query ends.
async fn run_query(
    session: &SessionHandle,
    prompt: &str,
) -> perplexed_core::error::CoreResult<SessionView> {
    let mut views = session.subscribe();
    let generation = session.submit(prompt).await?;
    tracing::debug!(generation, "query submitted");
    let mut printed_docs = 0usize;
    let mut last_stage = None;

    loop {
        let view = views.borrow_and_update().clone();
        if view.generation != generation {
            return Ok(view);
        }
        if let Some(cur) = &view.current {
            if cur.stage != last_stage {
                if let Some(stage) = &cur.stage {
                    eprintln!("[{stage}]");
                }
                last_stage = cur.stage.clone();
            }
            if cur.success && cur.documents.len() != printed_docs {
                println!("Sources:");
                for (i, doc) in cur.documents.iter().enumerate() {
                    println!("  {}. {} <{}>", i + 1, doc.title, doc.url);
                }
                printed_docs = cur.documents.len();
            }
        }
        match view.phase {
            Phase::Completed => {
                if let Some(cur) = &view.current {
                    println!("\n{}\n", cur.answer);
                    tracing::info!(generation, tokens = cur.num_tokens_used, "answer ready");
                }
                return Ok(view);
            }
            Phase::Failed => {
                let msg = view
                    .current
                    .as_ref()
                    .and_then(|c| c.error_message.clone())
                    .unwrap_or_default();
                tracing::debug!(generation, "query failed");
                eprintln!("[error: {msg}]");
                return Ok(view);
            }
            Phase::Incomplete => {
                tracing::warn!(generation, "stream ended without a final result");
                eprintln!("[stream ended before the answer was ready]");
                return Ok(view);
            }
            Phase::Idle | Phase::Streaming => {}
        }
        if views.changed().await.is_err() {
            return Err(perplexed_core::error::SearchError::SessionClosed);
        }
    }
}
