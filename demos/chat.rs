//! Interactive chat REPL for cortex-agent.
//!
//! Usage:
//!   ANTHROPIC_API_KEY=sk-... cargo run --example chat
//!   ANTHROPIC_API_KEY=sk-... cargo run --example chat -- --model claude-sonnet-4-20250514
//!   cargo run --example chat -- --session notes --session-dir /tmp/sessions
//!
//! Complex requests enter planning mode; approve or reject the proposed
//! plan in plain words. Ctrl-C or "exit" / "quit" to leave.

use std::io::{self, BufRead, Write};

use clap::Parser;
use cortex_agent::{
    register_builtin_tools, Agent, AgentConfig, AgentEvent, AnthropicTransport, ContextConfig,
    ContextManager, FileSessionStore, ToolRegistry,
};

#[derive(Parser)]
#[command(name = "chat", about = "Chat with a cortex-agent")]
struct Cli {
    /// Model to use
    #[arg(long, default_value = "claude-sonnet-4-20250514")]
    model: String,

    /// System prompt
    #[arg(long, short = 's', default_value = "You are a careful assistant.")]
    system: String,

    /// Max output tokens per turn
    #[arg(long, default_value_t = 4096)]
    max_tokens: u32,

    /// Context window size
    #[arg(long, default_value_t = 200_000)]
    context_window: u32,

    /// Max agent iterations per message
    #[arg(long, default_value_t = 20)]
    max_iterations: usize,

    /// Session id to checkpoint under (omit for no persistence)
    #[arg(long)]
    session: Option<String>,

    /// Directory for session files
    #[arg(long, default_value = ".sessions")]
    session_dir: String,

    /// API base URL
    #[arg(long)]
    base_url: Option<String>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    let api_key = std::env::var("ANTHROPIC_API_KEY").unwrap_or_else(|_| {
        eprintln!("error: ANTHROPIC_API_KEY not set");
        std::process::exit(1);
    });
    let mut transport = AnthropicTransport::new(&api_key);
    if let Some(ref url) = cli.base_url {
        transport = transport.with_base_url(url);
    }

    let context = ContextManager::new(ContextConfig {
        system_prompt: cli.system.clone(),
        max_context_tokens: cli.context_window,
        ..Default::default()
    })
    .unwrap_or_else(|e| {
        eprintln!("error: {e}");
        std::process::exit(1);
    });

    let tools = register_builtin_tools(ToolRegistry::new());

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<AgentEvent>();
    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                AgentEvent::TextDelta { content } => {
                    print!("{content}");
                    io::stdout().flush().ok();
                }
                AgentEvent::ToolStart { name, input } => {
                    eprintln!("\x1b[33m  [tool: {name}]\x1b[0m {input}");
                }
                AgentEvent::ToolComplete {
                    name,
                    output,
                    is_error,
                } => {
                    let tag = if is_error { "error" } else { "result" };
                    let shown = if output.len() > 200 {
                        format!("{}…", &output[..200])
                    } else {
                        output
                    };
                    eprintln!("\x1b[33m  [{tag}: {name}]\x1b[0m {shown}");
                }
                AgentEvent::HistoryCompacted {
                    removed,
                    tokens_freed,
                } => {
                    eprintln!("\x1b[35m  [compacted {removed} messages, {tokens_freed} tokens]\x1b[0m");
                }
                AgentEvent::ResultsEvicted {
                    evicted,
                    tokens_freed,
                } => {
                    eprintln!("\x1b[35m  [evicted {evicted} tool results, {tokens_freed} tokens]\x1b[0m");
                }
                AgentEvent::BudgetWarning {
                    utilization_percent,
                } => {
                    eprintln!("\x1b[2m  [budget {utilization_percent:.0}%]\x1b[0m");
                }
                AgentEvent::PlanPending { goal, tasks } => {
                    eprintln!("\x1b[36m  [plan pending: \"{goal}\" — {tasks} tasks]\x1b[0m");
                }
                AgentEvent::TaskStarted { id, name } => {
                    eprintln!("\x1b[36m  [task {id}: {name}]\x1b[0m");
                }
                AgentEvent::TaskFailed { id, error } => {
                    eprintln!("\x1b[31m  [task {id} failed: {error}]\x1b[0m");
                }
                _ => {}
            }
        }
    });

    let mut agent = Agent::new(
        transport,
        context,
        tools,
        AgentConfig {
            model: cli.model.clone(),
            max_tokens: cli.max_tokens,
            max_iterations: cli.max_iterations,
            session_id: cli.session.clone(),
            ..Default::default()
        },
    )
    .with_events(tx);

    if let Some(ref session) = cli.session {
        agent = agent.with_store(FileSessionStore::new(&cli.session_dir));
        match agent.resume(session).await {
            Ok(true) => eprintln!("resumed session '{session}'"),
            Ok(false) => eprintln!("starting fresh session '{session}'"),
            Err(e) => eprintln!("resume failed: {e}"),
        }
    }

    eprintln!("cortex-agent chat");
    eprintln!("model: {}", cli.model);
    eprintln!("---");

    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();

    loop {
        eprint!("\x1b[1;36myou>\x1b[0m ");
        io::stderr().flush().ok();

        let line = match lines.next() {
            Some(Ok(line)) => line,
            _ => break,
        };
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if matches!(trimmed, "exit" | "quit" | "/q") {
            break;
        }

        match agent.handle(trimmed).await {
            Ok(turn) => {
                println!();
                eprintln!(
                    "\x1b[2m  [{:?} mode, {} iterations, {}in/{}out tokens]\x1b[0m",
                    turn.mode, turn.iterations, turn.usage.input_tokens, turn.usage.output_tokens
                );
            }
            Err(e) => {
                eprintln!("\x1b[1;31merror:\x1b[0m {e}");
            }
        }
    }

    drop(agent);
    printer.abort();
    eprintln!("bye.");
}
