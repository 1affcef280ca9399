use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use futures_util::{Stream, StreamExt};
use tokio::io::{AsyncBufReadExt, BufReader};

use agentbox::agent::{AgentLoop, SessionManager, TraceEvent};
use agentbox::capture::CaptureRegistry;
use agentbox::config::AppConfig;
use agentbox::conversation::Message;
use agentbox::llm::{ModelProvider, OllamaProvider};
use agentbox::sandbox::{ProcessRuntime, SandboxManager};
use agentbox::tools::{run_code, RunCodeTool, ToolRegistry};
use agentbox::tracing::{init_tracing, shutdown_tracing, TracingOptions};

#[derive(Debug, Parser)]
#[command(author, version, about = "LLM agent with a stateful Python sandbox")]
struct Cli {
    /// Path to TOML config file.
    #[arg(long, global = true, env = "AGENTBOX_CONFIG", default_value = "agentbox.toml")]
    config: PathBuf,

    /// Override the model name.
    #[arg(long, global = true)]
    model: Option<String>,

    /// Override the Ollama base URL.
    #[arg(long, global = true)]
    ollama_url: Option<String>,

    /// Override the iteration cap per turn.
    #[arg(long, global = true)]
    max_iterations: Option<usize>,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    json_logs: bool,

    /// Export spans to this OTLP endpoint.
    #[arg(long, global = true, env = "AGENTBOX_OTLP_ENDPOINT")]
    otlp_endpoint: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Interactive session over stdin/stdout.
    Chat,
    /// Run one snippet in a fresh sandbox and print the observation.
    Exec(ExecArgs),
    /// Print metrics in the Prometheus text format.
    Metrics,
}

#[derive(Debug, Args)]
struct ExecArgs {
    /// Code to run; read from --file when omitted.
    code: Option<String>,
    /// Read the code from this file.
    #[arg(long, conflicts_with = "code")]
    file: Option<PathBuf>,
    /// Execution budget in seconds.
    #[arg(long)]
    timeout_secs: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = AppConfig::load(&cli.config)?;
    if let Some(model) = &cli.model {
        config.provider.model = model.clone();
    }
    if let Some(url) = &cli.ollama_url {
        config.provider.base_url = url.trim_end_matches('/').to_owned();
    }
    if let Some(n) = cli.max_iterations {
        config.agent.max_iterations = n;
    }
    if cli.json_logs {
        config.telemetry.json_logs = true;
    }
    if let Some(endpoint) = &cli.otlp_endpoint {
        config.telemetry.otlp_endpoint = Some(endpoint.clone());
    }
    config.validate()?;

    init_tracing(
        "agentbox",
        TracingOptions {
            filter: Some(&config.telemetry.log_filter),
            json: config.telemetry.json_logs,
            otlp_endpoint: config.telemetry.otlp_endpoint.as_deref(),
        },
    )
    .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))?;

    let result = match cli.command {
        Command::Chat => chat(&config).await,
        Command::Exec(args) => exec(&config, args).await,
        Command::Metrics => {
            print!("{}", agentbox::metrics::gather_text());
            Ok(())
        }
    };

    shutdown_tracing();
    result
}

fn sandbox_manager(config: &AppConfig) -> Arc<SandboxManager> {
    let runtime = ProcessRuntime::new(config.process_runtime_config());
    Arc::new(SandboxManager::new(
        Arc::new(runtime),
        Arc::new(CaptureRegistry::with_defaults()),
        config.sandbox_manager_config(),
    ))
}

async fn chat(config: &AppConfig) -> Result<()> {
    let sandboxes = sandbox_manager(config);
    let reaper = SandboxManager::start_reaper(sandboxes.clone(), config.reaper_interval());

    let mut tools = ToolRegistry::new();
    tools.register(Arc::new(RunCodeTool::new(
        sandboxes.clone(),
        config.execution_timeout(),
    )))?;

    let provider: Arc<dyn ModelProvider> = Arc::new(
        OllamaProvider::new(config.ollama_config()).context("failed to build Ollama client")?,
    );
    let agent = AgentLoop::new(provider, Arc::new(tools), config.agent_config())
        .with_retry(config.retry_policy());
    let sessions = Arc::new(SessionManager::new(Arc::new(agent), sandboxes));

    let session_id = sessions.create().await;
    let printer = tokio::spawn(print_events(sessions.session_events(&session_id)));

    println!(
        "agentbox chat ({} @ {}). Commands: /clear, /history, /quit",
        config.provider.model, config.provider.base_url
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        std::io::stdout().flush()?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();
        match line {
            "" => continue,
            "/quit" | "/exit" => break,
            "/clear" => {
                sessions.clear(&session_id).await?;
                println!("(conversation cleared)");
                continue;
            }
            "/history" => {
                for message in sessions.history(&session_id).await?.messages() {
                    let text = match message.tool_result() {
                        Some(result) => result.output.clone(),
                        None => message.text_content(),
                    };
                    println!("[{}] {}", message.role().as_str(), text);
                }
                continue;
            }
            _ => {}
        }

        let turn = sessions.spawn_turn(&session_id, Message::user(line));
        let outcome = tokio::select! {
            joined = turn => joined.context("turn task panicked")?,
            _ = tokio::signal::ctrl_c() => {
                sessions.cancel(&session_id).await?;
                println!("\n(turn cancelled)");
                continue;
            }
        };
        match outcome {
            Ok(report) => println!("\n{}\n", report.outcome.text()),
            Err(e) => println!("\n[error] {e}\n"),
        }
    }

    sessions.shutdown().await;
    reaper.abort();
    printer.abort();
    Ok(())
}

async fn print_events(events: impl Stream<Item = TraceEvent>) {
    let mut events = Box::pin(events);
    while let Some(event) = events.next().await {
        match event {
            TraceEvent::StateChanged {
                state, iteration, ..
            } => eprintln!("  · {:?} (cycle {})", state, iteration),
            TraceEvent::ToolCallStarted { call, .. } => {
                eprintln!("  → {} {}", call.name, call.arguments);
            }
            TraceEvent::ToolCallFinished { result, .. } => {
                let status = if result.is_error() { "error" } else { "ok" };
                eprintln!("  ← {} [{}]\n{}", result.tool_name, status, indent(&result.output));
            }
            TraceEvent::ArtifactAvailable { artifact, .. } => {
                eprintln!("  ▣ {} ({})", artifact.source, artifact.kind.as_str());
            }
            TraceEvent::Usage { turn_total, .. } => {
                eprintln!("  tokens: {}", turn_total.total());
            }
            TraceEvent::TurnFailed { error, .. } => eprintln!("  ✗ {error}"),
            _ => {}
        }
    }
}

fn indent(text: &str) -> String {
    text.lines()
        .map(|line| format!("    {line}"))
        .collect::<Vec<_>>()
        .join("\n")
}

async fn exec(config: &AppConfig, args: ExecArgs) -> Result<()> {
    let code = match (args.code, args.file) {
        (Some(code), _) => code,
        (None, Some(path)) => std::fs::read_to_string(&path)
            .with_context(|| format!("failed reading {}", path.display()))?,
        (None, None) => bail!("pass code as an argument or with --file"),
    };
    let timeout = args
        .timeout_secs
        .map(std::time::Duration::from_secs)
        .unwrap_or_else(|| config.execution_timeout());

    let sandboxes = sandbox_manager(config);
    let result = sandboxes.execute("exec", &code, timeout).await;
    sandboxes.shutdown().await;

    let execution = result.context("execution failed")?;
    println!("{}", run_code::render(&execution));
    if execution.response.error.is_some() {
        std::process::exit(1);
    }
    Ok(())
}
