mod repl;

use std::io::Write as _;
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::{self, error::RecvError};

use pentra_core::{
    BackendSet, Config, DecisionEngine, EngineError, EngineEvent, EngineHandle, EngineSettings,
    Session, resolve_config_path, spawn_audit_writer,
};
use pentra_llm::AnyBackend;
use pentra_tools::{AuditLogger, CommandRunner, SafetyPolicy};

use crate::repl::{HELP, Input, render_event, render_findings, render_history};

/// AI-assisted penetration testing in the terminal.
#[derive(Debug, Parser)]
#[command(name = "pentra", version, about)]
struct Cli {
    /// Config file (default: `PENTRA_CONFIG` or config/default.toml)
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Engagement target
    #[arg(long, short)]
    target: Option<String>,

    /// Active AI backend id
    #[arg(long, short)]
    backend: Option<String>,

    /// Run `allow`-verdict recommendations without asking
    #[arg(long)]
    auto_execute: bool,

    /// Restore a saved session snapshot
    #[arg(long)]
    resume: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config_path = resolve_config_path(cli.config.as_deref());
    let mut config = Config::load(&config_path)?;
    apply_cli_overrides(&mut config, &cli);
    init_subscriber(&config.log.level);
    tracing::info!(config = %config_path.display(), "pentra starting");

    let mut backends = BackendSet::from_config(&config.ai)?;
    let (status_tx, status_rx) = tokio::sync::mpsc::unbounded_channel::<String>();
    backends.set_status_tx(&status_tx);
    prepare_ollama(&mut backends, &config).await;
    tokio::spawn(forward_status_to_stderr(status_rx));

    let session = load_session(&cli, &config).await?;
    let safety = SafetyPolicy::from_config(&config.safety)?;
    let engine = DecisionEngine::new(session, backends)?
        .with_runner(CommandRunner::new(&config.runner))
        .with_safety(safety)
        .with_settings(EngineSettings::from_config(&config));

    let audit = if config.audit.enabled {
        let logger = AuditLogger::from_config(&config.audit)
            .await
            .with_context(|| format!("failed to open audit log {}", config.audit.destination))?;
        Some(spawn_audit_writer(engine.subscribe(), logger))
    } else {
        None
    };

    let (handle, task) = EngineHandle::spawn(engine, config.ai.max_auto_steps);
    let printer = tokio::spawn(print_events(handle.subscribe()));
    tokio::spawn(cancel_on_interrupt(handle.clone()));

    println!("pentra {} | backend {} | /help for commands", env!("CARGO_PKG_VERSION"), config.ai.backend);
    let snapshot_path = PathBuf::from(&config.session.snapshot_path);
    repl(&handle, &snapshot_path).await?;

    if config.session.autosave {
        handle
            .save(&snapshot_path)
            .await
            .with_context(|| format!("failed to save session to {}", snapshot_path.display()))?;
    }
    drop(handle);
    let engine = task.await.context("engine task panicked")?;
    tracing::info!(records = engine.session().records().len(), "engine stopped");
    drop(engine);
    let _ = printer.await;
    if let Some(audit) = audit {
        let _ = audit.await;
    }
    Ok(())
}

fn apply_cli_overrides(config: &mut Config, cli: &Cli) {
    if let Some(target) = &cli.target {
        config.session.target = Some(target.clone());
    }
    if let Some(backend) = &cli.backend {
        config.ai.backend.clone_from(backend);
    }
    if cli.auto_execute {
        config.safety.auto_execute = true;
    }
}

fn init_subscriber(default_level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Ask a local Ollama for its context window unless one is configured.
async fn prepare_ollama(backends: &mut BackendSet, config: &Config) {
    let configured = config
        .ai
        .ollama
        .as_ref()
        .and_then(|o| o.context_window)
        .is_some();
    let Some(AnyBackend::Ollama(ollama)) = backends.get_mut("ollama") else {
        return;
    };
    if config.ai.backend == "ollama" {
        match ollama.health_check().await {
            Ok(()) => tracing::info!("ollama health check passed"),
            Err(e) => tracing::warn!("ollama health check failed: {e:#}"),
        }
    }
    if !configured
        && let Ok(info) = ollama.fetch_model_info().await
        && let Some(ctx) = info.context_length
    {
        ollama.set_context_window(ctx);
        tracing::info!(context_window = ctx, "detected Ollama model context window");
    }
}

async fn load_session(cli: &Cli, config: &Config) -> anyhow::Result<Session> {
    let Some(path) = &cli.resume else {
        return Ok(Session::new(config.session.target.clone(), &config.ai.backend));
    };
    let mut session = Session::load(path)
        .await
        .with_context(|| format!("failed to resume session from {}", path.display()))?;
    tracing::info!(
        path = %path.display(),
        records = session.records().len(),
        findings = session.findings().len(),
        "session resumed"
    );
    if let Some(target) = &cli.target {
        session.set_target(target.clone());
    }
    if cli.backend.is_some() {
        session.set_active_backend(config.ai.backend.clone());
    }
    Ok(session)
}

async fn forward_status_to_stderr(mut rx: tokio::sync::mpsc::UnboundedReceiver<String>) {
    while let Some(msg) = rx.recv().await {
        eprintln!("[status] {msg}");
    }
}

async fn print_events(mut events: broadcast::Receiver<EngineEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => {
                if let Some(text) = render_event(&event) {
                    let mut stdout = std::io::stdout().lock();
                    let _ = stdout.write_all(text.as_bytes());
                    let _ = stdout.flush();
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                eprintln!("[status] display fell behind, {skipped} events skipped");
            }
            Err(RecvError::Closed) => break,
        }
    }
}

async fn cancel_on_interrupt(handle: EngineHandle) {
    while tokio::signal::ctrl_c().await.is_ok() {
        match handle.cancel_current().await {
            Ok(true) => eprintln!("[status] pending command discarded"),
            Ok(false) => {}
            Err(_) => break,
        }
    }
}

async fn repl(handle: &EngineHandle, snapshot_path: &Path) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("failed to read stdin")? {
        let result = match Input::parse(&line) {
            Input::Empty => continue,
            Input::Quit => break,
            Input::Help => {
                println!("{HELP}");
                Ok(())
            }
            Input::Unknown(text) => {
                println!("unknown command: {text} (try /help)");
                Ok(())
            }
            Input::Run(command) => handle.submit_command(command).await.map(drop),
            Input::Approve => handle.approve_pending().await.map(drop),
            Input::Reject => handle.reject_pending().await.map(drop),
            Input::Cancel => handle.cancel_current().await.map(drop),
            Input::Target(target) => handle.set_target(target).await,
            Input::Backend(id) => handle.set_backend(id).await,
            Input::Backends => {
                println!("{}", handle.backends().join(", "));
                Ok(())
            }
            Input::Findings => {
                println!("{}", render_findings(&handle.snapshot()));
                Ok(())
            }
            Input::History => {
                println!("{}", render_history(&handle.snapshot()));
                Ok(())
            }
            Input::Save(path) => {
                let path = path.unwrap_or_else(|| snapshot_path.to_owned());
                handle.save(&path).await.map(|()| {
                    println!("session saved to {}", path.display());
                })
            }
        };
        match result {
            Ok(()) => {}
            Err(e @ EngineError::Closed) => return Err(e.into()),
            Err(e) if e.is_fatal() => return Err(e).context("command runner failed"),
            Err(e) => println!("error: {e}"),
        }
    }
    Ok(())
}
