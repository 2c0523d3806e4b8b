use std::fs::{self, OpenOptions};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chat_stream::client::{AuthProvider, EnvTokenProvider, HttpConversationApi};
use chat_stream::model::{ConversationId, ResumeRequest, ToolCallStatus, Turn};
use chat_stream::session::{SessionController, SessionEvent, SessionHandle, SessionState};
use chat_stream::{transport, util, Config, TransportMode};
use clap::Parser;
use tokio::sync::broadcast::error::RecvError;

/// Send one message to an agent backend and print the turn as it settles.
#[derive(Parser, Debug)]
#[command(name = "chat-stream", version)]
struct Cli {
    /// Config file (defaults to ~/.chat-stream/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the configured transport
    #[arg(long, value_parser = parse_transport)]
    transport: Option<TransportMode>,

    /// Continue an existing conversation instead of creating one
    #[arg(long)]
    conversation: Option<String>,

    /// Approve every action an interrupt asks about
    #[arg(long, conflicts_with = "reject")]
    approve: bool,

    /// Reject every action an interrupt asks about, with this message
    #[arg(long, value_name = "MSG")]
    reject: Option<String>,

    message: String,
}

fn parse_transport(value: &str) -> Result<TransportMode, String> {
    match value {
        "ws" | "websocket" => Ok(TransportMode::WebSocket),
        "sse" => Ok(TransportMode::Sse),
        other => Err(format!("unknown transport {other:?} (expected ws or sse)")),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging to file (~/.chat-stream/logs/chat-stream.log)
    fs::create_dir_all(util::logs_dir())?;
    let log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(util::log_file_path())?;
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .with_writer(log_file)
        .with_ansi(false)
        .init();

    let mut config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load(),
    };
    if let Some(mode) = cli.transport {
        config.connection.transport = mode;
    }

    let auth: Arc<dyn AuthProvider> = Arc::new(EnvTokenProvider::default());
    if auth.token().is_none() {
        bail!(
            "No auth token: set {} before connecting",
            EnvTokenProvider::DEFAULT_VAR
        );
    }

    let api = Arc::new(HttpConversationApi::new(
        config.connection.api_base.clone(),
        auth.clone(),
    ));
    let transport = transport::from_settings(&config.connection);
    let connect_timeout = config.connection.action_timeout();
    let controller = SessionController::new(transport, api, auth, config);
    let (session, task) = SessionHandle::spawn(controller);
    let mut events = session.subscribe();

    session.connect().await?;
    wait_until_connected(&mut events, connect_timeout).await?;

    if let Some(id) = &cli.conversation {
        session
            .switch_conversation(ConversationId::from(id.as_str()))
            .await?;
    }
    session.send_message(cli.message.clone()).await?;

    let outcome = drive(&session, &mut events, &cli).await;
    if let Ok(Some(snapshot)) = session.snapshot().await {
        print_turns(&snapshot.turns);
    }
    session.shutdown().await;
    let _ = task.await;
    outcome
}

async fn wait_until_connected(
    events: &mut tokio::sync::broadcast::Receiver<SessionEvent>,
    timeout: Duration,
) -> Result<()> {
    let wait = async {
        loop {
            match events.recv().await {
                Ok(SessionEvent::StateChanged(state)) if state.is_connected() => return Ok(()),
                Ok(SessionEvent::StateChanged(SessionState::Error)) => {
                    bail!("Connection rejected")
                }
                Ok(SessionEvent::ServerError { message, .. }) => bail!("{message}"),
                Ok(SessionEvent::ReconnectExhausted { attempts }) => {
                    bail!("Could not connect after {attempts} attempts")
                }
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => bail!("Session closed"),
            }
        }
    };
    tokio::time::timeout(timeout, wait)
        .await
        .context("Timed out waiting for the server to acknowledge the connection")?
}

/// Follow session events until the turn finishes, answering interrupts
/// from the command line flags.
async fn drive(
    session: &SessionHandle,
    events: &mut tokio::sync::broadcast::Receiver<SessionEvent>,
    cli: &Cli,
) -> Result<()> {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Event stream lagged");
                continue;
            }
            Err(RecvError::Closed) => bail!("Session closed"),
        };
        match event {
            SessionEvent::TurnCompleted { .. } => return Ok(()),
            SessionEvent::InterruptRaised { request, .. } => {
                println!("Interrupted: {}", request.reason.as_deref().unwrap_or("approval needed"));
                for action in &request.action_requests {
                    println!("  - {} {}", action.name, action.args);
                }
                let decision = if cli.approve {
                    ResumeRequest::approve_all()
                } else if let Some(message) = &cli.reject {
                    ResumeRequest::reject_all(message.clone())
                } else {
                    bail!("Turn needs a decision; rerun with --approve or --reject");
                };
                session.resume_interrupt(decision).await?;
            }
            SessionEvent::ServerError { message, code, .. } => match code {
                Some(code) => bail!("Server error ({code}): {message}"),
                None => bail!("Server error: {message}"),
            },
            SessionEvent::SendFailed { reason, .. } => bail!("Send failed: {reason}"),
            SessionEvent::ReconnectScheduled { attempt, delay } => {
                eprintln!("Connection lost; retrying in {}ms (attempt {attempt})", delay.as_millis());
            }
            SessionEvent::ReconnectExhausted { attempts } => {
                bail!("Connection lost; gave up after {attempts} attempts")
            }
            _ => {}
        }
    }
}

fn print_turns(turns: &[Turn]) {
    for turn in turns {
        if turn.show_avatar {
            println!("\n[{}]", turn.message.role.as_str());
        }
        let text = turn.message.content.text();
        if !text.is_empty() {
            println!("{text}");
        }
        for call in &turn.tool_calls {
            let marker = match call.status {
                ToolCallStatus::Completed => "✓",
                ToolCallStatus::Error => "✗",
                ToolCallStatus::Interrupted => "?",
                ToolCallStatus::Pending | ToolCallStatus::Running => "…",
            };
            println!("  {marker} {}({})", call.name, call.args);
            if let Some(result) = call.result.as_deref().or(call.error.as_deref()) {
                println!("    {result}");
            }
        }
        for agent in &turn.sub_agents {
            println!("  ↳ {} [{}]", agent.name, agent.status.as_str());
            if let Some(output) = agent.output.as_deref().or(agent.error.as_deref()) {
                println!("    {output}");
            }
        }
    }
}
