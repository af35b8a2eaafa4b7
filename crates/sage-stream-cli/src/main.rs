//! Sage stream CLI - terminal chat client for the Sage agent backend.
//!
//! This is the entry point for the `sage-stream` binary.

mod render;
mod replay;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use sage_stream_client::{
    Agent, AgentSettings, ClientConfig, HttpTransport, SessionController, SessionState,
};
use sage_stream_core::{AgentId, SessionId};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

use render::{transcript, TerminalObserver};

/// Sage stream CLI - chat with a Sage agent from the terminal.
#[derive(Parser, Debug)]
#[command(name = "sage-stream")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Backend URL.
    #[arg(long, env = "SAGE_STREAM_URL", default_value = "http://localhost:8080")]
    url: String,

    /// Client configuration file (JSON).
    #[arg(long, env = "SAGE_STREAM_CONFIG")]
    config: Option<PathBuf>,

    /// Enable debug logging.
    #[arg(long, default_value = "false")]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Interactive chat; each input line is a message.
    Chat(SessionArgs),

    /// Send one message and print the reply.
    Ask {
        #[command(flatten)]
        session: SessionArgs,

        /// The message to send.
        message: String,
    },

    /// Rebuild a conversation from a recorded NDJSON stream.
    Replay {
        /// Recorded response body.
        file: PathBuf,

        /// Output format.
        #[arg(long, value_enum, default_value = "text")]
        format: ReplayFormat,

        /// Include reasoning steps in text output.
        #[arg(long)]
        thinking: bool,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ReplayFormat {
    Text,
    Json,
}

/// Options that shape the stream request.
#[derive(clap::Args, Debug)]
struct SessionArgs {
    /// Agent to talk to.
    #[arg(long, env = "SAGE_STREAM_AGENT")]
    agent_id: Option<String>,

    /// Agent definition file (JSON with camelCase settings).
    #[arg(long)]
    agent_config: Option<PathBuf>,

    /// Continue an existing backend session.
    #[arg(long)]
    session: Option<String>,

    /// Override deep thinking.
    #[arg(long)]
    deep_thinking: Option<bool>,

    /// Override multi-agent mode.
    #[arg(long)]
    multi_agent: Option<bool>,

    /// Override follow-up suggestions.
    #[arg(long)]
    more_suggest: Option<bool>,

    /// Override the agent loop bound.
    #[arg(long)]
    max_loop_count: Option<u32>,

    /// Override the system prompt prefix.
    #[arg(long)]
    system_prefix: Option<String>,

    /// Override the available tools (repeatable).
    #[arg(long = "tool")]
    tools: Vec<String>,
}

impl SessionArgs {
    fn overrides(&self) -> AgentSettings {
        AgentSettings {
            deep_thinking: self.deep_thinking,
            multi_agent: self.multi_agent,
            more_suggest: self.more_suggest,
            max_loop_count: self.max_loop_count,
            system_prefix: self.system_prefix.clone(),
            available_tools: (!self.tools.is_empty()).then(|| self.tools.clone()),
            ..AgentSettings::default()
        }
    }

    fn agent(&self) -> anyhow::Result<Option<Agent>> {
        match (&self.agent_config, &self.agent_id) {
            (Some(path), id) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read {}", path.display()))?;
                let mut agent: Agent = serde_json::from_str(&text)
                    .with_context(|| format!("invalid agent definition in {}", path.display()))?;
                if let Some(id) = id {
                    agent.id = AgentId::new(id.as_str())?;
                }
                Ok(Some(agent))
            }
            (None, Some(id)) => Ok(Some(Agent::new(AgentId::new(id.as_str())?, id.as_str()))),
            (None, None) => Ok(None),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse arguments
    let args = Args::parse();

    // Initialize logging
    let filter = if args.debug {
        EnvFilter::new("sage_stream_cli=debug,sage_stream_client=debug,warn")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let config = load_config(args.config.as_deref(), &args.url)?;

    match args.command {
        Command::Chat(session_args) => chat(config, &session_args).await,
        Command::Ask { session, message } => ask(config, &session, &message).await,
        Command::Replay {
            file,
            format,
            thinking,
        } => {
            let replay = replay::replay_file(&file)?;
            match format {
                ReplayFormat::Json => println!("{}", serde_json::to_string_pretty(&replay)?),
                ReplayFormat::Text => {
                    print!("{}", transcript(&replay.messages, &config.grouping, thinking));
                    for error in &replay.errors {
                        eprintln!("[error] {error}");
                    }
                }
            }
            Ok(())
        }
    }
}

/// Read the client configuration; `--url` wins over the file's `base_url`.
fn load_config(path: Option<&Path>, url: &str) -> anyhow::Result<ClientConfig> {
    let mut config = match path {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            serde_json::from_str(&text)
                .with_context(|| format!("invalid client config in {}", path.display()))?
        }
        None => ClientConfig::default(),
    };
    config.base_url = url.to_string();
    Ok(config)
}

/// Build a session with the renderer attached.
async fn open_session(
    config: ClientConfig,
    args: &SessionArgs,
) -> anyhow::Result<SessionController<HttpTransport>> {
    let transport = Arc::new(HttpTransport::new(config.clone())?);
    let observer = TerminalObserver::new(std::io::stdout(), config.grouping.clone());
    let mut session = SessionController::new(transport, config).with_observer(observer);

    if let Some(agent) = args.agent()? {
        session.select_agent(agent);
    }
    session.update_config(args.overrides());
    if let Some(id) = &args.session {
        session.attach_session(SessionId::new(id.as_str())?).await;
    }
    Ok(session)
}

async fn ask(config: ClientConfig, args: &SessionArgs, message: &str) -> anyhow::Result<()> {
    let mut session = open_session(config, args).await?;
    session.send(message).await?;

    let settled = tokio::select! {
        state = session.run_until_settled() => Some(state),
        _ = tokio::signal::ctrl_c() => None,
    };
    let state = match settled {
        Some(state) => state,
        None => {
            session.interrupt().await;
            session.state()
        }
    };

    if state == SessionState::Errored {
        anyhow::bail!("request failed");
    }
    Ok(())
}

/// What woke the chat loop.
enum Input {
    Line(Option<String>),
    Pumped,
    Interrupt,
}

/// Interactive loop: stdin lines are messages; Ctrl-C interrupts a reply.
async fn chat(config: ClientConfig, args: &SessionArgs) -> anyhow::Result<()> {
    let mut session = open_session(config, args).await?;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    eprintln!("Commands: /stop, /new, /state, /quit");

    loop {
        let in_flight = session.is_in_flight();
        let input = tokio::select! {
            line = lines.next_line() => Input::Line(line?),
            _ = session.pump(), if in_flight => Input::Pumped,
            _ = tokio::signal::ctrl_c(), if in_flight => Input::Interrupt,
        };

        let line = match input {
            Input::Pumped => continue,
            Input::Interrupt => {
                session.interrupt().await;
                continue;
            }
            Input::Line(None) => break,
            Input::Line(Some(line)) => line,
        };

        match line.trim() {
            "" => {}
            "/quit" => break,
            "/stop" => session.interrupt().await,
            "/new" => session.new_conversation().await,
            "/state" => eprintln!(
                "state: {}, session: {}",
                session.state(),
                session.session_id().map_or("-", |id| id.as_str())
            ),
            text => {
                if let Err(e) = session.send(text).await {
                    eprintln!("[error] {e}");
                }
            }
        }
    }

    session.interrupt().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_only_set_given_flags() {
        let args = SessionArgs {
            agent_id: None,
            agent_config: None,
            session: None,
            deep_thinking: Some(true),
            multi_agent: None,
            more_suggest: None,
            max_loop_count: Some(3),
            system_prefix: None,
            tools: vec![],
        };
        let overrides = args.overrides();
        assert_eq!(overrides.deep_thinking, Some(true));
        assert_eq!(overrides.max_loop_count, Some(3));
        assert!(overrides.available_tools.is_none());
        assert!(args.agent().unwrap().is_none());
    }

    #[test]
    fn url_flag_wins_over_config_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(
            &mut file,
            br#"{"base_url": "http://from-file", "event_buffer": 16}"#,
        )
        .unwrap();

        let config = load_config(Some(file.path()), "http://from-flag").unwrap();
        assert_eq!(config.base_url, "http://from-flag");
        assert_eq!(config.event_buffer, 16);
    }

    #[test]
    fn cli_parses_subcommands() {
        let args = Args::try_parse_from([
            "sage-stream", "ask", "--agent-id", "research", "--tool", "search", "--tool", "fetch", "hello",
        ])
        .unwrap();
        match args.command {
            Command::Ask { session, message } => {
                assert_eq!(message, "hello");
                assert_eq!(session.tools, vec!["search", "fetch"]);
                let agent = session.agent().unwrap().unwrap();
                assert_eq!(agent.id.as_str(), "research");
            }
            other => panic!("expected ask, got {other:?}"),
        }
    }
}
