//! # remock
//!
//! Remote HTTP mock relay binary: starts the relay server and manages
//! interceptor tokens.

#![deny(unsafe_code)]

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use remock_server::{RelayServer, ServerConfig, ServerHandle};

/// Remote HTTP mock relay.
#[derive(Parser, Debug)]
#[command(name = "remock", about = "Remote HTTP mock relay server")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the relay server.
    Serve(ServeArgs),
    /// Manage interceptor tokens.
    Token {
        #[command(subcommand)]
        command: TokenCommand,
    },
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// Host to bind.
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port to bind (0 for an OS-assigned ephemeral port).
    #[arg(long, default_value_t = 0)]
    port: u16,

    /// Stop automatically right after the on-ready command settles (or
    /// right after startup if none is given).
    #[arg(long)]
    ephemeral: bool,

    /// Log unhandled and erroring requests as structured warnings.
    #[arg(long)]
    log_unhandled: bool,

    /// Directory of interceptor tokens; when set, connections must
    /// authenticate.
    #[arg(long)]
    tokens_dir: Option<PathBuf>,

    /// Command to run once the server is ready. Receives the bound
    /// address as REMOCK_HOST / REMOCK_PORT.
    #[arg(long = "on-ready", num_args = 1.., value_name = "CMD", allow_hyphen_values = true)]
    on_ready: Option<Vec<String>>,
}

#[derive(Subcommand, Debug)]
enum TokenCommand {
    /// Create a token and print its value (shown exactly once).
    Create {
        /// Optional human-readable label.
        #[arg(long)]
        name: Option<String>,
        /// Tokens directory (default: ~/.remock/tokens).
        #[arg(long)]
        dir: Option<PathBuf>,
    },
    /// List tokens.
    List {
        /// Tokens directory (default: ~/.remock/tokens).
        #[arg(long)]
        dir: Option<PathBuf>,
    },
    /// Remove a token by id.
    Remove {
        /// The token id to remove.
        id: String,
        /// Tokens directory (default: ~/.remock/tokens).
        #[arg(long)]
        dir: Option<PathBuf>,
    },
}

/// On-ready command failure, carrying the status to exit with.
#[derive(Debug, thiserror::Error)]
enum OnReadyError {
    /// The command exited nonzero.
    #[error("on-ready command exited with status {0}")]
    Failed(i32),
    /// The command was killed by a signal.
    #[error("on-ready command terminated by signal {0}")]
    Signaled(i32),
    /// The command could not be launched at all.
    #[error("failed to launch on-ready command: {0}")]
    Spawn(#[from] std::io::Error),
}

impl OnReadyError {
    /// The process exit status to surface for this failure.
    fn exit_code(&self) -> i32 {
        match self {
            Self::Failed(code) => *code,
            Self::Signaled(signal) => 128 + signal,
            Self::Spawn(_) => 1,
        }
    }
}

/// The shutdown trigger that fired.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ShutdownSignal {
    Interrupt,
    Terminate,
    Hangup,
}

impl ShutdownSignal {
    fn name(self) -> &'static str {
        match self {
            Self::Interrupt => "SIGINT",
            Self::Terminate => "SIGTERM",
            Self::Hangup => "SIGHUP",
        }
    }

    /// Conventional `128 + signo` exit status for the signal.
    fn exit_code(self) -> Option<i32> {
        match self {
            Self::Interrupt => Some(130),
            Self::Terminate => Some(143),
            Self::Hangup => Some(129),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve(args) => serve(args).await,
        Command::Token { command } => token_command(command),
    }
}

async fn serve(args: ServeArgs) -> Result<()> {
    let config = ServerConfig {
        host: args.host,
        port: args.port,
        tokens_dir: args.tokens_dir,
        log_unhandled: args.log_unhandled,
        ..ServerConfig::default()
    };

    let handle = RelayServer::new(config)
        .listen()
        .await
        .context("failed to start relay server")?;
    tracing::info!(addr = %handle.addr(), "remock relay ready");

    let hook_result = match &args.on_ready {
        Some(command) => Some(run_on_ready(command, handle.addr()).await),
        None => None,
    };

    if args.ephemeral {
        return finish_ephemeral(&handle, hook_result).await;
    }
    if let Some(Err(e)) = &hook_result {
        tracing::error!(error = %e, "on-ready command failed");
    }

    let signal = wait_for_shutdown()
        .await
        .context("failed to install shutdown signal handlers")?;
    tracing::info!(signal = signal.name(), "shutting down");
    if let Err(e) = handle.stop().await {
        tracing::error!(error = %e, "shutdown did not complete cleanly");
    }
    match signal.exit_code() {
        Some(code) => std::process::exit(code),
        None => Ok(()),
    }
}

/// Ephemeral mode: stop right away, then exit 0, unless the on-ready
/// hook failed, in which case its own status wins.
async fn finish_ephemeral(
    handle: &ServerHandle,
    hook_result: Option<Result<(), OnReadyError>>,
) -> Result<()> {
    handle
        .stop()
        .await
        .context("failed to stop ephemeral server")?;
    match hook_result {
        Some(Err(e)) => {
            tracing::error!(error = %e, "on-ready command failed");
            std::process::exit(e.exit_code());
        }
        _ => Ok(()),
    }
}

/// Run the on-ready hook with the bound address in its environment.
async fn run_on_ready(command: &[String], addr: SocketAddr) -> Result<(), OnReadyError> {
    let Some((program, rest)) = command.split_first() else {
        return Ok(());
    };
    tracing::info!(command = %command.join(" "), "running on-ready command");
    let status = tokio::process::Command::new(program)
        .args(rest)
        .env("REMOCK_HOST", addr.ip().to_string())
        .env("REMOCK_PORT", addr.port().to_string())
        .status()
        .await?;

    if status.success() {
        return Ok(());
    }
    match status.code() {
        Some(code) => Err(OnReadyError::Failed(code)),
        None => Err(OnReadyError::Signaled(termination_signal(status))),
    }
}

#[cfg(unix)]
fn termination_signal(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status.signal().unwrap_or(0)
}

#[cfg(not(unix))]
fn termination_signal(_status: std::process::ExitStatus) -> i32 {
    0
}

/// Wait for the first recognized termination signal.
///
/// The listeners are consumed by their first firing, so a repeated
/// signal cannot double-invoke shutdown.
#[cfg(unix)]
async fn wait_for_shutdown() -> std::io::Result<ShutdownSignal> {
    use tokio::signal::unix::{SignalKind, signal};
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let mut hangup = signal(SignalKind::hangup())?;
    let fired = tokio::select! {
        _ = interrupt.recv() => ShutdownSignal::Interrupt,
        _ = terminate.recv() => ShutdownSignal::Terminate,
        _ = hangup.recv() => ShutdownSignal::Hangup,
    };
    Ok(fired)
}

#[cfg(not(unix))]
async fn wait_for_shutdown() -> std::io::Result<ShutdownSignal> {
    tokio::signal::ctrl_c().await?;
    Ok(ShutdownSignal::Interrupt)
}

fn default_tokens_dir() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".remock").join("tokens")
}

fn token_command(command: TokenCommand) -> Result<()> {
    match command {
        TokenCommand::Create { name, dir } => {
            let dir = dir.unwrap_or_else(default_tokens_dir);
            let created = remock_tokens::create(name.as_deref(), remock_tokens::SECRET_BYTES, &dir)
                .with_context(|| format!("failed to create token in {}", dir.display()))?;
            println!("Created interceptor token {}", created.id);
            if let Some(name) = &created.name {
                println!("  name:  {name}");
            }
            println!("  value: {}", created.value);
            println!("The value is shown only once; store it now.");
        }
        TokenCommand::List { dir } => {
            let dir = dir.unwrap_or_else(default_tokens_dir);
            let listing = remock_tokens::list(&dir)
                .with_context(|| format!("failed to list tokens in {}", dir.display()))?;
            if listing.tokens.is_empty() {
                println!("No tokens in {}", dir.display());
            }
            for token in &listing.tokens {
                println!(
                    "{}  {}  {}",
                    token.id,
                    token.created_at.to_rfc3339(),
                    token.name.as_deref().unwrap_or("-")
                );
            }
            for skipped in &listing.skipped {
                eprintln!(
                    "warning: skipped {}: {}",
                    skipped.path.display(),
                    skipped.detail
                );
            }
        }
        TokenCommand::Remove { id, dir } => {
            let dir = dir.unwrap_or_else(default_tokens_dir);
            remock_tokens::remove(&id, &dir)
                .with_context(|| format!("failed to remove token {id}"))?;
            println!("Removed token {id}");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_serve_defaults() {
        let cli = Cli::parse_from(["remock", "serve"]);
        let Command::Serve(args) = cli.command else {
            panic!("expected serve");
        };
        assert_eq!(args.host, "127.0.0.1");
        assert_eq!(args.port, 0);
        assert!(!args.ephemeral);
        assert!(!args.log_unhandled);
        assert!(args.tokens_dir.is_none());
        assert!(args.on_ready.is_none());
    }

    #[test]
    fn cli_serve_custom_flags() {
        let cli = Cli::parse_from([
            "remock",
            "serve",
            "--host",
            "0.0.0.0",
            "--port",
            "4141",
            "--ephemeral",
            "--log-unhandled",
            "--tokens-dir",
            "/tmp/tokens",
        ]);
        let Command::Serve(args) = cli.command else {
            panic!("expected serve");
        };
        assert_eq!(args.host, "0.0.0.0");
        assert_eq!(args.port, 4141);
        assert!(args.ephemeral);
        assert!(args.log_unhandled);
        assert_eq!(args.tokens_dir.as_deref(), Some(std::path::Path::new("/tmp/tokens")));
    }

    #[test]
    fn cli_on_ready_collects_command() {
        let cli = Cli::parse_from([
            "remock", "serve", "--on-ready", "npm", "test", "--workers=4",
        ]);
        let Command::Serve(args) = cli.command else {
            panic!("expected serve");
        };
        assert_eq!(
            args.on_ready.unwrap(),
            vec!["npm", "test", "--workers=4"]
        );
    }

    #[test]
    fn cli_token_subcommands() {
        let cli = Cli::parse_from(["remock", "token", "create", "--name", "ci"]);
        let Command::Token {
            command: TokenCommand::Create { name, dir },
        } = cli.command
        else {
            panic!("expected token create");
        };
        assert_eq!(name.as_deref(), Some("ci"));
        assert!(dir.is_none());

        let cli = Cli::parse_from(["remock", "token", "remove", "00aabbccddeeff11"]);
        let Command::Token {
            command: TokenCommand::Remove { id, .. },
        } = cli.command
        else {
            panic!("expected token remove");
        };
        assert_eq!(id, "00aabbccddeeff11");
    }

    #[test]
    fn signal_exit_codes() {
        assert_eq!(ShutdownSignal::Interrupt.exit_code(), Some(130));
        assert_eq!(ShutdownSignal::Terminate.exit_code(), Some(143));
        assert_eq!(ShutdownSignal::Hangup.exit_code(), Some(129));
        assert_eq!(ShutdownSignal::Terminate.name(), "SIGTERM");
    }

    #[test]
    fn on_ready_error_exit_codes() {
        assert_eq!(OnReadyError::Failed(3).exit_code(), 3);
        assert_eq!(OnReadyError::Signaled(9).exit_code(), 137);
        let spawn = OnReadyError::Spawn(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "no such file",
        ));
        assert_eq!(spawn.exit_code(), 1);
    }

    #[tokio::test]
    async fn on_ready_success() {
        let addr: SocketAddr = "127.0.0.1:4141".parse().unwrap();
        let result = run_on_ready(&["true".to_string()], addr).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn on_ready_nonzero_exit_is_captured() {
        let addr: SocketAddr = "127.0.0.1:4141".parse().unwrap();
        let command = vec!["sh".to_string(), "-c".to_string(), "exit 7".to_string()];
        let err = run_on_ready(&command, addr).await.unwrap_err();
        assert!(matches!(err, OnReadyError::Failed(7)));
        assert_eq!(err.exit_code(), 7);
    }

    #[tokio::test]
    async fn on_ready_receives_address_env() {
        let addr: SocketAddr = "127.0.0.1:9099".parse().unwrap();
        let command = vec![
            "sh".to_string(),
            "-c".to_string(),
            "test \"$REMOCK_PORT\" = 9099 && test \"$REMOCK_HOST\" = 127.0.0.1".to_string(),
        ];
        assert!(run_on_ready(&command, addr).await.is_ok());
    }

    #[tokio::test]
    async fn on_ready_missing_binary_is_spawn_error() {
        let addr: SocketAddr = "127.0.0.1:4141".parse().unwrap();
        let command = vec!["definitely-not-a-real-binary-xyz".to_string()];
        let err = run_on_ready(&command, addr).await.unwrap_err();
        assert!(matches!(err, OnReadyError::Spawn(_)));
    }

    #[test]
    fn default_tokens_dir_under_home() {
        let dir = default_tokens_dir();
        assert!(dir.ends_with(".remock/tokens"));
    }

    #[test]
    fn token_commands_roundtrip() {
        let tmp = tempfile::TempDir::new().unwrap();
        let dir = tmp.path().join("tokens");

        token_command(TokenCommand::Create {
            name: Some("ci".into()),
            dir: Some(dir.clone()),
        })
        .unwrap();

        let listing = remock_tokens::list(&dir).unwrap();
        assert_eq!(listing.tokens.len(), 1);
        assert_eq!(listing.tokens[0].name.as_deref(), Some("ci"));

        token_command(TokenCommand::Remove {
            id: listing.tokens[0].id.clone(),
            dir: Some(dir.clone()),
        })
        .unwrap();
        assert!(remock_tokens::list(&dir).unwrap().tokens.is_empty());
    }
}
