//! ptyshell
//!
//! Runs one shell on a pseudo-terminal. Lines read from stdin are sent to the
//! shell and its output is copied to stdout. Logs go to stderr.

use std::io::BufRead;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tokio::io::AsyncWriteExt;
use tokio::signal;
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use ptyshell::{
    FailureReason, SessionEvent, SessionManager, SessionState, ShellCommand, ShellConfig,
    Utf8Decoder,
};
use ptyshell::pty::EXEC_FAILURE_STATUS;

/// Exit status when the shell never ran, whether allocation, fork or exec failed
const STARTUP_FAILURE_STATUS: i32 = EXEC_FAILURE_STATUS;

/// PTY-backed interactive shell
#[derive(Parser, Debug)]
#[command(name = "ptyshell")]
#[command(version, about, long_about = None)]
struct Args {
    /// Config file (default: ./.ptyshell/config.toml if present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Shell preset from the config file
    #[arg(short, long)]
    preset: Option<String>,

    /// Shell to run instead of the configured one
    #[arg(short, long)]
    shell: Option<String>,

    /// Terminal rows
    #[arg(long)]
    rows: Option<u16>,

    /// Terminal columns
    #[arg(long)]
    cols: Option<u16>,

    /// Save the session transcript as JSON on exit
    #[arg(long)]
    transcript: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Arguments for the shell
    #[arg(last = true)]
    shell_args: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    info!("ptyshell v{}", env!("CARGO_PKG_VERSION"));

    let mut config = match &args.config {
        Some(path) => ShellConfig::load_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => ShellConfig::load(&std::env::current_dir()?)
            .context("Failed to load config from current directory")?,
    };
    if let Some(rows) = args.rows {
        config.rows = rows;
    }
    if let Some(cols) = args.cols {
        config.cols = cols;
    }

    let command = build_command(&config, &args)?;
    let geometry = config.window_size()?;
    let manager = SessionManager::with_options(config.launch_options()?)
        .with_read_chunk(config.read_chunk)
        .with_transcript_limit(config.transcript_limit);

    let mut events = manager.subscribe();
    let pump = manager.start_output_pump(config.poll_interval());

    let handle = match manager.start_session(command.clone(), geometry).await {
        Ok(handle) => handle,
        Err(e) => {
            error!("Could not start {}: {}", command.program, e);
            manager.shutdown_all().await;
            let _ = pump.await;
            std::process::exit(STARTUP_FAILURE_STATUS);
        }
    };

    let mut input_rx = spawn_stdin_reader();
    let mut decoder = Utf8Decoder::new();
    let mut stdout = tokio::io::stdout();

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    // Some(state) when the shell ended on its own
    let exited = loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Initiating shutdown...");
                break None;
            }
            line = input_rx.recv() => match line {
                Some(line) => {
                    if let Err(e) = manager.send_input(handle, &line).await {
                        warn!("Failed to send input: {}", e);
                    }
                }
                None => {
                    info!("Input closed");
                    break None;
                }
            },
            event = events.recv() => match event {
                Ok(SessionEvent::Output { handle: h, data }) if h == handle => {
                    stdout.write_all(decoder.decode(&data).as_bytes()).await?;
                    stdout.flush().await?;
                }
                Ok(SessionEvent::Exited { handle: h, state }) if h == handle => {
                    break Some(state);
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Output receiver lagged by {} messages", n);
                }
                Err(broadcast::error::RecvError::Closed) => break None,
            },
        }
    };

    stdout.write_all(decoder.finish().as_bytes()).await?;
    stdout.flush().await?;

    if let Some(path) = &args.transcript {
        let transcript = manager.transcript(handle).await?;
        match transcript.save(path) {
            Ok(()) => info!("Transcript saved to {}", path.display()),
            Err(e) => warn!("Failed to save transcript to {}: {}", path.display(), e),
        }
    }

    let state = manager.end_session(handle).await?;
    manager.shutdown_all().await;
    let _ = pump.await;

    let code = exit_code(state, exited.is_some());
    info!("Session finished: {}", state);
    std::process::exit(code);
}

/// Resolve the command from the config, preset and CLI overrides
fn build_command(config: &ShellConfig, args: &Args) -> anyhow::Result<ShellCommand> {
    let mut command = config.command(args.preset.as_deref())?;
    if let Some(shell) = &args.shell {
        command.program = shell.clone();
        command.args.clear();
    }
    if !args.shell_args.is_empty() {
        command.args = args.shell_args.clone();
    }
    Ok(command)
}

/// Mirror the shell's exit status. A shell we ended ourselves counts as success.
fn exit_code(state: SessionState, exited_on_its_own: bool) -> i32 {
    if let Some(err) = state.launch_error() {
        error!("Shell could not be started: {}", err);
        return STARTUP_FAILURE_STATUS;
    }
    match state {
        SessionState::Exited(code) => code,
        _ if !exited_on_its_own => 0,
        SessionState::Failed(FailureReason::Signaled(signal))
        | SessionState::Failed(FailureReason::Terminated(signal)) => 128 + signal as i32,
        _ => 1,
    }
}

/// Forward stdin lines from a dedicated thread; the channel closes on EOF.
fn spawn_stdin_reader() -> mpsc::Receiver<String> {
    let (input_tx, input_rx) = mpsc::channel(64);
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else {
                break;
            };
            if input_tx.blocking_send(line).is_err() {
                break;
            }
        }
    });
    input_rx
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C)");
        }
        _ = terminate => {
            info!("Received SIGTERM");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::signal::Signal;

    #[test]
    fn test_startup_failures_share_one_status() {
        let exec = SessionState::Failed(FailureReason::ExecFailed { errno: 2 });
        let setup = SessionState::Failed(FailureReason::SetupFailed { errno: 2 });
        assert_eq!(exit_code(exec, true), STARTUP_FAILURE_STATUS);
        assert_eq!(exit_code(setup, true), STARTUP_FAILURE_STATUS);
        assert_eq!(STARTUP_FAILURE_STATUS, 127);
    }

    #[test]
    fn test_exit_code_mirrors_shell() {
        assert_eq!(exit_code(SessionState::Exited(3), true), 3);
        assert_eq!(exit_code(SessionState::Exited(127), true), 127);

        let killed = SessionState::Failed(FailureReason::Signaled(Signal::SIGKILL));
        assert_eq!(exit_code(killed, true), 137);

        let ended = SessionState::Failed(FailureReason::Terminated(Signal::SIGHUP));
        assert_eq!(exit_code(ended, false), 0);
    }
}
