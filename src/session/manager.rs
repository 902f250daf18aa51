//! Session manager for coordinating multiple shells
//!
//! Maintains a registry of live sessions keyed by opaque handles and exposes
//! them to async code. Every session runs in non-blocking mode so no call
//! parks the runtime; termination, which may wait out a grace period, runs on
//! the blocking pool.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{IoError, IoMode, Session, SessionState, DEFAULT_READ_CHUNK};
use crate::output::{Transcript, Utf8Decoder, DEFAULT_TRANSCRIPT_LIMIT};
use crate::pty::{allocate, launch, AllocError, LaunchError, LaunchOptions, WindowSize};

/// Upper bound on reads per session per pump tick
const MAX_READS_PER_TICK: usize = 64;

/// Opaque identifier of a managed session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionHandle(Uuid);

impl SessionHandle {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl std::fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What to run in a new session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShellCommand {
    /// Program name or path, resolved through `PATH`
    pub program: String,
    /// Arguments after the program name
    #[serde(default)]
    pub args: Vec<String>,
    /// Working directory for the shell
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
}

impl Default for ShellCommand {
    fn default() -> Self {
        Self::new("sh")
    }
}

impl ShellCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

/// Errors that can occur while starting a session
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("Failed to allocate PTY: {0}")]
    Alloc(#[from] AllocError),

    #[error("Failed to launch shell: {0}")]
    Launch(#[from] LaunchError),
}

/// Errors that can occur during session manager operations
#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("Session not found: {0}")]
    SessionNotFound(SessionHandle),

    #[error("Session I/O error: {0}")]
    Io(#[from] IoError),

    #[error("Background task failed: {0}")]
    Join(#[from] JoinError),
}

/// Result type for manager operations
pub type ManagerResult<T> = Result<T, ManagerError>;

/// Event types broadcast by the session manager
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A session was started
    Started {
        handle: SessionHandle,
        program: String,
        rows: u16,
        cols: u16,
    },
    /// A session produced output (raw bytes, possibly a partial character)
    Output { handle: SessionHandle, data: Vec<u8> },
    /// The shell terminated on its own or was found terminated
    Exited {
        handle: SessionHandle,
        state: SessionState,
    },
    /// A session was resized
    Resized {
        handle: SessionHandle,
        rows: u16,
        cols: u16,
    },
    /// A session was ended and removed from the registry
    Ended {
        handle: SessionHandle,
        state: SessionState,
    },
}

/// Snapshot of a managed session
#[derive(Debug, Clone, PartialEq)]
pub struct SessionInfo {
    pub handle: SessionHandle,
    pub program: String,
    pub args: Vec<String>,
    pub pid: i32,
    pub state: SessionState,
    pub size: WindowSize,
}

/// Registry entry: the session plus everything the manager tracks about it
struct SessionEntry {
    session: Session,
    command: ShellCommand,
    size: WindowSize,
    transcript: Transcript,
    decoder: Utf8Decoder,
    residual_returned: bool,
    exit_reported: bool,
}

impl SessionEntry {
    fn info(&mut self, handle: SessionHandle) -> SessionInfo {
        SessionInfo {
            handle,
            program: self.command.program.clone(),
            args: self.command.args.clone(),
            pid: self.session.pid().as_raw(),
            state: self.session.poll_status(),
            size: self.size,
        }
    }

    /// One read. Would-block and end of stream both come back empty; after
    /// the shell is gone the residual output is handed out once.
    fn read_output(&mut self, max_bytes: usize) -> Result<Vec<u8>, IoError> {
        let data = match self.session.receive(max_bytes) {
            Ok(data) => data,
            Err(IoError::WouldBlock) => return Ok(Vec::new()),
            Err(IoError::ChannelClosed) if !self.residual_returned => {
                self.residual_returned = true;
                self.session.take_residual_output()
            }
            Err(e) => return Err(e),
        };
        self.record_output(&data);
        Ok(data)
    }

    fn record_output(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let text = self.decoder.decode(data);
        self.transcript.push_output(&text);
    }

    /// Drain pending output into events and report termination once.
    fn pump(
        &mut self,
        handle: SessionHandle,
        read_chunk: usize,
        event_tx: &broadcast::Sender<SessionEvent>,
    ) {
        for _ in 0..MAX_READS_PER_TICK {
            match self.read_output(read_chunk) {
                Ok(data) if data.is_empty() => break,
                Ok(data) => {
                    let _ = event_tx.send(SessionEvent::Output { handle, data });
                }
                Err(_) => break,
            }
        }

        if self.exit_reported {
            return;
        }
        let state = self.session.poll_status();
        if state.is_terminal() {
            if let Ok(data) = self.read_output(read_chunk) {
                if !data.is_empty() {
                    let _ = event_tx.send(SessionEvent::Output { handle, data });
                }
            }
            let tail = self.decoder.finish();
            self.transcript.push_output(&tail);
            self.transcript.push_notice(format!("Shell {state}"));
            self.exit_reported = true;

            info!("Session {} shell {}", handle, state);
            let _ = event_tx.send(SessionEvent::Exited { handle, state });
        }
    }
}

type Registry = HashMap<SessionHandle, Arc<Mutex<SessionEntry>>>;

/// Manages all live shell sessions
///
/// The SessionManager is the central coordinator for sessions. It:
/// - Maintains a thread-safe registry keyed by [`SessionHandle`]
/// - Routes input, output and resize requests to the right session
/// - Keeps a transcript per session
/// - Broadcasts session events to subscribers
pub struct SessionManager {
    /// Registry of live sessions (thread-safe via RwLock)
    sessions: Arc<RwLock<Registry>>,
    /// Channel for broadcasting session events to subscribers
    event_tx: broadcast::Sender<SessionEvent>,
    /// Stops the output pump
    shutdown_tx: broadcast::Sender<()>,
    options: LaunchOptions,
    read_chunk: usize,
    transcript_limit: usize,
}

impl SessionManager {
    /// Create a new session manager with default launch options
    pub fn new() -> Self {
        Self::with_options(LaunchOptions::default())
    }

    /// Create a session manager that launches shells with `options`.
    ///
    /// The I/O mode is always forced to non-blocking.
    pub fn with_options(options: LaunchOptions) -> Self {
        let (event_tx, _) = broadcast::channel(1024);
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            event_tx,
            shutdown_tx,
            options: options.with_io_mode(IoMode::NonBlocking),
            read_chunk: DEFAULT_READ_CHUNK,
            transcript_limit: DEFAULT_TRANSCRIPT_LIMIT,
        }
    }

    /// Bytes requested per read
    pub fn with_read_chunk(mut self, read_chunk: usize) -> Self {
        self.read_chunk = read_chunk.max(1);
        self
    }

    /// Maximum transcript entries kept per session
    pub fn with_transcript_limit(mut self, limit: usize) -> Self {
        self.transcript_limit = limit;
        self
    }

    /// Subscribe to session events
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.event_tx.subscribe()
    }

    /// Get the number of live sessions
    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    async fn entry(&self, handle: SessionHandle) -> ManagerResult<Arc<Mutex<SessionEntry>>> {
        self.sessions
            .read()
            .await
            .get(&handle)
            .cloned()
            .ok_or(ManagerError::SessionNotFound(handle))
    }

    /// Allocate a PTY and launch `command` on it.
    ///
    /// Allocation and fork failures are returned here. A program that cannot
    /// be exec'd still yields a handle; its status becomes a startup failure.
    pub async fn start_session(
        &self,
        command: ShellCommand,
        geometry: WindowSize,
    ) -> Result<SessionHandle, StartupError> {
        let pair = allocate(geometry.rows, geometry.cols)?;

        let mut options = self.options.clone();
        if let Some(dir) = &command.working_dir {
            options = options.with_working_dir(dir);
        }
        let session = launch(pair, &command.program, &command.args, options)?;

        let handle = SessionHandle::new();
        info!(
            "Started session {} running {} (pid {})",
            handle,
            command.program,
            session.pid()
        );

        let mut transcript = Transcript::with_limit(self.transcript_limit);
        transcript.push_notice(format!("Started {}", command.program));

        let program = command.program.clone();
        let entry = SessionEntry {
            session,
            command,
            size: geometry,
            transcript,
            decoder: Utf8Decoder::new(),
            residual_returned: false,
            exit_reported: false,
        };
        self.sessions
            .write()
            .await
            .insert(handle, Arc::new(Mutex::new(entry)));

        let _ = self.event_tx.send(SessionEvent::Started {
            handle,
            program,
            rows: geometry.rows,
            cols: geometry.cols,
        });
        Ok(handle)
    }

    /// Send a line of input. The line terminator is appended.
    pub async fn send_input(&self, handle: SessionHandle, text: &str) -> ManagerResult<()> {
        let entry = self.entry(handle).await?;
        let mut entry = entry.lock().await;

        entry.session.send(text.as_bytes())?;
        entry.transcript.push_input(text);
        debug!("Sent {} bytes to session {}", text.len(), handle);
        Ok(())
    }

    /// Read whatever output is pending. Empty when nothing is available.
    pub async fn poll_output(&self, handle: SessionHandle) -> ManagerResult<Vec<u8>> {
        let entry = self.entry(handle).await?;
        let mut entry = entry.lock().await;
        Ok(entry.read_output(self.read_chunk)?)
    }

    /// Resize a session's terminal
    pub async fn resize_session(
        &self,
        handle: SessionHandle,
        rows: u16,
        cols: u16,
    ) -> ManagerResult<()> {
        let entry = self.entry(handle).await?;
        let mut entry = entry.lock().await;

        entry.session.resize(rows, cols)?;
        entry.size = WindowSize::new(rows, cols);

        let _ = self
            .event_tx
            .send(SessionEvent::Resized { handle, rows, cols });
        debug!("Session {} resized to {}x{}", handle, rows, cols);
        Ok(())
    }

    /// Terminate a session and remove it from the registry.
    ///
    /// Returns the final state. The handle is invalid afterwards.
    pub async fn end_session(&self, handle: SessionHandle) -> ManagerResult<SessionState> {
        let entry = self
            .sessions
            .write()
            .await
            .remove(&handle)
            .ok_or(ManagerError::SessionNotFound(handle))?;

        info!("Ending session {}", handle);
        let state = tokio::task::spawn_blocking(move || {
            let mut entry = entry.blocking_lock();
            entry.session.terminate()?;
            Ok::<_, IoError>(entry.session.state())
        })
        .await??;

        let _ = self.event_tx.send(SessionEvent::Ended { handle, state });
        debug!("Session {} ended: {}", handle, state);
        Ok(state)
    }

    /// Current state, checking the child without blocking
    pub async fn session_status(&self, handle: SessionHandle) -> ManagerResult<SessionState> {
        let entry = self.entry(handle).await?;
        let mut entry = entry.lock().await;
        Ok(entry.session.poll_status())
    }

    pub async fn session_info(&self, handle: SessionHandle) -> ManagerResult<SessionInfo> {
        let entry = self.entry(handle).await?;
        let mut entry = entry.lock().await;
        Ok(entry.info(handle))
    }

    /// List all sessions still in the registry
    pub async fn list_sessions(&self) -> Vec<SessionInfo> {
        let entries: Vec<_> = {
            let sessions = self.sessions.read().await;
            sessions
                .iter()
                .map(|(handle, entry)| (*handle, Arc::clone(entry)))
                .collect()
        };

        let mut infos = Vec::with_capacity(entries.len());
        for (handle, entry) in entries {
            infos.push(entry.lock().await.info(handle));
        }
        infos
    }

    /// Copy of the session transcript
    pub async fn transcript(&self, handle: SessionHandle) -> ManagerResult<Transcript> {
        let entry = self.entry(handle).await?;
        let entry = entry.lock().await;
        Ok(entry.transcript.clone())
    }

    pub async fn clear_transcript(&self, handle: SessionHandle) -> ManagerResult<()> {
        let entry = self.entry(handle).await?;
        entry.lock().await.transcript.clear();
        Ok(())
    }

    /// Start a background task that drains output from every session at
    /// `interval`, broadcasting `Output` and, once per session, `Exited`.
    ///
    /// The task stops on [`shutdown_all`](Self::shutdown_all).
    pub fn start_output_pump(&self, interval: Duration) -> JoinHandle<()> {
        let sessions = Arc::clone(&self.sessions);
        let event_tx = self.event_tx.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let read_chunk = self.read_chunk;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        break;
                    }
                    _ = ticker.tick() => {
                        let entries: Vec<_> = {
                            let sessions = sessions.read().await;
                            sessions
                                .iter()
                                .map(|(handle, entry)| (*handle, Arc::clone(entry)))
                                .collect()
                        };
                        for (handle, entry) in entries {
                            entry.lock().await.pump(handle, read_chunk, &event_tx);
                        }
                    }
                }
            }
            debug!("Output pump stopped");
        })
    }

    /// End every session and stop the output pump
    pub async fn shutdown_all(&self) {
        info!("Shutting down all sessions");
        let _ = self.shutdown_tx.send(());

        let handles: Vec<SessionHandle> = {
            let sessions = self.sessions.read().await;
            sessions.keys().copied().collect()
        };

        for handle in handles {
            if let Err(e) = self.end_session(handle).await {
                warn!("Error ending session {} during shutdown: {}", handle, e);
            }
        }
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SessionManager {
    /// Sessions left in the registry are terminated on the blocking pool,
    /// since terminating one can wait out its grace period.
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(());

        let sessions = Arc::clone(&self.sessions);
        let release = move || {
            let leftover: Vec<_> = sessions.blocking_write().drain().collect();
            if !leftover.is_empty() {
                info!("Terminating {} sessions left at drop", leftover.len());
            }
            drop(leftover);
        };

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn_blocking(release);
            }
            Err(_) => release(),
        }
    }
}
