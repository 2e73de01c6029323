//! PTY-backed shell using portable-pty

use std::io::{Read, Write};
use std::sync::Arc;

use parking_lot::Mutex;
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use termshare_utils::{Result, TermshareError};

use super::{ShellBackend, ShellEvent};
use crate::config::ShellConfig;

/// Read buffer size for PTY output
const READ_BUFFER_SIZE: usize = 4096;

/// Capacity of the output event channel
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Returned by Linux reads once the slave side has closed
const EIO: i32 = 5;

const DEFAULT_COLS: u16 = 80;
const DEFAULT_ROWS: u16 = 24;

/// Shell process running on a pseudo-terminal
pub struct PtyShell {
    /// Held so the PTY stays open while the shell runs
    _master: Mutex<Box<dyn MasterPty + Send>>,
    child: Mutex<Box<dyn Child + Send + Sync>>,
    /// Dropped on close so the shell sees EOF
    writer: Mutex<Option<Box<dyn Write + Send>>>,
    cancel: CancellationToken,
}

impl PtyShell {
    /// Spawn the configured shell and start reading its output
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn(config: &ShellConfig) -> Result<(Self, mpsc::Receiver<ShellEvent>)> {
        let pty_system = native_pty_system();

        let pair = pty_system
            .openpty(PtySize {
                rows: DEFAULT_ROWS,
                cols: DEFAULT_COLS,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| TermshareError::shell(format!("Failed to open PTY: {}", e)))?;

        let program = config.resolved_command();
        let mut cmd = CommandBuilder::new(&program);
        cmd.args(&config.args);

        if let Some(cwd) = &config.cwd {
            cmd.cwd(cwd);
        }

        for (key, value) in &config.env {
            cmd.env(key, value);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| TermshareError::ProcessSpawn(format!("{}: {}", program, e)))?;

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| TermshareError::shell(format!("Failed to clone reader: {}", e)))?;

        let writer = pair
            .master
            .take_writer()
            .map_err(|e| TermshareError::shell(format!("Failed to get writer: {}", e)))?;

        info!(program = %program, pid = ?child.process_id(), "Shell spawned");

        let cancel = CancellationToken::new();
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        tokio::spawn(read_output(
            Arc::new(Mutex::new(reader)),
            event_tx,
            cancel.clone(),
        ));

        let shell = Self {
            _master: Mutex::new(pair.master),
            child: Mutex::new(child),
            writer: Mutex::new(Some(writer)),
            cancel,
        };
        Ok((shell, event_rx))
    }
}

impl ShellBackend for PtyShell {
    fn write_line(&self, line: &str) -> Result<()> {
        let mut guard = self.writer.lock();
        let writer = guard
            .as_mut()
            .ok_or_else(|| TermshareError::shell("shell is closed"))?;

        writer
            .write_all(line.as_bytes())
            .and_then(|_| writer.write_all(b"\n"))
            .and_then(|_| writer.flush())
            .map_err(|e| TermshareError::shell(format!("Write failed: {}", e)))
    }

    fn close(&self) -> Result<()> {
        if self.writer.lock().take().is_none() {
            return Ok(());
        }
        self.cancel.cancel();

        let mut child = self.child.lock();
        if let Ok(Some(_)) = child.try_wait() {
            return Ok(());
        }
        debug!(pid = ?child.process_id(), "Killing shell");
        child
            .kill()
            .map_err(|e| TermshareError::shell(format!("Kill failed: {}", e)))
    }
}

impl Drop for PtyShell {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

impl std::fmt::Debug for PtyShell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PtyShell")
            .field("closed", &self.writer.lock().is_none())
            .finish()
    }
}

/// Outcome of one blocking read
enum ReadResult {
    Data(Vec<u8>),
    Eof,
    Error(String),
}

fn is_closed_error(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::BrokenPipe | std::io::ErrorKind::UnexpectedEof
    ) || err.raw_os_error() == Some(EIO)
}

/// Forward PTY output as events until EOF, error or cancellation
///
/// Each read runs in `spawn_blocking`; the PTY reader has no async interface.
async fn read_output(
    reader: Arc<Mutex<Box<dyn Read + Send>>>,
    events: mpsc::Sender<ShellEvent>,
    cancel: CancellationToken,
) {
    loop {
        if cancel.is_cancelled() {
            trace!("Shell reader cancelled");
            break;
        }

        let reader_clone = reader.clone();
        let result = tokio::task::spawn_blocking(move || {
            let mut buf = [0u8; READ_BUFFER_SIZE];
            let mut guard = reader_clone.lock();
            match guard.read(&mut buf) {
                Ok(0) => ReadResult::Eof,
                Ok(n) => ReadResult::Data(buf[..n].to_vec()),
                Err(e) if is_closed_error(&e) => ReadResult::Eof,
                Err(e) => ReadResult::Error(e.to_string()),
            }
        })
        .await;

        let event = match result {
            Ok(ReadResult::Data(data)) => ShellEvent::Output(data),
            Ok(ReadResult::Eof) => ShellEvent::Exited,
            Ok(ReadResult::Error(e)) => ShellEvent::Error(e),
            Err(e) => {
                warn!(error = %e, "spawn_blocking failed");
                ShellEvent::Error(e.to_string())
            }
        };

        let terminal = !matches!(event, ShellEvent::Output(_));
        if cancel.is_cancelled() && terminal {
            break;
        }
        if events.send(event).await.is_err() {
            trace!("Shell event channel closed, reader exiting");
            break;
        }
        if terminal {
            break;
        }
    }
}
