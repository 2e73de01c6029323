//! Shared shell process
//!
//! The session drives a single shell. Input is written a line at a time;
//! output arrives as [`ShellEvent`]s on a channel owned by the orchestrator.

mod pty;

pub use pty::PtyShell;

use termshare_utils::Result;

/// Event produced by the shell's output reader
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellEvent {
    /// A chunk of raw output
    Output(Vec<u8>),
    /// The process exited or its terminal closed
    Exited,
    /// Reading failed
    Error(String),
}

/// Write side of the shared shell
pub trait ShellBackend: Send + Sync {
    /// Write `line` followed by a line terminator
    fn write_line(&self, line: &str) -> Result<()>;

    /// Terminate the process; later writes fail
    fn close(&self) -> Result<()>;
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};
    use termshare_utils::TermshareError;

    /// In-memory shell recording every line written to it
    #[derive(Debug, Default)]
    pub(crate) struct RecordingShell {
        lines: Mutex<Vec<String>>,
        closed: AtomicBool,
    }

    impl RecordingShell {
        pub(crate) fn lines(&self) -> Vec<String> {
            self.lines.lock().clone()
        }

        pub(crate) fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }
    }

    impl ShellBackend for RecordingShell {
        fn write_line(&self, line: &str) -> Result<()> {
            if self.is_closed() {
                return Err(TermshareError::shell("shell closed"));
            }
            self.lines.lock().push(line.to_string());
            Ok(())
        }

        fn close(&self) -> Result<()> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }
}
