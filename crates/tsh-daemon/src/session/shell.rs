//! Shell processes behind sessions.
//!
//! The registry and router only see [`ShellHandle`] and [`ShellSpawner`];
//! [`PtySpawner`] is the production implementation on top of portable-pty.

use crate::config::TerminalConfig;
use portable_pty::{native_pty_system, Child, CommandBuilder, PtySize};
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tsh_core::{TshError, TshResult};

/// Size of a single PTY read.
const READ_CHUNK: usize = 4096;

/// Something a shell reports back to the daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellEvent {
    /// Bytes written by the shell to its terminal.
    Output { session_id: String, data: Vec<u8> },
    /// The shell exited on its own.
    Exited { session_id: String },
}

/// What to run for a new session.
#[derive(Debug, Clone)]
pub struct ShellSpec<'a> {
    /// Shell command line; the first word is the program.
    pub command: &'a str,
    /// Operating-system user to run the shell as.
    pub user: Option<&'a str>,
    pub terminal: TerminalConfig,
}

/// A running shell, exclusively owned by one session.
pub trait ShellHandle: Send + Sync {
    /// Write input to the shell. May block briefly.
    fn write(&self, data: &[u8]) -> TshResult<()>;

    /// Terminate the shell. Idempotent, never fails.
    fn stop(&self);
}

/// Starts shells.
pub trait ShellSpawner: Send + Sync {
    /// Start a shell bound to `session_id`. Output and exit are reported on
    /// `events`, tagged with the session id.
    fn spawn(
        &self,
        session_id: &str,
        spec: &ShellSpec<'_>,
        events: mpsc::Sender<ShellEvent>,
    ) -> TshResult<Arc<dyn ShellHandle>>;
}

/// Spawns shells on pseudo-terminals.
#[derive(Debug, Default, Clone)]
pub struct PtySpawner;

impl ShellSpawner for PtySpawner {
    fn spawn(
        &self,
        session_id: &str,
        spec: &ShellSpec<'_>,
        events: mpsc::Sender<ShellEvent>,
    ) -> TshResult<Arc<dyn ShellHandle>> {
        let shell = PtyShell::spawn(session_id, spec, events)?;
        Ok(Arc::new(shell))
    }
}

/// A shell running on a PTY.
pub struct PtyShell {
    writer: Mutex<Box<dyn Write + Send>>,
    child: Arc<Mutex<Box<dyn Child + Send + Sync>>>,
    /// Set once the daemon asked the shell to stop, so the exit is not reported.
    stopped: Arc<AtomicBool>,
}

impl PtyShell {
    pub fn spawn(
        session_id: &str,
        spec: &ShellSpec<'_>,
        events: mpsc::Sender<ShellEvent>,
    ) -> TshResult<Self> {
        let pty_system = native_pty_system();

        let size = PtySize {
            rows: spec.terminal.height,
            cols: spec.terminal.width,
            pixel_width: 0,
            pixel_height: 0,
        };

        let pair = pty_system
            .openpty(size)
            .map_err(|e| TshError::Shell(format!("failed to open PTY: {e}")))?;

        let mut cmd = build_command(spec.command, spec.user)?;
        cmd.env("TERM", "xterm-256color");

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| TshError::Shell(format!("failed to spawn {}: {e}", spec.command)))?;
        // The child holds its own copy of the slave side.
        drop(pair.slave);

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| TshError::Shell(format!("failed to clone PTY reader: {e}")))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| TshError::Shell(format!("failed to take PTY writer: {e}")))?;

        info!(
            session_id,
            command = spec.command,
            cols = spec.terminal.width,
            rows = spec.terminal.height,
            "shell spawned"
        );

        let stopped = Arc::new(AtomicBool::new(false));
        let child = Arc::new(Mutex::new(child));
        let master = pair.master;
        let session_id = session_id.to_string();
        let reader_stopped = stopped.clone();
        let reader_child = child.clone();
        tokio::task::spawn_blocking(move || {
            // Keep the master alive for as long as we read from it.
            let _master = master;
            pump_output(reader, &session_id, &events, &reader_stopped);
            if let Ok(mut child) = reader_child.lock() {
                let _ = child.wait();
            }
        });

        Ok(Self {
            writer: Mutex::new(writer),
            child,
            stopped,
        })
    }
}

impl ShellHandle for PtyShell {
    fn write(&self, data: &[u8]) -> TshResult<()> {
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| TshError::Shell("PTY writer lock poisoned".into()))?;
        writer.write_all(data)?;
        writer.flush()?;
        Ok(())
    }

    fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        match self.child.lock() {
            Ok(mut child) => {
                if let Err(e) = child.kill() {
                    debug!(error = %e, "shell already gone");
                }
            }
            Err(_) => warn!("PTY child lock poisoned, shell not killed"),
        }
    }
}

impl Drop for PtyShell {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Read PTY output until EOF and forward it as [`ShellEvent`]s.
fn pump_output(
    mut reader: Box<dyn Read + Send>,
    session_id: &str,
    events: &mpsc::Sender<ShellEvent>,
    stopped: &AtomicBool,
) {
    let mut buf = [0u8; READ_CHUNK];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                let event = ShellEvent::Output {
                    session_id: session_id.to_string(),
                    data: buf[..n].to_vec(),
                };
                if events.blocking_send(event).is_err() {
                    debug!(session_id, "event channel closed, dropping shell output");
                    return;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            // Linux reports EIO on the master once the slave side is gone.
            Err(e) => {
                debug!(session_id, error = %e, "PTY read ended");
                break;
            }
        }
    }

    if !stopped.load(Ordering::SeqCst) {
        info!(session_id, "shell exited");
        let _ = events.blocking_send(ShellEvent::Exited {
            session_id: session_id.to_string(),
        });
    }
}

/// Build the command for a shell, switching user through `su` when needed.
fn build_command(command: &str, user: Option<&str>) -> TshResult<CommandBuilder> {
    let parts: Vec<&str> = command.split_whitespace().collect();
    if parts.is_empty() {
        return Err(TshError::Shell("empty shell command".into()));
    }

    let user = user.filter(|u| !u.is_empty() && !is_current_user(u));
    let cmd = match user {
        Some(user) => {
            let mut builder = CommandBuilder::new("su");
            builder.args(["-s", parts[0], "-", user]);
            builder
        }
        None => {
            let mut builder = CommandBuilder::new(parts[0]);
            for arg in &parts[1..] {
                builder.arg(arg);
            }
            builder
        }
    };
    Ok(cmd)
}

fn is_current_user(user: &str) -> bool {
    std::env::var("USER")
        .or_else(|_| std::env::var("LOGNAME"))
        .map(|current| current == user)
        .unwrap_or(false)
}
