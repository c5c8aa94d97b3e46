//! In-memory transport for tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tsh_core::{codec, Dialer, FrameReader, FrameWriter, ShellMessage, TshError, TshResult};

/// Server side of one dialed connection.
pub(crate) struct Peer {
    pub url: String,
    pub token: String,
    to_daemon: mpsc::UnboundedSender<Vec<u8>>,
    from_daemon: mpsc::UnboundedReceiver<Vec<u8>>,
    closed: Arc<AtomicBool>,
}

impl Peer {
    pub fn send(&self, message: &ShellMessage) {
        self.send_raw(codec::encode(message).unwrap());
    }

    pub fn send_raw(&self, frame: Vec<u8>) {
        let _ = self.to_daemon.send(frame);
    }

    pub async fn recv(&mut self) -> Option<ShellMessage> {
        let frame = self.from_daemon.recv().await?;
        Some(codec::decode(&frame).unwrap())
    }

    /// Whether the daemon closed its side.
    pub fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct DialerState {
    dials: AtomicUsize,
    refuse_next: AtomicUsize,
    refuse_all: AtomicBool,
    stall_writes: AtomicBool,
}

/// Dialer whose connections surface as [`Peer`]s on a channel.
#[derive(Clone)]
pub(crate) struct MemoryDialer {
    peers: mpsc::UnboundedSender<Peer>,
    state: Arc<DialerState>,
}

impl MemoryDialer {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Peer>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let dialer = Self {
            peers: tx,
            state: Arc::new(DialerState::default()),
        };
        (dialer, rx)
    }

    /// Refuse the next `n` dials.
    pub fn refuse(&self, n: usize) {
        self.state.refuse_next.store(n, Ordering::SeqCst);
    }

    /// Refuse every dial, like an unreachable server.
    pub fn refuse_all(&self) {
        self.state.refuse_all.store(true, Ordering::SeqCst);
    }

    /// Writes and closes on new connections never complete, like a peer
    /// that stopped reading.
    pub fn stall_writes(&self) {
        self.state.stall_writes.store(true, Ordering::SeqCst);
    }

    pub fn dials(&self) -> usize {
        self.state.dials.load(Ordering::SeqCst)
    }
}

impl Dialer for MemoryDialer {
    type Reader = MemoryReader;
    type Writer = MemoryWriter;

    async fn dial(&self, url: &str, token: &str) -> TshResult<(MemoryReader, MemoryWriter)> {
        self.state.dials.fetch_add(1, Ordering::SeqCst);
        if self.state.refuse_all.load(Ordering::SeqCst) {
            return Err(TshError::Transport("connection refused".into()));
        }
        let refused = self
            .state
            .refuse_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(TshError::Transport("connection refused".into()));
        }

        let (to_daemon, inbound) = mpsc::unbounded_channel();
        let (outbound, from_daemon) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));
        let peer = Peer {
            url: url.to_string(),
            token: token.to_string(),
            to_daemon,
            from_daemon,
            closed: closed.clone(),
        };
        self.peers
            .send(peer)
            .map_err(|_| TshError::Transport("no server listening".into()))?;

        let writer = MemoryWriter {
            outbound,
            closed,
            stall: self.state.stall_writes.load(Ordering::SeqCst),
        };
        Ok((MemoryReader { inbound }, writer))
    }
}

pub(crate) struct MemoryReader {
    inbound: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl FrameReader for MemoryReader {
    async fn read_frame(&mut self) -> TshResult<Option<Vec<u8>>> {
        Ok(self.inbound.recv().await)
    }
}

pub(crate) struct MemoryWriter {
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    closed: Arc<AtomicBool>,
    stall: bool,
}

impl FrameWriter for MemoryWriter {
    async fn write_frame(&mut self, frame: &[u8]) -> TshResult<()> {
        if self.stall {
            std::future::pending::<()>().await;
        }
        self.outbound
            .send(frame.to_vec())
            .map_err(|_| TshError::Transport("peer gone".into()))
    }

    async fn close(&mut self) -> TshResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        if self.stall {
            std::future::pending::<()>().await;
        }
        Ok(())
    }
}
