//! Connection to the management server.
//!
//! [`ConnectionManager`] dials; [`Connection`] owns both halves of one live
//! transport and serializes writes behind a single lock.

#[cfg(test)]
pub(crate) mod memory;
pub mod websocket;

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use tsh_core::{codec, Dialer, FrameReader, FrameWriter, ShellMessage, TshError, TshResult};

pub use websocket::WebSocketDialer;

/// Opens connections to one configured server.
pub struct ConnectionManager<D> {
    dialer: D,
    server_url: String,
    write_timeout: Duration,
}

impl<D: Dialer> ConnectionManager<D> {
    pub fn new(dialer: D, server_url: impl Into<String>, write_timeout: Duration) -> Self {
        Self {
            dialer,
            server_url: server_url.into(),
            write_timeout,
        }
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    /// One connection attempt, no retries.
    pub async fn connect(&self, token: &str) -> TshResult<Connection<D::Reader, D::Writer>> {
        debug!(url = %self.server_url, "connecting");
        let (reader, writer) = self.dialer.dial(&self.server_url, token).await?;
        info!(url = %self.server_url, "connected to server");
        Ok(Connection::new(reader, writer, self.write_timeout))
    }

    /// Like [`connect`](Self::connect), after a lost or failed connection.
    pub async fn reconnect(
        &self,
        token: &str,
        attempt: u32,
    ) -> TshResult<Connection<D::Reader, D::Writer>> {
        info!(url = %self.server_url, attempt, "reconnecting");
        self.connect(token).await
    }
}

/// A live connection.
pub struct Connection<R, W> {
    reader: R,
    writer: Mutex<W>,
    write_timeout: Duration,
    closed: AtomicBool,
}

impl<R: FrameReader, W: FrameWriter> Connection<R, W> {
    pub fn new(reader: R, writer: W, write_timeout: Duration) -> Self {
        Self {
            reader,
            writer: Mutex::new(writer),
            write_timeout,
            closed: AtomicBool::new(false),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Wait for the next message. No deadline.
    ///
    /// A closed transport is a [`TshError::Transport`]; a frame that does not
    /// decode is a [`TshError::Codec`] that only fails this read.
    /// Cancel-safe.
    pub async fn read(&mut self) -> TshResult<ShellMessage> {
        if self.is_closed() {
            return Err(TshError::NotConnected);
        }
        match self.reader.read_frame().await? {
            Some(frame) => codec::decode(&frame),
            None => {
                self.closed.store(true, Ordering::SeqCst);
                Err(TshError::Transport("connection closed by server".into()))
            }
        }
    }

    /// Encode and write one message within the write timeout.
    pub async fn write(&self, message: &ShellMessage) -> TshResult<()> {
        if self.is_closed() {
            return Err(TshError::NotConnected);
        }
        let frame = codec::encode(message)?;
        let mut writer = self.writer.lock().await;
        match tokio::time::timeout(self.write_timeout, writer.write_frame(&frame)).await {
            Ok(res) => res,
            Err(_) => Err(TshError::Timeout),
        }
    }

    /// Close the transport within the write timeout. Later reads and writes
    /// fail with [`TshError::NotConnected`].
    ///
    /// A peer that stops reading can stall the close handshake; past the
    /// deadline the transport is abandoned and dropped with the connection.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let closing = async {
            let mut writer = self.writer.lock().await;
            writer.close().await
        };
        match tokio::time::timeout(self.write_timeout, closing).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(error = %e, "error while closing connection"),
            Err(_) => warn!(
                timeout_ms = self.write_timeout.as_millis() as u64,
                "close timed out, abandoning connection"
            ),
        }
    }
}
