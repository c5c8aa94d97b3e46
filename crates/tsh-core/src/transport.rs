//! Abstract transport traits for tsh.
//!
//! A transport is a single bidirectional, ordered channel of binary frames.
//! It is split into a read half and a write half so that the daemon can wait
//! for inbound frames while shell output is being written.

use crate::error::TshResult;

/// Read half of a connection.
#[allow(async_fn_in_trait)]
pub trait FrameReader {
    /// Wait for the next binary frame. `Ok(None)` means the peer closed the
    /// connection.
    ///
    /// Must be cancel-safe: dropping the future before it completes must not
    /// lose a frame.
    async fn read_frame(&mut self) -> TshResult<Option<Vec<u8>>>;
}

/// Write half of a connection.
#[allow(async_fn_in_trait)]
pub trait FrameWriter {
    /// Write one binary frame.
    async fn write_frame(&mut self, frame: &[u8]) -> TshResult<()>;

    /// Close the connection. Best effort.
    async fn close(&mut self) -> TshResult<()>;
}

/// Opens connections to the management server.
#[allow(async_fn_in_trait)]
pub trait Dialer {
    type Reader: FrameReader;
    type Writer: FrameWriter;

    /// Open one connection authenticated with a bearer `token`. No retries.
    async fn dial(&self, url: &str, token: &str) -> TshResult<(Self::Reader, Self::Writer)>;
}
