//! WebSocket transport using tokio-tungstenite.
//!
//! One binary WebSocket message carries one frame. Ping/pong is answered by
//! tungstenite itself; text frames are ignored.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use tsh_core::{Dialer, FrameReader, FrameWriter, TshError, TshResult, MAX_FRAME_SIZE};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Dials the management server over `ws://` or `wss://`.
#[derive(Debug, Default, Clone)]
pub struct WebSocketDialer;

impl Dialer for WebSocketDialer {
    type Reader = WsReader;
    type Writer = WsWriter;

    async fn dial(&self, url: &str, token: &str) -> TshResult<(WsReader, WsWriter)> {
        let mut request = url
            .into_client_request()
            .map_err(|e| TshError::Transport(format!("invalid server URL {url}: {e}")))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|e| TshError::Token(format!("token is not a valid header value: {e}")))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        let (ws_stream, response) = connect_async(request)
            .await
            .map_err(|e| TshError::Transport(format!("WebSocket connect error: {e}")))?;

        info!(url, status = %response.status(), "WebSocket connected");

        let (sink, stream) = ws_stream.split();
        Ok((
            WsReader { stream },
            WsWriter {
                sink,
                broken: false,
            },
        ))
    }
}

/// Read half of a WebSocket connection.
pub struct WsReader {
    stream: SplitStream<WsStream>,
}

impl FrameReader for WsReader {
    async fn read_frame(&mut self) -> TshResult<Option<Vec<u8>>> {
        while let Some(msg) = self.stream.next().await {
            match msg {
                Ok(Message::Binary(data)) => {
                    if data.len() > MAX_FRAME_SIZE {
                        return Err(TshError::Codec(format!(
                            "frame too large: {} bytes (max {MAX_FRAME_SIZE})",
                            data.len()
                        )));
                    }
                    return Ok(Some(data.to_vec()));
                }
                Ok(Message::Close(frame)) => {
                    debug!(?frame, "WebSocket close frame received");
                    return Ok(None);
                }
                Ok(Message::Text(_)) => {
                    warn!("ignoring text WebSocket message");
                }
                Ok(_) => {} // ping/pong
                Err(e) => {
                    return Err(TshError::Transport(format!("WebSocket read error: {e}")));
                }
            }
        }
        Ok(None)
    }
}

/// Write half of a WebSocket connection.
pub struct WsWriter {
    sink: SplitSink<WsStream, Message>,
    /// Set while a send is in flight; stays set if the send was abandoned
    /// or failed.
    broken: bool,
}

impl FrameWriter for WsWriter {
    async fn write_frame(&mut self, frame: &[u8]) -> TshResult<()> {
        self.broken = true;
        self.sink
            .send(Message::Binary(frame.to_vec().into()))
            .await
            .map_err(|e| TshError::Transport(format!("WebSocket write error: {e}")))?;
        self.broken = false;
        Ok(())
    }

    async fn close(&mut self) -> TshResult<()> {
        if self.broken {
            // The sink still holds part of a frame the peer is not draining.
            debug!("skipping close handshake on a broken WebSocket");
            return Ok(());
        }
        let _ = self.sink.send(Message::Close(None)).await;
        self.sink
            .close()
            .await
            .map_err(|e| TshError::Transport(format!("WebSocket close error: {e}")))
    }
}
