//! Transport seam between the connection worker and the socket.
//!
//! A [`Transport`] opens one [`TransportLink`] per connection attempt. The
//! link is a pair of channels: outbound text frames and inbound
//! [`TransportEvent`]s. Dropping or closing the link closes the socket.

use futures_util::future::BoxFuture;
use futures_util::{FutureExt, SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;

use crate::stream::client::PushClientError;

/// Lifecycle and data signals produced by an open link.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportEvent {
    /// Inbound text frame.
    Text(String),
    /// Remote side closed the connection.
    Closed,
    /// Transport failure; the link is unusable afterwards.
    Error(String),
}

/// Opens links to a push endpoint.
pub trait Transport: Send + Sync + 'static {
    fn connect(&self, endpoint: &str) -> BoxFuture<'static, Result<TransportLink, PushClientError>>;
}

/// One live connection.
#[derive(Debug)]
pub struct TransportLink {
    outbound: mpsc::UnboundedSender<String>,
    inbound: mpsc::UnboundedReceiver<TransportEvent>,
}

impl TransportLink {
    /// Wraps an existing channel pair. The transport side must treat the
    /// outbound channel closing as a request to close the socket.
    pub fn new(
        outbound: mpsc::UnboundedSender<String>,
        inbound: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> Self {
        Self { outbound, inbound }
    }

    pub fn is_open(&self) -> bool {
        !self.outbound.is_closed()
    }

    pub fn send(&self, text: String) -> Result<(), PushClientError> {
        self.outbound
            .send(text)
            .map_err(|_| PushClientError::TransportClosed)
    }

    /// Next inbound event. A vanished transport reads as [`TransportEvent::Closed`].
    pub async fn next_event(&mut self) -> TransportEvent {
        self.inbound.recv().await.unwrap_or(TransportEvent::Closed)
    }

    pub fn close(self) {
        drop(self);
    }
}

/// Websocket transport backed by `tokio-tungstenite`.
#[derive(Clone, Copy, Debug, Default)]
pub struct WebSocketTransport;

impl Transport for WebSocketTransport {
    fn connect(&self, endpoint: &str) -> BoxFuture<'static, Result<TransportLink, PushClientError>> {
        let endpoint = endpoint.to_string();
        async move {
            let request = endpoint.into_client_request()?;
            let (socket, _) = connect_async(request).await?;

            let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
            let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
            tokio::spawn(pump_websocket(socket, outbound_rx, inbound_tx));

            Ok(TransportLink::new(outbound_tx, inbound_rx))
        }
        .boxed()
    }
}

async fn pump_websocket(
    mut socket: WebSocketStream<MaybeTlsStream<TcpStream>>,
    mut outbound_rx: mpsc::UnboundedReceiver<String>,
    inbound_tx: mpsc::UnboundedSender<TransportEvent>,
) {
    loop {
        tokio::select! {
            maybe_outbound = outbound_rx.recv() => {
                match maybe_outbound {
                    Some(text) => {
                        if let Err(err) = socket.send(Message::Text(text)).await {
                            let _ = inbound_tx.send(TransportEvent::Error(err.to_string()));
                            return;
                        }
                    }
                    None => {
                        let _ = socket.close(None).await;
                        return;
                    }
                }
            }
            maybe_inbound = socket.next() => {
                match maybe_inbound {
                    Some(Ok(Message::Text(text))) => {
                        if inbound_tx.send(TransportEvent::Text(text)).is_err() {
                            let _ = socket.close(None).await;
                            return;
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        if let Err(err) = socket.send(Message::Pong(payload)).await {
                            let _ = inbound_tx.send(TransportEvent::Error(err.to_string()));
                            return;
                        }
                    }
                    Some(Ok(Message::Binary(payload))) => {
                        debug!(event = "push_binary_frame_ignored", len = payload.len());
                    }
                    Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => {}
                    Some(Ok(Message::Close(_))) | None => {
                        let _ = inbound_tx.send(TransportEvent::Closed);
                        return;
                    }
                    Some(Err(err)) => {
                        let _ = inbound_tx.send(TransportEvent::Error(err.to_string()));
                        return;
                    }
                }
            }
        }
    }
}
