use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::protocol::{CloseFrame, Message as WsMessage, frame::coding::CloseCode},
};
use url::Url;

use chatter_core::{SessionDescriptor, TransportClose};

/// Errors produced by transport connect/send operations.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to connect: {0}")]
    Connect(String),
    #[error("send failed: {0}")]
    Send(String),
}

/// Raw signal surfaced by one transport handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A text payload arrived.
    Text(String),
    /// Transport-level error; termination follows.
    Error(String),
    /// The transport terminated. Always the final event of a handle.
    Closed(TransportClose),
}

/// One physical connection instance.
///
/// A handle emits zero or more `Text`/`Error` events and exactly one final
/// `Closed`. It is owned exclusively by the session driver.
#[async_trait]
pub trait Transport: Send {
    /// Send one text payload.
    async fn send_text(&mut self, text: String) -> Result<(), TransportError>;

    /// Wait for the next transport event.
    async fn next_event(&mut self) -> TransportEvent;

    /// Start a clean close handshake. Idempotent.
    async fn close(&mut self);
}

/// Factory opening transports; the seam test drivers swap out.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Handle: Transport + 'static;

    async fn connect(&self, url: &Url) -> Result<Self::Handle, TransportError>;
}

/// Realtime endpoint for one session: base URL + conversation path segment +
/// token as a query credential.
pub fn session_endpoint_url(base: &Url, descriptor: &SessionDescriptor) -> Url {
    let mut url = base.clone();
    let path = format!(
        "{}/ws/chat/{}/",
        base.path().trim_end_matches('/'),
        descriptor.counterpart_id
    );
    url.set_path(&path);
    url.query_pairs_mut()
        .clear()
        .append_pair("token", &descriptor.token);
    url
}

/// Websocket transport over tokio-tungstenite.
pub struct WsTransport {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    finished: bool,
}

#[async_trait]
impl Transport for WsTransport {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        self.stream
            .send(WsMessage::Text(text.into()))
            .await
            .map_err(|err| TransportError::Send(err.to_string()))
    }

    async fn next_event(&mut self) -> TransportEvent {
        if self.finished {
            return TransportEvent::Closed(TransportClose::abnormal("transport already finished"));
        }

        loop {
            match self.stream.next().await {
                Some(Ok(WsMessage::Text(text))) => return TransportEvent::Text(text.to_string()),
                Some(Ok(WsMessage::Close(frame))) => {
                    self.finished = true;
                    return TransportEvent::Closed(close_signal(frame));
                }
                Some(Ok(_)) => continue,
                Some(Err(err)) => {
                    self.finished = true;
                    return TransportEvent::Error(err.to_string());
                }
                None => {
                    self.finished = true;
                    return TransportEvent::Closed(TransportClose::abnormal("connection lost"));
                }
            }
        }
    }

    async fn close(&mut self) {
        let _ = self
            .stream
            .close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: "session closed".into(),
            }))
            .await;
        self.finished = true;
    }
}

/// Classify a received close frame.
///
/// Only a normal status code ends the session cleanly; codes like 1012
/// (service restart) ask the client to come back and recover like an
/// abnormal closure. A codeless close counts as clean.
fn close_signal(frame: Option<CloseFrame>) -> TransportClose {
    TransportClose {
        was_clean: frame.as_ref().is_none_or(|f| f.code == CloseCode::Normal),
        reason: frame.map(|f| f.reason.to_string()),
    }
}

/// Connector producing [`WsTransport`] handles.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    type Handle = WsTransport;

    async fn connect(&self, url: &Url) -> Result<Self::Handle, TransportError> {
        let (stream, _response) = connect_async(url.as_str())
            .await
            .map_err(|err| TransportError::Connect(err.to_string()))?;
        Ok(WsTransport {
            stream,
            finished: false,
        })
    }
}
