//! Streaming transport
//!
//! Authenticated websocket channel used by the incoming pipeline. The
//! server drives a request/response sub-protocol over binary frames;
//! PUT /api/v1/message requests deliver envelopes the receiver must
//! acknowledge. A keepalive request is sent on a fixed interval and,
//! when configured, a missed response tears the socket down so the
//! reconnect loop takes over.

use futures::{SinkExt, StreamExt};
use prost::Message as ProstMessage;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use crate::config::KeepAliveConfig;

/// Transport-layer fault
#[derive(Debug, Error)]
pub enum TransportError {
    /// The websocket connect handshake failed
    #[error("websocket connect failed: {0}")]
    Connect(String),

    /// The socket went away under a send
    #[error("websocket send failed")]
    Send,
}

/// Websocket sub-protocol frame
#[derive(Clone, PartialEq, ProstMessage)]
pub struct WebSocketMessage {
    #[prost(enumeration = "web_socket_message::Type", tag = "1")]
    pub r#type: i32,
    #[prost(message, optional, tag = "2")]
    pub request: Option<WebSocketRequestMessage>,
    #[prost(message, optional, tag = "3")]
    pub response: Option<WebSocketResponseMessage>,
}

pub mod web_socket_message {
    /// Frame discriminant
    #[derive(
        Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration,
    )]
    #[repr(i32)]
    pub enum Type {
        Unknown = 0,
        Request = 1,
        Response = 2,
    }
}

/// A request frame, server- or client-originated
#[derive(Clone, PartialEq, ProstMessage)]
pub struct WebSocketRequestMessage {
    #[prost(string, optional, tag = "1")]
    pub verb: Option<String>,
    #[prost(string, optional, tag = "2")]
    pub path: Option<String>,
    #[prost(bytes = "vec", optional, tag = "3")]
    pub body: Option<Vec<u8>>,
    #[prost(uint64, optional, tag = "4")]
    pub id: Option<u64>,
}

/// A response frame answering a request by id
#[derive(Clone, PartialEq, ProstMessage)]
pub struct WebSocketResponseMessage {
    #[prost(uint64, optional, tag = "1")]
    pub id: Option<u64>,
    #[prost(uint32, optional, tag = "2")]
    pub status: Option<u32>,
    #[prost(string, optional, tag = "3")]
    pub message: Option<String>,
    #[prost(bytes = "vec", optional, tag = "4")]
    pub body: Option<Vec<u8>>,
}

enum OutFrame {
    Data(Vec<u8>),
    Close,
}

/// A server-initiated request awaiting acknowledgement
pub struct IncomingRequest {
    pub verb: String,
    pub path: String,
    pub body: Vec<u8>,
    id: Option<u64>,
    out_tx: mpsc::Sender<OutFrame>,
}

impl IncomingRequest {
    /// Acknowledge the request. A request without an id expects no
    /// response.
    pub async fn respond(&self, status: u32, message: &str) -> Result<(), TransportError> {
        let Some(id) = self.id else {
            return Ok(());
        };
        let frame = WebSocketMessage {
            r#type: web_socket_message::Type::Response as i32,
            request: None,
            response: Some(WebSocketResponseMessage {
                id: Some(id),
                status: Some(status),
                message: Some(message.to_string()),
                body: None,
            }),
        };
        self.out_tx
            .send(OutFrame::Data(frame.encode_to_vec()))
            .await
            .map_err(|_| TransportError::Send)
    }
}

/// Events surfaced to the connection's owner
pub enum TransportEvent {
    /// The server sent a request
    Request(IncomingRequest),
    /// The socket closed; `code` is absent for abnormal teardowns
    Closed { code: Option<u16>, reason: String },
}

/// Handle for shutting the connection down
#[derive(Clone)]
pub struct TransportHandle {
    out_tx: mpsc::Sender<OutFrame>,
}

impl TransportHandle {
    /// Close the socket. Idempotent; a second close is a no-op.
    pub async fn close(&self) {
        let _ = self.out_tx.send(OutFrame::Close).await;
    }
}

/// Connect and spawn the socket servicing task. Incoming requests and
/// the final close arrive on the returned event channel.
pub async fn connect(
    url: &str,
    keepalive: KeepAliveConfig,
) -> Result<(TransportHandle, mpsc::Receiver<TransportEvent>), TransportError> {
    let (ws, _) = connect_async(url)
        .await
        .map_err(|e| TransportError::Connect(e.to_string()))?;
    let (mut sink, mut stream) = ws.split();

    let (out_tx, mut out_rx) = mpsc::channel::<OutFrame>(64);
    let (event_tx, event_rx) = mpsc::channel::<TransportEvent>(64);
    let handle = TransportHandle {
        out_tx: out_tx.clone(),
    };

    tokio::spawn(async move {
        let mut ticks = interval_at(Instant::now() + keepalive.interval(), keepalive.interval());
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut next_keepalive_id: u64 = 1;
        let mut pending_keepalive: Option<u64> = None;

        loop {
            tokio::select! {
                frame = stream.next() => match frame {
                    Some(Ok(Message::Binary(buf))) => {
                        match WebSocketMessage::decode(buf.as_ref()) {
                            Ok(msg) => handle_frame(msg, &out_tx, &event_tx, &mut pending_keepalive).await,
                            Err(e) => warn!("undecodable websocket frame: {e}"),
                        }
                    }
                    Some(Ok(Message::Close(close))) => {
                        let (code, reason) = close
                            .map(|f| (Some(u16::from(f.code)), f.reason.to_string()))
                            .unwrap_or((None, String::new()));
                        let _ = event_tx.send(TransportEvent::Closed { code, reason }).await;
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        let _ = event_tx
                            .send(TransportEvent::Closed { code: None, reason: e.to_string() })
                            .await;
                        break;
                    }
                    None => {
                        let _ = event_tx
                            .send(TransportEvent::Closed {
                                code: None,
                                reason: "stream ended".to_string(),
                            })
                            .await;
                        break;
                    }
                },
                cmd = out_rx.recv() => match cmd {
                    Some(OutFrame::Data(buf)) => {
                        if sink.send(Message::Binary(buf.into())).await.is_err() {
                            let _ = event_tx
                                .send(TransportEvent::Closed {
                                    code: None,
                                    reason: "send failed".to_string(),
                                })
                                .await;
                            break;
                        }
                    }
                    Some(OutFrame::Close) | None => {
                        let _ = sink.send(Message::Close(None)).await;
                        let _ = event_tx
                            .send(TransportEvent::Closed {
                                code: Some(1000),
                                reason: "client closed".to_string(),
                            })
                            .await;
                        break;
                    }
                },
                _ = ticks.tick() => {
                    if pending_keepalive.is_some() && keepalive.disconnect_on_miss {
                        warn!("keepalive response missed, dropping connection");
                        let _ = event_tx
                            .send(TransportEvent::Closed {
                                code: None,
                                reason: "keepalive timeout".to_string(),
                            })
                            .await;
                        break;
                    }
                    let id = next_keepalive_id;
                    next_keepalive_id += 1;
                    pending_keepalive = Some(id);
                    let ping = WebSocketMessage {
                        r#type: web_socket_message::Type::Request as i32,
                        request: Some(WebSocketRequestMessage {
                            verb: Some("GET".to_string()),
                            path: Some(keepalive.path.clone()),
                            body: None,
                            id: Some(id),
                        }),
                        response: None,
                    };
                    if sink.send(Message::Binary(ping.encode_to_vec().into())).await.is_err() {
                        let _ = event_tx
                            .send(TransportEvent::Closed {
                                code: None,
                                reason: "keepalive send failed".to_string(),
                            })
                            .await;
                        break;
                    }
                }
            }
        }
        debug!("websocket servicing task exited");
    });

    Ok((handle, event_rx))
}

async fn handle_frame(
    msg: WebSocketMessage,
    out_tx: &mpsc::Sender<OutFrame>,
    event_tx: &mpsc::Sender<TransportEvent>,
    pending_keepalive: &mut Option<u64>,
) {
    match web_socket_message::Type::try_from(msg.r#type) {
        Ok(web_socket_message::Type::Request) => {
            if let Some(request) = msg.request {
                let incoming = IncomingRequest {
                    verb: request.verb.unwrap_or_else(|| "GET".to_string()),
                    path: request.path.unwrap_or_default(),
                    body: request.body.unwrap_or_default(),
                    id: request.id,
                    out_tx: out_tx.clone(),
                };
                let _ = event_tx.send(TransportEvent::Request(incoming)).await;
            }
        }
        Ok(web_socket_message::Type::Response) => {
            if let Some(response) = msg.response {
                if response.id.is_some() && response.id == *pending_keepalive {
                    *pending_keepalive = None;
                }
            }
        }
        _ => warn!("websocket frame with unexpected type {}", msg.r#type),
    }
}
