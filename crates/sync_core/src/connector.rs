use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use shared::protocol::{decode_frames, HandshakeRequest, HandshakeResponse, HubMessage};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};
use url::Url;

use crate::error::TransportError;

/// Source of the current bearer token. The sync core never refreshes it.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn bearer_token(&self) -> Option<String>;
}

#[derive(Debug, Clone, Default)]
pub struct StaticCredential(Option<String>);

impl StaticCredential {
    pub fn new(token: impl Into<String>) -> Self {
        Self(Some(token.into()))
    }

    pub fn anonymous() -> Self {
        Self(None)
    }
}

#[async_trait]
impl CredentialProvider for StaticCredential {
    async fn bearer_token(&self) -> Option<String> {
        self.0.clone()
    }
}

/// An open, handshaken hub connection. Dropping `outbound` closes the link;
/// `inbound` yields `None` once the peer is gone.
pub struct HubLink {
    pub outbound: mpsc::UnboundedSender<HubMessage>,
    pub inbound: mpsc::UnboundedReceiver<HubMessage>,
}

#[async_trait]
pub trait HubConnector: Send + Sync + 'static {
    async fn open(&self, endpoint: &Url, token: Option<&str>) -> Result<HubLink, TransportError>;
}

/// Rewrites `http(s)` to `ws(s)` and appends the bearer token as the
/// `access_token` query parameter.
pub fn hub_socket_url(endpoint: &Url, token: Option<&str>) -> Result<Url, TransportError> {
    let mut url = endpoint.clone();
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(TransportError::Endpoint(format!(
                "{endpoint} (unsupported scheme {other})"
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| TransportError::Endpoint(endpoint.to_string()))?;
    if let Some(token) = token {
        url.query_pairs_mut().append_pair("access_token", token);
    }
    Ok(url)
}

#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    pub handshake_timeout: Duration,
    pub keep_alive_interval: Duration,
    pub server_timeout: Duration,
}

impl Default for WebSocketConnector {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(15),
            keep_alive_interval: Duration::from_secs(15),
            server_timeout: Duration::from_secs(30),
        }
    }
}

#[async_trait]
impl HubConnector for WebSocketConnector {
    async fn open(&self, endpoint: &Url, token: Option<&str>) -> Result<HubLink, TransportError> {
        let url = hub_socket_url(endpoint, token)?;
        let (stream, _) = connect_async(url.as_str())
            .await
            .map_err(|err| TransportError::Connect(format!("{endpoint}: {err}")))?;
        let (mut writer, mut reader) = stream.split();

        writer
            .send(Message::Text(HandshakeRequest::json().encode()?))
            .await
            .map_err(|err| TransportError::Connect(format!("handshake send failed: {err}")))?;

        let first = tokio::time::timeout(self.handshake_timeout, reader.next())
            .await
            .map_err(|_| TransportError::Connect("handshake timed out".into()))?;
        let greeting = match first {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(other)) => {
                return Err(TransportError::Connect(format!(
                    "unexpected handshake frame: {other:?}"
                )))
            }
            Some(Err(err)) => {
                return Err(TransportError::Connect(format!("handshake failed: {err}")))
            }
            None => return Err(TransportError::Connect("closed during handshake".into())),
        };
        let (_, trailing) = HandshakeResponse::split(&greeting)?;

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<HubMessage>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<HubMessage>();

        for frame in decode_frames(trailing) {
            match frame {
                Ok(message) => {
                    let _ = inbound_tx.send(message);
                }
                Err(err) => warn!(%endpoint, "dropping malformed hub frame: {err}"),
            }
        }

        let keep_alive = self.keep_alive_interval;
        tokio::spawn(async move {
            let mut ping = tokio::time::interval(keep_alive);
            ping.tick().await;
            loop {
                tokio::select! {
                    next = outbound_rx.recv() => {
                        let Some(message) = next else { break };
                        let text = match message.encode() {
                            Ok(text) => text,
                            Err(err) => {
                                warn!("failed to encode hub frame: {err}");
                                continue;
                            }
                        };
                        if writer.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    _ = ping.tick() => {
                        let Ok(text) = HubMessage::Ping.encode() else { continue };
                        if writer.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                }
            }
            let _ = writer.close().await;
        });

        let server_timeout = self.server_timeout;
        let endpoint_label = endpoint.to_string();
        tokio::spawn(async move {
            loop {
                let next = match tokio::time::timeout(server_timeout, reader.next()).await {
                    Ok(next) => next,
                    Err(_) => {
                        warn!(endpoint = %endpoint_label, "hub went silent, dropping connection");
                        break;
                    }
                };
                match next {
                    Some(Ok(Message::Text(text))) => {
                        for frame in decode_frames(&text) {
                            match frame {
                                Ok(message) => {
                                    if inbound_tx.send(message).is_err() {
                                        return;
                                    }
                                }
                                Err(err) => {
                                    warn!(endpoint = %endpoint_label, "dropping malformed hub frame: {err}")
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        debug!(endpoint = %endpoint_label, ?frame, "hub socket closed");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        warn!(endpoint = %endpoint_label, "hub socket receive failed: {err}");
                        break;
                    }
                    None => break,
                }
            }
        });

        Ok(HubLink {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}
