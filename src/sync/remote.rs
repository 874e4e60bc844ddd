use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context as _, Result};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as Frame};
use url::Url;

use super::gateway::{Gateway, Inbound};
use super::protocol::Message;
use crate::config::CollabConfig;
use crate::crdt::SiteId;
use crate::error::{with_retry, CollabError, RetryPolicy};

const WELCOME_TIMEOUT: Duration = Duration::from_secs(5);

/// Gateway to a relay over WebSocket.
///
/// Content goes out as JSON text frames, presence as CBOR binary frames; both
/// kinds are accepted inbound.
pub struct WsGateway {
    site: SiteId,
    outbound: mpsc::UnboundedSender<Message>,
    connected: Arc<AtomicBool>,
    tasks: [JoinHandle<()>; 2],
}

impl WsGateway {
    /// Connect to `url`, asking for `site` if given (to resume after a
    /// disconnect), and wait for the relay to assign the site id.
    pub async fn connect(
        url: &str,
        site: Option<SiteId>,
        config: &CollabConfig,
        policy: &RetryPolicy,
    ) -> Result<(Self, Inbound)> {
        let mut url = Url::parse(url).map_err(|e| anyhow!("invalid ws url: {e}"))?;
        if let Some(site) = site {
            url.query_pairs_mut().append_pair("site", &site.to_string());
        }

        let target = url.to_string();
        let (ws_stream, _) = with_retry(policy, || {
            let target = target.clone();
            async move {
                tokio_tungstenite::connect_async(target)
                    .await
                    .map_err(connect_error)
            }
        })
        .await
        .with_context(|| format!("Failed to connect to {url}"))?;
        let (mut ws_tx, mut ws_rx) = ws_stream.split();

        let welcome = async {
            while let Some(frame) = ws_rx.next().await {
                match frame {
                    Ok(frame) => {
                        if let Some(Message::Welcome { site }) = decode(frame) {
                            return Ok(site);
                        }
                    }
                    Err(e) => return Err(anyhow::Error::from(e)),
                }
            }
            Err(anyhow!("connection closed before welcome"))
        };
        let site: SiteId = tokio::time::timeout(WELCOME_TIMEOUT, welcome)
            .await
            .context("Timed out waiting for welcome")??;
        tracing::info!(%site, %url, "connected to relay");

        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
        let (inbound_tx, inbound) = Inbound::channel(config.presence_queue_capacity);
        let connected = Arc::new(AtomicBool::new(true));

        // local -> remote
        let forward_connected = connected.clone();
        let forward = tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                let frame = match &message {
                    Message::Presence { .. } => {
                        message.to_cbor().map(|bytes| Frame::Binary(bytes.into()))
                    }
                    _ => message.to_json().map(|text| Frame::Text(text.into())),
                };
                match frame {
                    Ok(frame) => {
                        if let Err(e) = ws_tx.send(frame).await {
                            tracing::warn!("failed to send {}: {e}", message.name());
                            break;
                        }
                    }
                    Err(e) => tracing::warn!("failed to encode {}: {e}", message.name()),
                }
            }
            // whatever was still queued is gone; the session resends from history
            forward_connected.store(false, Ordering::SeqCst);
            let _ = ws_tx.close().await;
        });

        // remote -> local
        let recv_connected = connected.clone();
        let recv = tokio::spawn(async move {
            while let Some(frame) = ws_rx.next().await {
                let frame = match frame {
                    Ok(frame) => frame,
                    Err(e) => {
                        tracing::warn!("websocket error: {e}");
                        break;
                    }
                };
                if let Some(message) = decode(frame) {
                    if !inbound_tx.deliver(message) {
                        break;
                    }
                }
            }
            recv_connected.store(false, Ordering::SeqCst);
            tracing::info!("relay connection closed");
        });

        Ok((
            Self {
                site,
                outbound,
                connected,
                tasks: [forward, recv],
            },
            inbound,
        ))
    }
}

/// Connection failures worth retrying are transport errors; a bad URL or a
/// request the relay rejects is not.
fn connect_error(e: WsError) -> CollabError {
    match e {
        WsError::Url(e) => CollabError::Config(format!("invalid relay url: {e}")),
        WsError::Http(response) if response.status().is_client_error() => {
            CollabError::Config(format!("relay refused the connection: {}", response.status()))
        }
        e => CollabError::Transport(e.to_string()),
    }
}

/// Decode one frame, dropping anything that is not a valid message.
fn decode(frame: Frame) -> Option<Message> {
    let decoded = match frame {
        Frame::Text(text) => Message::from_json(text.as_str()),
        Frame::Binary(bytes) => Message::from_cbor(&bytes),
        Frame::Ping(_) | Frame::Pong(_) | Frame::Close(_) | Frame::Frame(_) => return None,
    };
    match decoded {
        Ok(message) => Some(message),
        Err(e) => {
            tracing::warn!("dropping frame: {e}");
            None
        }
    }
}

impl Gateway for WsGateway {
    fn site(&self) -> SiteId {
        self.site
    }

    fn send(&self, message: Message) -> crate::error::Result<()> {
        if !self.is_connected() {
            return Err(CollabError::Disconnected);
        }
        self.outbound
            .send(message)
            .map_err(|_| CollabError::Disconnected)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && !self.outbound.is_closed()
    }

    fn disconnect(&mut self) {
        self.connected.store(false, Ordering::SeqCst);
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl Drop for WsGateway {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_tungstenite::tungstenite::error::UrlError;

    #[test]
    fn only_transport_failures_are_retryable() {
        let bad_url = connect_error(WsError::Url(UrlError::NoHostName));
        assert!(matches!(bad_url, CollabError::Config(_)));
        assert!(!bad_url.category().is_retryable());

        let dropped = connect_error(WsError::ConnectionClosed);
        assert!(matches!(dropped, CollabError::Transport(_)));
        assert!(dropped.category().is_retryable());
    }
}
