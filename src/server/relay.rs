use anyhow::Result;
use axum::{
    extract::ws::{Message as Frame, WebSocket, WebSocketUpgrade},
    extract::{Query, State},
    routing::get,
    Json, Router,
};
use colored::*;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::net::TcpListener;

use crate::config::CollabConfig;
use crate::crdt::SiteId;
use crate::sync::{Gateway, MemoryHub, Message};

#[derive(Clone)]
pub struct RelayState {
    pub hub: MemoryHub,
}

impl RelayState {
    pub fn new(config: &CollabConfig) -> Self {
        Self {
            hub: MemoryHub::new(config.presence_queue_capacity),
        }
    }
}

pub fn router(state: RelayState) -> Router {
    Router::new()
        .route("/", get(|| async { "DX Coedit Relay" }))
        .route("/health", get(|| async { Json("OK") }))
        .route("/peers", get(get_peers))
        .route("/ws", get(ws_handler))
        .with_state(state)
}

pub async fn serve(port: u16, config: &CollabConfig) -> Result<()> {
    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr).await?;
    println!(
        "{} Relay running at {}",
        "✓".green(),
        format!("ws://{}/ws", addr).bright_blue()
    );
    serve_on(listener, config).await
}

/// Serve on an already bound listener
pub async fn serve_on(listener: TcpListener, config: &CollabConfig) -> Result<()> {
    axum::serve(listener, router(RelayState::new(config))).await?;
    Ok(())
}

#[derive(Deserialize)]
struct JoinQuery {
    site: Option<u64>,
}

async fn get_peers(State(state): State<RelayState>) -> Json<Vec<SiteId>> {
    Json(state.hub.peers())
}

async fn ws_handler(
    State(state): State<RelayState>,
    Query(query): Query<JoinQuery>,
    ws: WebSocketUpgrade,
) -> impl axum::response::IntoResponse {
    let site = query
        .site
        .map(SiteId::new)
        .filter(|site| !site.is_seed())
        .unwrap_or_else(SiteId::random);
    ws.on_upgrade(move |socket| handle_ws(state, socket, site))
}

async fn handle_ws(state: RelayState, socket: WebSocket, site: SiteId) {
    let (mut sender, mut receiver) = socket.split();

    let (gateway, mut inbound) = match state.hub.connect_as(site) {
        Ok(connection) => connection,
        Err(e) => {
            tracing::warn!(%site, "refusing connection: {e}");
            let _ = sender.send(Frame::Close(None)).await;
            return;
        }
    };

    // Assign the site before anything else reaches the client
    let welcome = Message::Welcome { site };
    match welcome.to_json() {
        Ok(text) => {
            if sender.send(Frame::Text(text.into())).await.is_err() {
                return;
            }
        }
        Err(e) => {
            tracing::warn!("failed to encode welcome: {e}");
            return;
        }
    }
    println!("{} Peer joined: {}", "↔".bright_blue(), site.to_string().bright_yellow());

    // Hub -> client; content first
    let send_task = tokio::spawn(async move {
        loop {
            let frame = tokio::select! {
                biased;
                message = inbound.content.recv() => match message {
                    Some(message) => message.to_json().map(|text| Frame::Text(text.into())),
                    None => break,
                },
                update = inbound.presence.recv() => {
                    Message::Presence { update }.to_cbor().map(|bytes| Frame::Binary(bytes.into()))
                }
            };
            match frame {
                Ok(frame) => {
                    if sender.send(frame).await.is_err() {
                        break;
                    }
                }
                Err(e) => tracing::warn!("failed to encode frame: {e}"),
            }
        }
    });

    // Client -> hub
    let recv_site = site;
    let recv_task = tokio::spawn(async move {
        let mut gateway = gateway;
        while let Some(frame) = receiver.next().await {
            let decoded = match frame {
                Ok(Frame::Text(text)) => Message::from_json(text.as_str()),
                Ok(Frame::Binary(bytes)) => Message::from_cbor(&bytes),
                Ok(Frame::Close(_)) => break,
                Ok(Frame::Ping(_)) | Ok(Frame::Pong(_)) => continue,
                Err(_) => break,
            };
            let message = match decoded {
                Ok(message) => message,
                Err(e) => {
                    tracing::warn!(site = %recv_site, "dropping frame: {e}");
                    continue;
                }
            };

            if message.sender().is_some_and(|sender| sender != recv_site) {
                tracing::warn!(
                    site = %recv_site,
                    event = message.name(),
                    "dropping message claiming another site"
                );
                continue;
            }
            if gateway.send(message).is_err() {
                break;
            }
        }
        gateway.disconnect();
    });

    let _ = recv_task.await;
    send_task.abort();
    println!("{} Peer left: {}", "↔".bright_blue(), site.to_string().bright_yellow());
}
