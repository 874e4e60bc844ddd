//! In-process hub: routes messages between gateways living in the same
//! process. Used directly in tests and wrapped by the WebSocket relay.

use std::sync::Arc;

use dashmap::DashMap;

use super::gateway::{Gateway, Inbound, InboundSender};
use super::protocol::{Message, ResyncPayload};
use crate::crdt::SiteId;
use crate::error::{CollabError, Result};

#[derive(Clone)]
pub struct MemoryHub {
    peers: Arc<DashMap<SiteId, InboundSender>>,
    presence_capacity: usize,
}

impl MemoryHub {
    pub fn new(presence_capacity: usize) -> Self {
        Self {
            peers: Arc::new(DashMap::new()),
            presence_capacity,
        }
    }

    /// Connect under a fresh random site id
    pub fn connect(&self) -> (MemoryGateway, Inbound) {
        loop {
            if let Ok(connection) = self.connect_as(SiteId::random()) {
                return connection;
            }
        }
    }

    /// Connect under a chosen site id, e.g. to resume after a disconnect.
    pub fn connect_as(&self, site: SiteId) -> Result<(MemoryGateway, Inbound)> {
        let (tx, inbound) = Inbound::channel(self.presence_capacity);

        match self.peers.entry(site) {
            dashmap::mapref::entry::Entry::Occupied(mut entry) => {
                if !entry.get().is_closed() {
                    return Err(CollabError::Transport(format!("site {site} already connected")));
                }
                entry.insert(tx);
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(tx);
            }
        }

        tracing::info!(%site, peers = self.peers.len(), "peer joined");
        self.broadcast(&site, Message::PeerJoined { site });

        let gateway = MemoryGateway {
            site,
            hub: self.clone(),
            connected: true,
        };
        Ok((gateway, inbound))
    }

    pub fn peers(&self) -> Vec<SiteId> {
        let mut peers: Vec<SiteId> = self.peers.iter().map(|entry| *entry.key()).collect();
        peers.sort();
        peers
    }

    fn leave(&self, site: &SiteId) {
        if self.peers.remove(site).is_some() {
            tracing::info!(%site, peers = self.peers.len(), "peer left");
            self.broadcast(site, Message::PeerLeft { site: *site });
        }
    }

    fn deliver(&self, to: &SiteId, message: Message) {
        let delivered = self
            .peers
            .get(to)
            .map(|peer| peer.deliver(message))
            .unwrap_or(false);
        if !delivered {
            tracing::debug!(site = %to, "message for unreachable peer dropped");
        }
    }

    fn broadcast(&self, from: &SiteId, message: Message) {
        for peer in self.peers.iter().filter(|entry| entry.key() != from) {
            peer.value().deliver(message.clone());
        }
    }

    /// Route a message sent by `from`.
    pub fn route(&self, from: &SiteId, message: Message) {
        match message {
            Message::Operation { .. } | Message::Presence { .. } => self.broadcast(from, message),
            Message::ResyncRequest { .. } => {
                // every other site answers; any of them may hold what the
                // requester lacks
                if self.peers.iter().any(|entry| entry.key() != from) {
                    self.broadcast(from, message);
                } else {
                    self.deliver(
                        from,
                        Message::ResyncResponse {
                            target: *from,
                            payload: ResyncPayload::Unavailable,
                        },
                    );
                }
            }
            Message::ResyncResponse { target, .. } => self.deliver(&target, message),
            Message::Welcome { .. } | Message::PeerJoined { .. } | Message::PeerLeft { .. } => {
                tracing::warn!(site = %from, event = message.name(), "peer sent a hub-only event");
            }
        }
    }
}

impl Default for MemoryHub {
    fn default() -> Self {
        Self::new(crate::config::CollabConfig::default().presence_queue_capacity)
    }
}

pub struct MemoryGateway {
    site: SiteId,
    hub: MemoryHub,
    connected: bool,
}

impl Gateway for MemoryGateway {
    fn site(&self) -> SiteId {
        self.site
    }

    fn send(&self, message: Message) -> Result<()> {
        if !self.connected {
            return Err(CollabError::Disconnected);
        }
        self.hub.route(&self.site, message);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn disconnect(&mut self) {
        if self.connected {
            self.connected = false;
            self.hub.leave(&self.site);
        }
    }
}

impl Drop for MemoryGateway {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crdt::VersionVector;

    #[test]
    fn membership_is_announced() {
        let hub = MemoryHub::default();
        let (alice, mut alice_in) = hub.connect_as(SiteId::new(1)).unwrap();
        let (mut bob, _bob_in) = hub.connect_as(SiteId::new(2)).unwrap();

        assert_eq!(
            alice_in.content.try_recv().unwrap(),
            Message::PeerJoined {
                site: SiteId::new(2)
            }
        );
        bob.disconnect();
        assert_eq!(
            alice_in.content.try_recv().unwrap(),
            Message::PeerLeft {
                site: SiteId::new(2)
            }
        );
        assert_eq!(hub.peers(), vec![alice.site()]);
        assert_eq!(
            bob.send(Message::PeerJoined {
                site: SiteId::new(9)
            }),
            Err(CollabError::Disconnected)
        );
    }

    #[test]
    fn duplicate_site_is_refused_until_it_leaves() {
        let hub = MemoryHub::default();
        let first = hub.connect_as(SiteId::new(1)).unwrap();
        assert!(hub.connect_as(SiteId::new(1)).is_err());
        drop(first);
        assert!(hub.connect_as(SiteId::new(1)).is_ok());
    }

    #[test]
    fn lone_resync_request_is_answered_unavailable() {
        let hub = MemoryHub::default();
        let (alice, mut inbound) = hub.connect_as(SiteId::new(1)).unwrap();
        alice
            .send(Message::ResyncRequest {
                requester: alice.site(),
                known: VersionVector::new(),
            })
            .unwrap();

        assert_eq!(
            inbound.content.try_recv().unwrap(),
            Message::ResyncResponse {
                target: SiteId::new(1),
                payload: ResyncPayload::Unavailable
            }
        );
    }

    #[test]
    fn resync_request_goes_to_every_peer_and_response_to_target() {
        let hub = MemoryHub::default();
        let (alice, mut alice_in) = hub.connect_as(SiteId::new(1)).unwrap();
        let (bob, mut bob_in) = hub.connect_as(SiteId::new(2)).unwrap();
        let (carol, mut carol_in) = hub.connect_as(SiteId::new(3)).unwrap();
        while alice_in.content.try_recv().is_ok() {}
        while bob_in.content.try_recv().is_ok() {}

        let request = Message::ResyncRequest {
            requester: carol.site(),
            known: VersionVector::new(),
        };
        carol.send(request.clone()).unwrap();
        assert_eq!(alice_in.content.try_recv().unwrap(), request);
        assert_eq!(bob_in.content.try_recv().unwrap(), request);
        assert!(carol_in.content.try_recv().is_err());

        let response = Message::ResyncResponse {
            target: carol.site(),
            payload: ResyncPayload::Replay {
                responder: alice.site(),
                version: VersionVector::new(),
                operations: Vec::new(),
            },
        };
        alice.send(response.clone()).unwrap();
        assert_eq!(carol_in.content.try_recv().unwrap(), response);
        assert!(bob_in.content.try_recv().is_err());
        drop(bob);
    }
}
