//! Collaboration session
//!
//! Owns one replica and everything around it: the encoder for local changes,
//! the sequencer, the presence tracker and a gateway. Processes one event at
//! a time; integration never yields halfway through an operation. Renderers
//! observe the session through broadcast subscriptions.

use std::time::Instant;

use chrono::Utc;
use tokio::sync::{broadcast, mpsc};
use tokio::time::MissedTickBehavior;

use super::gateway::{Gateway, Inbound};
use super::protocol::{Message, PresenceUpdate, ResyncPayload};
use crate::config::CollabConfig;
use crate::crdt::{Operation, SiteId, VersionVector};
use crate::document::{DocumentReplica, Edit};
use crate::encoder::{ChangeEncoder, TextChange};
use crate::error::{CollabError, Result};
use crate::presence::{PresenceChange, PresenceTracker, PresenceValue};
use crate::sequencer::{DocumentSnapshot, OperationSequencer};

const EVENT_CAPACITY: usize = 256;

/// Notification for the rendering layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentEvent {
    /// Edits applied on top of the previous content
    Applied {
        site: SiteId,
        revision: u64,
        edits: Vec<Edit>,
    },
    /// Content replaced wholesale after a resync
    Reset { revision: u64, text: String },
}

/// Input from the local editor widget
#[derive(Debug, Clone)]
pub enum LocalInput {
    Change(TextChange),
    Cursor {
        position: usize,
        selection_end: Option<usize>,
    },
    Pointer {
        x: f64,
        y: f64,
    },
}

pub struct CollabSession<G: Gateway> {
    gateway: G,
    config: CollabConfig,
    encoder: ChangeEncoder,
    sequencer: OperationSequencer,
    replica: DocumentReplica,
    presence: PresenceTracker,
    document_tx: broadcast::Sender<DocumentEvent>,
    presence_tx: broadcast::Sender<PresenceChange>,

    /// When the outstanding resync request was sent
    resync_requested: Option<Instant>,
}

impl<G: Gateway> CollabSession<G> {
    /// Session on an empty document
    pub fn new(gateway: G, config: CollabConfig) -> Self {
        let sequencer = OperationSequencer::new(gateway.site(), &config);
        Self::assemble(gateway, config, sequencer, DocumentReplica::new())
    }

    /// Session starting from `snapshot`, e.g. a document every participant
    /// seeded with the same text.
    pub fn with_snapshot(
        gateway: G,
        snapshot: DocumentSnapshot,
        config: CollabConfig,
    ) -> Result<Self> {
        let (sequencer, replica) =
            OperationSequencer::from_snapshot(gateway.site(), snapshot, &config)?;
        Ok(Self::assemble(gateway, config, sequencer, replica))
    }

    fn assemble(
        gateway: G,
        config: CollabConfig,
        sequencer: OperationSequencer,
        replica: DocumentReplica,
    ) -> Self {
        let (document_tx, _) = broadcast::channel(EVENT_CAPACITY);
        let (presence_tx, _) = broadcast::channel(EVENT_CAPACITY);

        Self {
            encoder: ChangeEncoder::new(config.diff.clone()),
            presence: PresenceTracker::new(config.presence_liveness()),
            gateway,
            config,
            sequencer,
            replica,
            document_tx,
            presence_tx,
            resync_requested: None,
        }
    }

    pub fn site(&self) -> SiteId {
        self.sequencer.site()
    }

    /// Read-only `(text, revision)` view
    pub fn snapshot(&self) -> (String, u64) {
        self.replica.snapshot()
    }

    pub fn text(&self) -> String {
        self.replica.text()
    }

    pub fn revision(&self) -> u64 {
        self.replica.revision()
    }

    pub fn document_snapshot(&self) -> DocumentSnapshot {
        self.sequencer.snapshot(&self.replica)
    }

    pub fn presence(&self) -> &PresenceTracker {
        &self.presence
    }

    pub fn gateway(&self) -> &G {
        &self.gateway
    }

    pub fn is_resyncing(&self) -> bool {
        self.resync_requested.is_some()
    }

    pub fn outgoing_len(&self) -> usize {
        self.sequencer.outgoing_len()
    }

    pub fn pending_len(&self) -> usize {
        self.sequencer.pending_len()
    }

    pub fn subscribe_document(&self) -> broadcast::Receiver<DocumentEvent> {
        self.document_tx.subscribe()
    }

    pub fn subscribe_presence(&self) -> broadcast::Receiver<PresenceChange> {
        self.presence_tx.subscribe()
    }

    fn publish_presence(&self, changes: impl IntoIterator<Item = PresenceChange>) {
        for change in changes {
            let _ = self.presence_tx.send(change);
        }
    }

    fn publish_edits(&mut self, site: SiteId, revision: u64, edits: Vec<Edit>) {
        let moved = self.presence.rebase_cursors(&edits);
        self.publish_presence(moved);
        let _ = self.document_tx.send(DocumentEvent::Applied {
            site,
            revision,
            edits,
        });
    }

    /// Announce this site and catch up with whatever peers already have.
    pub fn join(&mut self) {
        tracing::info!(site = %self.site(), "joining session");
        self.request_resync(Instant::now(), "join");
    }

    /// Apply a change made in the local editor and send it.
    pub fn local_change(&mut self, change: TextChange) -> Result<()> {
        self.encoder.set_backpressure(self.sequencer.is_backpressured());
        let coalesce = self.encoder.is_coalescing();
        let site = self.site();

        for edit in self.encoder.encode(change) {
            match self.sequencer.generate(edit, &mut self.replica, coalesce) {
                Ok(applied) => self.publish_edits(site, applied.revision, applied.edits),
                Err(e) if e.requires_resync() => {
                    tracing::warn!("local change rejected: {e}");
                    self.request_resync(Instant::now(), "local change out of range");
                    return Err(e);
                }
                Err(e) => return Err(e),
            }
        }

        self.flush();
        Ok(())
    }

    pub fn set_cursor(&mut self, position: usize, selection_end: Option<usize>) {
        self.send_presence(PresenceValue::Cursor {
            position,
            selection_end,
        });
    }

    pub fn set_pointer(&mut self, x: f64, y: f64) {
        self.send_presence(PresenceValue::Pointer { x, y });
    }

    fn send_presence(&mut self, value: PresenceValue) {
        let update = PresenceUpdate {
            site: self.site(),
            value,
            sent_at: Utc::now(),
        };
        // presence is ephemeral; a lost update is superseded by the next one
        if let Err(e) = self.gateway.send(Message::Presence { update }) {
            tracing::trace!("presence not sent: {e}");
        }
    }

    pub fn handle_local(&mut self, input: LocalInput) -> Result<()> {
        match input {
            LocalInput::Change(change) => self.local_change(change)?,
            LocalInput::Cursor {
                position,
                selection_end,
            } => self.set_cursor(position, selection_end),
            LocalInput::Pointer { x, y } => self.set_pointer(x, y),
        }
        Ok(())
    }

    /// Hand queued local operations to the gateway. Returns how many went out.
    pub fn flush(&mut self) -> usize {
        let gateway = &self.gateway;
        let mut sent = 0;
        let result = self.sequencer.flush(|op| {
            gateway.send(Message::Operation {
                operation: op.clone(),
            })?;
            sent += 1;
            Ok(())
        });

        if let Err(e) = result {
            tracing::debug!(queued = self.sequencer.outgoing_len(), "flush stopped: {e}");
        }
        sent
    }

    fn request_resync(&mut self, now: Instant, reason: &str) {
        let request = Message::ResyncRequest {
            requester: self.site(),
            known: self.sequencer.version().clone(),
        };
        match self.gateway.send(request) {
            Ok(()) => {
                tracing::warn!(site = %self.site(), reason, "resync requested");
                self.resync_requested = Some(now);
            }
            Err(e) => tracing::warn!(reason, "resync request not sent: {e}"),
        }
    }

    fn receive(&mut self, operation: Operation, now: Instant) {
        match self.sequencer.receive(operation, &mut self.replica, now) {
            Ok(applied) => {
                for remote in applied {
                    self.publish_edits(remote.site, remote.applied.revision, remote.applied.edits);
                }
            }
            Err(e) if e.requires_resync() => {
                tracing::warn!("remote operation rejected: {e}");
                let _ = self.document_tx.send(DocumentEvent::Reset {
                    revision: self.replica.revision(),
                    text: self.replica.text(),
                });
                if self.resync_requested.is_none() {
                    self.request_resync(now, "remote operation out of range");
                }
            }
            Err(e) => tracing::warn!("dropping remote operation: {e}"),
        }
    }

    fn restore(&mut self, snapshot: DocumentSnapshot, now: Instant) {
        match self.sequencer.restore(snapshot, &mut self.replica, now) {
            Ok(changed) => {
                if changed {
                    let _ = self.document_tx.send(DocumentEvent::Reset {
                        revision: self.replica.revision(),
                        text: self.replica.text(),
                    });
                }
                tracing::info!(revision = self.replica.revision(), changed, "snapshot restored");
                self.flush();
            }
            Err(e) => tracing::warn!("dropping snapshot: {e}"),
        }
    }

    /// Process one content message from the gateway.
    pub fn handle_message(&mut self, message: Message, now: Instant) {
        match message {
            Message::Operation { operation } => self.receive(operation, now),
            Message::Presence { update } => self.handle_presence(update, now),
            Message::ResyncRequest { requester, known } => {
                if requester == self.site() {
                    return;
                }
                let responder = self.site();
                let payload = match self.sequencer.ops_since(&known) {
                    Some(operations) => ResyncPayload::Replay {
                        responder,
                        version: self.sequencer.version().clone(),
                        operations,
                    },
                    None => ResyncPayload::Snapshot {
                        responder,
                        snapshot: self.sequencer.snapshot(&self.replica),
                    },
                };
                tracing::debug!(%requester, "answering resync request");
                let response = Message::ResyncResponse {
                    target: requester,
                    payload,
                };
                if let Err(e) = self.gateway.send(response) {
                    tracing::warn!("resync response not sent: {e}");
                }
            }
            Message::ResyncResponse { target, payload } => {
                if target != self.site() {
                    return;
                }
                self.handle_resync_response(payload, now);
            }
            Message::Welcome { site } => {
                tracing::trace!(%site, "welcome ignored after connect");
            }
            Message::PeerJoined { site } => {
                tracing::info!(%site, "peer joined");
            }
            Message::PeerLeft { site } => {
                tracing::info!(%site, "peer left");
                self.sequencer.discard_site(&site);
                let removed = self.presence.remove(&site);
                self.publish_presence(removed);
            }
        }
    }

    /// Apply a peer's answer. The resync is over once this site holds
    /// everything the responder had; otherwise it stays open and is asked
    /// again after the desync timeout. Either way the responder is sent any
    /// of this site's own operations it turned out to lack.
    fn handle_resync_response(&mut self, payload: ResyncPayload, now: Instant) {
        let responder = payload.responder();
        let version = payload.version().cloned();

        match payload {
            ResyncPayload::Replay { operations, .. } => {
                tracing::info!(count = operations.len(), "replaying missed operations");
                for op in operations {
                    self.receive(op, now);
                }
            }
            ResyncPayload::Snapshot { snapshot, .. } => self.restore(snapshot, now),
            ResyncPayload::Unavailable => {
                tracing::info!("no peer could answer the resync request");
                self.resync_requested = None;
                return;
            }
        }

        let (Some(responder), Some(version)) = (responder, version) else {
            return;
        };
        self.offer_missing(responder, &version);

        if self.sequencer.version().dominates(&version) {
            if self.resync_requested.take().is_some() {
                tracing::info!(%responder, "resync complete");
            }
        } else if self.resync_requested.is_some() {
            tracing::info!(%responder, "responder is ahead of what could be integrated; still resyncing");
        }
    }

    /// Send `peer` this site's own sent operations its `version` lacks.
    fn offer_missing(&mut self, peer: SiteId, version: &VersionVector) {
        let site = self.site();
        let theirs = version.get(&site);
        let payload = match self.sequencer.local_ops_after(theirs) {
            Some(operations) if operations.is_empty() => return,
            Some(operations) => ResyncPayload::Replay {
                responder: site,
                version: self.sequencer.version().clone(),
                operations,
            },
            None => ResyncPayload::Snapshot {
                responder: site,
                snapshot: self.sequencer.snapshot(&self.replica),
            },
        };

        tracing::info!(%peer, after = theirs, "resending operations the peer never got");
        if let Err(e) = self.gateway.send(Message::ResyncResponse {
            target: peer,
            payload,
        }) {
            tracing::warn!("resend to {peer} failed: {e}");
        }
    }

    pub fn handle_presence(&mut self, update: PresenceUpdate, now: Instant) {
        if update.site == self.site() {
            return;
        }
        if let Some(change) = self
            .presence
            .update(update.site, update.value, update.sent_at, now)
        {
            self.publish_presence([change]);
        }
    }

    /// Housekeeping: presence expiry, desync detection and retrying queued
    /// operations.
    pub fn tick(&mut self, now: Instant) {
        let expired = self.presence.expire(now);
        self.publish_presence(expired);

        let resync_due = match self.resync_requested {
            None => true,
            Some(at) => now.saturating_duration_since(at) > self.config.desync_timeout(),
        };
        if resync_due {
            if let Err(e @ CollabError::DesyncTimeout { .. }) = self.sequencer.check_timeouts(now) {
                tracing::warn!("{e}");
                self.request_resync(now, "desync timeout");
            } else if self.resync_requested.is_some() {
                // the responder went away; ask again
                self.request_resync(now, "resync response overdue");
            }
        }

        if self.sequencer.outgoing_len() > 0 {
            self.flush();
        }
    }

    /// Process everything already queued on `inbound`, content first.
    /// Returns how many messages were handled.
    pub fn pump(&mut self, inbound: &mut Inbound, now: Instant) -> usize {
        let mut handled = 0;
        while let Ok(message) = inbound.content.try_recv() {
            self.handle_message(message, now);
            handled += 1;
        }
        while let Some(update) = inbound.presence.try_recv() {
            self.handle_presence(update, now);
            handled += 1;
        }
        handled
    }

    /// Swap in a fresh connection, send what queued up meanwhile and ask
    /// peers for what was missed. Their answers tell which already-sent
    /// operations never reached them; those are sent again.
    pub fn reconnect(&mut self, gateway: G) -> Result<()> {
        if gateway.site() != self.site() {
            return Err(CollabError::Transport(format!(
                "reconnected as {} instead of {}",
                gateway.site(),
                self.site()
            )));
        }
        self.gateway.disconnect();
        self.gateway = gateway;
        self.resync_requested = None;

        let sent = self.flush();
        tracing::info!(site = %self.site(), sent, "reconnected");
        self.request_resync(Instant::now(), "reconnect");
        Ok(())
    }

    pub fn disconnect(&mut self) {
        self.gateway.disconnect();
    }

    /// Drive the session until the gateway or the local input closes.
    pub async fn run(
        &mut self,
        inbound: &mut Inbound,
        local: &mut mpsc::UnboundedReceiver<LocalInput>,
    ) {
        let mut ticker = tokio::time::interval(self.config.tick_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                message = inbound.content.recv() => match message {
                    Some(message) => self.handle_message(message, Instant::now()),
                    None => {
                        tracing::info!(site = %self.site(), "gateway closed");
                        break;
                    }
                },
                input = local.recv() => match input {
                    Some(input) => {
                        if let Err(e) = self.handle_local(input) {
                            tracing::warn!("local input failed: {e}");
                        }
                    }
                    None => break,
                },
                update = inbound.presence.recv() => {
                    self.handle_presence(update, Instant::now());
                }
                _ = ticker.tick() => self.tick(Instant::now()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::RangeChange;
    use crate::sync::memory::{MemoryGateway, MemoryHub};
    use std::time::Duration;

    type Session = CollabSession<MemoryGateway>;

    const A: u64 = 1;
    const B: u64 = 2;
    const C: u64 = 3;

    fn session(hub: &MemoryHub, site: u64, text: &str) -> (Session, Inbound) {
        let (gateway, inbound) = hub.connect_as(SiteId::new(site)).unwrap();
        let snapshot = DocumentSnapshot::seeded(text);
        let session = CollabSession::with_snapshot(gateway, snapshot, CollabConfig::default());
        (session.unwrap(), inbound)
    }

    fn type_at(session: &mut Session, offset: usize, text: &str) {
        session
            .local_change(TextChange::Ranges(vec![RangeChange::insert(offset, text)]))
            .unwrap();
    }

    /// Pump every session until nobody has anything left to handle.
    fn settle(sessions: &mut [(&mut Session, &mut Inbound)], now: Instant) {
        loop {
            let handled: usize = sessions
                .iter_mut()
                .map(|(session, inbound)| session.pump(inbound, now))
                .sum();
            if handled == 0 {
                break;
            }
        }
    }

    #[test]
    fn two_sessions_converge_on_scenario() {
        let hub = MemoryHub::default();
        let (mut a, mut a_in) = session(&hub, A, "ab");
        let (mut b, mut b_in) = session(&hub, B, "ab");
        let now = Instant::now();
        a.pump(&mut a_in, now);

        type_at(&mut a, 1, "X");
        type_at(&mut b, 1, "Y");
        a.pump(&mut a_in, now);
        b.pump(&mut b_in, now);

        assert_eq!(a.snapshot(), ("aXYb".to_string(), 2));
        assert_eq!(b.snapshot(), ("aXYb".to_string(), 2));
    }

    #[test]
    fn late_joiner_catches_up_through_replay() {
        let hub = MemoryHub::default();
        let (mut a, mut a_in) = session(&hub, A, "");
        type_at(&mut a, 0, "hello");

        let (mut b, mut b_in) = session(&hub, B, "");
        let mut events = b.subscribe_document();
        b.join();
        a.pump(&mut a_in, Instant::now());
        b.pump(&mut b_in, Instant::now());

        assert_eq!(b.text(), "hello");
        assert!(!b.is_resyncing());
        assert!(matches!(events.try_recv(), Ok(DocumentEvent::Applied { .. })));
    }

    #[test]
    fn joiner_catches_up_even_when_an_empty_peer_answers_first() {
        let hub = MemoryHub::default();
        let (mut b, mut b_in) = session(&hub, B, "");
        type_at(&mut b, 0, "hello");

        let (mut a, mut a_in) = session(&hub, A, "");
        let (mut c, mut c_in) = session(&hub, C, "");
        a.join();
        c.join();
        settle(
            &mut [(&mut a, &mut a_in), (&mut c, &mut c_in), (&mut b, &mut b_in)],
            Instant::now(),
        );

        assert_eq!(c.text(), "hello");
        assert_eq!(a.text(), "hello");
        assert!(!c.is_resyncing());
        assert!(!a.is_resyncing());
    }

    #[test]
    fn incomplete_answer_keeps_resyncing() {
        let hub = MemoryHub::default();
        let (mut c, _c_in) = session(&hub, C, "");
        let (_b, _b_in) = session(&hub, B, "");
        c.join();
        assert!(c.is_resyncing());

        let mut ahead = VersionVector::new();
        ahead.set(SiteId::new(B), 2);
        let now = Instant::now();
        c.handle_message(
            Message::ResyncResponse {
                target: SiteId::new(C),
                payload: ResyncPayload::Replay {
                    responder: SiteId::new(B),
                    version: ahead,
                    operations: Vec::new(),
                },
            },
            now,
        );
        assert!(c.is_resyncing());
    }

    #[test]
    fn lone_session_gives_up_resync() {
        let hub = MemoryHub::default();
        let (mut a, mut a_in) = session(&hub, A, "solo");
        a.join();
        assert!(a.is_resyncing());
        a.pump(&mut a_in, Instant::now());
        assert!(!a.is_resyncing());
        assert_eq!(a.text(), "solo");
    }

    #[test]
    fn edits_made_while_disconnected_are_sent_on_reconnect() {
        let hub = MemoryHub::default();
        let (mut a, _a_in) = session(&hub, A, "");
        let (mut b, mut b_in) = session(&hub, B, "");

        a.disconnect();
        type_at(&mut a, 0, "offline");
        assert_eq!(a.outgoing_len(), 1);

        let (gateway, _a_in) = hub.connect_as(SiteId::new(A)).unwrap();
        a.reconnect(gateway).unwrap();
        assert_eq!(a.outgoing_len(), 0);

        b.pump(&mut b_in, Instant::now());
        assert_eq!(b.text(), "offline");
    }

    #[test]
    fn operations_lost_in_transit_are_resent_after_reconnect() {
        let hub = MemoryHub::default();
        let (mut a, _a_in) = session(&hub, A, "");
        let (mut b, mut b_in) = session(&hub, B, "");

        // accepted by the gateway, never seen by B
        type_at(&mut a, 0, "lost");
        assert_eq!(a.outgoing_len(), 0);
        while b_in.content.try_recv().is_ok() {}

        a.disconnect();
        let (gateway, mut a_in) = hub.connect_as(SiteId::new(A)).unwrap();
        a.reconnect(gateway).unwrap();
        settle(&mut [(&mut b, &mut b_in), (&mut a, &mut a_in)], Instant::now());

        assert_eq!(b.text(), "lost");
        assert!(!a.is_resyncing());
    }

    #[test]
    fn presence_is_tracked_and_expires() {
        let hub = MemoryHub::default();
        let (mut a, mut a_in) = session(&hub, A, "abc");
        let (mut b, _b_in) = session(&hub, B, "abc");
        let mut changes = a.subscribe_presence();
        let start = Instant::now();

        b.set_cursor(2, None);
        a.pump(&mut a_in, start);
        assert_eq!(a.presence().len(), 1);
        assert!(matches!(changes.try_recv(), Ok(PresenceChange::Added { .. })));

        a.tick(start + Duration::from_secs(10));
        assert_eq!(a.presence().len(), 1);
        a.tick(start + Duration::from_secs(31));
        assert!(a.presence().is_empty());
        assert!(matches!(changes.try_recv(), Ok(PresenceChange::Removed { .. })));
    }

    #[test]
    fn remote_cursor_follows_local_typing() {
        let hub = MemoryHub::default();
        let (mut a, mut a_in) = session(&hub, A, "abc");
        let (mut b, _b_in) = session(&hub, B, "abc");

        b.set_cursor(2, None);
        a.pump(&mut a_in, Instant::now());
        type_at(&mut a, 0, ">>");

        let (_, entry) = a.presence().entries().next().unwrap();
        assert_eq!(
            entry.value,
            PresenceValue::Cursor {
                position: 4,
                selection_end: None
            }
        );
    }

    #[test]
    fn departed_peer_presence_is_removed() {
        let hub = MemoryHub::default();
        let (mut a, mut a_in) = session(&hub, A, "");
        let (mut b, b_in) = session(&hub, B, "");

        b.set_pointer(3.0, 4.0);
        a.pump(&mut a_in, Instant::now());
        assert_eq!(a.presence().len(), 1);

        b.disconnect();
        drop(b_in);
        a.pump(&mut a_in, Instant::now());
        assert!(a.presence().is_empty());
    }

    #[test]
    fn malformed_operation_is_dropped() {
        let hub = MemoryHub::default();
        let (mut a, mut a_in) = session(&hub, A, "abc");
        let (b, _b_in) = session(&hub, B, "abc");

        b.gateway()
            .send(Message::Operation {
                operation: Operation {
                    site: SiteId::new(B),
                    clock: 1,
                    origin_revision: 0,
                    deps: VersionVector::new(),
                    kind: crate::crdt::OperationKind::Insert {
                        position: 0,
                        text: "x".into(),
                    },
                    update: vec![0xff, 0xff, 0xff],
                },
            })
            .unwrap();
        a.pump(&mut a_in, Instant::now());

        assert_eq!(a.snapshot(), ("abc".to_string(), 0));
        assert!(!a.is_resyncing());
    }

    #[test]
    fn desync_timeout_requests_snapshot_or_replay() {
        let hub = MemoryHub::default();
        let (mut a, mut a_in) = session(&hub, A, "");
        let (mut b, mut b_in) = session(&hub, B, "");
        let (c, _c_in) = session(&hub, C, "");
        a.pump(&mut a_in, Instant::now());

        // two operations from C; B never sees the first
        let config = CollabConfig::default();
        let (mut writer, mut doc) =
            OperationSequencer::from_snapshot(SiteId::new(C), DocumentSnapshot::seeded(""), &config)
                .unwrap();
        for (position, text) in [(0, "x"), (1, "y")] {
            let edit = Edit::Insert {
                position,
                text: text.into(),
            };
            writer.generate(edit, &mut doc, false).unwrap();
        }
        let mut ops = Vec::new();
        writer
            .flush(|op| {
                ops.push(op.clone());
                Ok(())
            })
            .unwrap();
        let second = ops.pop().unwrap();
        let first = ops.pop().unwrap();

        a.handle_message(Message::Operation { operation: first }, Instant::now());
        c.gateway()
            .send(Message::Operation { operation: second })
            .unwrap();

        let start = Instant::now();
        b.pump(&mut b_in, start);
        assert_eq!(b.pending_len(), 1);

        b.tick(start + Duration::from_secs(6));
        assert!(b.is_resyncing());
        a.pump(&mut a_in, start);
        b.pump(&mut b_in, start);

        assert_eq!(b.pending_len(), 0);
        assert_eq!(b.text(), "xy");
        assert_eq!(a.text(), b.text());
        assert!(!b.is_resyncing());
    }
}
