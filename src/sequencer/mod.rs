//! Operation sequencer
//!
//! Stamps local edits, queues them for the gateway and applies them
//! optimistically; integrates remote operations in causal order. Each
//! operation carries a CRDT update for the [`SharedText`], which places
//! concurrent edits identically on every replica, and the replica mirror is
//! driven by the delta the CRDT reports. Operations arriving before what they
//! depend on wait in a [`PendingBuffer`] until they become ready or time out.

pub mod pending;

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use yrs::StateVector;

use crate::config::CollabConfig;
use crate::crdt::operations::update_bytes;
use crate::crdt::{Operation, OperationKind, SharedText, SiteClock, SiteId, TextDelta, VersionVector};
use crate::document::{AppliedResult, DocumentReplica, Edit};
use crate::error::{CollabError, Result};

pub use pending::PendingBuffer;

/// Full replica state handed to late joiners and desynchronized peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentSnapshot {
    pub text: String,
    pub revision: u64,

    /// Encoded CRDT state holding `text`
    #[serde(with = "update_bytes")]
    pub state: Vec<u8>,

    pub version: VersionVector,
}

impl DocumentSnapshot {
    /// Snapshot of `text` at revision 0. Seeding the same text on several
    /// sites yields identical CRDT state, so they can edit right away.
    pub fn seeded(text: &str) -> Self {
        let mut seed = SharedText::new(SiteId::SEED);
        let mut version = VersionVector::new();
        if !text.is_empty() && seed.insert(0, text).is_ok() {
            version.set(SiteId::SEED, 1);
        }

        Self {
            text: text.to_string(),
            revision: 0,
            state: seed.encode_state(),
            version,
        }
    }
}

/// A remote operation that made it into the replica
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteApplied {
    pub site: SiteId,
    pub clock: u64,
    pub applied: AppliedResult,
}

pub struct OperationSequencer {
    clock: SiteClock,
    text: SharedText,
    version: VersionVector,

    /// Stamped local operations not yet accepted by the gateway
    outgoing: VecDeque<Operation>,
    outgoing_limit: usize,

    /// Replica revision right after the back of `outgoing` was last applied
    tail_revision: Option<u64>,
    /// CRDT state just before the back of `outgoing` was generated
    tail_base: Option<StateVector>,

    pending: PendingBuffer,
    desync_timeout: Duration,

    /// Sent and received operations, in integration order
    history: VecDeque<Operation>,
    history_limit: usize,

    /// Highest clock per site no longer (or never) in `history`
    truncated: VersionVector,
}

impl OperationSequencer {
    pub fn new(site: SiteId, config: &CollabConfig) -> Self {
        Self {
            clock: SiteClock::new(site),
            text: SharedText::new(site),
            version: VersionVector::new(),
            outgoing: VecDeque::new(),
            outgoing_limit: config.outgoing_queue_limit,
            tail_revision: None,
            tail_base: None,
            pending: PendingBuffer::new(config.pending_per_site_limit),
            desync_timeout: config.desync_timeout(),
            history: VecDeque::new(),
            history_limit: config.history_limit,
            truncated: VersionVector::new(),
        }
    }

    /// Start from a snapshot, adopting its revision as-is.
    pub fn from_snapshot(
        site: SiteId,
        snapshot: DocumentSnapshot,
        config: &CollabConfig,
    ) -> Result<(Self, DocumentReplica)> {
        check_snapshot(&snapshot)?;

        let mut sequencer = Self::new(site, config);
        sequencer.text.apply_update(&snapshot.state)?;
        sequencer.clock.observe(snapshot.version.get(&site));
        sequencer.truncated = snapshot.version.clone();
        sequencer.version = snapshot.version;

        let replica = DocumentReplica::with_text(&sequencer.text.content(), snapshot.revision);
        Ok((sequencer, replica))
    }

    pub fn site(&self) -> SiteId {
        *self.clock.site()
    }

    pub fn version(&self) -> &VersionVector {
        &self.version
    }

    pub fn outgoing_len(&self) -> usize {
        self.outgoing.len()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// True while the gateway is not keeping up with local edits.
    pub fn is_backpressured(&self) -> bool {
        self.outgoing.len() >= self.outgoing_limit
    }

    pub fn snapshot(&self, replica: &DocumentReplica) -> DocumentSnapshot {
        DocumentSnapshot {
            text: self.text.content(),
            revision: replica.revision(),
            state: self.text.encode_state(),
            version: self.version.clone(),
        }
    }

    /// Stamp a local edit, apply it to `replica` and queue it for sending.
    ///
    /// With `coalesce` set, an edit continuing the still-unsent tail operation
    /// (typing on, or deleting next to it) extends that operation instead of
    /// stamping a new one.
    pub fn generate(
        &mut self,
        edit: Edit,
        replica: &mut DocumentReplica,
        coalesce: bool,
    ) -> Result<AppliedResult> {
        let (start, end) = match &edit {
            Edit::Insert { position, text } => {
                if text.is_empty() {
                    return Err(CollabError::MalformedOperation("empty local insert".into()));
                }
                byte_range(replica, *position, 0)?
            }
            Edit::Delete { position, length } => {
                if *length == 0 {
                    return Err(CollabError::MalformedOperation("empty local delete".into()));
                }
                byte_range(replica, *position, *length)?
            }
        };

        let extends = coalesce
            && self.tail_revision == Some(replica.revision())
            && self.tail_base.is_some()
            && self.continues_tail(&edit);
        let origin_revision = replica.revision();
        let base = self.text.state_vector();

        let update = match &edit {
            Edit::Insert { text, .. } => self.text.insert(start, text)?,
            Edit::Delete { .. } => self.text.remove(start, end - start)?,
        };
        let applied = match replica.apply(vec![edit.clone()]) {
            Ok(applied) => applied,
            Err(err) => {
                self.realign(replica);
                return Err(err);
            }
        };
        self.tail_revision = Some(applied.revision);

        if extends {
            self.extend_tail(edit);
            return Ok(applied);
        }

        let site = self.site();
        let clock = self.clock.tick();
        let kind = match edit {
            Edit::Insert { position, text } => OperationKind::Insert { position, text },
            Edit::Delete { position, length } => OperationKind::Delete { position, length },
        };
        self.push_local(Operation {
            site,
            clock,
            origin_revision,
            deps: self.version.clone(),
            kind,
            update,
        });
        self.tail_base = Some(base);
        Ok(applied)
    }

    fn push_local(&mut self, op: Operation) {
        self.version.set(op.site, op.clock);
        self.outgoing.push_back(op);
        if self.is_backpressured() {
            tracing::debug!(queued = self.outgoing.len(), "outgoing queue at limit");
        }
    }

    /// Typing on at the end of the tail insert, or deleting next to the tail
    /// delete.
    fn continues_tail(&self, edit: &Edit) -> bool {
        let Some(tail) = self.outgoing.back() else {
            return false;
        };
        match (&tail.kind, edit) {
            (
                OperationKind::Insert {
                    position: tail_position,
                    text: tail_text,
                },
                Edit::Insert { position, .. },
            ) => *position == tail_position + tail_text.chars().count(),
            (
                OperationKind::Delete {
                    position: tail_position,
                    ..
                },
                Edit::Delete { position, length },
            ) => position == tail_position || position + length == *tail_position,
            _ => false,
        }
    }

    fn extend_tail(&mut self, edit: Edit) {
        let Some(base) = &self.tail_base else {
            return;
        };
        let update = self.text.diff_since(base);
        let Some(tail) = self.outgoing.back_mut() else {
            return;
        };

        match (&mut tail.kind, edit) {
            (OperationKind::Insert { text: tail_text, .. }, Edit::Insert { text, .. }) => {
                tail_text.push_str(&text);
            }
            (
                OperationKind::Delete {
                    position: tail_position,
                    length: tail_length,
                },
                Edit::Delete { position, length },
            ) => {
                *tail_position = (*tail_position).min(position);
                *tail_length += length;
            }
            _ => return,
        }
        tail.update = update;
    }

    /// Hand queued operations to `send` in order. Stops at the first failure,
    /// leaving that operation and everything after it queued.
    ///
    /// Sent operations stay in history, so a peer that never got them can be
    /// served again from there.
    pub fn flush<F>(&mut self, mut send: F) -> Result<usize>
    where
        F: FnMut(&Operation) -> Result<()>,
    {
        let mut sent = 0;
        while let Some(op) = self.outgoing.pop_front() {
            if let Err(err) = send(&op) {
                self.outgoing.push_front(op);
                return Err(err);
            }
            self.record(op);
            sent += 1;
        }
        self.tail_revision = None;
        self.tail_base = None;
        Ok(sent)
    }

    fn record(&mut self, op: Operation) {
        self.history.push_back(op);
        while self.history.len() > self.history_limit {
            if let Some(evicted) = self.history.pop_front() {
                self.truncated.set(evicted.site, evicted.clock);
            }
        }
    }

    /// Integrate a remote operation and everything it unblocks.
    ///
    /// Duplicates are dropped; operations whose dependencies are missing are
    /// buffered. Malformed input is rejected without touching any state.
    pub fn receive(
        &mut self,
        op: Operation,
        replica: &mut DocumentReplica,
        now: Instant,
    ) -> Result<Vec<RemoteApplied>> {
        op.validate()?;

        if self.version.contains(&op.site, op.clock) || self.pending.contains(&op.site, op.clock) {
            tracing::trace!(site = %op.site, clock = op.clock, "duplicate operation dropped");
            return Ok(Vec::new());
        }

        if !op.is_ready(&self.version) {
            tracing::debug!(
                site = %op.site,
                clock = op.clock,
                known = self.version.get(&op.site),
                "operation buffered until its dependencies arrive"
            );
            let (site, clock) = (op.site, op.clock);
            if !self.pending.push(op, now) {
                tracing::debug!(%site, clock, "pending buffer full for site, operation dropped");
            }
            return Ok(Vec::new());
        }

        let mut applied = vec![self.integrate(op, replica)?];
        applied.extend(self.drain_pending(replica)?);
        Ok(applied)
    }

    fn drain_pending(&mut self, replica: &mut DocumentReplica) -> Result<Vec<RemoteApplied>> {
        let mut applied = Vec::new();
        loop {
            self.pending.prune(&self.version);
            let Some(next) = self.pending.take_ready(&self.version) else {
                break;
            };
            match self.integrate(next, replica) {
                Ok(result) => applied.push(result),
                Err(CollabError::MalformedOperation(reason)) => {
                    tracing::warn!("dropping buffered operation: {reason}");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(applied)
    }

    fn integrate(&mut self, op: Operation, replica: &mut DocumentReplica) -> Result<RemoteApplied> {
        let delta = self.text.apply_update(&op.update)?;

        let (site, clock, origin_revision) = (op.site, op.clock, op.origin_revision);
        self.version.set(site, clock);
        if site == self.site() {
            self.clock.observe(clock);
        }
        self.record(op);

        let applied = self.mirror(&delta, replica)?;
        tracing::debug!(
            %site,
            clock,
            origin_revision,
            revision = applied.revision,
            "integrated remote operation"
        );

        Ok(RemoteApplied {
            site,
            clock,
            applied,
        })
    }

    /// Replay a CRDT delta onto the replica. If the replica no longer matches
    /// the CRDT text it is reset from it and the error is returned.
    fn mirror(&self, delta: &[TextDelta], replica: &mut DocumentReplica) -> Result<AppliedResult> {
        let result = replica
            .edits_from_delta(delta)
            .and_then(|edits| replica.apply(edits));
        let err = match result {
            Ok(applied) if replica.len_bytes() == self.text.len() as usize => return Ok(applied),
            Ok(_) => CollabError::OutOfRangeOperation {
                position: replica.len_chars(),
                length: 0,
                document_len: self.text.content().chars().count(),
            },
            Err(err) => err,
        };
        tracing::warn!("replica drifted from shared text, realigning: {err}");
        self.realign(replica);
        Err(err)
    }

    /// Reset the replica to the CRDT text. Returns whether it changed.
    fn realign(&self, replica: &mut DocumentReplica) -> bool {
        let revision = replica.revision() + 1;
        replica.reset(&self.text.content(), revision)
    }

    /// Fail if a buffered operation has waited past the desync timeout.
    pub fn check_timeouts(&self, now: Instant) -> Result<()> {
        match self.pending.overdue(now, self.desync_timeout) {
            Some((op, waited)) => Err(CollabError::DesyncTimeout {
                site: op.site,
                clock: op.clock,
                waited,
            }),
            None => Ok(()),
        }
    }

    /// Forget buffered operations from a departed site.
    pub fn discard_site(&mut self, site: &SiteId) -> usize {
        let dropped = self.pending.discard_site(site);
        if dropped > 0 {
            tracing::info!(%site, dropped, "discarded buffered operations of departed site");
        }
        dropped
    }

    /// Operations a peer at `known` is missing, or `None` if some of them
    /// are no longer in history.
    pub fn ops_since(&self, known: &VersionVector) -> Option<Vec<Operation>> {
        let truncated = self
            .version
            .iter()
            .any(|(site, clock)| clock > known.get(site) && self.truncated.get(site) > known.get(site));
        if truncated {
            return None;
        }

        Some(
            self.history
                .iter()
                .filter(|op| !known.contains(&op.site, op.clock))
                .cloned()
                .collect(),
        )
    }

    /// This site's own sent operations after clock `after`, or `None` if some
    /// of them are no longer in history.
    pub fn local_ops_after(&self, after: u64) -> Option<Vec<Operation>> {
        let site = self.site();
        if self.truncated.get(&site) > after {
            return None;
        }
        Some(
            self.history
                .iter()
                .filter(|op| op.site == site && op.clock > after)
                .cloned()
                .collect(),
        )
    }

    /// Merge a peer's snapshot into the shared text and adopt its version.
    /// Nothing this site already integrated or still has to send is lost, and
    /// history is left as it is. Returns whether the replica content changed.
    pub fn restore(
        &mut self,
        snapshot: DocumentSnapshot,
        replica: &mut DocumentReplica,
        now: Instant,
    ) -> Result<bool> {
        check_snapshot(&snapshot)?;
        let before = replica.text();

        self.text.apply_update(&snapshot.state)?;
        for (site, clock) in snapshot.version.iter() {
            if clock > self.version.get(site) {
                // arrived without passing through history
                self.truncated.set(*site, clock);
            }
            self.version.set(*site, clock);
        }
        self.clock.observe(snapshot.version.get(&self.site()));
        self.tail_revision = None;
        self.tail_base = None;

        replica.reset(&self.text.content(), snapshot.revision);
        self.drain_pending(replica)?;
        self.pending.restart_timers(now);

        Ok(replica.text() != before)
    }
}

/// Byte offsets of the char range `position..position + length`
fn byte_range(replica: &DocumentReplica, position: usize, length: usize) -> Result<(u32, u32)> {
    let len = replica.len_chars();
    if position.checked_add(length).map_or(true, |end| end > len) {
        return Err(CollabError::OutOfRangeOperation {
            position,
            length,
            document_len: len,
        });
    }
    Ok((replica.byte_offset(position)?, replica.byte_offset(position + length)?))
}

fn check_snapshot(snapshot: &DocumentSnapshot) -> Result<()> {
    let decoded = SharedText::from_state(SiteId::SEED, &snapshot.state)?;
    if decoded.content() != snapshot.text {
        return Err(CollabError::MalformedOperation(
            "snapshot text does not match its shared state".into(),
        ));
    }
    Ok(())
}
