//! Presence tracker
//!
//! Ephemeral per-site cursor and pointer state. The latest update to arrive
//! for a (site, kind) replaces the entry outright, and entries expire on their own when a site stops refreshing them,
//! whether or not a leave notification ever arrives.

pub mod overlay;

use std::time::{Duration, Instant};

use ahash::AHashMap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::crdt::SiteId;
use crate::document::Edit;

pub use overlay::{color_for, Color, LogRenderer, OverlayRegistry, OverlayRenderer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceKind {
    Cursor,
    Pointer,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PresenceValue {
    /// Caret (and optional selection end) as char offsets into the document
    Cursor {
        position: usize,
        selection_end: Option<usize>,
    },
    /// Mouse pointer in editor screen coordinates
    Pointer { x: f64, y: f64 },
}

impl PresenceValue {
    pub fn kind(&self) -> PresenceKind {
        match self {
            PresenceValue::Cursor { .. } => PresenceKind::Cursor,
            PresenceValue::Pointer { .. } => PresenceKind::Pointer,
        }
    }

    fn rebased(&self, edits: &[Edit]) -> Option<PresenceValue> {
        let PresenceValue::Cursor {
            position,
            selection_end,
        } = self
        else {
            return None;
        };

        let shift = |offset: usize| edits.iter().fold(offset, |offset, edit| edit.shift(offset));
        let moved = PresenceValue::Cursor {
            position: shift(*position),
            selection_end: selection_end.map(shift),
        };
        (moved != *self).then_some(moved)
    }
}

/// Notification for the overlay layer
#[derive(Debug, Clone, PartialEq)]
pub enum PresenceChange {
    Added { site: SiteId, value: PresenceValue },
    Updated { site: SiteId, value: PresenceValue },
    Removed { site: SiteId, kind: PresenceKind },
}

impl PresenceChange {
    pub fn site(&self) -> &SiteId {
        match self {
            PresenceChange::Added { site, .. }
            | PresenceChange::Updated { site, .. }
            | PresenceChange::Removed { site, .. } => site,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PresenceEntry {
    pub value: PresenceValue,

    /// Sender's timestamp, informational only
    pub sent_at: DateTime<Utc>,

    /// Local receipt time, drives expiry
    seen_at: Instant,
}

pub struct PresenceTracker {
    entries: AHashMap<(SiteId, PresenceKind), PresenceEntry>,
    liveness: Duration,
}

impl PresenceTracker {
    pub fn new(liveness: Duration) -> Self {
        Self {
            entries: AHashMap::new(),
            liveness,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, site: &SiteId, kind: PresenceKind) -> Option<&PresenceEntry> {
        self.entries.get(&(*site, kind))
    }

    pub fn entries(&self) -> impl Iterator<Item = (&SiteId, &PresenceEntry)> {
        self.entries.iter().map(|((site, _), entry)| (site, entry))
    }

    /// Record a presence update. The latest arrival always wins and refreshes
    /// liveness, whatever its sender timestamp. Returns `None` when nothing
    /// visible changed.
    pub fn update(
        &mut self,
        site: SiteId,
        value: PresenceValue,
        sent_at: DateTime<Utc>,
        now: Instant,
    ) -> Option<PresenceChange> {
        let key = (site, value.kind());

        match self.entries.get_mut(&key) {
            Some(entry) => {
                entry.seen_at = now;
                entry.sent_at = sent_at;
                if entry.value == value {
                    return None;
                }
                entry.value = value.clone();
                Some(PresenceChange::Updated { site, value })
            }
            None => {
                self.entries.insert(
                    key,
                    PresenceEntry {
                        value: value.clone(),
                        sent_at,
                        seen_at: now,
                    },
                );
                Some(PresenceChange::Added { site, value })
            }
        }
    }

    /// Drop every entry not refreshed within the liveness window.
    pub fn expire(&mut self, now: Instant) -> Vec<PresenceChange> {
        let liveness = self.liveness;
        let expired: Vec<_> = self
            .entries
            .iter()
            .filter(|(_, entry)| now.saturating_duration_since(entry.seen_at) > liveness)
            .map(|(key, _)| *key)
            .collect();

        expired
            .into_iter()
            .filter_map(|key| {
                self.entries.remove(&key)?;
                tracing::debug!(site = %key.0, kind = ?key.1, "presence expired");
                Some(PresenceChange::Removed {
                    site: key.0,
                    kind: key.1,
                })
            })
            .collect()
    }

    /// Explicit leave
    pub fn remove(&mut self, site: &SiteId) -> Vec<PresenceChange> {
        [PresenceKind::Cursor, PresenceKind::Pointer]
            .into_iter()
            .filter_map(|kind| {
                self.entries.remove(&(*site, kind))?;
                Some(PresenceChange::Removed {
                    site: *site,
                    kind,
                })
            })
            .collect()
    }

    /// Move remote cursors through edits just applied to the document.
    pub fn rebase_cursors(&mut self, edits: &[Edit]) -> Vec<PresenceChange> {
        if edits.is_empty() {
            return Vec::new();
        }

        let mut changes = Vec::new();
        for ((site, _), entry) in self.entries.iter_mut() {
            if let Some(moved) = entry.value.rebased(edits) {
                entry.value = moved.clone();
                changes.push(PresenceChange::Updated {
                    site: *site,
                    value: moved,
                });
            }
        }
        changes
    }
}
