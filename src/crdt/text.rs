//! Shared text backed by a `yrs` document.
//!
//! Every replica owns one `Doc` whose client id is its site id, so two
//! concurrent inserts between the same neighbours are ordered by site: lower
//! site first. Local edits produce v1 updates for the wire; remote updates are
//! integrated and reported back as a byte-offset delta for the replica mirror.

use std::sync::Arc;

use parking_lot::Mutex;
use yrs::types::Delta;
use yrs::updates::decoder::Decode;
use yrs::{
    Doc, GetString, Observable, ReadTxn, StateVector, Subscription, Text, TextRef, Transact,
    Update,
};

use super::SiteId;
use crate::error::{CollabError, Result};

const ROOT: &str = "content";

/// One step of a change to the shared text, in UTF-8 bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TextDelta {
    Retain(u32),
    Insert(String),
    Delete(u32),
}

pub struct SharedText {
    doc: Doc,
    text: TextRef,
    changes: Arc<Mutex<Vec<TextDelta>>>,
    _subscription: Subscription,
}

impl std::fmt::Debug for SharedText {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedText")
            .field("client", &self.doc.client_id())
            .field("len", &self.len())
            .finish()
    }
}

impl SharedText {
    pub fn new(site: SiteId) -> Self {
        let doc = Doc::with_client_id(site.get());
        let text = doc.get_or_insert_text(ROOT);
        let changes = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&changes);
        let subscription = text.observe(move |txn, event| {
            let mut sink = sink.lock();
            for delta in event.delta(txn) {
                match delta {
                    Delta::Retain(len, _) => sink.push(TextDelta::Retain(*len)),
                    Delta::Deleted(len) => sink.push(TextDelta::Delete(*len)),
                    Delta::Inserted(value, _) => {
                        sink.push(TextDelta::Insert(value.clone().to_string(txn)))
                    }
                }
            }
        });

        Self {
            doc,
            text,
            changes,
            _subscription: subscription,
        }
    }

    /// Fresh document holding `state`, for validating snapshots.
    pub fn from_state(site: SiteId, state: &[u8]) -> Result<Self> {
        let mut shared = Self::new(site);
        shared.apply_update(state)?;
        Ok(shared)
    }

    /// Length in UTF-8 bytes
    pub fn len(&self) -> u32 {
        let txn = self.doc.transact();
        self.text.len(&txn)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn content(&self) -> String {
        let txn = self.doc.transact();
        self.text.get_string(&txn)
    }

    pub fn state_vector(&self) -> StateVector {
        self.doc.transact().state_vector()
    }

    /// Everything integrated here that `base` lacks, as one v1 update.
    pub fn diff_since(&self, base: &StateVector) -> Vec<u8> {
        self.doc.transact().encode_diff_v1(base)
    }

    /// Full state as one v1 update
    pub fn encode_state(&self) -> Vec<u8> {
        self.diff_since(&StateVector::default())
    }

    /// Insert `chunk` at byte `index` and return the encoded change.
    pub fn insert(&mut self, index: u32, chunk: &str) -> Result<Vec<u8>> {
        let update = {
            let mut txn = self.doc.transact_mut();
            let len = self.text.len(&txn);
            if index > len {
                return Err(out_of_range(index, 0, len));
            }
            self.text.insert(&mut txn, index, chunk);
            txn.encode_update_v1()
        };
        self.changes.lock().clear();
        Ok(update)
    }

    /// Remove `len` bytes from byte `index` and return the encoded change.
    pub fn remove(&mut self, index: u32, len: u32) -> Result<Vec<u8>> {
        let update = {
            let mut txn = self.doc.transact_mut();
            let total = self.text.len(&txn);
            if index.checked_add(len).map_or(true, |end| end > total) {
                return Err(out_of_range(index, len, total));
            }
            self.text.remove_range(&mut txn, index, len);
            txn.encode_update_v1()
        };
        self.changes.lock().clear();
        Ok(update)
    }

    /// Integrate a remote v1 update. Returns what changed in the visible text;
    /// an update that was already integrated yields an empty delta.
    pub fn apply_update(&mut self, update: &[u8]) -> Result<Vec<TextDelta>> {
        let update = Update::decode_v1(update)
            .map_err(|e| CollabError::MalformedOperation(format!("undecodable update: {e}")))?;
        {
            let mut txn = self.doc.transact_mut();
            txn.apply_update(update)
                .map_err(|e| CollabError::MalformedOperation(format!("unappliable update: {e}")))?;
        }
        Ok(std::mem::take(&mut *self.changes.lock()))
    }
}

fn out_of_range(index: u32, len: u32, total: u32) -> CollabError {
    CollabError::OutOfRangeOperation {
        position: index as usize,
        length: len as usize,
        document_len: total as usize,
    }
}
