use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::VersionVector;
use crate::error::{CollabError, Result};

/// Identity of one connected participant. Assigned by the gateway on join.
///
/// Doubles as the CRDT client id: of two concurrent inserts at the same
/// place, the lower site comes first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SiteId(u64);

impl SiteId {
    /// Author of seeded initial content. Never handed to a participant.
    pub const SEED: SiteId = SiteId(0);

    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Fresh random non-zero site id that fits a 32-bit client id
    pub fn random() -> Self {
        let bits = uuid::Uuid::new_v4().as_u128() as u32;
        Self(u64::from(bits.max(1)))
    }

    pub fn get(self) -> u64 {
        self.0
    }

    pub fn is_seed(self) -> bool {
        self == Self::SEED
    }
}

impl fmt::Display for SiteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for SiteId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl FromStr for SiteId {
    type Err = CollabError;

    fn from_str(s: &str) -> Result<Self> {
        s.trim()
            .parse::<u64>()
            .map(Self)
            .map_err(|e| CollabError::Config(format!("invalid site id {s:?}: {e}")))
    }
}

/// One atomic edit, stamped with its origin.
///
/// `kind` describes the edit against the origin replica; `update` is the
/// encoded CRDT change that every other replica integrates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    /// Site that generated the operation
    pub site: SiteId,

    /// Clock tick on the origin site; contiguous from 1
    pub clock: u64,

    /// Revision of the origin replica when the operation was generated
    pub origin_revision: u64,

    /// Everything the origin had integrated when it generated this
    #[serde(default)]
    pub deps: VersionVector,

    pub kind: OperationKind,

    #[serde(with = "update_bytes")]
    pub update: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OperationKind {
    Insert {
        /// Char index against the origin replica at `origin_revision`
        position: usize,
        text: String,
    },
    Delete {
        /// Char index against the origin replica at `origin_revision`
        position: usize,
        length: usize,
    },
}

impl Operation {
    /// True once `version` holds this operation's predecessor on its own
    /// site and every operation it depends on from other sites.
    pub fn is_ready(&self, version: &VersionVector) -> bool {
        version.get(&self.site) + 1 == self.clock
            && self
                .deps
                .iter()
                .filter(|(site, _)| **site != self.site)
                .all(|(site, clock)| version.contains(site, clock))
    }

    /// Reject payloads that can never be integrated.
    pub fn validate(&self) -> Result<()> {
        if self.clock == 0 {
            return Err(CollabError::MalformedOperation(format!(
                "operation from {} has clock 0",
                self.site
            )));
        }
        if self.deps.get(&self.site) >= self.clock {
            return Err(CollabError::MalformedOperation(format!(
                "operation {}@{} depends on its own future",
                self.site, self.clock
            )));
        }
        if self.update.is_empty() {
            return Err(CollabError::MalformedOperation(format!(
                "operation {}@{} carries no update",
                self.site, self.clock
            )));
        }

        match &self.kind {
            OperationKind::Insert { text, .. } if text.is_empty() => {
                Err(CollabError::MalformedOperation(format!(
                    "empty insert {}@{}",
                    self.site, self.clock
                )))
            }
            OperationKind::Delete { length: 0, .. } => Err(CollabError::MalformedOperation(
                format!("empty delete {}@{}", self.site, self.clock),
            )),
            _ => Ok(()),
        }
    }
}

/// Binary CRDT payloads travel as base64 strings inside JSON frames.
pub(crate) mod update_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op(site: u64, clock: u64, kind: OperationKind) -> Operation {
        Operation {
            site: SiteId::new(site),
            clock,
            origin_revision: 0,
            deps: VersionVector::new(),
            kind,
            update: vec![1, 2, 3],
        }
    }

    #[test]
    fn site_order_is_numeric() {
        assert!(SiteId::new(1) < SiteId::new(2));
        assert!(SiteId::new(9) < SiteId::new(10));
        assert!(SiteId::SEED < SiteId::random());
    }

    #[test]
    fn site_parses_from_text() {
        assert_eq!("42".parse::<SiteId>().unwrap(), SiteId::new(42));
        assert!(matches!("bob".parse::<SiteId>(), Err(CollabError::Config(_))));
    }

    #[test]
    fn rejects_empty_delete() {
        let op = op(1, 1, OperationKind::Delete { position: 0, length: 0 });
        assert!(matches!(op.validate(), Err(CollabError::MalformedOperation(_))));
    }

    #[test]
    fn rejects_empty_insert() {
        let op = op(1, 1, OperationKind::Insert { position: 0, text: String::new() });
        assert!(op.validate().is_err());
    }

    #[test]
    fn rejects_missing_update() {
        let mut op = op(1, 1, OperationKind::Insert { position: 0, text: "x".into() });
        op.update.clear();
        assert!(op.validate().is_err());
    }

    #[test]
    fn readiness_waits_for_foreign_deps() {
        let mut insert = op(1, 2, OperationKind::Insert { position: 0, text: "x".into() });
        insert.deps.set(SiteId::new(1), 1);
        insert.deps.set(SiteId::new(2), 3);

        let mut version = VersionVector::new();
        version.set(SiteId::new(1), 1);
        assert!(!insert.is_ready(&version));

        version.set(SiteId::new(2), 3);
        assert!(insert.is_ready(&version));

        version.set(SiteId::new(1), 2);
        assert!(!insert.is_ready(&version), "already integrated");
    }

    #[test]
    fn operation_serializes_with_type_tag() {
        let insert = op(7, 2, OperationKind::Insert { position: 1, text: "X".into() });
        let json = serde_json::to_value(&insert).unwrap();
        assert_eq!(json["kind"]["type"], "insert");
        assert_eq!(json["site"], 7);
        assert_eq!(json["update"], "AQID");

        let back: Operation = serde_json::from_value(json).unwrap();
        assert_eq!(back, insert);
    }
}
