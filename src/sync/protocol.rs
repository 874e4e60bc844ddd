//! Wire messages exchanged through a session gateway.
//!
//! Text frames carry JSON, binary frames carry CBOR; both decode to the same
//! [`Message`]. Every message is tagged with its event name, e.g.
//! `{"event":"OPERATION","operation":{..}}`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::crdt::{Operation, SiteId, VersionVector};
use crate::error::{CollabError, Result};
use crate::presence::PresenceValue;
use crate::sequencer::DocumentSnapshot;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Message {
    Operation {
        operation: Operation,
    },
    Presence {
        update: PresenceUpdate,
    },
    /// Ask every peer for everything not covered by `known`
    ResyncRequest {
        requester: SiteId,
        known: VersionVector,
    },
    ResyncResponse {
        target: SiteId,
        payload: ResyncPayload,
    },
    /// First message on a connection: the site id assigned to it
    Welcome {
        site: SiteId,
    },
    PeerJoined {
        site: SiteId,
    },
    PeerLeft {
        site: SiteId,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceUpdate {
    pub site: SiteId,
    pub value: PresenceValue,
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "body", rename_all = "snake_case")]
pub enum ResyncPayload {
    /// The operations the target is missing, in integration order, and
    /// everything the responder has integrated
    Replay {
        responder: SiteId,
        version: VersionVector,
        operations: Vec<Operation>,
    },
    /// Full replica state, when history no longer covers the gap
    Snapshot {
        responder: SiteId,
        snapshot: DocumentSnapshot,
    },
    /// No peer could answer
    Unavailable,
}

impl ResyncPayload {
    pub fn responder(&self) -> Option<SiteId> {
        match self {
            ResyncPayload::Replay { responder, .. } | ResyncPayload::Snapshot { responder, .. } => {
                Some(*responder)
            }
            ResyncPayload::Unavailable => None,
        }
    }

    /// Everything the responder had integrated when it answered
    pub fn version(&self) -> Option<&VersionVector> {
        match self {
            ResyncPayload::Replay { version, .. } => Some(version),
            ResyncPayload::Snapshot { snapshot, .. } => Some(&snapshot.version),
            ResyncPayload::Unavailable => None,
        }
    }
}

impl Message {
    pub fn name(&self) -> &'static str {
        match self {
            Message::Operation { .. } => "OPERATION",
            Message::Presence { .. } => "PRESENCE",
            Message::ResyncRequest { .. } => "RESYNC_REQUEST",
            Message::ResyncResponse { .. } => "RESYNC_RESPONSE",
            Message::Welcome { .. } => "WELCOME",
            Message::PeerJoined { .. } => "PEER_JOINED",
            Message::PeerLeft { .. } => "PEER_LEFT",
        }
    }

    /// Site a client-sent message claims to come from
    pub fn sender(&self) -> Option<SiteId> {
        match self {
            Message::Operation { operation } => Some(operation.site),
            Message::Presence { update } => Some(update.site),
            Message::ResyncRequest { requester, .. } => Some(*requester),
            Message::ResyncResponse { payload, .. } => payload.responder(),
            _ => None,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| CollabError::Transport(e.to_string()))
    }

    pub fn to_cbor(&self) -> Result<Vec<u8>> {
        serde_cbor::to_vec(self).map_err(|e| CollabError::Transport(e.to_string()))
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw)
            .map_err(|e| CollabError::MalformedOperation(format!("bad text frame: {e}")))
    }

    pub fn from_cbor(raw: &[u8]) -> Result<Self> {
        serde_cbor::from_slice(raw)
            .map_err(|e| CollabError::MalformedOperation(format!("bad binary frame: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crdt::OperationKind;

    #[test]
    fn events_are_tagged_by_name() {
        let message = Message::PeerLeft {
            site: SiteId::new(7),
        };
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["event"], "PEER_LEFT");
        assert_eq!(json["site"], 7);
        assert_eq!(message.name(), "PEER_LEFT");
    }

    #[test]
    fn snapshot_response_survives_both_encodings() {
        let message = Message::ResyncResponse {
            target: SiteId::new(1),
            payload: ResyncPayload::Snapshot {
                responder: SiteId::new(2),
                snapshot: DocumentSnapshot::seeded("fn main() {}"),
            },
        };
        assert_eq!(Message::from_json(&message.to_json().unwrap()).unwrap(), message);
        assert_eq!(Message::from_cbor(&message.to_cbor().unwrap()).unwrap(), message);
        assert_eq!(message.sender(), Some(SiteId::new(2)));
    }

    #[test]
    fn replay_response_carries_responder_version() {
        let mut version = VersionVector::new();
        version.set(SiteId::new(2), 4);
        version.set(SiteId::SEED, 1);
        let message = Message::ResyncResponse {
            target: SiteId::new(1),
            payload: ResyncPayload::Replay {
                responder: SiteId::new(2),
                version: version.clone(),
                operations: Vec::new(),
            },
        };

        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["payload"]["kind"], "replay");
        assert_eq!(json["payload"]["body"]["version"]["2"], 4);

        let back = Message::from_json(&message.to_json().unwrap()).unwrap();
        let Message::ResyncResponse { payload, .. } = back else {
            panic!("expected a resync response");
        };
        assert_eq!(payload.version(), Some(&version));
        assert_eq!(ResyncPayload::Unavailable.version(), None);
    }

    #[test]
    fn operation_from_plain_json() {
        let raw = r#"{
            "event": "OPERATION",
            "operation": {
                "site": 12,
                "clock": 1,
                "origin_revision": 0,
                "deps": {"0": 1},
                "kind": {"type": "insert", "position": 0, "text": "hi"},
                "update": "AQID"
            }
        }"#;
        let Message::Operation { operation } = Message::from_json(raw).unwrap() else {
            panic!("expected an operation");
        };
        assert!(matches!(operation.kind, OperationKind::Insert { ref text, .. } if text == "hi"));
        assert_eq!(operation.site, SiteId::new(12));
        assert_eq!(operation.deps.get(&SiteId::SEED), 1);
        assert_eq!(operation.update, vec![1, 2, 3]);
    }

    #[test]
    fn garbage_is_malformed() {
        assert!(matches!(
            Message::from_json("{\"event\":\"NOPE\"}"),
            Err(CollabError::MalformedOperation(_))
        ));
        assert!(Message::from_cbor(&[0xff, 0x00]).is_err());
    }
}
