use std::collections::VecDeque;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};

use super::protocol::{Message, PresenceUpdate};
use crate::crdt::SiteId;
use crate::error::Result;
use crate::presence::PresenceKind;

/// Outbound half of a session gateway.
///
/// `send` never blocks: messages are handed to the transport and delivered
/// in order. Once disconnected it fails with `CollabError::Disconnected`
/// and the caller keeps whatever it could not send.
pub trait Gateway: Send {
    /// Site id assigned to this connection
    fn site(&self) -> SiteId;

    fn send(&self, message: Message) -> Result<()>;

    fn is_connected(&self) -> bool;

    fn disconnect(&mut self);
}

/// Inbound half of a session gateway. Content (operations, resync traffic,
/// membership) is never dropped; presence goes through a bounded
/// [`PresenceQueue`].
pub struct Inbound {
    pub content: mpsc::UnboundedReceiver<Message>,
    pub presence: PresenceQueue,
}

/// Sending side of an [`Inbound`], held by the transport.
#[derive(Clone)]
pub struct InboundSender {
    content: mpsc::UnboundedSender<Message>,
    presence: Weak<PresenceSlots>,
}

struct PresenceSlots {
    queue: Mutex<VecDeque<PresenceUpdate>>,
    capacity: usize,
    ready: Notify,
}

/// Bounded queue of presence states.
///
/// At most one update per (site, kind) is queued: a newer one replaces it in
/// place. When `capacity` distinct states are waiting, the oldest is dropped.
/// Either way the freshest state of every peer is what gets delivered.
pub struct PresenceQueue {
    slots: Arc<PresenceSlots>,
}

impl Inbound {
    pub fn channel(presence_capacity: usize) -> (InboundSender, Inbound) {
        let (content_tx, content_rx) = mpsc::unbounded_channel();
        let slots = Arc::new(PresenceSlots {
            queue: Mutex::new(VecDeque::new()),
            capacity: presence_capacity.max(1),
            ready: Notify::new(),
        });
        (
            InboundSender {
                content: content_tx,
                presence: Arc::downgrade(&slots),
            },
            Inbound {
                content: content_rx,
                presence: PresenceQueue { slots },
            },
        )
    }
}

impl PresenceSlots {
    fn push(&self, update: PresenceUpdate) {
        let key = slot_key(&update);
        {
            let mut queue = self.queue.lock();
            if let Some(queued) = queue.iter_mut().find(|queued| slot_key(queued) == key) {
                *queued = update;
            } else {
                if queue.len() >= self.capacity {
                    if let Some(dropped) = queue.pop_front() {
                        tracing::trace!(site = %dropped.site, "presence queue full, oldest state dropped");
                    }
                }
                queue.push_back(update);
            }
        }
        self.ready.notify_one();
    }
}

fn slot_key(update: &PresenceUpdate) -> (SiteId, PresenceKind) {
    (update.site, update.value.kind())
}

impl PresenceQueue {
    pub fn try_recv(&self) -> Option<PresenceUpdate> {
        self.slots.queue.lock().pop_front()
    }

    /// Wait for the next queued state.
    pub async fn recv(&self) -> PresenceUpdate {
        loop {
            if let Some(update) = self.try_recv() {
                return update;
            }
            self.slots.ready.notified().await;
        }
    }

    pub fn len(&self) -> usize {
        self.slots.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl InboundSender {
    /// Deliver one message. Returns false once the receiving side is gone.
    pub fn deliver(&self, message: Message) -> bool {
        match message {
            Message::Presence { update } => match self.presence.upgrade() {
                Some(slots) => {
                    slots.push(update);
                    true
                }
                None => false,
            },
            message => self.content.send(message).is_ok(),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.content.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presence::PresenceValue;
    use chrono::Utc;

    fn update(site: u64, value: PresenceValue) -> Message {
        Message::Presence {
            update: PresenceUpdate {
                site: SiteId::new(site),
                value,
                sent_at: Utc::now(),
            },
        }
    }

    fn cursor(site: u64, position: usize) -> Message {
        update(
            site,
            PresenceValue::Cursor {
                position,
                selection_end: None,
            },
        )
    }

    fn pointer(site: u64, x: f64) -> Message {
        update(site, PresenceValue::Pointer { x, y: 0.0 })
    }

    #[test]
    fn newest_presence_survives_overflow() {
        let (tx, rx) = Inbound::channel(2);
        for i in 0..5 {
            assert!(tx.deliver(cursor(2, i)));
        }

        let delivered: Vec<_> = std::iter::from_fn(|| rx.presence.try_recv()).collect();
        assert_eq!(delivered.len(), 1);
        assert_eq!(
            delivered[0].value,
            PresenceValue::Cursor {
                position: 4,
                selection_end: None
            }
        );
    }

    #[test]
    fn full_queue_drops_the_oldest_state() {
        let (tx, rx) = Inbound::channel(2);
        tx.deliver(pointer(1, 0.0));
        tx.deliver(pointer(2, 0.0));
        tx.deliver(cursor(2, 7));
        tx.deliver(pointer(1, 3.0));

        let delivered: Vec<_> = std::iter::from_fn(|| rx.presence.try_recv())
            .map(|update| (update.site, update.value))
            .collect();
        assert_eq!(
            delivered,
            vec![
                (
                    SiteId::new(2),
                    PresenceValue::Cursor {
                        position: 7,
                        selection_end: None
                    }
                ),
                (SiteId::new(1), PresenceValue::Pointer { x: 3.0, y: 0.0 }),
            ]
        );
    }

    #[test]
    fn content_is_never_dropped() {
        let (tx, mut rx) = Inbound::channel(2);
        for i in 0..5 {
            assert!(tx.deliver(pointer(2, i as f64)));
        }
        for _ in 0..100 {
            assert!(tx.deliver(Message::PeerJoined {
                site: SiteId::new(3)
            }));
        }

        assert_eq!(rx.presence.len(), 1);
        let mut content = 0;
        while rx.content.try_recv().is_ok() {
            content += 1;
        }
        assert_eq!(content, 100);
    }

    #[tokio::test]
    async fn recv_wakes_on_delivery() {
        let (tx, rx) = Inbound::channel(4);
        let waiter = tokio::spawn(async move { rx.presence.recv().await });
        tokio::task::yield_now().await;
        tx.deliver(pointer(5, 1.0));

        let update = waiter.await.unwrap();
        assert_eq!(update.site, SiteId::new(5));
    }

    #[test]
    fn deliver_reports_closed_receiver() {
        let (tx, rx) = Inbound::channel(1);
        drop(rx);
        assert!(!tx.deliver(Message::PeerLeft {
            site: SiteId::new(2)
        }));
        assert!(!tx.deliver(pointer(2, 1.0)));
        assert!(tx.is_closed());
    }
}
