use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use crate::crdt::{Operation, SiteId, VersionVector};

#[derive(Debug, Clone)]
struct Buffered {
    op: Operation,
    since: Instant,
}

/// Remote operations waiting for a predecessor, keyed by site and clock.
///
/// Each site keeps at most `per_site_limit` entries, lowest clocks first: those
/// are the ones that can become ready soonest. Anything pushed out is fetched
/// again by the resync that the desync timer eventually triggers.
#[derive(Debug)]
pub struct PendingBuffer {
    sites: BTreeMap<SiteId, BTreeMap<u64, Buffered>>,
    per_site_limit: usize,
    len: usize,
}

impl PendingBuffer {
    pub fn new(per_site_limit: usize) -> Self {
        Self {
            sites: BTreeMap::new(),
            per_site_limit: per_site_limit.max(1),
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Buffer `op`. Returns false if it was a duplicate or did not fit.
    pub fn push(&mut self, op: Operation, now: Instant) -> bool {
        let limit = self.per_site_limit;
        let queue = self.sites.entry(op.site).or_default();
        if queue.contains_key(&op.clock) {
            return false;
        }

        if queue.len() >= limit {
            match queue.last_key_value() {
                Some((&highest, _)) if highest > op.clock => {
                    queue.remove(&highest);
                    self.len -= 1;
                }
                _ => return false,
            }
        }

        queue.insert(op.clock, Buffered { op, since: now });
        self.len += 1;
        true
    }

    pub fn contains(&self, site: &SiteId, clock: u64) -> bool {
        self.sites
            .get(site)
            .is_some_and(|queue| queue.contains_key(&clock))
    }

    /// Remove and return an operation that `version` makes ready. Only the next
    /// clock of each site is looked at.
    pub fn take_ready(&mut self, version: &VersionVector) -> Option<Operation> {
        let (site, clock) = self.sites.iter().find_map(|(site, queue)| {
            let next = version.get(site) + 1;
            queue
                .get(&next)
                .filter(|entry| entry.op.is_ready(version))
                .map(|_| (*site, next))
        })?;

        let queue = self.sites.get_mut(&site)?;
        let entry = queue.remove(&clock)?;
        if queue.is_empty() {
            self.sites.remove(&site);
        }
        self.len -= 1;
        Some(entry.op)
    }

    /// Drop everything `version` already covers.
    pub fn prune(&mut self, version: &VersionVector) {
        let mut dropped = 0;
        self.sites.retain(|site, queue| {
            let before = queue.len();
            *queue = queue.split_off(&(version.get(site) + 1));
            dropped += before - queue.len();
            !queue.is_empty()
        });
        self.len -= dropped;
    }

    /// The longest-waiting operation, if it has waited longer than `timeout`.
    pub fn overdue(&self, now: Instant, timeout: Duration) -> Option<(&Operation, Duration)> {
        self.sites
            .values()
            .flat_map(|queue| queue.values())
            .map(|entry| (&entry.op, now.saturating_duration_since(entry.since)))
            .filter(|(_, waited)| *waited > timeout)
            .max_by_key(|(_, waited)| *waited)
    }

    /// Give every entry a fresh deadline.
    pub fn restart_timers(&mut self, now: Instant) {
        for entry in self.sites.values_mut().flat_map(|queue| queue.values_mut()) {
            entry.since = now;
        }
    }

    /// Drop everything buffered from `site`; returns how many were dropped.
    pub fn discard_site(&mut self, site: &SiteId) -> usize {
        let dropped = self.sites.remove(site).map_or(0, |queue| queue.len());
        self.len -= dropped;
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crdt::OperationKind;

    fn op(site: u64, clock: u64) -> Operation {
        Operation {
            site: SiteId::new(site),
            clock,
            origin_revision: 0,
            deps: VersionVector::new(),
            kind: OperationKind::Insert {
                position: 0,
                text: "x".into(),
            },
            update: vec![0],
        }
    }

    #[test]
    fn takes_only_the_next_clock() {
        let now = Instant::now();
        let mut buffer = PendingBuffer::new(16);
        buffer.push(op(1, 3), now);
        buffer.push(op(1, 2), now);
        buffer.push(op(2, 3), now);

        let mut version = VersionVector::new();
        version.set(SiteId::new(1), 1);
        version.set(SiteId::new(2), 1);

        let taken = buffer.take_ready(&version).unwrap();
        assert_eq!((taken.site, taken.clock), (SiteId::new(1), 2));
        assert_eq!(buffer.len(), 2);
        assert!(buffer.take_ready(&version).is_none());
        assert!(buffer.contains(&SiteId::new(2), 3));
    }

    #[test]
    fn waits_for_foreign_deps() {
        let now = Instant::now();
        let mut buffer = PendingBuffer::new(16);
        let mut dependent = op(1, 1);
        dependent.deps.set(SiteId::new(2), 1);
        buffer.push(dependent, now);

        assert!(buffer.take_ready(&VersionVector::new()).is_none());

        let mut version = VersionVector::new();
        version.set(SiteId::new(2), 1);
        assert!(buffer.take_ready(&version).is_some());
        assert!(buffer.is_empty());
    }

    #[test]
    fn cap_keeps_the_lowest_clocks_per_site() {
        let now = Instant::now();
        let mut buffer = PendingBuffer::new(2);
        assert!(buffer.push(op(1, 5), now));
        assert!(buffer.push(op(1, 7), now));
        assert!(!buffer.push(op(1, 9), now), "beyond the cap");
        assert!(buffer.push(op(1, 3), now), "evicts clock 7");
        assert!(!buffer.push(op(1, 3), now), "duplicate");
        assert!(buffer.push(op(2, 9), now), "other sites have their own cap");

        assert_eq!(buffer.len(), 3);
        assert!(buffer.contains(&SiteId::new(1), 3));
        assert!(buffer.contains(&SiteId::new(1), 5));
        assert!(!buffer.contains(&SiteId::new(1), 7));
    }

    #[test]
    fn prune_drops_covered_entries() {
        let now = Instant::now();
        let mut buffer = PendingBuffer::new(16);
        buffer.push(op(1, 2), now);
        buffer.push(op(1, 4), now);
        buffer.push(op(2, 2), now);

        let mut version = VersionVector::new();
        version.set(SiteId::new(1), 3);
        buffer.prune(&version);

        assert_eq!(buffer.len(), 2);
        assert!(!buffer.contains(&SiteId::new(1), 2));
        assert!(buffer.contains(&SiteId::new(1), 4));
    }

    #[test]
    fn overdue_reports_oldest() {
        let start = Instant::now();
        let mut buffer = PendingBuffer::new(16);
        buffer.push(op(1, 2), start);
        buffer.push(op(2, 2), start + Duration::from_secs(2));

        let later = start + Duration::from_secs(3);
        assert!(buffer.overdue(later, Duration::from_secs(5)).is_none());
        let (overdue, waited) = buffer.overdue(later, Duration::from_millis(2500)).unwrap();
        assert_eq!(overdue.site, SiteId::new(1));
        assert_eq!(waited, Duration::from_secs(3));

        buffer.restart_timers(later);
        assert!(buffer.overdue(later, Duration::from_millis(1)).is_none());
    }

    #[test]
    fn discard_site_drops_only_that_site() {
        let now = Instant::now();
        let mut buffer = PendingBuffer::new(16);
        buffer.push(op(1, 2), now);
        buffer.push(op(2, 2), now);
        buffer.push(op(1, 3), now);

        assert_eq!(buffer.discard_site(&SiteId::new(1)), 2);
        assert_eq!(buffer.len(), 1);
    }
}
