use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::SiteId;

/// Per-site logical clock. Ticks once per emitted operation.
#[derive(Debug, Clone)]
pub struct SiteClock {
    site: SiteId,
    counter: u64,
}

impl SiteClock {
    pub fn new(site: SiteId) -> Self {
        Self { site, counter: 0 }
    }

    pub fn site(&self) -> &SiteId {
        &self.site
    }

    pub fn tick(&mut self) -> u64 {
        self.counter += 1;
        self.counter
    }

    /// Never hand out a tick at or below `clock` again.
    pub fn observe(&mut self, clock: u64) {
        self.counter = self.counter.max(clock);
    }
}

/// Highest contiguous clock integrated per site.
///
/// Serialized as a map keyed by the decimal site id, so it survives being
/// buffered inside tagged wire messages.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VersionVector(BTreeMap<SiteId, u64>);

impl Serialize for VersionVector {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_map(self.0.iter().map(|(site, clock)| (site.to_string(), clock)))
    }
}

impl<'de> Deserialize<'de> for VersionVector {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = BTreeMap::<String, u64>::deserialize(deserializer)?;
        raw.into_iter()
            .map(|(site, clock)| {
                site.parse::<SiteId>()
                    .map(|site| (site, clock))
                    .map_err(serde::de::Error::custom)
            })
            .collect::<Result<_, _>>()
            .map(Self)
    }
}

impl VersionVector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, site: &SiteId) -> u64 {
        self.0.get(site).copied().unwrap_or(0)
    }

    pub fn contains(&self, site: &SiteId, clock: u64) -> bool {
        clock <= self.get(site)
    }

    pub fn set(&mut self, site: SiteId, clock: u64) {
        let entry = self.0.entry(site).or_insert(0);
        *entry = (*entry).max(clock);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&SiteId, u64)> {
        self.0.iter().map(|(site, clock)| (site, *clock))
    }

    /// True if everything in `other` is also in `self`
    pub fn dominates(&self, other: &VersionVector) -> bool {
        other.iter().all(|(site, clock)| self.contains(site, clock))
    }
}
