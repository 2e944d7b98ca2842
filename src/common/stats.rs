//! Routing table health counters.

/// Snapshot of the engine's node counters for one address family.
///
/// Field order follows the engine: good, dubious, cached, incoming.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TableStats {
    /// Nodes that answered recently.
    pub good: u32,
    /// Nodes that have not been heard from in a while.
    pub dubious: u32,
    /// Replacement candidates kept outside the buckets.
    pub cached: u32,
    /// Good nodes that sent us a request themselves.
    pub incoming: u32,
}

impl TableStats {
    /// Build a snapshot from raw engine counters, clamping negative values to zero.
    pub fn from_raw(raw: [i32; 4]) -> Self {
        let [good, dubious, cached, incoming] = raw.map(|count| u32::try_from(count).unwrap_or(0));

        TableStats {
            good,
            dubious,
            cached,
            incoming,
        }
    }

    /// Nodes known in the routing table buckets.
    pub fn total(&self) -> u32 {
        self.good.saturating_add(self.dubious)
    }
}
