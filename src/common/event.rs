//! Events delivered by the engine during a native call.

use crate::common::{decode_contacts, AddressFamily, NodeContact};

/// No event.
pub const EVENT_NONE: i32 = 0;
/// IPv4 peers found, payload is a list of compact IPv4 records.
pub const EVENT_VALUES: i32 = 1;
/// IPv6 peers found, payload is a list of compact IPv6 records.
pub const EVENT_VALUES6: i32 = 2;
/// An IPv4 search finished.
pub const EVENT_SEARCH_DONE: i32 = 3;
/// An IPv6 search finished.
pub const EVENT_SEARCH_DONE6: i32 = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
/// Notification about an ongoing search, tagged with its info hash on delivery.
pub enum Event {
    /// Peers found for the searched info hash, in the order the engine sent them.
    Values(Vec<NodeContact>),
    /// The search is over.
    SearchDone,
}

impl Event {
    /// Decode a raw engine notification. Unknown codes yield `None`.
    pub fn from_raw(code: i32, payload: &[u8]) -> Option<Event> {
        match code {
            EVENT_VALUES => Some(Event::Values(decode_contacts(payload, AddressFamily::V4))),
            EVENT_VALUES6 => Some(Event::Values(decode_contacts(payload, AddressFamily::V6))),
            EVENT_SEARCH_DONE | EVENT_SEARCH_DONE6 => Some(Event::SearchDone),
            _ => None,
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self, Event::SearchDone)
    }
}
