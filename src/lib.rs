#![doc = include_str!("../README.md")]
//! ## Feature flags
#![doc = document_features::document_features!()]
//!

// Public modules
mod actor;
mod common;
mod dht;
mod error;

#[cfg(feature = "async")]
pub mod async_dht;
pub mod engine;
pub mod host;
#[cfg(all(feature = "native", unix))]
pub mod native;

pub use crate::actor::{Actor, Config, Info, MAX_THREAD_BLOCK_DURATION};
pub use crate::common::{
    decode_address, decode_contacts, encode_address, encode_contacts, AddressFamily, Event, Id,
    InfoHash, NodeContact, SearchFamily, TableStats, EVENT_NONE, EVENT_SEARCH_DONE,
    EVENT_SEARCH_DONE6, EVENT_VALUES, EVENT_VALUES6, ID_SIZE, IPV4_RECORD_SIZE, IPV6_RECORD_SIZE,
};
pub use crate::dht::{Dht, DhtBuilder, MAX_BOOTSTRAP_NODES};
pub use crate::engine::{Engine, InboundPacket, NativeEngine};
pub use crate::host::{DefaultHost, HostCallbacks};

pub use error::{Error, Result};
