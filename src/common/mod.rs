//! Miscellaneous common structs used throughout the library.

mod contact;
mod event;
mod id;
mod stats;

pub use contact::*;
pub use event::*;
pub use id::*;
pub use stats::*;
