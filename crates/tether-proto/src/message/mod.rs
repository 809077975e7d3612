//! IRC message representation.
//!
//! A [`Message`] is the generic wire record: optional IRCv3 tags, an
//! optional source, a command, and its parameters. The bouncer relays
//! commands it does not itself understand, so the command is kept as a
//! plain (uppercased) string rather than a closed enum.

mod parse;
mod serialize;
pub mod tags;
mod types;

pub use types::{Message, Source, Tag};
