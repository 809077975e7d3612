//! IRC wire protocol support for the tetherd bouncer.
//!
//! This crate implements the pieces of the IRC protocol both sides of the
//! bouncer share: the message codec (RFC 1459/2812 framing plus IRCv3
//! message tags), case mapping, ISUPPORT token ingestion, and SASL payload
//! encoding. Everything here is transport-transparent: a message parsed
//! from one side can be re-serialized for the other without loss.

pub mod casemap;
pub mod codec;
pub mod error;
pub mod isupport;
pub mod message;
pub mod sasl;

pub use casemap::CaseMapping;
pub use codec::IrcCodec;
pub use error::{MessageParseError, ProtocolError};
pub use isupport::Isupport;
pub use message::{Message, Source, Tag};

/// Maximum length of the non-tag portion of a line, CRLF included.
pub const MAX_LINE_LEN: usize = 512;

/// Maximum length of the tag section, leading `@` and trailing space
/// included, as specified by IRCv3 message-tags.
pub const MAX_TAGS_LEN: usize = 8191;
