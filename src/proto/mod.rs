//! Line-protocol plumbing: the message type, its wire form and the tokio codec.
//!
//! The grammar handled here: optional IRCv3 tags,
//! optional prefix, command, space separated params and an optional
//! trailing parameter. Anything the bot logic needs beyond that is read from
//! [`Message::params`] directly.

mod codec;
mod error;
mod message;

pub use codec::{IrcCodec, LineCodec, ParsedLine};
pub use error::ProtocolError;
pub use message::{Message, Tag};

/// Maximum accepted line length in bytes, tags included.
pub const MAX_LINE_LEN: usize = 8191;
