//! # Error Types
//!
//! Everything that can go wrong below the session API.

use peerlink_shared::{EntityId, PeerId};
use std::io;
use thiserror::Error;

/// Errors produced while encoding or decoding a datagram.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Buffer ended before a field was complete.
    #[error("datagram truncated at byte {0}")]
    Truncated(usize),

    /// Bytes left over after the last field.
    #[error("{0} trailing bytes after packet")]
    TrailingBytes(usize),

    /// Datagram does not start with the packet magic.
    #[error("bad magic {0:#06x}")]
    BadMagic(u16),

    /// Datagram was produced by an incompatible protocol revision.
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),

    /// Unknown delivery mode tag.
    #[error("unknown delivery mode {0}")]
    UnknownMode(u8),

    /// Unknown message kind tag.
    #[error("unknown message kind {0}")]
    UnknownKind(u8),

    /// Unknown address family tag in a peer list.
    #[error("unknown address tag {0}")]
    UnknownAddressTag(u8),

    /// Text field is not valid UTF-8.
    #[error("text field is not valid utf-8")]
    InvalidUtf8,

    /// An ack carried a message, or a message packet carried none.
    #[error("delivery mode {mode} does not match body presence")]
    BodyMismatch {
        /// Mode tag of the offending packet.
        mode: u8,
    },

    /// Encoded packet would not fit in one datagram.
    #[error("packet exceeds {limit} bytes")]
    Oversized {
        /// Size limit that was hit.
        limit: usize,
    },

    /// A variable-length field exceeds its limit.
    #[error("field too long: {len} > {limit}")]
    FieldTooLong {
        /// Actual length.
        len: usize,
        /// Allowed length.
        limit: usize,
    },
}

/// Errors reported by the session API.
#[derive(Error, Debug)]
pub enum SessionError {
    /// `create_session`/`connect_to_session` called on a live session.
    #[error("session already initialized")]
    AlreadyInitialized,

    /// Operation requires a connected session.
    #[error("session is not connected")]
    NotConnected,

    /// Target peer is not in the directory.
    #[error("unknown peer: {0}")]
    UnknownPeer(PeerId),

    /// Entity is not in the ownership table.
    #[error("unknown entity: {0}")]
    UnknownEntity(EntityId),

    /// Local peer does not own the entity.
    #[error("local peer does not own {0}")]
    NotOwner(EntityId),

    /// Socket operation failed.
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    /// Outgoing message could not be encoded.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Configuration rejected.
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Errors raised while loading a configuration file.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// File could not be read.
    #[error("failed to read config: {0}")]
    Io(#[from] io::Error),

    /// File is not valid TOML for this schema.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// Values parsed but are out of range.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Result type for session operations.
pub type SessionResult<T> = Result<T, SessionError>;
