//! Session-scoped identifiers.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a peer, unique within one session.
///
/// Assigned by the master during the join handshake.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerId(pub u32);

impl PeerId {
    /// Placeholder carried by a joiner before the master assigns its id.
    pub const UNASSIGNED: Self = Self(u32::MAX);

    /// Returns true if this is the unassigned placeholder.
    #[inline]
    #[must_use]
    pub const fn is_unassigned(self) -> bool {
        self.0 == u32::MAX
    }

    /// Returns the id following this one.
    #[inline]
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }
}

impl Default for PeerId {
    fn default() -> Self {
        Self::UNASSIGNED
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_unassigned() {
            f.write_str("peer#?")
        } else {
            write!(f, "peer#{}", self.0)
        }
    }
}

/// Identifier of a shared entity.
///
/// Chosen by the creating peer; the host application keeps them unique.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityId(pub u32);

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "entity#{}", self.0)
    }
}
