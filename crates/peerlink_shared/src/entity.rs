//! Entity state carried by CREATE_ENTITY and ENTITY_STATE messages.

use bytemuck::{Pod, Zeroable};
use serde::{Deserialize, Serialize};

/// Kinematic snapshot of an entity.
///
/// Fixed layout of ten `f32`s so the codec can write it as one block.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable, Serialize, Deserialize)]
pub struct EntitySnapshot {
    /// World position.
    pub position: [f32; 3],
    /// Orientation quaternion (x, y, z, w).
    pub rotation: [f32; 4],
    /// Linear velocity.
    pub velocity: [f32; 3],
}

impl EntitySnapshot {
    /// Number of `f32` components on the wire.
    pub const COMPONENTS: usize = 10;

    /// Snapshot at the origin, identity rotation, at rest.
    pub const IDENTITY: Self = Self {
        position: [0.0; 3],
        rotation: [0.0, 0.0, 0.0, 1.0],
        velocity: [0.0; 3],
    };

    /// Creates a snapshot at `position` with identity rotation and no velocity.
    #[must_use]
    pub const fn at(position: [f32; 3]) -> Self {
        Self {
            position,
            ..Self::IDENTITY
        }
    }

    /// Flattens the snapshot into its wire components.
    #[must_use]
    pub fn to_components(self) -> [f32; Self::COMPONENTS] {
        bytemuck::cast(self)
    }

    /// Rebuilds a snapshot from its wire components.
    #[must_use]
    pub fn from_components(components: [f32; Self::COMPONENTS]) -> Self {
        bytemuck::cast(components)
    }
}

impl Default for EntitySnapshot {
    fn default() -> Self {
        Self::IDENTITY
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_size() {
        assert_eq!(std::mem::size_of::<EntitySnapshot>(), EntitySnapshot::COMPONENTS * 4);
    }

    #[test]
    fn test_component_order() {
        let snapshot = EntitySnapshot {
            position: [1.0, 2.0, 3.0],
            rotation: [0.0, 0.5, 0.0, 0.5],
            velocity: [-1.0, 0.0, 9.0],
        };
        let components = snapshot.to_components();
        assert_eq!(components[0], 1.0);
        assert_eq!(components[4], 0.5);
        assert_eq!(components[9], 9.0);
        assert_eq!(EntitySnapshot::from_components(components), snapshot);
    }
}
