//! Error types for mesh construction and queries.

use hydrograph_core::EntityKind;
use std::fmt;

/// Errors arising from mesh construction or entity queries.
#[derive(Clone, Debug, PartialEq)]
pub enum MeshError {
    /// Attempted to construct a mesh with zero cells.
    EmptyMesh,
    /// Node coordinates, areas or volumes are not physically valid.
    InvalidGeometry {
        /// What went wrong.
        reason: String,
    },
    /// An entity index is out of range.
    UnknownEntity {
        /// Entity kind queried.
        kind: EntityKind,
        /// The offending index.
        id: usize,
    },
    /// A parent-map lookup found no parent entity.
    NoParent {
        /// Entity kind queried.
        kind: EntityKind,
        /// The child entity.
        id: usize,
    },
}

impl fmt::Display for MeshError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyMesh => write!(f, "mesh must have at least one cell"),
            Self::InvalidGeometry { reason } => write!(f, "invalid geometry: {reason}"),
            Self::UnknownEntity { kind, id } => write!(f, "no {kind:?} with index {id}"),
            Self::NoParent { kind, id } => write!(f, "{kind:?} {id} has no parent entity"),
        }
    }
}

impl std::error::Error for MeshError {}
