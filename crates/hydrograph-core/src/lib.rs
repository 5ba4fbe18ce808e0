//! Core types for the Hydrograph coupled hydrology framework.
//!
//! This is the leaf crate with no internal dependencies. It defines the
//! vocabulary shared by the rest of the workspace: field identifiers
//! ([`Key`], [`Tag`], [`KeyTag`]), field layouts and values
//! ([`FieldShape`], [`CompositeVector`]), hierarchical configuration
//! ([`ParameterList`]), key naming helpers, and the error taxonomy.

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![forbid(unsafe_code)]

pub mod error;
pub mod field;
pub mod id;
pub mod keys;
pub mod params;

pub use error::{ConfigError, StateError};
pub use field::{ComponentSpec, CompositeVector, EntityKind, FieldShape};
pub use id::{Key, KeyTag, Tag, Version};
pub use params::ParameterList;
