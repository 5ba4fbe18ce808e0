//! Field and derivative records.
//!
//! A [`FieldRecord`] is one `(key, tag)` slot in the store: its declared
//! shape, its values, a version counter bumped on every write, and the
//! evaluator that owns it.

use std::collections::HashMap;

use hydrograph_core::{CompositeVector, FieldShape, KeyTag, Version};

/// Who may write a record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Owner {
    /// Required but not yet claimed by any evaluator.
    Unowned,
    /// Set externally through a primary evaluator at this index.
    Primary(usize),
    /// Computed by the secondary or independent evaluator at this index.
    Evaluator(usize),
}

impl Owner {
    /// Index of the owning evaluator, if any.
    pub fn index(self) -> Option<usize> {
        match self {
            Self::Unowned => None,
            Self::Primary(i) | Self::Evaluator(i) => Some(i),
        }
    }
}

/// Persistence flags read once from configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IoFlags {
    /// Write this field to visualization output.
    pub vis: bool,
    /// Write this field to checkpoints.
    pub checkpoint: bool,
}

impl Default for IoFlags {
    fn default() -> Self {
        Self {
            vis: true,
            checkpoint: false,
        }
    }
}

/// Which persistence stream to enumerate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IoKind {
    /// Visualization output.
    Vis,
    /// Checkpoint/restart output.
    Checkpoint,
}

/// One named, tagged field.
#[derive(Debug)]
pub struct FieldRecord {
    pub(crate) key_tag: KeyTag,
    pub(crate) shape: FieldShape,
    pub(crate) data: CompositeVector,
    pub(crate) version: Version,
    pub(crate) owner: Owner,
    pub(crate) claimed_by: Option<String>,
    pub(crate) initialized: bool,
    pub(crate) io: IoFlags,
    pub(crate) reported: HashMap<String, Version>,
}

impl FieldRecord {
    pub(crate) fn new(key_tag: KeyTag, shape: FieldShape) -> Self {
        Self {
            key_tag,
            shape,
            data: CompositeVector::default(),
            version: Version::default(),
            owner: Owner::Unowned,
            claimed_by: None,
            initialized: false,
            io: IoFlags::default(),
            reported: HashMap::new(),
        }
    }

    /// The record's identity.
    pub fn key_tag(&self) -> &KeyTag {
        &self.key_tag
    }

    /// Declared shape (the union of all requirements).
    pub fn shape(&self) -> &FieldShape {
        &self.shape
    }

    /// Current values.
    pub fn data(&self) -> &CompositeVector {
        &self.data
    }

    /// Current version. `Version(0)` means never written.
    pub fn version(&self) -> Version {
        self.version
    }

    /// Owning evaluator.
    pub fn owner(&self) -> Owner {
        self.owner
    }

    /// Whether the record has been written at least once.
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Persistence flags.
    pub fn io(&self) -> IoFlags {
        self.io
    }

    pub(crate) fn bump(&mut self) {
        self.version = self.version.bumped();
        self.initialized = true;
    }

    /// Report whether the version moved since `request` last asked.
    pub(crate) fn report_to(&mut self, request: &str) -> bool {
        let seen = self.reported.insert(request.to_string(), self.version);
        seen != Some(self.version)
    }
}

/// A cached partial derivative `d(of)/d(wrt)`.
#[derive(Debug)]
pub(crate) struct DerivativeRecord {
    pub(crate) data: CompositeVector,
    pub(crate) version: Version,
    /// Version of the differentiated field when `data` was computed.
    pub(crate) field_version: Option<Version>,
    pub(crate) reported: HashMap<String, Version>,
}

impl DerivativeRecord {
    pub(crate) fn new(data: CompositeVector) -> Self {
        Self {
            data,
            version: Version::default(),
            field_version: None,
            reported: HashMap::new(),
        }
    }

    pub(crate) fn report_to(&mut self, request: &str) -> bool {
        let seen = self.reported.insert(request.to_string(), self.version);
        seen != Some(self.version)
    }
}
