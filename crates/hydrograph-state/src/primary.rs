//! Evaluators without dependencies: primary variables and constants.

use hydrograph_core::{CompositeVector, ConfigError, Key, KeyTag, ParameterList, StateError, Tag};

use crate::evaluator::{EvalContext, Evaluator, EvaluatorKind};
use crate::record::IoFlags;

/// Read `"evaluator name"`, which the store sets before construction.
pub(crate) fn evaluator_name(plist: &ParameterList) -> Result<Key, ConfigError> {
    plist.get_str("evaluator name").map(Key::from)
}

/// Read the persistence flags `"visualize"` / `"checkpoint"`.
pub fn read_io_flags(plist: &ParameterList) -> Result<IoFlags, ConfigError> {
    Ok(IoFlags {
        vis: plist.get_bool_or("visualize", true)?,
        checkpoint: plist.get_bool_or("checkpoint", false)?,
    })
}

/// A field whose values are set from outside the graph, usually from a
/// time integrator's solution vector.
///
/// Evaluation is a no-op. The store bumps the version on every
/// [`set_primary`](crate::StateStore::set_primary), which is what makes
/// consumers recompute.
#[derive(Debug)]
pub struct PrimaryVariable {
    name: String,
    provides: [KeyTag; 1],
    io: IoFlags,
}

impl PrimaryVariable {
    /// A primary variable for `key` at `tag`.
    pub fn new(key: impl Into<Key>, tag: Tag) -> Self {
        let key = key.into();
        Self {
            name: key.as_str().to_string(),
            provides: [KeyTag::new(key, tag)],
            io: IoFlags::default(),
        }
    }

    /// Factory constructor.
    pub fn from_plist(plist: &ParameterList, tag: &Tag) -> Result<Box<dyn Evaluator>, ConfigError> {
        let mut ev = Self::new(evaluator_name(plist)?, tag.clone());
        ev.io = read_io_flags(plist)?;
        Ok(Box::new(ev))
    }
}

impl Evaluator for PrimaryVariable {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> EvaluatorKind {
        EvaluatorKind::Primary
    }

    fn provides(&self) -> &[KeyTag] {
        &self.provides
    }

    fn dependencies(&self) -> &[KeyTag] {
        &[]
    }

    fn io_flags(&self) -> IoFlags {
        self.io
    }

    fn evaluate(&self, _ctx: &EvalContext<'_>, _results: &mut [CompositeVector]) -> Result<(), StateError> {
        Ok(())
    }
}

/// A field filled with one constant value, computed once.
#[derive(Debug)]
pub struct ConstantEvaluator {
    name: String,
    provides: [KeyTag; 1],
    value: f64,
}

impl ConstantEvaluator {
    /// A constant `value` for `key` at `tag`.
    pub fn new(key: impl Into<Key>, tag: Tag, value: f64) -> Self {
        let key = key.into();
        Self {
            name: key.as_str().to_string(),
            provides: [KeyTag::new(key, tag)],
            value,
        }
    }

    /// Factory constructor. Requires `"value"`.
    pub fn from_plist(plist: &ParameterList, tag: &Tag) -> Result<Box<dyn Evaluator>, ConfigError> {
        let value = plist.get_f64("value")?;
        Ok(Box::new(Self::new(evaluator_name(plist)?, tag.clone(), value)))
    }
}

impl Evaluator for ConstantEvaluator {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> EvaluatorKind {
        EvaluatorKind::Independent
    }

    fn provides(&self) -> &[KeyTag] {
        &self.provides
    }

    fn dependencies(&self) -> &[KeyTag] {
        &[]
    }

    fn evaluate(&self, _ctx: &EvalContext<'_>, results: &mut [CompositeVector]) -> Result<(), StateError> {
        for r in results {
            r.put_scalar(self.value);
        }
        Ok(())
    }
}
