//! The [`Evaluator`] trait and the read context passed to it.
//!
//! Evaluators compute one or more output fields from declared dependency
//! fields. The store decides *when* an evaluator runs (only after every
//! dependency is up to date and at least one of them changed); the
//! evaluator decides *what* it computes.

use std::sync::Arc;

use hydrograph_core::{CompositeVector, FieldShape, KeyTag, StateError, Tag};
use hydrograph_mesh::Mesh;
use indexmap::IndexMap;

use crate::record::{FieldRecord, IoFlags};

/// Role of an evaluator in the dependency graph.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EvaluatorKind {
    /// No dependencies; values are injected from outside the graph.
    Primary,
    /// No dependencies; values are computed once by the evaluator.
    Independent,
    /// Computed from declared dependencies.
    Secondary,
}

/// A unit of computation in the state graph.
///
/// # Contract
///
/// - `provides()` and `dependencies()` are fixed at construction and read
///   once, at setup.
/// - `evaluate()` fills `results[i]` for `provides()[i]`. Each result
///   arrives with its previous contents and must be fully overwritten.
/// - Reads go through [`EvalContext`], which rejects undeclared fields.
///
/// # Object safety
///
/// This trait is object-safe; the store keeps evaluators as
/// `Vec<Box<dyn Evaluator>>`.
pub trait Evaluator: Send {
    /// Name used in diagnostics and trace output.
    fn name(&self) -> &str;

    /// Graph role. Default: [`EvaluatorKind::Secondary`].
    fn kind(&self) -> EvaluatorKind {
        EvaluatorKind::Secondary
    }

    /// Output fields, in result order.
    fn provides(&self) -> &[KeyTag];

    /// Input fields, in resolution order.
    fn dependencies(&self) -> &[KeyTag];

    /// Shape this evaluator imposes on `output`, if any.
    ///
    /// Default: none; the output takes whatever consumers require.
    fn output_shape(&self, _output: &KeyTag) -> Option<FieldShape> {
        None
    }

    /// Shape to require of `dep`, given the accumulated shape of the
    /// evaluator's first output.
    ///
    /// Default: the same shape as the output.
    fn dependency_shape(&self, _dep: &KeyTag, output: &FieldShape) -> Option<FieldShape> {
        Some(output.clone())
    }

    /// Persistence flags for the outputs. Default: visualize, no checkpoint.
    fn io_flags(&self) -> IoFlags {
        IoFlags::default()
    }

    /// Compute all outputs.
    fn evaluate(
        &self,
        ctx: &EvalContext<'_>,
        results: &mut [CompositeVector],
    ) -> Result<(), StateError>;

    /// Compute `d(output)/d(wrt)` for every output, where `wrt` is one of
    /// [`dependencies`](Evaluator::dependencies).
    ///
    /// Results arrive zeroed. Default: unsupported.
    fn evaluate_partial_derivative(
        &self,
        _ctx: &EvalContext<'_>,
        wrt: &KeyTag,
        _results: &mut [CompositeVector],
    ) -> Result<(), StateError> {
        Err(StateError::UnsupportedDerivative {
            evaluator: self.name().to_string(),
            of: self
                .provides()
                .first()
                .cloned()
                .unwrap_or_else(|| wrt.clone()),
            wrt: wrt.clone(),
        })
    }
}

/// Read-only view of the store handed to [`Evaluator::evaluate`].
///
/// Only declared dependencies can be read, and only once they hold data.
pub struct EvalContext<'a> {
    consumer: &'a str,
    declared: &'a [KeyTag],
    records: &'a IndexMap<KeyTag, FieldRecord>,
    meshes: &'a IndexMap<String, Arc<dyn Mesh>>,
    times: &'a IndexMap<Tag, f64>,
}

impl<'a> EvalContext<'a> {
    /// Construct a context. Called by the store.
    pub(crate) fn new(
        consumer: &'a str,
        declared: &'a [KeyTag],
        records: &'a IndexMap<KeyTag, FieldRecord>,
        meshes: &'a IndexMap<String, Arc<dyn Mesh>>,
        times: &'a IndexMap<Tag, f64>,
    ) -> Self {
        Self {
            consumer,
            declared,
            records,
            meshes,
            times,
        }
    }

    /// Name of the evaluator this context was built for.
    pub fn consumer(&self) -> &str {
        self.consumer
    }

    /// Values of a declared dependency.
    pub fn field(&self, kt: &KeyTag) -> Result<&'a CompositeVector, StateError> {
        if !self.declared.contains(kt) {
            return Err(StateError::UndeclaredDependency {
                consumer: self.consumer.to_string(),
                field: kt.clone(),
            });
        }
        let rec = self
            .records
            .get(kt)
            .ok_or_else(|| StateError::UnresolvedDependency { field: kt.clone() })?;
        if !rec.is_initialized() {
            return Err(StateError::StaleDependency {
                consumer: self.consumer.to_string(),
                field: kt.clone(),
            });
        }
        Ok(rec.data())
    }

    /// One component of a declared dependency.
    pub fn view(&self, kt: &KeyTag, component: &str) -> Result<&'a [f64], StateError> {
        self.field(kt)?.view(component)
    }

    /// Mesh registered under `domain`.
    pub fn mesh(&self, domain: &str) -> Result<&'a dyn Mesh, StateError> {
        self.meshes
            .get(domain)
            .map(|m| m.as_ref())
            .ok_or_else(|| StateError::UnknownDomain {
                domain: domain.to_string(),
            })
    }

    /// Simulation time at `tag`, if set.
    pub fn time(&self, tag: &Tag) -> Option<f64> {
        self.times.get(tag).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hydrograph_core::Key;

    #[test]
    fn undeclared_read_is_rejected() {
        let a = Key::from("a").at(&Tag::NEXT);
        let b = Key::from("b").at(&Tag::NEXT);
        let mut records = IndexMap::new();
        let mut rec = FieldRecord::new(b.clone(), FieldShape::scalar());
        rec.bump();
        records.insert(b.clone(), rec);
        let meshes = IndexMap::new();
        let times = IndexMap::new();
        let declared = [a.clone()];
        let ctx = EvalContext::new("c", &declared, &records, &meshes, &times);

        match ctx.field(&b) {
            Err(StateError::UndeclaredDependency { consumer, field }) => {
                assert_eq!(consumer, "c");
                assert_eq!(field, b);
            }
            other => panic!("expected UndeclaredDependency, got {other:?}"),
        }
    }

    #[test]
    fn uninitialized_read_is_stale() {
        let a = Key::from("a").at(&Tag::NEXT);
        let mut records = IndexMap::new();
        records.insert(a.clone(), FieldRecord::new(a.clone(), FieldShape::scalar()));
        let meshes = IndexMap::new();
        let times = IndexMap::new();
        let declared = [a.clone()];
        let ctx = EvalContext::new("c", &declared, &records, &meshes, &times);

        match ctx.field(&a) {
            Err(StateError::StaleDependency { .. }) => {}
            other => panic!("expected StaleDependency, got {other:?}"),
        }
    }
}
