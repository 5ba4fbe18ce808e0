//! Test fixtures for Hydrograph development.
//!
//! - [`CountingEvaluator`] records every evaluation in a shared [`CallLog`].
//! - [`ChainBuilder`] assembles a set-up store from primaries and
//!   counting evaluators.
//! - [`LinearStorageKernel`](kernels::LinearStorageKernel) is a linear
//!   ODE kernel with a closed-form implicit Euler step.
//!
//! The kernel types come from `hydrograph-pk`; use these fixtures from
//! integration tests, where every crate shares one build of the types.

#![forbid(unsafe_code)]
#![allow(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod kernels;

use std::sync::{Arc, Mutex};

use hydrograph_core::{CompositeVector, FieldShape, Key, KeyTag, StateError, Tag};
use hydrograph_mesh::ColumnMesh;
use hydrograph_state::{EvalContext, Evaluator, PrimaryVariable, StateStore};

pub use kernels::LinearStorageKernel;

/// Install a `tracing` subscriber honoring `RUST_LOG`, once per process.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A store with one uniform column `"domain"` of `ncells` cells between
/// z = 0 and z = 1.
pub fn single_column_store(ncells: usize) -> StateStore {
    let mut store = StateStore::new();
    let mesh = ColumnMesh::uniform("domain", 0.0, 1.0, ncells).expect("valid column");
    store.register_mesh(Arc::new(mesh));
    store
}

// ── Call log ───────────────────────────────────────────────────────

/// Names of evaluators in the order they ran. Clones share the log.
#[derive(Clone, Debug, Default)]
pub struct CallLog(Arc<Mutex<Vec<String>>>);

impl CallLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, name: &str) {
        self.0.lock().expect("log poisoned").push(name.to_string());
    }

    /// Every call so far.
    pub fn calls(&self) -> Vec<String> {
        self.0.lock().expect("log poisoned").clone()
    }

    /// Calls so far, clearing the log.
    pub fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.0.lock().expect("log poisoned"))
    }

    /// How many times `name` ran.
    pub fn count(&self, name: &str) -> usize {
        self.0
            .lock()
            .expect("log poisoned")
            .iter()
            .filter(|n| *n == name)
            .count()
    }
}

// ── CountingEvaluator ──────────────────────────────────────────────

/// `offset + sum(dependencies)`, logging each evaluation.
///
/// The derivative with respect to any dependency is one per occurrence.
#[derive(Debug)]
pub struct CountingEvaluator {
    name: String,
    provides: [KeyTag; 1],
    deps: Vec<KeyTag>,
    offset: f64,
    log: CallLog,
}

impl CountingEvaluator {
    pub fn new(output: KeyTag, deps: Vec<KeyTag>, log: CallLog) -> Self {
        Self {
            name: output.key.as_str().to_string(),
            provides: [output],
            deps,
            offset: 0.0,
            log,
        }
    }

    pub fn with_offset(mut self, offset: f64) -> Self {
        self.offset = offset;
        self
    }
}

impl Evaluator for CountingEvaluator {
    fn name(&self) -> &str {
        &self.name
    }

    fn provides(&self) -> &[KeyTag] {
        &self.provides
    }

    fn dependencies(&self) -> &[KeyTag] {
        &self.deps
    }

    fn evaluate(&self, ctx: &EvalContext<'_>, results: &mut [CompositeVector]) -> Result<(), StateError> {
        self.log.push(&self.name);
        let fields = self
            .deps
            .iter()
            .map(|kt| ctx.field(kt))
            .collect::<Result<Vec<_>, _>>()?;
        for (spec, out) in results[0].components_mut() {
            out.iter_mut().for_each(|v| *v = self.offset);
            for field in &fields {
                for (v, d) in out.iter_mut().zip(field.view(&spec.name)?) {
                    *v += d;
                }
            }
        }
        Ok(())
    }

    fn evaluate_partial_derivative(
        &self,
        _ctx: &EvalContext<'_>,
        wrt: &KeyTag,
        results: &mut [CompositeVector],
    ) -> Result<(), StateError> {
        let n = self.deps.iter().filter(|d| *d == wrt).count();
        results[0].put_scalar(n as f64);
        Ok(())
    }
}

// ── ChainBuilder ───────────────────────────────────────────────────

/// Builds a store over [`single_column_store`] from primary fields and
/// [`CountingEvaluator`]s, all on cells at [`Tag::NEXT`].
///
/// ```ignore
/// let (mut store, log) = ChainBuilder::new(3)
///     .primary("a")
///     .link("b", &["a"])
///     .link("c", &["a", "b"])
///     .build()?;
/// ```
#[derive(Debug, Default)]
pub struct ChainBuilder {
    ncells: usize,
    primaries: Vec<String>,
    links: Vec<(String, Vec<String>, f64)>,
}

impl ChainBuilder {
    pub fn new(ncells: usize) -> Self {
        Self {
            ncells,
            ..Self::default()
        }
    }

    pub fn primary(mut self, key: &str) -> Self {
        self.primaries.push(key.to_string());
        self
    }

    pub fn link(self, key: &str, deps: &[&str]) -> Self {
        self.link_with_offset(key, deps, 0.0)
    }

    pub fn link_with_offset(mut self, key: &str, deps: &[&str], offset: f64) -> Self {
        self.links
            .push((key.to_string(), deps.iter().map(|d| d.to_string()).collect(), offset));
        self
    }

    /// Require every field, register the evaluators and set the store up.
    /// Primaries are left uninitialized.
    pub fn build(self) -> Result<(StateStore, CallLog), StateError> {
        let mut store = single_column_store(self.ncells);
        let log = CallLog::new();
        let at = |k: &str| Key::from(k).at(&Tag::NEXT);
        for p in &self.primaries {
            store.require(at(p), FieldShape::cells("domain"), None)?;
            store.register_evaluator(Box::new(PrimaryVariable::new(p.as_str(), Tag::NEXT)))?;
        }
        for (key, deps, offset) in &self.links {
            store.require(at(key), FieldShape::cells("domain"), None)?;
            let deps = deps.iter().map(|d| at(d)).collect();
            let ev = CountingEvaluator::new(at(key), deps, log.clone()).with_offset(*offset);
            store.register_evaluator(Box::new(ev))?;
        }
        store.setup()?;
        Ok((store, log))
    }
}
