//! The [`StateStore`]: field records, the evaluator graph, and lazy,
//! version-driven resolution.
//!
//! # Lifecycle
//!
//! 1. Register meshes and `require` fields (kernels do this during their
//!    own setup).
//! 2. Register evaluators directly, or let [`setup`](StateStore::setup)
//!    build them from the `"field evaluators"` list through the factory.
//! 3. [`setup`](StateStore::setup) seals the graph: shapes are propagated,
//!    cycles and unresolved fields are rejected, and data is allocated.
//! 4. During time stepping, primaries are written with
//!    [`set_primary`](StateStore::set_primary) and everything else is pulled
//!    with [`update`](StateStore::update).

use std::collections::HashSet;
use std::mem;
use std::sync::Arc;

use hydrograph_core::keys::mesh_of;
use hydrograph_core::{
    CompositeVector, ConfigError, EntityKind, FieldShape, Key, KeyTag, ParameterList, StateError,
    Tag, Version,
};
use hydrograph_mesh::{Mesh, Parallel};
use indexmap::IndexMap;
use tracing::{debug, trace};

use crate::evaluator::{EvalContext, Evaluator, EvaluatorKind};
use crate::factory::EvaluatorFactory;
use crate::record::{DerivativeRecord, FieldRecord, IoFlags, IoKind, Owner};

// ── Evaluator slots ────────────────────────────────────────────────

struct EvaluatorSlot {
    evaluator: Box<dyn Evaluator>,
    kind: EvaluatorKind,
    /// Record indices of `provides()`, resolved at setup.
    outputs: Vec<usize>,
    /// Record indices of `dependencies()`, resolved at setup.
    deps: Vec<usize>,
    /// Dependency versions seen at the last recompute.
    dep_versions: Vec<Version>,
    computed: bool,
}

// ── Store ──────────────────────────────────────────────────────────

/// Owner of every field record and evaluator in a simulation.
///
/// Kernels and evaluators never hold field data across calls; they keep
/// [`KeyTag`]s and re-resolve through the store.
pub struct StateStore {
    records: IndexMap<KeyTag, FieldRecord>,
    evaluators: Vec<EvaluatorSlot>,
    derivatives: IndexMap<(KeyTag, KeyTag), DerivativeRecord>,
    meshes: IndexMap<String, Arc<dyn Mesh>>,
    times: IndexMap<Tag, f64>,
    cycle: u64,
    factory: EvaluatorFactory,
    evaluator_list: ParameterList,
    sealed: bool,
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StateStore {
    /// An empty store with the built-in factory and no evaluator list.
    pub fn new() -> Self {
        Self {
            records: IndexMap::new(),
            evaluators: Vec::new(),
            derivatives: IndexMap::new(),
            meshes: IndexMap::new(),
            times: IndexMap::new(),
            cycle: 0,
            factory: EvaluatorFactory::new(),
            evaluator_list: ParameterList::new("field evaluators"),
            sealed: false,
        }
    }

    /// Use `factory` to build evaluators at setup.
    pub fn with_factory(mut self, factory: EvaluatorFactory) -> Self {
        self.factory = factory;
        self
    }

    /// Use `list` (keyed by field key) to build evaluators at setup.
    pub fn with_evaluator_list(mut self, list: ParameterList) -> Self {
        self.evaluator_list = list;
        self
    }

    /// The `"field evaluators"` list.
    pub fn evaluator_list(&self) -> &ParameterList {
        &self.evaluator_list
    }

    /// The `"field evaluators"` list, for kernels that add entries.
    pub fn evaluator_list_mut(&mut self) -> &mut ParameterList {
        &mut self.evaluator_list
    }

    /// Whether [`setup`](Self::setup) has completed.
    pub fn is_setup(&self) -> bool {
        self.sealed
    }

    fn check_phase(&self, operation: &'static str, want_sealed: bool) -> Result<(), StateError> {
        if self.sealed == want_sealed {
            Ok(())
        } else {
            Err(StateError::WrongPhase {
                operation,
                sealed: self.sealed,
            })
        }
    }

    // ── Meshes ─────────────────────────────────────────────────────

    /// Register a mesh under its own name.
    pub fn register_mesh(&mut self, mesh: Arc<dyn Mesh>) {
        self.meshes.insert(mesh.name().to_string(), mesh);
    }

    /// The mesh registered under `domain`.
    pub fn mesh(&self, domain: &str) -> Result<Arc<dyn Mesh>, StateError> {
        self.meshes
            .get(domain)
            .cloned()
            .ok_or_else(|| StateError::UnknownDomain {
                domain: domain.to_string(),
            })
    }

    /// Whether a mesh is registered under `domain`.
    pub fn has_mesh(&self, domain: &str) -> bool {
        self.meshes.contains_key(domain)
    }

    // ── Setup phase ────────────────────────────────────────────────

    /// Declare that `kt` must exist with (at least) `shape`.
    ///
    /// Idempotent: shapes from repeated calls are merged. `owner` claims
    /// the field for a component (typically a kernel claiming its primary
    /// variable); a second, different claim fails with
    /// [`StateError::DuplicateOwner`].
    pub fn require(
        &mut self,
        kt: KeyTag,
        shape: FieldShape,
        owner: Option<&str>,
    ) -> Result<(), StateError> {
        self.check_phase("require", false)?;
        self.require_shape(&kt, &shape)?;
        if let Some(owner) = owner {
            if let Some(rec) = self.records.get_mut(&kt) {
                match &rec.claimed_by {
                    Some(existing) if existing != owner => {
                        return Err(StateError::DuplicateOwner {
                            field: kt,
                            existing: existing.clone(),
                            requested: owner.to_string(),
                        });
                    }
                    Some(_) => {}
                    None => rec.claimed_by = Some(owner.to_string()),
                }
            }
        }
        Ok(())
    }

    fn require_shape(&mut self, kt: &KeyTag, shape: &FieldShape) -> Result<bool, StateError> {
        match self.records.get_mut(kt) {
            Some(rec) => {
                let before = rec.shape.components.len();
                let had_domain = rec.shape.domain.is_some();
                rec.shape
                    .merge(shape)
                    .map_err(|reason| StateError::ShapeMismatch {
                        reason: format!("{kt}: {reason}"),
                    })?;
                Ok(rec.shape.components.len() != before
                    || rec.shape.domain.is_some() != had_domain)
            }
            None => {
                self.records
                    .insert(kt.clone(), FieldRecord::new(kt.clone(), shape.clone()));
                Ok(true)
            }
        }
    }

    /// Add an evaluator to the graph.
    ///
    /// Every output must be unowned. Outputs that were not yet required
    /// are created with the evaluator's [`output_shape`](Evaluator::output_shape).
    pub fn register_evaluator(&mut self, evaluator: Box<dyn Evaluator>) -> Result<(), StateError> {
        self.check_phase("register_evaluator", false)?;
        let kind = evaluator.kind();
        let name = evaluator.name().to_string();

        // 1. Check ownership of every output before touching anything.
        for kt in evaluator.provides() {
            if let Some(rec) = self.records.get(kt) {
                if let Some(i) = rec.owner.index() {
                    return Err(StateError::DuplicateOwner {
                        field: kt.clone(),
                        existing: self.evaluators[i].evaluator.name().to_string(),
                        requested: name,
                    });
                }
                if let Some(claim) = &rec.claimed_by {
                    if kind != EvaluatorKind::Primary && *claim != name {
                        return Err(StateError::DuplicateOwner {
                            field: kt.clone(),
                            existing: claim.clone(),
                            requested: name,
                        });
                    }
                }
            }
        }

        // 2. Create or extend the output records.
        let index = self.evaluators.len();
        let io = evaluator.io_flags();
        for kt in evaluator.provides() {
            let shape = evaluator.output_shape(kt).unwrap_or_default();
            self.require_shape(kt, &shape)?;
            if let Some(rec) = self.records.get_mut(kt) {
                rec.owner = match kind {
                    EvaluatorKind::Primary => Owner::Primary(index),
                    _ => Owner::Evaluator(index),
                };
                rec.io = io;
            }
        }

        trace!(evaluator = %name, ?kind, "registered evaluator");
        self.evaluators.push(EvaluatorSlot {
            evaluator,
            kind,
            outputs: Vec::new(),
            deps: Vec::new(),
            dep_versions: Vec::new(),
            computed: false,
        });
        Ok(())
    }

    /// Whether some evaluator owns `kt`.
    pub fn has_evaluator(&self, kt: &KeyTag) -> bool {
        self.records
            .get(kt)
            .is_some_and(|r| r.owner != Owner::Unowned)
    }

    /// Seal the graph.
    ///
    /// Builds missing evaluators from the evaluator list, propagates shapes
    /// from consumers to dependencies, rejects unresolved fields and cycles,
    /// and allocates zeroed data sized from the registered meshes.
    pub fn setup(&mut self) -> Result<(), StateError> {
        self.check_phase("setup", false)?;

        // 1. Shapes and factory construction, to a fixpoint.
        loop {
            let mut progressed = self.propagate_shapes()?;
            progressed |= self.construct_missing()?;
            if !progressed {
                break;
            }
        }

        // 2. Every required field must have an owner.
        if let Some(rec) = self.records.values().find(|r| r.owner == Owner::Unowned) {
            return Err(StateError::UnresolvedDependency {
                field: rec.key_tag.clone(),
            });
        }

        // 3. Resolve record indices for the hot path.
        for slot in &mut self.evaluators {
            let index_of = |kt: &KeyTag| {
                self.records
                    .get_index_of(kt)
                    .ok_or_else(|| StateError::UnresolvedDependency { field: kt.clone() })
            };
            slot.outputs = slot
                .evaluator
                .provides()
                .iter()
                .map(index_of)
                .collect::<Result<_, _>>()?;
            slot.deps = slot
                .evaluator
                .dependencies()
                .iter()
                .map(index_of)
                .collect::<Result<_, _>>()?;
        }

        // 4. The graph must be acyclic.
        if let Some(cycle) = self.find_cycle() {
            return Err(StateError::CyclicDependency { cycle });
        }

        // 5. Allocate.
        for rec in self.records.values_mut() {
            let needs_mesh = rec.shape.components.iter().any(|c| c.kind != EntityKind::Global);
            let domain = rec
                .shape
                .domain
                .clone()
                .unwrap_or_else(|| mesh_of(rec.key_tag.key.as_str()).to_string());
            let mesh = if needs_mesh {
                Some(self.meshes.get(&domain).ok_or(StateError::UnknownDomain {
                    domain: domain.clone(),
                })?)
            } else {
                None
            };
            rec.data = CompositeVector::zeros(rec.shape.clone(), |kind| match (kind, mesh) {
                (EntityKind::Global, _) => 1,
                (kind, Some(m)) => m.num_entities(kind, Parallel::Used),
                (_, None) => 0,
            });
        }

        self.sealed = true;
        debug!(
            fields = self.records.len(),
            evaluators = self.evaluators.len(),
            "state store set up"
        );
        Ok(())
    }

    fn propagate_shapes(&mut self) -> Result<bool, StateError> {
        let mut wanted: Vec<(KeyTag, FieldShape)> = Vec::new();
        for slot in &self.evaluators {
            let ev = &slot.evaluator;
            let Some(first) = ev.provides().first() else {
                continue;
            };
            let out_shape = self
                .records
                .get(first)
                .map(|r| r.shape.clone())
                .unwrap_or_default();
            for dep in ev.dependencies() {
                let shape = ev.dependency_shape(dep, &out_shape).unwrap_or_default();
                wanted.push((dep.clone(), shape));
            }
        }
        let mut progressed = false;
        for (kt, shape) in wanted {
            progressed |= self.require_shape(&kt, &shape)?;
        }
        Ok(progressed)
    }

    fn construct_missing(&mut self) -> Result<bool, StateError> {
        let missing: Vec<KeyTag> = self
            .records
            .values()
            .filter(|r| r.owner == Owner::Unowned)
            .filter(|r| self.evaluator_list.is_sublist(r.key_tag.key.as_str()))
            .map(|r| r.key_tag.clone())
            .collect();
        let mut progressed = false;
        for kt in missing {
            // An earlier multi-output evaluator may have claimed it.
            if self.has_evaluator(&kt) {
                continue;
            }
            let mut plist = self.evaluator_list.sublist(kt.key.as_str())?;
            plist.set("evaluator name", kt.key.as_str());
            let evaluator = self.factory.create(&plist, &kt.tag)?;
            if !evaluator.provides().contains(&kt) {
                return Err(ConfigError::Conflict {
                    reason: format!(
                        "evaluator '{}' built for {kt} does not provide it",
                        evaluator.name()
                    ),
                }
                .into());
            }
            debug!(field = %kt, evaluator = evaluator.name(), "constructed evaluator from list");
            self.register_evaluator(evaluator)?;
            progressed = true;
        }
        Ok(progressed)
    }

    fn find_cycle(&self) -> Option<Vec<KeyTag>> {
        let mut color = vec![0u8; self.records.len()];
        let mut path = Vec::new();
        (0..self.records.len()).find_map(|start| {
            if color[start] == 0 {
                self.visit(start, &mut color, &mut path)
            } else {
                None
            }
        })
    }

    fn visit(&self, r: usize, color: &mut [u8], path: &mut Vec<usize>) -> Option<Vec<KeyTag>> {
        color[r] = 1;
        path.push(r);
        if let Owner::Evaluator(e) = self.records[r].owner {
            for &d in &self.evaluators[e].deps {
                match color[d] {
                    1 => {
                        let start = path.iter().position(|&p| p == d).unwrap_or(0);
                        let mut cycle: Vec<KeyTag> = path[start..]
                            .iter()
                            .map(|&i| self.records[i].key_tag.clone())
                            .collect();
                        cycle.push(self.records[d].key_tag.clone());
                        return Some(cycle);
                    }
                    0 => {
                        if let Some(cycle) = self.visit(d, color, path) {
                            return Some(cycle);
                        }
                    }
                    _ => {}
                }
            }
        }
        path.pop();
        color[r] = 2;
        None
    }

    // ── Resolution ─────────────────────────────────────────────────

    fn index_of(&self, kt: &KeyTag) -> Result<usize, StateError> {
        self.records
            .get_index_of(kt)
            .ok_or_else(|| StateError::UnknownField { field: kt.clone() })
    }

    /// Bring `kt` up to date and report whether it changed since `request`
    /// last asked.
    ///
    /// Secondary fields recompute only when a dependency's version moved
    /// since their last computation; the walk is depth-first in declared
    /// dependency order and visits each evaluator at most once per call.
    pub fn update(&mut self, kt: &KeyTag, request: &str) -> Result<bool, StateError> {
        self.check_phase("update", true)?;
        let idx = self.index_of(kt)?;
        self.resolve(idx, &mut HashSet::new())?;
        let rec = &mut self.records[idx];
        if !rec.initialized {
            return Err(StateError::StaleDependency {
                consumer: request.to_string(),
                field: kt.clone(),
            });
        }
        Ok(rec.report_to(request))
    }

    fn resolve(&mut self, idx: usize, done: &mut HashSet<usize>) -> Result<Version, StateError> {
        match self.records[idx].owner {
            Owner::Unowned => Err(StateError::UnresolvedDependency {
                field: self.records[idx].key_tag.clone(),
            }),
            Owner::Primary(_) => Ok(self.records[idx].version),
            Owner::Evaluator(e) => {
                self.resolve_evaluator(e, done)?;
                Ok(self.records[idx].version)
            }
        }
    }

    fn resolve_evaluator(&mut self, e: usize, done: &mut HashSet<usize>) -> Result<(), StateError> {
        if !done.insert(e) {
            return Ok(());
        }
        let ndeps = self.evaluators[e].deps.len();
        let mut versions = Vec::with_capacity(ndeps);
        for i in 0..ndeps {
            let d = self.evaluators[e].deps[i];
            versions.push(self.resolve(d, done)?);
        }
        let slot = &self.evaluators[e];
        if !slot.computed || slot.dep_versions != versions {
            self.recompute(e)?;
            let slot = &mut self.evaluators[e];
            slot.dep_versions = versions;
            slot.computed = true;
        }
        Ok(())
    }

    fn recompute(&mut self, e: usize) -> Result<(), StateError> {
        let slot = &self.evaluators[e];
        let mut results: Vec<CompositeVector> = slot
            .outputs
            .iter()
            .map(|&i| mem::take(&mut self.records[i].data))
            .collect();

        let name = slot.evaluator.name();
        trace!(evaluator = name, "recomputing");
        let ctx = EvalContext::new(
            name,
            slot.evaluator.dependencies(),
            &self.records,
            &self.meshes,
            &self.times,
        );
        let outcome = slot.evaluator.evaluate(&ctx, &mut results);

        for (&i, data) in slot.outputs.iter().zip(results) {
            self.records[i].data = data;
        }
        outcome?;
        for &i in &slot.outputs {
            self.records[i].bump();
        }
        Ok(())
    }

    /// Bring `kt` up to date and return its values.
    pub fn get_field(&mut self, kt: &KeyTag) -> Result<&CompositeVector, StateError> {
        self.check_phase("get_field", true)?;
        let idx = self.index_of(kt)?;
        self.resolve(idx, &mut HashSet::new())?;
        self.field(kt)
    }

    /// Current values of `kt`, without resolving.
    ///
    /// Fails with [`StateError::StaleDependency`] if the field has never
    /// been computed or set.
    pub fn field(&self, kt: &KeyTag) -> Result<&CompositeVector, StateError> {
        let rec = self
            .records
            .get(kt)
            .ok_or_else(|| StateError::UnknownField { field: kt.clone() })?;
        if !rec.initialized {
            return Err(StateError::StaleDependency {
                consumer: "caller".to_string(),
                field: kt.clone(),
            });
        }
        Ok(&rec.data)
    }

    /// The record for `kt`, if required.
    pub fn record(&self, kt: &KeyTag) -> Option<&FieldRecord> {
        self.records.get(kt)
    }

    /// All records, in creation order.
    pub fn records(&self) -> impl Iterator<Item = &FieldRecord> {
        self.records.values()
    }

    // ── Derivatives ────────────────────────────────────────────────

    /// Bring `d(kt)/d(wrt)` up to date and report whether it changed since
    /// `request` last asked.
    ///
    /// If `wrt` is not in the dependency closure of `kt` the derivative is
    /// zero and no evaluator is invoked. `d(kt)/d(kt)` is one.
    pub fn update_derivative(
        &mut self,
        kt: &KeyTag,
        wrt: &KeyTag,
        request: &str,
    ) -> Result<bool, StateError> {
        self.check_phase("update_derivative", true)?;
        let idx = self.index_of(kt)?;
        self.index_of(wrt)?;
        self.resolve(idx, &mut HashSet::new())?;
        self.compute_derivative(idx, wrt)?;
        let rec = self
            .derivatives
            .get_mut(&(kt.clone(), wrt.clone()))
            .ok_or_else(|| StateError::UnknownField { field: kt.clone() })?;
        Ok(rec.report_to(request))
    }

    /// Bring `d(kt)/d(wrt)` up to date and return it.
    pub fn get_derivative(&mut self, kt: &KeyTag, wrt: &KeyTag) -> Result<&CompositeVector, StateError> {
        self.update_derivative(kt, wrt, "")?;
        self.derivative(kt, wrt)
    }

    /// Current value of `d(kt)/d(wrt)`, without resolving.
    pub fn derivative(&self, kt: &KeyTag, wrt: &KeyTag) -> Result<&CompositeVector, StateError> {
        self.derivatives
            .get(&(kt.clone(), wrt.clone()))
            .map(|d| &d.data)
            .ok_or_else(|| StateError::StaleDependency {
                consumer: "caller".to_string(),
                field: KeyTag::new(
                    hydrograph_core::keys::derivative_key(&kt.key, &wrt.key),
                    kt.tag.clone(),
                ),
            })
    }

    fn compute_derivative(&mut self, idx: usize, wrt: &KeyTag) -> Result<(), StateError> {
        let key = (self.records[idx].key_tag.clone(), wrt.clone());
        let field_version = self.records[idx].version;
        if let Some(d) = self.derivatives.get(&key) {
            if d.field_version == Some(field_version) {
                return Ok(());
            }
        }
        let value = self.derivative_value(idx, wrt)?;
        let rec = self
            .derivatives
            .entry(key)
            .or_insert_with(|| DerivativeRecord::new(CompositeVector::default()));
        rec.data = value;
        rec.version = rec.version.bumped();
        rec.field_version = Some(field_version);
        Ok(())
    }

    fn derivative_value(&mut self, idx: usize, wrt: &KeyTag) -> Result<CompositeVector, StateError> {
        let mut total = self.records[idx].data.zeros_like();
        if self.records[idx].key_tag == *wrt {
            total.put_scalar(1.0);
            return Ok(total);
        }
        let Owner::Evaluator(e) = self.records[idx].owner else {
            return Ok(total);
        };
        if !self.depends_on(idx, wrt) {
            return Ok(total);
        }

        let out_pos = self.evaluators[e]
            .outputs
            .iter()
            .position(|&o| o == idx)
            .unwrap_or(0);
        // A partial already sums repeated occurrences of a dependency.
        let mut deps = self.evaluators[e].deps.clone();
        let mut seen = HashSet::new();
        deps.retain(|d| seen.insert(*d));
        for d in deps {
            let dep_kt = self.records[d].key_tag.clone();
            let direct = dep_kt == *wrt;
            if !direct && !self.depends_on(d, wrt) {
                continue;
            }
            let partial = self.partial(e, out_pos, &dep_kt)?;
            if direct {
                accumulate(&mut total, &partial, None);
            } else {
                self.compute_derivative(d, wrt)?;
                if let Some(inner) = self.derivatives.get(&(dep_kt, wrt.clone())) {
                    accumulate(&mut total, &partial, Some(&inner.data));
                }
            }
        }
        Ok(total)
    }

    fn partial(&self, e: usize, out_pos: usize, wrt: &KeyTag) -> Result<CompositeVector, StateError> {
        let slot = &self.evaluators[e];
        let mut results: Vec<CompositeVector> = slot
            .outputs
            .iter()
            .map(|&i| self.records[i].data.zeros_like())
            .collect();
        let ctx = EvalContext::new(
            slot.evaluator.name(),
            slot.evaluator.dependencies(),
            &self.records,
            &self.meshes,
            &self.times,
        );
        slot.evaluator
            .evaluate_partial_derivative(&ctx, wrt, &mut results)?;
        if out_pos < results.len() {
            Ok(results.swap_remove(out_pos))
        } else {
            Ok(CompositeVector::default())
        }
    }

    /// Whether `wrt` is in the transitive dependency closure of `kt`.
    ///
    /// Only meaningful after [`setup`](Self::setup).
    pub fn is_dependency(&self, kt: &KeyTag, wrt: &KeyTag) -> bool {
        match self.records.get_index_of(kt) {
            Some(idx) => self.depends_on(idx, wrt),
            None => false,
        }
    }

    fn depends_on(&self, idx: usize, wrt: &KeyTag) -> bool {
        let mut stack = vec![idx];
        let mut seen = HashSet::new();
        while let Some(r) = stack.pop() {
            if let Owner::Evaluator(e) = self.records[r].owner {
                for &d in &self.evaluators[e].deps {
                    if self.records[d].key_tag == *wrt {
                        return true;
                    }
                    if seen.insert(d) {
                        stack.push(d);
                    }
                }
            }
        }
        false
    }

    // ── Primary writes ─────────────────────────────────────────────

    fn primary_index(&self, kt: &KeyTag, operation: &'static str) -> Result<usize, StateError> {
        self.check_phase(operation, true)?;
        let idx = self.index_of(kt)?;
        match self.records[idx].owner {
            Owner::Primary(_) => Ok(idx),
            Owner::Evaluator(e) => Err(StateError::NotPrimary {
                field: kt.clone(),
                owner: self.evaluators[e].evaluator.name().to_string(),
            }),
            Owner::Unowned => Err(StateError::UnresolvedDependency { field: kt.clone() }),
        }
    }

    /// Overwrite a primary field and bump its version.
    pub fn set_primary(&mut self, kt: &KeyTag, values: &CompositeVector) -> Result<(), StateError> {
        let idx = self.primary_index(kt, "set_primary")?;
        let rec = &mut self.records[idx];
        rec.data.assign(values)?;
        rec.bump();
        Ok(())
    }

    /// Mutable access to a primary field. The version is bumped up front,
    /// so any write through the returned reference is seen by consumers.
    pub fn primary_mut(&mut self, kt: &KeyTag) -> Result<&mut CompositeVector, StateError> {
        let idx = self.primary_index(kt, "primary_mut")?;
        let rec = &mut self.records[idx];
        rec.bump();
        Ok(&mut rec.data)
    }

    /// Set every value of a primary field to `value`.
    pub fn set_scalar(&mut self, kt: &KeyTag, value: f64) -> Result<(), StateError> {
        self.primary_mut(kt)?.put_scalar(value);
        Ok(())
    }

    /// Copy `key` from `from` into the primary record at `to`.
    ///
    /// The source is brought up to date first.
    pub fn copy_field(&mut self, key: &Key, from: &Tag, to: &Tag) -> Result<(), StateError> {
        let src = key.at(from);
        let dst = key.at(to);
        let dst_idx = self.primary_index(&dst, "copy_field")?;
        let values = self.get_field(&src)?.clone();
        let rec = &mut self.records[dst_idx];
        rec.data.assign(&values)?;
        rec.bump();
        Ok(())
    }

    /// Copy every primary record at `to` from its counterpart at `from`.
    ///
    /// At commit this moves `next` into `previous`; after a failed step it
    /// restores `next` from `previous`.
    pub fn commit_tag(&mut self, from: &Tag, to: &Tag) -> Result<(), StateError> {
        self.check_phase("commit_tag", true)?;
        let keys: Vec<Key> = self
            .records
            .values()
            .filter(|r| r.key_tag.tag == *to && matches!(r.owner, Owner::Primary(_)))
            .map(|r| r.key_tag.key.clone())
            .filter(|k| {
                self.records
                    .get(&k.at(from))
                    .is_some_and(|src| src.owner != Owner::Unowned)
            })
            .collect();
        for key in keys {
            let src = key.at(from);
            let src_idx = self.index_of(&src)?;
            self.resolve(src_idx, &mut HashSet::new())?;
            if !self.records[src_idx].initialized {
                continue;
            }
            trace!(key = %key, from = %from, to = %to, "copying field between tags");
            self.copy_field(&key, from, to)?;
        }
        Ok(())
    }

    // ── Time, cycle, I/O ───────────────────────────────────────────

    /// Set the simulation time at `tag`.
    pub fn set_time(&mut self, tag: &Tag, t: f64) {
        self.times.insert(tag.clone(), t);
    }

    /// Simulation time at `tag`, if set.
    pub fn time(&self, tag: &Tag) -> Option<f64> {
        self.times.get(tag).copied()
    }

    /// Number of accepted steps.
    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    /// Count one accepted step.
    pub fn advance_cycle(&mut self) {
        self.cycle += 1;
    }

    /// Override the persistence flags of `kt`.
    pub fn set_io_flags(&mut self, kt: &KeyTag, io: IoFlags) -> Result<(), StateError> {
        let idx = self.index_of(kt)?;
        self.records[idx].io = io;
        Ok(())
    }

    /// Initialized fields flagged for the `kind` stream.
    pub fn io_fields(&self, kind: IoKind) -> impl Iterator<Item = (&KeyTag, &CompositeVector)> {
        self.records
            .values()
            .filter(move |r| {
                r.initialized
                    && match kind {
                        IoKind::Vis => r.io.vis,
                        IoKind::Checkpoint => r.io.checkpoint,
                    }
            })
            .map(|r| (&r.key_tag, &r.data))
    }

    /// Names of the registered evaluators, in registration order.
    pub fn evaluator_names(&self) -> impl Iterator<Item = &str> {
        self.evaluators.iter().map(|s| s.evaluator.name())
    }

    /// Graph role of the evaluator owning `kt`.
    pub fn owner_kind(&self, kt: &KeyTag) -> Option<EvaluatorKind> {
        let i = self.records.get(kt)?.owner.index()?;
        Some(self.evaluators[i].kind)
    }
}

/// `total += partial` (or `partial .* inner`), matching components by name.
fn accumulate(total: &mut CompositeVector, partial: &CompositeVector, inner: Option<&CompositeVector>) {
    for (spec, values) in total.components_mut() {
        let Some(p) = partial.component(&spec.name) else {
            continue;
        };
        match inner {
            None => {
                for (v, x) in values.iter_mut().zip(p) {
                    *v += x;
                }
            }
            Some(inner) => {
                let Some(q) = inner.component(&spec.name) else {
                    continue;
                };
                for ((v, x), y) in values.iter_mut().zip(p).zip(q) {
                    *v += x * y;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primary::{ConstantEvaluator, PrimaryVariable};

    fn scalar_primary(store: &mut StateStore, key: &str) -> KeyTag {
        let kt = Key::from(key).at(&Tag::NEXT);
        store.require(kt.clone(), FieldShape::scalar(), None).unwrap();
        store
            .register_evaluator(Box::new(PrimaryVariable::new(key, Tag::NEXT)))
            .unwrap();
        kt
    }

    #[test]
    fn require_is_idempotent() {
        let mut store = StateStore::new();
        let kt = Key::from("p").at(&Tag::NEXT);
        store.require(kt.clone(), FieldShape::scalar(), Some("flow")).unwrap();
        store.require(kt.clone(), FieldShape::scalar(), Some("flow")).unwrap();
        assert_eq!(store.records().count(), 1);
    }

    #[test]
    fn conflicting_claims_are_rejected() {
        let mut store = StateStore::new();
        let kt = Key::from("p").at(&Tag::NEXT);
        store.require(kt.clone(), FieldShape::scalar(), Some("flow")).unwrap();
        match store.require(kt, FieldShape::scalar(), Some("energy")) {
            Err(StateError::DuplicateOwner { existing, requested, .. }) => {
                assert_eq!(existing, "flow");
                assert_eq!(requested, "energy");
            }
            other => panic!("expected DuplicateOwner, got {other:?}"),
        }
    }

    #[test]
    fn second_evaluator_for_same_field_is_rejected() {
        let mut store = StateStore::new();
        scalar_primary(&mut store, "p");
        match store.register_evaluator(Box::new(ConstantEvaluator::new("p", Tag::NEXT, 1.0))) {
            Err(StateError::DuplicateOwner { existing, .. }) => assert_eq!(existing, "p"),
            other => panic!("expected DuplicateOwner, got {other:?}"),
        }
    }

    #[test]
    fn unowned_field_is_unresolved_at_setup() {
        let mut store = StateStore::new();
        let kt = Key::from("orphan").at(&Tag::NEXT);
        store.require(kt.clone(), FieldShape::scalar(), None).unwrap();
        match store.setup() {
            Err(StateError::UnresolvedDependency { field }) => assert_eq!(field, kt),
            other => panic!("expected UnresolvedDependency, got {other:?}"),
        }
    }

    #[test]
    fn operations_check_phase() {
        let mut store = StateStore::new();
        let kt = scalar_primary(&mut store, "p");
        assert!(matches!(
            store.update(&kt, "t"),
            Err(StateError::WrongPhase { sealed: false, .. })
        ));
        store.setup().unwrap();
        assert!(matches!(
            store.require(kt, FieldShape::scalar(), None),
            Err(StateError::WrongPhase { sealed: true, .. })
        ));
    }

    #[test]
    fn primary_reports_change_only_when_set() {
        let mut store = StateStore::new();
        let kt = scalar_primary(&mut store, "p");
        store.setup().unwrap();
        store.set_scalar(&kt, 3.0).unwrap();
        assert!(store.update(&kt, "t").unwrap());
        assert!(!store.update(&kt, "t").unwrap());
        store.set_scalar(&kt, 4.0).unwrap();
        assert!(store.update(&kt, "t").unwrap());
        assert_eq!(store.field(&kt).unwrap().values().collect::<Vec<_>>(), [4.0]);
    }

    #[test]
    fn unset_primary_is_stale() {
        let mut store = StateStore::new();
        let kt = scalar_primary(&mut store, "p");
        store.setup().unwrap();
        assert!(matches!(
            store.update(&kt, "t"),
            Err(StateError::StaleDependency { .. })
        ));
    }

    #[test]
    fn constant_is_computed_once() {
        let mut store = StateStore::new();
        let kt = Key::from("c").at(&Tag::NEXT);
        store.require(kt.clone(), FieldShape::scalar(), None).unwrap();
        store
            .register_evaluator(Box::new(ConstantEvaluator::new("c", Tag::NEXT, 2.5)))
            .unwrap();
        store.setup().unwrap();
        assert!(store.update(&kt, "t").unwrap());
        assert!(!store.update(&kt, "t").unwrap());
        assert_eq!(store.record(&kt).unwrap().version(), Version(1));
    }

    #[test]
    fn set_primary_rejects_secondary() {
        let mut store = StateStore::new();
        let kt = Key::from("c").at(&Tag::NEXT);
        store.require(kt.clone(), FieldShape::scalar(), None).unwrap();
        store
            .register_evaluator(Box::new(ConstantEvaluator::new("c", Tag::NEXT, 2.5)))
            .unwrap();
        store.setup().unwrap();
        match store.set_scalar(&kt, 1.0) {
            Err(StateError::NotPrimary { owner, .. }) => assert_eq!(owner, "c"),
            other => panic!("expected NotPrimary, got {other:?}"),
        }
    }

    #[test]
    fn commit_copies_next_into_previous() {
        let mut store = StateStore::new();
        let next = scalar_primary(&mut store, "u");
        let prev = Key::from("u").at(&Tag::PREVIOUS);
        store.require(prev.clone(), FieldShape::scalar(), None).unwrap();
        store
            .register_evaluator(Box::new(PrimaryVariable::new("u", Tag::PREVIOUS)))
            .unwrap();
        store.setup().unwrap();

        store.set_scalar(&prev, 1.0).unwrap();
        store.set_scalar(&next, 7.0).unwrap();
        store.commit_tag(&Tag::NEXT, &Tag::PREVIOUS).unwrap();
        assert_eq!(store.field(&prev).unwrap().values().next(), Some(7.0));
        assert_eq!(store.field(&next).unwrap().values().next(), Some(7.0));
    }

    #[test]
    fn io_fields_follow_flags() {
        let mut store = StateStore::new();
        let a = scalar_primary(&mut store, "a");
        let b = scalar_primary(&mut store, "b");
        store.setup().unwrap();
        store.set_scalar(&a, 1.0).unwrap();
        store.set_scalar(&b, 2.0).unwrap();
        store
            .set_io_flags(&b, IoFlags { vis: false, checkpoint: true })
            .unwrap();

        let vis: Vec<_> = store.io_fields(IoKind::Vis).map(|(kt, _)| kt.clone()).collect();
        let chk: Vec<_> = store.io_fields(IoKind::Checkpoint).map(|(kt, _)| kt.clone()).collect();
        assert_eq!(vis, [a]);
        assert_eq!(chk, [b]);
    }
}
