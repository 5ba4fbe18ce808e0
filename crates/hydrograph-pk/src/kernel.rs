//! The nonlinear-function contract and the process-kernel interface.
//!
//! [`NonlinearFunction`] is what the [`Bdf1Integrator`](crate::bdf::Bdf1Integrator)
//! drives: residual, preconditioner, error norm, admissibility and
//! predictor correction. [`ProcessKernel`] adds the lifecycle (setup,
//! initialize, commit) and the mapping between solution vectors and the
//! [`StateStore`].
//!
//! [`PhysicalBase`] holds what every single-mesh kernel shares: its keys,
//! its mesh, tolerances and the caches `enorm` needs.

use std::sync::Arc;

use hydrograph_core::keys::{get_key, DEFAULT_DOMAIN};
use hydrograph_core::{ConfigError, FieldShape, Key, KeyTag, ParameterList, StateError, Tag};
use hydrograph_mesh::{Mesh, Parallel};
use hydrograph_state::{Evaluator, PrimaryVariable, StateStore, TYPE_KEY};
use nalgebra::DMatrix;
use tracing::trace;

use crate::error::{KernelError, SolverError};
use crate::tree_vector::TreeVector;

/// Lifecycle of a kernel.
///
/// `Setup -> Initialized -> (PredictorPending -> Iterating -> Converged | Failed)*`
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum KernelState {
    /// Constructed; fields being declared.
    #[default]
    Setup,
    /// Initial conditions written.
    Initialized,
    /// A step has started; the predictor is being formed.
    PredictorPending,
    /// Inside the nonlinear loop.
    Iterating,
    /// The last step converged.
    Converged,
    /// The last step failed and will be retried.
    Failed,
}

/// What an implicit time integrator needs from a kernel.
///
/// # Object safety
///
/// The integrator and couplers hold kernels as `Box<dyn ProcessKernel>`.
pub trait NonlinearFunction {
    /// Residual at `u_new`, written into `f`.
    ///
    /// `u_old` is the solution at `t_old` when the caller has it; kernels
    /// may read the previous tag from the store instead.
    fn fun(
        &mut self,
        store: &mut StateStore,
        t_old: f64,
        t_new: f64,
        u_old: Option<&TreeVector>,
        u_new: &TreeVector,
        f: &mut TreeVector,
    ) -> Result<(), KernelError>;

    /// Rebuild the approximate Jacobian at `u`.
    fn update_precon(
        &mut self,
        store: &mut StateStore,
        t: f64,
        u: &TreeVector,
        dt: f64,
    ) -> Result<(), KernelError>;

    /// Apply the approximate inverse Jacobian to `r`.
    fn precon(&self, r: &TreeVector, pu: &mut TreeVector) -> Result<(), SolverError>;

    /// Dimensionless error of residual `du` at `u`; converged below one.
    fn enorm(&self, u: &TreeVector, du: &TreeVector) -> f64;

    /// Physical plausibility of a trial solution.
    fn is_admissible(&self, u: &TreeVector) -> bool;

    /// Correct the predictor before the first residual. Returns whether
    /// `u` changed.
    fn modify_predictor(
        &mut self,
        _store: &mut StateStore,
        _dt: f64,
        _u: &mut TreeVector,
    ) -> Result<bool, KernelError> {
        Ok(false)
    }

    /// Notification that the solution was modified outside `fun`.
    fn changed_solution(&mut self, _store: &mut StateStore) -> Result<(), KernelError> {
        Ok(())
    }
}

/// A physical model, or a coupler of models, driven by the integrator.
pub trait ProcessKernel: NonlinearFunction {
    /// Kernel name, unique within a simulation.
    fn name(&self) -> &str;

    /// Declare fields and register evaluators. Runs before
    /// [`StateStore::setup`].
    fn setup(&mut self, store: &mut StateStore) -> Result<(), KernelError>;

    /// Write initial conditions. Runs after [`StateStore::setup`].
    fn initialize(&mut self, store: &mut StateStore) -> Result<(), KernelError>;

    /// The solution vector held in the store at `tag`.
    fn state_to_solution(&self, store: &mut StateStore, tag: &Tag) -> Result<TreeVector, KernelError>;

    /// Write `u` into the primary fields at `tag`.
    fn solution_to_state(
        &mut self,
        store: &mut StateStore,
        u: &TreeVector,
        tag: &Tag,
    ) -> Result<(), KernelError>;

    /// Finish an accepted step of length `dt`.
    fn commit_state(&mut self, store: &mut StateStore, dt: f64) -> Result<(), KernelError>;

    /// Refresh fields only needed for output.
    fn calculate_diagnostics(&mut self, _store: &mut StateStore) -> Result<(), KernelError> {
        Ok(())
    }

    /// Key of the primary unknown, for single-field kernels.
    fn primary_key(&self) -> Option<&Key> {
        None
    }

    /// Key of the conserved quantity whose time derivative the residual
    /// holds, for single-field kernels.
    fn conserved_key(&self) -> Option<&Key> {
        None
    }

    /// The local Jacobian assembled by the last
    /// [`update_precon`](NonlinearFunction::update_precon), flat in
    /// solution order.
    fn jacobian(&self) -> Option<&DMatrix<f64>> {
        None
    }

    /// Current lifecycle state.
    fn state(&self) -> KernelState;

    /// Move to `state`.
    fn set_state(&mut self, state: KernelState);
}

// ── Store helpers ──────────────────────────────────────────────────

/// Whether the kernel should register its own evaluator for `kt`: no
/// evaluator owns it and the evaluator list has no entry for its key.
pub fn needs_evaluator(store: &StateStore, kt: &KeyTag) -> bool {
    !store.has_evaluator(kt) && !store.evaluator_list().is_sublist(kt.key.as_str())
}

/// Require `kt` claimed by `owner` and back it with a
/// [`PrimaryVariable`] unless one is registered or configured.
///
/// Evaluator-list entries are keyed by key alone, so only a
/// `"primary variable"` entry stands in for the kernel's own.
pub fn require_primary(
    store: &mut StateStore,
    kt: KeyTag,
    shape: FieldShape,
    owner: &str,
) -> Result<(), StateError> {
    store.require(kt.clone(), shape, Some(owner))?;
    let listed = store
        .evaluator_list()
        .sublist(kt.key.as_str())
        .ok()
        .is_some_and(|l| l.get_str(TYPE_KEY).ok() == Some("primary variable"));
    if !store.has_evaluator(&kt) && !listed {
        trace!(field = %kt, owner, "registering primary variable");
        store.register_evaluator(Box::new(PrimaryVariable::new(kt.key.clone(), kt.tag.clone())))?;
    }
    Ok(())
}

/// Require `kt` and register `make()` for it unless the store already
/// has an evaluator or a configured one.
pub fn require_with_default(
    store: &mut StateStore,
    kt: KeyTag,
    shape: FieldShape,
    make: impl FnOnce() -> Result<Box<dyn Evaluator>, ConfigError>,
) -> Result<(), StateError> {
    store.require(kt.clone(), shape, None)?;
    if needs_evaluator(store, &kt) {
        store.register_evaluator(make()?)?;
    }
    Ok(())
}

/// Cell component of `d(of)/d(wrt)`, or zeros when the owning evaluator
/// cannot differentiate.
pub fn cell_derivative_or_zero(
    store: &mut StateStore,
    of: &KeyTag,
    wrt: &KeyTag,
    consumer: &str,
    ncells: usize,
) -> Result<Vec<f64>, KernelError> {
    match store.update_derivative(of, wrt, consumer) {
        Ok(_) => {
            let d = store.derivative(of, wrt)?;
            Ok(match d.component("cell") {
                Some(v) => v.to_vec(),
                None => vec![0.0; ncells],
            })
        }
        Err(StateError::UnsupportedDerivative { evaluator, .. }) => {
            trace!(%of, %wrt, evaluator, "derivative unsupported, using zero");
            Ok(vec![0.0; ncells])
        }
        Err(e) => Err(e.into()),
    }
}

// ── PhysicalBase ───────────────────────────────────────────────────

/// Configuration and caches shared by single-mesh kernels.
pub struct PhysicalBase {
    /// Kernel name.
    pub name: String,
    /// Domain (mesh) name.
    pub domain: String,
    /// The domain's mesh.
    pub mesh: Arc<dyn Mesh>,
    /// Primary unknown.
    pub primary: Key,
    /// Conserved quantity.
    pub conserved: Key,
    /// Cell volumes.
    pub cell_volume: Key,
    /// Absolute error tolerance.
    pub atol: f64,
    /// Relative error tolerance.
    pub rtol: f64,
    /// Lifecycle state.
    pub state: KernelState,
    ncells: usize,
    volume: Vec<f64>,
    conserved_next: Vec<f64>,
    dt: f64,
}

impl std::fmt::Debug for PhysicalBase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhysicalBase")
            .field("name", &self.name)
            .field("domain", &self.domain)
            .field("primary", &self.primary)
            .field("state", &self.state)
            .finish()
    }
}

/// Last segment of a nested list name.
pub fn list_leaf_name(plist: &ParameterList) -> &str {
    plist.name().rsplit("->").next().unwrap_or(plist.name())
}

impl PhysicalBase {
    /// Read `"PK name"` (default: the list name), `"domain name"`,
    /// `"primary variable key"`, `"conserved quantity key"`,
    /// `"cell volume key"` and the error tolerances, and look up the mesh.
    pub fn new(
        plist: &ParameterList,
        store: &StateStore,
        primary_default: &str,
        conserved_default: &str,
        tolerances: (f64, f64),
    ) -> Result<Self, KernelError> {
        let name = plist.get_string_or("PK name", list_leaf_name(plist))?;
        let domain = plist.get_string_or("domain name", DEFAULT_DOMAIN)?;
        let key = |option: &str, default: &str| -> Result<Key, ConfigError> {
            let fallback = get_key(&domain, default);
            plist.get_string_or(option, fallback.as_str()).map(Key::from)
        };
        let primary = key("primary variable key", primary_default)?;
        let conserved = key("conserved quantity key", conserved_default)?;
        let cell_volume = key("cell volume key", "cell_volume")?;
        let atol = plist.get_f64_or("absolute error tolerance", tolerances.0)?;
        let rtol = plist.get_f64_or("relative error tolerance", tolerances.1)?;
        if !(atol > 0.0 && rtol >= 0.0) {
            return Err(plist
                .invalid("absolute error tolerance", "tolerances must be positive")
                .into());
        }
        let mesh = store.mesh(&domain)?;
        let ncells = mesh.num_entities(hydrograph_core::EntityKind::Cell, Parallel::Owned);
        let volume = (0..ncells).map(|c| mesh.cell_volume(c)).collect();
        Ok(Self {
            name,
            domain,
            mesh,
            primary,
            conserved,
            cell_volume,
            atol,
            rtol,
            state: KernelState::Setup,
            ncells,
            volume,
            conserved_next: vec![0.0; ncells],
            dt: 1.0,
        })
    }

    /// Key of a variable on this kernel's domain.
    pub fn key(&self, var: &str) -> Key {
        get_key(&self.domain, var)
    }

    /// Number of owned cells.
    pub fn ncells(&self) -> usize {
        self.ncells
    }

    /// Primary at `tag`.
    pub fn primary_at(&self, tag: &Tag) -> KeyTag {
        self.primary.at(tag)
    }

    /// Solution vector for the primary at `tag`.
    pub fn state_to_solution(&self, store: &mut StateStore, tag: &Tag) -> Result<TreeVector, KernelError> {
        let data = store.get_field(&self.primary.at(tag))?.clone();
        Ok(TreeVector::leaf(self.name.clone(), data))
    }

    /// Write `u` into the primary at `tag`.
    pub fn solution_to_state(&self, store: &mut StateStore, u: &TreeVector, tag: &Tag) -> Result<(), KernelError> {
        store.set_primary(&self.primary.at(tag), u.leaf_data()?)?;
        Ok(())
    }

    /// Cache cell volumes, the conserved quantity at `next` and `dt` for
    /// [`enorm_cells_faces`](Self::enorm_cells_faces).
    pub fn cache_for_enorm(&mut self, store: &mut StateStore, dt: f64) -> Result<(), KernelError> {
        let vol = store.get_field(&self.cell_volume.at(&Tag::NEXT))?.view("cell")?.to_vec();
        let cons = store.get_field(&self.conserved.at(&Tag::NEXT))?.view("cell")?.to_vec();
        self.volume = vol;
        self.conserved_next = cons;
        self.dt = dt;
        Ok(())
    }

    /// Cached step size.
    pub fn dt(&self) -> f64 {
        self.dt
    }

    /// `max(cell term, face term)`, reduced over ranks.
    ///
    /// Cell term: `|dt r_c| / (atol V_c cell_scale + rtol |Q_c|)` with `Q`
    /// the cached conserved quantity. Face term: `face_factor |r_f| /
    /// (atol + rtol face_ref)`. Any non-finite term makes the norm
    /// infinite.
    pub fn enorm_cells_faces(
        &self,
        r: &TreeVector,
        cell_scale: f64,
        face_factor: f64,
        face_ref: f64,
    ) -> f64 {
        let Ok(data) = r.leaf_data() else {
            return f64::INFINITY;
        };
        let mut local = 0.0_f64;
        if let Some(rc) = data.component("cell") {
            for (c, rc) in rc.iter().enumerate().take(self.ncells) {
                let v = self.volume.get(c).copied().unwrap_or(1.0);
                let q = self.conserved_next.get(c).copied().unwrap_or(0.0);
                let denom = self.atol * v * cell_scale + self.rtol * q.abs();
                local = finite_max(local, (self.dt * rc).abs() / denom);
            }
        }
        if let Some(rf) = data.component("face") {
            let denom = self.atol + self.rtol * face_ref;
            for rf in rf {
                local = finite_max(local, face_factor * rf.abs() / denom);
            }
        }
        self.mesh.comm().max_all(local)
    }

    /// Global `(min, max)` of `u`, or `None` if every rank is empty.
    ///
    /// A non-finite value on any rank widens the range to
    /// `(-inf, +inf)` everywhere, so every bounds check rejects it.
    pub fn global_range(&self, u: &TreeVector) -> Option<(f64, f64)> {
        let comm = self.mesh.comm();
        let (lo, hi) = if u.values().all(f64::is_finite) {
            (
                u.min_value().unwrap_or(f64::INFINITY),
                u.max_value().unwrap_or(f64::NEG_INFINITY),
            )
        } else {
            (f64::NEG_INFINITY, f64::INFINITY)
        };
        let min = comm.min_all(lo);
        let max = comm.max_all(hi);
        (min <= max).then_some((min, max))
    }
}

/// `max(acc, term)`, infinite once any term is not finite.
fn finite_max(acc: f64, term: f64) -> f64 {
    if term.is_finite() {
        acc.max(term)
    } else {
        f64::INFINITY
    }
}
