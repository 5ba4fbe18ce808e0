//! Couplers: process kernels built from other process kernels.
//!
//! A [`StrongCoupler`] solves N kernels as one nonlinear system whose
//! solution is a [`TreeVector::Node`] with one child per kernel. The
//! [`SurfaceSubsurfaceCoupler`] specializes it to a subsurface and a
//! surface kernel joined through the parent faces of the surface mesh.

use std::sync::Arc;

use hydrograph_core::keys::get_key;
use hydrograph_core::{ConfigError, EntityKind, Key, ParameterList, StateError, Tag};
use hydrograph_mesh::{Mesh, MeshError, Parallel};
use hydrograph_state::StateStore;
use nalgebra::DMatrix;
use tracing::{debug, trace};

use crate::error::{KernelError, SolverError};
use crate::kernel::{cell_derivative_or_zero, list_leaf_name, KernelState, NonlinearFunction, ProcessKernel};
use crate::precon::{AssembledPrecon, PreconMode};
use crate::tree_vector::TreeVector;

/// How a [`StrongCoupler`] preconditions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CouplerPrecon {
    /// Each kernel's preconditioner on its own block.
    BlockDiagonal,
    /// One matrix from the kernels' Jacobians plus configured cross terms.
    BlockCoupled,
}

/// A cross term `d(conserved of row) / d(primary of column) / dt`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct CouplingTerm {
    row: usize,
    column: usize,
}

fn child_error(expected: usize, got: usize) -> SolverError {
    SolverError::DimensionMismatch { expected, got }
}

/// Length of the leading `"cell"` component of a leaf.
fn leading_cells(u: &TreeVector) -> Result<usize, KernelError> {
    let data = u.leaf_data()?;
    match data.components().next() {
        Some((spec, values)) if spec.name == "cell" => Ok(values.len()),
        _ => Err(StateError::ShapeMismatch {
            reason: format!("block coupling of '{}' needs a leading cell component", u.name()),
        }
        .into()),
    }
}

/// N kernels solved simultaneously.
///
/// # Configuration
///
/// ```json
/// {
///   "preconditioner type": "block coupled",
///   "coupling terms": { "flow-energy": { "row": "flow", "column": "energy" } }
/// }
/// ```
pub struct StrongCoupler {
    name: String,
    kernels: Vec<Box<dyn ProcessKernel>>,
    precon_type: CouplerPrecon,
    coupling_terms: Vec<CouplingTerm>,
    precon: AssembledPrecon,
    jacobian: Option<DMatrix<f64>>,
    state: KernelState,
}

impl std::fmt::Debug for StrongCoupler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StrongCoupler")
            .field("name", &self.name)
            .field("kernels", &self.kernels.iter().map(|k| k.name()).collect::<Vec<_>>())
            .field("precon_type", &self.precon_type)
            .field("state", &self.state)
            .finish()
    }
}

impl StrongCoupler {
    /// Couple `kernels`, in solution order.
    pub fn new(plist: &ParameterList, kernels: Vec<Box<dyn ProcessKernel>>) -> Result<Self, KernelError> {
        if kernels.is_empty() {
            return Err(plist.invalid("PKs order", "a coupler needs at least one kernel").into());
        }
        let precon_type = match plist.get_string_or("preconditioner type", "block diagonal")?.as_str() {
            "block diagonal" => CouplerPrecon::BlockDiagonal,
            "block coupled" => CouplerPrecon::BlockCoupled,
            other => {
                return Err(plist
                    .invalid(
                        "preconditioner type",
                        format!("'{other}' is not one of \"block diagonal\", \"block coupled\""),
                    )
                    .into())
            }
        };
        let index_of = |list: &ParameterList, option: &str| -> Result<usize, ConfigError> {
            let name = list.get_str(option)?;
            kernels
                .iter()
                .position(|k| k.name() == name)
                .ok_or_else(|| list.invalid(option, format!("no coupled kernel named '{name}'")))
        };
        let mut coupling_terms = Vec::new();
        if plist.is_sublist("coupling terms") {
            for entry in plist.sublist("coupling terms")?.sublists() {
                let (_, term) = entry?;
                coupling_terms.push(CouplingTerm {
                    row: index_of(&term, "row")?,
                    column: index_of(&term, "column")?,
                });
            }
        }
        Ok(Self {
            name: plist.get_string_or("PK name", list_leaf_name(plist))?,
            kernels,
            precon_type,
            coupling_terms,
            precon: AssembledPrecon::new(PreconMode::Global),
            jacobian: None,
            state: KernelState::Setup,
        })
    }

    /// The coupled kernels, in solution order.
    pub fn kernels(&self) -> &[Box<dyn ProcessKernel>] {
        &self.kernels
    }

    /// Mutable access to kernel `i`.
    pub fn kernel_mut(&mut self, i: usize) -> Option<&mut Box<dyn ProcessKernel>> {
        self.kernels.get_mut(i)
    }

    /// The preconditioning strategy.
    pub fn precon_type(&self) -> CouplerPrecon {
        self.precon_type
    }

    /// Assemble the block matrix from the sub-kernel Jacobians and the
    /// configured cross terms.
    fn assemble(&self, store: &mut StateStore, u: &TreeVector, dt: f64) -> Result<DMatrix<f64>, KernelError> {
        let mut offsets = Vec::with_capacity(self.kernels.len());
        let mut n = 0;
        for i in 0..self.kernels.len() {
            offsets.push(n);
            n += u.child(i)?.len();
        }
        let mut a = DMatrix::zeros(n, n);
        for (i, k) in self.kernels.iter().enumerate() {
            let block = k.jacobian().ok_or_else(|| ConfigError::Conflict {
                reason: format!("kernel '{}' does not assemble a Jacobian for block coupling", k.name()),
            })?;
            a.view_mut((offsets[i], offsets[i]), block.shape()).copy_from(block);
        }
        for term in &self.coupling_terms {
            let (row, col) = (&self.kernels[term.row], &self.kernels[term.column]);
            let (Some(conserved), Some(primary)) = (row.conserved_key(), col.primary_key()) else {
                return Err(ConfigError::Conflict {
                    reason: format!(
                        "coupling term {} -> {} needs a conserved and a primary key",
                        row.name(),
                        col.name()
                    ),
                }
                .into());
            };
            let nrow = leading_cells(u.child(term.row)?)?;
            let ncol = leading_cells(u.child(term.column)?)?;
            if nrow != ncol {
                return Err(StateError::ShapeMismatch {
                    reason: format!("coupling {} ({nrow} cells) with {} ({ncol} cells)", row.name(), col.name()),
                }
                .into());
            }
            let d = cell_derivative_or_zero(
                store,
                &conserved.at(&Tag::NEXT),
                &primary.at(&Tag::NEXT),
                &self.name,
                nrow,
            )?;
            for (c, d) in d.iter().enumerate() {
                a[(offsets[term.row] + c, offsets[term.column] + c)] += d / dt;
            }
        }
        Ok(a)
    }

    fn child_pair<'a>(
        &self,
        u: &'a TreeVector,
        du: &'a TreeVector,
        i: usize,
    ) -> Option<(&'a TreeVector, &'a TreeVector)> {
        Some((u.child(i).ok()?, du.child(i).ok()?))
    }
}

impl NonlinearFunction for StrongCoupler {
    fn fun(
        &mut self,
        store: &mut StateStore,
        t_old: f64,
        t_new: f64,
        u_old: Option<&TreeVector>,
        u_new: &TreeVector,
        f: &mut TreeVector,
    ) -> Result<(), KernelError> {
        self.state = KernelState::Iterating;
        for (i, k) in self.kernels.iter_mut().enumerate() {
            let old = u_old.map(|u| u.child(i)).transpose()?;
            k.fun(store, t_old, t_new, old, u_new.child(i)?, f.child_mut(i)?)?;
        }
        Ok(())
    }

    fn update_precon(&mut self, store: &mut StateStore, t: f64, u: &TreeVector, dt: f64) -> Result<(), KernelError> {
        for (i, k) in self.kernels.iter_mut().enumerate() {
            k.update_precon(store, t, u.child(i)?, dt)?;
        }
        if self.precon_type == CouplerPrecon::BlockCoupled {
            let a = self.assemble(store, u, dt)?;
            self.precon.rebuild(&a, a.nrows())?;
            self.jacobian = Some(a);
            trace!(coupler = %self.name, "block-coupled preconditioner assembled");
        }
        Ok(())
    }

    fn precon(&self, r: &TreeVector, pu: &mut TreeVector) -> Result<(), SolverError> {
        match self.precon_type {
            CouplerPrecon::BlockDiagonal => {
                let n = self.kernels.len();
                for (i, k) in self.kernels.iter().enumerate() {
                    let ri = r.child(i).map_err(|_| child_error(n, r.children().len()))?;
                    let got = pu.children().len();
                    let pi = pu.child_mut(i).map_err(|_| child_error(n, got))?;
                    k.precon(ri, pi)?;
                }
                Ok(())
            }
            CouplerPrecon::BlockCoupled => {
                let du = self.precon.apply(&r.to_dvector())?;
                pu.read_flat(du.as_slice())
                    .map_err(|_| child_error(pu.len(), du.len()))
            }
        }
    }

    fn enorm(&self, u: &TreeVector, du: &TreeVector) -> f64 {
        self.kernels
            .iter()
            .enumerate()
            .map(|(i, k)| match self.child_pair(u, du, i) {
                Some((ui, dui)) => k.enorm(ui, dui),
                None => f64::INFINITY,
            })
            .fold(0.0, |acc, e| if e.is_nan() { f64::INFINITY } else { acc.max(e) })
    }

    fn is_admissible(&self, u: &TreeVector) -> bool {
        self.kernels
            .iter()
            .enumerate()
            .all(|(i, k)| u.child(i).is_ok_and(|ui| k.is_admissible(ui)))
    }

    fn modify_predictor(&mut self, store: &mut StateStore, dt: f64, u: &mut TreeVector) -> Result<bool, KernelError> {
        self.state = KernelState::PredictorPending;
        let mut changed = false;
        for (i, k) in self.kernels.iter_mut().enumerate() {
            changed |= k.modify_predictor(store, dt, u.child_mut(i)?)?;
        }
        Ok(changed)
    }

    fn changed_solution(&mut self, store: &mut StateStore) -> Result<(), KernelError> {
        for k in &mut self.kernels {
            k.changed_solution(store)?;
        }
        Ok(())
    }
}

impl ProcessKernel for StrongCoupler {
    fn name(&self) -> &str {
        &self.name
    }

    fn setup(&mut self, store: &mut StateStore) -> Result<(), KernelError> {
        for k in &mut self.kernels {
            k.setup(store)?;
        }
        debug!(coupler = %self.name, kernels = self.kernels.len(), "coupler setup");
        Ok(())
    }

    fn initialize(&mut self, store: &mut StateStore) -> Result<(), KernelError> {
        for k in &mut self.kernels {
            k.initialize(store)?;
        }
        self.state = KernelState::Initialized;
        Ok(())
    }

    fn state_to_solution(&self, store: &mut StateStore, tag: &Tag) -> Result<TreeVector, KernelError> {
        let children = self
            .kernels
            .iter()
            .map(|k| k.state_to_solution(store, tag))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(TreeVector::node(self.name.clone(), children))
    }

    fn solution_to_state(&mut self, store: &mut StateStore, u: &TreeVector, tag: &Tag) -> Result<(), KernelError> {
        for (i, k) in self.kernels.iter_mut().enumerate() {
            k.solution_to_state(store, u.child(i)?, tag)?;
        }
        Ok(())
    }

    fn commit_state(&mut self, store: &mut StateStore, dt: f64) -> Result<(), KernelError> {
        for k in &mut self.kernels {
            k.commit_state(store, dt)?;
        }
        self.state = KernelState::Converged;
        Ok(())
    }

    fn calculate_diagnostics(&mut self, store: &mut StateStore) -> Result<(), KernelError> {
        for k in &mut self.kernels {
            k.calculate_diagnostics(store)?;
        }
        Ok(())
    }

    fn jacobian(&self) -> Option<&DMatrix<f64>> {
        self.jacobian.as_ref()
    }

    fn state(&self) -> KernelState {
        self.state
    }

    fn set_state(&mut self, state: KernelState) {
        self.state = state;
        for k in &mut self.kernels {
            k.set_state(state);
        }
    }
}

// ── Surface / subsurface ───────────────────────────────────────────

/// A subsurface kernel and a surface kernel joined through the parent
/// faces of the surface mesh.
///
/// The surface residual loses the flux leaving the subsurface through each
/// parent face. The preconditioner keeps the subsurface face update equal
/// to the surface cell update, matching a head-coupled subsurface kernel.
pub struct SurfaceSubsurfaceCoupler {
    inner: StrongCoupler,
    subsurface: usize,
    surface: usize,
    darcy_flux: Key,
    /// Parent face of each surface cell, with the direction of that face
    /// out of its subsurface cell.
    parents: Vec<(usize, f64)>,
}

impl std::fmt::Debug for SurfaceSubsurfaceCoupler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SurfaceSubsurfaceCoupler")
            .field("inner", &self.inner)
            .field("darcy_flux", &self.darcy_flux)
            .finish()
    }
}

impl SurfaceSubsurfaceCoupler {
    /// Couple exactly two kernels, named by `"subsurface PK name"` and
    /// `"surface PK name"`, on the meshes `"domain mesh key"` and
    /// `"surface mesh key"`.
    pub fn new(
        plist: &ParameterList,
        store: &StateStore,
        kernels: Vec<Box<dyn ProcessKernel>>,
    ) -> Result<Self, KernelError> {
        if kernels.len() != 2 {
            return Err(plist
                .invalid("PKs order", format!("expected two kernels, got {}", kernels.len()))
                .into());
        }
        let domain = plist.get_string_or("domain mesh key", "domain")?;
        let surface_domain = plist.get_string_or("surface mesh key", "surface")?;
        let find = |option: &str| -> Result<usize, ConfigError> {
            let name = plist.get_str(option)?;
            kernels
                .iter()
                .position(|k| k.name() == name)
                .ok_or_else(|| plist.invalid(option, format!("no coupled kernel named '{name}'")))
        };
        let subsurface = find("subsurface PK name")?;
        let surface = find("surface PK name")?;
        if subsurface == surface {
            return Err(ConfigError::Conflict {
                reason: "subsurface and surface kernels must differ".to_string(),
            }
            .into());
        }

        let domain_mesh: Arc<dyn Mesh> = store.mesh(&domain)?;
        let surface_mesh = store.mesh(&surface_domain)?;
        let ns = surface_mesh.num_entities(EntityKind::Cell, Parallel::Owned);
        let parents = (0..ns)
            .map(|c| {
                let f = surface_mesh
                    .entity_parent(EntityKind::Cell, c)
                    .ok_or(MeshError::NoParent { kind: EntityKind::Cell, id: c })?;
                let cell = *domain_mesh
                    .face_cells(f)
                    .first()
                    .ok_or(MeshError::UnknownEntity { kind: EntityKind::Face, id: f })?;
                let dir = domain_mesh
                    .cell_faces_and_dirs(cell)
                    .iter()
                    .find(|(face, _)| *face == f)
                    .map_or(1.0, |(_, d)| f64::from(*d));
                Ok((f, dir))
            })
            .collect::<Result<Vec<_>, MeshError>>()?;

        let darcy_flux = Key::from(plist.get_string_or("darcy flux key", get_key(&domain, "darcy_flux").as_str())?);
        Ok(Self {
            inner: StrongCoupler::new(plist, kernels)?,
            subsurface,
            surface,
            darcy_flux,
            parents,
        })
    }

    /// The underlying coupler.
    pub fn inner(&self) -> &StrongCoupler {
        &self.inner
    }
}

impl NonlinearFunction for SurfaceSubsurfaceCoupler {
    fn fun(
        &mut self,
        store: &mut StateStore,
        t_old: f64,
        t_new: f64,
        u_old: Option<&TreeVector>,
        u_new: &TreeVector,
        f: &mut TreeVector,
    ) -> Result<(), KernelError> {
        let (sub, surf) = (self.subsurface, self.surface);
        // The subsurface boundary reads the surface state.
        self.inner.kernels[surf].solution_to_state(store, u_new.child(surf)?, &Tag::NEXT)?;
        self.inner.kernels[sub].solution_to_state(store, u_new.child(sub)?, &Tag::NEXT)?;
        self.inner.fun(store, t_old, t_new, u_old, u_new, f)?;

        let flux = store.get_field(&self.darcy_flux.at(&Tag::NEXT))?.view("face")?.to_vec();
        let r = f.child_mut(surf)?.leaf_data_mut()?.view_mut("cell")?;
        for (rc, (face, dir)) in r.iter_mut().zip(&self.parents) {
            *rc -= dir * flux[*face];
        }
        Ok(())
    }

    fn update_precon(&mut self, store: &mut StateStore, t: f64, u: &TreeVector, dt: f64) -> Result<(), KernelError> {
        self.inner.update_precon(store, t, u, dt)
    }

    fn precon(&self, r: &TreeVector, pu: &mut TreeVector) -> Result<(), SolverError> {
        self.inner.precon(r, pu)?;
        let n = pu.children().len();
        let surface_du = pu
            .child(self.surface)
            .and_then(|c| c.leaf_data())
            .and_then(|d| d.view("cell").map(<[f64]>::to_vec))
            .map_err(|_| child_error(2, n))?;
        let faces = pu
            .child_mut(self.subsurface)
            .and_then(|c| c.leaf_data_mut())
            .and_then(|d| d.view_mut("face"))
            .map_err(|_| child_error(2, n))?;
        for (du, (face, _)) in surface_du.iter().zip(&self.parents) {
            faces[*face] = *du;
        }
        Ok(())
    }

    fn enorm(&self, u: &TreeVector, du: &TreeVector) -> f64 {
        self.inner.enorm(u, du)
    }

    fn is_admissible(&self, u: &TreeVector) -> bool {
        self.inner.is_admissible(u)
    }

    fn modify_predictor(&mut self, store: &mut StateStore, dt: f64, u: &mut TreeVector) -> Result<bool, KernelError> {
        self.inner.modify_predictor(store, dt, u)
    }

    fn changed_solution(&mut self, store: &mut StateStore) -> Result<(), KernelError> {
        self.inner.changed_solution(store)
    }
}

impl ProcessKernel for SurfaceSubsurfaceCoupler {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn setup(&mut self, store: &mut StateStore) -> Result<(), KernelError> {
        self.inner.setup(store)
    }

    fn initialize(&mut self, store: &mut StateStore) -> Result<(), KernelError> {
        self.inner.initialize(store)
    }

    fn state_to_solution(&self, store: &mut StateStore, tag: &Tag) -> Result<TreeVector, KernelError> {
        self.inner.state_to_solution(store, tag)
    }

    fn solution_to_state(&mut self, store: &mut StateStore, u: &TreeVector, tag: &Tag) -> Result<(), KernelError> {
        self.inner.solution_to_state(store, u, tag)
    }

    fn commit_state(&mut self, store: &mut StateStore, dt: f64) -> Result<(), KernelError> {
        self.inner.commit_state(store, dt)
    }

    fn calculate_diagnostics(&mut self, store: &mut StateStore) -> Result<(), KernelError> {
        self.inner.calculate_diagnostics(store)
    }

    fn jacobian(&self) -> Option<&DMatrix<f64>> {
        self.inner.jacobian()
    }

    fn state(&self) -> KernelState {
        self.inner.state()
    }

    fn set_state(&mut self, state: KernelState) {
        self.inner.set_state(state);
    }
}
