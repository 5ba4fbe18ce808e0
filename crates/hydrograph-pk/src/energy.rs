//! Energy transport: conduction, advection of enthalpy by the Darcy flux,
//! and sources.
//!
//! Primary unknown: `temperature` on cells and faces. Conserved quantity:
//! `energy` [J]. The residual is
//!
//! ```text
//! r = div(-K_e grad T)  +  (e_next - e_prev) / dt  -/+  adv(q h)  -  S
//! ```
//!
//! where `adv` is the net advective inflow of enthalpy and `S` already
//! includes the cell volume. With `"implicit advection"` (the default) the
//! inflow is subtracted; otherwise it is added.

use hydrograph_core::keys::read_key;
use hydrograph_core::{ConfigError, EntityKind, FieldShape, Key, KeyTag, ParameterList, Tag};
use hydrograph_evaluators::P_ATM;
use hydrograph_state::StateStore;
use nalgebra::DMatrix;
use tracing::{debug, trace, warn};

use crate::bc::{BcFunction, BcKind, BoundaryConditions};
use crate::error::{KernelError, SolverError};
use crate::kernel::{
    cell_derivative_or_zero, require_primary, require_with_default, KernelState, NonlinearFunction,
    PhysicalBase, ProcessKernel,
};
use crate::operators::{MfdDiffusion, UpwindAdvection};
use crate::precon::{AssembledPrecon, PreconMode};
use crate::tree_vector::TreeVector;

/// Open interval of admissible temperatures [K].
const TEMPERATURE_RANGE: (f64, f64) = (200.0, 373.15);

/// Characteristic energy per unit volume [J m^-3].
const ENERGY_SCALE: f64 = 2.0e6;

/// Reference temperature of the face error term [K].
const FACE_TEMPERATURE_SCALE: f64 = 273.15;

/// The energy kernel.
pub struct Energy {
    base: PhysicalBase,
    enthalpy: Key,
    darcy_flux: Key,
    conductivity: Key,
    source: Key,
    surface_pressure: Key,

    implicit_advection: bool,
    source_term: bool,
    coupled: bool,
    consistent_faces: bool,
    p_atm: f64,

    bc_temperature: BcFunction,
    bc_flux: BcFunction,
    bc_enthalpy: BcFunction,
    bcs: BoundaryConditions,
    advection_bcs: BoundaryConditions,
    initial_condition: Option<ParameterList>,

    matrix: MfdDiffusion,
    advection: UpwindAdvection,
    precon: AssembledPrecon,
    jacobian: Option<DMatrix<f64>>,
}

impl std::fmt::Debug for Energy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Energy")
            .field("base", &self.base)
            .field("implicit_advection", &self.implicit_advection)
            .field("coupled", &self.coupled)
            .field("precon", &self.precon.mode())
            .finish()
    }
}

impl Energy {
    /// Read the configuration.
    pub fn new(plist: &ParameterList, store: &StateStore) -> Result<Self, KernelError> {
        let base = PhysicalBase::new(plist, store, "temperature", "energy", (1.0, 1.0))?;
        let domain = base.domain.clone();
        let key = |basename: &str, default: &str| read_key(plist, &domain, basename, default);

        let via_temperature = plist.get_bool_or("coupled to surface via temperature", false)?;
        let via_flux = plist.get_bool_or("coupled to surface via flux", false)?;
        if via_temperature && via_flux {
            return Err(ConfigError::Conflict {
                reason: format!(
                    "{}: \"coupled to surface via temperature\" and \"coupled to surface via flux\" are mutually exclusive",
                    plist.name()
                ),
            }
            .into());
        }
        let coupled = via_temperature || via_flux;
        let mode = if coupled {
            PreconMode::Global
        } else if plist.get_bool_or("assemble preconditioner", true)? {
            PreconMode::Schur
        } else {
            PreconMode::Diagonal
        };

        let bc_list = plist.sublist_or_empty("boundary conditions")?;
        let mesh = base.mesh.clone();
        let nfaces = mesh.num_entities(EntityKind::Face, hydrograph_mesh::Parallel::Used);
        let initial_condition = if plist.is_sublist("initial condition") {
            Some(plist.sublist("initial condition")?)
        } else {
            None
        };
        Ok(Self {
            enthalpy: key("enthalpy", "enthalpy")?,
            darcy_flux: key("darcy flux", "darcy_flux")?,
            conductivity: key("thermal conductivity", "thermal_conductivity")?,
            source: key("source", "total_energy_source")?,
            surface_pressure: key("surface pressure", "pressure")?,
            implicit_advection: plist.get_bool_or("implicit advection", true)?,
            source_term: plist.get_bool_or("source term", false)?,
            coupled,
            consistent_faces: plist.get_bool_or("modify predictor with consistent faces", false)?,
            p_atm: plist.get_f64_or("atmospheric pressure", P_ATM)?,
            bc_temperature: BcFunction::from_category(&bc_list, "temperature", mesh.as_ref())?,
            bc_flux: BcFunction::from_category(&bc_list, "energy flux", mesh.as_ref())?,
            bc_enthalpy: BcFunction::from_category(&bc_list, "enthalpy", mesh.as_ref())?,
            bcs: BoundaryConditions::new(nfaces),
            advection_bcs: BoundaryConditions::new(nfaces),
            initial_condition,
            matrix: MfdDiffusion::new(mesh.clone(), None),
            advection: UpwindAdvection::new(mesh),
            precon: AssembledPrecon::new(mode),
            jacobian: None,
            base,
        })
    }

    /// Boundary conditions from the last update.
    pub fn boundary_conditions(&self) -> &BoundaryConditions {
        &self.bcs
    }

    /// Whether advective inflow is subtracted from the residual.
    pub fn implicit_advection(&self) -> bool {
        self.implicit_advection
    }

    /// The assembly mode of the preconditioner.
    pub fn precon_mode(&self) -> PreconMode {
        self.precon.mode()
    }

    fn next(&self, key: &Key) -> KeyTag {
        key.at(&Tag::NEXT)
    }

    fn update_boundary_conditions(&mut self, t: f64) {
        self.bcs.reset();
        for (f, v) in self.bc_temperature.values_at(t) {
            self.bcs.set_dirichlet(f, v);
        }
        for (f, v) in self.bc_flux.values_at(t) {
            self.bcs.set_neumann(f, v);
        }
        for &f in self.base.mesh.boundary_faces() {
            if self.bcs.kind(f) == BcKind::None {
                self.bcs.set_neumann(f, 0.0);
            }
        }
        self.advection_bcs.reset();
        for (f, v) in self.bc_enthalpy.values_at(t) {
            self.advection_bcs.set_dirichlet(f, v);
        }
    }

    fn update_conductivity(&mut self, store: &mut StateStore) -> Result<(), KernelError> {
        let k = store.get_field(&self.next(&self.conductivity))?.view("cell")?.to_vec();
        self.matrix.set_cell_coefficients(&k)?;
        self.matrix.set_unit_face_coefficients();
        Ok(())
    }
}

impl NonlinearFunction for Energy {
    fn fun(
        &mut self,
        store: &mut StateStore,
        t_old: f64,
        t_new: f64,
        _u_old: Option<&TreeVector>,
        u_new: &TreeVector,
        f: &mut TreeVector,
    ) -> Result<(), KernelError> {
        let dt = t_new - t_old;
        if dt <= 0.0 {
            return Err(KernelError::TimestepTooSmall { dt, min: 0.0 });
        }
        self.base.state = KernelState::Iterating;
        self.base.solution_to_state(store, u_new, &Tag::NEXT)?;
        self.update_boundary_conditions(t_new);
        self.update_conductivity(store)?;

        let r = f.leaf_data_mut()?;
        self.matrix.residual(u_new.leaf_data()?, &self.bcs, r)?;

        let e1 = store.get_field(&self.base.conserved.at(&Tag::NEXT))?.view("cell")?.to_vec();
        let e0 = store.get_field(&self.base.conserved.at(&Tag::PREVIOUS))?.view("cell")?.to_vec();
        let rc = r.view_mut("cell")?;
        for ((r, e1), e0) in rc.iter_mut().zip(&e1).zip(&e0) {
            *r += (e1 - e0) / dt;
        }

        let flux = store.get_field(&self.next(&self.darcy_flux))?.view("face")?.to_vec();
        let h = store.get_field(&self.next(&self.enthalpy))?.view("cell")?.to_vec();
        let mut inflow = vec![0.0; rc.len()];
        self.advection.apply(&flux, &h, Some(&self.advection_bcs), &mut inflow)?;
        let sign = if self.implicit_advection { -1.0 } else { 1.0 };
        for (r, a) in rc.iter_mut().zip(&inflow) {
            *r += sign * a;
        }

        if self.source_term {
            let s = store.get_field(&self.next(&self.source))?.view("cell")?.to_vec();
            for (r, s) in rc.iter_mut().zip(&s) {
                *r -= s;
            }
        }
        self.base.cache_for_enorm(store, dt)?;
        trace!(kernel = %self.base.name, t_new, "residual evaluated");
        Ok(())
    }

    fn update_precon(&mut self, store: &mut StateStore, t: f64, u: &TreeVector, dt: f64) -> Result<(), KernelError> {
        self.base.solution_to_state(store, u, &Tag::NEXT)?;
        self.update_boundary_conditions(t);
        self.update_conductivity(store)?;

        let ncells = self.base.ncells();
        let t_next = self.base.primary_at(&Tag::NEXT);
        let name = self.base.name.clone();
        let mut acc = cell_derivative_or_zero(store, &self.base.conserved.at(&Tag::NEXT), &t_next, &name, ncells)?;
        for a in &mut acc {
            *a /= dt;
        }
        if self.coupled {
            // No energy is stored where nothing is ponded.
            let p = store.get_field(&self.next(&self.surface_pressure))?.view("cell")?.to_vec();
            for (a, p) in acc.iter_mut().zip(&p) {
                if *p < self.p_atm {
                    *a = 0.0;
                }
            }
        }
        let s_next = self.next(&self.source);
        if self.source_term && store.is_dependency(&s_next, &t_next) {
            let ds = cell_derivative_or_zero(store, &s_next, &t_next, &name, ncells)?;
            for (a, d) in acc.iter_mut().zip(&ds) {
                *a -= d;
            }
        }

        let a = self.matrix.jacobian(&self.bcs, &acc)?;
        self.precon.rebuild(&a, ncells)?;
        self.jacobian = Some(a);
        trace!(kernel = %name, t, dt, "preconditioner updated");
        Ok(())
    }

    fn precon(&self, r: &TreeVector, pu: &mut TreeVector) -> Result<(), SolverError> {
        let du = self.precon.apply(&r.to_dvector())?;
        pu.read_flat(du.as_slice()).map_err(|_| SolverError::DimensionMismatch {
            expected: pu.len(),
            got: du.len(),
        })
    }

    fn enorm(&self, _u: &TreeVector, du: &TreeVector) -> f64 {
        self.base
            .enorm_cells_faces(du, ENERGY_SCALE, 1.0e-4, FACE_TEMPERATURE_SCALE)
    }

    fn is_admissible(&self, u: &TreeVector) -> bool {
        let Some((min, max)) = self.base.global_range(u) else {
            return true;
        };
        let ok = min > TEMPERATURE_RANGE.0 && max < TEMPERATURE_RANGE.1;
        if !ok {
            warn!(kernel = %self.base.name, min, max, "temperature out of admissible range");
        }
        ok
    }

    fn modify_predictor(&mut self, store: &mut StateStore, _dt: f64, u: &mut TreeVector) -> Result<bool, KernelError> {
        self.base.state = KernelState::PredictorPending;
        if !self.consistent_faces {
            return Ok(false);
        }
        let t = store.time(&Tag::NEXT).unwrap_or(0.0);
        self.base.solution_to_state(store, u, &Tag::NEXT)?;
        self.update_boundary_conditions(t);
        self.update_conductivity(store)?;
        self.matrix.update_consistent_faces(u.leaf_data_mut()?, &self.bcs)?;
        debug!(kernel = %self.base.name, "consistent faces predictor");
        Ok(true)
    }
}

impl ProcessKernel for Energy {
    fn name(&self) -> &str {
        &self.base.name
    }

    fn setup(&mut self, store: &mut StateStore) -> Result<(), KernelError> {
        let domain = self.base.domain.clone();
        let name = self.base.name.clone();
        let cells = FieldShape::cells(&domain);

        for tag in [Tag::NEXT, Tag::PREVIOUS] {
            require_primary(store, self.base.primary_at(&tag), FieldShape::cells_and_faces(&domain), &name)?;
        }
        require_primary(store, self.base.conserved.at(&Tag::PREVIOUS), cells.clone(), &name)?;
        store.require(self.base.conserved.at(&Tag::NEXT), cells.clone(), None)?;
        let cv = self.base.cell_volume.at(&Tag::NEXT);
        require_with_default(store, cv.clone(), cells.clone(), || {
            Ok(Box::new(hydrograph_evaluators::CellVolume::new(cv)))
        })?;
        store.require(self.next(&self.enthalpy), cells.clone(), None)?;
        store.require(self.next(&self.conductivity), cells.clone(), None)?;
        store.require(self.next(&self.darcy_flux), FieldShape::on(&domain).with(EntityKind::Face), None)?;
        if self.source_term {
            store.require(self.next(&self.source), cells.clone(), None)?;
        }
        if self.coupled {
            store.require(self.next(&self.surface_pressure), cells, None)?;
        }
        debug!(kernel = %name, domain = %domain, "energy setup");
        Ok(())
    }

    fn initialize(&mut self, store: &mut StateStore) -> Result<(), KernelError> {
        let t_next = self.base.primary_at(&Tag::NEXT);
        match &self.initial_condition {
            Some(ic) => store.set_scalar(&t_next, ic.get_f64("value")?)?,
            None if store.record(&t_next).is_some_and(|r| r.is_initialized()) => {}
            None => {
                return Err(ConfigError::MissingParameter {
                    list: self.base.name.clone(),
                    name: "initial condition".to_string(),
                }
                .into())
            }
        }
        store.copy_field(&self.base.primary, &Tag::NEXT, &Tag::PREVIOUS)?;
        store.copy_field(&self.base.conserved, &Tag::NEXT, &Tag::PREVIOUS)?;
        self.base.state = KernelState::Initialized;
        debug!(kernel = %self.base.name, "energy initialized");
        Ok(())
    }

    fn state_to_solution(&self, store: &mut StateStore, tag: &Tag) -> Result<TreeVector, KernelError> {
        self.base.state_to_solution(store, tag)
    }

    fn solution_to_state(&mut self, store: &mut StateStore, u: &TreeVector, tag: &Tag) -> Result<(), KernelError> {
        self.base.solution_to_state(store, u, tag)
    }

    fn commit_state(&mut self, _store: &mut StateStore, _dt: f64) -> Result<(), KernelError> {
        self.base.state = KernelState::Converged;
        Ok(())
    }

    fn primary_key(&self) -> Option<&Key> {
        Some(&self.base.primary)
    }

    fn conserved_key(&self) -> Option<&Key> {
        Some(&self.base.conserved)
    }

    fn jacobian(&self) -> Option<&DMatrix<f64>> {
        self.jacobian.as_ref()
    }

    fn state(&self) -> KernelState {
        self.base.state
    }

    fn set_state(&mut self, state: KernelState) {
        self.base.state = state;
    }
}
