//! Richards equation for variably saturated subsurface flow.
//!
//! Primary unknown: `pressure` on cells and faces. Conserved quantity:
//! `water_content` [mol]. The residual is
//!
//! ```text
//! r = div(-k K/mu grad(p) + rho g)  +  (WC_next - WC_prev) / dt  -  Q V
//! ```
//!
//! with the mobility `k = kr n / mu` upwinded onto faces.
//!
//! # Configuration
//!
//! ```json
//! {
//!   "domain name": "domain",
//!   "relative permeability method": "upwind with gravity",
//!   "update flux mode": "iteration",
//!   "boundary conditions": { "pressure": { "bottom": { "boundary": "bottom", "value": 101325.0 } } },
//!   "water retention evaluator": { "van Genuchten alpha": 1e-4, "van Genuchten m": 0.5 },
//!   "initial condition": { "water table elevation": 0.0 }
//! }
//! ```

use std::sync::Arc;

use hydrograph_core::keys::read_key;
use hydrograph_core::{
    CompositeVector, ConfigError, EntityKind, FieldShape, Key, KeyTag, ParameterList, StateError, Tag,
};
use hydrograph_evaluators::{CellVolume, RelPermEvaluator, RichardsWaterContent, VanGenuchten, WrmEvaluator, P_ATM};
use hydrograph_mesh::{boundary_face_index, Mesh, MeshError, Parallel};
use hydrograph_state::{Evaluator, StateStore};
use nalgebra::DMatrix;
use tracing::{debug, trace, warn};

use crate::bc::{BcFunction, BcKind, BoundaryConditions};
use crate::error::{KernelError, SolverError};
use crate::kernel::{
    cell_derivative_or_zero, needs_evaluator, require_primary, require_with_default, KernelState,
    NonlinearFunction, PhysicalBase, ProcessKernel,
};
use crate::operators::diffusion::{MfdDiffusion, GRAVITY};
use crate::precon::{AssembledPrecon, PreconMode};
use crate::tree_vector::TreeVector;

/// Temperature at or below which infiltration is shut off.
pub const FREEZING_POINT: f64 = 273.15;

/// Bounds of an admissible pressure [Pa].
const PRESSURE_RANGE: (f64, f64) = (-1.0e9, 1.0e8);

/// Characteristic water content per unit volume [mol m^-3].
const WATER_CONTENT_SCALE: f64 = 55000.0;

/// When `darcy_flux` is recomputed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FluxUpdateMode {
    /// After every residual evaluation.
    Iteration,
    /// Once per accepted step.
    Timestep,
    /// Only when diagnostics are requested.
    Vis,
    /// Never.
    Never,
}

impl FluxUpdateMode {
    fn from_plist(plist: &ParameterList) -> Result<Self, ConfigError> {
        match plist.get_string_or("update flux mode", "iteration")?.as_str() {
            "iteration" => Ok(Self::Iteration),
            "timestep" => Ok(Self::Timestep),
            "vis" => Ok(Self::Vis),
            "never" => Ok(Self::Never),
            other => Err(plist.invalid(
                "update flux mode",
                format!("'{other}' is not one of \"iteration\", \"timestep\", \"vis\", \"never\""),
            )),
        }
    }
}

/// How cell mobilities become face coefficients.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KrelMethod {
    /// The upper cell of each interior face.
    UpwindGravity,
    /// Each half-face uses its own cell.
    CellCentered,
    /// The cell the current `darcy_flux` leaves.
    UpwindDarcyFlux,
    /// The average of both sides.
    ArithmeticMean,
}

impl KrelMethod {
    fn from_plist(plist: &ParameterList) -> Result<Self, ConfigError> {
        match plist
            .get_string_or("relative permeability method", "upwind with gravity")?
            .as_str()
        {
            "upwind with gravity" => Ok(Self::UpwindGravity),
            "cell centered" => Ok(Self::CellCentered),
            "upwind with Darcy flux" => Ok(Self::UpwindDarcyFlux),
            "arithmetic mean" => Ok(Self::ArithmeticMean),
            other => Err(plist.invalid(
                "relative permeability method",
                format!("unknown method '{other}'"),
            )),
        }
    }
}

/// How the top boundary talks to a surface kernel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SurfaceCoupling {
    /// Not coupled.
    None,
    /// Dirichlet: the face pressure is the surface pressure.
    Head,
    /// Neumann: the face flux is the exchange flux.
    Flux,
}

/// The Richards flow kernel.
pub struct Richards {
    base: PhysicalBase,
    water_content: Key,
    rel_perm: Key,
    molar_density: Key,
    viscosity: Key,
    mass_density: Key,
    permeability: Key,
    darcy_flux: Key,
    mass_source: Key,
    surface_pressure: Key,
    surface_flux: Key,
    temperature: Key,

    flux_mode: FluxUpdateMode,
    krel_method: KrelMethod,
    coupling: SurfaceCoupling,
    source_term: bool,
    explicit_source: bool,
    perm_scale: f64,
    predictor_consistent_faces: bool,
    predictor_flux_bcs: bool,
    predictor_initial_flux_bcs: bool,
    infiltrate_only_if_unfrozen: bool,

    bc_pressure: BcFunction,
    bc_flux: BcFunction,
    bc_seepage: BcFunction,
    bcs: BoundaryConditions,
    surface_mesh: Option<Arc<dyn Mesh>>,
    wrm_list: Option<ParameterList>,
    wrm: Option<VanGenuchten>,
    initial_condition: Option<ParameterList>,

    matrix: MfdDiffusion,
    precon: AssembledPrecon,
    jacobian: Option<DMatrix<f64>>,
    /// `n / mu` per cell, from the last coefficient update.
    n_over_mu: Vec<f64>,
    /// Face mobility used for boundary conditions.
    face_mobility: Vec<f64>,
}

impl std::fmt::Debug for Richards {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Richards")
            .field("base", &self.base)
            .field("flux_mode", &self.flux_mode)
            .field("krel_method", &self.krel_method)
            .field("coupling", &self.coupling)
            .finish()
    }
}

impl Richards {
    /// Read the configuration and look up the meshes. Invalid or
    /// conflicting options fail here.
    pub fn new(plist: &ParameterList, store: &StateStore) -> Result<Self, KernelError> {
        let base = PhysicalBase::new(plist, store, "pressure", "water_content", (1.0, 1.0))?;
        let domain = base.domain.clone();
        let key = |basename: &str, default: &str| read_key(plist, &domain, basename, default);

        let head = plist.get_bool_or("coupled to surface via head", false)?;
        let flux = plist.get_bool_or("coupled to surface via flux", false)?;
        let coupling = match (head, flux) {
            (true, true) => {
                return Err(ConfigError::Conflict {
                    reason: format!(
                        "{}: \"coupled to surface via head\" and \"coupled to surface via flux\" are mutually exclusive",
                        plist.name()
                    ),
                }
                .into())
            }
            (true, false) => SurfaceCoupling::Head,
            (false, true) => SurfaceCoupling::Flux,
            (false, false) => SurfaceCoupling::None,
        };
        let flux_mode = match coupling {
            // The exchange flux is read from darcy_flux every iteration.
            SurfaceCoupling::Head => FluxUpdateMode::Iteration,
            _ => FluxUpdateMode::from_plist(plist)?,
        };
        if plist.get_bool_or("modify predictor via water content", false)? {
            return Err(plist
                .invalid("modify predictor via water content", "this predictor is not available")
                .into());
        }

        let surface_domain = plist.get_string_or("surface domain name", "surface")?;
        let surface_mesh = match coupling {
            SurfaceCoupling::None => None,
            _ => Some(store.mesh(&surface_domain)?),
        };

        let bc_list = plist.sublist_or_empty("boundary conditions")?;
        let mesh = base.mesh.clone();
        let wrm_list = if plist.is_sublist("water retention evaluator") {
            Some(plist.sublist("water retention evaluator")?)
        } else {
            None
        };
        let wrm = match &wrm_list {
            Some(list) if list.is_sublist("WRM parameters") => {
                Some(VanGenuchten::from_plist(&list.sublist("WRM parameters")?)?)
            }
            Some(list) => Some(VanGenuchten::from_plist(list)?),
            None => None,
        };
        let initial_condition = if plist.is_sublist("initial condition") {
            Some(plist.sublist("initial condition")?)
        } else {
            None
        };

        let nfaces = mesh.num_entities(EntityKind::Face, Parallel::Used);
        let ncells = base.ncells();
        let source_term = plist.get_bool_or("source term", false)?;
        Ok(Self {
            water_content: base.conserved.clone(),
            rel_perm: key("relative permeability", "relative_permeability")?,
            molar_density: key("molar density liquid", "molar_density_liquid")?,
            viscosity: key("viscosity liquid", "viscosity_liquid")?,
            mass_density: key("mass density liquid", "mass_density_liquid")?,
            permeability: key("permeability", "permeability")?,
            darcy_flux: key("darcy flux", "darcy_flux")?,
            mass_source: key("mass source", "mass_source")?,
            surface_pressure: read_key(plist, &surface_domain, "surface pressure", "pressure")?,
            surface_flux: read_key(plist, &surface_domain, "surface-subsurface flux", "surface_subsurface_flux")?,
            temperature: key("temperature", "temperature")?,
            flux_mode,
            krel_method: KrelMethod::from_plist(plist)?,
            coupling,
            source_term,
            explicit_source: source_term && plist.get_bool_or("explicit source term", false)?,
            perm_scale: plist.get_f64_or("permeability rescaling", 1.0)?,
            predictor_consistent_faces: plist.get_bool_or("modify predictor with consistent faces", false)?,
            predictor_flux_bcs: plist.get_bool_or("modify predictor for flux BCs", false)?,
            predictor_initial_flux_bcs: plist.get_bool_or("modify predictor for initial flux BCs", false)?,
            infiltrate_only_if_unfrozen: bc_list.get_bool_or("infiltrate only if unfrozen", false)?,
            bc_pressure: BcFunction::from_category(&bc_list, "pressure", mesh.as_ref())?,
            bc_flux: BcFunction::from_category(&bc_list, "mass flux", mesh.as_ref())?,
            bc_seepage: BcFunction::from_category(&bc_list, "seepage face pressure", mesh.as_ref())?,
            bcs: BoundaryConditions::new(nfaces),
            surface_mesh,
            wrm_list,
            wrm,
            initial_condition,
            matrix: MfdDiffusion::new(mesh, Some(GRAVITY)),
            precon: AssembledPrecon::new(PreconMode::Schur),
            jacobian: None,
            n_over_mu: vec![1.0; ncells],
            face_mobility: vec![1.0; nfaces],
            base,
        })
    }

    /// The configured flux update mode.
    pub fn flux_mode(&self) -> FluxUpdateMode {
        self.flux_mode
    }

    /// The configured upwinding method.
    pub fn krel_method(&self) -> KrelMethod {
        self.krel_method
    }

    /// The surface coupling mode.
    pub fn coupling(&self) -> SurfaceCoupling {
        self.coupling
    }

    /// The retention model, when this kernel owns one.
    pub fn wrm(&self) -> Option<&VanGenuchten> {
        self.wrm.as_ref()
    }

    /// Boundary conditions from the last update.
    pub fn boundary_conditions(&self) -> &BoundaryConditions {
        &self.bcs
    }

    /// Key of the molar Darcy flux on faces.
    pub fn darcy_flux_key(&self) -> &Key {
        &self.darcy_flux
    }

    fn next(&self, key: &Key) -> KeyTag {
        key.at(&Tag::NEXT)
    }

    // ── Coefficients ───────────────────────────────────────────────

    /// Upwind `kr n / mu` onto faces and push permeability and density
    /// into the operator.
    fn update_coefficients(&mut self, store: &mut StateStore) -> Result<(), KernelError> {
        let krel = store.get_field(&self.next(&self.rel_perm))?.clone();
        let n = store.get_field(&self.next(&self.molar_density))?.view("cell")?.to_vec();
        let mu = store.get_field(&self.next(&self.viscosity))?.view("cell")?.to_vec();
        let perm = store.get_field(&self.next(&self.permeability))?.view("cell")?.to_vec();
        let rho = store.get_field(&self.next(&self.mass_density))?.view("cell")?.to_vec();
        let flux = match self.krel_method {
            KrelMethod::UpwindDarcyFlux => Some(store.get_field(&self.next(&self.darcy_flux))?.view("face")?.to_vec()),
            _ => None,
        };

        let kr_cell = krel.view("cell")?;
        let kr_bf = krel.component("boundary_face");
        self.n_over_mu = n.iter().zip(&mu).map(|(n, mu)| n / mu).collect();
        let cell_mob: Vec<f64> = kr_cell.iter().zip(&self.n_over_mu).map(|(k, r)| k * r).collect();

        let mesh = self.base.mesh.clone();
        for (f, mob) in self.face_mobility.iter_mut().enumerate() {
            let cells = mesh.face_cells(f);
            *mob = match cells.as_slice() {
                [c] => {
                    let boundary = boundary_face_index(mesh.as_ref(), f)
                        .and_then(|b| kr_bf.map(|kr| kr[b] * self.n_over_mu[*c]))
                        .unwrap_or(cell_mob[*c]);
                    match (&self.krel_method, &flux) {
                        (KrelMethod::UpwindDarcyFlux, Some(q)) if outward(mesh.as_ref(), *c, f) * q[f] > 0.0 => {
                            cell_mob[*c]
                        }
                        (KrelMethod::ArithmeticMean, _) => 0.5 * (cell_mob[*c] + boundary),
                        _ => boundary,
                    }
                }
                [a, b] => {
                    let (a, b) = (*a, *b);
                    match (&self.krel_method, &flux) {
                        (KrelMethod::UpwindGravity, _) => {
                            let (za, zb) = (mesh.cell_centroid(a)[2], mesh.cell_centroid(b)[2]);
                            if za > zb {
                                cell_mob[a]
                            } else if zb > za {
                                cell_mob[b]
                            } else {
                                0.5 * (cell_mob[a] + cell_mob[b])
                            }
                        }
                        (KrelMethod::UpwindDarcyFlux, Some(q)) => {
                            let out_of_a = outward(mesh.as_ref(), a, f) * q[f];
                            if out_of_a > 0.0 {
                                cell_mob[a]
                            } else if out_of_a < 0.0 {
                                cell_mob[b]
                            } else {
                                0.5 * (cell_mob[a] + cell_mob[b])
                            }
                        }
                        _ => 0.5 * (cell_mob[a] + cell_mob[b]),
                    }
                }
                _ => 1.0,
            };
        }

        if self.krel_method == KrelMethod::CellCentered {
            let face_mob = &self.face_mobility;
            self.matrix.set_half_face_coefficients(|c, f| {
                if mesh.face_cells(f).len() == 1 {
                    face_mob[f]
                } else {
                    cell_mob[c]
                }
            });
        } else {
            self.matrix.set_face_coefficients(&self.face_mobility)?;
        }
        let scaled: Vec<f64> = perm.iter().map(|k| k / self.perm_scale).collect();
        self.matrix.set_cell_coefficients(&scaled)?;
        self.matrix.set_density(Some(&rho))?;
        Ok(())
    }

    fn divide_by_mobility(&self, f: usize, value: f64) -> f64 {
        let k = self.face_mobility[f];
        if k > 0.0 {
            value / k
        } else {
            value
        }
    }

    fn parent_face(&self, surface: &dyn Mesh, c: usize) -> Result<usize, KernelError> {
        surface
            .entity_parent(EntityKind::Cell, c)
            .ok_or_else(|| MeshError::NoParent { kind: EntityKind::Cell, id: c }.into())
    }

    // ── Boundary conditions ────────────────────────────────────────

    /// Rebuild the boundary-condition table at time `t`.
    ///
    /// With `mobility_excluded`, Neumann values are divided by the face
    /// mobility, for operators assembled with unit face coefficients.
    pub fn update_boundary_conditions(
        &mut self,
        store: &mut StateStore,
        t: f64,
        mobility_excluded: bool,
    ) -> Result<(), KernelError> {
        let mut bcs = std::mem::take(&mut self.bcs);
        bcs.reset();

        for (f, v) in self.bc_pressure.values_at(t) {
            bcs.set_dirichlet(f, v);
        }

        let face_temperature = if self.infiltrate_only_if_unfrozen {
            Some(store.get_field(&self.next(&self.temperature))?.view("face")?.to_vec())
        } else {
            None
        };
        for (f, v) in self.bc_flux.values_at(t) {
            let v = match &face_temperature {
                Some(temp) if temp[f] <= FREEZING_POINT => 0.0,
                _ => v,
            };
            let v = if mobility_excluded { self.divide_by_mobility(f, v) } else { v };
            bcs.set_neumann(f, v);
        }

        if !self.bc_seepage.is_empty() {
            let pf = store.get_field(&self.base.primary_at(&Tag::NEXT))?.view("face")?.to_vec();
            for (f, v) in self.bc_seepage.values_at(t) {
                if pf[f] < v {
                    bcs.set_neumann(f, 0.0);
                } else {
                    bcs.set_dirichlet(f, v);
                }
            }
        }

        if let Some(surface) = self.surface_mesh.clone() {
            let ns = surface.num_entities(EntityKind::Cell, Parallel::Owned);
            match self.coupling {
                SurfaceCoupling::Head => {
                    let sp = store.get_field(&self.next(&self.surface_pressure))?.view("cell")?.to_vec();
                    for (c, p) in sp.iter().enumerate().take(ns) {
                        bcs.set_dirichlet(self.parent_face(surface.as_ref(), c)?, *p);
                    }
                }
                SurfaceCoupling::Flux => {
                    let q = store.get_field(&self.next(&self.surface_flux))?.view("cell")?.to_vec();
                    for (c, q) in q.iter().enumerate().take(ns) {
                        let f = self.parent_face(surface.as_ref(), c)?;
                        let v = q / self.base.mesh.face_area(f);
                        let v = if mobility_excluded { self.divide_by_mobility(f, v) } else { v };
                        bcs.set_neumann(f, v);
                    }
                }
                SurfaceCoupling::None => {}
            }
        }

        for &f in self.base.mesh.boundary_faces() {
            if bcs.kind(f) == BcKind::None {
                bcs.set_neumann(f, 0.0);
            }
        }
        trace!(kernel = %self.base.name, t, "boundary conditions updated");
        self.bcs = bcs;
        Ok(())
    }

    // ── Flux ───────────────────────────────────────────────────────

    fn update_flux(&mut self, store: &mut StateStore, p: &CompositeVector) -> Result<(), KernelError> {
        let flux = self.matrix.flux(p)?;
        store
            .primary_mut(&self.next(&self.darcy_flux))?
            .view_mut("face")?
            .copy_from_slice(&flux);
        Ok(())
    }

    fn refresh_flux(&mut self, store: &mut StateStore) -> Result<(), KernelError> {
        let p = store.get_field(&self.base.primary_at(&Tag::NEXT))?.clone();
        self.update_coefficients(store)?;
        self.update_flux(store, &p)
    }

    // ── Predictors ─────────────────────────────────────────────────

    /// Solve each flux-controlled face for the pressure that carries the
    /// imposed flux with the pressure-dependent face mobility.
    fn flux_bc_predictor(&mut self, store: &mut StateStore, t: f64, u: &mut TreeVector) -> Result<bool, KernelError> {
        let Some(model) = self.wrm.clone() else {
            return Ok(false);
        };
        self.base.solution_to_state(store, u, &Tag::NEXT)?;
        self.update_coefficients(store)?;
        self.update_boundary_conditions(store, t, false)?;
        let faces: Vec<(usize, f64)> = self
            .bc_flux
            .values_at(t)
            .filter(|&(f, _)| self.bcs.kind(f) == BcKind::Neumann)
            .map(|(f, _)| (f, self.bcs.value(f)))
            .collect();
        if faces.is_empty() {
            return Ok(false);
        }

        let data = u.leaf_data_mut()?;
        let uc = data.view("cell")?.to_vec();
        let uf = data.view_mut("face")?;
        let mesh = self.base.mesh.clone();
        let mut changed = false;
        for (f, value) in faces {
            let Some(&c) = mesh.face_cells(f).first() else {
                continue;
            };
            let target = value * mesh.face_area(f);
            let mobility = |pf: f64| model.k_relative_of_pressure(pf) * self.perm_scale * self.n_over_mu[c];
            let g = |pf: f64| {
                self.matrix
                    .boundary_flux(f, uc[c], pf, mobility(pf))
                    .map(|q| q - target)
            };
            let mut pf = uf[f];
            for _ in 0..FLUX_PREDICTOR_ITERATIONS {
                let Some(r) = g(pf) else { break };
                let h = 1.0e-7 * pf.abs().max(model.p_atm());
                let Some(rh) = g(pf + h) else { break };
                let slope = (rh - r) / h;
                if slope == 0.0 || !slope.is_finite() {
                    break;
                }
                let step = r / slope;
                pf -= step;
                if step.abs() <= 1.0e-10 * pf.abs().max(1.0) {
                    break;
                }
            }
            if pf.is_finite() && pf != uf[f] {
                uf[f] = pf;
                changed = true;
            }
        }
        debug!(kernel = %self.base.name, changed, "flux BC predictor");
        Ok(changed)
    }

    fn consistent_face_predictor(&mut self, store: &mut StateStore, t: f64, u: &mut TreeVector) -> Result<(), KernelError> {
        self.base.solution_to_state(store, u, &Tag::NEXT)?;
        self.update_coefficients(store)?;
        self.update_boundary_conditions(store, t, true)?;
        self.matrix.set_unit_face_coefficients();
        self.matrix.update_consistent_faces(u.leaf_data_mut()?, &self.bcs)?;
        debug!(kernel = %self.base.name, "consistent faces predictor");
        Ok(())
    }

    // ── Initialization ─────────────────────────────────────────────

    fn initial_pressure(&self, store: &StateStore, ic: &ParameterList) -> Result<CompositeVector, KernelError> {
        // The record is allocated but not yet set, so read it unchecked.
        let p_next = self.base.primary_at(&Tag::NEXT);
        let mut p = store
            .record(&p_next)
            .map(|r| r.data().clone())
            .ok_or(StateError::UnknownField { field: p_next })?;
        if ic.is_parameter("value") {
            p.put_scalar(ic.get_f64("value")?);
            return Ok(p);
        }
        let z_wt = ic.get_f64("water table elevation")?;
        let rho = ic.get_f64_or("density", 1000.0)?;
        let p_atm = self.wrm.as_ref().map_or(P_ATM, VanGenuchten::p_atm);
        let g = -GRAVITY[2];
        let mesh = &self.base.mesh;
        let hydrostatic = |z: f64| p_atm + rho * g * (z_wt - z);
        for (c, v) in p.view_mut("cell")?.iter_mut().enumerate() {
            *v = hydrostatic(mesh.cell_centroid(c)[2]);
        }
        if let Some(faces) = p.component_mut("face") {
            for (f, v) in faces.iter_mut().enumerate() {
                *v = hydrostatic(mesh.face_centroid(f)[2]);
            }
        }
        Ok(p)
    }
}

const FLUX_PREDICTOR_ITERATIONS: usize = 50;

/// `+1` when face `f`'s normal points out of cell `c`.
fn outward(mesh: &dyn Mesh, c: usize, f: usize) -> f64 {
    mesh.cell_faces_and_dirs(c)
        .iter()
        .find(|(face, _)| *face == f)
        .map_or(1.0, |(_, d)| f64::from(*d))
}

impl NonlinearFunction for Richards {
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
        self.update_coefficients(store)?;
        self.update_boundary_conditions(store, t_new, false)?;

        let p = u_new.leaf_data()?;
        let r = f.leaf_data_mut()?;
        self.matrix.residual(p, &self.bcs, r)?;

        let wc1 = store.get_field(&self.water_content.at(&Tag::NEXT))?.view("cell")?.to_vec();
        let wc0 = store.get_field(&self.water_content.at(&Tag::PREVIOUS))?.view("cell")?.to_vec();
        let rc = r.view_mut("cell")?;
        for ((r, w1), w0) in rc.iter_mut().zip(&wc1).zip(&wc0) {
            *r += (w1 - w0) / dt;
        }

        if self.source_term {
            let tag = if self.explicit_source { Tag::PREVIOUS } else { Tag::NEXT };
            let q = store.get_field(&self.mass_source.at(&tag))?.view("cell")?.to_vec();
            let vol = store.get_field(&self.base.cell_volume.at(&Tag::NEXT))?.view("cell")?.to_vec();
            for ((r, q), v) in rc.iter_mut().zip(&q).zip(&vol) {
                *r -= q * v;
            }
        }

        if self.flux_mode == FluxUpdateMode::Iteration {
            self.update_flux(store, p)?;
        }
        self.base.cache_for_enorm(store, dt)?;
        trace!(kernel = %self.base.name, t_new, "residual evaluated");
        Ok(())
    }

    fn update_precon(&mut self, store: &mut StateStore, t: f64, u: &TreeVector, dt: f64) -> Result<(), KernelError> {
        self.base.solution_to_state(store, u, &Tag::NEXT)?;
        self.update_coefficients(store)?;
        self.update_boundary_conditions(store, t, false)?;

        let ncells = self.base.ncells();
        let p_next = self.base.primary_at(&Tag::NEXT);
        let name = self.base.name.clone();
        let mut acc = cell_derivative_or_zero(store, &self.water_content.at(&Tag::NEXT), &p_next, &name, ncells)?;
        for a in &mut acc {
            *a /= dt;
        }
        let q_next = self.mass_source.at(&Tag::NEXT);
        if self.source_term && !self.explicit_source && store.is_dependency(&q_next, &p_next) {
            let dq = cell_derivative_or_zero(store, &q_next, &p_next, &name, ncells)?;
            let vol = store.get_field(&self.base.cell_volume.at(&Tag::NEXT))?.view("cell")?.to_vec();
            for ((a, d), v) in acc.iter_mut().zip(&dq).zip(&vol) {
                *a -= d * v;
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
        self.base.enorm_cells_faces(du, WATER_CONTENT_SCALE, 1.0, P_ATM)
    }

    fn is_admissible(&self, u: &TreeVector) -> bool {
        let Some((min, max)) = self.base.global_range(u) else {
            return true;
        };
        let ok = min >= PRESSURE_RANGE.0 && max <= PRESSURE_RANGE.1;
        if !ok {
            warn!(kernel = %self.base.name, min, max, "pressure out of admissible range");
        }
        ok
    }

    fn modify_predictor(&mut self, store: &mut StateStore, _dt: f64, u: &mut TreeVector) -> Result<bool, KernelError> {
        self.base.state = KernelState::PredictorPending;
        let t = store.time(&Tag::NEXT).unwrap_or(0.0);
        let mut changed = false;
        let flux_bcs = self.predictor_flux_bcs || (self.predictor_initial_flux_bcs && store.cycle() == 0);
        if flux_bcs {
            changed |= self.flux_bc_predictor(store, t, u)?;
        }
        if self.predictor_consistent_faces {
            self.consistent_face_predictor(store, t, u)?;
            changed = true;
        }
        Ok(changed)
    }
}

impl ProcessKernel for Richards {
    fn name(&self) -> &str {
        &self.base.name
    }

    fn setup(&mut self, store: &mut StateStore) -> Result<(), KernelError> {
        let domain = self.base.domain.clone();
        let name = self.base.name.clone();
        let cells = FieldShape::cells(&domain);
        let cells_faces = FieldShape::cells_and_faces(&domain);

        for tag in [Tag::NEXT, Tag::PREVIOUS] {
            require_primary(store, self.base.primary_at(&tag), cells_faces.clone(), &name)?;
        }
        require_primary(store, self.water_content.at(&Tag::PREVIOUS), cells.clone(), &name)?;
        require_primary(
            store,
            self.darcy_flux.at(&Tag::NEXT),
            FieldShape::on(&domain).with(EntityKind::Face),
            &name,
        )?;

        let mut wc_list = ParameterList::new(format!("{name}->water content"));
        wc_list
            .set("domain name", domain.as_str())
            .set("water content key", self.water_content.as_str())
            .set("cell volume key", self.base.cell_volume.as_str());
        require_with_default(store, self.water_content.at(&Tag::NEXT), cells.clone(), || {
            Ok(Box::new(RichardsWaterContent::new(&wc_list, &Tag::NEXT)?))
        })?;
        let cv = self.base.cell_volume.at(&Tag::NEXT);
        require_with_default(store, cv.clone(), cells.clone(), || Ok(Box::new(CellVolume::new(cv))))?;

        let kr = self.rel_perm.at(&Tag::NEXT);
        store.require(kr.clone(), FieldShape::cells_and_boundary_faces(&domain), None)?;
        if let Some(list) = &self.wrm_list {
            let mut list = list.clone();
            list.set("domain name", domain.as_str())
                .set("pressure key", self.base.primary.as_str())
                .set("relative permeability key", self.rel_perm.as_str());
            if !list.is_parameter("permeability rescaling") {
                list.set("permeability rescaling", self.perm_scale);
            }
            let wrm = WrmEvaluator::new(&list, &Tag::NEXT)?;
            if needs_evaluator(store, &wrm.provides()[0]) {
                store.register_evaluator(Box::new(wrm))?;
            }
            if needs_evaluator(store, &kr) {
                store.register_evaluator(Box::new(RelPermEvaluator::new(&list, &Tag::NEXT)?))?;
            }
        }

        for key in [&self.molar_density, &self.viscosity, &self.mass_density, &self.permeability] {
            store.require(key.at(&Tag::NEXT), cells.clone(), None)?;
        }
        if self.source_term {
            let tag = if self.explicit_source { Tag::PREVIOUS } else { Tag::NEXT };
            store.require(self.mass_source.at(&tag), cells.clone(), None)?;
        }
        if let Some(surface) = &self.surface_mesh {
            let surface_cells = FieldShape::cells(surface.name());
            match self.coupling {
                SurfaceCoupling::Head => store.require(self.next(&self.surface_pressure), surface_cells, None)?,
                SurfaceCoupling::Flux => store.require(self.next(&self.surface_flux), surface_cells, None)?,
                SurfaceCoupling::None => {}
            }
        }
        if self.infiltrate_only_if_unfrozen {
            store.require(self.next(&self.temperature), cells_faces, None)?;
        }
        debug!(kernel = %name, domain = %domain, "richards setup");
        Ok(())
    }

    fn initialize(&mut self, store: &mut StateStore) -> Result<(), KernelError> {
        let p_next = self.base.primary_at(&Tag::NEXT);
        match &self.initial_condition {
            Some(ic) => {
                let p = self.initial_pressure(store, ic)?;
                store.set_primary(&p_next, &p)?;
            }
            None if store.record(&p_next).is_some_and(|r| r.is_initialized()) => {}
            None => {
                return Err(ConfigError::MissingParameter {
                    list: self.base.name.clone(),
                    name: "initial condition".to_string(),
                }
                .into())
            }
        }
        store.copy_field(&self.base.primary, &Tag::NEXT, &Tag::PREVIOUS)?;
        store.set_scalar(&self.next(&self.darcy_flux), 0.0)?;
        store.copy_field(&self.water_content, &Tag::NEXT, &Tag::PREVIOUS)?;
        self.base.state = KernelState::Initialized;
        debug!(kernel = %self.base.name, "richards initialized");
        Ok(())
    }

    fn state_to_solution(&self, store: &mut StateStore, tag: &Tag) -> Result<TreeVector, KernelError> {
        self.base.state_to_solution(store, tag)
    }

    fn solution_to_state(&mut self, store: &mut StateStore, u: &TreeVector, tag: &Tag) -> Result<(), KernelError> {
        self.base.solution_to_state(store, u, tag)
    }

    fn commit_state(&mut self, store: &mut StateStore, _dt: f64) -> Result<(), KernelError> {
        if self.flux_mode == FluxUpdateMode::Timestep {
            self.refresh_flux(store)?;
        }
        self.base.state = KernelState::Converged;
        Ok(())
    }

    fn calculate_diagnostics(&mut self, store: &mut StateStore) -> Result<(), KernelError> {
        if self.flux_mode == FluxUpdateMode::Vis {
            self.refresh_flux(store)?;
        }
        Ok(())
    }

    fn primary_key(&self) -> Option<&Key> {
        Some(&self.base.primary)
    }

    fn conserved_key(&self) -> Option<&Key> {
        Some(&self.water_content)
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

#[cfg(test)]
mod tests {
    use super::*;

    use hydrograph_mesh::{ColumnMesh, SurfaceMesh};

    const FIELDS: &str = r#"{
        "water_content": {"field evaluator type": "primary variable"},
        "relative_permeability": {"field evaluator type": "constant", "value": 1.0},
        "molar_density_liquid": {"field evaluator type": "constant", "value": 1.0},
        "viscosity_liquid": {"field evaluator type": "constant", "value": 1.0},
        "mass_density_liquid": {"field evaluator type": "constant", "value": 0.0},
        "permeability": {"field evaluator type": "constant", "value": 1.0},
        "surface-pressure": {"field evaluator type": "primary variable"}
    }"#;

    fn column_store(ncells: usize) -> StateStore {
        let fields = ParameterList::from_json("field evaluators", FIELDS).unwrap();
        let mut store = StateStore::new().with_evaluator_list(fields);
        let column = ColumnMesh::uniform("domain", 0.0, 1.0, ncells).unwrap();
        let surface = SurfaceMesh::from_faces("surface", &column, vec![column.top_face()]).unwrap();
        store.register_mesh(Arc::new(column));
        store.register_mesh(Arc::new(surface));
        store
    }

    fn config_error(config: &str) -> ConfigError {
        let plist = ParameterList::from_json("flow", config).unwrap();
        match Richards::new(&plist, &column_store(1)) {
            Err(KernelError::Config(e)) => e,
            other => panic!("expected a configuration error, got {other:?}"),
        }
    }

    /// Set up, fill the water content and initialize.
    fn ready(config: &str, ncells: usize) -> (StateStore, Richards) {
        let mut store = column_store(ncells);
        let plist = ParameterList::from_json("flow", config).unwrap();
        let mut pk = Richards::new(&plist, &store).unwrap();
        pk.setup(&mut store).unwrap();
        store.setup().unwrap();
        store.set_scalar(&KeyTag::new("water_content", Tag::NEXT), 1000.0).unwrap();
        pk.initialize(&mut store).unwrap();
        (store, pk)
    }

    fn pressure(cells: Vec<f64>, faces: Vec<f64>) -> TreeVector {
        let data =
            CompositeVector::from_components(FieldShape::cells_and_faces("domain"), vec![cells, faces]).unwrap();
        TreeVector::leaf("flow", data)
    }

    #[test]
    fn both_couplings_conflict() {
        let e = config_error(r#"{"coupled to surface via head": true, "coupled to surface via flux": true}"#);
        assert!(matches!(e, ConfigError::Conflict { .. }), "got {e:?}");
    }

    #[test]
    fn unknown_modes_are_rejected() {
        match config_error(r#"{"update flux mode": "sometimes"}"#) {
            ConfigError::InvalidValue { name, .. } => assert_eq!(name, "update flux mode"),
            other => panic!("expected InvalidValue, got {other:?}"),
        }
        match config_error(r#"{"relative permeability method": "harmonic mean"}"#) {
            ConfigError::InvalidValue { name, .. } => assert_eq!(name, "relative permeability method"),
            other => panic!("expected InvalidValue, got {other:?}"),
        }
    }

    #[test]
    fn water_content_predictor_is_unavailable() {
        match config_error(r#"{"modify predictor via water content": true}"#) {
            ConfigError::InvalidValue { name, .. } => assert_eq!(name, "modify predictor via water content"),
            other => panic!("expected InvalidValue, got {other:?}"),
        }
    }

    #[test]
    fn modes_are_read() {
        let plist = ParameterList::from_json(
            "flow",
            r#"{"update flux mode": "vis", "relative permeability method": "cell centered"}"#,
        )
        .unwrap();
        let pk = Richards::new(&plist, &column_store(1)).unwrap();
        assert_eq!(pk.flux_mode(), FluxUpdateMode::Vis);
        assert_eq!(pk.krel_method(), KrelMethod::CellCentered);
        assert_eq!(pk.coupling(), SurfaceCoupling::None);
    }

    #[test]
    fn head_coupling_forces_iteration_flux_updates() {
        let plist = ParameterList::from_json(
            "flow",
            r#"{"coupled to surface via head": true, "update flux mode": "never"}"#,
        )
        .unwrap();
        let pk = Richards::new(&plist, &column_store(1)).unwrap();
        assert_eq!(pk.coupling(), SurfaceCoupling::Head);
        assert_eq!(pk.flux_mode(), FluxUpdateMode::Iteration);
    }

    #[test]
    fn remaining_boundary_faces_get_zero_flux() {
        let (mut store, mut pk) = ready(
            r#"{"initial condition": {"value": 101325.0},
                "boundary conditions": {"pressure": {"base": {"boundary": "bottom", "value": 90000.0}}}}"#,
            2,
        );
        pk.update_boundary_conditions(&mut store, 0.0, false).unwrap();
        let bcs = pk.boundary_conditions();
        assert_eq!(bcs.kind(0), BcKind::Dirichlet);
        assert_eq!(bcs.value(0), 90000.0);
        assert_eq!(bcs.kind(1), BcKind::None);
        assert_eq!(bcs.kind(2), BcKind::Neumann);
        assert_eq!(bcs.value(2), 0.0);
    }

    #[test]
    fn head_coupling_pins_the_parent_face() {
        let (mut store, mut pk) = ready(
            r#"{"initial condition": {"value": 101325.0}, "coupled to surface via head": true}"#,
            2,
        );
        store.set_scalar(&KeyTag::new("surface-pressure", Tag::NEXT), 101500.0).unwrap();
        pk.update_boundary_conditions(&mut store, 0.0, false).unwrap();
        let bcs = pk.boundary_conditions();
        assert_eq!(bcs.kind(2), BcKind::Dirichlet);
        assert_eq!(bcs.value(2), 101500.0);
        assert_eq!(bcs.kind(0), BcKind::Neumann);
    }

    #[test]
    fn pressure_bounds_gate_admissibility() {
        let (_store, pk) = ready(r#"{"initial condition": {"value": 101325.0}}"#, 1);
        assert!(pk.is_admissible(&pressure(vec![101325.0], vec![101325.0; 2])));
        assert!(!pk.is_admissible(&pressure(vec![-2.0e9], vec![101325.0; 2])));
        assert!(!pk.is_admissible(&pressure(vec![101325.0], vec![2.0e8, 0.0])));
        // Both bounds are inclusive.
        assert!(pk.is_admissible(&pressure(vec![-1.0e9], vec![101325.0; 2])));
        assert!(pk.is_admissible(&pressure(vec![1.0e8], vec![-1.0e9, 1.0e8])));
    }

    #[test]
    fn non_finite_trials_are_rejected() {
        let (mut store, mut pk) = ready(r#"{"initial condition": {"value": 101325.0}}"#, 1);
        assert!(!pk.is_admissible(&pressure(vec![f64::NAN], vec![f64::NAN; 2])));
        assert!(!pk.is_admissible(&pressure(vec![f64::NAN], vec![101325.0; 2])));
        assert!(!pk.is_admissible(&pressure(vec![101325.0], vec![101325.0, f64::INFINITY])));

        let u = pk.state_to_solution(&mut store, &Tag::NEXT).unwrap();
        let mut r = u.zeros_like();
        pk.fun(&mut store, 0.0, 3600.0, None, &u, &mut r).unwrap();
        assert_eq!(pk.enorm(&u, &pressure(vec![f64::NAN], vec![f64::NAN; 2])), f64::INFINITY);
        assert_eq!(pk.enorm(&u, &pressure(vec![0.0], vec![0.0, f64::NAN])), f64::INFINITY);
        assert_eq!(pk.enorm(&u, &pressure(vec![0.0], vec![0.0; 2])), 0.0);
    }

    #[test]
    fn value_initial_condition_fills_both_tags() {
        let (mut store, _pk) = ready(r#"{"initial condition": {"value": 95000.0}}"#, 2);
        for tag in [Tag::NEXT, Tag::PREVIOUS] {
            let p = store.get_field(&KeyTag::new("pressure", tag)).unwrap();
            assert_eq!(p.view("cell").unwrap(), &[95000.0; 2]);
            assert_eq!(p.view("face").unwrap(), &[95000.0; 3]);
        }
    }

    /// Water content `1e-3 p` and constant coefficients: the residual is
    /// linear in pressure and the assembled Jacobian is exact.
    const LINEAR_FIELDS: &str = r#"{
        "water_content": {"field evaluator type": "multiplicative",
                          "evaluator dependencies": ["pressure"], "coefficient": 1.0e-3},
        "relative_permeability": {"field evaluator type": "constant", "value": 1.0},
        "molar_density_liquid": {"field evaluator type": "constant", "value": 1.0},
        "viscosity_liquid": {"field evaluator type": "constant", "value": 1.0},
        "mass_density_liquid": {"field evaluator type": "constant", "value": 1000.0},
        "permeability": {"field evaluator type": "constant", "value": 1.0}
    }"#;

    #[test]
    fn preconditioner_inverts_the_residual_change() {
        let fields = ParameterList::from_json("field evaluators", LINEAR_FIELDS).unwrap();
        let mut store = StateStore::new()
            .with_factory(hydrograph_evaluators::default_factory())
            .with_evaluator_list(fields);
        store.register_mesh(Arc::new(ColumnMesh::uniform("domain", 0.0, 1.0, 3).unwrap()));
        let plist = ParameterList::from_json(
            "flow",
            r#"{"initial condition": {"value": 101325.0},
                "boundary conditions": {"pressure": {"base": {"boundary": "bottom", "value": 101325.0}}}}"#,
        )
        .unwrap();
        let mut pk = Richards::new(&plist, &store).unwrap();
        pk.setup(&mut store).unwrap();
        store.setup().unwrap();
        pk.initialize(&mut store).unwrap();

        let (t0, t1) = (0.0, 10.0);
        let u = pressure(vec![101000.0, 101500.0, 102000.0], vec![100900.0, 101200.0, 101800.0, 102100.0]);
        let mut r0 = u.zeros_like();
        pk.fun(&mut store, t0, t1, None, &u, &mut r0).unwrap();
        pk.update_precon(&mut store, t1, &u, t1 - t0).unwrap();

        let delta = pressure(vec![2.0, -3.0, 1.0], vec![0.5, 0.0, -1.0, 2.0]);
        let mut shifted = u.clone();
        shifted.update(1.0, &delta, 1.0).unwrap();
        let mut dr = u.zeros_like();
        pk.fun(&mut store, t0, t1, None, &shifted, &mut dr).unwrap();
        dr.update(-1.0, &r0, 1.0).unwrap();

        let mut du = u.zeros_like();
        pk.precon(&dr, &mut du).unwrap();
        for (got, want) in du.values().zip(delta.values()) {
            assert!((got - want).abs() < 1e-6, "{got} vs {want}");
        }
    }

    #[test]
    fn uniform_pressure_at_rest_has_no_residual() {
        let (mut store, mut pk) = ready(
            r#"{"initial condition": {"value": 101325.0},
                "boundary conditions": {"pressure": {"all": {"boundary": "all", "value": 101325.0}}}}"#,
            1,
        );
        let u = pk.state_to_solution(&mut store, &Tag::NEXT).unwrap();
        let mut r = u.zeros_like();
        pk.fun(&mut store, 0.0, 3600.0, None, &u, &mut r).unwrap();
        assert!(r.norm_inf() < 1e-9, "residual {r:?}");
        assert_eq!(pk.enorm(&u, &r), 0.0);
        let q = store.field(&KeyTag::new("darcy_flux", Tag::NEXT)).unwrap();
        assert!(q.norm_inf() < 1e-9);
    }

    #[test]
    fn steady_single_cell_step_converges_immediately() {
        let (mut store, mut pk) = ready(r#"{"initial condition": {"value": 101325.0}}"#, 1);
        let mut bdf = crate::bdf::Bdf1Integrator::new(crate::bdf::Bdf1Config::default());
        match bdf.step(&mut pk, &mut store, 0.0, 3600.0).unwrap() {
            crate::error::StepOutcome::Converged { iterations, enorm } => {
                assert_eq!(iterations, 0);
                assert!(enorm < 1.0);
            }
            other => panic!("expected Converged, got {other:?}"),
        }
        let p = store.field(&KeyTag::new("pressure", Tag::NEXT)).unwrap();
        assert_eq!(p.view("cell").unwrap(), &[101325.0]);
    }

    #[test]
    fn water_table_gives_hydrostatic_cells() {
        let (mut store, pk) = ready(
            r#"{"initial condition": {"water table elevation": 1.0, "density": 1000.0}}"#,
            2,
        );
        let u = pk.state_to_solution(&mut store, &Tag::PREVIOUS).unwrap();
        let cells = u.leaf_data().unwrap().view("cell").unwrap();
        // Cell centroids at 0.25 and 0.75.
        let g = 9.80665;
        assert!((cells[0] - (P_ATM + 1000.0 * g * 0.75)).abs() < 1e-6);
        assert!((cells[1] - (P_ATM + 1000.0 * g * 0.25)).abs() < 1e-6);
    }

    #[test]
    fn missing_initial_condition_fails() {
        let mut store = column_store(1);
        let mut pk = Richards::new(&ParameterList::new("flow"), &store).unwrap();
        pk.setup(&mut store).unwrap();
        store.setup().unwrap();
        match pk.initialize(&mut store) {
            Err(KernelError::Config(ConfigError::MissingParameter { name, .. })) => {
                assert_eq!(name, "initial condition")
            }
            other => panic!("expected MissingParameter, got {other:?}"),
        }
    }
}
