//! A linear storage kernel for integrator and coupler tests.
//!
//! `C du/dt = -k u` on the cells of one mesh, `"domain"` unless set. Backward Euler gives
//! `u1 = C u0 / (C + k dt)`, and the exact preconditioner makes every
//! step converge in one update.

use std::cell::Cell;

use hydrograph_core::{FieldShape, Key, Tag};
use hydrograph_pk::kernel::require_primary;
use hydrograph_pk::{KernelError, KernelState, NonlinearFunction, ProcessKernel, SolverError, TreeVector};
use hydrograph_state::StateStore;
use nalgebra::DMatrix;

#[derive(Debug)]
pub struct LinearStorageKernel {
    name: String,
    key: Key,
    domain: String,
    capacity: f64,
    decay: f64,
    initial: f64,
    atol: f64,
    ncells: usize,
    diag: f64,
    jacobian: Option<DMatrix<f64>>,
    forced_failures: Cell<u32>,
    commits: u32,
    state: KernelState,
}

impl LinearStorageKernel {
    /// Kernel `name` on field `key` with storage `capacity`, rate `decay`
    /// and initial value `initial`.
    pub fn new(name: &str, key: &str, capacity: f64, decay: f64, initial: f64) -> Self {
        Self {
            name: name.to_string(),
            key: Key::from(key),
            domain: "domain".to_string(),
            capacity,
            decay,
            initial,
            atol: 1e-10,
            ncells: 0,
            diag: 1.0,
            jacobian: None,
            forced_failures: Cell::new(0),
            commits: 0,
            state: KernelState::Setup,
        }
    }

    /// Live on the cells of `domain` instead.
    pub fn on_domain(mut self, domain: &str) -> Self {
        self.domain = domain.to_string();
        self
    }

    /// Report the next `n` trial solutions as inadmissible.
    pub fn fail_next(&self, n: u32) {
        self.forced_failures.set(n);
    }

    /// Accepted steps so far.
    pub fn commits(&self) -> u32 {
        self.commits
    }

    pub fn key(&self) -> &Key {
        &self.key
    }

    /// Closed-form backward Euler step.
    pub fn exact_step(&self, u0: f64, dt: f64) -> f64 {
        self.capacity * u0 / (self.capacity + self.decay * dt)
    }
}

impl NonlinearFunction for LinearStorageKernel {
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
        let u0 = store.get_field(&self.key.at(&Tag::PREVIOUS))?.view("cell")?.to_vec();
        let u1 = u_new.leaf_data()?.view("cell")?;
        let r = f.leaf_data_mut()?.view_mut("cell")?;
        for ((r, u1), u0) in r.iter_mut().zip(u1).zip(&u0) {
            *r = self.capacity * (u1 - u0) / dt + self.decay * u1;
        }
        Ok(())
    }

    fn update_precon(&mut self, _store: &mut StateStore, _t: f64, _u: &TreeVector, dt: f64) -> Result<(), KernelError> {
        self.diag = self.capacity / dt + self.decay;
        self.jacobian = Some(DMatrix::from_diagonal_element(self.ncells, self.ncells, self.diag));
        Ok(())
    }

    fn precon(&self, r: &TreeVector, pu: &mut TreeVector) -> Result<(), SolverError> {
        if self.diag == 0.0 {
            return Err(SolverError::Singular { size: self.ncells });
        }
        pu.assign(r).map_err(|_| SolverError::DimensionMismatch {
            expected: pu.len(),
            got: r.len(),
        })?;
        pu.scale(1.0 / self.diag);
        Ok(())
    }

    fn enorm(&self, _u: &TreeVector, du: &TreeVector) -> f64 {
        du.norm_inf() / self.atol
    }

    fn is_admissible(&self, _u: &TreeVector) -> bool {
        let n = self.forced_failures.get();
        if n > 0 {
            self.forced_failures.set(n - 1);
            return false;
        }
        true
    }
}

impl ProcessKernel for LinearStorageKernel {
    fn name(&self) -> &str {
        &self.name
    }

    fn setup(&mut self, store: &mut StateStore) -> Result<(), KernelError> {
        self.ncells = store
            .mesh(&self.domain)?
            .num_entities(hydrograph_core::EntityKind::Cell, hydrograph_mesh::Parallel::Owned);
        for tag in [Tag::NEXT, Tag::PREVIOUS] {
            require_primary(store, self.key.at(&tag), FieldShape::cells(&self.domain), &self.name)?;
        }
        Ok(())
    }

    fn initialize(&mut self, store: &mut StateStore) -> Result<(), KernelError> {
        store.set_scalar(&self.key.at(&Tag::NEXT), self.initial)?;
        store.copy_field(&self.key, &Tag::NEXT, &Tag::PREVIOUS)?;
        self.state = KernelState::Initialized;
        Ok(())
    }

    fn state_to_solution(&self, store: &mut StateStore, tag: &Tag) -> Result<TreeVector, KernelError> {
        let data = store.get_field(&self.key.at(tag))?.clone();
        Ok(TreeVector::leaf(self.name.clone(), data))
    }

    fn solution_to_state(&mut self, store: &mut StateStore, u: &TreeVector, tag: &Tag) -> Result<(), KernelError> {
        store.set_primary(&self.key.at(tag), u.leaf_data()?)?;
        Ok(())
    }

    fn commit_state(&mut self, _store: &mut StateStore, _dt: f64) -> Result<(), KernelError> {
        self.commits += 1;
        self.state = KernelState::Converged;
        Ok(())
    }

    fn primary_key(&self) -> Option<&Key> {
        Some(&self.key)
    }

    fn conserved_key(&self) -> Option<&Key> {
        Some(&self.key)
    }

    fn jacobian(&self) -> Option<&DMatrix<f64>> {
        self.jacobian.as_ref()
    }

    fn state(&self) -> KernelState {
        self.state
    }

    fn set_state(&mut self, state: KernelState) {
        self.state = state;
    }
}
