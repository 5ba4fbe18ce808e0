//! Field shapes and the [`CompositeVector`] value container.
//!
//! A field lives on one mesh (its *domain*) and carries one or more named
//! components, each sized by a mesh entity kind: cells, faces, boundary
//! faces, or a single global value.

use smallvec::SmallVec;

use crate::error::StateError;

/// `op(a, b)`, or NaN when either side is NaN.
///
/// `f64::min` and `f64::max` drop NaN operands; reductions over trial
/// solutions must not.
pub fn nan_or(a: f64, b: f64, op: impl Fn(f64, f64) -> f64) -> f64 {
    if a.is_nan() || b.is_nan() {
        f64::NAN
    } else {
        op(a, b)
    }
}

/// Kind of mesh entity a component is sized by.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EntityKind {
    /// One value per cell.
    Cell,
    /// One value per face.
    Face,
    /// One value per face on the domain boundary.
    BoundaryFace,
    /// A single value independent of the mesh.
    Global,
}

impl EntityKind {
    /// Conventional component name for this kind.
    pub fn default_name(self) -> &'static str {
        match self {
            Self::Cell => "cell",
            Self::Face => "face",
            Self::BoundaryFace => "boundary_face",
            Self::Global => "global",
        }
    }
}

/// One named component of a field.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ComponentSpec {
    /// Component name, e.g. `"cell"`.
    pub name: String,
    /// Entity kind the component is sized by.
    pub kind: EntityKind,
}

/// Structure of a field: its domain and its components.
///
/// Shapes are accumulated during setup. Several consumers may require the
/// same field with different components; [`merge`](FieldShape::merge)
/// forms the union.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FieldShape {
    /// Mesh domain name. `None` for mesh-independent (global) fields.
    pub domain: Option<String>,
    /// Components in declaration order.
    pub components: SmallVec<[ComponentSpec; 2]>,
}

impl FieldShape {
    /// A shape on `domain` with no components yet.
    pub fn on(domain: impl Into<String>) -> Self {
        Self {
            domain: Some(domain.into()),
            components: SmallVec::new(),
        }
    }

    /// Cell-only shape on `domain`.
    pub fn cells(domain: impl Into<String>) -> Self {
        Self::on(domain).with(EntityKind::Cell)
    }

    /// Cell and face shape on `domain`, the layout of mixed unknowns.
    pub fn cells_and_faces(domain: impl Into<String>) -> Self {
        Self::on(domain)
            .with(EntityKind::Cell)
            .with(EntityKind::Face)
    }

    /// Cell and boundary-face shape on `domain`.
    pub fn cells_and_boundary_faces(domain: impl Into<String>) -> Self {
        Self::on(domain)
            .with(EntityKind::Cell)
            .with(EntityKind::BoundaryFace)
    }

    /// A single global scalar.
    pub fn scalar() -> Self {
        Self {
            domain: None,
            components: SmallVec::from_iter([ComponentSpec {
                name: EntityKind::Global.default_name().to_string(),
                kind: EntityKind::Global,
            }]),
        }
    }

    /// Add a component with the conventional name for `kind`.
    pub fn with(self, kind: EntityKind) -> Self {
        self.with_component(kind.default_name(), kind)
    }

    /// Add a named component. Duplicate names are ignored.
    pub fn with_component(mut self, name: impl Into<String>, kind: EntityKind) -> Self {
        let name = name.into();
        if !self.has_component(&name) {
            self.components.push(ComponentSpec { name, kind });
        }
        self
    }

    /// Whether a component with this name exists.
    pub fn has_component(&self, name: &str) -> bool {
        self.components.iter().any(|c| c.name == name)
    }

    /// Whether no components have been declared.
    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    /// Union `other` into `self`.
    ///
    /// Fails if the domains disagree or a component name is reused with a
    /// different entity kind.
    pub fn merge(&mut self, other: &FieldShape) -> Result<(), String> {
        match (&self.domain, &other.domain) {
            (Some(a), Some(b)) if a != b => {
                return Err(format!("domain '{a}' conflicts with '{b}'"));
            }
            (None, Some(b)) => self.domain = Some(b.clone()),
            _ => {}
        }
        for comp in &other.components {
            match self.components.iter().find(|c| c.name == comp.name) {
                Some(existing) if existing.kind != comp.kind => {
                    return Err(format!(
                        "component '{}' declared as {:?} and {:?}",
                        comp.name, existing.kind, comp.kind
                    ));
                }
                Some(_) => {}
                None => self.components.push(comp.clone()),
            }
        }
        Ok(())
    }
}

/// Values of a field, stored per component.
///
/// Components are stored in the order of the shape they were built from.
/// All binary operations require both operands to have the same component
/// names and lengths.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CompositeVector {
    shape: FieldShape,
    data: SmallVec<[Vec<f64>; 2]>,
}

impl CompositeVector {
    /// Allocate a zeroed vector, sizing each component with `len_of`.
    pub fn zeros(shape: FieldShape, mut len_of: impl FnMut(EntityKind) -> usize) -> Self {
        let data = shape
            .components
            .iter()
            .map(|c| vec![0.0; len_of(c.kind)])
            .collect();
        Self { shape, data }
    }

    /// Build from explicit per-component data, in shape order.
    pub fn from_components(shape: FieldShape, data: Vec<Vec<f64>>) -> Result<Self, String> {
        if data.len() != shape.components.len() {
            return Err(format!(
                "shape has {} components, got {} data arrays",
                shape.components.len(),
                data.len()
            ));
        }
        Ok(Self {
            shape,
            data: data.into_iter().collect(),
        })
    }

    /// A zeroed vector with the same structure as `self`.
    pub fn zeros_like(&self) -> Self {
        Self {
            shape: self.shape.clone(),
            data: self.data.iter().map(|d| vec![0.0; d.len()]).collect(),
        }
    }

    /// The shape this vector was built from.
    pub fn shape(&self) -> &FieldShape {
        &self.shape
    }

    /// Whether a component with this name exists.
    pub fn has_component(&self, name: &str) -> bool {
        self.shape.has_component(name)
    }

    fn index_of(&self, name: &str) -> Option<usize> {
        self.shape.components.iter().position(|c| c.name == name)
    }

    /// Read-only view of one component.
    pub fn component(&self, name: &str) -> Option<&[f64]> {
        self.index_of(name).map(|i| self.data[i].as_slice())
    }

    /// Mutable view of one component.
    pub fn component_mut(&mut self, name: &str) -> Option<&mut [f64]> {
        self.index_of(name).map(move |i| self.data[i].as_mut_slice())
    }

    /// Like [`component`](Self::component), but a missing component is an error.
    pub fn view(&self, name: &str) -> Result<&[f64], StateError> {
        self.component(name).ok_or_else(|| StateError::ShapeMismatch {
            reason: format!("no component '{name}'"),
        })
    }

    /// Like [`component_mut`](Self::component_mut), but a missing component is an error.
    pub fn view_mut(&mut self, name: &str) -> Result<&mut [f64], StateError> {
        match self.index_of(name) {
            Some(i) => Ok(self.data[i].as_mut_slice()),
            None => Err(StateError::ShapeMismatch {
                reason: format!("no component '{name}'"),
            }),
        }
    }

    /// Iterate `(spec, values)` pairs in component order.
    pub fn components(&self) -> impl Iterator<Item = (&ComponentSpec, &[f64])> {
        self.shape
            .components
            .iter()
            .zip(self.data.iter().map(|d| d.as_slice()))
    }

    /// Iterate `(spec, values)` pairs mutably.
    pub fn components_mut(&mut self) -> impl Iterator<Item = (&ComponentSpec, &mut Vec<f64>)> {
        self.shape.components.iter().zip(self.data.iter_mut())
    }

    /// Total number of values across all components.
    pub fn len(&self) -> usize {
        self.data.iter().map(|d| d.len()).sum()
    }

    /// Whether the vector holds no values.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Set every value to `value`.
    pub fn put_scalar(&mut self, value: f64) {
        for d in &mut self.data {
            d.fill(value);
        }
    }

    /// Multiply every value by `alpha`.
    pub fn scale(&mut self, alpha: f64) {
        for d in &mut self.data {
            for v in d.iter_mut() {
                *v *= alpha;
            }
        }
    }

    fn check_compatible(&self, other: &CompositeVector) -> Result<(), StateError> {
        let same = self.shape.components.len() == other.shape.components.len()
            && self
                .components()
                .zip(other.components())
                .all(|((a, da), (b, db))| a.name == b.name && da.len() == db.len());
        if same {
            Ok(())
        } else {
            Err(StateError::ShapeMismatch {
                reason: "vectors have different components or lengths".to_string(),
            })
        }
    }

    /// `self = alpha * other + beta * self`.
    pub fn update(&mut self, alpha: f64, other: &CompositeVector, beta: f64) -> Result<(), StateError> {
        self.check_compatible(other)?;
        for (d, o) in self.data.iter_mut().zip(other.data.iter()) {
            for (v, x) in d.iter_mut().zip(o) {
                *v = alpha * x + beta * *v;
            }
        }
        Ok(())
    }

    /// `self = a .* b + gamma * self`, element by element.
    pub fn multiply(
        &mut self,
        a: &CompositeVector,
        b: &CompositeVector,
        gamma: f64,
    ) -> Result<(), StateError> {
        self.check_compatible(a)?;
        self.check_compatible(b)?;
        for ((d, x), y) in self.data.iter_mut().zip(a.data.iter()).zip(b.data.iter()) {
            for ((v, xa), yb) in d.iter_mut().zip(x).zip(y) {
                *v = xa * yb + gamma * *v;
            }
        }
        Ok(())
    }

    /// Copy `other`'s values into `self`.
    pub fn assign(&mut self, other: &CompositeVector) -> Result<(), StateError> {
        self.check_compatible(other)?;
        for (d, o) in self.data.iter_mut().zip(other.data.iter()) {
            d.copy_from_slice(o);
        }
        Ok(())
    }

    /// Dot product over all components.
    pub fn dot(&self, other: &CompositeVector) -> Result<f64, StateError> {
        self.check_compatible(other)?;
        Ok(self
            .data
            .iter()
            .zip(other.data.iter())
            .flat_map(|(a, b)| a.iter().zip(b))
            .map(|(x, y)| x * y)
            .sum())
    }

    /// Largest absolute value, `0.0` for an empty vector. NaN if any
    /// value is NaN.
    pub fn norm_inf(&self) -> f64 {
        self.values().fold(0.0, |acc, v| nan_or(acc, v.abs(), f64::max))
    }

    /// Smallest value, `None` for an empty vector. NaN if any value is NaN.
    pub fn min_value(&self) -> Option<f64> {
        self.values().reduce(|a, b| nan_or(a, b, f64::min))
    }

    /// Largest value, `None` for an empty vector. NaN if any value is NaN.
    pub fn max_value(&self) -> Option<f64> {
        self.values().reduce(|a, b| nan_or(a, b, f64::max))
    }

    /// All values in component order.
    pub fn values(&self) -> impl Iterator<Item = f64> + '_ {
        self.data.iter().flat_map(|d| d.iter().copied())
    }

    /// Write all values in component order into `out`.
    pub fn write_flat(&self, out: &mut [f64]) -> Result<(), StateError> {
        if out.len() != self.len() {
            return Err(StateError::ShapeMismatch {
                reason: format!("flat buffer has {} entries, vector {}", out.len(), self.len()),
            });
        }
        for (slot, v) in out.iter_mut().zip(self.values()) {
            *slot = v;
        }
        Ok(())
    }

    /// Overwrite all values from a flat buffer in component order.
    pub fn read_flat(&mut self, flat: &[f64]) -> Result<(), StateError> {
        if flat.len() != self.len() {
            return Err(StateError::ShapeMismatch {
                reason: format!("flat buffer has {} entries, vector {}", flat.len(), self.len()),
            });
        }
        let mut offset = 0;
        for d in &mut self.data {
            let n = d.len();
            d.copy_from_slice(&flat[offset..offset + n]);
            offset += n;
        }
        Ok(())
    }
}
