//! Boundary-condition markers and the functions that fill them.
//!
//! A kernel keeps one [`BoundaryConditions`] table sized by the number of
//! faces and rebuilds it from its [`BcFunction`]s before every residual.
//!
//! # Configuration
//!
//! ```json
//! "boundary conditions": {
//!   "pressure": {
//!     "water table": { "boundary": "bottom", "value": 101325.0 }
//!   },
//!   "mass flux": {
//!     "rain": { "faces": [10], "times": [0.0, 3600.0], "values": [-1e-5, 0.0] }
//!   }
//! }
//! ```

use hydrograph_core::{ConfigError, ParameterList};
use hydrograph_mesh::Mesh;
use tracing::trace;

/// Kind of condition imposed on one face.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BcKind {
    /// Nothing imposed. Interior faces, and boundary faces not yet visited.
    #[default]
    None,
    /// The face value is fixed.
    Dirichlet,
    /// The outward flux per unit area is fixed.
    Neumann,
}

/// Per-face markers and values.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BoundaryConditions {
    kinds: Vec<BcKind>,
    values: Vec<f64>,
}

impl BoundaryConditions {
    /// A table for `nfaces` faces, all [`BcKind::None`].
    pub fn new(nfaces: usize) -> Self {
        Self {
            kinds: vec![BcKind::None; nfaces],
            values: vec![0.0; nfaces],
        }
    }

    /// Mark every face [`BcKind::None`] with value zero.
    pub fn reset(&mut self) {
        self.kinds.fill(BcKind::None);
        self.values.fill(0.0);
    }

    /// Fix the value on face `f`.
    pub fn set_dirichlet(&mut self, f: usize, value: f64) {
        self.kinds[f] = BcKind::Dirichlet;
        self.values[f] = value;
    }

    /// Fix the outward flux per unit area on face `f`.
    pub fn set_neumann(&mut self, f: usize, value: f64) {
        self.kinds[f] = BcKind::Neumann;
        self.values[f] = value;
    }

    /// Marker of face `f`.
    pub fn kind(&self, f: usize) -> BcKind {
        self.kinds[f]
    }

    /// Value of face `f`.
    pub fn value(&self, f: usize) -> f64 {
        self.values[f]
    }

    /// Number of faces.
    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    /// Whether the table covers no faces.
    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }

    /// Faces marked Dirichlet, with their values.
    pub fn dirichlet(&self) -> impl Iterator<Item = (usize, f64)> + '_ {
        self.kinds
            .iter()
            .zip(&self.values)
            .enumerate()
            .filter(|(_, (k, _))| **k == BcKind::Dirichlet)
            .map(|(f, (_, v))| (f, *v))
    }
}

// ── Functions ──────────────────────────────────────────────────────

/// Time dependence of one region's value.
#[derive(Clone, Debug, PartialEq)]
pub enum BcValue {
    /// `"value": x`.
    Constant(f64),
    /// `"times"` and `"values"`, linearly interpolated and held constant
    /// outside the table.
    Tabular {
        /// Increasing sample times.
        times: Vec<f64>,
        /// Value at each sample time.
        values: Vec<f64>,
    },
}

impl BcValue {
    fn from_plist(plist: &ParameterList) -> Result<Self, ConfigError> {
        if plist.is_parameter("value") {
            return Ok(Self::Constant(plist.get_f64("value")?));
        }
        let times = plist.get_f64_array("times")?;
        let values = plist.get_f64_array("values")?;
        if times.is_empty() || times.len() != values.len() {
            return Err(plist.invalid("values", "needs one value per entry of \"times\""));
        }
        if times.windows(2).any(|w| w[1] <= w[0]) {
            return Err(plist.invalid("times", "must be strictly increasing"));
        }
        Ok(Self::Tabular { times, values })
    }

    /// Value at time `t`.
    pub fn at(&self, t: f64) -> f64 {
        match self {
            Self::Constant(v) => *v,
            Self::Tabular { times, values } => {
                let i = times.partition_point(|&ti| ti <= t);
                if i == 0 {
                    values[0]
                } else if i == times.len() {
                    values[i - 1]
                } else {
                    let w = (t - times[i - 1]) / (times[i] - times[i - 1]);
                    values[i - 1] + w * (values[i] - values[i - 1])
                }
            }
        }
    }
}

/// A named set of boundary faces sharing one value.
#[derive(Clone, Debug, PartialEq)]
pub struct BcRegion {
    /// Entry name in the configuration.
    pub name: String,
    /// Face indices, all on the boundary.
    pub faces: Vec<usize>,
    /// The imposed value.
    pub value: BcValue,
}

/// One category of boundary conditions, e.g. all `"pressure"` entries.
///
/// Regions are applied in configuration order; a face listed twice takes
/// the later value.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BcFunction {
    regions: Vec<BcRegion>,
}

/// Sign of the outward normal's vertical component on boundary face `f`.
fn outward_z(mesh: &dyn Mesh, f: usize) -> f64 {
    let cells = mesh.face_cells(f);
    let Some(&c) = cells.first() else {
        return 0.0;
    };
    let dir = mesh
        .cell_faces_and_dirs(c)
        .iter()
        .find(|(face, _)| *face == f)
        .map_or(1.0, |(_, d)| f64::from(*d));
    dir * mesh.face_normal(f)[2]
}

impl BcFunction {
    /// No regions.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Read `category` from a `"boundary conditions"` list. A missing
    /// category gives an empty function.
    pub fn from_category(bcs: &ParameterList, category: &str, mesh: &dyn Mesh) -> Result<Self, ConfigError> {
        if !bcs.is_sublist(category) {
            return Ok(Self::empty());
        }
        let list = bcs.sublist(category)?;
        let mut regions = Vec::new();
        for entry in list.sublists() {
            let (name, plist) = entry?;
            let faces = Self::read_faces(&plist, mesh)?;
            let value = BcValue::from_plist(&plist)?;
            trace!(category, region = %name, faces = faces.len(), "read boundary condition");
            regions.push(BcRegion { name, faces, value });
        }
        Ok(Self { regions })
    }

    fn read_faces(plist: &ParameterList, mesh: &dyn Mesh) -> Result<Vec<usize>, ConfigError> {
        if plist.is_parameter("faces") {
            let faces = plist.get_index_array("faces")?;
            if let Some(f) = faces.iter().find(|&&f| mesh.face_cells(f).len() != 1) {
                return Err(plist.invalid("faces", format!("face {f} is not a boundary face")));
            }
            return Ok(faces);
        }
        let boundary = plist.get_str("boundary")?;
        let keep: fn(f64) -> bool = match boundary {
            "top" => |z| z > 0.0,
            "bottom" => |z| z < 0.0,
            "all" => |_| true,
            other => {
                return Err(plist.invalid(
                    "boundary",
                    format!("'{other}' is not one of \"top\", \"bottom\", \"all\""),
                ))
            }
        };
        Ok(mesh
            .boundary_faces()
            .iter()
            .copied()
            .filter(|&f| keep(outward_z(mesh, f)))
            .collect())
    }

    /// Build from regions directly.
    pub fn from_regions(regions: Vec<BcRegion>) -> Self {
        Self { regions }
    }

    /// Whether no region is defined.
    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    /// The regions, in application order.
    pub fn regions(&self) -> &[BcRegion] {
        &self.regions
    }

    /// Every `(face, value)` pair at time `t`, in application order.
    pub fn values_at(&self, t: f64) -> impl Iterator<Item = (usize, f64)> + '_ {
        self.regions
            .iter()
            .flat_map(move |r| {
                let v = r.value.at(t);
                r.faces.iter().map(move |&f| (f, v))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hydrograph_mesh::ColumnMesh;

    fn column() -> ColumnMesh {
        ColumnMesh::uniform("domain", 0.0, 1.0, 4).unwrap()
    }

    #[test]
    fn top_and_bottom_follow_outward_normal() {
        let mesh = column();
        let bcs = ParameterList::from_json(
            "boundary conditions",
            r#"{"pressure": {"bottom": {"boundary": "bottom", "value": 2.0},
                             "top": {"boundary": "top", "value": 1.0}}}"#,
        )
        .unwrap();
        let f = BcFunction::from_category(&bcs, "pressure", &mesh).unwrap();
        let pairs: Vec<_> = f.values_at(0.0).collect();
        assert_eq!(pairs, vec![(mesh.bottom_face(), 2.0), (mesh.top_face(), 1.0)]);
    }

    #[test]
    fn interior_face_rejected() {
        let mesh = column();
        let bcs = ParameterList::from_json(
            "boundary conditions",
            r#"{"mass flux": {"bad": {"faces": [2], "value": 0.0}}}"#,
        )
        .unwrap();
        match BcFunction::from_category(&bcs, "mass flux", &mesh) {
            Err(ConfigError::InvalidValue { name, .. }) => assert_eq!(name, "faces"),
            other => panic!("expected InvalidValue, got {other:?}"),
        }
    }

    #[test]
    fn missing_category_is_empty() {
        let mesh = column();
        let f = BcFunction::from_category(&ParameterList::new("bcs"), "pressure", &mesh).unwrap();
        assert!(f.is_empty());
    }

    #[test]
    fn tabular_values_interpolate_and_clamp() {
        let v = BcValue::Tabular {
            times: vec![0.0, 10.0],
            values: vec![1.0, 3.0],
        };
        assert_eq!(v.at(-1.0), 1.0);
        assert_eq!(v.at(5.0), 2.0);
        assert_eq!(v.at(20.0), 3.0);
    }

    #[test]
    fn table_marks_and_resets() {
        let mut t = BoundaryConditions::new(3);
        t.set_dirichlet(0, 5.0);
        t.set_neumann(2, -1.0);
        assert_eq!(t.dirichlet().collect::<Vec<_>>(), vec![(0, 5.0)]);
        assert_eq!(t.kind(2), BcKind::Neumann);
        t.reset();
        assert_eq!(t.kind(0), BcKind::None);
        assert_eq!(t.value(2), 0.0);
    }
}
