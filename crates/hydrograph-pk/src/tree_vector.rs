//! Hierarchical solution vectors.
//!
//! A single kernel's unknowns are one [`TreeVector::Leaf`]; a coupler's are
//! a [`TreeVector::Node`] whose children follow the order of its
//! sub-kernels. Flat ordering (used for dense matrices) is depth-first,
//! component order within each leaf.

use hydrograph_core::field::nan_or;
use hydrograph_core::{CompositeVector, StateError};

/// A [`CompositeVector`] or an ordered list of sub-vectors.
#[derive(Clone, Debug, PartialEq)]
pub enum TreeVector {
    /// Unknowns of one kernel.
    Leaf {
        /// Owning kernel.
        name: String,
        /// Values.
        data: CompositeVector,
    },
    /// Unknowns of a coupler.
    Node {
        /// Owning coupler.
        name: String,
        /// One entry per sub-kernel.
        children: Vec<TreeVector>,
    },
}

fn mismatch(what: &str) -> StateError {
    StateError::ShapeMismatch {
        reason: format!("tree vectors differ in structure ({what})"),
    }
}

impl TreeVector {
    /// A leaf owning `data`.
    pub fn leaf(name: impl Into<String>, data: CompositeVector) -> Self {
        Self::Leaf {
            name: name.into(),
            data,
        }
    }

    /// A node over `children`.
    pub fn node(name: impl Into<String>, children: Vec<TreeVector>) -> Self {
        Self::Node {
            name: name.into(),
            children,
        }
    }

    /// Name of the owning kernel or coupler.
    pub fn name(&self) -> &str {
        match self {
            Self::Leaf { name, .. } | Self::Node { name, .. } => name,
        }
    }

    /// Leaf data, `None` for a node.
    pub fn data(&self) -> Option<&CompositeVector> {
        match self {
            Self::Leaf { data, .. } => Some(data),
            Self::Node { .. } => None,
        }
    }

    /// Mutable leaf data, `None` for a node.
    pub fn data_mut(&mut self) -> Option<&mut CompositeVector> {
        match self {
            Self::Leaf { data, .. } => Some(data),
            Self::Node { .. } => None,
        }
    }

    /// Leaf data, or a shape error naming the expected leaf.
    pub fn leaf_data(&self) -> Result<&CompositeVector, StateError> {
        self.data().ok_or_else(|| mismatch("expected a leaf"))
    }

    /// Mutable leaf data, or a shape error.
    pub fn leaf_data_mut(&mut self) -> Result<&mut CompositeVector, StateError> {
        self.data_mut().ok_or_else(|| mismatch("expected a leaf"))
    }

    /// Children of a node; empty for a leaf.
    pub fn children(&self) -> &[TreeVector] {
        match self {
            Self::Leaf { .. } => &[],
            Self::Node { children, .. } => children,
        }
    }

    /// Mutable children of a node; empty for a leaf.
    pub fn children_mut(&mut self) -> &mut [TreeVector] {
        match self {
            Self::Leaf { .. } => &mut [],
            Self::Node { children, .. } => children,
        }
    }

    /// Child `i`, or a shape error.
    pub fn child(&self, i: usize) -> Result<&TreeVector, StateError> {
        self.children().get(i).ok_or_else(|| mismatch("missing child"))
    }

    /// Mutable child `i`, or a shape error.
    pub fn child_mut(&mut self, i: usize) -> Result<&mut TreeVector, StateError> {
        self.children_mut()
            .get_mut(i)
            .ok_or_else(|| mismatch("missing child"))
    }

    /// Same structure, all zeros.
    pub fn zeros_like(&self) -> Self {
        match self {
            Self::Leaf { name, data } => Self::leaf(name.clone(), data.zeros_like()),
            Self::Node { name, children } => {
                Self::node(name.clone(), children.iter().map(Self::zeros_like).collect())
            }
        }
    }

    /// Total number of values.
    pub fn len(&self) -> usize {
        match self {
            Self::Leaf { data, .. } => data.len(),
            Self::Node { children, .. } => children.iter().map(Self::len).sum(),
        }
    }

    /// Whether the tree holds no values.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Set every value to `value`.
    pub fn put_scalar(&mut self, value: f64) {
        self.for_each_leaf_mut(&mut |d| d.put_scalar(value));
    }

    /// Multiply every value by `alpha`.
    pub fn scale(&mut self, alpha: f64) {
        self.for_each_leaf_mut(&mut |d| d.scale(alpha));
    }

    fn for_each_leaf_mut(&mut self, f: &mut impl FnMut(&mut CompositeVector)) {
        match self {
            Self::Leaf { data, .. } => f(data),
            Self::Node { children, .. } => {
                for c in children {
                    c.for_each_leaf_mut(f);
                }
            }
        }
    }

    /// `self = alpha * other + beta * self`.
    pub fn update(&mut self, alpha: f64, other: &TreeVector, beta: f64) -> Result<(), StateError> {
        match (self, other) {
            (Self::Leaf { data, .. }, Self::Leaf { data: o, .. }) => data.update(alpha, o, beta),
            (Self::Node { children, .. }, Self::Node { children: o, .. }) => {
                if children.len() != o.len() {
                    return Err(mismatch("child count"));
                }
                for (c, oc) in children.iter_mut().zip(o) {
                    c.update(alpha, oc, beta)?;
                }
                Ok(())
            }
            _ => Err(mismatch("leaf against node")),
        }
    }

    /// Copy `other`'s values into `self`.
    pub fn assign(&mut self, other: &TreeVector) -> Result<(), StateError> {
        self.update(1.0, other, 0.0)
    }

    /// All values, depth-first.
    pub fn values(&self) -> Box<dyn Iterator<Item = f64> + '_> {
        match self {
            Self::Leaf { data, .. } => Box::new(data.values()),
            Self::Node { children, .. } => Box::new(children.iter().flat_map(|c| c.values())),
        }
    }

    /// Largest absolute value, NaN if any value is NaN.
    pub fn norm_inf(&self) -> f64 {
        self.values().fold(0.0, |acc, v| nan_or(acc, v.abs(), f64::max))
    }

    /// Smallest value, `None` if empty. NaN if any value is NaN.
    pub fn min_value(&self) -> Option<f64> {
        self.values().reduce(|a, b| nan_or(a, b, f64::min))
    }

    /// Largest value, `None` if empty. NaN if any value is NaN.
    pub fn max_value(&self) -> Option<f64> {
        self.values().reduce(|a, b| nan_or(a, b, f64::max))
    }

    /// Dot product.
    pub fn dot(&self, other: &TreeVector) -> Result<f64, StateError> {
        if self.len() != other.len() {
            return Err(mismatch("length"));
        }
        Ok(self.values().zip(other.values()).map(|(a, b)| a * b).sum())
    }

    /// Write every value into `out`, depth-first.
    pub fn write_flat(&self, out: &mut [f64]) -> Result<(), StateError> {
        if out.len() != self.len() {
            return Err(mismatch("flat length"));
        }
        let mut offset = 0;
        self.write_from(out, &mut offset)
    }

    fn write_from(&self, out: &mut [f64], offset: &mut usize) -> Result<(), StateError> {
        match self {
            Self::Leaf { data, .. } => {
                let n = data.len();
                data.write_flat(&mut out[*offset..*offset + n])?;
                *offset += n;
            }
            Self::Node { children, .. } => {
                for c in children {
                    c.write_from(out, offset)?;
                }
            }
        }
        Ok(())
    }

    /// Overwrite every value from `flat`, depth-first.
    pub fn read_flat(&mut self, flat: &[f64]) -> Result<(), StateError> {
        if flat.len() != self.len() {
            return Err(mismatch("flat length"));
        }
        let mut offset = 0;
        self.read_from(flat, &mut offset)
    }

    fn read_from(&mut self, flat: &[f64], offset: &mut usize) -> Result<(), StateError> {
        match self {
            Self::Leaf { data, .. } => {
                let n = data.len();
                data.read_flat(&flat[*offset..*offset + n])?;
                *offset += n;
            }
            Self::Node { children, .. } => {
                for c in children {
                    c.read_from(flat, offset)?;
                }
            }
        }
        Ok(())
    }

    /// Values as a dense vector.
    pub fn to_dvector(&self) -> nalgebra::DVector<f64> {
        nalgebra::DVector::from_iterator(self.len(), self.values())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hydrograph_core::FieldShape;

    fn leaf(name: &str, cells: &[f64], faces: &[f64]) -> TreeVector {
        let data = CompositeVector::from_components(
            FieldShape::cells_and_faces("domain"),
            vec![cells.to_vec(), faces.to_vec()],
        )
        .unwrap();
        TreeVector::leaf(name, data)
    }

    #[test]
    fn flat_order_is_depth_first() {
        let mut t = TreeVector::node(
            "mpc",
            vec![leaf("a", &[1.0], &[2.0, 3.0]), leaf("b", &[4.0], &[5.0, 6.0])],
        );
        let mut flat = vec![0.0; t.len()];
        t.write_flat(&mut flat).unwrap();
        assert_eq!(flat, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);

        flat.iter_mut().for_each(|v| *v *= 10.0);
        t.read_flat(&flat).unwrap();
        assert_eq!(t.child(1).unwrap().leaf_data().unwrap().view("cell").unwrap(), &[40.0]);
    }

    #[test]
    fn update_rejects_structural_mismatch() {
        let mut a = leaf("a", &[1.0], &[]);
        let b = TreeVector::node("n", vec![leaf("a", &[1.0], &[])]);
        assert!(matches!(a.update(1.0, &b, 1.0), Err(StateError::ShapeMismatch { .. })));
    }

    #[test]
    fn norms_span_children() {
        let t = TreeVector::node("n", vec![leaf("a", &[-7.0], &[1.0]), leaf("b", &[3.0], &[2.0])]);
        assert_eq!(t.norm_inf(), 7.0);
        assert_eq!(t.min_value(), Some(-7.0));
        assert_eq!(t.max_value(), Some(3.0));
        let z = t.zeros_like();
        assert_eq!(z.norm_inf(), 0.0);
        assert_eq!(z.len(), 4);
    }

    #[test]
    fn nan_in_any_child_poisons_norms() {
        let t = TreeVector::node("n", vec![leaf("a", &[1.0], &[]), leaf("b", &[f64::NAN], &[5.0])]);
        assert!(t.norm_inf().is_nan());
        assert!(t.min_value().unwrap().is_nan());
        assert!(t.max_value().unwrap().is_nan());
    }
}
