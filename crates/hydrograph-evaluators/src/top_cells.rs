//! Map a surface field onto the subsurface cells just below the surface.

use hydrograph_core::keys::mesh_of;
use hydrograph_core::{
    CompositeVector, ConfigError, EntityKind, FieldShape, Key, KeyTag, ParameterList, StateError, Tag,
};
use hydrograph_mesh::Parallel;
use hydrograph_state::{EvalContext, Evaluator, IoFlags};

use crate::common::eval_failed;

/// Copies each surface cell value into the subsurface cell under its
/// parent face.
///
/// Only those top cells are written; every other subsurface cell keeps
/// its previous value. With `"negate"`, the written values change sign.
/// Partial derivatives are not provided.
#[derive(Debug)]
pub struct TopCellsSurface {
    name: String,
    surface_mesh: String,
    negate: bool,
    io: IoFlags,
    provides: [KeyTag; 1],
    deps: [KeyTag; 1],
}

impl TopCellsSurface {
    /// Factory constructor.
    pub fn from_plist(plist: &ParameterList, tag: &Tag) -> Result<Box<dyn Evaluator>, ConfigError> {
        Ok(Box::new(Self::new(plist, tag)?))
    }

    /// Construct directly.
    ///
    /// `"subsurface key"` (falling back to `"evaluator name"`) names the
    /// output and `"surface key"` the input; both are required.
    pub fn new(plist: &ParameterList, tag: &Tag) -> Result<Self, ConfigError> {
        let sub = if plist.is_parameter("subsurface key") {
            Key::from(plist.get_str("subsurface key")?)
        } else {
            plist
                .get_str("evaluator name")
                .map_err(|_| ConfigError::MissingParameter {
                    list: plist.name().to_string(),
                    name: "subsurface key".to_string(),
                })
                .map(Key::from)?
        };
        let surf = Key::from(plist.get_str("surface key")?);
        let surface_mesh = plist.get_string_or("surface mesh key", "surface")?;
        let io = IoFlags {
            vis: plist.get_bool_or(&format!("visualize {sub}"), true)?,
            checkpoint: plist.get_bool_or(&format!("checkpoint {sub}"), false)?,
        };
        Ok(Self {
            name: sub.as_str().to_string(),
            surface_mesh,
            negate: plist.get_bool_or("negate", false)?,
            io,
            provides: [sub.at(tag)],
            deps: [surf.at(tag)],
        })
    }
}

impl Evaluator for TopCellsSurface {
    fn name(&self) -> &str {
        &self.name
    }

    fn provides(&self) -> &[KeyTag] {
        &self.provides
    }

    fn dependencies(&self) -> &[KeyTag] {
        &self.deps
    }

    fn output_shape(&self, kt: &KeyTag) -> Option<FieldShape> {
        Some(FieldShape::cells(mesh_of(kt.key.as_str())))
    }

    fn dependency_shape(&self, _dep: &KeyTag, _output: &FieldShape) -> Option<FieldShape> {
        Some(FieldShape::cells(self.surface_mesh.as_str()))
    }

    fn io_flags(&self) -> IoFlags {
        self.io
    }

    fn evaluate(&self, ctx: &EvalContext<'_>, results: &mut [CompositeVector]) -> Result<(), StateError> {
        let surf = ctx.view(&self.deps[0], "cell")?;
        let surf_mesh = ctx.mesh(&self.surface_mesh)?;
        let sub_mesh = ctx.mesh(mesh_of(self.provides[0].key.as_str()))?;
        let sign = if self.negate { -1.0 } else { 1.0 };
        let out = results[0].view_mut("cell")?;

        let ncells = surf_mesh.num_entities(EntityKind::Cell, Parallel::Owned);
        for (c, &value) in surf.iter().enumerate().take(ncells) {
            let face = surf_mesh.entity_parent(EntityKind::Cell, c).ok_or_else(|| {
                eval_failed(&self.name, format!("surface cell {c} has no parent face"))
            })?;
            let cells = sub_mesh.face_cells(face);
            let [cell] = cells.as_slice() else {
                return Err(eval_failed(
                    &self.name,
                    format!("parent face {face} borders {} cells, expected 1", cells.len()),
                ));
            };
            out[*cell] = sign * value;
        }
        Ok(())
    }
}
