//! Data models for the placement engine.
//!
//! This module defines the scene the engine operates on:
//! - `Zone` / `Layout`: the container and the staging pad, and the pure
//!   `zone_of` derivation from a horizontal position
//! - `ObjectSpec`: an object creation request
//! - `PlacedObject`: an object with its shape and world pose
//! - `Scene`: the canonical object set plus pose snapshots for rollback

use std::fmt;

use serde::{Deserialize, Serialize};
#[allow(unused_imports)]
use serde_json::json;
use utoipa::ToSchema;

use crate::error::{EngineError, Result};
use crate::geometry::{Pose, Shape, SubBox};
use crate::types::{Aabb, Vec3, validation};

/// Unique object identifier.
pub type ObjectId = u64;

/// Poses of every object at one point in time.
pub type Snapshot = Vec<(ObjectId, Pose)>;

/// Named placement region. Objects only compete for space with objects of
/// the same zone.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ZoneId {
    Container,
    Staging,
}

impl fmt::Display for ZoneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ZoneId::Container => write!(f, "container"),
            ZoneId::Staging => write!(f, "staging"),
        }
    }
}

/// Axis-aligned region with a floor (`min.y`) and a ceiling (`max.y`).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Zone {
    pub id: ZoneId,
    pub min: Vec3,
    pub max: Vec3,
}

impl Zone {
    pub fn new(id: ZoneId, min: Vec3, max: Vec3) -> Self {
        Self { id, min, max }
    }

    #[inline]
    pub fn floor(&self) -> f64 {
        self.min.y
    }

    #[inline]
    pub fn ceiling(&self) -> f64 {
        self.max.y
    }

    #[inline]
    pub fn aabb(&self) -> Aabb {
        Aabb::new(self.min, self.max)
    }

    pub fn volume(&self) -> f64 {
        self.aabb().volume()
    }

    /// Horizontal containment test (boundary inclusive).
    #[inline]
    pub fn contains_xz(&self, position: &Vec3) -> bool {
        position.x >= self.min.x
            && position.x <= self.max.x
            && position.z >= self.min.z
            && position.z <= self.max.z
    }

    /// Translation that moves `aabb` inside the zone. On an axis where the
    /// box is wider than the zone, it is centered instead.
    pub fn clamp_shift(&self, aabb: &Aabb) -> Vec3 {
        let mut shift = Vec3::zero();
        for axis in 0..3 {
            let (lo, hi) = (self.min.axis(axis), self.max.axis(axis));
            let (bmin, bmax) = (aabb.min.axis(axis), aabb.max.axis(axis));
            let d = if bmax - bmin > hi - lo {
                (lo + hi) * 0.5 - (bmin + bmax) * 0.5
            } else if bmin < lo {
                lo - bmin
            } else if bmax > hi {
                hi - bmax
            } else {
                0.0
            };
            shift = shift.with_axis(axis, d);
        }
        shift
    }
}

/// The two zones of a scene.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Layout {
    pub container: Zone,
    pub staging: Zone,
}

impl Layout {
    /// Builds a layout from the container interior size (centered on the
    /// origin, floor at `y = 0`), the staging pad size and the horizontal gap
    /// between the container and the pad. The pad floor sits one unit below
    /// the container floor.
    pub fn new(container_size: Vec3, staging_size: Vec3, staging_gap: f64) -> Self {
        let ch = container_size * 0.5;
        let container = Zone::new(
            ZoneId::Container,
            Vec3::new(-ch.x, 0.0, -ch.z),
            Vec3::new(ch.x, container_size.y, ch.z),
        );
        let sh = staging_size * 0.5;
        let center_x = ch.x + staging_gap + sh.x;
        let staging = Zone::new(
            ZoneId::Staging,
            Vec3::new(center_x - sh.x, -1.0, -sh.z),
            Vec3::new(center_x + sh.x, staging_size.y - 1.0, sh.z),
        );
        Self { container, staging }
    }

    pub fn zone(&self, id: ZoneId) -> &Zone {
        match id {
            ZoneId::Container => &self.container,
            ZoneId::Staging => &self.staging,
        }
    }

    /// Derives the zone from a horizontal position. The container wins
    /// where both would match.
    pub fn zone_of(&self, position: &Vec3) -> Option<ZoneId> {
        if self.container.contains_xz(position) {
            Some(ZoneId::Container)
        } else if self.staging.contains_xz(position) {
            Some(ZoneId::Staging)
        } else {
            None
        }
    }

    /// Legality set of a position: its zone, or the container for positions
    /// outside both zones.
    pub fn area_of(&self, position: &Vec3) -> ZoneId {
        self.zone_of(position).unwrap_or(ZoneId::Container)
    }
}

impl Default for Layout {
    fn default() -> Self {
        Self::new(Vec3::splat(110.0), Vec3::splat(220.0), 20.0)
    }
}

/// Kind of object requested by a creation request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ObjectKind {
    Cube,
    Sphere,
    LShape,
    #[serde(rename = "t_i")]
    TetI,
    #[serde(rename = "t_t")]
    TetT,
    #[serde(rename = "t_z")]
    TetZ,
    #[serde(rename = "t_l")]
    TetL,
}

/// Object creation request.
///
/// `dimensions` means (width, height, depth) for cubes, the diameter in the
/// first component for spheres, and the lattice edge in the first component
/// for L-shapes and tetrominoes. Cavity and colour are carried through for
/// the renderer and never read by the engine.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ObjectSpec {
    pub kind: ObjectKind,
    #[schema(value_type = Vec<f64>, example = json!([10.0, 10.0, 10.0]))]
    pub dimensions: (f64, f64, f64),
    #[serde(default)]
    pub has_cavity: bool,
    #[serde(default)]
    #[schema(value_type = Option<Vec<f64>>)]
    pub cavity_dimensions: Option<(f64, f64, f64)>,
    #[serde(default)]
    pub color_tag: Option<String>,
}

/// Tetromino cell layouts in the x/z plane, in lattice units.
const TET_I: [(f64, f64); 4] = [(-1.5, 0.0), (-0.5, 0.0), (0.5, 0.0), (1.5, 0.0)];
const TET_T: [(f64, f64); 4] = [(-1.0, 0.0), (0.0, 0.0), (1.0, 0.0), (0.0, 1.0)];
const TET_Z: [(f64, f64); 4] = [(-1.0, 0.0), (0.0, 0.0), (0.0, 1.0), (1.0, 1.0)];
const TET_L: [(f64, f64); 4] = [(-1.0, 0.0), (0.0, 0.0), (1.0, 0.0), (-1.0, 1.0)];

/// Lattice cells of the L-shape.
const L_CELLS: [(f64, f64, f64); 4] = [
    (0.0, 0.0, 0.0),
    (1.0, 0.0, 0.0),
    (0.0, 1.0, 0.0),
    (0.0, 0.0, 1.0),
];

impl ObjectSpec {
    pub fn new(kind: ObjectKind, dimensions: (f64, f64, f64)) -> Self {
        Self {
            kind,
            dimensions,
            has_cavity: false,
            cavity_dimensions: None,
            color_tag: None,
        }
    }

    pub fn cube(width: f64, height: f64, depth: f64) -> Self {
        Self::new(ObjectKind::Cube, (width, height, depth))
    }

    pub fn sphere(diameter: f64) -> Self {
        Self::new(ObjectKind::Sphere, (diameter, diameter, diameter))
    }

    /// Builds the bounding representation and the optional lattice unit.
    ///
    /// # Errors
    /// `DegenerateGeometry` for zero, negative or non-finite dimensions.
    pub fn build_shape(&self) -> Result<(Shape, Option<f64>)> {
        let (a, b, c) = self.dimensions;
        match self.kind {
            ObjectKind::Cube => Ok((Shape::cuboid(Vec3::new(a, b, c))?, None)),
            ObjectKind::Sphere => {
                validation::validate_dimension(a, "Diameter")?;
                Ok((Shape::sphere((a * 0.5).max(1.0))?, None))
            }
            ObjectKind::LShape => {
                validation::validate_dimension(a, "Edge")?;
                let parts = L_CELLS
                    .iter()
                    .map(|&(x, y, z)| SubBox::new(Vec3::new(x, y, z) * a, Vec3::splat(a * 0.5)))
                    .collect();
                Ok((Shape::compound(parts)?, Some(a)))
            }
            ObjectKind::TetI | ObjectKind::TetT | ObjectKind::TetZ | ObjectKind::TetL => {
                validation::validate_dimension(a, "Edge")?;
                let cells = match self.kind {
                    ObjectKind::TetI => &TET_I,
                    ObjectKind::TetT => &TET_T,
                    ObjectKind::TetZ => &TET_Z,
                    _ => &TET_L,
                };
                let parts = cells
                    .iter()
                    .map(|&(x, z)| SubBox::new(Vec3::new(x * a, 0.0, z * a), Vec3::splat(a * 0.5)))
                    .collect();
                Ok((Shape::compound(parts)?, Some(a)))
            }
        }
    }
}

/// An object with its shape and world pose.
#[derive(Clone, Debug, PartialEq)]
pub struct PlacedObject {
    pub id: ObjectId,
    pub shape: Shape,
    pub pose: Pose,
    /// Lattice edge of snapped shapes.
    pub unit: Option<f64>,
    pub spec: ObjectSpec,
}

impl PlacedObject {
    /// Builds an object from a creation request at a given pose.
    pub fn from_spec(id: ObjectId, spec: ObjectSpec, pose: Pose) -> Result<Self> {
        let (shape, unit) = spec.build_shape()?;
        Ok(Self {
            id,
            shape,
            pose,
            unit,
            spec,
        })
    }

    #[inline]
    pub fn world_aabb(&self) -> Aabb {
        self.shape.world_aabb(&self.pose)
    }

    /// Zone legality set, derived from the current position.
    #[inline]
    pub fn zone(&self, layout: &Layout) -> ZoneId {
        layout.area_of(&self.pose.position)
    }

    /// Copy of this object at another pose.
    pub fn with_pose(&self, pose: Pose) -> Self {
        Self {
            pose,
            ..self.clone()
        }
    }
}

/// The canonical object set.
#[derive(Clone, Debug, Default)]
pub struct Scene {
    pub layout: Layout,
    pub objects: Vec<PlacedObject>,
    next_id: ObjectId,
}

impl Scene {
    pub fn new(layout: Layout) -> Self {
        Self {
            layout,
            objects: Vec::new(),
            next_id: 1,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn index_of(&self, id: ObjectId) -> Option<usize> {
        self.objects.iter().position(|o| o.id == id)
    }

    pub fn get(&self, id: ObjectId) -> Option<&PlacedObject> {
        self.objects.iter().find(|o| o.id == id)
    }

    /// Looks up an object or fails with `UnknownObject`.
    pub fn require(&self, id: ObjectId) -> Result<&PlacedObject> {
        self.get(id).ok_or(EngineError::UnknownObject(id))
    }

    pub fn pose_of(&self, id: ObjectId) -> Result<Pose> {
        self.require(id).map(|o| o.pose)
    }

    pub fn set_pose(&mut self, id: ObjectId, pose: Pose) -> Result<()> {
        let object = self
            .objects
            .iter_mut()
            .find(|o| o.id == id)
            .ok_or(EngineError::UnknownObject(id))?;
        object.pose = pose;
        Ok(())
    }

    /// Builds the shape from `spec` and adds the object at `pose` without any
    /// legality check. Placement search is responsible for choosing the pose.
    pub fn add(&mut self, spec: ObjectSpec, pose: Pose) -> Result<ObjectId> {
        let id = self.next_id.max(1);
        let object = PlacedObject::from_spec(id, spec, pose)?;
        self.next_id = id + 1;
        self.objects.push(object);
        Ok(id)
    }

    pub fn remove(&mut self, id: ObjectId) -> Result<PlacedObject> {
        let idx = self.index_of(id).ok_or(EngineError::UnknownObject(id))?;
        Ok(self.objects.remove(idx))
    }

    pub fn clear(&mut self) {
        self.objects.clear();
    }

    /// Ids of the objects currently in `zone`.
    pub fn ids_in_zone(&self, zone: ZoneId) -> Vec<ObjectId> {
        self.objects
            .iter()
            .filter(|o| o.zone(&self.layout) == zone)
            .map(|o| o.id)
            .collect()
    }

    pub fn snapshot(&self) -> Snapshot {
        self.objects.iter().map(|o| (o.id, o.pose)).collect()
    }

    /// Restores poses by id. Ids missing from the scene are skipped.
    pub fn restore(&mut self, snapshot: &[(ObjectId, Pose)]) {
        for (id, pose) in snapshot {
            if let Some(object) = self.objects.iter_mut().find(|o| o.id == *id) {
                object.pose = *pose;
            }
        }
    }
}
