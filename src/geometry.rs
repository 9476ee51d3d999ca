//! Bounding primitives and world-space geometric queries.
//!
//! Every object's solid is described by a [`Shape`] in its local frame and a
//! [`Pose`] (position plus yaw). Box-like shapes are decomposed into oriented
//! boxes ([`Obb`]); spheres stay analytic. The triangle and ray helpers back
//! the mesh-style narrow phase and the parity containment test.

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::types::{Aabb, Vec3, validation};

/// Rays shorter than this are ignored by the parity test to avoid
/// self-intersection at the ray origin.
pub const PARITY_RAY_EPSILON: f64 = 1e-6;

/// Direction of the containment ray. Slightly skewed off the `x` axis so the
/// ray does not graze the shared diagonals and edges of box faces.
const PARITY_RAY_DIRECTION: Vec3 = Vec3::new(1.0, 1.31e-3, 2.17e-3);

/// Corner indices of each box face, in winding order.
const BOX_FACES: [[usize; 4]; 6] = [
    [0, 2, 6, 4],
    [1, 3, 7, 5],
    [0, 1, 5, 4],
    [2, 3, 7, 6],
    [0, 1, 3, 2],
    [4, 5, 7, 6],
];

/// World placement of an object: position of its bounding-box center and
/// rotation about the vertical axis.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    pub position: Vec3,
    pub yaw: f64,
}

impl Pose {
    pub const fn new(position: Vec3, yaw: f64) -> Self {
        Self { position, yaw }
    }

    /// Transforms a point from the local frame into world space.
    #[inline]
    pub fn transform_point(&self, local: Vec3) -> Vec3 {
        self.position + local.rotate_y(self.yaw)
    }
}

/// Axis-aligned box in an object's local frame.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SubBox {
    pub offset: Vec3,
    pub half_extents: Vec3,
}

impl SubBox {
    pub const fn new(offset: Vec3, half_extents: Vec3) -> Self {
        Self {
            offset,
            half_extents,
        }
    }

    fn local_aabb(&self) -> Aabb {
        Aabb::from_center_half(self.offset, self.half_extents)
    }
}

/// Closed set of bounding representations.
///
/// Every dispatch site matches exhaustively, so a new primitive has to be
/// handled everywhere it matters.
#[derive(Clone, Debug, PartialEq)]
pub enum Shape {
    Box { half_extents: Vec3 },
    Sphere { radius: f64 },
    Compound { parts: Vec<SubBox> },
}

impl Shape {
    /// Creates a box from its full size.
    pub fn cuboid(size: Vec3) -> Result<Self> {
        validation::validate_dimensions_3d(size)?;
        Ok(Shape::Box {
            half_extents: size * 0.5,
        })
    }

    pub fn sphere(radius: f64) -> Result<Self> {
        validation::validate_dimension(radius, "Radius")?;
        Ok(Shape::Sphere { radius })
    }

    /// Creates a compound from sub-boxes and re-centers it on its bounding box.
    pub fn compound(parts: Vec<SubBox>) -> Result<Self> {
        if parts.is_empty() {
            return Err(EngineError::DegenerateGeometry(
                "compound shape needs at least one part".to_string(),
            ));
        }
        for part in &parts {
            validation::validate_dimensions_3d(part.half_extents * 2.0)?;
            if !part.offset.is_finite() {
                return Err(EngineError::DegenerateGeometry(
                    "compound part offset must be finite".to_string(),
                ));
            }
        }
        let bounds = parts
            .iter()
            .map(SubBox::local_aabb)
            .reduce(|a, b| a.union(&b))
            .ok_or_else(|| EngineError::DegenerateGeometry("empty compound".to_string()))?;
        let center = bounds.center();
        let parts = parts
            .into_iter()
            .map(|p| SubBox::new(p.offset - center, p.half_extents))
            .collect();
        Ok(Shape::Compound { parts })
    }

    /// Short name for logs and API projections.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Shape::Box { .. } => "box",
            Shape::Sphere { .. } => "sphere",
            Shape::Compound { .. } => "compound",
        }
    }

    /// Bounding box in the local frame (centered at the origin).
    pub fn local_aabb(&self) -> Aabb {
        match self {
            Shape::Box { half_extents } => Aabb::from_center_half(Vec3::zero(), *half_extents),
            Shape::Sphere { radius } => Aabb::from_center_half(Vec3::zero(), Vec3::splat(*radius)),
            Shape::Compound { parts } => parts
                .iter()
                .map(SubBox::local_aabb)
                .reduce(|a, b| a.union(&b))
                .unwrap_or_else(|| Aabb::new(Vec3::zero(), Vec3::zero())),
        }
    }

    /// Solid volume; compound parts are assumed not to overlap.
    pub fn volume(&self) -> f64 {
        match self {
            Shape::Box { half_extents } => (*half_extents * 2.0).volume(),
            Shape::Sphere { radius } => 4.0 / 3.0 * std::f64::consts::PI * radius.powi(3),
            Shape::Compound { parts } => parts.iter().map(|p| (p.half_extents * 2.0).volume()).sum(),
        }
    }

    /// Oriented boxes of the box decomposition, each shrunk by `margin`.
    ///
    /// A sphere is represented by its bounding cube.
    pub fn world_obbs(&self, pose: &Pose, margin: f64) -> Vec<Obb> {
        match self {
            Shape::Box { half_extents } => {
                vec![Obb::from_sub_box(&SubBox::new(Vec3::zero(), *half_extents), pose, margin)]
            }
            Shape::Sphere { radius } => {
                vec![Obb::from_sub_box(&SubBox::new(Vec3::zero(), Vec3::splat(*radius)), pose, margin)]
            }
            Shape::Compound { parts } => parts
                .iter()
                .map(|part| Obb::from_sub_box(part, pose, margin))
                .collect(),
        }
    }

    /// World-space axis-aligned bounding box.
    pub fn world_aabb(&self, pose: &Pose) -> Aabb {
        match self {
            Shape::Sphere { radius } => Aabb::from_center_half(pose.position, Vec3::splat(*radius)),
            Shape::Box { .. } | Shape::Compound { .. } => self
                .world_obbs(pose, 0.0)
                .iter()
                .map(Obb::aabb)
                .reduce(|a, b| a.union(&b))
                .unwrap_or_else(|| Aabb::new(pose.position, pose.position)),
        }
    }

    /// Surface triangles of the box decomposition. Spheres have no
    /// triangulated surface; their queries are analytic.
    pub fn world_triangles(&self, pose: &Pose, margin: f64) -> Vec<[Vec3; 3]> {
        match self {
            Shape::Sphere { .. } => Vec::new(),
            Shape::Box { .. } | Shape::Compound { .. } => self
                .world_obbs(pose, margin)
                .iter()
                .flat_map(|obb| obb.triangles())
                .collect(),
        }
    }

    /// Exact analytic containment of a world point in the (shrunk) solid.
    pub fn contains_point(&self, pose: &Pose, point: &Vec3, margin: f64) -> bool {
        match self {
            Shape::Sphere { radius } => {
                let r = (radius - margin).max(0.0);
                pose.position.distance_squared(point) <= r * r
            }
            Shape::Box { .. } | Shape::Compound { .. } => self
                .world_obbs(pose, margin)
                .iter()
                .any(|obb| obb.contains_point(point)),
        }
    }
}

/// Oriented bounding box in world space.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Obb {
    pub center: Vec3,
    /// Orthonormal local axes in world space.
    pub axes: [Vec3; 3],
    pub half: Vec3,
}

impl Obb {
    /// Places a local sub-box into the world, shrinking it by `margin`.
    pub fn from_sub_box(part: &SubBox, pose: &Pose, margin: f64) -> Self {
        let half = Vec3::new(
            (part.half_extents.x - margin).max(0.0),
            (part.half_extents.y - margin).max(0.0),
            (part.half_extents.z - margin).max(0.0),
        );
        Self {
            center: pose.transform_point(part.offset),
            axes: [
                Vec3::new(1.0, 0.0, 0.0).rotate_y(pose.yaw),
                Vec3::new(0.0, 1.0, 0.0),
                Vec3::new(0.0, 0.0, 1.0).rotate_y(pose.yaw),
            ],
            half,
        }
    }

    /// Corner `i` uses the low three bits as the sign of each local axis.
    pub fn corners(&self) -> [Vec3; 8] {
        let mut out = [Vec3::zero(); 8];
        for (i, corner) in out.iter_mut().enumerate() {
            let sx = if i & 1 == 0 { -1.0 } else { 1.0 };
            let sy = if i & 2 == 0 { -1.0 } else { 1.0 };
            let sz = if i & 4 == 0 { -1.0 } else { 1.0 };
            *corner = self.center
                + self.axes[0] * (sx * self.half.x)
                + self.axes[1] * (sy * self.half.y)
                + self.axes[2] * (sz * self.half.z);
        }
        out
    }

    /// World-space bounding box of the oriented box.
    pub fn aabb(&self) -> Aabb {
        let mut extent = Vec3::zero();
        for k in 0..3 {
            let e: f64 = (0..3)
                .map(|i| self.axes[i].axis(k).abs() * self.half.axis(i))
                .sum();
            extent = extent.with_axis(k, e);
        }
        Aabb::from_center_half(self.center, extent)
    }

    /// Coordinates of a world point in the box's local frame.
    #[inline]
    fn to_local(&self, point: &Vec3) -> Vec3 {
        let d = *point - self.center;
        Vec3::new(d.dot(&self.axes[0]), d.dot(&self.axes[1]), d.dot(&self.axes[2]))
    }

    pub fn contains_point(&self, point: &Vec3) -> bool {
        let local = self.to_local(point);
        local.x.abs() <= self.half.x && local.y.abs() <= self.half.y && local.z.abs() <= self.half.z
    }

    /// Closest point of the solid box to `point` (the point itself when inside).
    pub fn closest_point(&self, point: &Vec3) -> Vec3 {
        let local = self.to_local(point);
        let clamped = Vec3::new(
            local.x.clamp(-self.half.x, self.half.x),
            local.y.clamp(-self.half.y, self.half.y),
            local.z.clamp(-self.half.z, self.half.z),
        );
        self.center
            + self.axes[0] * clamped.x
            + self.axes[1] * clamped.y
            + self.axes[2] * clamped.z
    }

    /// Separating-axis test against another oriented box.
    ///
    /// Tests the 3 + 3 face normals and the 9 edge cross products. Exact for
    /// convex boxes; touching boxes count as intersecting.
    pub fn intersects(&self, other: &Obb) -> bool {
        let t = other.center - self.center;
        let separated_on = |axis: Vec3| -> bool {
            let ra: f64 = (0..3)
                .map(|i| self.half.axis(i) * self.axes[i].dot(&axis).abs())
                .sum();
            let rb: f64 = (0..3)
                .map(|i| other.half.axis(i) * other.axes[i].dot(&axis).abs())
                .sum();
            t.dot(&axis).abs() > ra + rb
        };

        for axis in self.axes.iter().chain(other.axes.iter()) {
            if separated_on(*axis) {
                return false;
            }
        }
        for a in &self.axes {
            for b in &other.axes {
                let axis = a.cross(b);
                // Parallel edges add nothing the face axes have not covered.
                if axis.length_squared() < 1e-12 {
                    continue;
                }
                if separated_on(axis) {
                    return false;
                }
            }
        }
        true
    }

    /// The 12 surface triangles.
    pub fn triangles(&self) -> Vec<[Vec3; 3]> {
        let c = self.corners();
        BOX_FACES
            .iter()
            .flat_map(|f| [[c[f[0]], c[f[1]], c[f[2]]], [c[f[0]], c[f[2]], c[f[3]]]])
            .collect()
    }
}

/// Closest point on triangle `abc` to `p` (Voronoi-region walk).
pub fn closest_point_on_triangle(p: &Vec3, a: &Vec3, b: &Vec3, c: &Vec3) -> Vec3 {
    let ab = *b - *a;
    let ac = *c - *a;
    let ap = *p - *a;
    let d1 = ab.dot(&ap);
    let d2 = ac.dot(&ap);
    if d1 <= 0.0 && d2 <= 0.0 {
        return *a;
    }

    let bp = *p - *b;
    let d3 = ab.dot(&bp);
    let d4 = ac.dot(&bp);
    if d3 >= 0.0 && d4 <= d3 {
        return *b;
    }

    let vc = d1 * d4 - d3 * d2;
    if vc <= 0.0 && d1 >= 0.0 && d3 <= 0.0 {
        let v = d1 / (d1 - d3);
        return *a + ab * v;
    }

    let cp = *p - *c;
    let d5 = ab.dot(&cp);
    let d6 = ac.dot(&cp);
    if d6 >= 0.0 && d5 <= d6 {
        return *c;
    }

    let vb = d5 * d2 - d1 * d6;
    if vb <= 0.0 && d2 >= 0.0 && d6 <= 0.0 {
        let w = d2 / (d2 - d6);
        return *a + ac * w;
    }

    let va = d3 * d6 - d5 * d4;
    if va <= 0.0 && (d4 - d3) >= 0.0 && (d5 - d6) >= 0.0 {
        let w = (d4 - d3) / ((d4 - d3) + (d5 - d6));
        return *b + (*c - *b) * w;
    }

    let denom = 1.0 / (va + vb + vc);
    let v = vb * denom;
    let w = vc * denom;
    *a + ab * v + ac * w
}

/// Ray/triangle intersection (Möller–Trumbore). Returns the ray parameter of
/// the hit, if any.
pub fn ray_triangle(origin: &Vec3, dir: &Vec3, tri: &[Vec3; 3]) -> Option<f64> {
    let e1 = tri[1] - tri[0];
    let e2 = tri[2] - tri[0];
    let p = dir.cross(&e2);
    let det = e1.dot(&p);
    if det.abs() < 1e-12 {
        return None;
    }
    let inv = 1.0 / det;
    let s = *origin - tri[0];
    let u = s.dot(&p) * inv;
    if !(0.0..=1.0).contains(&u) {
        return None;
    }
    let q = s.cross(&e1);
    let v = dir.dot(&q) * inv;
    if v < 0.0 || u + v > 1.0 {
        return None;
    }
    Some(e2.dot(&q) * inv)
}

/// Odd/even parity containment: a point is inside a closed surface if a ray
/// from it crosses the surface an odd number of times. Crossings closer than
/// [`PARITY_RAY_EPSILON`] are ignored.
pub fn parity_contains(point: &Vec3, triangles: &[[Vec3; 3]]) -> bool {
    let crossings = triangles
        .iter()
        .filter_map(|tri| ray_triangle(point, &PARITY_RAY_DIRECTION, tri))
        .filter(|t| *t > PARITY_RAY_EPSILON)
        .count();
    crossings % 2 == 1
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::f64::consts::FRAC_PI_4;

    fn unit_box_at(position: Vec3, yaw: f64) -> Obb {
        Obb::from_sub_box(
            &SubBox::new(Vec3::zero(), Vec3::splat(1.0)),
            &Pose::new(position, yaw),
            0.0,
        )
    }

    #[test]
    fn compound_is_recentered() {
        let shape = Shape::compound(vec![
            SubBox::new(Vec3::new(0.0, 0.0, 0.0), Vec3::splat(1.0)),
            SubBox::new(Vec3::new(2.0, 0.0, 0.0), Vec3::splat(1.0)),
        ])
        .unwrap();
        let aabb = shape.local_aabb();
        assert_relative_eq!(aabb.center().x, 0.0);
        assert_relative_eq!(aabb.size().x, 4.0);
    }

    #[test]
    fn degenerate_shapes_are_rejected() {
        assert!(Shape::cuboid(Vec3::new(1.0, 0.0, 1.0)).is_err());
        assert!(Shape::sphere(-2.0).is_err());
        assert!(Shape::compound(Vec::new()).is_err());
    }

    #[test]
    fn rotated_box_aabb_grows() {
        let obb = unit_box_at(Vec3::zero(), FRAC_PI_4);
        let aabb = obb.aabb();
        assert_relative_eq!(aabb.max.x, 2f64.sqrt(), epsilon = 1e-9);
        assert_relative_eq!(aabb.max.y, 1.0, epsilon = 1e-9);
    }

    #[test]
    fn sat_separates_rotated_boxes_whose_aabbs_overlap() {
        let a = unit_box_at(Vec3::zero(), FRAC_PI_4);
        let b = unit_box_at(Vec3::new(2.3, 0.0, 2.3), FRAC_PI_4);
        assert!(a.aabb().intersects(&b.aabb()));
        assert!(!a.intersects(&b));
        let c = unit_box_at(Vec3::new(1.5, 0.0, 0.0), 0.0);
        assert!(a.intersects(&c));
    }

    #[test]
    fn closest_point_on_box_clamps_to_surface() {
        let obb = unit_box_at(Vec3::zero(), 0.0);
        let p = obb.closest_point(&Vec3::new(5.0, 0.5, -3.0));
        assert_eq!(p, Vec3::new(1.0, 0.5, -1.0));
        let inside = Vec3::new(0.2, 0.1, 0.0);
        assert_eq!(obb.closest_point(&inside), inside);
    }

    #[test]
    fn closest_point_on_triangle_regions() {
        let a = Vec3::new(0.0, 0.0, 0.0);
        let b = Vec3::new(4.0, 0.0, 0.0);
        let c = Vec3::new(0.0, 0.0, 4.0);
        assert_eq!(closest_point_on_triangle(&Vec3::new(-1.0, 0.0, -1.0), &a, &b, &c), a);
        assert_eq!(
            closest_point_on_triangle(&Vec3::new(1.0, 3.0, 1.0), &a, &b, &c),
            Vec3::new(1.0, 0.0, 1.0)
        );
        let on_edge = closest_point_on_triangle(&Vec3::new(2.0, 0.0, -2.0), &a, &b, &c);
        assert_relative_eq!(on_edge.x, 2.0);
        assert_relative_eq!(on_edge.z, 0.0);
    }

    #[test]
    fn parity_detects_inside_and_outside() {
        let tris = unit_box_at(Vec3::new(3.0, 0.0, 0.0), 0.3).triangles();
        assert_eq!(tris.len(), 12);
        assert!(parity_contains(&Vec3::new(3.0, 0.0, 0.0), &tris));
        assert!(parity_contains(&Vec3::new(3.4, 0.5, -0.2), &tris));
        assert!(!parity_contains(&Vec3::new(0.0, 0.0, 0.0), &tris));
        assert!(!parity_contains(&Vec3::new(6.0, 0.0, 0.0), &tris));
    }

    #[test]
    fn sphere_contains_point_respects_margin() {
        let shape = Shape::sphere(5.0).unwrap();
        let pose = Pose::new(Vec3::zero(), 0.0);
        assert!(shape.contains_point(&pose, &Vec3::new(4.9, 0.0, 0.0), 0.0));
        assert!(!shape.contains_point(&pose, &Vec3::new(4.9, 0.0, 0.0), 0.25));
    }
}
