//! Pairwise overlap detection.
//!
//! Tests run cheapest first: a broad phase on shrunken world AABBs, then a
//! narrow phase chosen by the closed set of shape kinds. Objects in different
//! zones never overlap.

use crate::engine::{EngineConfig, NarrowPhase};
use crate::geometry::{Shape, closest_point_on_triangle, parity_contains};
use crate::model::{Layout, ObjectId, PlacedObject, Scene};
use crate::types::Vec3;

/// True iff `a` and `b` share a zone and their solids intersect by more than
/// the contact epsilon.
pub fn overlaps(layout: &Layout, a: &PlacedObject, b: &PlacedObject, config: &EngineConfig) -> bool {
    if a.zone(layout) != b.zone(layout) {
        return false;
    }
    solids_intersect(a, b, config)
}

/// Zone-agnostic solid intersection test.
pub fn solids_intersect(a: &PlacedObject, b: &PlacedObject, config: &EngineConfig) -> bool {
    let eps = config.contact_epsilon;
    let broad_a = a.world_aabb().shrink(eps);
    let broad_b = b.world_aabb().shrink(eps);
    if !broad_a.intersects(&broad_b) {
        return false;
    }

    match (&a.shape, &b.shape) {
        (Shape::Sphere { radius: ra }, Shape::Sphere { radius: rb }) => {
            let reach = (ra - eps).max(0.0) + (rb - eps).max(0.0);
            a.pose.position.distance_squared(&b.pose.position) < reach * reach
        }
        (Shape::Sphere { radius }, _) => sphere_hits_solid(&a.pose.position, *radius, b, config),
        (_, Shape::Sphere { radius }) => sphere_hits_solid(&b.pose.position, *radius, a, config),
        (Shape::Box { .. } | Shape::Compound { .. }, Shape::Box { .. } | Shape::Compound { .. }) => {
            match config.narrow_phase {
                NarrowPhase::Obb => obb_pairs_intersect(a, b, eps),
                NarrowPhase::Mesh => corners_contained(a, b, eps) || corners_contained(b, a, eps),
            }
        }
    }
}

fn sphere_hits_solid(center: &Vec3, radius: f64, other: &PlacedObject, config: &EngineConfig) -> bool {
    let eps = config.contact_epsilon;
    let r = (radius - eps).max(0.0);
    let r2 = r * r;
    match config.narrow_phase {
        NarrowPhase::Obb => other.shape.world_obbs(&other.pose, eps).iter().any(|obb| {
            obb.contains_point(center) || obb.closest_point(center).distance_squared(center) <= r2
        }),
        NarrowPhase::Mesh => {
            let triangles = other.shape.world_triangles(&other.pose, eps);
            let near_surface = triangles
                .iter()
                .any(|t| closest_point_on_triangle(center, &t[0], &t[1], &t[2]).distance_squared(center) <= r2);
            near_surface || parity_contains(center, &triangles)
        }
    }
}

fn obb_pairs_intersect(a: &PlacedObject, b: &PlacedObject, eps: f64) -> bool {
    let obbs_b = b.shape.world_obbs(&b.pose, eps);
    a.shape
        .world_obbs(&a.pose, eps)
        .iter()
        .any(|oa| obbs_b.iter().any(|ob| oa.intersects(ob)))
}

/// Whether any corner (or center) of `a`'s sub-boxes lies inside `b`'s
/// surface by parity. Misses edge-through-face penetrations.
fn corners_contained(a: &PlacedObject, b: &PlacedObject, eps: f64) -> bool {
    let triangles = b.shape.world_triangles(&b.pose, eps);
    a.shape.world_obbs(&a.pose, eps).iter().any(|obb| {
        parity_contains(&obb.center, &triangles)
            || obb.corners().iter().any(|c| parity_contains(c, &triangles))
    })
}

/// First object in the candidate's zone that overlaps it, skipping `ignore`.
pub fn first_overlap(
    scene: &Scene,
    candidate: &PlacedObject,
    ignore: Option<ObjectId>,
    config: &EngineConfig,
) -> Option<ObjectId> {
    scene
        .objects
        .iter()
        .filter(|other| Some(other.id) != ignore)
        .find(|other| overlaps(&scene.layout, candidate, other, config))
        .map(|other| other.id)
}

pub fn overlaps_any(
    scene: &Scene,
    candidate: &PlacedObject,
    ignore: Option<ObjectId>,
    config: &EngineConfig,
) -> bool {
    first_overlap(scene, candidate, ignore, config).is_some()
}

/// Every overlapping same-zone pair in the scene.
pub fn overlapping_pairs(scene: &Scene, config: &EngineConfig) -> Vec<(ObjectId, ObjectId)> {
    let mut pairs = Vec::new();
    for (i, a) in scene.objects.iter().enumerate() {
        for b in &scene.objects[i + 1..] {
            if overlaps(&scene.layout, a, b, config) {
                pairs.push((a.id, b.id));
            }
        }
    }
    pairs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Pose;
    use crate::model::{ObjectKind, ObjectSpec};
    use std::f64::consts::FRAC_PI_4;

    fn object(id: ObjectId, spec: ObjectSpec, position: Vec3, yaw: f64) -> PlacedObject {
        PlacedObject::from_spec(id, spec, Pose::new(position, yaw)).unwrap()
    }

    fn both_modes() -> [EngineConfig; 2] {
        [
            EngineConfig::default(),
            EngineConfig::builder().narrow_phase(NarrowPhase::Mesh).build(),
        ]
    }

    #[test]
    fn spheres_overlap_by_center_distance() {
        let layout = Layout::default();
        for config in both_modes() {
            let a = object(1, ObjectSpec::sphere(10.0), Vec3::new(0.0, 20.0, 0.0), 0.0);
            let near = object(2, ObjectSpec::sphere(10.0), Vec3::new(3.0, 20.0, 0.0), 0.0);
            let far = object(3, ObjectSpec::sphere(10.0), Vec3::new(11.0, 20.0, 0.0), 0.0);
            assert!(overlaps(&layout, &a, &near, &config));
            assert!(!overlaps(&layout, &a, &far, &config));
        }
    }

    #[test]
    fn touching_boxes_are_legal() {
        let layout = Layout::default();
        for config in both_modes() {
            let a = object(1, ObjectSpec::cube(10.0, 10.0, 10.0), Vec3::new(0.0, 5.0, 0.0), 0.0);
            let b = object(2, ObjectSpec::cube(10.0, 10.0, 10.0), Vec3::new(10.0, 5.0, 0.0), 0.0);
            let c = object(3, ObjectSpec::cube(10.0, 10.0, 10.0), Vec3::new(8.0, 6.0, 2.0), 0.0);
            assert!(!overlaps(&layout, &a, &b, &config));
            assert!(overlaps(&layout, &a, &c, &config));
        }
    }

    #[test]
    fn different_zones_never_overlap() {
        let layout = Layout::default();
        let config = EngineConfig::default();
        // The solids intersect across the gap, but their centers fall in different zones.
        let a = object(1, ObjectSpec::cube(30.0, 10.0, 10.0), Vec3::new(54.0, 5.0, 0.0), 0.0);
        let b = object(2, ObjectSpec::cube(30.0, 10.0, 10.0), Vec3::new(76.0, 5.0, 0.0), 0.0);
        assert!(solids_intersect(&a, &b, &config));
        assert_ne!(a.zone(&layout), b.zone(&layout));
        assert!(!overlaps(&layout, &a, &b, &config));

        let staged = object(3, ObjectSpec::cube(4.0, 4.0, 4.0), Vec3::new(185.0, 1.0, 0.0), 0.0);
        let staged_too = object(4, ObjectSpec::cube(4.0, 4.0, 4.0), Vec3::new(186.0, 1.0, 0.0), 0.0);
        assert!(overlaps(&layout, &staged, &staged_too, &config));
    }

    #[test]
    fn rotated_boxes_separate_despite_aabb_overlap() {
        let layout = Layout::default();
        let config = EngineConfig::default();
        let a = object(1, ObjectSpec::cube(10.0, 10.0, 10.0), Vec3::new(0.0, 5.0, 0.0), FRAC_PI_4);
        let b = object(2, ObjectSpec::cube(10.0, 10.0, 10.0), Vec3::new(11.0, 5.0, 11.0), FRAC_PI_4);
        assert!(a.world_aabb().shrink(0.25).intersects(&b.world_aabb().shrink(0.25)));
        assert!(!overlaps(&layout, &a, &b, &config));
    }

    #[test]
    fn box_in_l_shape_notch_is_legal() {
        let layout = Layout::default();
        for config in both_modes() {
            let l = object(1, ObjectSpec::new(ObjectKind::LShape, (10.0, 10.0, 10.0)), Vec3::new(0.0, 20.0, 0.0), 0.0);
            let in_notch = object(2, ObjectSpec::cube(8.0, 8.0, 8.0), Vec3::new(5.0, 25.0, 5.0), 0.0);
            let in_arm = object(3, ObjectSpec::cube(8.0, 8.0, 8.0), Vec3::new(5.0, 15.0, -5.0), 0.0);
            assert!(!overlaps(&layout, &l, &in_notch, &config));
            assert!(overlaps(&layout, &l, &in_arm, &config));
        }
    }

    #[test]
    fn sphere_against_box() {
        let layout = Layout::default();
        for config in both_modes() {
            let cube = object(1, ObjectSpec::cube(10.0, 10.0, 10.0), Vec3::new(0.0, 5.0, 0.0), 0.0);
            let grazing = object(2, ObjectSpec::sphere(10.0), Vec3::new(10.5, 5.0, 0.0), 0.0);
            let biting = object(3, ObjectSpec::sphere(10.0), Vec3::new(8.0, 5.0, 0.0), 0.0);
            let inside = object(4, ObjectSpec::sphere(2.0), Vec3::new(0.0, 5.0, 0.0), 0.0);
            assert!(!overlaps(&layout, &cube, &grazing, &config));
            assert!(overlaps(&layout, &cube, &biting, &config));
            assert!(overlaps(&layout, &inside, &cube, &config));
        }
    }

    #[test]
    fn first_overlap_honors_ignore() {
        let mut scene = Scene::new(Layout::default());
        let config = EngineConfig::default();
        let id = scene
            .add(ObjectSpec::cube(10.0, 10.0, 10.0), Pose::new(Vec3::new(0.0, 5.0, 0.0), 0.0))
            .unwrap();
        let clone = scene.require(id).unwrap().clone();
        assert_eq!(first_overlap(&scene, &clone, None, &config), Some(id));
        assert_eq!(first_overlap(&scene, &clone, Some(id), &config), None);
        assert!(overlapping_pairs(&scene, &config).is_empty());
    }
}
