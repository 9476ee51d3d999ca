//! Resting-position solver and zone clamping.
//!
//! Resting heights come from a linear upward scan rather than analytic
//! stacking, so arbitrary footprints (compounds, spheres) rest correctly.

use crate::collision::overlaps_any;
use crate::engine::EngineConfig;
use crate::error::Result;
use crate::geometry::Pose;
use crate::model::{ObjectId, PlacedObject, Scene, ZoneId};
use crate::types::EPSILON_GENERAL;

/// Lowest legal center height for `object` at its current horizontal
/// position inside `zone`.
///
/// Scans upward from the zone floor plus the object's half height in steps
/// of `config.rest_step`. Returns the current height unchanged when no legal
/// height exists below the ceiling; callers decide whether that is a
/// rejection.
pub fn resting_y(scene: &Scene, object: &PlacedObject, zone: ZoneId, config: &EngineConfig) -> f64 {
    let zone = scene.layout.zone(zone);
    let aabb = object.world_aabb();
    // Distance from the pose origin down to the bottom of the solid.
    let below = object.pose.position.y - aabb.min.y;
    let above = aabb.max.y - object.pose.position.y;
    let start = zone.floor() + below;
    let top = zone.ceiling() - above;
    let step = config.rest_step.max(EPSILON_GENERAL);

    let mut k = 0usize;
    loop {
        let y = start + step * k as f64;
        if y > top + EPSILON_GENERAL {
            break;
        }
        let mut candidate = object.clone();
        candidate.pose.position.y = y;
        if !overlaps_any(scene, &candidate, Some(object.id), config) {
            return y;
        }
        k += 1;
    }
    object.pose.position.y
}

/// Moves the object to its resting height within its derived zone.
pub fn settle(scene: &mut Scene, id: ObjectId, config: &EngineConfig) -> Result<f64> {
    let object = scene.require(id)?;
    let zone = object.zone(&scene.layout);
    let y = resting_y(scene, object, zone, config);
    let mut pose = object.pose;
    pose.position.y = y;
    scene.set_pose(id, pose)?;
    Ok(y)
}

/// Clamps the object into the bounds of its derived zone and re-settles it.
pub fn clamp_into_zone(scene: &mut Scene, id: ObjectId, config: &EngineConfig) -> Result<Pose> {
    let object = scene.require(id)?;
    let zone = scene.layout.zone(object.zone(&scene.layout));
    let shift = zone.clamp_shift(&object.world_aabb());
    let pose = Pose::new(object.pose.position + shift, object.pose.yaw);
    scene.set_pose(id, pose)?;
    settle(scene, id, config)?;
    scene.pose_of(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Layout, ObjectSpec};
    use crate::types::Vec3;
    use approx::assert_relative_eq;

    fn scene_with_cube(position: Vec3) -> (Scene, ObjectId) {
        let mut scene = Scene::new(Layout::default());
        let id = scene
            .add(ObjectSpec::cube(10.0, 10.0, 10.0), Pose::new(position, 0.0))
            .unwrap();
        (scene, id)
    }

    #[test]
    fn rests_on_the_floor() {
        let (mut scene, id) = scene_with_cube(Vec3::new(0.0, 60.0, 0.0));
        let config = EngineConfig::default();
        let y = settle(&mut scene, id, &config).unwrap();
        assert_relative_eq!(y, 5.0);
    }

    #[test]
    fn stacks_on_top_of_another_object() {
        let (mut scene, _) = scene_with_cube(Vec3::new(0.0, 5.0, 0.0));
        let config = EngineConfig::default();
        let upper = scene
            .add(ObjectSpec::cube(10.0, 10.0, 10.0), Pose::new(Vec3::new(2.0, 80.0, 2.0), 0.0))
            .unwrap();
        let y = settle(&mut scene, upper, &config).unwrap();
        assert!(y >= 15.0 - 2.0 * config.contact_epsilon - 1e-9, "y = {y}");
        assert!(y <= 15.0 + config.rest_step, "y = {y}");
    }

    #[test]
    fn settling_is_idempotent() {
        let (mut scene, _) = scene_with_cube(Vec3::new(0.0, 5.0, 0.0));
        let config = EngineConfig::default();
        let id = scene
            .add(ObjectSpec::sphere(8.0), Pose::new(Vec3::new(3.0, 70.0, -1.0), 0.0))
            .unwrap();
        let first = settle(&mut scene, id, &config).unwrap();
        let second = settle(&mut scene, id, &config).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn staging_floor_is_lower() {
        let (mut scene, id) = scene_with_cube(Vec3::new(185.0, 30.0, 0.0));
        let y = settle(&mut scene, id, &EngineConfig::default()).unwrap();
        assert_relative_eq!(y, 4.0);
    }

    #[test]
    fn no_legal_height_keeps_current() {
        let mut scene = Scene::new(Layout::new(Vec3::new(20.0, 12.0, 20.0), Vec3::splat(50.0), 5.0));
        let config = EngineConfig::default();
        scene
            .add(ObjectSpec::cube(20.0, 10.0, 20.0), Pose::new(Vec3::new(0.0, 5.0, 0.0), 0.0))
            .unwrap();
        let id = scene
            .add(ObjectSpec::cube(10.0, 10.0, 10.0), Pose::new(Vec3::new(0.0, 7.0, 0.0), 0.0))
            .unwrap();
        let object = scene.require(id).unwrap();
        assert_eq!(resting_y(&scene, object, ZoneId::Container, &config), 7.0);
    }

    #[test]
    fn clamp_pulls_object_back_inside() {
        let (mut scene, id) = scene_with_cube(Vec3::new(53.0, 40.0, -70.0));
        let pose = clamp_into_zone(&mut scene, id, &EngineConfig::default()).unwrap();
        assert_relative_eq!(pose.position.x, 50.0);
        assert_relative_eq!(pose.position.z, -50.0);
        assert_relative_eq!(pose.position.y, 5.0);
    }
}
