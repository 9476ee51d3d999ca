//! Penetration resolver based on minimum axis-aligned translations.

use log::{debug, warn};

use crate::collision::{first_overlap, overlaps};
use crate::engine::EngineConfig;
use crate::error::{EngineError, Result};
use crate::geometry::Pose;
use crate::model::{ObjectId, Scene};
use crate::resting::clamp_into_zone;
use crate::types::{Aabb, Vec3};

/// Smallest of the six axis-aligned translations that moves `a` clear of `b`.
pub fn separating_translation(a: &Aabb, b: &Aabb) -> Vec3 {
    let mut best = Vec3::zero();
    let mut best_len = f64::INFINITY;
    for axis in 0..3 {
        let positive = b.max.axis(axis) - a.min.axis(axis);
        let negative = a.max.axis(axis) - b.min.axis(axis);
        for d in [positive, -negative] {
            if d.abs() < best_len {
                best_len = d.abs();
                best = Vec3::zero().with_axis(axis, d);
            }
        }
    }
    best
}

/// Penetration depth of two boxes: the length of their minimum separating
/// translation, or zero when they do not intersect.
pub fn overlap_depth(a: &Aabb, b: &Aabb) -> f64 {
    if !a.intersects(b) {
        return 0.0;
    }
    (0..3)
        .map(|axis| a.overlap_on_axis(b, axis))
        .fold(f64::INFINITY, f64::min)
}

/// One resolver iteration: pushes the object out of every overlapping
/// same-zone neighbour, then clamps and re-settles it. Returns the ids it was
/// pushed away from.
pub fn resolve_step(scene: &mut Scene, id: ObjectId, config: &EngineConfig) -> Result<Vec<ObjectId>> {
    let mut movers = Vec::new();
    let others: Vec<ObjectId> = scene.objects.iter().map(|o| o.id).filter(|o| *o != id).collect();
    for other_id in others {
        let object = scene.require(id)?;
        let other = scene.require(other_id)?;
        if !overlaps(&scene.layout, object, other, config) {
            continue;
        }
        let (a, b) = (object.world_aabb(), other.world_aabb());
        debug!("object {} penetrates {} by {:.3}", id, other_id, overlap_depth(&a, &b));
        let push = separating_translation(&a, &b) * config.resolver_overshoot;
        let pose = Pose::new(object.pose.position + push, object.pose.yaw);
        scene.set_pose(id, pose)?;
        movers.push(other_id);
    }
    if !movers.is_empty() {
        clamp_into_zone(scene, id, config)?;
    }
    Ok(movers)
}

/// Separates the object from its neighbours, up to
/// `config.resolver_iterations` iterations. Returns whether the object moved.
///
/// Not guaranteed to reach zero overlap; callers re-check with
/// [`first_overlap`] or use [`resolve_or_revert`].
pub fn resolve(scene: &mut Scene, id: ObjectId, config: &EngineConfig) -> Result<bool> {
    let mut changed = false;
    for iteration in 0..config.resolver_iterations {
        let movers = resolve_step(scene, id, config)?;
        if movers.is_empty() {
            break;
        }
        debug!("resolver iteration {} moved object {} away from {:?}", iteration, id, movers);
        changed = true;
    }
    Ok(changed)
}

/// Runs the resolver and reverts the object to `safe` if it still overlaps.
///
/// # Errors
/// `ResidualOverlap` naming the object still in contact.
pub fn resolve_or_revert(scene: &mut Scene, id: ObjectId, safe: Pose, config: &EngineConfig) -> Result<bool> {
    let changed = resolve(scene, id, config)?;
    let object = scene.require(id)?;
    if let Some(other) = first_overlap(scene, object, Some(id), config) {
        warn!("object {} still overlaps {} after resolution, reverting", id, other);
        scene.set_pose(id, safe)?;
        return Err(EngineError::ResidualOverlap { id, other });
    }
    Ok(changed)
}

/// User relocation: moves the object to `target`, clamps it into the zone
/// derived from there and separates it from its neighbours. On residual
/// overlap the object returns to where it was.
pub fn relocate(scene: &mut Scene, id: ObjectId, target: Pose, config: &EngineConfig) -> Result<Pose> {
    let safe = scene.pose_of(id)?;
    scene.set_pose(id, target)?;
    clamp_into_zone(scene, id, config)?;
    resolve_or_revert(scene, id, safe, config)?;
    scene.pose_of(id)
}
