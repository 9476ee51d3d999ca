//! Deterministic-pass refinement: global compaction, shake and right-angle
//! reorientation of container objects.

use log::debug;
use rand::Rng;
use rand::seq::SliceRandom;

use crate::collision::overlaps_any;
use crate::engine::EngineConfig;
use crate::error::Result;
use crate::geometry::Pose;
use crate::model::{Layout, ObjectId, PlacedObject, Scene, ZoneId};
use crate::placement::RIGHT_ANGLES;
use crate::resting::clamp_into_zone;
use crate::types::{EPSILON_GENERAL, EPSILON_SCORE, Vec3};
use crate::voxel;

/// Energy difference treated as a tie during compaction.
const ENERGY_TOLERANCE: f64 = 1e-6;

/// Horizontal step of the shake slide and jitter.
const SHAKE_STEP: f64 = 0.6;

/// Upper bound on kept moves per object and pass.
const MAX_MOVES_PER_OBJECT: usize = 256;

/// Cardinal move order: +x, -x, +z, -z.
const CARDINALS: [(f64, f64); 4] = [(1.0, 0.0), (-1.0, 0.0), (0.0, 1.0), (0.0, -1.0)];

/// Distance of the object's AABB min corner from the container's back-left
/// floor corner, plus a quarter of its height above the floor. Lower is more
/// compact.
pub fn anchor_score(layout: &Layout, object: &PlacedObject) -> f64 {
    let cb = layout.container.aabb();
    let b = object.world_aabb();
    (b.min.x - cb.min.x) + (b.min.z - cb.min.z) + 0.25 * (b.min.y - layout.container.floor()).max(0.0)
}

fn compaction_step(object: &PlacedObject) -> f64 {
    object.unit.unwrap_or(2.0).max(0.5)
}

/// Moves the object horizontally by `(dx, dz)`, clamps and re-settles it.
/// Reverts and returns `false` when the result overlaps.
fn try_shift(scene: &mut Scene, id: ObjectId, dx: f64, dz: f64, config: &EngineConfig) -> Result<bool> {
    let old = scene.pose_of(id)?;
    let target = Pose::new(old.position + Vec3::new(dx, 0.0, dz), old.yaw);
    scene.set_pose(id, target)?;
    clamp_into_zone(scene, id, config)?;
    let object = scene.require(id)?;
    if overlaps_any(scene, object, Some(id), config) {
        scene.set_pose(id, old)?;
        return Ok(false);
    }
    Ok(true)
}

fn container_ids(scene: &Scene) -> Vec<ObjectId> {
    scene.ids_in_zone(ZoneId::Container)
}

/// Unit-step moves along the four horizontal cardinals, kept only when they
/// strictly lower the energy or, on an energy tie, the anchor score.
///
/// Objects are visited in a random order per pass. Returns the number of
/// kept moves.
pub fn global_compaction<R: Rng>(scene: &mut Scene, passes: usize, rng: &mut R, config: &EngineConfig) -> Result<usize> {
    let mut kept = 0;
    for _ in 0..passes {
        let mut order = container_ids(scene);
        order.shuffle(rng);
        for id in order {
            let safe = scene.pose_of(id)?;
            clamp_into_zone(scene, id, config)?;
            if overlaps_any(scene, scene.require(id)?, Some(id), config) {
                scene.set_pose(id, safe)?;
            }

            let step = compaction_step(scene.require(id)?);
            for _ in 0..MAX_MOVES_PER_OBJECT {
                let e0 = voxel::energy(scene, config);
                let mut improved = false;
                for (dx, dz) in CARDINALS {
                    let before = scene.pose_of(id)?;
                    let old_anchor = anchor_score(&scene.layout, scene.require(id)?);
                    if !try_shift(scene, id, dx * step, dz * step, config)? {
                        continue;
                    }
                    let e1 = voxel::energy(scene, config);
                    let new_anchor = anchor_score(&scene.layout, scene.require(id)?);
                    let better = e1 < e0 - ENERGY_TOLERANCE
                        || ((e1 - e0).abs() < ENERGY_TOLERANCE && new_anchor < old_anchor - ENERGY_TOLERANCE);
                    if better {
                        improved = true;
                        break;
                    }
                    scene.set_pose(id, before)?;
                }
                if !improved {
                    break;
                }
                kept += 1;
            }
        }
    }
    debug!("global compaction kept {} moves", kept);
    Ok(kept)
}

/// Slides every container object toward the back-left corner and applies
/// one random jitter per slide, discarding any jitter that overlaps.
pub fn shake_and_settle<R: Rng>(scene: &mut Scene, iterations: usize, rng: &mut R, config: &EngineConfig) -> Result<()> {
    for _ in 0..iterations {
        let mut order: Vec<(ObjectId, f64)> = container_ids(scene)
            .into_iter()
            .filter_map(|id| scene.get(id).map(|o| (id, anchor_score(&scene.layout, o))))
            .collect();
        order.sort_by(|a, b| a.1.total_cmp(&b.1));

        for (id, _) in order {
            for _ in 0..MAX_MOVES_PER_OBJECT {
                let before = scene.pose_of(id)?.position;
                let slid = try_shift(scene, id, -SHAKE_STEP, -SHAKE_STEP, config)?
                    && scene.pose_of(id)?.position.distance_to(&before) > EPSILON_GENERAL;

                let rx = rng.gen_range(-0.5..0.5) * SHAKE_STEP;
                let rz = rng.gen_range(-0.5..0.5) * SHAKE_STEP;
                try_shift(scene, id, rx, rz, config)?;
                if !slid {
                    break;
                }
            }
        }
    }
    Ok(())
}

/// Tries the four right-angle yaws and keeps the one with the lowest energy
/// if it strictly improves on the current pose.
pub fn try_best_axis_orientation(scene: &mut Scene, id: ObjectId, config: &EngineConfig) -> Result<bool> {
    let original = scene.pose_of(id)?;
    let base = voxel::energy(scene, config);
    let mut best: Option<(f64, Pose)> = None;

    for yaw in RIGHT_ANGLES {
        scene.set_pose(id, Pose::new(original.position, yaw))?;
        clamp_into_zone(scene, id, config)?;
        let object = scene.require(id)?;
        if overlaps_any(scene, object, Some(id), config) {
            continue;
        }
        let e = voxel::energy(scene, config);
        if best.is_none_or(|(be, _)| e < be) {
            best = Some((e, scene.pose_of(id)?));
        }
    }

    match best {
        Some((e, pose)) if e + EPSILON_SCORE < base => {
            scene.set_pose(id, pose)?;
            debug!("object {} reoriented to yaw {:.2}", id, pose.yaw);
            Ok(true)
        }
        _ => {
            scene.set_pose(id, original)?;
            Ok(false)
        }
    }
}
