//! Placement search.
//!
//! Two strategies, one per zone kind:
//! - container: exhaustive grid over `(x, z, yaw)` with resting heights,
//!   keeping the best candidate by energy, then height, then `x + z`
//! - staging: expanding ring search over a padded grid around the pad center
//!
//! A failed search leaves the scene untouched. A successful one commits the
//! pose and runs the penetration resolver once as a safety net.

use std::f64::consts::{FRAC_PI_2, PI};

use log::{debug, info};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::collision::overlaps_any;
use crate::engine::EngineConfig;
use crate::error::{EngineError, Result};
use crate::geometry::Pose;
use crate::model::{ObjectId, PlacedObject, Scene, ZoneId};
use crate::penetration::resolve_or_revert;
use crate::resting::resting_y;
use crate::types::{EPSILON_GENERAL, EPSILON_SCORE, Vec3};
use crate::voxel;

/// The four right-angle yaws tried by default.
pub const RIGHT_ANGLES: [f64; 4] = [0.0, FRAC_PI_2, PI, 3.0 * FRAC_PI_2];

/// Tolerance of the container containment check.
const CONTAINMENT_TOLERANCE: f64 = 1e-3;

/// How container candidates are ranked.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Scoring {
    /// Every candidate scores zero, so the tie-breaks (lowest, then
    /// back-left) decide. Cheap.
    Heuristic,
    /// Container energy with the candidate in place.
    Energy,
}

/// Options of the container search.
#[derive(Clone, Debug, PartialEq)]
pub struct PlacementOptions {
    /// Clearance kept from the container walls.
    pub padding: f64,
    /// Multiplier on the grid step derived from the object's size.
    pub step_scale: f64,
    pub angles: Vec<f64>,
    pub scoring: Scoring,
}

impl PlacementOptions {
    pub const DEFAULT_PADDING: f64 = 0.03;

    pub fn new(step_scale: f64, padding: f64, scoring: Scoring) -> Self {
        Self {
            padding,
            step_scale,
            angles: RIGHT_ANGLES.to_vec(),
            scoring,
        }
    }
}

impl Default for PlacementOptions {
    fn default() -> Self {
        Self::new(1.0, Self::DEFAULT_PADDING, Scoring::Energy)
    }
}

/// Grid step for an object: half its lattice unit, or an eighth of its
/// smaller horizontal extent.
pub fn grid_step(object: &PlacedObject, step_scale: f64) -> f64 {
    let base = match object.unit {
        Some(unit) => (unit / 2.0).max(0.35),
        None => {
            let size = object.shape.local_aabb().size();
            (size.x.min(size.z) / 8.0).max(0.35)
        }
    };
    (base * step_scale).max(0.15)
}

fn snap(value: f64, unit: Option<f64>) -> f64 {
    match unit {
        Some(g) if g > 0.0 => (value / g).round() * g,
        _ => value,
    }
}

#[derive(Clone, Copy, Debug)]
struct Candidate {
    pose: Pose,
    energy: f64,
    min_y: f64,
    corner: f64,
}

impl Candidate {
    fn beats(&self, best: &Candidate) -> bool {
        if self.energy < best.energy - EPSILON_SCORE {
            return true;
        }
        if (self.energy - best.energy).abs() >= EPSILON_SCORE {
            return false;
        }
        self.min_y < best.min_y - EPSILON_GENERAL
            || ((self.min_y - best.min_y).abs() < EPSILON_GENERAL && self.corner < best.corner - EPSILON_GENERAL)
    }
}

/// Searches the container for the best legal pose of object `id` and
/// commits it.
///
/// # Errors
/// `PlacementFailed` when no candidate is legal (the scene is unchanged),
/// `ResidualOverlap` when the safety-net resolver could not separate the
/// committed pose (the object is back at its previous pose).
pub fn place_inside_container(
    scene: &mut Scene,
    id: ObjectId,
    options: &PlacementOptions,
    config: &EngineConfig,
) -> Result<Pose> {
    let object = scene.require(id)?.clone();
    let original = object.pose;
    let container = scene.layout.container;
    let step = grid_step(&object, options.step_scale);

    let mut best: Option<Candidate> = None;
    for &yaw in &options.angles {
        let mut probe = object.with_pose(Pose::new(Vec3::zero(), yaw));
        let local = probe.world_aabb();
        let left = container.min.x - local.min.x + options.padding;
        let right = container.max.x - local.max.x - options.padding;
        let back = container.min.z - local.min.z + options.padding;
        let front = container.max.z - local.max.z - options.padding;

        let mut xi = 0usize;
        loop {
            let x = left + step * xi as f64;
            if x > right + EPSILON_GENERAL {
                break;
            }
            let mut zi = 0usize;
            loop {
                let z = back + step * zi as f64;
                if z > front + EPSILON_GENERAL {
                    break;
                }
                probe.pose = Pose::new(Vec3::new(snap(x, object.unit), 0.0, snap(z, object.unit)), yaw);
                probe.pose.position.y = resting_y(scene, &probe, ZoneId::Container, config);

                let aabb = probe.world_aabb();
                if container.aabb().contains_aabb(&aabb, CONTAINMENT_TOLERANCE)
                    && !overlaps_any(scene, &probe, Some(id), config)
                {
                    let energy = match options.scoring {
                        Scoring::Heuristic => 0.0,
                        Scoring::Energy => {
                            scene.set_pose(id, probe.pose)?;
                            voxel::energy(scene, config)
                        }
                    };
                    let candidate = Candidate {
                        pose: probe.pose,
                        energy,
                        min_y: aabb.min.y,
                        corner: aabb.min.x + aabb.min.z,
                    };
                    if best.as_ref().is_none_or(|b| candidate.beats(b)) {
                        best = Some(candidate);
                    }
                }
                zi += 1;
            }
            xi += 1;
        }
    }
    scene.set_pose(id, original)?;

    let Some(best) = best else {
        debug!("no container position for object {}", id);
        return Err(EngineError::PlacementFailed {
            id,
            zone: ZoneId::Container,
        });
    };
    scene.set_pose(id, best.pose)?;
    resolve_or_revert(scene, id, original, config)?;
    info!(
        "placed object {} in container at ({:.2}, {:.2}, {:.2}) yaw {:.2}",
        id, best.pose.position.x, best.pose.position.y, best.pose.position.z, best.pose.yaw
    );
    scene.pose_of(id)
}

/// Ring search over the staging pad.
///
/// Cells are `size + 2` apart, starting at the pad center and growing one
/// ring at a time up to `config.staging_ring_cap`. With `allow_stacking`
/// unset only floor-level cells are accepted.
pub fn place_in_staging(
    scene: &mut Scene,
    id: ObjectId,
    allow_stacking: bool,
    config: &EngineConfig,
) -> Result<Pose> {
    let object = scene.require(id)?.clone();
    let original = object.pose;
    let pad = scene.layout.staging;
    let center = pad.aabb().center();
    let local = object.with_pose(Pose::new(Vec3::zero(), object.pose.yaw)).world_aabb();
    let size = local.size();
    let (step_x, step_z) = (size.x + 2.0, size.z + 2.0);
    let floor_y = pad.floor() - local.min.y;

    let mut probe = object.clone();
    for ring in 0..=config.staging_ring_cap as i64 {
        let reach_x = ring as f64 * step_x;
        let reach_z = ring as f64 * step_z;
        if reach_x - size.x > pad.max.x - center.x && reach_z - size.z > pad.max.z - center.z {
            break;
        }
        for j in -ring..=ring {
            for i in -ring..=ring {
                if i.abs().max(j.abs()) != ring {
                    continue;
                }
                let x = center.x + i as f64 * step_x;
                let z = center.z + j as f64 * step_z;
                probe.pose = Pose::new(Vec3::new(x, floor_y, z), object.pose.yaw);
                let aabb = probe.world_aabb();
                if aabb.min.x < pad.min.x || aabb.max.x > pad.max.x || aabb.min.z < pad.min.z || aabb.max.z > pad.max.z {
                    continue;
                }
                let y = resting_y(scene, &probe, ZoneId::Staging, config);
                if !allow_stacking && (y - floor_y).abs() > EPSILON_GENERAL {
                    continue;
                }
                probe.pose.position.y = y;
                if probe.world_aabb().max.y > pad.ceiling() + CONTAINMENT_TOLERANCE
                    || overlaps_any(scene, &probe, Some(id), config)
                {
                    continue;
                }
                scene.set_pose(id, probe.pose)?;
                resolve_or_revert(scene, id, original, config)?;
                debug!("staged object {} in ring {}", id, ring);
                return scene.pose_of(id);
            }
        }
    }
    Err(EngineError::PlacementFailed {
        id,
        zone: ZoneId::Staging,
    })
}

/// Staging placement on the floor first, then stacked when
/// `config.staging_stacking` allows it. On failure the object keeps its last
/// legal pose.
pub fn rescue_to_staging(scene: &mut Scene, id: ObjectId, config: &EngineConfig) -> Result<Pose> {
    match place_in_staging(scene, id, false, config) {
        Ok(pose) => Ok(pose),
        Err(err @ EngineError::PlacementFailed { .. }) if !config.staging_stacking => {
            log::warn!("staging floor is full for object {}", id);
            Err(err)
        }
        Err(EngineError::PlacementFailed { .. }) => place_in_staging(scene, id, true, config).inspect_err(|err| {
            log::warn!("staging rescue failed for object {}: {}", id, err);
        }),
        Err(err) => Err(err),
    }
}

/// Container search, falling back to the staging zone.
pub fn place_with_fallback(
    scene: &mut Scene,
    id: ObjectId,
    options: &PlacementOptions,
    config: &EngineConfig,
) -> Result<(ZoneId, Pose)> {
    match place_inside_container(scene, id, options, config) {
        Ok(pose) => Ok((ZoneId::Container, pose)),
        Err(EngineError::PlacementFailed { .. } | EngineError::ResidualOverlap { .. }) => {
            info!("object {} does not fit the container, moving it to staging", id);
            rescue_to_staging(scene, id, config).map(|pose| (ZoneId::Staging, pose))
        }
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collision::overlapping_pairs;
    use crate::model::{Layout, ObjectKind, ObjectSpec};
    use approx::assert_relative_eq;

    fn small_layout() -> Layout {
        Layout::new(Vec3::splat(30.0), Vec3::new(60.0, 60.0, 60.0), 10.0)
    }

    fn staged(scene: &mut Scene, spec: ObjectSpec) -> ObjectId {
        let x = scene.layout.staging.aabb().center().x;
        scene.add(spec, Pose::new(Vec3::new(x, 200.0, 0.0), 0.0)).unwrap()
    }

    #[test]
    fn two_cubes_rest_on_the_container_floor() {
        let mut scene = Scene::new(small_layout());
        let config = EngineConfig::default();
        let options = PlacementOptions {
            scoring: Scoring::Heuristic,
            ..PlacementOptions::default()
        };
        let a = staged(&mut scene, ObjectSpec::cube(10.0, 10.0, 10.0));
        let b = staged(&mut scene, ObjectSpec::cube(10.0, 10.0, 10.0));
        let pa = place_inside_container(&mut scene, a, &options, &config).unwrap();
        let pb = place_inside_container(&mut scene, b, &options, &config).unwrap();

        assert_relative_eq!(pa.position.y, 5.0);
        assert_relative_eq!(pb.position.y, 5.0);
        assert_eq!(scene.layout.zone_of(&pa.position), Some(ZoneId::Container));
        assert!(overlapping_pairs(&scene, &config).is_empty());
    }

    #[test]
    fn energy_scoring_yields_a_legal_pose() {
        let mut scene = Scene::new(small_layout());
        let config = EngineConfig::default();
        let options = PlacementOptions::new(2.0, 0.03, Scoring::Energy);
        let a = staged(&mut scene, ObjectSpec::cube(12.0, 8.0, 10.0));
        let b = staged(&mut scene, ObjectSpec::new(ObjectKind::TetT, (5.0, 5.0, 5.0)));
        for id in [a, b] {
            let pose = place_inside_container(&mut scene, id, &options, &config).unwrap();
            let aabb = scene.require(id).unwrap().world_aabb();
            assert!(scene.layout.container.aabb().contains_aabb(&aabb, 1e-3));
            assert_eq!(scene.layout.zone_of(&pose.position), Some(ZoneId::Container));
        }
        assert!(overlapping_pairs(&scene, &config).is_empty());
    }

    #[test]
    fn oversized_object_fails_and_leaves_scene_unchanged() {
        let mut scene = Scene::new(small_layout());
        let config = EngineConfig::default();
        let small = staged(&mut scene, ObjectSpec::cube(5.0, 5.0, 5.0));
        place_inside_container(&mut scene, small, &PlacementOptions::default(), &config).unwrap();
        let big = staged(&mut scene, ObjectSpec::cube(31.0, 5.0, 5.0));
        let before = scene.snapshot();

        let err = place_inside_container(&mut scene, big, &PlacementOptions::default(), &config).unwrap_err();
        assert_eq!(
            err,
            EngineError::PlacementFailed {
                id: big,
                zone: ZoneId::Container
            }
        );
        assert_eq!(scene.snapshot(), before);
    }

    #[test]
    fn staging_queues_without_overlap() {
        let mut scene = Scene::new(small_layout());
        let config = EngineConfig::default();
        let ids: Vec<_> = (0..5).map(|_| staged(&mut scene, ObjectSpec::cube(8.0, 8.0, 8.0))).collect();
        for id in &ids {
            let pose = rescue_to_staging(&mut scene, *id, &config).unwrap();
            assert_eq!(scene.layout.zone_of(&pose.position), Some(ZoneId::Staging));
            assert_relative_eq!(pose.position.y, scene.layout.staging.floor() + 4.0);
        }
        assert!(overlapping_pairs(&scene, &config).is_empty());
        let first = scene.pose_of(ids[0]).unwrap().position;
        assert_relative_eq!(first.x, scene.layout.staging.aabb().center().x);
        assert_relative_eq!(first.z, 0.0);
    }

    #[test]
    fn full_staging_floor_falls_back_to_stacking() {
        let layout = Layout::new(Vec3::splat(30.0), Vec3::new(12.0, 60.0, 12.0), 10.0);
        let mut scene = Scene::new(layout);
        let config = EngineConfig::default();
        let a = staged(&mut scene, ObjectSpec::cube(10.0, 10.0, 10.0));
        let b = staged(&mut scene, ObjectSpec::cube(10.0, 10.0, 10.0));
        rescue_to_staging(&mut scene, a, &config).unwrap();
        assert!(place_in_staging(&mut scene, b, false, &config).is_err());
        let pose = rescue_to_staging(&mut scene, b, &config).unwrap();
        assert!(pose.position.y > 10.0);
        assert!(overlapping_pairs(&scene, &config).is_empty());
    }

    #[test]
    fn stacking_can_be_disabled() {
        let layout = Layout::new(Vec3::splat(30.0), Vec3::new(12.0, 60.0, 12.0), 10.0);
        let mut scene = Scene::new(layout);
        let config = EngineConfig::builder().staging_stacking(false).build();
        let a = staged(&mut scene, ObjectSpec::cube(10.0, 10.0, 10.0));
        let b = staged(&mut scene, ObjectSpec::cube(10.0, 10.0, 10.0));
        rescue_to_staging(&mut scene, a, &config).unwrap();
        let before = scene.pose_of(b).unwrap();
        assert!(rescue_to_staging(&mut scene, b, &config).is_err());
        assert_eq!(scene.pose_of(b).unwrap(), before);
    }

    #[test]
    fn fallback_routes_oversized_objects_to_staging() {
        let mut scene = Scene::new(small_layout());
        let config = EngineConfig::default();
        let big = staged(&mut scene, ObjectSpec::cube(40.0, 10.0, 10.0));
        let (zone, pose) = place_with_fallback(&mut scene, big, &PlacementOptions::default(), &config).unwrap();
        assert_eq!(zone, ZoneId::Staging);
        assert_eq!(scene.layout.zone_of(&pose.position), Some(ZoneId::Staging));
    }

    #[test]
    fn lattice_shapes_use_their_unit_for_the_step() {
        let spec = ObjectSpec::new(ObjectKind::TetI, (4.0, 4.0, 4.0));
        let object = PlacedObject::from_spec(1, spec, Pose::default()).unwrap();
        assert_relative_eq!(grid_step(&object, 1.0), 2.0);
        assert_relative_eq!(grid_step(&object, 0.05), 0.15);
    }
}
