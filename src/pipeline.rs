//! Multi-stage packing flows built from the engine primitives.
//!
//! Every flow yields to the scheduler between objects, so a caller running it
//! on an async task keeps the runtime responsive.

use log::{info, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use utoipa::ToSchema;

use crate::collision::{overlapping_pairs, overlaps_any};
use crate::compaction::{global_compaction, shake_and_settle, try_best_axis_orientation};
use crate::engine::EngineConfig;
use crate::error::{EngineError, Result};
use crate::geometry::Pose;
use crate::model::{ObjectId, Scene, ZoneId};
use crate::optimizer::{AnnealConfig, AnnealState, Annealer, CancelToken};
use crate::placement::{PlacementOptions, Scoring, place_in_staging, place_inside_container, rescue_to_staging};
use crate::resting::clamp_into_zone;
use crate::voxel::{self, VoidReport};

/// Share of objects, by volume rank, placed with the cheap heuristic.
pub const BIG_RATIO: f64 = 0.6;

/// `(step_scale, padding)` of the big-object pass.
const BIG_PASS: (f64, f64) = (1.0, 0.05);
/// Fine then ultra-fine passes for the remaining objects.
const SMALL_PASSES: [(f64, f64); 2] = [(0.5, 0.02), (0.33, 0.02)];
/// Passes used when pulling staged objects into the container.
const STAGE_PASSES: [(f64, f64); 3] = [(1.0, 0.04), (0.55, 0.02), (0.33, 0.02)];
/// Last-chance passes for objects still staged after a full pack.
const LEFTOVER_PASSES: [(f64, f64); 3] = [(0.55, 0.02), (0.33, 0.02), (0.22, 0.015)];

/// Where each object ended up after a flow.
#[derive(Clone, Debug, Default, PartialEq, Serialize, ToSchema)]
pub struct PackOutcome {
    pub placed: Vec<ObjectId>,
    pub staged: Vec<ObjectId>,
    /// Objects whose last legal pose lies in neither zone.
    pub stranded: Vec<ObjectId>,
}

impl PackOutcome {
    fn record(&mut self, id: ObjectId, zone: Option<ZoneId>) {
        match zone {
            Some(ZoneId::Container) => self.placed.push(id),
            Some(ZoneId::Staging) => self.staged.push(id),
            None => self.stranded.push(id),
        }
    }
}

/// Summary of a full packing run.
#[derive(Clone, Debug, Serialize, ToSchema)]
pub struct PackReport {
    #[serde(flatten)]
    pub outcome: PackOutcome,
    pub compaction_moves: usize,
    pub anneal_state: AnnealState,
    pub start_energy: f64,
    pub best_energy: f64,
    pub void: VoidReport,
}

/// Objects ranked by solid volume, largest first. Ties keep insertion order.
pub fn rank_by_volume(scene: &Scene, ids: &[ObjectId]) -> Vec<ObjectId> {
    let mut ranked: Vec<(ObjectId, f64)> = ids
        .iter()
        .filter_map(|id| scene.get(*id).map(|o| (*id, o.shape.volume())))
        .collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
    ranked.into_iter().map(|(id, _)| id).collect()
}

/// Size of the big group: `round(n * BIG_RATIO)`, at least one.
pub fn big_group_len(count: usize) -> usize {
    ((count as f64 * BIG_RATIO).round() as usize).max(1).min(count)
}

/// Resets the yaw to zero unless that makes the object overlap.
fn reset_yaw(scene: &mut Scene, id: ObjectId, config: &EngineConfig) -> Result<()> {
    let old = scene.pose_of(id)?;
    if old.yaw == 0.0 {
        return Ok(());
    }
    scene.set_pose(id, Pose::new(old.position, 0.0))?;
    if overlaps_any(scene, scene.require(id)?, Some(id), config) {
        scene.set_pose(id, old)?;
    }
    Ok(())
}

/// Tries the container with each `(step_scale, padding)` pass in turn.
/// Returns `Ok(false)` when every pass failed.
fn try_container_passes(
    scene: &mut Scene,
    id: ObjectId,
    passes: &[(f64, f64)],
    scoring: Scoring,
    config: &EngineConfig,
) -> Result<bool> {
    for &(step_scale, padding) in passes {
        let options = PlacementOptions::new(step_scale, padding, scoring);
        match place_inside_container(scene, id, &options, config) {
            Ok(_) => return Ok(true),
            Err(EngineError::PlacementFailed { .. } | EngineError::ResidualOverlap { .. }) => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(false)
}

/// Final zone of `id` after a failed container attempt. When the rescue
/// fails too the object keeps its last legal pose, which may lie in either
/// zone or in neither.
fn rescue(scene: &mut Scene, id: ObjectId, stacking_fallback: bool, config: &EngineConfig) -> Result<Option<ZoneId>> {
    let staged = if stacking_fallback {
        rescue_to_staging(scene, id, config)
    } else {
        place_in_staging(scene, id, false, config)
    };
    match staged {
        Ok(_) => Ok(Some(ZoneId::Staging)),
        Err(EngineError::PlacementFailed { .. } | EngineError::ResidualOverlap { .. }) => {
            warn!("no free staging cell for object {}, keeping its last legal pose", id);
            Ok(scene.layout.zone_of(&scene.pose_of(id)?.position))
        }
        Err(err) => Err(err),
    }
}

/// Clamps the object into its zone and reverts the clamp if it overlaps.
fn clamp_or_keep(scene: &mut Scene, id: ObjectId, config: &EngineConfig) -> Result<()> {
    let safe = scene.pose_of(id)?;
    clamp_into_zone(scene, id, config)?;
    if overlaps_any(scene, scene.require(id)?, Some(id), config) {
        scene.set_pose(id, safe)?;
    }
    Ok(())
}

/// Pulls staged objects into the container, largest first. Objects that do
/// not fit go back to the staging floor.
pub async fn stage_first_largest(scene: &mut Scene, config: &EngineConfig) -> Result<PackOutcome> {
    let staged = scene.ids_in_zone(ZoneId::Staging);
    let mut outcome = PackOutcome::default();
    if staged.is_empty() {
        return Ok(outcome);
    }
    info!("trying {} staged objects in the container, largest first", staged.len());

    for id in rank_by_volume(scene, &staged) {
        reset_yaw(scene, id, config)?;
        let zone = if try_container_passes(scene, id, &STAGE_PASSES, Scoring::Energy, config)? {
            Some(ZoneId::Container)
        } else {
            rescue(scene, id, false, config)?
        };
        clamp_or_keep(scene, id, config)?;
        outcome.record(id, zone);
        tokio::task::yield_now().await;
    }
    settle_staging(scene, config)?;
    Ok(outcome)
}

/// Re-settles every staged object, so nothing is left resting on an object
/// that has since moved to the container.
fn settle_staging(scene: &mut Scene, config: &EngineConfig) -> Result<()> {
    for id in scene.ids_in_zone(ZoneId::Staging) {
        clamp_or_keep(scene, id, config)?;
    }
    Ok(())
}

/// Places `ids` in volume order: the big group with the heuristic scorer, the
/// rest with the energy scorer at finer steps. Failures go to staging.
async fn place_ranked(scene: &mut Scene, ids: &[ObjectId], config: &EngineConfig) -> Result<()> {
    let ranked = rank_by_volume(scene, ids);
    let cut = big_group_len(ranked.len());

    for (rank, id) in ranked.into_iter().enumerate() {
        reset_yaw(scene, id, config)?;
        let fitted = if rank < cut {
            try_container_passes(scene, id, &[BIG_PASS], Scoring::Heuristic, config)?
        } else {
            try_container_passes(scene, id, &SMALL_PASSES, Scoring::Energy, config)?
        };
        if !fitted {
            rescue(scene, id, true, config)?;
        }
        clamp_or_keep(scene, id, config)?;
        tokio::task::yield_now().await;
    }
    settle_staging(scene, config)
}

fn pipeline_rng(anneal: &AnnealConfig) -> StdRng {
    match anneal.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    }
}

/// Annealing pass followed by the post-run cleanup: every container object is
/// clamped and the scene compacted again.
async fn anneal_and_compact(
    scene: &mut Scene,
    rng: &mut StdRng,
    passes: usize,
    config: &EngineConfig,
    anneal: &AnnealConfig,
    cancel: &CancelToken,
) -> Result<(AnnealState, f64, f64, usize)> {
    let report = Annealer::new(*anneal, *config, cancel.clone())
        .run_sliced(scene, |_| {})
        .await?;
    for id in scene.ids_in_zone(ZoneId::Container) {
        clamp_or_keep(scene, id, config)?;
    }
    let moves = global_compaction(scene, passes, rng, config)?;
    Ok((report.state, report.start_energy, report.best_energy, moves))
}

/// Full automatic packing of every object.
///
/// Ranks objects by volume, places the largest share with the heuristic
/// scorer and the rest with the energy scorer, rescues failures to staging,
/// compacts, anneals, compacts again and reports the final void.
pub async fn auto_pack(
    scene: &mut Scene,
    config: &EngineConfig,
    anneal: &AnnealConfig,
    cancel: &CancelToken,
) -> Result<PackReport> {
    let mut rng = pipeline_rng(anneal);
    let all: Vec<ObjectId> = scene.objects.iter().map(|o| o.id).collect();
    info!("auto pack of {} objects", all.len());

    place_ranked(scene, &all, config).await?;
    let mut moves = global_compaction(scene, 2, &mut rng, config)?;
    let (anneal_state, start_energy, best_energy, more) =
        anneal_and_compact(scene, &mut rng, 2, config, anneal, cancel).await?;
    moves += more;

    audit(scene, config);
    let outcome = zone_outcome(scene);
    let void = voxel::measure_void(scene, ZoneId::Container, config);
    info!(
        "auto pack finished: {} in container, {} staged, {:.1}% utilization",
        outcome.placed.len(),
        outcome.staged.len(),
        100.0 * (1.0 - void.empty_ratio)
    );
    Ok(PackReport {
        outcome,
        compaction_moves: moves,
        anneal_state,
        start_energy,
        best_energy,
        void,
    })
}

/// The most thorough flow: staged objects first, a full auto pack, a
/// last-chance pass over whatever is still staged, then shake, right-angle
/// reorientation and a second annealing run.
pub async fn pack_to_the_max(
    scene: &mut Scene,
    config: &EngineConfig,
    anneal: &AnnealConfig,
    cancel: &CancelToken,
) -> Result<PackReport> {
    let mut rng = pipeline_rng(anneal);
    stage_first_largest(scene, config).await?;
    let first = auto_pack(scene, config, anneal, cancel).await?;
    let mut moves = first.compaction_moves;

    for id in scene.ids_in_zone(ZoneId::Staging) {
        reset_yaw(scene, id, config)?;
        if !try_container_passes(scene, id, &LEFTOVER_PASSES, Scoring::Energy, config)? {
            rescue(scene, id, false, config)?;
        }
        clamp_or_keep(scene, id, config)?;
        tokio::task::yield_now().await;
    }
    settle_staging(scene, config)?;

    moves += global_compaction(scene, 3, &mut rng, config)?;
    shake_and_settle(scene, 3, &mut rng, config)?;
    for id in scene.ids_in_zone(ZoneId::Container) {
        try_best_axis_orientation(scene, id, config)?;
        clamp_or_keep(scene, id, config)?;
    }

    let (anneal_state, _, best_energy, more) =
        anneal_and_compact(scene, &mut rng, 2, config, anneal, cancel).await?;
    moves += more;

    audit(scene, config);
    let void = voxel::measure_void(scene, ZoneId::Container, config);
    Ok(PackReport {
        outcome: zone_outcome(scene),
        compaction_moves: moves,
        anneal_state,
        start_energy: first.start_energy,
        best_energy,
        void,
    })
}

/// Logs any same-zone pair left overlapping. Every step above reverts
/// illegal moves, so this should never fire.
fn audit(scene: &Scene, config: &EngineConfig) {
    let pairs = overlapping_pairs(scene, config);
    if !pairs.is_empty() {
        warn!("packing left overlapping pairs: {:?}", pairs);
    }
}

/// Zones derived from the final poses, since annealing and the later passes
/// can move objects after they were first recorded.
fn zone_outcome(scene: &Scene) -> PackOutcome {
    let mut outcome = PackOutcome::default();
    for object in &scene.objects {
        outcome.record(object.id, scene.layout.zone_of(&object.pose.position));
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collision::overlapping_pairs;
    use crate::model::{Layout, ObjectKind, ObjectSpec};
    use crate::types::Vec3;

    fn small_layout() -> Layout {
        Layout::new(Vec3::splat(30.0), Vec3::splat(60.0), 10.0)
    }

    fn stage(scene: &mut Scene, specs: &[ObjectSpec], config: &EngineConfig) -> Vec<ObjectId> {
        let x = scene.layout.staging.aabb().center().x;
        specs
            .iter()
            .map(|spec| {
                let id = scene.add(spec.clone(), Pose::new(Vec3::new(x, 100.0, 0.0), 0.0)).unwrap();
                rescue_to_staging(scene, id, config).unwrap();
                id
            })
            .collect()
    }

    fn quick_anneal() -> AnnealConfig {
        AnnealConfig::builder().steps(20).seed(Some(17)).build()
    }

    #[test]
    fn big_group_rounds_and_keeps_one() {
        assert_eq!(big_group_len(1), 1);
        assert_eq!(big_group_len(2), 1);
        assert_eq!(big_group_len(5), 3);
        assert_eq!(big_group_len(10), 6);
        assert_eq!(big_group_len(0), 0);
    }

    #[test]
    fn ranking_is_largest_first() {
        let mut scene = Scene::new(small_layout());
        let a = scene.add(ObjectSpec::cube(2.0, 2.0, 2.0), Pose::default()).unwrap();
        let b = scene.add(ObjectSpec::cube(6.0, 6.0, 6.0), Pose::default()).unwrap();
        let c = scene.add(ObjectSpec::sphere(4.0), Pose::default()).unwrap();
        assert_eq!(rank_by_volume(&scene, &[a, b, c]), vec![b, c, a]);
    }

    #[tokio::test]
    async fn stage_first_largest_moves_what_fits() {
        let config = EngineConfig::default();
        let mut scene = Scene::new(small_layout());
        let ids = stage(
            &mut scene,
            &[ObjectSpec::cube(8.0, 8.0, 8.0), ObjectSpec::cube(40.0, 6.0, 6.0)],
            &config,
        );
        let outcome = stage_first_largest(&mut scene, &config).await.unwrap();
        assert_eq!(outcome.placed, vec![ids[0]]);
        assert_eq!(outcome.staged, vec![ids[1]]);
        assert!(overlapping_pairs(&scene, &config).is_empty());
    }

    #[tokio::test]
    async fn auto_pack_leaves_a_legal_scene() {
        let config = EngineConfig::default();
        let mut scene = Scene::new(small_layout());
        stage(
            &mut scene,
            &[
                ObjectSpec::cube(10.0, 10.0, 10.0),
                ObjectSpec::cube(8.0, 6.0, 8.0),
                ObjectSpec::sphere(6.0),
                ObjectSpec::new(ObjectKind::TetL, (3.0, 3.0, 3.0)),
                ObjectSpec::cube(35.0, 5.0, 5.0),
            ],
            &config,
        );
        let report = auto_pack(&mut scene, &config, &quick_anneal(), &CancelToken::new())
            .await
            .unwrap();

        assert!(overlapping_pairs(&scene, &config).is_empty());
        assert_eq!(report.outcome.placed.len(), 4);
        assert_eq!(report.outcome.staged.len(), 1);
        assert!(report.outcome.stranded.is_empty());
        assert!(report.best_energy <= report.start_energy);
        assert!((0.0..1.0).contains(&report.void.empty_ratio));
        for id in &report.outcome.placed {
            let aabb = scene.require(*id).unwrap().world_aabb();
            assert!(scene.layout.container.aabb().contains_aabb(&aabb, 1e-3));
        }
    }

    #[tokio::test]
    async fn cancelled_pack_still_places_objects() {
        let config = EngineConfig::default();
        let mut scene = Scene::new(small_layout());
        stage(&mut scene, &[ObjectSpec::cube(6.0, 6.0, 6.0), ObjectSpec::cube(5.0, 5.0, 5.0)], &config);
        let cancel = CancelToken::new();
        cancel.cancel();
        let report = auto_pack(&mut scene, &config, &quick_anneal(), &cancel).await.unwrap();
        assert_eq!(report.anneal_state, AnnealState::Cancelled);
        assert_eq!(report.outcome.placed.len(), 2);
        assert!(overlapping_pairs(&scene, &config).is_empty());
    }

    #[tokio::test]
    async fn pack_to_the_max_keeps_scene_legal() {
        let config = EngineConfig::default();
        let mut scene = Scene::new(small_layout());
        stage(
            &mut scene,
            &[ObjectSpec::cube(12.0, 4.0, 6.0), ObjectSpec::cube(7.0, 7.0, 7.0), ObjectSpec::sphere(5.0)],
            &config,
        );
        let report = pack_to_the_max(&mut scene, &config, &quick_anneal(), &CancelToken::new())
            .await
            .unwrap();
        assert!(overlapping_pairs(&scene, &config).is_empty());
        assert_eq!(report.outcome.placed.len(), 3);
    }
}
