//! Voxel-based packing quality.
//!
//! A regular grid is laid over a zone's interior for every scoring call.
//! Occupancy of each voxel center decides the empty ratio; a flood fill over
//! the empty voxels gives the fragmentation of the remaining void.

use std::collections::VecDeque;

use serde::Serialize;
use utoipa::ToSchema;

use crate::engine::{EngineConfig, OccupancyMode};
use crate::geometry::{Pose, Shape};
use crate::model::{Scene, ZoneId};
use crate::types::{Aabb, Vec3};

/// Volume measurement of one zone.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, ToSchema)]
pub struct VoidReport {
    pub empty_ratio: f64,
    pub solid_volume: f64,
    pub container_volume: f64,
}

/// Full scoring result: the void report plus fragmentation and the weighted
/// energy.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, ToSchema)]
pub struct VoxelScore {
    #[serde(flatten)]
    pub report: VoidReport,
    pub fragmentation: f64,
    pub energy: f64,
}

/// Occupancy bits over a zone. Built per call and never cached, since
/// objects move between calls.
#[derive(Clone, Debug)]
pub struct VoxelGrid {
    dims: [usize; 3],
    occupied: Vec<bool>,
    cell_volume: f64,
}

struct Occupant<'a> {
    aabb: Aabb,
    shape: &'a Shape,
    pose: Pose,
}

impl Occupant<'_> {
    fn contains(&self, p: &Vec3, mode: OccupancyMode) -> bool {
        if !self.aabb.contains_point(p) {
            return false;
        }
        let analytic = match mode {
            OccupancyMode::Aabb => false,
            OccupancyMode::Hybrid => !matches!(self.shape, Shape::Box { .. }),
            OccupancyMode::Exact => true,
        };
        !analytic || self.shape.contains_point(&self.pose, p, 0.0)
    }
}

impl VoxelGrid {
    /// Discretizes `zone` into `resolution` voxels per axis.
    pub fn build(scene: &Scene, zone: ZoneId, resolution: usize, mode: OccupancyMode) -> Self {
        let n = resolution.max(1);
        let bounds = scene.layout.zone(zone).aabb();
        let size = bounds.size();
        let cell = size * (1.0 / n as f64);

        let occupants: Vec<Occupant<'_>> = scene
            .objects
            .iter()
            .filter(|o| o.zone(&scene.layout) == zone)
            .map(|o| Occupant {
                aabb: o.world_aabb(),
                shape: &o.shape,
                pose: o.pose,
            })
            .filter(|o| o.aabb.intersects(&bounds))
            .collect();

        let mut occupied = vec![false; n * n * n];
        for j in 0..n {
            let y = bounds.min.y + (j as f64 + 0.5) * cell.y;
            for k in 0..n {
                let z = bounds.min.z + (k as f64 + 0.5) * cell.z;
                for i in 0..n {
                    let x = bounds.min.x + (i as f64 + 0.5) * cell.x;
                    let p = Vec3::new(x, y, z);
                    occupied[(j * n + k) * n + i] = occupants.iter().any(|o| o.contains(&p, mode));
                }
            }
        }

        Self {
            dims: [n, n, n],
            occupied,
            cell_volume: cell.volume(),
        }
    }

    pub fn len(&self) -> usize {
        self.occupied.len()
    }

    pub fn is_empty(&self) -> bool {
        self.occupied.is_empty()
    }

    pub fn occupied_count(&self) -> usize {
        self.occupied.iter().filter(|o| **o).count()
    }

    pub fn empty_count(&self) -> usize {
        self.len() - self.occupied_count()
    }

    pub fn solid_volume(&self) -> f64 {
        self.occupied_count() as f64 * self.cell_volume
    }

    /// Size of the largest 6-connected region of empty voxels.
    pub fn largest_empty_region(&self) -> usize {
        let [nx, ny, nz] = self.dims;
        let mut visited = vec![false; self.len()];
        let mut queue = VecDeque::new();
        let mut largest = 0;

        for start in 0..self.len() {
            if self.occupied[start] || visited[start] {
                continue;
            }
            visited[start] = true;
            queue.push_back(start);
            let mut size = 0;
            while let Some(cur) = queue.pop_front() {
                size += 1;
                let i = cur % nx;
                let k = (cur / nx) % nz;
                let j = cur / (nx * nz);
                let mut neighbours = [None; 6];
                if i > 0 {
                    neighbours[0] = Some(cur - 1);
                }
                if i + 1 < nx {
                    neighbours[1] = Some(cur + 1);
                }
                if k > 0 {
                    neighbours[2] = Some(cur - nx);
                }
                if k + 1 < nz {
                    neighbours[3] = Some(cur + nx);
                }
                if j > 0 {
                    neighbours[4] = Some(cur - nx * nz);
                }
                if j + 1 < ny {
                    neighbours[5] = Some(cur + nx * nz);
                }
                for next in neighbours.into_iter().flatten() {
                    if !visited[next] && !self.occupied[next] {
                        visited[next] = true;
                        queue.push_back(next);
                    }
                }
            }
            largest = largest.max(size);
        }
        largest
    }

    /// `1 - largest empty region / total empty`, or 0 when nothing is empty.
    pub fn fragmentation(&self) -> f64 {
        let empty = self.empty_count();
        if empty == 0 {
            return 0.0;
        }
        1.0 - self.largest_empty_region() as f64 / empty as f64
    }

    pub fn empty_ratio(&self) -> f64 {
        if self.is_empty() {
            return 0.0;
        }
        self.empty_count() as f64 / self.len() as f64
    }
}

/// Scores `zone` at an explicit resolution and occupancy mode.
pub fn score_with(
    scene: &Scene,
    zone: ZoneId,
    resolution: usize,
    mode: OccupancyMode,
    config: &EngineConfig,
) -> VoxelScore {
    let grid = VoxelGrid::build(scene, zone, resolution, mode);
    let container_volume = scene.layout.zone(zone).volume();
    let empty_ratio = grid.empty_ratio();
    let fragmentation = grid.fragmentation();
    VoxelScore {
        report: VoidReport {
            empty_ratio,
            solid_volume: grid.solid_volume().min(container_volume),
            container_volume,
        },
        fragmentation,
        energy: config.empty_weight * empty_ratio + config.fragment_weight * fragmentation,
    }
}

/// Quality measurement at the configured quality resolution and occupancy.
pub fn score(scene: &Scene, zone: ZoneId, config: &EngineConfig) -> VoxelScore {
    score_with(scene, zone, config.quality_resolution, config.quality_occupancy, config)
}

/// Void report for the heads-up display.
pub fn measure_void(scene: &Scene, zone: ZoneId, config: &EngineConfig) -> VoidReport {
    score(scene, zone, config).report
}

/// Container energy at the cheaper fitness settings used inside search and
/// optimization loops. Lower is better.
pub fn energy(scene: &Scene, config: &EngineConfig) -> f64 {
    score_with(
        scene,
        ZoneId::Container,
        config.fitness_resolution,
        config.fitness_occupancy,
        config,
    )
    .energy
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Layout, ObjectSpec};
    use approx::assert_relative_eq;

    fn scene() -> Scene {
        Scene::new(Layout::default())
    }

    #[test]
    fn empty_container_is_one_connected_void() {
        let scene = scene();
        let config = EngineConfig::default();
        let s = score(&scene, ZoneId::Container, &config);
        assert_relative_eq!(s.report.empty_ratio, 1.0);
        assert_relative_eq!(s.report.solid_volume, 0.0);
        assert_relative_eq!(s.fragmentation, 0.0);
        assert_relative_eq!(s.energy, config.empty_weight);
    }

    #[test]
    fn full_container_has_zero_energy() {
        let mut scene = scene();
        scene
            .add(ObjectSpec::cube(110.0, 110.0, 110.0), Pose::new(Vec3::new(0.0, 55.0, 0.0), 0.0))
            .unwrap();
        let config = EngineConfig::default();
        let s = score(&scene, ZoneId::Container, &config);
        assert_relative_eq!(s.report.empty_ratio, 0.0);
        assert_relative_eq!(s.report.solid_volume, s.report.container_volume);
        assert_relative_eq!(energy(&scene, &config), 0.0);
    }

    #[test]
    fn wall_splits_void_in_half() {
        let mut scene = scene();
        scene
            .add(ObjectSpec::cube(12.0, 110.0, 110.0), Pose::new(Vec3::new(0.0, 55.0, 0.0), 0.0))
            .unwrap();
        let grid = VoxelGrid::build(&scene, ZoneId::Container, 10, OccupancyMode::Aabb);
        assert_eq!(grid.occupied_count(), 200);
        assert_eq!(grid.largest_empty_region(), 400);
        assert_relative_eq!(grid.fragmentation(), 0.5);
    }

    #[test]
    fn aabb_occupancy_over_counts_spheres() {
        let mut scene = scene();
        scene
            .add(ObjectSpec::sphere(60.0), Pose::new(Vec3::new(0.0, 30.0, 0.0), 0.0))
            .unwrap();
        let loose = VoxelGrid::build(&scene, ZoneId::Container, 20, OccupancyMode::Aabb);
        let exact = VoxelGrid::build(&scene, ZoneId::Container, 20, OccupancyMode::Exact);
        let hybrid = VoxelGrid::build(&scene, ZoneId::Container, 20, OccupancyMode::Hybrid);
        assert!(exact.occupied_count() < loose.occupied_count());
        assert_eq!(exact.occupied_count(), hybrid.occupied_count());
    }

    #[test]
    fn fitness_energy_counts_spheres_analytically() {
        let mut scene = scene();
        scene
            .add(ObjectSpec::sphere(60.0), Pose::new(Vec3::new(0.0, 30.0, 0.0), 0.0))
            .unwrap();
        let config = EngineConfig::default();
        let boxed = EngineConfig::builder().fitness_occupancy(OccupancyMode::Aabb).build();
        let fitness = |c: &EngineConfig| score_with(&scene, ZoneId::Container, c.fitness_resolution, c.fitness_occupancy, c);
        assert!(fitness(&config).report.empty_ratio > fitness(&boxed).report.empty_ratio);
        assert_relative_eq!(energy(&scene, &config), fitness(&config).energy);
    }

    #[test]
    fn staging_objects_do_not_count_in_container() {
        let mut scene = scene();
        scene
            .add(ObjectSpec::cube(50.0, 50.0, 50.0), Pose::new(Vec3::new(185.0, 24.0, 0.0), 0.0))
            .unwrap();
        let config = EngineConfig::default();
        assert_relative_eq!(measure_void(&scene, ZoneId::Container, &config).empty_ratio, 1.0);
        assert!(measure_void(&scene, ZoneId::Staging, &config).empty_ratio < 1.0);
    }

    #[test]
    fn ratios_stay_bounded() {
        let mut scene = scene();
        let config = EngineConfig::default();
        for (i, size) in [7.0, 13.0, 21.0, 9.0].iter().enumerate() {
            let x = -40.0 + 25.0 * i as f64;
            scene
                .add(ObjectSpec::cube(*size, *size, *size), Pose::new(Vec3::new(x, size / 2.0, 10.0), 0.3 * i as f64))
                .unwrap();
        }
        let s = score(&scene, ZoneId::Container, &config);
        assert!((0.0..=1.0).contains(&s.report.empty_ratio));
        assert!((0.0..=1.0).contains(&s.fragmentation));
        assert!(s.report.solid_volume <= s.report.container_volume);
    }
}
