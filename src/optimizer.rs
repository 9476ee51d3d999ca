//! Simulated-annealing optimizer over the container's objects.
//!
//! The run state machine is `Idle -> Running -> {Converged, Cancelled}`.
//! Each step picks one container object at random, tries a bounded number of
//! random perturbations (translation plus yaw jitter) and keeps the first
//! legal one. The energy change is then accepted by the Metropolis rule or
//! the object is reverted. The best snapshot is always restored at the end,
//! so a run never leaves the scene worse than it found it.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use log::{debug, info};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use utoipa::ToSchema;

use crate::collision::overlaps_any;
use crate::engine::EngineConfig;
use crate::error::Result;
use crate::geometry::Pose;
use crate::model::{ObjectId, PlacedObject, Scene, Snapshot, ZoneId};
use crate::resting::clamp_into_zone;
use crate::types::Vec3;
use crate::voxel;

/// Share of an object's smaller footprint side it may move in one perturbation.
const SIZE_STEP_FACTOR: f64 = 0.25;

/// Annealing schedule and budgets.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct AnnealConfig {
    pub steps: usize,
    pub initial_temperature: f64,
    /// Geometric cooling factor applied after every step.
    pub cooling_rate: f64,
    /// Smallest translation range of a perturbation for objects without a
    /// lattice unit. Larger objects scale it up with their footprint.
    pub base_step: f64,
    /// Yaw range of a perturbation, in radians.
    pub yaw_jitter: f64,
    pub perturbation_attempts: usize,
    /// Wall-clock work between cooperative yields.
    pub slice_budget: Duration,
    pub progress_every: usize,
    /// Accepted steps between two timeline frames.
    pub timeline_every: usize,
    pub timeline_max_frames: usize,
    /// Fixed seed for reproducible runs.
    pub seed: Option<u64>,
}

impl AnnealConfig {
    pub const DEFAULT_STEPS: usize = 10_000;
    pub const DEFAULT_INITIAL_TEMPERATURE: f64 = 120.0;
    pub const DEFAULT_COOLING_RATE: f64 = 0.997;
    pub const DEFAULT_BASE_STEP: f64 = 4.0;
    pub const DEFAULT_YAW_JITTER: f64 = 0.12;
    pub const DEFAULT_PERTURBATION_ATTEMPTS: usize = 40;
    pub const DEFAULT_SLICE_BUDGET_MS: u64 = 12;
    pub const DEFAULT_PROGRESS_EVERY: usize = 64;
    pub const DEFAULT_TIMELINE_EVERY: usize = 10;
    pub const DEFAULT_TIMELINE_MAX_FRAMES: usize = 1200;

    pub fn builder() -> AnnealConfigBuilder {
        AnnealConfigBuilder::default()
    }
}

impl Default for AnnealConfig {
    fn default() -> Self {
        Self {
            steps: Self::DEFAULT_STEPS,
            initial_temperature: Self::DEFAULT_INITIAL_TEMPERATURE,
            cooling_rate: Self::DEFAULT_COOLING_RATE,
            base_step: Self::DEFAULT_BASE_STEP,
            yaw_jitter: Self::DEFAULT_YAW_JITTER,
            perturbation_attempts: Self::DEFAULT_PERTURBATION_ATTEMPTS,
            slice_budget: Duration::from_millis(Self::DEFAULT_SLICE_BUDGET_MS),
            progress_every: Self::DEFAULT_PROGRESS_EVERY,
            timeline_every: Self::DEFAULT_TIMELINE_EVERY,
            timeline_max_frames: Self::DEFAULT_TIMELINE_MAX_FRAMES,
            seed: None,
        }
    }
}

/// Builder for `AnnealConfig`.
#[derive(Clone, Debug, Default)]
pub struct AnnealConfigBuilder {
    config: AnnealConfig,
}

impl AnnealConfigBuilder {
    pub fn steps(mut self, steps: usize) -> Self {
        self.config.steps = steps;
        self
    }

    pub fn initial_temperature(mut self, temperature: f64) -> Self {
        self.config.initial_temperature = temperature;
        self
    }

    pub fn cooling_rate(mut self, rate: f64) -> Self {
        self.config.cooling_rate = rate;
        self
    }

    pub fn base_step(mut self, step: f64) -> Self {
        self.config.base_step = step;
        self
    }

    pub fn yaw_jitter(mut self, jitter: f64) -> Self {
        self.config.yaw_jitter = jitter;
        self
    }

    pub fn perturbation_attempts(mut self, attempts: usize) -> Self {
        self.config.perturbation_attempts = attempts;
        self
    }

    pub fn slice_budget(mut self, budget: Duration) -> Self {
        self.config.slice_budget = budget;
        self
    }

    pub fn progress_every(mut self, every: usize) -> Self {
        self.config.progress_every = every;
        self
    }

    /// Timeline sampling interval and frame cap.
    pub fn timeline(mut self, every: usize, max_frames: usize) -> Self {
        self.config.timeline_every = every;
        self.config.timeline_max_frames = max_frames;
        self
    }

    pub fn seed(mut self, seed: Option<u64>) -> Self {
        self.config.seed = seed;
        self
    }

    pub fn build(self) -> AnnealConfig {
        self.config
    }
}

/// Lifecycle of an annealing run.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum AnnealState {
    Idle,
    Running,
    Converged,
    Cancelled,
}

/// Cooperative cancellation flag, checked at step boundaries.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Events emitted during a run, suitable for live visualization.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type")]
pub enum AnnealEvent {
    Started {
        steps: usize,
        objects: usize,
        energy: f64,
    },
    Progress {
        step: usize,
        total: usize,
        temperature: f64,
        current_energy: f64,
        best_energy: f64,
        empty_ratio: f64,
    },
    Finished {
        state: AnnealState,
        steps: usize,
        accepted: usize,
        start_energy: f64,
        best_energy: f64,
    },
}

/// Outcome of a run. The scene already holds `best` when this is returned.
#[derive(Clone, Debug)]
pub struct AnnealReport {
    pub state: AnnealState,
    pub steps_run: usize,
    pub accepted: usize,
    pub start_energy: f64,
    pub best_energy: f64,
    pub best: Snapshot,
    /// Sampled poses of accepted states, oldest first.
    pub timeline: Vec<Snapshot>,
}

/// Step-wise annealing driver.
pub struct Annealer {
    config: AnnealConfig,
    engine: EngineConfig,
    rng: StdRng,
    cancel: CancelToken,
    state: AnnealState,
    temperature: f64,
    step: usize,
    accepted: usize,
    start_energy: f64,
    current_energy: f64,
    best_energy: f64,
    best: Snapshot,
    timeline: VecDeque<Snapshot>,
}

impl Annealer {
    pub fn new(config: AnnealConfig, engine: EngineConfig, cancel: CancelToken) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            config,
            engine,
            rng,
            cancel,
            state: AnnealState::Idle,
            temperature: config.initial_temperature,
            step: 0,
            accepted: 0,
            start_energy: 0.0,
            current_energy: 0.0,
            best_energy: 0.0,
            best: Vec::new(),
            timeline: VecDeque::new(),
        }
    }

    /// Snapshots the scene as the initial best and enters `Running`.
    pub fn start(&mut self, scene: &Scene) -> AnnealEvent {
        let energy = voxel::energy(scene, &self.engine);
        self.start_energy = energy;
        self.current_energy = energy;
        self.best_energy = energy;
        self.best = scene.snapshot();
        self.temperature = self.config.initial_temperature;
        self.step = 0;
        self.accepted = 0;
        self.timeline.clear();
        self.state = AnnealState::Running;
        info!(
            "annealing started: {} steps, {} objects, energy {:.4}",
            self.config.steps,
            scene.len(),
            energy
        );
        AnnealEvent::Started {
            steps: self.config.steps,
            objects: scene.len(),
            energy,
        }
    }

    /// Whether another step should run. Moves to `Cancelled` or `Converged`
    /// when the run is over.
    pub fn should_continue(&mut self, scene: &Scene) -> bool {
        if self.state != AnnealState::Running {
            return false;
        }
        if self.cancel.is_cancelled() {
            self.state = AnnealState::Cancelled;
            return false;
        }
        if self.step >= self.config.steps || scene.ids_in_zone(ZoneId::Container).is_empty() {
            self.state = AnnealState::Converged;
            return false;
        }
        true
    }

    /// Runs one annealing step. Returns a progress event on reporting steps.
    pub fn step(&mut self, scene: &mut Scene) -> Result<Option<AnnealEvent>> {
        let progress = self.progress_due().then(|| self.progress_event(scene));

        let candidates = scene.ids_in_zone(ZoneId::Container);
        if candidates.is_empty() {
            self.advance();
            return Ok(progress);
        }
        let id = candidates[self.rng.gen_range(0..candidates.len())];
        let backup = scene.pose_of(id)?;

        if !self.perturb(scene, id, backup)? {
            self.advance();
            return Ok(progress);
        }

        let energy = voxel::energy(scene, &self.engine);
        let delta = energy - self.current_energy;
        let accept = delta <= 0.0
            || (self.temperature > 0.0 && self.rng.gen_range(0.0..1.0) < (-delta / self.temperature).exp());

        if accept {
            self.current_energy = energy;
            self.accepted += 1;
            if energy < self.best_energy {
                self.best_energy = energy;
                self.best = scene.snapshot();
            }
            if self.config.timeline_every > 0 && self.accepted % self.config.timeline_every == 0 {
                self.timeline.push_back(scene.snapshot());
                while self.timeline.len() > self.config.timeline_max_frames {
                    self.timeline.pop_front();
                }
            }
        } else {
            scene.set_pose(id, backup)?;
        }
        self.advance();
        Ok(progress)
    }

    fn advance(&mut self) {
        self.temperature *= self.config.cooling_rate;
        self.step += 1;
    }

    fn progress_due(&self) -> bool {
        self.config.progress_every > 0 && self.step % self.config.progress_every == 0
    }

    fn progress_event(&self, scene: &Scene) -> AnnealEvent {
        AnnealEvent::Progress {
            step: self.step,
            total: self.config.steps,
            temperature: self.temperature,
            current_energy: self.current_energy,
            best_energy: self.best_energy,
            empty_ratio: voxel::measure_void(scene, ZoneId::Container, &self.engine).empty_ratio,
        }
    }

    /// Tries up to `perturbation_attempts` random moves of `id`, keeping the
    /// first that does not overlap. The object is back at `backup` when none
    /// succeeds.
    fn perturb(&mut self, scene: &mut Scene, id: ObjectId, backup: Pose) -> Result<bool> {
        let range = perturbation_range(scene.require(id)?, self.config.base_step);
        for _ in 0..self.config.perturbation_attempts {
            let offset = Vec3::new(
                self.rng.gen_range(-0.5..0.5) * range,
                self.rng.gen_range(-0.5..0.5) * range,
                self.rng.gen_range(-0.5..0.5) * range,
            );
            let yaw = backup.yaw + self.rng.gen_range(-0.5..0.5) * self.config.yaw_jitter;
            scene.set_pose(id, Pose::new(backup.position + offset, yaw))?;
            clamp_into_zone(scene, id, &self.engine)?;
            let object = scene.require(id)?;
            let legal = object.zone(&scene.layout) == ZoneId::Container
                && !overlaps_any(scene, object, Some(id), &self.engine);
            if legal {
                return Ok(true);
            }
            scene.set_pose(id, backup)?;
        }
        Ok(false)
    }

    /// Restores the best snapshot and closes the run.
    pub fn finish(mut self, scene: &mut Scene) -> (AnnealReport, AnnealEvent) {
        if self.state == AnnealState::Running {
            self.state = AnnealState::Converged;
        }
        scene.restore(&self.best);
        info!(
            "annealing {:?} after {} steps: energy {:.4} -> {:.4}",
            self.state, self.step, self.start_energy, self.best_energy
        );
        let event = AnnealEvent::Finished {
            state: self.state,
            steps: self.step,
            accepted: self.accepted,
            start_energy: self.start_energy,
            best_energy: self.best_energy,
        };
        let report = AnnealReport {
            state: self.state,
            steps_run: self.step,
            accepted: self.accepted,
            start_energy: self.start_energy,
            best_energy: self.best_energy,
            best: self.best,
            timeline: self.timeline.into_iter().collect(),
        };
        (report, event)
    }

    /// Runs to completion on the calling thread, reporting every event.
    pub fn run(mut self, scene: &mut Scene, mut on_event: impl FnMut(&AnnealEvent)) -> Result<AnnealReport> {
        on_event(&self.start(scene));
        while self.should_continue(scene) {
            if let Some(event) = self.step(scene)? {
                on_event(&event);
            }
        }
        let (report, event) = self.finish(scene);
        on_event(&event);
        Ok(report)
    }

    /// Like [`Annealer::run`], but yields to the scheduler whenever a slice
    /// budget of wall-clock work has elapsed.
    pub async fn run_sliced(mut self, scene: &mut Scene, mut on_event: impl FnMut(&AnnealEvent)) -> Result<AnnealReport> {
        on_event(&self.start(scene));
        let mut slice_start = Instant::now();
        while self.should_continue(scene) {
            if slice_start.elapsed() >= self.config.slice_budget {
                tokio::task::yield_now().await;
                slice_start = Instant::now();
            }
            if let Some(event) = self.step(scene)? {
                on_event(&event);
            }
        }
        let (report, event) = self.finish(scene);
        debug!("sliced annealing run finished");
        on_event(&event);
        Ok(report)
    }
}

/// Translation range of a perturbation: the lattice unit for snapped shapes,
/// otherwise a share of the object's footprint, never below `base_step`.
fn perturbation_range(object: &PlacedObject, base_step: f64) -> f64 {
    match object.unit {
        Some(unit) => unit,
        None => {
            let size = object.world_aabb().size();
            base_step.max(size.x.min(size.z) * SIZE_STEP_FACTOR)
        }
    }
}
