//! Core simulation substrate for the biotank sandbox: Verlet-integrated
//! circular rigid bodies, collision resolution against other bodies and
//! static triangle obstacles, and the four-pass tick scheduler that drives
//! them.
//!
//! One call to [`TankWorld::step`] performs a full frame: a serial spatial
//! grid rebuild, then reset, interact/update, physics sub-steps, and a death
//! sweep over the live bodies. Organism "biology" (digestion, energy,
//! reproduction) lives outside this crate and participates through the
//! [`Behavior`] callback seam; brains are compiled elsewhere (see
//! `biotank-genome`) and evaluated inside those callbacks.

use biotank_index::{GridEntry, SpatialGrid, StaticObstacle, Vec2};
use ordered_float::OrderedFloat;
use rand::SeedableRng;
use rand::rngs::SmallRng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use slotmap::{SecondaryMap, SlotMap, new_key_type};
use std::collections::{HashSet, VecDeque};
use std::fmt;
use thiserror::Error;
use tracing::{debug, trace};

pub use biotank_index::IndexError;

new_key_type! {
    /// Stable handle for bodies backed by a generational slot map.
    pub struct BodyId;
}

/// Convenience alias for associating side data with bodies.
pub type BodyMap<T> = SecondaryMap<BodyId, T>;

/// Fallback frame duration when a caller passes a degenerate delta.
const DEFAULT_DELTA: f32 = 1.0 / 60.0;

/// Errors surfaced when building or configuring a world.
#[derive(Debug, Error)]
pub enum WorldError {
    /// Indicates an invalid configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    /// Spatial index construction failed.
    #[error(transparent)]
    Index(#[from] biotank_index::IndexError),
}

/// Monotonic tick counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub struct Tick(pub u64);

impl Tick {
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }
}

/// Static configuration for a tank world.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TankConfig {
    /// Width of the world in world units.
    pub world_width: f32,
    /// Height of the world in world units.
    pub world_height: f32,
    /// Edge length of one spatial grid cell. Must be at least as large as
    /// any interaction or collision query range (broad-phase contract).
    pub cell_size: f32,
    /// Lower clamp applied to every body radius write.
    pub min_radius: f32,
    /// Upper clamp applied to every body radius write.
    pub max_radius: f32,
    /// Number of physics sub-steps per tick.
    pub sub_steps: u32,
    /// Hard cap on per-sub-step speed, in world units per second.
    pub max_speed: f32,
    /// Fluid drag factor in [0, 1) applied to the implicit velocity.
    pub drag: f32,
    /// Neighbor range handed to behaviors during the interact pass.
    pub interact_range: f32,
    /// Maximum number of recent tick summaries retained in memory.
    pub history_capacity: usize,
    /// Optional RNG seed for reproducible worlds.
    pub rng_seed: Option<u64>,
}

impl Default for TankConfig {
    fn default() -> Self {
        Self {
            world_width: 1_200.0,
            world_height: 1_200.0,
            cell_size: 60.0,
            min_radius: 2.0,
            max_radius: 30.0,
            sub_steps: 4,
            max_speed: 40.0,
            drag: 0.02,
            interact_range: 50.0,
            history_capacity: 256,
            rng_seed: None,
        }
    }
}

impl TankConfig {
    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), WorldError> {
        if !(self.world_width > 0.0) || !(self.world_height > 0.0) {
            return Err(WorldError::InvalidConfig("world extents must be positive"));
        }
        if !(self.cell_size > 0.0) {
            return Err(WorldError::InvalidConfig("cell_size must be positive"));
        }
        if !(self.min_radius > 0.0) || self.max_radius < self.min_radius {
            return Err(WorldError::InvalidConfig(
                "radius clamp must satisfy 0 < min_radius <= max_radius",
            ));
        }
        if self.sub_steps == 0 {
            return Err(WorldError::InvalidConfig("sub_steps must be at least 1"));
        }
        if !(self.max_speed > 0.0) {
            return Err(WorldError::InvalidConfig("max_speed must be positive"));
        }
        if !(0.0..1.0).contains(&self.drag) {
            return Err(WorldError::InvalidConfig("drag must lie in [0, 1)"));
        }
        if !(self.interact_range > 0.0) || self.interact_range > self.cell_size {
            return Err(WorldError::InvalidConfig(
                "interact_range must be positive and no larger than cell_size",
            ));
        }
        if 2.0 * self.max_radius > self.cell_size {
            return Err(WorldError::InvalidConfig(
                "cell_size must cover the widest possible collision pair",
            ));
        }
        if self.history_capacity == 0 {
            return Err(WorldError::InvalidConfig(
                "history_capacity must be at least 1",
            ));
        }
        Ok(())
    }

    /// Returns the configured RNG, seeding from entropy when absent.
    fn seeded_rng(&self) -> SmallRng {
        match self.rng_seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => {
                let seed: u64 = rand::random();
                SmallRng::seed_from_u64(seed)
            }
        }
    }
}

/// A single ray/circle intersection.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RayHit {
    /// Intersection point in world space.
    pub point: Vec2,
    /// Normalized position along the ray segment, in [0, 1].
    pub along: f32,
}

/// A Verlet-integrated circular rigid body.
///
/// Velocity is implicit as `position - previous_position`; there is no
/// independently stored velocity vector. The acceleration accumulator and
/// the recent-collision counter are cleared at the start of every tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Body {
    position: Vec2,
    previous_position: Vec2,
    radius: f32,
    acceleration: Vec2,
    recent_collisions: u32,
}

impl Body {
    fn new(position: Vec2, radius: f32) -> Self {
        let position = if position.is_finite() {
            position
        } else {
            Vec2::ZERO
        };
        Self {
            position,
            previous_position: position,
            radius,
            acceleration: Vec2::ZERO,
            recent_collisions: 0,
        }
    }

    #[must_use]
    pub const fn position(&self) -> Vec2 {
        self.position
    }

    #[must_use]
    pub const fn previous_position(&self) -> Vec2 {
        self.previous_position
    }

    #[must_use]
    pub const fn radius(&self) -> f32 {
        self.radius
    }

    /// Implicit velocity over the last step.
    #[must_use]
    pub fn velocity(&self) -> Vec2 {
        self.position - self.previous_position
    }

    /// Mass derived from the body's area term (radius squared).
    #[must_use]
    pub fn mass(&self) -> f32 {
        self.radius * self.radius
    }

    /// Rigid contacts recorded since the last reset pass.
    #[must_use]
    pub const fn recent_collisions(&self) -> u32 {
        self.recent_collisions
    }

    /// Accumulate a force for the next integration step. Non-finite input is
    /// dropped rather than allowed to poison the accumulator.
    pub fn apply_force(&mut self, force: Vec2) {
        if force.is_finite() {
            self.acceleration += force;
        }
    }

    /// Write the radius, re-clamping to the configured range.
    pub fn set_radius(&mut self, radius: f32, min: f32, max: f32) {
        self.radius = if radius.is_finite() {
            radius.clamp(min, max)
        } else {
            min
        };
    }

    fn reset_tick_state(&mut self) {
        self.acceleration = Vec2::ZERO;
        self.recent_collisions = 0;
    }

    fn record_collision(&mut self) {
        self.recent_collisions = self.recent_collisions.saturating_add(1);
    }

    /// One semi-implicit Verlet sub-step with fluid drag; the per-step
    /// displacement never exceeds `max_speed * dt`.
    pub fn integrate(&mut self, dt: f32, drag: f32, max_speed: f32) {
        if !self.position.is_finite() {
            // A malformed body must not abort the tick; park it at its last
            // known good position.
            self.position = if self.previous_position.is_finite() {
                self.previous_position
            } else {
                Vec2::ZERO
            };
            self.previous_position = self.position;
        }
        let mut velocity = self.velocity() * (1.0 - drag);
        if !velocity.is_finite() {
            velocity = Vec2::ZERO;
        }
        let mut displacement = velocity + self.acceleration * (dt * dt);
        if !displacement.is_finite() {
            displacement = Vec2::ZERO;
        }
        let max_step = max_speed * dt;
        if displacement.length_sq() > max_step * max_step {
            displacement = displacement.normalized_or_default() * max_step;
        }
        self.previous_position = self.position;
        self.position += displacement;
    }

    /// Intersect the segment `start..end` with this body's circle, returning
    /// up to two typed hits in ray order. A miss is `[None, None]`, never an
    /// error.
    #[must_use]
    pub fn raycast(&self, start: Vec2, end: Vec2) -> [Option<RayHit>; 2] {
        let dir = end - start;
        let a = dir.length_sq();
        if !a.is_finite() || a <= f32::EPSILON {
            return [None, None];
        }
        let offset = start - self.position;
        let b = 2.0 * offset.dot(dir);
        let c = offset.length_sq() - self.radius * self.radius;
        let discriminant = b * b - 4.0 * a * c;
        if !discriminant.is_finite() || discriminant < 0.0 {
            return [None, None];
        }
        let root = discriminant.sqrt();
        let mut hits = [None, None];
        let mut slot = 0;
        let mut previous_t = f32::NEG_INFINITY;
        for t in [(-b - root) / (2.0 * a), (-b + root) / (2.0 * a)] {
            if (0.0..=1.0).contains(&t) && t > previous_t {
                hits[slot] = Some(RayHit {
                    point: start + dir * t,
                    along: t,
                });
                slot += 1;
                previous_t = t;
            }
        }
        hits
    }
}

/// Mass-weighted positional correction for a truly overlapping pair: each
/// body is pushed apart along the center line proportionally to
/// `1 - own_mass / combined_mass`, so the heavier body moves less. Perfectly
/// inelastic: no restitution term. Returns whether a correction was applied.
///
/// A zero-length or non-finite separation vector falls back to the +x unit
/// axis rather than propagating NaN.
pub fn resolve_pair(a: &mut Body, b: &mut Body) -> bool {
    let delta = b.position - a.position;
    let dist_sq = delta.length_sq();
    let min_dist = a.radius + b.radius;
    // NaN distances fail this comparison and the pair is skipped.
    if !(dist_sq < min_dist * min_dist) {
        return false;
    }
    let dist = dist_sq.sqrt();
    let normal = if dist > f32::EPSILON {
        delta * (1.0 / dist)
    } else {
        Vec2::new(1.0, 0.0)
    };
    let overlap = min_dist - dist;
    let combined = a.mass() + b.mass();
    if !(combined > 0.0) {
        return false;
    }
    let a_share = 1.0 - a.mass() / combined;
    let b_share = 1.0 - b.mass() / combined;
    a.position -= normal * (overlap * a_share);
    b.position += normal * (overlap * b_share);
    true
}

/// Pre-tick snapshot of a body handed to behaviors during the interact pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BodyView {
    pub id: BodyId,
    pub position: Vec2,
    pub radius: f32,
    pub velocity: Vec2,
    pub recent_collisions: u32,
}

impl BodyView {
    fn capture(id: BodyId, body: &Body) -> Self {
        Self {
            id,
            position: body.position(),
            radius: body.radius(),
            velocity: body.velocity(),
            recent_collisions: body.recent_collisions(),
        }
    }
}

/// Writes a behavior wants applied to its own body. Buffered during the
/// interact pass and committed serially afterwards, so a behavior can only
/// ever mutate its own state.
#[derive(Debug, Default, Clone, Copy)]
struct Command {
    force: Vec2,
    radius: Option<f32>,
    die: bool,
}

/// Mutation surface a behavior sees during the interact pass.
pub struct UpdateCtx<'a> {
    view: &'a BodyView,
    delta: f32,
    command: &'a mut Command,
}

impl UpdateCtx<'_> {
    /// Pre-tick snapshot of the behavior's own body.
    #[must_use]
    pub fn body(&self) -> &BodyView {
        self.view
    }

    /// Frame duration in seconds.
    #[must_use]
    pub const fn delta(&self) -> f32 {
        self.delta
    }

    /// Accumulate a force to apply in the physics pass.
    pub fn apply_force(&mut self, force: Vec2) {
        self.command.force += force;
    }

    /// Request a radius change (clamped to the configured range on commit).
    pub fn set_radius(&mut self, radius: f32) {
        self.command.radius = Some(radius);
    }

    /// Flag the body dead; it is removed in the death sweep this tick.
    pub fn die(&mut self) {
        self.command.die = true;
    }
}

/// Per-organism callback seam supplied by the biology layer. Invoked during
/// the interact pass; neighbor views are pre-tick snapshots, so paired
/// interactions observe tick-delayed state and never race.
pub trait Behavior: Send {
    /// Called once per neighbor within the configured interact range.
    fn on_interact(&mut self, ctx: &mut UpdateCtx<'_>, neighbor: &BodyView) {
        let _ = (ctx, neighbor);
    }

    /// Called once per tick after all neighbor interactions.
    fn on_update(&mut self, ctx: &mut UpdateCtx<'_>);
}

/// Dense body storage addressed by stable generational handles.
#[derive(Debug, Default)]
pub struct BodyArena {
    lookup: SlotMap<BodyId, usize>,
    handles: Vec<BodyId>,
    bodies: Vec<Body>,
}

impl BodyArena {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.bodies.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bodies.is_empty()
    }

    #[must_use]
    pub fn contains(&self, id: BodyId) -> bool {
        self.lookup.contains_key(id)
    }

    #[must_use]
    pub fn index_of(&self, id: BodyId) -> Option<usize> {
        self.lookup.get(id).copied()
    }

    #[must_use]
    pub fn get(&self, id: BodyId) -> Option<&Body> {
        self.index_of(id).map(|idx| &self.bodies[idx])
    }

    #[must_use]
    pub fn get_mut(&mut self, id: BodyId) -> Option<&mut Body> {
        let idx = self.index_of(id)?;
        Some(&mut self.bodies[idx])
    }

    #[must_use]
    pub fn handles(&self) -> &[BodyId] {
        &self.handles
    }

    #[must_use]
    pub fn bodies(&self) -> &[Body] {
        &self.bodies
    }

    #[must_use]
    pub fn bodies_mut(&mut self) -> &mut [Body] {
        &mut self.bodies
    }

    pub fn iter(&self) -> impl Iterator<Item = (BodyId, &Body)> {
        self.handles.iter().copied().zip(self.bodies.iter())
    }

    fn insert(&mut self, body: Body) -> BodyId {
        let index = self.bodies.len();
        let id = self.lookup.insert(index);
        self.handles.push(id);
        self.bodies.push(body);
        id
    }

    fn remove(&mut self, id: BodyId) -> Option<Body> {
        let index = self.lookup.remove(id)?;
        let body = self.bodies.swap_remove(index);
        self.handles.swap_remove(index);
        if index < self.bodies.len() {
            let moved = self.handles[index];
            self.lookup[moved] = index;
        }
        Some(body)
    }
}

/// Counts emitted after each tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickSummary {
    pub tick: Tick,
    pub body_count: usize,
    /// Rigid contacts resolved this tick (pair corrections plus obstacle
    /// projections, summed over sub-steps).
    pub contacts: usize,
    pub deaths: usize,
}

/// The tick scheduler: owns the live bodies, the spatial grid, and the
/// behavior bindings, and advances them one barriered frame at a time.
pub struct TankWorld {
    config: TankConfig,
    tick: Tick,
    rng: SmallRng,
    arena: BodyArena,
    behaviors: BodyMap<Box<dyn Behavior>>,
    grid: SpatialGrid<BodyId>,
    pending_deaths: Vec<BodyId>,
    history: VecDeque<TickSummary>,
}

impl fmt::Debug for TankWorld {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TankWorld")
            .field("config", &self.config)
            .field("tick", &self.tick)
            .field("body_count", &self.arena.len())
            .field("obstacles", &self.grid.obstacle_count())
            .finish()
    }
}

impl TankWorld {
    /// Instantiate a world from the supplied configuration.
    pub fn new(config: TankConfig) -> Result<Self, WorldError> {
        config.validate()?;
        let grid = SpatialGrid::new(config.world_width, config.world_height, config.cell_size)?;
        let rng = config.seeded_rng();
        let history_capacity = config.history_capacity;
        Ok(Self {
            config,
            tick: Tick::zero(),
            rng,
            arena: BodyArena::new(),
            behaviors: BodyMap::new(),
            grid,
            pending_deaths: Vec::new(),
            history: VecDeque::with_capacity(history_capacity),
        })
    }

    #[must_use]
    pub fn config(&self) -> &TankConfig {
        &self.config
    }

    #[must_use]
    pub const fn tick(&self) -> Tick {
        self.tick
    }

    #[must_use]
    pub fn body_count(&self) -> usize {
        self.arena.len()
    }

    #[must_use]
    pub fn body(&self, id: BodyId) -> Option<&Body> {
        self.arena.get(id)
    }

    #[must_use]
    pub fn body_mut(&mut self, id: BodyId) -> Option<&mut Body> {
        self.arena.get_mut(id)
    }

    /// Read-only access to the body arena.
    #[must_use]
    pub fn bodies(&self) -> &BodyArena {
        &self.arena
    }

    /// Borrow the world RNG mutably for deterministic sampling by
    /// collaborators (spawn jitter and the like).
    #[must_use]
    pub fn rng(&mut self) -> &mut SmallRng {
        &mut self.rng
    }

    /// Iterate over retained tick summaries.
    pub fn history(&self) -> impl Iterator<Item = &TickSummary> {
        self.history.iter()
    }

    /// Spawn a body; the radius is clamped to the configured range.
    pub fn create_body(&mut self, position: Vec2, radius: f32) -> BodyId {
        let radius = if radius.is_finite() {
            radius.clamp(self.config.min_radius, self.config.max_radius)
        } else {
            self.config.min_radius
        };
        self.arena.insert(Body::new(position, radius))
    }

    /// Remove a body immediately, returning whether it existed.
    pub fn destroy_body(&mut self, id: BodyId) -> bool {
        self.behaviors.remove(id);
        self.arena.remove(id).is_some()
    }

    /// Bind the biology callback for a body.
    pub fn set_behavior(&mut self, id: BodyId, behavior: Box<dyn Behavior>) {
        if self.arena.contains(id) {
            self.behaviors.insert(id, behavior);
        }
    }

    /// Register a static obstacle; world-build time only.
    pub fn add_obstacle(&mut self, obstacle: StaticObstacle) -> usize {
        let index = self.grid.add_obstacle(obstacle);
        debug!(index, "registered static obstacle");
        index
    }

    #[must_use]
    pub fn obstacle(&self, index: usize) -> Option<&StaticObstacle> {
        self.grid.obstacle(index)
    }

    /// Conservative broad-phase neighbor query: a lazy, finite,
    /// non-restartable sequence of handles whose cells intersect the query
    /// box. May include bodies outside the circular range; callers refine by
    /// exact distance. The grid reflects positions as of the last rebuild.
    pub fn query_neighbors(&self, position: Vec2, range: f32) -> impl Iterator<Item = BodyId> {
        self.grid
            .query_region(position, range)
            .filter_map(|entry| match entry {
                GridEntry::Body(id) => Some(id),
                GridEntry::Obstacle(_) => None,
            })
    }

    /// Cast a segment through the world, returning per-body hit pairs sorted
    /// by entry distance.
    #[must_use]
    pub fn raycast(&self, start: Vec2, end: Vec2) -> Vec<(BodyId, [Option<RayHit>; 2])> {
        let mid = (start + end) * 0.5;
        let half = start.distance(end) * 0.5;
        if !half.is_finite() {
            return Vec::new();
        }
        let mut hits: Vec<(OrderedFloat<f32>, BodyId, [Option<RayHit>; 2])> = Vec::new();
        for entry in self.grid.query_region(mid, half + self.config.max_radius) {
            let GridEntry::Body(id) = entry else { continue };
            let Some(body) = self.arena.get(id) else {
                continue;
            };
            let pair = body.raycast(start, end);
            if let Some(first) = &pair[0] {
                hits.push((OrderedFloat(first.along), id, pair));
            }
        }
        hits.sort_unstable_by_key(|(along, _, _)| *along);
        hits.into_iter().map(|(_, id, pair)| (id, pair)).collect()
    }

    /// Run the integrator for a single body outside the tick pipeline.
    pub fn step_physics(&mut self, id: BodyId, delta: f32) {
        let drag = self.config.drag;
        let max_speed = self.config.max_speed;
        if let Some(body) = self.arena.get_mut(id) {
            body.integrate(delta.max(0.0), drag, max_speed);
        }
    }

    /// Execute one simulation frame: serial grid rebuild, then the four
    /// barriered passes (reset, interact/update, physics sub-steps, death
    /// sweep).
    pub fn step(&mut self, delta: f32) -> TickSummary {
        let delta = if delta.is_finite() && delta > 0.0 {
            delta
        } else {
            DEFAULT_DELTA
        };

        // Bucket invariant: every body's bucket matches its position at the
        // start of the tick. The rebuild is strictly serial, never concurrent
        // with the passes below.
        let arena = &self.arena;
        self.grid.rebuild(arena.iter().map(|(id, body)| (id, body.position())));

        self.stage_reset();
        self.stage_interact(delta);
        let contacts = self.stage_physics(delta);
        let deaths = self.stage_deaths();

        self.tick = self.tick.next();
        let summary = TickSummary {
            tick: self.tick,
            body_count: self.arena.len(),
            contacts,
            deaths,
        };
        if self.history.len() >= self.config.history_capacity {
            self.history.pop_front();
        }
        self.history.push_back(summary);
        trace!(
            tick = self.tick.0,
            bodies = summary.body_count,
            contacts,
            deaths,
            "tick complete"
        );
        summary
    }

    /// Pass 1: clear every body's accumulator and collision counter. Purely
    /// local, trivially parallel.
    fn stage_reset(&mut self) {
        self.arena
            .bodies_mut()
            .par_iter_mut()
            .for_each(Body::reset_tick_state);
    }

    /// Pass 2: behaviors observe pre-tick snapshots of themselves and their
    /// neighbors and buffer writes to their own body. Each behavior box is
    /// pulled out of the binding map so the pass can run data-parallel over
    /// the snapshot (the grid is only read, and every behavior touches only
    /// its own command). Commits happen serially after every behavior has
    /// run, so changes only become visible next tick.
    fn stage_interact(&mut self, delta: f32) {
        if self.arena.is_empty() {
            return;
        }
        let views: Vec<BodyView> = self
            .arena
            .iter()
            .map(|(id, body)| BodyView::capture(id, body))
            .collect();
        let range = self.config.interact_range;

        let mut slots: Vec<Option<Box<dyn Behavior>>> = views
            .iter()
            .map(|view| self.behaviors.remove(view.id))
            .collect();

        let grid = &self.grid;
        let arena = &self.arena;
        let commands: Vec<Command> = slots
            .par_iter_mut()
            .zip(&views)
            .map(|(slot, view)| {
                let mut command = Command::default();
                if let Some(behavior) = slot.as_mut() {
                    let mut ctx = UpdateCtx {
                        view,
                        delta,
                        command: &mut command,
                    };
                    for entry in grid.query_region(view.position, range) {
                        let GridEntry::Body(other) = entry else { continue };
                        if other == view.id {
                            continue;
                        }
                        let Some(other_idx) = arena.index_of(other) else {
                            continue;
                        };
                        let neighbor = &views[other_idx];
                        if neighbor.position.distance(view.position) <= range {
                            behavior.on_interact(&mut ctx, neighbor);
                        }
                    }
                    behavior.on_update(&mut ctx);
                }
                command
            })
            .collect();

        let min_radius = self.config.min_radius;
        let max_radius = self.config.max_radius;
        for ((view, slot), command) in views.iter().zip(slots).zip(commands) {
            if let Some(behavior) = slot {
                self.behaviors.insert(view.id, behavior);
            }
            let Some(body) = self.arena.get_mut(view.id) else {
                continue;
            };
            body.apply_force(command.force);
            if let Some(radius) = command.radius {
                body.set_radius(radius, min_radius, max_radius);
            }
            if command.die {
                self.pending_deaths.push(view.id);
            }
        }
    }

    /// Pass 3: a fixed number of physics sub-steps. Each sub-step collects
    /// broad-phase candidates from the grid, resolves overlapping pairs
    /// deepest-first (each correction writes exactly the two bodies of its
    /// pair), projects bodies out of crossed obstacle edges, then integrates
    /// every body in parallel.
    fn stage_physics(&mut self, delta: f32) -> usize {
        let sub_steps = self.config.sub_steps.max(1);
        let dt = delta / sub_steps as f32;
        let drag = self.config.drag;
        let max_speed = self.config.max_speed;
        let max_radius = self.config.max_radius;
        let mut contacts = 0usize;

        for _ in 0..sub_steps {
            let mut pairs: Vec<(OrderedFloat<f32>, usize, usize)> = Vec::new();
            let mut obstacle_contacts: Vec<(usize, usize)> = Vec::new();
            {
                let bodies = self.arena.bodies();
                for (idx, body) in bodies.iter().enumerate() {
                    let query_range = body.radius() + max_radius;
                    for entry in self.grid.query_region(body.position(), query_range) {
                        match entry {
                            GridEntry::Body(other) => {
                                let Some(other_idx) = self.arena.index_of(other) else {
                                    continue;
                                };
                                if other_idx <= idx {
                                    continue;
                                }
                                let other_body = &bodies[other_idx];
                                let min_dist = body.radius() + other_body.radius();
                                let dist_sq =
                                    (other_body.position() - body.position()).length_sq();
                                if dist_sq < min_dist * min_dist {
                                    let overlap = min_dist - dist_sq.sqrt();
                                    if overlap.is_finite() {
                                        // Negated so the deepest overlap sorts first.
                                        pairs.push((OrderedFloat(-overlap), idx, other_idx));
                                    }
                                }
                            }
                            GridEntry::Obstacle(obstacle) => {
                                obstacle_contacts.push((idx, obstacle));
                            }
                        }
                    }
                }
            }

            pairs.sort_unstable();
            {
                let bodies = self.arena.bodies_mut();
                for &(_, a, b) in &pairs {
                    let (head, tail) = bodies.split_at_mut(b);
                    if resolve_pair(&mut head[a], &mut tail[0]) {
                        contacts += 1;
                    }
                }
            }

            for (idx, obstacle_idx) in obstacle_contacts {
                let Some(obstacle) = self.grid.obstacle(obstacle_idx) else {
                    continue;
                };
                let body = &mut self.arena.bodies_mut()[idx];
                if let Some((corrected, _edge)) =
                    obstacle.resolve_circle(body.position(), body.radius())
                {
                    body.position = corrected;
                    body.record_collision();
                    contacts += 1;
                }
            }

            self.arena
                .bodies_mut()
                .par_iter_mut()
                .for_each(|body| body.integrate(dt, drag, max_speed));
        }
        contacts
    }

    /// Pass 4: remove flagged bodies from the live set. Grid buckets are not
    /// touched; they are rebuilt wholesale at the start of the next tick.
    fn stage_deaths(&mut self) -> usize {
        if self.pending_deaths.is_empty() {
            return 0;
        }
        let mut seen = HashSet::new();
        let mut removed = 0usize;
        for id in std::mem::take(&mut self.pending_deaths) {
            if !seen.insert(id) {
                continue;
            }
            if self.arena.remove(id).is_some() {
                self.behaviors.remove(id);
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(removed, "death sweep removed bodies");
        }
        removed
    }
}
