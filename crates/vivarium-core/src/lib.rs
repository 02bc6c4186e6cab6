//! World state and deterministic tick pipeline for the Vivarium simulation.
//!
//! This crate owns the canonical entity population (`WorldState`) and drives
//! the per-tick movement pipeline on top of `vivarium-motion`: planners
//! produce movement requests, the grid index resolves every request in one
//! deterministic pass, and the outcomes are applied back to entity positions
//! along with per-entity motion reports and a rolling history of tick
//! summaries.
//!
//! Entity storage follows a dense struct-of-arrays layout addressed through
//! generational handles, so hot loops iterate flat columns while callers keep
//! stable ids across spawns and despawns.

use rand::{RngCore, SeedableRng, rngs::SmallRng};
use serde::{Deserialize, Serialize};
use slotmap::{SecondaryMap, SlotMap, new_key_type};
use std::collections::VecDeque;
use std::fmt;
use thiserror::Error;
use vivarium_motion::{
    GridConfig, GridError, GridGeometry, GridIndex, GridPoint, MoveReason, MoverSpec,
    TICK_TIME_WINDOW, TickResolution,
};

new_key_type! {
    /// Stable handle referencing an entity in the arena.
    pub struct EntityId;
}

/// Secondary storage keyed by entity handles.
pub type EntityMap<T> = SecondaryMap<EntityId, T>;

/// Monotonic simulation tick counter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Tick(pub u64);

impl Tick {
    /// Returns the next tick value.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Tick zero, the state before any stepping.
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }
}

/// Errors raised by world construction, spawning, and stepping.
#[derive(Debug, Error)]
pub enum WorldError {
    /// Indicates an invalid configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    /// An entity cannot be placed where requested.
    #[error("invalid placement: {0}")]
    InvalidPlacement(&'static str),
    /// The movement engine rejected the tick's registrations.
    #[error(transparent)]
    Grid(#[from] GridError),
}

/// Static configuration for a Vivarium world.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorldConfig {
    /// Width of the world in grid cells.
    pub grid_width: u32,
    /// Height of the world in grid cells.
    pub grid_height: u32,
    /// Cell edge length in grid units (must be a power of two).
    pub cell_size: u32,
    /// Upper bound on per-tick displacement in grid units, applied on top of
    /// each entity's own speed.
    pub max_speed: u32,
    /// Optional RNG seed for reproducible worlds.
    pub rng_seed: Option<u64>,
    /// Maximum number of recent tick summaries retained in memory.
    pub history_capacity: usize,
}

impl Default for WorldConfig {
    fn default() -> Self {
        Self {
            grid_width: 128,
            grid_height: 128,
            cell_size: 16,
            max_speed: 24,
            rng_seed: None,
            history_capacity: 256,
        }
    }
}

impl WorldConfig {
    /// Engine-facing grid settings for this world.
    #[must_use]
    pub fn grid(&self) -> GridConfig {
        GridConfig {
            grid_width: self.grid_width,
            grid_height: self.grid_height,
            cell_size: self.cell_size,
        }
    }

    /// Validate the configuration, returning the derived grid geometry.
    pub fn grid_geometry(&self) -> Result<GridGeometry, WorldError> {
        let geometry = self.grid().geometry()?;
        if self.max_speed == 0 {
            return Err(WorldError::InvalidConfig("max_speed must be non-zero"));
        }
        if self.max_speed > TICK_TIME_WINDOW {
            return Err(WorldError::InvalidConfig(
                "max_speed exceeds the tick time window",
            ));
        }
        if self.history_capacity == 0 {
            return Err(WorldError::InvalidConfig("history_capacity must be non-zero"));
        }
        Ok(geometry)
    }

    /// Returns the configured RNG seed, generating one from entropy if absent.
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

/// Scalar fields for a single entity used when spawning or snapshotting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityData {
    /// Position in grid units.
    pub position: GridPoint,
    /// Square footprint radius in cells.
    pub radius: u16,
    /// Travel budget in grid units per tick.
    pub speed: u16,
}

impl EntityData {
    #[must_use]
    pub const fn new(position: GridPoint, radius: u16, speed: u16) -> Self {
        Self {
            position,
            radius,
            speed,
        }
    }
}

impl Default for EntityData {
    fn default() -> Self {
        Self {
            position: GridPoint::new(0, 0),
            radius: 0,
            speed: 8,
        }
    }
}

/// Collection of per-entity columns used by hot per-tick loops.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct EntityColumns {
    positions: Vec<GridPoint>,
    radii: Vec<u16>,
    speeds: Vec<u16>,
}

impl EntityColumns {
    /// Create empty column storage.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create column storage with reserved capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            positions: Vec::with_capacity(capacity),
            radii: Vec::with_capacity(capacity),
            speeds: Vec::with_capacity(capacity),
        }
    }

    /// Number of stored entities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    /// Returns true when no entities are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// Reserve space for additional entities.
    pub fn reserve(&mut self, additional: usize) {
        self.positions.reserve(additional);
        self.radii.reserve(additional);
        self.speeds.reserve(additional);
    }

    /// Append one entity's scalars.
    pub fn push(&mut self, entity: EntityData) {
        self.positions.push(entity.position);
        self.radii.push(entity.radius);
        self.speeds.push(entity.speed);
    }

    /// Remove row `index` by swapping in the last row, returning its scalars.
    pub fn swap_remove(&mut self, index: usize) -> EntityData {
        EntityData {
            position: self.positions.swap_remove(index),
            radius: self.radii.swap_remove(index),
            speed: self.speeds.swap_remove(index),
        }
    }

    /// Rebuild one entity's scalar data from row `index`.
    #[must_use]
    pub fn snapshot(&self, index: usize) -> EntityData {
        EntityData {
            position: self.positions[index],
            radius: self.radii[index],
            speed: self.speeds[index],
        }
    }

    #[must_use]
    pub fn positions(&self) -> &[GridPoint] {
        &self.positions
    }

    #[must_use]
    pub fn positions_mut(&mut self) -> &mut [GridPoint] {
        &mut self.positions
    }

    #[must_use]
    pub fn radii(&self) -> &[u16] {
        &self.radii
    }

    #[must_use]
    pub fn speeds(&self) -> &[u16] {
        &self.speeds
    }

    #[must_use]
    pub fn speeds_mut(&mut self) -> &mut [u16] {
        &mut self.speeds
    }
}

/// Dense SoA storage with generational handles for entity access.
#[derive(Debug)]
pub struct EntityArena {
    slots: SlotMap<EntityId, usize>,
    handles: Vec<EntityId>,
    columns: EntityColumns,
}

impl Default for EntityArena {
    fn default() -> Self {
        Self::new()
    }
}

impl EntityArena {
    /// Create an empty arena.
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: SlotMap::with_key(),
            handles: Vec::new(),
            columns: EntityColumns::new(),
        }
    }

    /// Create an arena with reserved capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: SlotMap::with_capacity_and_key(capacity),
            handles: Vec::with_capacity(capacity),
            columns: EntityColumns::with_capacity(capacity),
        }
    }

    /// Number of live entities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// Returns true when no entities are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Iterate over live entity handles in dense iteration order.
    pub fn iter_handles(&self) -> impl Iterator<Item = EntityId> + '_ {
        self.handles.iter().copied()
    }

    /// Borrow the underlying column storage.
    #[must_use]
    pub fn columns(&self) -> &EntityColumns {
        &self.columns
    }

    /// Mutably borrow the underlying column storage.
    #[must_use]
    pub fn columns_mut(&mut self) -> &mut EntityColumns {
        &mut self.columns
    }

    /// Returns the dense index for `id`, if present.
    #[must_use]
    pub fn index_of(&self, id: EntityId) -> Option<usize> {
        self.slots.get(id).copied()
    }

    /// Returns true if `id` refers to a live entity.
    #[must_use]
    pub fn contains(&self, id: EntityId) -> bool {
        self.slots.contains_key(id)
    }

    /// Insert a new entity and return its handle.
    pub fn insert(&mut self, entity: EntityData) -> EntityId {
        let index = self.columns.len();
        self.columns.push(entity);
        let id = self.slots.insert(index);
        self.handles.push(id);
        id
    }

    /// Remove `id`, returning its scalar data if it was present.
    pub fn remove(&mut self, id: EntityId) -> Option<EntityData> {
        let index = self.slots.remove(id)?;
        let removed = self.columns.swap_remove(index);
        let removed_handle = self.handles.swap_remove(index);
        debug_assert_eq!(removed_handle, id);
        if index < self.handles.len() {
            let moved = self.handles[index];
            if let Some(slot) = self.slots.get_mut(moved) {
                *slot = index;
            }
        }
        Some(removed)
    }

    /// Rebuild one entity's scalar data by handle.
    #[must_use]
    pub fn snapshot(&self, id: EntityId) -> Option<EntityData> {
        let index = self.index_of(id)?;
        Some(self.columns.snapshot(index))
    }
}

/// How one entity's movement request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MoveResolution {
    /// The entity reached the point it asked for.
    Reached,
    /// Another entity stopped it early, or the world edge did when `by` is
    /// `None`.
    Blocked { by: Option<EntityId> },
}

/// Per-tick movement report for one entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MotionStatus {
    /// The point the entity asked to reach this tick.
    pub target: GridPoint,
    /// How the request resolved.
    pub resolution: MoveResolution,
    /// Number of grid cells entered beyond the starting cell.
    pub cells_traveled: u32,
}

/// Read-only view of one entity handed to its movement planner.
#[derive(Debug, Clone, Copy)]
pub struct EntityView {
    pub id: EntityId,
    pub position: GridPoint,
    pub radius: u16,
    pub speed: u16,
    pub tick: Tick,
    /// Movement report from the previous tick, if the entity has one.
    pub last_motion: Option<MotionStatus>,
    /// World geometry for bounds-aware planning.
    pub geometry: GridGeometry,
}

/// A movement request produced by a planner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveIntent {
    /// Stay in place this tick.
    Hold,
    /// Head toward a point. Travel is capped by the entity's speed and the
    /// world speed limit, and the goal is clamped into the world.
    MoveTo(GridPoint),
}

/// Thin trait object deciding where an entity wants to go each tick,
/// without coupling the world to concrete planner implementations.
pub trait MovementPlanner: Send + Sync {
    /// Static identifier of the planner implementation.
    fn kind(&self) -> &'static str;

    /// Produce the entity's movement request for this tick.
    fn plan(&mut self, view: &EntityView, rng: &mut dyn RngCore) -> MoveIntent;
}

/// Clamp `goal` to at most `speed` grid units of straight-line travel from
/// `position`, keeping the result inside the world.
#[must_use]
pub fn step_toward(
    geometry: &GridGeometry,
    position: GridPoint,
    goal: GridPoint,
    speed: u32,
) -> GridPoint {
    let dx = f64::from(goal.x - position.x);
    let dy = f64::from(goal.y - position.y);
    let distance = (dx * dx + dy * dy).sqrt();
    let reach = f64::from(speed);
    let (x, y) = if distance <= reach {
        (goal.x, goal.y)
    } else {
        let scale = reach / distance;
        (
            position.x + (dx * scale).round() as i32,
            position.y + (dy * scale).round() as i32,
        )
    };
    GridPoint::new(
        x.clamp(0, geometry.width_units() - 1),
        y.clamp(0, geometry.height_units() - 1),
    )
}

/// Aggregate statistics emitted after each world tick and retained in the
/// rolling history window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickSummary {
    pub tick: Tick,
    pub entity_count: usize,
    /// Entities whose position changed this tick.
    pub moved: usize,
    /// Entities whose request was cut short by a contest or the world edge.
    pub blocked: usize,
    /// Entities that requested no movement.
    pub held: usize,
    /// Total grid cells entered across all entities.
    pub cells_traveled: u64,
}

/// Mutable world state driving the simulation.
pub struct WorldState {
    config: WorldConfig,
    geometry: GridGeometry,
    tick: Tick,
    rng: SmallRng,
    entities: EntityArena,
    planners: EntityMap<Box<dyn MovementPlanner>>,
    motion: EntityMap<MotionStatus>,
    history: VecDeque<TickSummary>,
}

impl fmt::Debug for WorldState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorldState")
            .field("config", &self.config)
            .field("tick", &self.tick)
            .field("entity_count", &self.entities.len())
            .finish()
    }
}

impl WorldState {
    /// Instantiate a new world using the supplied configuration.
    pub fn new(config: WorldConfig) -> Result<Self, WorldError> {
        let geometry = config.grid_geometry()?;
        let rng = config.seeded_rng();
        let history_capacity = config.history_capacity;
        Ok(Self {
            config,
            geometry,
            tick: Tick::zero(),
            rng,
            entities: EntityArena::new(),
            planners: EntityMap::new(),
            motion: EntityMap::new(),
            history: VecDeque::with_capacity(history_capacity),
        })
    }

    /// Returns an immutable reference to the configuration.
    #[must_use]
    pub fn config(&self) -> &WorldConfig {
        &self.config
    }

    /// Validated grid geometry for this world.
    #[must_use]
    pub fn geometry(&self) -> GridGeometry {
        self.geometry
    }

    /// Current simulation tick.
    #[must_use]
    pub const fn tick(&self) -> Tick {
        self.tick
    }

    /// Borrow the world RNG mutably for deterministic sampling.
    #[must_use]
    pub fn rng(&mut self) -> &mut SmallRng {
        &mut self.rng
    }

    /// Read-only access to the entity arena.
    #[must_use]
    pub fn entities(&self) -> &EntityArena {
        &self.entities
    }

    /// Number of live entities.
    #[must_use]
    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    /// Iterate over retained tick summaries, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &TickSummary> {
        self.history.iter()
    }

    /// Movement report from the most recent tick for `id`.
    #[must_use]
    pub fn motion_status(&self, id: EntityId) -> Option<&MotionStatus> {
        self.motion.get(id)
    }

    /// Kind label of the planner bound to `id`, if any.
    #[must_use]
    pub fn planner_kind(&self, id: EntityId) -> Option<&'static str> {
        self.planners.get(id).map(|planner| planner.kind())
    }

    /// Rebuild one entity's scalar data by handle.
    #[must_use]
    pub fn snapshot_entity(&self, id: EntityId) -> Option<EntityData> {
        self.entities.snapshot(id)
    }

    /// Spawn a new entity, validating its placement against the world bounds
    /// and every existing footprint.
    ///
    /// Footprint squares must be disjoint at spawn (abutting is fine), which
    /// gives every entity exclusive claim to its starting perimeter cells.
    /// From then on the movement engine keeps all settled perimeter rings
    /// cell-disjoint, so re-registration each tick cannot fail.
    pub fn spawn_entity(&mut self, entity: EntityData) -> Result<EntityId, WorldError> {
        if u32::from(entity.speed) > self.config.max_speed {
            return Err(WorldError::InvalidPlacement(
                "entity speed exceeds the world speed limit",
            ));
        }
        if !self.geometry.contains(entity.position) {
            return Err(WorldError::InvalidPlacement("position outside the world"));
        }
        let cell = self.geometry.cell_of(entity.position);
        let radius = i32::from(entity.radius);
        if !self.geometry.footprint_in_bounds(cell, radius) {
            return Err(WorldError::InvalidPlacement(
                "footprint extends beyond the world bounds",
            ));
        }
        let columns = self.entities.columns();
        for index in 0..columns.len() {
            let other = self.geometry.cell_of(columns.positions()[index]);
            let reach = radius + i32::from(columns.radii()[index]);
            if (cell.x - other.x).abs().max((cell.y - other.y).abs()) <= reach {
                return Err(WorldError::InvalidPlacement(
                    "footprint overlaps an existing entity",
                ));
            }
        }
        Ok(self.entities.insert(entity))
    }

    /// Remove an entity by handle, returning its last known data.
    pub fn despawn_entity(&mut self, id: EntityId) -> Option<EntityData> {
        self.planners.remove(id);
        self.motion.remove(id);
        self.entities.remove(id)
    }

    /// Bind a movement planner to an entity. Returns false when the entity
    /// does not exist.
    pub fn set_planner(&mut self, id: EntityId, planner: Box<dyn MovementPlanner>) -> bool {
        if !self.entities.contains(id) {
            return false;
        }
        self.planners.insert(id, planner);
        true
    }

    /// Execute one simulation tick pipeline, returning the tick's summary.
    ///
    /// Stages run in a fixed order: every planner produces a request, the
    /// whole batch is resolved in one pass by the movement engine, and the
    /// outcomes are applied to positions and per-entity reports.
    pub fn step(&mut self) -> Result<TickSummary, WorldError> {
        let next_tick = self.tick.next();
        let targets = self.stage_plan();
        let resolution = self.stage_resolve(&targets)?;
        let summary = self.stage_apply(next_tick, &targets, resolution);
        self.stage_history(summary);
        self.advance_tick();
        Ok(summary)
    }

    /// Advances the world tick counter.
    pub fn advance_tick(&mut self) {
        self.tick = self.tick.next();
    }

    /// Resets the tick counter (useful for restarts).
    pub fn reset_time(&mut self) {
        self.tick = Tick::zero();
    }

    fn stage_plan(&mut self) -> Vec<GridPoint> {
        let tick = self.tick;
        let geometry = self.geometry;
        let speed_cap = self.config.max_speed;
        let handles: Vec<EntityId> = self.entities.iter_handles().collect();
        let mut targets = Vec::with_capacity(handles.len());
        for (index, id) in handles.into_iter().enumerate() {
            let columns = self.entities.columns();
            let view = EntityView {
                id,
                position: columns.positions()[index],
                radius: columns.radii()[index],
                speed: columns.speeds()[index],
                tick,
                last_motion: self.motion.get(id).copied(),
                geometry,
            };
            let intent = match self.planners.get_mut(id) {
                Some(planner) => planner.plan(&view, &mut self.rng),
                None => MoveIntent::Hold,
            };
            let target = match intent {
                MoveIntent::Hold => view.position,
                MoveIntent::MoveTo(goal) => {
                    let speed = u32::from(view.speed).min(speed_cap);
                    step_toward(&geometry, view.position, goal, speed)
                }
            };
            targets.push(target);
        }
        targets
    }

    fn stage_resolve(&mut self, targets: &[GridPoint]) -> Result<TickResolution, WorldError> {
        let mut index = GridIndex::with_geometry(self.geometry);
        let columns = self.entities.columns();
        let specs: Vec<MoverSpec> = (0..columns.len())
            .map(|i| MoverSpec::new(columns.positions()[i], targets[i], columns.radii()[i]))
            .collect();
        index.add_paths(&specs)?;
        Ok(index.resolve_paths()?)
    }

    fn stage_apply(
        &mut self,
        next_tick: Tick,
        targets: &[GridPoint],
        resolution: TickResolution,
    ) -> TickSummary {
        let handles: Vec<EntityId> = self.entities.iter_handles().collect();
        let mut moved = 0usize;
        let mut blocked = 0usize;
        let mut held = 0usize;
        let mut cells_traveled = 0u64;
        for outcome in resolution.into_outcomes() {
            let index = outcome.mover.index();
            let id = handles[index];
            self.entities.columns_mut().positions_mut()[index] = outcome.terminus;
            let traveled = (outcome.committed_cells - 1) as u64;
            cells_traveled += traveled;
            if outcome.terminus != outcome.origin {
                moved += 1;
            }
            if targets[index] == outcome.origin {
                held += 1;
            }
            let resolution_state = match outcome.reason {
                MoveReason::DestinationReached => MoveResolution::Reached,
                MoveReason::Blocked { by } => MoveResolution::Blocked {
                    by: by.map(|mover| handles[mover.index()]),
                },
            };
            if matches!(resolution_state, MoveResolution::Blocked { .. }) {
                blocked += 1;
            }
            self.motion.insert(
                id,
                MotionStatus {
                    target: targets[index],
                    resolution: resolution_state,
                    cells_traveled: traveled as u32,
                },
            );
        }
        TickSummary {
            tick: next_tick,
            entity_count: self.entities.len(),
            moved,
            blocked,
            held,
            cells_traveled,
        }
    }

    fn stage_history(&mut self, summary: TickSummary) {
        if self.history.len() >= self.config.history_capacity {
            self.history.pop_front();
        }
        self.history.push_back(summary);
    }
}
