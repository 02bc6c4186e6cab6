//! Deterministic movement resolution on a uniform grid.
//!
//! This crate owns the per-tick movement kernel of the Vivarium simulation.
//! Every entity's requested straight-line move is rasterized into a chain of
//! cell-resident segments, each segment reserves the cells its square
//! footprint perimeter touches, and a single time-ordered scan over all
//! reservations decides how far along its chain every entity actually gets.
//! Entities that lose a cell contest are clipped in place and their unreached
//! reservations never activate, so a blocked entity cannot obstruct cells it
//! will no longer visit.
//!
//! Resolution is fully deterministic: outcomes depend only on the registered
//! requests and their registration order, never on thread count or map
//! iteration order. Simultaneous arrivals are won by the earlier registration.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Number of abstract time units one tick spans. Segment entry and exit
/// times all fall within `0..=TICK_TIME_WINDOW`.
pub const TICK_TIME_WINDOW: u32 = 10_000;

/// Exit-time sentinel for the segment an entity occupies when the tick ends.
const NO_EXIT: u32 = 0;

/// Batch sizes below this rasterize serially; above it, in parallel.
const PARALLEL_RASTER_MIN: usize = 64;

/// Errors surfaced by grid construction, path registration, and resolution.
#[derive(Debug, Error)]
pub enum GridError {
    /// Indicates a configuration that cannot form a usable grid.
    #[error("invalid grid configuration: {0}")]
    InvalidConfig(&'static str),
    /// A path endpoint lies outside the world.
    #[error("point ({x}, {y}) is outside the {width}x{height} unit world")]
    PointOutOfBounds {
        x: i32,
        y: i32,
        width: i32,
        height: i32,
    },
    /// A mover's starting footprint pokes past the world edge, which means
    /// the entity was misplaced before registration.
    #[error("starting footprint at cell ({x}, {y}) with radius {radius} exceeds the grid bounds")]
    StartFootprintOutOfBounds { x: i32, y: i32, radius: i32 },
    /// Two movers were registered starting inside the same cell.
    #[error("starting cell ({x}, {y}) is already held by mover {other:?} at tick start")]
    StartCellConflict { other: MoverId, x: i32, y: i32 },
    /// The resolution scan revisited a segment that should still have
    /// pending reservations. The index was corrupted before resolution.
    #[error("segment {segment} of mover {mover:?} was already resolved mid-scan")]
    ResolutionInvariant { mover: MoverId, segment: usize },
}

/// A position in grid units.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GridPoint {
    pub x: i32,
    pub y: i32,
}

impl GridPoint {
    #[must_use]
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

/// A cell coordinate, in units shifted right by the cell-size exponent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Cell {
    pub x: i32,
    pub y: i32,
}

impl Cell {
    #[must_use]
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

/// Per-tick mover handle, dense in registration order.
///
/// The wrapped sequence number doubles as the deterministic tie-break for
/// simultaneous cell arrivals: lower registers win.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MoverId(u32);

impl MoverId {
    /// Position of this mover in registration order.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// One entity's movement request for the tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoverSpec {
    /// Where the entity starts the tick, in grid units.
    pub origin: GridPoint,
    /// Where it wants to end the tick, in grid units.
    pub target: GridPoint,
    /// Square footprint radius in cells; 0 means the entity occupies only
    /// the cell it stands in.
    pub radius: u16,
}

impl MoverSpec {
    #[must_use]
    pub const fn new(origin: GridPoint, target: GridPoint, radius: u16) -> Self {
        Self {
            origin,
            target,
            radius,
        }
    }

    /// Request that keeps the entity where it is.
    #[must_use]
    pub const fn hold(origin: GridPoint, radius: u16) -> Self {
        Self::new(origin, origin, radius)
    }
}

/// Static grid geometry settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridConfig {
    /// World width in cells.
    pub grid_width: u32,
    /// World height in cells.
    pub grid_height: u32,
    /// Cell edge length in grid units. Must be a power of two so unit to
    /// cell conversion is a shift.
    pub cell_size: u32,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            grid_width: 128,
            grid_height: 128,
            cell_size: 16,
        }
    }
}

impl GridConfig {
    /// Validate the configuration and derive the quantities the engine uses.
    pub fn geometry(&self) -> Result<GridGeometry, GridError> {
        if self.grid_width == 0 || self.grid_height == 0 {
            return Err(GridError::InvalidConfig("grid dimensions must be non-zero"));
        }
        if self.cell_size == 0 || !self.cell_size.is_power_of_two() {
            return Err(GridError::InvalidConfig("cell_size must be a power of two"));
        }
        let shift = self.cell_size.trailing_zeros();
        let width_units = u64::from(self.grid_width) << shift;
        let height_units = u64::from(self.grid_height) << shift;
        if width_units > i32::MAX as u64 || height_units > i32::MAX as u64 {
            return Err(GridError::InvalidConfig("world extent overflows the grid unit range"));
        }
        Ok(GridGeometry {
            shift,
            width_cells: self.grid_width as i32,
            height_cells: self.grid_height as i32,
            width_units: width_units as i32,
            height_units: height_units as i32,
        })
    }
}

/// Validated grid geometry with unit/cell conversions baked in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GridGeometry {
    shift: u32,
    width_cells: i32,
    height_cells: i32,
    width_units: i32,
    height_units: i32,
}

impl GridGeometry {
    /// Cell containing `point`.
    #[must_use]
    pub const fn cell_of(&self, point: GridPoint) -> Cell {
        Cell {
            x: point.x >> self.shift,
            y: point.y >> self.shift,
        }
    }

    /// Whether `point` lies inside the world.
    #[must_use]
    pub const fn contains(&self, point: GridPoint) -> bool {
        point.x >= 0 && point.y >= 0 && point.x < self.width_units && point.y < self.height_units
    }

    /// Whether the square footprint of `radius` cells around `cell` fits
    /// entirely inside the grid.
    #[must_use]
    pub const fn footprint_in_bounds(&self, cell: Cell, radius: i32) -> bool {
        cell.x - radius >= 0
            && cell.y - radius >= 0
            && cell.x + radius < self.width_cells
            && cell.y + radius < self.height_cells
    }

    /// World width in grid units.
    #[must_use]
    pub const fn width_units(&self) -> i32 {
        self.width_units
    }

    /// World height in grid units.
    #[must_use]
    pub const fn height_units(&self) -> i32 {
        self.height_units
    }

    /// World width in cells.
    #[must_use]
    pub const fn width_cells(&self) -> i32 {
        self.width_cells
    }

    /// World height in cells.
    #[must_use]
    pub const fn height_cells(&self) -> i32 {
        self.height_cells
    }

    fn ensure_contains(&self, point: GridPoint) -> Result<(), GridError> {
        if self.contains(point) {
            Ok(())
        } else {
            Err(GridError::PointOutOfBounds {
                x: point.x,
                y: point.y,
                width: self.width_units,
                height: self.height_units,
            })
        }
    }
}

/// Why a mover ended its tick where it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MoveReason {
    /// The whole requested path was committed.
    DestinationReached,
    /// The path was cut short. `by` names the mover holding the contested
    /// cell, or is `None` when the world edge did the clipping.
    Blocked { by: Option<MoverId> },
}

/// Final committed result for one registered mover.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoveOutcome {
    /// The mover this outcome belongs to.
    pub mover: MoverId,
    /// Where the mover started the tick.
    pub origin: GridPoint,
    /// Last point the mover actually reached.
    pub terminus: GridPoint,
    /// Number of cells the full rasterized path spanned.
    pub path_cells: usize,
    /// Number of leading path cells committed after resolution. Always at
    /// least 1: the starting cell is never taken away.
    pub committed_cells: usize,
    /// Why the path ended at `terminus`.
    pub reason: MoveReason,
}

/// All outcomes of one resolution pass, in registration order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickResolution {
    outcomes: Vec<MoveOutcome>,
}

impl TickResolution {
    /// Outcomes in registration order.
    #[must_use]
    pub fn outcomes(&self) -> &[MoveOutcome] {
        &self.outcomes
    }

    /// Outcome for a single mover.
    #[must_use]
    pub fn outcome(&self, mover: MoverId) -> Option<&MoveOutcome> {
        self.outcomes.get(mover.index())
    }

    /// Number of movers resolved.
    #[must_use]
    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    /// Consume the resolution, yielding outcomes in registration order.
    #[must_use]
    pub fn into_outcomes(self) -> Vec<MoveOutcome> {
        self.outcomes
    }
}

/// One cell-resident stretch of a mover's tick path.
#[derive(Debug, Clone, Copy)]
struct PathSegment {
    /// First path point inside the cell.
    start: GridPoint,
    /// Last path point inside the cell.
    end: GridPoint,
    /// Time the path enters the cell; 0 for the starting segment.
    entry: u32,
    /// Time the path leaves the cell, or [`NO_EXIT`] for the final segment.
    exit: u32,
    /// Cell this segment occupies.
    cell: Cell,
    /// Footprint reservations not yet visited by the resolution scan.
    pending: u32,
}

/// Where a chain was cut and who forced the cut.
#[derive(Debug, Clone, Copy)]
struct ChainClip {
    /// Index of the first segment that will not be reached. Equal to the
    /// segment count when only out-of-bounds remainder was dropped.
    at: usize,
    /// Mover holding the contested cell, or `None` for the world edge.
    by: Option<MoverId>,
}

/// One mover's rasterized path plus its resolution state.
#[derive(Debug)]
struct PathChain {
    segments: Vec<PathSegment>,
    /// Wavefront position: the segment the mover currently occupies.
    active: Option<usize>,
    clip: Option<ChainClip>,
}

impl PathChain {
    fn is_clipped(&self, segment: usize) -> bool {
        self.clip.is_some_and(|clip| segment >= clip.at)
    }

    /// Number of leading segments that survive resolution.
    fn committed_len(&self) -> usize {
        self.clip.map_or(self.segments.len(), |clip| clip.at)
    }

    /// Advance the wavefront to `segment`.
    fn activate(&mut self, segment: usize) {
        debug_assert_eq!(
            self.active,
            segment.checked_sub(1),
            "segments activate in chain order"
        );
        self.active = Some(segment);
    }

    /// Cut the chain so its committed prefix ends right before `at`.
    /// Idempotent; the earliest cut and its blocker win. Reservations of all
    /// dropped segments are zeroed so they can never activate.
    fn clip_at(&mut self, at: usize, by: Option<MoverId>) {
        debug_assert!(at > 0, "the starting segment is never clipped");
        if self.clip.is_some_and(|clip| clip.at <= at) {
            return;
        }
        debug_assert!(self.active.is_none_or(|active| active < at));
        for segment in &mut self.segments[at..] {
            segment.pending = 0;
        }
        self.clip = Some(ChainClip { at, by });
    }
}

/// A segment's reservation of one grid cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CellClaim {
    mover: MoverId,
    segment: u32,
}

/// Flattened scan entry: one reservation plus the keys the sorted walk needs.
#[derive(Debug, Clone, Copy)]
struct ClaimEvent {
    entry: u32,
    mover: MoverId,
    segment: u32,
    cell_key: u64,
}

/// Pure rasterization output for one mover, before any index mutation.
#[derive(Debug, Clone)]
struct PathPlan {
    segments: Vec<PathSegment>,
    /// Whether an out-of-bounds footprint truncated the request.
    edge_clip: bool,
}

/// Pack a cell coordinate into a single map key.
const fn cell_key(cell: Cell) -> u64 {
    ((cell.y as u32 as u64) << 32) | (cell.x as u32 as u64)
}

/// Visit every perimeter cell of the square footprint centered on `cell`.
///
/// A radius of 0 visits just the center. Larger radii visit the full top and
/// bottom rows plus the remaining side columns, 8 * radius cells in total;
/// interior cells are skipped because a footprint can only be entered through
/// its perimeter within one tick.
fn for_each_ring_cell(cell: Cell, radius: i32, mut visit: impl FnMut(Cell)) {
    if radius == 0 {
        visit(cell);
        return;
    }
    for x in (cell.x - radius)..=(cell.x + radius) {
        visit(Cell::new(x, cell.y - radius));
        visit(Cell::new(x, cell.y + radius));
    }
    for y in (cell.y - radius + 1)..(cell.y + radius) {
        visit(Cell::new(cell.x - radius, y));
        visit(Cell::new(cell.x + radius, y));
    }
}

/// Walk the straight line from `spec.origin` toward `spec.target`, emitting
/// one segment per grid cell crossed.
///
/// Timing spreads [`TICK_TIME_WINDOW`] evenly over the dominant-axis steps,
/// so each segment's entry equals its predecessor's exit and entries are
/// strictly increasing along the chain. The walk stops early when the next
/// cell's footprint would poke past the world edge; the dropped remainder is
/// recorded as `edge_clip` and never reserves anything.
fn rasterize(geometry: &GridGeometry, spec: &MoverSpec) -> PathPlan {
    let radius = i32::from(spec.radius);
    let mut segments = Vec::new();
    let mut current = spec.origin;
    let mut segment = PathSegment {
        start: current,
        end: current,
        entry: 0,
        exit: NO_EXIT,
        cell: geometry.cell_of(current),
        pending: 0,
    };
    let mut edge_clip = false;

    let dx = spec.target.x - spec.origin.x;
    let dy = spec.target.y - spec.origin.y;
    let run_x = dx.abs();
    let run_y = dy.abs();
    let steps = run_x.max(run_y);
    if steps > 0 {
        let step_x = dx.signum();
        let step_y = dy.signum();
        let slice = (TICK_TIME_WINDOW / steps as u32).max(1);
        let mut error = steps / 2;
        let mut elapsed = 0u32;
        for _ in 0..steps {
            if run_x >= run_y {
                current.x += step_x;
                error -= run_y;
                if error < 0 {
                    current.y += step_y;
                    error += run_x;
                }
            } else {
                current.y += step_y;
                error -= run_x;
                if error < 0 {
                    current.x += step_x;
                    error += run_y;
                }
            }
            elapsed += slice;
            let cell = geometry.cell_of(current);
            if cell == segment.cell {
                segment.end = current;
                continue;
            }
            if !geometry.footprint_in_bounds(cell, radius) {
                edge_clip = true;
                break;
            }
            segment.exit = elapsed;
            segments.push(segment);
            segment = PathSegment {
                start: current,
                end: current,
                entry: elapsed,
                exit: NO_EXIT,
                cell,
                pending: 0,
            };
        }
    }
    segments.push(segment);
    PathPlan {
        segments,
        edge_clip,
    }
}

/// Per-tick movement index: registered paths, cell reservations, and the
/// resolution scan.
///
/// An index is built fresh each tick. Movers are registered with
/// [`GridIndex::add_path`] (or in batch with [`GridIndex::add_paths`]) and
/// the tick is settled exactly once by [`GridIndex::resolve_paths`], which
/// consumes the index.
#[derive(Debug)]
pub struct GridIndex {
    geometry: GridGeometry,
    chains: Vec<PathChain>,
    cells: HashMap<u64, Vec<CellClaim>>,
    events: Vec<ClaimEvent>,
}

impl GridIndex {
    /// Build an index for the given configuration.
    pub fn new(config: GridConfig) -> Result<Self, GridError> {
        Ok(Self::with_geometry(config.geometry()?))
    }

    /// Build an index from already-validated geometry.
    #[must_use]
    pub fn with_geometry(geometry: GridGeometry) -> Self {
        Self {
            geometry,
            chains: Vec::new(),
            cells: HashMap::new(),
            events: Vec::new(),
        }
    }

    /// Geometry this index resolves against.
    #[must_use]
    pub fn geometry(&self) -> GridGeometry {
        self.geometry
    }

    /// Number of movers registered so far.
    #[must_use]
    pub fn mover_count(&self) -> usize {
        self.chains.len()
    }

    /// Number of cell reservations registered so far.
    #[must_use]
    pub fn claim_count(&self) -> usize {
        self.events.len()
    }

    /// Register one mover's requested move for this tick.
    ///
    /// The request is rasterized into a segment chain and every segment's
    /// footprint perimeter is reserved. Validation happens before any index
    /// mutation, so a failed registration leaves the index untouched.
    pub fn add_path(&mut self, spec: MoverSpec) -> Result<MoverId, GridError> {
        self.validate_spec(&spec)?;
        let plan = rasterize(&self.geometry, &spec);
        self.commit_plan(i32::from(spec.radius), plan)
    }

    /// Register a batch of movers, in input order.
    ///
    /// Rasterization runs in parallel for large batches; commits stay in
    /// input order, so the result is identical to calling
    /// [`GridIndex::add_path`] once per spec. On error, movers committed
    /// before the failing spec remain registered.
    pub fn add_paths(&mut self, specs: &[MoverSpec]) -> Result<Vec<MoverId>, GridError> {
        for spec in specs {
            self.validate_spec(spec)?;
        }
        let geometry = self.geometry;
        let plans: Vec<PathPlan> = if specs.len() >= PARALLEL_RASTER_MIN {
            specs
                .par_iter()
                .map(|spec| rasterize(&geometry, spec))
                .collect()
        } else {
            specs.iter().map(|spec| rasterize(&geometry, spec)).collect()
        };
        let mut movers = Vec::with_capacity(specs.len());
        for (spec, plan) in specs.iter().zip(plans) {
            movers.push(self.commit_plan(i32::from(spec.radius), plan)?);
        }
        Ok(movers)
    }

    /// Resolve every registered path in one time-ordered scan, consuming the
    /// index.
    ///
    /// Reservations are visited in ascending entry time; ties fall back to
    /// registration order, then chain position, which keeps one segment's
    /// reservations contiguous in the scan. A segment whose cell holds
    /// another mover's active segment clips the whole remainder of its
    /// chain; otherwise the segment activates once its last reservation is
    /// visited.
    pub fn resolve_paths(mut self) -> Result<TickResolution, GridError> {
        let mut events = std::mem::take(&mut self.events);
        events.sort_unstable_by_key(|event| {
            (event.entry, event.mover, event.segment, event.cell_key)
        });

        for event in &events {
            let mover_index = event.mover.index();
            let segment_index = event.segment as usize;
            if self.chains[mover_index].segments[segment_index].pending == 0 {
                // Starting segments resolve wholesale on their first
                // reservation; clipped segments are zeroed when cut. Anything
                // else re-surfacing here means the index is corrupt.
                if segment_index != 0 && !self.chains[mover_index].is_clipped(segment_index) {
                    return Err(GridError::ResolutionInvariant {
                        mover: event.mover,
                        segment: segment_index,
                    });
                }
                continue;
            }
            if segment_index == 0 {
                // An entity is never evicted from the cell it starts in.
                let chain = &mut self.chains[mover_index];
                chain.segments[0].pending = 0;
                chain.activate(0);
                continue;
            }
            match self.find_blocker(event) {
                Some(by) => {
                    self.chains[mover_index].clip_at(segment_index, Some(by));
                }
                None => {
                    let chain = &mut self.chains[mover_index];
                    let segment = &mut chain.segments[segment_index];
                    segment.pending -= 1;
                    if segment.pending == 0 {
                        chain.activate(segment_index);
                    }
                }
            }
        }

        Ok(self.into_resolution())
    }

    /// Find the mover whose active segment holds the event's cell, if any.
    fn find_blocker(&self, event: &ClaimEvent) -> Option<MoverId> {
        let occupants = self.cells.get(&event.cell_key)?;
        occupants.iter().find_map(|claim| {
            if claim.mover == event.mover {
                return None;
            }
            let chain = &self.chains[claim.mover.index()];
            (chain.active == Some(claim.segment as usize)).then_some(claim.mover)
        })
    }

    fn validate_spec(&self, spec: &MoverSpec) -> Result<(), GridError> {
        self.geometry.ensure_contains(spec.origin)?;
        self.geometry.ensure_contains(spec.target)?;
        let start = self.geometry.cell_of(spec.origin);
        let radius = i32::from(spec.radius);
        if !self.geometry.footprint_in_bounds(start, radius) {
            return Err(GridError::StartFootprintOutOfBounds {
                x: start.x,
                y: start.y,
                radius,
            });
        }
        Ok(())
    }

    /// Reject a start whose footprint overlaps another mover's starting
    /// footprint. Claims from non-starting segments are fine; those cells
    /// are merely en route.
    fn ensure_start_exclusive(&self, start: Cell, radius: i32) -> Result<(), GridError> {
        let mut conflict = None;
        for_each_ring_cell(start, radius, |cell| {
            if conflict.is_some() {
                return;
            }
            if let Some(claims) = self.cells.get(&cell_key(cell)) {
                if let Some(owner) = claims.iter().find(|claim| claim.segment == 0) {
                    conflict = Some((owner.mover, cell));
                }
            }
        });
        match conflict {
            Some((other, cell)) => Err(GridError::StartCellConflict {
                other,
                x: cell.x,
                y: cell.y,
            }),
            None => Ok(()),
        }
    }

    fn commit_plan(&mut self, radius: i32, plan: PathPlan) -> Result<MoverId, GridError> {
        self.ensure_start_exclusive(plan.segments[0].cell, radius)?;
        let mover = MoverId(self.chains.len() as u32);
        let clip = plan
            .edge_clip
            .then_some(ChainClip {
                at: plan.segments.len(),
                by: None,
            });
        let mut chain = PathChain {
            segments: plan.segments,
            active: None,
            clip,
        };
        for (index, segment) in chain.segments.iter_mut().enumerate() {
            let entry = segment.entry;
            let segment_id = index as u32;
            let mut reserved = 0u32;
            for_each_ring_cell(segment.cell, radius, |cell| {
                let key = cell_key(cell);
                self.cells.entry(key).or_default().push(CellClaim {
                    mover,
                    segment: segment_id,
                });
                self.events.push(ClaimEvent {
                    entry,
                    mover,
                    segment: segment_id,
                    cell_key: key,
                });
                reserved += 1;
            });
            segment.pending = reserved;
        }
        self.chains.push(chain);
        Ok(mover)
    }

    fn into_resolution(self) -> TickResolution {
        let outcomes = self
            .chains
            .iter()
            .enumerate()
            .map(|(index, chain)| {
                let committed = chain.committed_len();
                debug_assert!(committed >= 1, "the starting segment always survives");
                debug_assert_eq!(chain.active, Some(committed - 1));
                let terminal = &chain.segments[committed - 1];
                MoveOutcome {
                    mover: MoverId(index as u32),
                    origin: chain.segments[0].start,
                    terminus: terminal.end,
                    path_cells: chain.segments.len(),
                    committed_cells: committed,
                    reason: match chain.clip {
                        None => MoveReason::DestinationReached,
                        Some(clip) => MoveReason::Blocked { by: clip.by },
                    },
                }
            })
            .collect();
        TickResolution { outcomes }
    }
}
