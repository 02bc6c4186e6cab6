use anyhow::Result;
use rand::RngCore;
use std::f32::consts::{FRAC_PI_2, PI, TAU};
use tracing::{info, warn};
use vivarium_core::{
    EntityData, EntityView, MoveIntent, MoveResolution, MovementPlanner, WorldConfig, WorldState,
};
use vivarium_motion::GridPoint;

const DEFAULT_TICK_BUDGET: u64 = 600;
const REPORT_INTERVAL: u64 = 60;

fn main() -> Result<()> {
    init_tracing();
    let mut world = bootstrap_world()?;
    let budget = tick_budget();
    info!(
        entities = world.entity_count(),
        width_cells = world.geometry().width_cells(),
        height_cells = world.geometry().height_cells(),
        ticks = budget,
        "Starting Vivarium simulation shell"
    );
    run(&mut world, budget)
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Tick budget for the run, overridable through `VIVARIUM_TICKS`.
fn tick_budget() -> u64 {
    std::env::var("VIVARIUM_TICKS")
        .ok()
        .and_then(|raw| raw.trim().parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(DEFAULT_TICK_BUDGET)
}

fn bootstrap_world() -> Result<WorldState> {
    let config = WorldConfig {
        rng_seed: Some(0x5EED_CAFE_F00D_0001_u64),
        ..WorldConfig::default()
    };
    let mut world = WorldState::new(config)?;
    seed_wanderers(&mut world)?;
    Ok(world)
}

/// Spawn a lattice of wandering entities with randomized speeds and headings.
fn seed_wanderers(world: &mut WorldState) -> Result<()> {
    use rand::Rng;

    let cell_size = world.config().cell_size as i32;
    let mut origins = Vec::new();
    for row in 0..8 {
        for col in 0..8 {
            let cell_x = 10 + col * 12;
            let cell_y = 10 + row * 12;
            origins.push(GridPoint::new(
                cell_x * cell_size + cell_size / 2,
                cell_y * cell_size + cell_size / 2,
            ));
        }
    }

    let draws: Vec<(u16, f32)> = {
        let rng = world.rng();
        origins
            .iter()
            .map(|_| (rng.random_range(10..=20), rng.random_range(0.0..TAU)))
            .collect()
    };

    for (origin, (speed, heading)) in origins.into_iter().zip(draws) {
        let id = world.spawn_entity(EntityData::new(origin, 1, speed))?;
        world.set_planner(id, Box::new(WanderPlanner::new(heading)));
    }
    Ok(())
}

fn run(world: &mut WorldState, budget: u64) -> Result<()> {
    for _ in 0..budget {
        let summary = world.step()?;
        if summary.tick.0 % REPORT_INTERVAL == 0 {
            info!(
                tick = summary.tick.0,
                entities = summary.entity_count,
                moved = summary.moved,
                blocked = summary.blocked,
                held = summary.held,
                cells_traveled = summary.cells_traveled,
                "Tick summary"
            );
        }
    }

    match world.history().last() {
        Some(summary) => info!(
            tick = summary.tick.0,
            entities = summary.entity_count,
            moved = summary.moved,
            blocked = summary.blocked,
            cells_traveled = summary.cells_traveled,
            "Simulation run completed"
        ),
        None => warn!("Simulation run completed without tick summaries"),
    }
    Ok(())
}

/// Planner that keeps a persistent heading between ticks, drifting a little
/// each tick and turning hard away after a blocked move.
struct WanderPlanner {
    heading: f32,
}

impl WanderPlanner {
    /// Maximum per-tick heading drift in radians.
    const DRIFT: f32 = 0.35;
    /// How many ticks of travel the requested goal projects ahead.
    const LOOKAHEAD: f32 = 3.0;

    fn new(heading: f32) -> Self {
        Self { heading }
    }
}

impl MovementPlanner for WanderPlanner {
    fn kind(&self) -> &'static str {
        "wander"
    }

    fn plan(&mut self, view: &EntityView, rng: &mut dyn RngCore) -> MoveIntent {
        use rand::Rng;

        let was_blocked = view
            .last_motion
            .is_some_and(|motion| matches!(motion.resolution, MoveResolution::Blocked { .. }));
        if was_blocked {
            self.heading += PI + rng.random_range(-FRAC_PI_2..FRAC_PI_2);
        } else {
            self.heading += rng.random_range(-Self::DRIFT..Self::DRIFT);
        }
        self.heading = self.heading.rem_euclid(TAU);

        let reach = f32::from(view.speed).max(1.0) * Self::LOOKAHEAD;
        let goal = GridPoint::new(
            view.position.x + (self.heading.cos() * reach).round() as i32,
            view.position.y + (self.heading.sin() * reach).round() as i32,
        );
        MoveIntent::MoveTo(goal)
    }
}
