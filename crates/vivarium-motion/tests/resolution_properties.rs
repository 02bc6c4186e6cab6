//! Randomized invariants over whole resolution passes.

use proptest::prelude::*;
use std::collections::HashMap;
use vivarium_motion::{GridConfig, GridIndex, GridPoint, MoveReason, MoverId, MoverSpec};

const CELL: i32 = 8;
const CELLS: i32 = 32;
const UNITS: i32 = CELL * CELLS;

fn build_grid() -> GridIndex {
    let config = GridConfig {
        grid_width: CELLS as u32,
        grid_height: CELLS as u32,
        cell_size: CELL as u32,
    };
    GridIndex::new(config).expect("valid grid")
}

/// Interior cells on a stride-4 lattice. Starting footprints of radius 1 or
/// less drawn from distinct lattice cells can never overlap, so every batch
/// registers cleanly.
fn lattice_cells() -> Vec<(i32, i32)> {
    (1..CELLS - 1)
        .step_by(4)
        .flat_map(|x| (1..CELLS - 1).step_by(4).map(move |y| (x, y)))
        .collect()
}

fn lattice_point(cell: (i32, i32)) -> GridPoint {
    GridPoint::new(cell.0 * CELL + CELL / 2, cell.1 * CELL + CELL / 2)
}

fn mover_batch() -> impl Strategy<Value = Vec<MoverSpec>> {
    proptest::sample::subsequence(lattice_cells(), 1..25)
        .prop_flat_map(|starts| {
            let count = starts.len();
            let targets = prop::collection::vec((0..UNITS, 0..UNITS, 0..=1u16), count);
            (Just(starts), targets)
        })
        .prop_map(|(starts, targets)| {
            starts
                .into_iter()
                .zip(targets)
                .map(|(start, (x, y, radius))| {
                    MoverSpec::new(lattice_point(start), GridPoint::new(x, y), radius)
                })
                .collect()
        })
}

proptest! {
    #[test]
    fn resolution_is_deterministic(specs in mover_batch()) {
        let run = |specs: &[MoverSpec]| {
            let mut index = build_grid();
            index.add_paths(specs).expect("registration");
            index.resolve_paths().expect("resolution")
        };
        prop_assert_eq!(run(&specs), run(&specs));
    }

    #[test]
    fn outcomes_stay_inside_the_world(specs in mover_batch()) {
        let mut index = build_grid();
        index.add_paths(&specs).expect("registration");
        let geometry = index.geometry();
        let resolution = index.resolve_paths().expect("resolution");

        prop_assert_eq!(resolution.len(), specs.len());
        for (outcome, spec) in resolution.outcomes().iter().zip(&specs) {
            prop_assert!(geometry.contains(outcome.terminus));
            prop_assert_eq!(outcome.origin, spec.origin);
            prop_assert!(outcome.committed_cells >= 1);
            prop_assert!(outcome.committed_cells <= outcome.path_cells);
            match outcome.reason {
                MoveReason::DestinationReached => {
                    prop_assert_eq!(outcome.terminus, spec.target);
                    prop_assert_eq!(outcome.committed_cells, outcome.path_cells);
                }
                MoveReason::Blocked { by: None } => {
                    // Only an out-of-bounds remainder was dropped; every
                    // reserved cell was still reached.
                    prop_assert_eq!(outcome.committed_cells, outcome.path_cells);
                }
                MoveReason::Blocked { by: Some(other) } => {
                    prop_assert!(other.index() < specs.len());
                    prop_assert!(other != outcome.mover);
                }
            }
        }
    }

    #[test]
    fn settled_footprints_never_share_a_cell(specs in mover_batch()) {
        let mut index = build_grid();
        index.add_paths(&specs).expect("registration");
        let geometry = index.geometry();
        let resolution = index.resolve_paths().expect("resolution");

        let mut held: HashMap<(i32, i32), MoverId> = HashMap::new();
        for (outcome, spec) in resolution.outcomes().iter().zip(&specs) {
            let center = geometry.cell_of(outcome.terminus);
            let radius = i32::from(spec.radius);
            for dx in -radius..=radius {
                for dy in -radius..=radius {
                    if dx.abs().max(dy.abs()) < radius {
                        continue;
                    }
                    let cell = (center.x + dx, center.y + dy);
                    let previous = held.insert(cell, outcome.mover);
                    prop_assert!(
                        previous.is_none(),
                        "cell {:?} held by {:?} and {:?}",
                        cell,
                        previous,
                        outcome.mover
                    );
                }
            }
        }
    }

    #[test]
    fn stationary_movers_are_never_displaced(
        starts in proptest::sample::subsequence(lattice_cells(), 1..25)
    ) {
        let specs: Vec<MoverSpec> = starts
            .into_iter()
            .map(|start| MoverSpec::hold(lattice_point(start), 1))
            .collect();
        let mut index = build_grid();
        index.add_paths(&specs).expect("registration");
        let resolution = index.resolve_paths().expect("resolution");

        for (outcome, spec) in resolution.outcomes().iter().zip(&specs) {
            prop_assert_eq!(outcome.reason, MoveReason::DestinationReached);
            prop_assert_eq!(outcome.terminus, spec.origin);
            prop_assert_eq!(outcome.path_cells, 1);
            prop_assert_eq!(outcome.committed_cells, 1);
        }
    }
}
