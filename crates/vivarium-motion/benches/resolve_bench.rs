use criterion::{BatchSize, Criterion, criterion_group, criterion_main};
use std::time::Duration;
use vivarium_motion::{GridConfig, GridIndex, GridPoint, MoverSpec};

/// Lattice of movers all driving for the mirrored side of the world, so most
/// paths cross the middle and plenty of cell contests actually happen.
fn build_index(movers: usize) -> GridIndex {
    let config = GridConfig {
        grid_width: 256,
        grid_height: 256,
        cell_size: 16,
    };
    let mut index = GridIndex::new(config).expect("bench grid");
    let width = index.geometry().width_units();
    let mut placed = 0usize;
    'rows: for row in 0..84 {
        for col in 0..84 {
            if placed == movers {
                break 'rows;
            }
            let origin = GridPoint::new((2 + col * 3) * 16 + 8, (2 + row * 3) * 16 + 8);
            let target = GridPoint::new(width - 1 - origin.x, origin.y);
            index
                .add_path(MoverSpec::new(origin, target, (placed % 2) as u16))
                .expect("registered");
            placed += 1;
        }
    }
    index
}

fn bench_resolution(c: &mut Criterion) {
    let mut group = c.benchmark_group("resolve_paths");
    // Longer measurement windows give more stable numbers; allow env overrides
    let samples: usize = std::env::var("VIV_BENCH_SAMPLES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(30);
    let warm: u64 = std::env::var("VIV_BENCH_WARMUP_SECS")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(2);
    let measure: u64 = std::env::var("VIV_BENCH_MEASURE_SECS")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(10);
    group.sample_size(samples);
    group.warm_up_time(Duration::from_secs(warm));
    group.measurement_time(Duration::from_secs(measure));
    let mover_counts: Vec<usize> = std::env::var("VIV_BENCH_MOVERS")
        .ok()
        .map(|s| {
            s.split(',')
                .filter_map(|t| t.trim().parse::<usize>().ok())
                .collect::<Vec<_>>()
        })
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| vec![256_usize, 1024, 4096]);
    for &movers in &mover_counts {
        group.bench_function(format!("movers{}", movers), |b| {
            b.iter_batched(
                || build_index(movers),
                |index| index.resolve_paths().expect("resolved"),
                BatchSize::LargeInput,
            );
        });
    }
    group.finish();
}

criterion_group!(benches, bench_resolution);
criterion_main!(benches);
