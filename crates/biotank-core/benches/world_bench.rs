use biotank_core::{TankConfig, TankWorld};
use biotank_index::Vec2;
use criterion::{Criterion, criterion_group, criterion_main};
use std::hint::black_box;

fn populated_world(bodies: usize) -> TankWorld {
    let mut world = TankWorld::new(TankConfig {
        rng_seed: Some(0xB10_7A17),
        ..TankConfig::default()
    })
    .expect("valid config");
    let per_row = 20;
    for i in 0..bodies {
        let x = 40.0 + 55.0 * (i % per_row) as f32;
        let y = 40.0 + 55.0 * (i / per_row) as f32;
        world.create_body(Vec2::new(x, y), 8.0);
    }
    world
}

fn bench_step(c: &mut Criterion) {
    let mut group = c.benchmark_group("tick");
    for &bodies in &[100usize, 400] {
        group.bench_function(format!("step_{bodies}_bodies"), |b| {
            let mut world = populated_world(bodies);
            b.iter(|| {
                black_box(world.step(1.0 / 60.0));
            });
        });
    }
    group.finish();
}

fn bench_queries(c: &mut Criterion) {
    let mut world = populated_world(400);
    world.step(1.0 / 60.0);
    c.bench_function("query_neighbors_400_bodies", |b| {
        b.iter(|| {
            let count = world
                .query_neighbors(black_box(Vec2::new(500.0, 500.0)), 50.0)
                .count();
            black_box(count)
        });
    });
    c.bench_function("raycast_400_bodies", |b| {
        b.iter(|| {
            black_box(world.raycast(Vec2::new(0.0, 500.0), Vec2::new(1_100.0, 500.0)))
        });
    });
}

criterion_group!(benches, bench_step, bench_queries);
criterion_main!(benches);
