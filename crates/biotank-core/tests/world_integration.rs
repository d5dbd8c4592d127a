//! End-to-end scenarios: genome-driven behaviors steering bodies through the
//! full tick pipeline.

use biotank_core::{
    Behavior, BodyId, BodyView, TankConfig, TankWorld, Tick, UpdateCtx,
};
use biotank_genome::{Genome, GenomeContext, NeuralNetwork};
use biotank_index::{StaticObstacle, Vec2};
use std::sync::{Arc, Mutex};

fn seeded_world(seed: u64) -> TankWorld {
    TankWorld::new(TankConfig {
        rng_seed: Some(seed),
        ..TankConfig::default()
    })
    .expect("valid default config")
}

/// A minimal organism: a compiled genome network maps local observations to a
/// steering force.
struct NeatSwimmer {
    brain: NeuralNetwork,
    neighbor_count: f32,
    nearest_offset: Vec2,
}

impl NeatSwimmer {
    fn grown(seed: u64) -> Self {
        let mut ctx = GenomeContext::seeded(seed);
        let mut genome = Genome::random(3, 2, &mut ctx);
        for _ in 0..6 {
            genome = genome.mutate_structure(&mut ctx);
        }
        Self {
            brain: NeuralNetwork::build(&genome),
            neighbor_count: 0.0,
            nearest_offset: Vec2::ZERO,
        }
    }
}

impl Behavior for NeatSwimmer {
    fn on_interact(&mut self, ctx: &mut UpdateCtx<'_>, neighbor: &BodyView) {
        let offset = neighbor.position - ctx.body().position;
        if self.neighbor_count == 0.0 || offset.length_sq() < self.nearest_offset.length_sq() {
            self.nearest_offset = offset;
        }
        self.neighbor_count += 1.0;
    }

    fn on_update(&mut self, ctx: &mut UpdateCtx<'_>) {
        self.brain.set_inputs(&[
            self.neighbor_count,
            self.nearest_offset.x / 50.0,
            self.nearest_offset.y / 50.0,
        ]);
        self.brain.tick();
        let out = self.brain.outputs();
        ctx.apply_force(Vec2::new(out[0], out[1]) * 200.0);
        self.neighbor_count = 0.0;
        self.nearest_offset = Vec2::ZERO;
    }
}

fn populate(world: &mut TankWorld, count: usize) -> Vec<BodyId> {
    (0..count)
        .map(|i| {
            let x = 100.0 + 90.0 * (i % 8) as f32;
            let y = 100.0 + 90.0 * (i / 8) as f32;
            let id = world.create_body(Vec2::new(x, y), 6.0);
            world.set_behavior(id, Box::new(NeatSwimmer::grown(1_000 + i as u64)));
            id
        })
        .collect()
}

#[test]
fn identically_seeded_worlds_stay_bitwise_identical() {
    let mut left = seeded_world(7);
    let mut right = seeded_world(7);
    let left_ids = populate(&mut left, 24);
    let right_ids = populate(&mut right, 24);

    for _ in 0..40 {
        let a = left.step(1.0 / 60.0);
        let b = right.step(1.0 / 60.0);
        assert_eq!(a, b);
    }
    for (l, r) in left_ids.iter().zip(&right_ids) {
        let lb = left.body(*l).expect("left body alive");
        let rb = right.body(*r).expect("right body alive");
        assert_eq!(lb.position(), rb.position());
        assert_eq!(lb.radius(), rb.radius());
    }
}

#[test]
fn genome_driven_swim_keeps_state_finite() {
    let mut world = seeded_world(11);
    let ids = populate(&mut world, 32);
    for _ in 0..120 {
        world.step(1.0 / 60.0);
    }
    assert_eq!(world.tick(), Tick(120));
    for id in ids {
        let body = world.body(id).expect("body alive");
        assert!(body.position().is_finite(), "position went non-finite");
        assert!(body.velocity().length() <= world.config().max_speed + 1e-3);
    }
    assert_eq!(world.history().count(), 120);
}

/// Behavior commits are buffered: a neighbor's radius change this tick is
/// only observable on the next tick's snapshot.
struct Grower;

impl Behavior for Grower {
    fn on_update(&mut self, ctx: &mut UpdateCtx<'_>) {
        ctx.set_radius(ctx.body().radius + 1.0);
    }
}

struct Observer {
    seen: Arc<Mutex<Vec<f32>>>,
}

impl Behavior for Observer {
    fn on_interact(&mut self, _ctx: &mut UpdateCtx<'_>, neighbor: &BodyView) {
        self.seen.lock().unwrap().push(neighbor.radius);
    }

    fn on_update(&mut self, _ctx: &mut UpdateCtx<'_>) {}
}

#[test]
fn neighbor_writes_become_visible_one_tick_later() {
    let mut world = seeded_world(3);
    let observer = world.create_body(Vec2::new(100.0, 100.0), 5.0);
    let grower = world.create_body(Vec2::new(130.0, 100.0), 5.0);
    let seen = Arc::new(Mutex::new(Vec::new()));
    world.set_behavior(
        observer,
        Box::new(Observer { seen: Arc::clone(&seen) }),
    );
    world.set_behavior(grower, Box::new(Grower));

    world.step(1.0 / 60.0);
    world.step(1.0 / 60.0);
    world.step(1.0 / 60.0);

    let seen = seen.lock().unwrap();
    assert_eq!(seen.as_slice(), &[5.0, 6.0, 7.0]);
}

#[test]
fn bodies_are_pushed_out_of_obstacles() {
    let mut world = seeded_world(5);
    let wall = StaticObstacle::new(
        Vec2::new(200.0, 200.0),
        Vec2::new(260.0, 200.0),
        Vec2::new(230.0, 260.0),
    );
    let wall_idx = world.add_obstacle(wall);
    let trapped = world.create_body(Vec2::new(230.0, 220.0), 5.0);

    let summary = world.step(1.0 / 60.0);
    assert!(summary.contacts > 0, "projection should count as a contact");

    let body = world.body(trapped).expect("body alive");
    assert!(body.recent_collisions() > 0);
    let wall = world.obstacle(wall_idx).expect("obstacle registered");
    // One projection per sub-step; the center must no longer sit inside.
    assert!(!wall.contains(body.position()));
}

/// Dies after a fixed number of updates.
struct Mayfly {
    remaining: u32,
}

impl Behavior for Mayfly {
    fn on_update(&mut self, ctx: &mut UpdateCtx<'_>) {
        if self.remaining == 0 {
            ctx.die();
        } else {
            self.remaining -= 1;
        }
    }
}

#[test]
fn death_sweep_removes_flagged_bodies_same_tick() {
    let mut world = seeded_world(9);
    let mortal = world.create_body(Vec2::new(300.0, 300.0), 5.0);
    let survivor = world.create_body(Vec2::new(600.0, 600.0), 5.0);
    world.set_behavior(mortal, Box::new(Mayfly { remaining: 2 }));

    let s1 = world.step(1.0 / 60.0);
    let s2 = world.step(1.0 / 60.0);
    assert_eq!((s1.deaths, s2.deaths), (0, 0));
    assert_eq!(world.body_count(), 2);

    let s3 = world.step(1.0 / 60.0);
    assert_eq!(s3.deaths, 1);
    assert_eq!(s3.body_count, 1);
    assert!(world.body(mortal).is_none());
    assert!(world.body(survivor).is_some());

    // The next tick's rebuilt grid must not resurrect the handle.
    world.step(1.0 / 60.0);
    let found: Vec<BodyId> = world
        .query_neighbors(Vec2::new(300.0, 300.0), 50.0)
        .collect();
    assert!(found.is_empty());
}
