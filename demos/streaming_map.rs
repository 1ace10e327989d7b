//! Streaming Map Example
//!
//! Simulates a robot driving down a corridor: every frame a new downsampled
//! scan is merged into the map, points that fall behind the robot are
//! trimmed, and the planner checks the path ahead for obstacles. Large
//! rebalancing work happens on the tree's background worker.
//!
//! Run with `RUST_LOG=debug` to watch background rebuilds being scheduled.

use ikdtree::{BoundingBox3D, IkdTree, Point3, TreeConfig};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::error::Error;
use std::time::Instant;

const FRAMES: usize = 120;
const POINTS_PER_SCAN: usize = 2_000;
const MAP_LENGTH: f32 = 30.0;

/// Walls on both sides of the corridor, plus a few posts in the middle.
fn scan(rng: &mut StdRng, robot_x: f32) -> Vec<Point3> {
    (0..POINTS_PER_SCAN)
        .map(|i| {
            let x = robot_x + rng.random_range(0.0..15.0);
            let z = rng.random_range(0.0..2.5);
            match i % 10 {
                0 => {
                    let post = (x / 7.0).round() * 7.0;
                    Point3::new(post + rng.random_range(-0.1..0.1), rng.random_range(-0.1..0.1), z)
                }
                1..=4 => Point3::new(x, -2.0 + rng.random_range(-0.05..0.05), z),
                _ => Point3::new(x, 2.0 + rng.random_range(-0.05..0.05), z),
            }
        })
        .collect()
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();
    println!("=== ikdtree - Streaming Map ===\n");

    let config = TreeConfig::default()
        .with_voxel_size(0.1)
        .with_background_rebuild_size(1000);
    let map = IkdTree::with_config(config)?;
    let mut rng = StdRng::seed_from_u64(42);

    let started = Instant::now();
    let mut robot_x = 0.0f32;
    for frame in 0..FRAMES {
        let stored = map.add_points(&scan(&mut rng, robot_x), true)?;

        // Forget everything more than MAP_LENGTH behind the robot.
        let behind = BoundingBox3D::new(-1e6, -1e3, -1e3, robot_x - MAP_LENGTH, 1e3, 1e3);
        let trimmed = map.delete_boxes(&[behind]);

        let ahead = Point3::new(robot_x + 1.0, 0.0, 1.0);
        let blocked = map.collision_line_check(
            &Point3::new(robot_x, 0.0, 1.0),
            &ahead,
            0.3,
        );

        if frame % 20 == 0 {
            let (balance, delete) = map.balance_and_delete_ratios();
            println!(
                "frame {:3}: +{:4} stored, -{:4} trimmed, {:6} live / {:6} nodes, balance {:.2}, deleted {:.2}{}",
                frame,
                stored,
                trimmed,
                map.valid_count(),
                map.size(),
                balance,
                delete,
                if blocked { ", path blocked" } else { "" }
            );
        }
        robot_x += 0.5;
    }

    let purged = map.acquire_removed_points();
    let stats = map.rebuild_stats();
    println!("\nProcessed {} frames in {:?}", FRAMES, started.elapsed());
    println!("Points purged by rebuilds: {}", purged.len());
    println!(
        "Background rebuilds: {} completed, {} aborted, {} operations replayed, peak log {}",
        stats.passes, stats.aborted, stats.replayed_operations, stats.peak_log_len
    );

    let probe = Point3::new(robot_x, 1.9, 1.0);
    let (nearest, dist_sq) = map.k_nearest(&probe, 3, 1.0);
    println!("\nNearest wall points to {:?}:", (probe.x, probe.y, probe.z));
    for (p, d) in nearest.iter().zip(&dist_sq) {
        println!("  ({:.2}, {:.2}, {:.2}) at {:.3} m", p.x, p.y, p.z, d.sqrt());
    }

    let hit = map.ray_cast(&Point3::new(robot_x, 0.0, 1.0), [0.0, 1.0, 0.0], 0.1, 5.0)?;
    println!("Ray to the left wall hits at y = {:.2}", hit.y);

    map.verify_invariants()?;
    println!("\nInvariants hold.");
    Ok(())
}
