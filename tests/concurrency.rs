use ikdtree::prelude::*;
use ikdtree::{VoxelKey, same_point};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn eager_tree() -> IkdTree {
    IkdTree::with_config(TreeConfig::default().with_background_rebuild_size(200)).unwrap()
}

fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    done()
}

fn region_cloud(rng: &mut StdRng, region: usize, n: usize) -> Vec<Point3> {
    let base = region as f32 * 100.0;
    (0..n)
        .map(|_| {
            Point3::new(
                base + rng.random_range(0.0..50.0),
                rng.random_range(0.0..50.0),
                rng.random_range(0.0..50.0),
            )
        })
        .collect()
}

#[test]
fn test_large_imbalance_is_rebuilt_in_background() {
    init_logging();
    let tree = eager_tree();
    let base: Vec<Point3> = (0..300).map(|i| Point3::new(i as f32, 0.0, 0.0)).collect();
    tree.build(&base).unwrap();

    // Appending past the maximum piles every insert onto the right spine.
    let tail: Vec<Point3> = (300..900).map(|i| Point3::new(i as f32, 1.0, 0.0)).collect();
    assert_eq!(tree.add_points(&tail, false).unwrap(), 600);

    assert!(wait_until(Duration::from_secs(10), || tree.rebuild_stats().passes >= 1));
    assert!(wait_until(Duration::from_secs(10), || !tree.is_rebuilding()));

    let stats = tree.rebuild_stats();
    assert!(stats.last_rebuilt_size >= 200);
    assert_eq!(stats.aborted, 0);
    assert_eq!(tree.valid_count(), 900);
    tree.verify_invariants().unwrap();

    let (found, _) = tree.k_nearest(&Point3::new(650.2, 1.0, 0.0), 1, f32::INFINITY);
    assert_eq!(found, vec![Point3::new(650.0, 1.0, 0.0)]);
}

#[test]
fn test_concurrent_writers_and_readers() {
    init_logging();
    let tree = Arc::new(eager_tree());
    let threads = 4;
    let barrier = Arc::new(Barrier::new(threads));
    let mut handles = Vec::new();

    for region in 0..threads {
        let tree = Arc::clone(&tree);
        let barrier = Arc::clone(&barrier);
        handles.push(thread::spawn(move || {
            let mut rng = StdRng::seed_from_u64(region as u64);
            barrier.wait();

            let mut kept = 0;
            for _ in 0..10 {
                let batch = region_cloud(&mut rng, region, 150);
                tree.add_points(&batch, false).unwrap();

                let (doomed, survivors) = batch.split_at(50);
                tree.delete_points(doomed);
                kept += survivors.len();

                for gone in doomed.iter().take(10) {
                    let (found, dists) = tree.k_nearest(gone, 5, f32::INFINITY);
                    assert!(found.len() <= 5);
                    assert!(dists.windows(2).all(|w| w[0] <= w[1]));
                    for p in &found {
                        assert!(
                            !doomed.iter().any(|d| same_point(d, p)),
                            "deleted point {:?} returned",
                            p
                        );
                    }
                }
            }
            kept
        }));
    }

    let expected: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
    assert!(wait_until(Duration::from_secs(10), || !tree.is_rebuilding()));
    assert_eq!(tree.valid_count(), expected);
    tree.verify_invariants().unwrap();
    assert_eq!(tree.rebuild_stats().aborted, 0);
}

#[test]
fn test_queries_run_during_rebuild() {
    init_logging();
    let tree = Arc::new(eager_tree());
    let base: Vec<Point3> = (0..500).map(|i| Point3::new(i as f32, 0.0, 0.0)).collect();
    tree.build(&base).unwrap();

    let writer = {
        let tree = Arc::clone(&tree);
        thread::spawn(move || {
            for i in 500..2000 {
                tree.add_points(&[Point3::new(i as f32, 0.0, 0.0)], false)
                    .unwrap();
            }
        })
    };

    let reader = {
        let tree = Arc::clone(&tree);
        thread::spawn(move || {
            let mut queries = 0;
            while queries < 2000 {
                let probe = Point3::new((queries % 500) as f32 + 0.1, 0.0, 0.0);
                let (found, _) = tree.k_nearest(&probe, 1, f32::INFINITY);
                assert_eq!(found, vec![Point3::new((queries % 500) as f32, 0.0, 0.0)]);
                let hits = tree.box_search(&BoundingBox3D::new(0.0, -1.0, -1.0, 10.0, 1.0, 1.0));
                assert_eq!(hits.len(), 10);
                queries += 1;
            }
        })
    };

    writer.join().unwrap();
    reader.join().unwrap();
    assert!(wait_until(Duration::from_secs(10), || !tree.is_rebuilding()));
    assert_eq!(tree.valid_count(), 2000);
    tree.verify_invariants().unwrap();
}

#[test]
fn test_deletes_logged_during_rebuild_are_kept() {
    init_logging();
    let tree = Arc::new(eager_tree());
    let points: Vec<Point3> = (0..3000)
        .map(|i| Point3::new(i as f32, (i % 13) as f32, (i % 7) as f32))
        .collect();
    tree.build(&points[..400]).unwrap();
    tree.add_points(&points[400..], false).unwrap();

    // Deletions race whichever background pass the inserts started.
    let doomed: Vec<Point3> = points.iter().copied().step_by(3).collect();
    tree.delete_points(&doomed);

    assert!(wait_until(Duration::from_secs(10), || !tree.is_rebuilding()));
    assert_eq!(tree.valid_count(), 3000 - doomed.len());
    tree.verify_invariants().unwrap();
    for p in doomed.iter().step_by(50) {
        let (found, _) = tree.k_nearest(p, 1, 0.5);
        assert!(found.is_empty(), "{:?} survived", p);
    }
}

struct Tracked {
    point: Point3,
    live: bool,
    downsampled: bool,
    covered: bool,
}

fn grid_point(i: usize) -> Point3 {
    // Offsets keep every point clear of voxel boundaries.
    Point3::new(i as f32 + 0.1, (i % 13) as f32 + 0.1, (i % 7) as f32 + 0.1)
}

fn track(oracle: &mut Vec<Tracked>, points: &[Point3]) {
    oracle.extend(points.iter().map(|&point| Tracked {
        point,
        live: true,
        downsampled: false,
        covered: false,
    }));
}

fn track_delete(oracle: &mut [Tracked], bbox: &BoundingBox3D, downsample: bool) -> usize {
    let mut removed = 0;
    for t in oracle.iter_mut().filter(|t| t.live && bbox.contains(&t.point)) {
        t.live = false;
        t.downsampled = downsample;
        removed += 1;
    }
    removed
}

fn track_revive(oracle: &mut [Tracked], bbox: &BoundingBox3D) {
    for t in oracle.iter_mut().filter(|t| !t.downsampled && bbox.contains(&t.point)) {
        t.live = true;
    }
}

fn coords<'a>(points: impl IntoIterator<Item = &'a Point3>) -> Vec<(f32, f32, f32)> {
    let mut coords: Vec<_> = points.into_iter().map(|p| (p.x, p.y, p.z)).collect();
    coords.sort_by(|a, b| a.0.total_cmp(&b.0));
    coords
}

#[test]
fn test_box_and_voxel_edits_during_rebuild_are_kept() {
    init_logging();
    let tree = eager_tree();
    let voxel_size = tree.config().voxel_size;
    let mut oracle: Vec<Tracked> = Vec::new();

    let base: Vec<Point3> = (0..400).map(grid_point).collect();
    tree.build(&base).unwrap();
    track(&mut oracle, &base);

    let mut overlapped = 0;
    for round in 0..6 {
        let start = 400 + round * 500;
        let lo = start as f32;
        // Appending past the maximum unbalances the right spine, which hands
        // a large subtree to the worker.
        let chunk: Vec<Point3> = (start..start + 500).map(grid_point).collect();
        tree.add_points(&chunk, false).unwrap();
        track(&mut oracle, &chunk);
        overlapped += usize::from(tree.is_rebuilding());

        let hole = BoundingBox3D::new(lo + 100.0, -1.0, -1.0, lo + 200.0, 20.0, 20.0);
        assert_eq!(tree.delete_boxes(&[hole]), track_delete(&mut oracle, &hole, false));

        for victim in [chunk[50], chunk[300]] {
            tree.delete_points_downsampled(&[victim]);
            let voxel = VoxelKey::of(&victim, voxel_size).bounds(voxel_size);
            assert_eq!(track_delete(&mut oracle, &voxel, true), 1);
        }

        let revive = [
            BoundingBox3D::new(lo + 120.0, -1.0, -1.0, lo + 180.0, 20.0, 20.0),
            BoundingBox3D::new(lo + 40.0, -1.0, -1.0, lo + 60.0, 20.0, 20.0),
        ];
        tree.add_boxes(&revive);
        for bbox in &revive {
            track_revive(&mut oracle, bbox);
        }

        assert_eq!(tree.set_covered_points(&[chunk[10], chunk[50]]), 1);
        if let Some(t) = oracle.iter_mut().find(|t| same_point(&t.point, &chunk[10])) {
            t.covered = true;
        }
    }
    log::info!("{} of 6 rounds started while a rebuild was pending", overlapped);

    assert!(wait_until(Duration::from_secs(10), || !tree.is_rebuilding()));
    let stats = tree.rebuild_stats();
    assert!(stats.passes >= 1);
    assert_eq!(stats.aborted, 0);
    tree.verify_invariants().unwrap();

    // A rebuild between a delete and its revive purges the point for good;
    // purged points are exactly the ones handed back here.
    let purged = tree.acquire_removed_points();
    let survives = |t: &&Tracked| t.live && !purged.iter().any(|r| same_point(r, &t.point));

    let live: Vec<&Point3> = oracle.iter().filter(survives).map(|t| &t.point).collect();
    assert_eq!(tree.valid_count(), live.len());
    let everything = BoundingBox3D::new(-1.0, -1.0, -1.0, 1e4, 20.0, 20.0);
    assert_eq!(coords(&tree.box_search(&everything)), coords(live));

    let covered = oracle
        .iter()
        .filter(survives)
        .filter(|t| t.covered)
        .map(|t| &t.point);
    assert_eq!(coords(&tree.covered_points(true)), coords(covered));
}

#[test]
fn test_drop_stops_worker() {
    init_logging();
    let tree = eager_tree();
    let points: Vec<Point3> = (0..1000).map(|i| Point3::new(i as f32, 0.0, 0.0)).collect();
    tree.add_points(&points[..1], false).unwrap();
    tree.add_points(&points[1..], false).unwrap();

    let start = Instant::now();
    drop(tree);
    assert!(start.elapsed() < Duration::from_secs(10));
}
