use ikdtree::prelude::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rstar::RTree;

fn random_cloud(rng: &mut StdRng, n: usize, extent: f32) -> Vec<Point3> {
    (0..n)
        .map(|_| {
            Point3::new(
                rng.random_range(-extent..extent),
                rng.random_range(-extent..extent),
                rng.random_range(-extent..extent),
            )
        })
        .collect()
}

fn dist_sq(a: &Point3, b: &Point3) -> f32 {
    ikdtree::distance_sq(a, b)
}

fn sorted(mut points: Vec<Point3>) -> Vec<Point3> {
    points.sort_by(|a, b| {
        a.x.total_cmp(&b.x)
            .then(a.y.total_cmp(&b.y))
            .then(a.z.total_cmp(&b.z))
    });
    points
}

fn brute_box(points: &[Point3], bbox: &BoundingBox3D) -> Vec<Point3> {
    sorted(points.iter().copied().filter(|p| bbox.contains(p)).collect())
}

#[test]
fn test_live_count_follows_oracle() {
    let mut rng = StdRng::seed_from_u64(11);
    let tree: IkdTree = IkdTree::new(0.5, 0.6, 0.2).unwrap();
    let mut oracle: Vec<Point3> = Vec::new();

    for round in 0..40 {
        let batch = random_cloud(&mut rng, 50, 50.0);
        let stored = tree.add_points(&batch, false).unwrap();
        assert_eq!(stored, batch.len());
        oracle.extend(batch);

        let deletions = rng.random_range(0..30.min(oracle.len()));
        let mut doomed = Vec::new();
        for _ in 0..deletions {
            let idx = rng.random_range(0..oracle.len());
            doomed.push(oracle.swap_remove(idx));
        }
        tree.delete_points(&doomed);

        assert_eq!(tree.valid_count(), oracle.len(), "round {}", round);
        assert!(tree.size() >= tree.valid_count());
    }
    tree.verify_invariants().unwrap();
}

#[test]
fn test_knn_over_everything_is_a_full_sort() {
    let mut rng = StdRng::seed_from_u64(3);
    let points = random_cloud(&mut rng, 300, 10.0);
    let tree: IkdTree = IkdTree::new(0.5, 0.6, 0.2).unwrap();
    tree.add_points(&points, false).unwrap();

    let target = Point3::new(0.5, -1.0, 2.0);
    let (found, dists) = tree.k_nearest(&target, points.len(), f32::INFINITY);
    assert_eq!(found.len(), points.len());
    assert_eq!(sorted(found.clone()), sorted(points.clone()));

    let mut expected: Vec<f32> = points.iter().map(|p| dist_sq(p, &target)).collect();
    expected.sort_by(f32::total_cmp);
    assert_eq!(dists, expected);
    for (p, d) in found.iter().zip(&dists) {
        assert_eq!(dist_sq(p, &target), *d);
    }
}

#[test]
fn test_knn_matches_rstar() {
    let mut rng = StdRng::seed_from_u64(5);
    let points = random_cloud(&mut rng, 2000, 20.0);
    let tree: IkdTree = IkdTree::new(0.5, 0.6, 0.2).unwrap();
    tree.build(&points[..1000]).unwrap();
    tree.add_points(&points[1000..], false).unwrap();

    let oracle = RTree::bulk_load(points.iter().map(|p| [p.x, p.y, p.z]).collect::<Vec<_>>());
    for query in random_cloud(&mut rng, 50, 25.0) {
        let (_, dists) = tree.k_nearest(&query, 8, f32::INFINITY);
        let expected: Vec<f32> = oracle
            .nearest_neighbor_iter(&[query.x, query.y, query.z])
            .take(8)
            .map(|p| dist_sq(&Point3::new(p[0], p[1], p[2]), &query))
            .collect();
        assert_eq!(dists, expected);
    }
}

#[test]
fn test_knn_respects_max_distance() {
    let tree: IkdTree = IkdTree::new(0.5, 0.6, 0.2).unwrap();
    let points: Vec<Point3> = (0..10).map(|i| Point3::new(i as f32, 0.0, 0.0)).collect();
    tree.build(&points).unwrap();

    let (found, _) = tree.k_nearest(&Point3::new(0.0, 0.0, 0.0), 10, 2.5);
    assert_eq!(found.len(), 3);
    let (found, _) = tree.k_nearest(&Point3::new(0.0, 0.0, 0.0), 0, f32::INFINITY);
    assert!(found.is_empty());
}

#[test]
fn test_deleting_twice_is_idempotent() {
    let mut rng = StdRng::seed_from_u64(17);
    let points = random_cloud(&mut rng, 100, 5.0);
    let tree: IkdTree = IkdTree::new(0.5, 0.6, 0.2).unwrap();
    tree.build(&points).unwrap();

    tree.delete_points(&points[..1]);
    let after_first = tree.valid_count();
    assert_eq!(after_first, 99);
    tree.delete_points(&points[..1]);
    assert_eq!(tree.valid_count(), after_first);

    tree.delete_points_exact(&points[1..2]);
    tree.delete_points_exact(&points[1..2]);
    assert_eq!(tree.valid_count(), 98);
}

#[test]
fn test_box_search_matches_brute_force() {
    let mut rng = StdRng::seed_from_u64(23);
    let points = random_cloud(&mut rng, 1500, 10.0);
    let tree: IkdTree = IkdTree::new(0.5, 0.6, 0.2).unwrap();
    tree.add_points(&points, false).unwrap();

    let mut live = points.clone();
    let doomed: Vec<Point3> = live.drain(..300).collect();
    tree.delete_points(&doomed);

    for _ in 0..30 {
        let a = random_cloud(&mut rng, 1, 10.0)[0];
        let b = random_cloud(&mut rng, 1, 10.0)[0];
        let bbox = BoundingBox3D::new(
            a.x.min(b.x),
            a.y.min(b.y),
            a.z.min(b.z),
            a.x.max(b.x),
            a.y.max(b.y),
            a.z.max(b.z),
        );
        assert_eq!(sorted(tree.box_search(&bbox)), brute_box(&live, &bbox));
    }
}

#[test]
fn test_box_search_is_half_open() {
    let tree: IkdTree = IkdTree::new(0.5, 0.6, 0.2).unwrap();
    tree.build(&[Point3::new(0.0, 0.0, 0.0), Point3::new(1.0, 1.0, 1.0)])
        .unwrap();
    let bbox = BoundingBox3D::new(0.0, 0.0, 0.0, 1.0, 1.0, 1.0);
    assert_eq!(tree.box_search(&bbox), vec![Point3::new(0.0, 0.0, 0.0)]);
}

#[test]
fn test_radius_search_matches_brute_force() {
    let mut rng = StdRng::seed_from_u64(29);
    let points = random_cloud(&mut rng, 800, 10.0);
    let tree: IkdTree = IkdTree::new(0.5, 0.6, 0.2).unwrap();
    tree.build(&points).unwrap();

    for center in random_cloud(&mut rng, 20, 10.0) {
        let radius = rng.random_range(0.5..4.0f32);
        let expected: Vec<Point3> = points
            .iter()
            .copied()
            .filter(|p| dist_sq(p, &center) <= radius * radius)
            .collect();
        assert_eq!(sorted(tree.radius_search(&center, radius)), sorted(expected.clone()));
        assert_eq!(tree.collision_check(&center, radius), !expected.is_empty());
    }
}

#[test]
fn test_rebuild_is_transparent() {
    let mut rng = StdRng::seed_from_u64(31);
    let points = random_cloud(&mut rng, 1000, 10.0);
    let tree: IkdTree = IkdTree::new(0.5, 0.6, 0.2).unwrap();
    tree.build(&points).unwrap();

    let (doomed, live) = points.split_at(700);
    tree.delete_points(doomed);
    assert_eq!(tree.valid_count(), 300);
    // The delete ratio was crossed, so deleted nodes have been purged.
    assert!(tree.size() < 1000);
    let removed = tree.acquire_removed_points();
    assert!(!removed.is_empty());
    tree.verify_invariants().unwrap();

    let reference: IkdTree = IkdTree::new(0.5, 0.6, 0.2).unwrap();
    reference.build(live).unwrap();
    for query in random_cloud(&mut rng, 20, 12.0) {
        assert_eq!(
            tree.k_nearest(&query, 5, f32::INFINITY).1,
            reference.k_nearest(&query, 5, f32::INFINITY).1
        );
        let bbox = BoundingBox3D::around(&query, 3.0);
        assert_eq!(sorted(tree.box_search(&bbox)), sorted(reference.box_search(&bbox)));
    }
}

#[test]
fn test_downsampling_stores_one_centroid_per_voxel() {
    let tree: IkdTree = IkdTree::new(0.5, 0.6, 0.5).unwrap();
    let stored = tree
        .add_points(&[Point3::new(0.1, 0.1, 0.1), Point3::new(0.3, 0.4, 0.2)], true)
        .unwrap();
    assert_eq!(stored, 1);
    assert_eq!(tree.size(), 1);
    let (found, _) = tree.k_nearest(&Point3::new(0.0, 0.0, 0.0), 5, f32::INFINITY);
    assert_eq!(found, vec![Point3::new(0.25, 0.25, 0.25)]);

    let stored = tree
        .add_points(&[Point3::new(0.2, 0.2, 0.2), Point3::new(1.2, 0.2, 0.2)], true)
        .unwrap();
    assert_eq!(stored, 1);
    assert_eq!(tree.valid_count(), 2);
}

#[test]
fn test_box_delete_then_revive_round() {
    let mut rng = StdRng::seed_from_u64(37);
    let points = random_cloud(&mut rng, 400, 10.0);
    // Never rebuild on deletes, so nothing is purged before the revive.
    let tree: IkdTree = IkdTree::new(1.0, 0.6, 0.2).unwrap();
    tree.build(&points).unwrap();

    let hole = BoundingBox3D::new(-2.0, -2.0, -2.0, 2.0, 2.0, 2.0);
    let inside = brute_box(&points, &hole).len();
    assert_eq!(tree.delete_boxes(&[hole]), inside);
    assert!(tree.box_search(&hole).is_empty());
    assert_eq!(tree.valid_count(), points.len() - inside);
    tree.verify_invariants().unwrap();

    // Reviving half of the hole brings back exactly those points.
    let half = BoundingBox3D::new(-2.0, -2.0, -2.0, 0.0, 2.0, 2.0);
    tree.add_boxes(&[half]);
    assert_eq!(sorted(tree.box_search(&hole)), brute_box(&points, &half));
    let revived = brute_box(&points, &half).len();
    assert_eq!(tree.valid_count(), points.len() - inside + revived);
    tree.verify_invariants().unwrap();

    tree.add_boxes(&[hole]);
    assert_eq!(sorted(tree.box_search(&hole)), brute_box(&points, &hole));
    assert_eq!(tree.valid_count(), points.len());
}
