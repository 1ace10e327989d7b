//! The `IkdTree` handle and its public API.

use std::fmt;
use std::mem;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex, RwLock};
use rustc_hash::FxHashSet;

use crate::build::build;
use crate::config::TreeConfig;
use crate::error::{IkdError, Result, try_reserve};
use crate::mutate::Mutator;
use crate::node::{Link, NodeIds};
use crate::oplog::OperationLog;
use crate::query;
use crate::rebuild::{Designation, RebuildStats, spawn_worker};
use crate::types::{BoundingBox3D, KdPoint, Point3, VoxelKey, same_point};

/// State guarded by the tree lock.
pub(crate) struct TreeCore<P> {
    pub root: Link<P>,
    pub config: TreeConfig,
    /// `(balance, delete)` ratios of the root.
    pub ratios: (f32, f32),
}

impl<P: KdPoint> TreeCore<P> {
    pub(crate) fn refresh_ratios(&mut self) {
        let ratios = self.root.visit(None, |node| {
            if node.size <= 3 {
                return None;
            }
            let invalid = node.state.lock().invalid;
            let heavier = node.left.size().max(node.right.size());
            Some((
                heavier as f32 / (node.size - 1) as f32,
                invalid as f32 / node.size as f32,
            ))
        });
        if let Some(ratios) = ratios {
            self.ratios = ratios;
        }
    }
}

/// Everything shared between caller threads and the rebuild worker.
///
/// Lock order, outermost first: `target`, `flatten`, `tree`, a detached
/// subtree's cell, node state, then the log, buffers and stats.
pub(crate) struct Shared<P> {
    /// Held exclusively by the worker from detach until the detached subtree
    /// is flattened, and shared by every mutation. A mutation that would wait
    /// on the flatten waits here, before it takes `tree`, so queries keep
    /// running.
    pub flatten: RwLock<()>,
    pub tree: RwLock<TreeCore<P>>,
    pub target: Mutex<Option<Designation>>,
    pub wake: Condvar,
    pub oplog: OperationLog<P>,
    pub removed_sync: Mutex<Vec<P>>,
    pub removed_background: Mutex<Vec<P>>,
    pub ids: NodeIds,
    pub shutdown: AtomicBool,
    pub stats: Mutex<RebuildStats>,
}

/// An incremental 3-D k-d tree that rebalances itself in the background.
///
/// Deletions are lazy: points are flagged rather than unlinked, and
/// subtrees that become too unbalanced or too full of deleted points are
/// rebuilt. Small subtrees are rebuilt inline by the mutation that notices
/// them; large ones are handed to a worker thread so that neither queries
/// nor other mutations wait on the rebuild.
///
/// All methods take `&self`; share the tree between threads with an `Arc`.
///
/// # Examples
///
/// ```rust
/// use ikdtree::{BoundingBox3D, IkdTree, Point3};
///
/// let tree = IkdTree::new(0.5, 0.6, 0.2)?;
/// tree.build(&[
///     Point3::new(0.0, 0.0, 0.0),
///     Point3::new(1.0, 0.0, 0.0),
///     Point3::new(0.0, 2.0, 0.0),
/// ])?;
///
/// let (points, dist_sq) = tree.k_nearest(&Point3::new(0.9, 0.1, 0.0), 2, f32::INFINITY);
/// assert_eq!(points[0], Point3::new(1.0, 0.0, 0.0));
/// assert!(dist_sq[0] <= dist_sq[1]);
///
/// tree.delete_points(&[Point3::new(1.0, 0.0, 0.0)]);
/// let inside = tree.box_search(&BoundingBox3D::new(-1.0, -1.0, -1.0, 2.0, 1.0, 1.0));
/// assert_eq!(inside, vec![Point3::new(0.0, 0.0, 0.0)]);
/// # Ok::<(), ikdtree::IkdError>(())
/// ```
pub struct IkdTree<P: KdPoint = Point3> {
    pub(crate) shared: Arc<Shared<P>>,
    worker: Option<JoinHandle<()>>,
}

impl<P: KdPoint> IkdTree<P> {
    /// Create an empty tree with the given thresholds and default values
    /// for everything else.
    pub fn new(
        delete_ratio_threshold: f32,
        balance_ratio_threshold: f32,
        voxel_size: f32,
    ) -> Result<Self> {
        Self::with_config(
            TreeConfig::default()
                .with_delete_ratio_threshold(delete_ratio_threshold)
                .with_balance_ratio_threshold(balance_ratio_threshold)
                .with_voxel_size(voxel_size),
        )
    }

    /// Create an empty tree and start its rebuild worker.
    pub fn with_config(config: TreeConfig) -> Result<Self> {
        config.validate().map_err(IkdError::InvalidConfig)?;
        let shared = Arc::new(Shared {
            flatten: RwLock::new(()),
            tree: RwLock::new(TreeCore {
                root: Link::Empty,
                config,
                ratios: (0.0, 0.0),
            }),
            target: Mutex::new(None),
            wake: Condvar::new(),
            oplog: OperationLog::new(),
            removed_sync: Mutex::new(Vec::new()),
            removed_background: Mutex::new(Vec::new()),
            ids: NodeIds::new(),
            shutdown: AtomicBool::new(false),
            stats: Mutex::new(RebuildStats::default()),
        });
        let worker = spawn_worker(Arc::clone(&shared))?;
        log::debug!("Created ikd-tree with {:?}", config);
        Ok(Self {
            shared,
            worker: Some(worker),
        })
    }

    /// Change the thresholds. Takes effect for subsequent operations,
    /// including the next background pass.
    pub fn configure(
        &self,
        delete_ratio_threshold: f32,
        balance_ratio_threshold: f32,
        voxel_size: f32,
    ) -> Result<()> {
        let mut core = self.shared.tree.write();
        let config = core
            .config
            .with_delete_ratio_threshold(delete_ratio_threshold)
            .with_balance_ratio_threshold(balance_ratio_threshold)
            .with_voxel_size(voxel_size);
        config.validate().map_err(IkdError::InvalidConfig)?;
        core.config = config;
        Ok(())
    }

    pub fn config(&self) -> TreeConfig {
        self.shared.tree.read().config
    }

    // ---- Mutation ----

    /// Replace the contents of the tree with a balanced build over `points`.
    ///
    /// Any pending background rebuild is cancelled. Points removed earlier
    /// stay available through [`acquire_removed_points`](Self::acquire_removed_points).
    pub fn build(&self, points: &[P]) -> Result<()> {
        self.replace_contents(points, false)
    }

    /// Like [`build`](Self::build), but also discards the removed-point
    /// buffers.
    pub fn reconstruct(&self, points: &[P]) -> Result<()> {
        self.replace_contents(points, true)
    }

    fn replace_contents(&self, points: &[P], clear_removed: bool) -> Result<()> {
        let mut live = Vec::new();
        try_reserve(&mut live, points.len())?;
        live.extend(finite_points(points));
        let fresh = build(&mut live, &self.shared.ids);

        // Waits for a running pass to finish, and keeps the worker idle.
        let mut target = self.shared.target.lock();
        let mut core = self.shared.tree.write();
        *target = None;
        let old = mem::replace(&mut core.root, fresh);
        self.shared.oplog.clear();
        core.ratios = (0.0, 0.0);
        core.refresh_ratios();
        if clear_removed {
            self.shared.removed_sync.lock().clear();
            self.shared.removed_background.lock().clear();
        }
        drop(core);
        drop(target);
        drop(old);
        log::trace!("Built tree over {} points", live.len());
        Ok(())
    }

    /// Insert `points`, returning how many were stored.
    ///
    /// With `downsample`, each point is snapped to the centroid of its voxel
    /// and skipped when that voxel already holds a live point. Points with
    /// non-finite coordinates are skipped.
    pub fn add_points(&self, points: &[P], downsample: bool) -> Result<usize> {
        let points: Vec<P> = finite_points(points).collect();
        if points.is_empty() {
            return Ok(0);
        }

        {
            let mut core = self.shared.tree.write();
            if core.root.is_empty() {
                let voxel_size = core.config.voxel_size;
                let mut batch = if downsample {
                    voxel_centroids(&points, voxel_size)?
                } else {
                    points
                };
                core.root = build(&mut batch, &self.shared.ids);
                core.refresh_ratios();
                return Ok(batch.len());
            }
        }

        let mut stored = 0;
        for point in points {
            let (inserted, error) = self.mutate(|mutator, core| {
                let voxel_size = core.config.voxel_size;
                let key = downsample.then(|| VoxelKey::try_of(&point, voxel_size)).flatten();
                let point = match key {
                    Some(key) => {
                        if query::any_in_box(&core.root, &key.bounds(voxel_size), &self.shared.oplog) {
                            return false;
                        }
                        let (x, y, z) = key.centroid(voxel_size);
                        point.with_coords(x, y, z)
                    }
                    // Beyond the voxel grid a point is its own voxel.
                    None => point,
                };
                mutator.insert(&mut core.root, point);
                true
            });
            stored += usize::from(inserted);
            if let Some(e) = error {
                return Err(e);
            }
        }
        Ok(stored)
    }

    /// Revive every point inside each box that was not removed by
    /// downsampling.
    pub fn add_boxes(&self, boxes: &[BoundingBox3D]) {
        for bbox in boxes {
            let ((), error) = self.mutate(|mutator, core| mutator.revive_box(&mut core.root, bbox));
            report("add_boxes", error);
        }
    }

    /// Delete one live stored copy of each point, following the split axis.
    pub fn delete_points(&self, points: &[P]) {
        for point in points {
            let (_, error) = self.mutate(|mutator, core| mutator.remove(&mut core.root, *point, false));
            report("delete_points", error);
        }
    }

    /// Like [`delete_points`](Self::delete_points), but searches both
    /// children of every node. Use when equal coordinates may sit on either
    /// side of a split.
    pub fn delete_points_exact(&self, points: &[P]) {
        for point in points {
            let (_, error) = self.mutate(|mutator, core| mutator.remove(&mut core.root, *point, true));
            report("delete_points_exact", error);
        }
    }

    /// Delete every live point inside each half-open box. Returns how many
    /// points went from live to deleted.
    pub fn delete_boxes(&self, boxes: &[BoundingBox3D]) -> usize {
        boxes
            .iter()
            .map(|bbox| {
                let (removed, error) =
                    self.mutate(|mutator, core| mutator.remove_box(&mut core.root, bbox, false));
                report("delete_boxes", error);
                removed
            })
            .sum()
    }

    /// Permanently delete everything in the voxel of each point. Points
    /// removed this way are never revived by [`add_boxes`](Self::add_boxes).
    pub fn delete_points_downsampled(&self, points: &[P]) {
        for point in points {
            let (_, error) = self.mutate(|mutator, core| {
                let voxel_size = core.config.voxel_size;
                let bounds = match VoxelKey::try_of(point, voxel_size) {
                    Some(key) => key.bounds(voxel_size),
                    None => BoundingBox3D::new(
                        point.x(),
                        point.y(),
                        point.z(),
                        point.x().next_up(),
                        point.y().next_up(),
                        point.z().next_up(),
                    ),
                };
                mutator.remove_box(&mut core.root, &bounds, true)
            });
            report("delete_points_downsampled", error);
        }
    }

    /// Tag the first live stored copy of each point as covered. Points
    /// already carrying the tag are skipped. Returns how many were tagged.
    pub fn set_covered_points(&self, points: &[P]) -> usize {
        let mut tagged = 0;
        for point in points.iter().filter(|p| !p.covered()) {
            let (hit, error) = self.mutate(|mutator, core| mutator.cover(&mut core.root, *point));
            report("set_covered_points", error);
            tagged += usize::from(hit);
        }
        tagged
    }

    /// Run one top-level mutation under the tree lock, then refresh the
    /// root ratios.
    fn mutate<R>(
        &self,
        f: impl FnOnce(&mut Mutator<'_, P>, &mut TreeCore<P>) -> R,
    ) -> (R, Option<IkdError>) {
        let _flatten = self.shared.flatten.read();
        let mut core = self.shared.tree.write();
        let mut mutator = Mutator::new(&self.shared, core.config);
        let out = f(&mut mutator, &mut *core);
        core.refresh_ratios();
        (out, mutator.take_error())
    }

    // ---- Queries ----

    /// Up to `k` live points within `max_dist` of `point`, nearest first,
    /// with their squared distances. A negative `max_dist` finds nothing.
    pub fn k_nearest(&self, point: &P, k: usize, max_dist: f32) -> (Vec<P>, Vec<f32>) {
        if max_dist < 0.0 {
            return (Vec::new(), Vec::new());
        }
        let max_dist_sq = if max_dist.is_finite() {
            max_dist * max_dist
        } else {
            f32::INFINITY
        };
        let core = self.shared.tree.read();
        query::nearest(&core.root, point, k, max_dist_sq, &self.shared.oplog)
            .into_iter()
            .map(|c| (c.point, c.dist_sq))
            .unzip()
    }

    /// Live points inside the half-open box `[min, max)`.
    pub fn box_search(&self, bbox: &BoundingBox3D) -> Vec<P> {
        let mut out = Vec::new();
        let core = self.shared.tree.read();
        query::box_search(&core.root, bbox, &mut out, &self.shared.oplog);
        out
    }

    /// Live points within `radius` of `center`.
    pub fn radius_search(&self, center: &P, radius: f32) -> Vec<P> {
        let mut out = Vec::new();
        let core = self.shared.tree.read();
        query::radius_search(&core.root, center, radius, &mut out, &self.shared.oplog);
        out
    }

    /// Whether any live point lies within `radius` of `center`.
    pub fn collision_check(&self, center: &P, radius: f32) -> bool {
        let core = self.shared.tree.read();
        query::collides(&core.root, center, radius, &self.shared.oplog)
    }

    /// Whether the segment `p1..p2`, sampled at voxel spacing, passes within
    /// `radius` of a live point. A segment that is not finite never collides.
    pub fn collision_line_check(&self, p1: &P, p2: &P, radius: f32) -> bool {
        self.line_collides(None, p1, p2, radius)
    }

    /// Like [`collision_line_check`](Self::collision_line_check), but a
    /// colliding endpoint at `origin` does not count.
    pub fn collision_line_check_except_origin(
        &self,
        origin: &P,
        p1: &P,
        p2: &P,
        radius: f32,
    ) -> bool {
        self.line_collides(Some(origin), p1, p2, radius)
    }

    fn line_collides(&self, origin: Option<&P>, p1: &P, p2: &P, radius: f32) -> bool {
        let (dx, dy, dz) = (p2.x() - p1.x(), p2.y() - p1.y(), p2.z() - p1.z());
        let length = (dx * dx + dy * dy + dz * dz).sqrt();
        if !p1.is_finite() || !p2.is_finite() || !length.is_finite() {
            return false;
        }
        let core = self.shared.tree.read();
        let log = &self.shared.oplog;
        let hits = |p: &P| query::collides(&core.root, p, radius, log);
        let excused = |p: &P| origin.is_some_and(|o| same_point(o, p));

        if (hits(p1) && !excused(p1)) || (hits(p2) && !excused(p2)) {
            return true;
        }
        let steps = (length / core.config.voxel_size).ceil() as usize;
        (1..steps).any(|i| {
            let t = i as f32 / steps as f32;
            hits(&p1.with_coords(p1.x() + dx * t, p1.y() + dy * t, p1.z() + dz * t))
        })
    }

    /// Walk from `origin` along `direction` in voxel-sized steps and return
    /// the first sample within `radius` of a live point, or the point at
    /// `max_dist` when nothing is hit.
    ///
    /// Fails with [`IkdError::NonFiniteRay`] unless `origin` and `max_dist`
    /// are finite.
    pub fn ray_cast(
        &self,
        origin: &P,
        direction: [f32; 3],
        radius: f32,
        max_dist: f32,
    ) -> Result<P> {
        if !origin.is_finite() || !max_dist.is_finite() {
            return Err(IkdError::NonFiniteRay);
        }
        let [dx, dy, dz] = direction;
        let norm = (dx * dx + dy * dy + dz * dz).sqrt();
        if norm == 0.0 || !norm.is_finite() {
            return Err(IkdError::ZeroDirection);
        }
        let (dx, dy, dz) = (dx / norm, dy / norm, dz / norm);
        let at = |t: f32| origin.with_coords(origin.x() + dx * t, origin.y() + dy * t, origin.z() + dz * t);

        let core = self.shared.tree.read();
        let voxel_size = core.config.voxel_size;
        let steps = (max_dist / voxel_size).ceil().max(0.0) as usize;
        for i in 0..steps {
            let sample = at(i as f32 * voxel_size);
            if query::collides(&core.root, &sample, radius, &self.shared.oplog) {
                return Ok(sample);
            }
        }
        Ok(at(max_dist))
    }

    /// Live points whose covered tag equals `covered`.
    pub fn covered_points(&self, covered: bool) -> Vec<P> {
        let mut out = Vec::new();
        let core = self.shared.tree.read();
        query::covered_points(&core.root, covered, &mut out, &self.shared.oplog);
        out
    }

    // ---- Introspection ----

    /// Stored nodes, deleted ones included until a rebuild purges them.
    pub fn size(&self) -> usize {
        self.shared.tree.read().root.try_summary().size
    }

    /// Live points.
    pub fn valid_count(&self) -> usize {
        let summary = self.shared.tree.read().root.try_summary();
        summary.size - summary.invalid
    }

    /// Box around the live points, or around every stored point once all
    /// are deleted. `None` for an empty tree.
    pub fn bounding_box(&self) -> Option<BoundingBox3D> {
        let summary = self.shared.tree.read().root.try_summary();
        (summary.size > 0).then_some(summary.bbox)
    }

    /// `(balance, delete)` ratios of the root, as of the last mutation.
    pub fn balance_and_delete_ratios(&self) -> (f32, f32) {
        self.shared.tree.read().ratios
    }

    /// Drain the points purged by rebuilds since the last call: inline
    /// rebuilds first, then background ones.
    pub fn acquire_removed_points(&self) -> Vec<P> {
        let mut removed = mem::take(&mut *self.shared.removed_sync.lock());
        removed.append(&mut self.shared.removed_background.lock());
        removed
    }

    pub fn rebuild_stats(&self) -> RebuildStats {
        *self.shared.stats.lock()
    }

    /// Whether a subtree is waiting for, or going through, a background
    /// rebuild.
    pub fn is_rebuilding(&self) -> bool {
        match self.shared.target.try_lock() {
            Some(target) => target.is_some(),
            // Only the worker holds the slot for longer than a moment.
            None => true,
        }
    }

    /// Check the structural invariants of every node.
    pub fn verify_invariants(&self) -> Result<()> {
        let _flatten = self.shared.flatten.read();
        let core = self.shared.tree.write();
        core.root.verify(&self.shared.oplog).map(|_| ())
    }
}

impl<P: KdPoint> fmt::Debug for IkdTree<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IkdTree")
            .field("size", &self.size())
            .field("valid_count", &self.valid_count())
            .field("config", &self.config())
            .finish()
    }
}

impl<P: KdPoint> Drop for IkdTree<P> {
    fn drop(&mut self) {
        {
            let _target = self.shared.target.lock();
            self.shared.shutdown.store(true, Ordering::Release);
            self.shared.wake.notify_all();
        }
        if let Some(worker) = self.worker.take()
            && worker.join().is_err()
        {
            log::error!("Rebuild worker panicked");
        }
    }
}

/// Mutation errors have no caller to return to once a batch carries on.
fn report(operation: &str, error: Option<IkdError>) {
    if let Some(e) = error {
        log::error!("{} left a subtree unbalanced: {}", operation, e);
    }
}

fn finite_points<P: KdPoint>(points: &[P]) -> impl Iterator<Item = P> + '_ {
    points.iter().copied().filter(|p| {
        let finite = p.is_finite();
        if !finite {
            log::warn!("Skipping point with non-finite coordinates");
        }
        finite
    })
}

/// One centroid per occupied voxel, in first-seen order.
fn voxel_centroids<P: KdPoint>(points: &[P], voxel_size: f32) -> Result<Vec<P>> {
    let mut seen = FxHashSet::default();
    let mut centroids = Vec::new();
    try_reserve(&mut centroids, points.len())?;
    for point in points {
        let key = VoxelKey::of(point, voxel_size);
        if seen.insert(key) {
            let (x, y, z) = key.centroid(voxel_size);
            centroids.push(point.with_coords(x, y, z));
        }
    }
    Ok(centroids)
}
