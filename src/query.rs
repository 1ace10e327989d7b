//! Read-only traversals: nearest neighbours, box and radius ranges,
//! collision tests and covered-point listing.
//!
//! All of them run under shared access to the tree. Entering a subtree that
//! is being rebuilt waits on its admission lock, so a query never observes a
//! subtree while the worker is flattening it.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::node::{Link, Node, NodeState};
use crate::oplog::OperationLog;
use crate::types::{BoundingBox3D, KdPoint, distance_sq};

/// A k-nearest candidate, ordered by distance so the heap top is the worst.
pub(crate) struct Candidate<P> {
    pub dist_sq: f32,
    pub point: P,
}

impl<P> PartialEq for Candidate<P> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<P> Eq for Candidate<P> {}

impl<P> PartialOrd for Candidate<P> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<P> Ord for Candidate<P> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.dist_sq.total_cmp(&other.dist_sq)
    }
}

fn state_of<P: KdPoint>(node: &Node<P>) -> NodeState {
    *node.state.lock()
}

/// Squared lower bound on the distance from `target` to any live point under
/// `link`, or `None` when nothing there is live.
fn lower_bound<P: KdPoint>(link: &Link<P>, target: &P) -> Option<f32> {
    let summary = link.summary();
    (!summary.tree_deleted).then(|| summary.bbox.distance_sq_to(target))
}

/// Up to `k` live points within `max_dist_sq` of `target`, nearest first.
pub(crate) fn nearest<P: KdPoint>(
    root: &Link<P>,
    target: &P,
    k: usize,
    max_dist_sq: f32,
    log: &OperationLog<P>,
) -> Vec<Candidate<P>> {
    if k == 0 {
        return Vec::new();
    }
    let mut heap = BinaryHeap::with_capacity(k + 1);
    nearest_in(root, target, k, max_dist_sq, &mut heap, log);
    heap.into_sorted_vec()
}

fn nearest_in<P: KdPoint>(
    link: &Link<P>,
    target: &P,
    k: usize,
    max_dist_sq: f32,
    heap: &mut BinaryHeap<Candidate<P>>,
    log: &OperationLog<P>,
) {
    link.visit((), |node| {
        node.push_down(log);
        let st = state_of(node);
        if st.tree_deleted {
            return;
        }
        let bound = st.bbox.distance_sq_to(target);
        if bound > max_dist_sq || beaten(heap, k, bound) {
            return;
        }

        if !st.point_deleted {
            let dist_sq = distance_sq(&node.point, target);
            if dist_sq <= max_dist_sq && !beaten(heap, k, dist_sq) {
                if heap.len() >= k {
                    heap.pop();
                }
                heap.push(Candidate {
                    dist_sq,
                    point: node.point,
                });
            }
        }

        let left = lower_bound(&node.left, target);
        let right = lower_bound(&node.right, target);
        let (first, first_bound, second, second_bound) = match (left, right) {
            (Some(l), Some(r)) if r < l => (&node.right, right, &node.left, left),
            _ => (&node.left, left, &node.right, right),
        };
        for (child, bound) in [(first, first_bound), (second, second_bound)] {
            if let Some(bound) = bound
                && bound <= max_dist_sq
                && !beaten(heap, k, bound)
            {
                nearest_in(child, target, k, max_dist_sq, heap, log);
            }
        }
    });
}

/// Whether a candidate at `dist_sq` cannot enter a full heap.
fn beaten<P>(heap: &BinaryHeap<Candidate<P>>, k: usize, dist_sq: f32) -> bool {
    heap.len() >= k && heap.peek().is_some_and(|worst| dist_sq >= worst.dist_sq)
}

/// Live points inside the half-open box.
pub(crate) fn box_search<P: KdPoint>(
    link: &Link<P>,
    bbox: &BoundingBox3D,
    out: &mut Vec<P>,
    log: &OperationLog<P>,
) {
    link.visit((), |node| {
        node.push_down(log);
        let st = state_of(node);
        if st.tree_deleted || bbox.excludes(&st.bbox) {
            return;
        }
        if bbox.covers(&st.bbox) {
            node.collect(log, out, None);
            return;
        }
        if !st.point_deleted && bbox.contains(&node.point) {
            out.push(node.point);
        }
        box_search(&node.left, bbox, out, log);
        box_search(&node.right, bbox, out, log);
    });
}

/// Whether any live point lies inside the half-open box.
pub(crate) fn any_in_box<P: KdPoint>(
    link: &Link<P>,
    bbox: &BoundingBox3D,
    log: &OperationLog<P>,
) -> bool {
    link.visit(false, |node| {
        node.push_down(log);
        let st = state_of(node);
        if st.tree_deleted || bbox.excludes(&st.bbox) {
            return false;
        }
        if bbox.covers(&st.bbox) {
            return true;
        }
        (!st.point_deleted && bbox.contains(&node.point))
            || any_in_box(&node.left, bbox, log)
            || any_in_box(&node.right, bbox, log)
    })
}

/// How a ball around a query point relates to a node's bounding box,
/// judged from the box center and half-diagonal.
enum Reach {
    Outside,
    Inside,
    Partial,
}

fn reach<P: KdPoint>(st: &NodeState, center: &P, radius: f32) -> Reach {
    let (cx, cy, cz) = st.bbox.center();
    let (dx, dy, dz) = (cx - center.x(), cy - center.y(), cz - center.z());
    let dist = (dx * dx + dy * dy + dz * dz).sqrt();
    let half = st.radius_sq.sqrt();
    if dist > radius + half {
        Reach::Outside
    } else if dist <= radius - half {
        Reach::Inside
    } else {
        Reach::Partial
    }
}

/// Live points within `radius` of `center`.
pub(crate) fn radius_search<P: KdPoint>(
    link: &Link<P>,
    center: &P,
    radius: f32,
    out: &mut Vec<P>,
    log: &OperationLog<P>,
) {
    link.visit((), |node| {
        node.push_down(log);
        let st = state_of(node);
        if st.tree_deleted {
            return;
        }
        match reach(&st, center, radius) {
            Reach::Outside => return,
            Reach::Inside => {
                node.collect(log, out, None);
                return;
            }
            Reach::Partial => {}
        }
        if !st.point_deleted && distance_sq(&node.point, center) <= radius * radius {
            out.push(node.point);
        }
        radius_search(&node.left, center, radius, out, log);
        radius_search(&node.right, center, radius, out, log);
    });
}

/// Whether any live point lies within `radius` of `center`.
pub(crate) fn collides<P: KdPoint>(
    link: &Link<P>,
    center: &P,
    radius: f32,
    log: &OperationLog<P>,
) -> bool {
    link.visit(false, |node| {
        node.push_down(log);
        let st = state_of(node);
        if st.tree_deleted {
            return false;
        }
        match reach(&st, center, radius) {
            Reach::Outside => false,
            Reach::Inside => true,
            Reach::Partial => {
                (!st.point_deleted && distance_sq(&node.point, center) <= radius * radius)
                    || collides(&node.left, center, radius, log)
                    || collides(&node.right, center, radius, log)
            }
        }
    })
}

/// Live points whose covered tag equals `covered`.
pub(crate) fn covered_points<P: KdPoint>(
    link: &Link<P>,
    covered: bool,
    out: &mut Vec<P>,
    log: &OperationLog<P>,
) {
    link.visit((), |node| {
        node.push_down(log);
        let st = state_of(node);
        if st.tree_deleted {
            return;
        }
        if !st.point_deleted && node.point.covered() == covered {
            out.push(node.point);
        }
        covered_points(&node.left, covered, out, log);
        covered_points(&node.right, covered, out, log);
    });
}
