//! Node storage with lazy deletion.
//!
//! Each node owns its two subtrees through a [`Link`]. Deletion flags are
//! set on the highest node whose whole subtree is affected and only pushed
//! into the children when a traversal next passes through (see
//! [`Node::push_down`]).
//!
//! Structural fields (`size`, `extent`, the links) change only under
//! exclusive access to the tree, or to a detached subtree. The flags and
//! counters live in a per-node mutex because concurrent readers push deletion
//! state down while they traverse.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};

use crate::error::{IkdError, Result};
use crate::oplog::{Operation, OperationLog};
use crate::types::{Axis, BoundingBox3D, KdPoint};

/// Stable identity of a node, used to recognise a rebuild target after the
/// tree around it has changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct NodeId(u64);

impl NodeId {
    pub(crate) fn get(self) -> u64 {
        self.0
    }
}

pub(crate) struct NodeIds(AtomicU64);

impl NodeIds {
    pub(crate) fn new() -> Self {
        Self(AtomicU64::new(1))
    }

    pub(crate) fn next(&self) -> NodeId {
        NodeId(self.0.fetch_add(1, Ordering::Relaxed))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Side {
    Left,
    Right,
}

/// Deletion state a parent hands to a child during push-down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct Inherited {
    pub tree_deleted: bool,
    pub downsample_deleted: bool,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct NodeState {
    pub point_deleted: bool,
    pub tree_deleted: bool,
    pub point_downsample_deleted: bool,
    pub tree_downsample_deleted: bool,
    pub push_left: bool,
    pub push_right: bool,
    pub invalid: usize,
    pub downsample_invalid: usize,
    /// Covers the live points, or every point once the subtree is fully deleted.
    pub bbox: BoundingBox3D,
    pub radius_sq: f32,
}

impl NodeState {
    fn fresh(bbox: BoundingBox3D) -> Self {
        Self {
            point_deleted: false,
            tree_deleted: false,
            point_downsample_deleted: false,
            tree_downsample_deleted: false,
            push_left: false,
            push_right: false,
            invalid: 0,
            downsample_invalid: 0,
            bbox,
            radius_sq: bbox.half_diagonal_sq(),
        }
    }

    pub(crate) fn set_bbox(&mut self, bbox: BoundingBox3D) {
        self.bbox = bbox;
        self.radius_sq = bbox.half_diagonal_sq();
    }

    pub(crate) fn inherited(&self) -> Inherited {
        Inherited {
            tree_deleted: self.tree_deleted,
            downsample_deleted: self.tree_downsample_deleted,
        }
    }
}

/// Aggregate view of a subtree, as read by its parent.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Summary {
    pub size: usize,
    pub invalid: usize,
    pub downsample_invalid: usize,
    pub tree_deleted: bool,
    pub tree_downsample_deleted: bool,
    pub bbox: BoundingBox3D,
    pub extent: BoundingBox3D,
}

impl Summary {
    /// An absent child: nothing live, so vacuously fully deleted.
    pub(crate) const EMPTY: Summary = Summary {
        size: 0,
        invalid: 0,
        downsample_invalid: 0,
        tree_deleted: true,
        tree_downsample_deleted: true,
        bbox: BoundingBox3D::empty(),
        extent: BoundingBox3D::empty(),
    };
}

pub(crate) struct Node<P> {
    pub id: NodeId,
    pub point: P,
    pub axis: Axis,
    pub left: Link<P>,
    pub right: Link<P>,
    /// Nodes in this subtree, deleted ones included.
    pub size: usize,
    /// Bounds of every point in this subtree, deleted ones included.
    pub extent: BoundingBox3D,
    pub state: Mutex<NodeState>,
}

/// A subtree handed to the background worker.
///
/// The lock doubles as the admission gate: readers take it shared, while
/// the worker (flattening) and mutators (applying a direct change) take it
/// exclusively.
pub(crate) struct Detached<P> {
    pub id: NodeId,
    pub snapshot: Summary,
    pub cell: Arc<RwLock<Link<P>>>,
}

pub(crate) enum Link<P> {
    Empty,
    Node(Box<Node<P>>),
    Detached(Detached<P>),
}

impl<P: KdPoint> Node<P> {
    pub(crate) fn leaf(id: NodeId, point: P, axis: Axis) -> Self {
        let bounds = BoundingBox3D::from_point(&point);
        Self {
            id,
            point,
            axis,
            left: Link::Empty,
            right: Link::Empty,
            size: 1,
            extent: bounds,
            state: Mutex::new(NodeState::fresh(bounds)),
        }
    }

    pub(crate) fn child(&self, side: Side) -> &Link<P> {
        match side {
            Side::Left => &self.left,
            Side::Right => &self.right,
        }
    }

    pub(crate) fn child_mut(&mut self, side: Side) -> &mut Link<P> {
        match side {
            Side::Left => &mut self.left,
            Side::Right => &mut self.right,
        }
    }

    pub(crate) fn summary(&self) -> Summary {
        let st = self.state.lock();
        Summary {
            size: self.size,
            invalid: st.invalid,
            downsample_invalid: st.downsample_invalid,
            tree_deleted: st.tree_deleted,
            tree_downsample_deleted: st.tree_downsample_deleted,
            bbox: st.bbox,
            extent: self.extent,
        }
    }

    /// Propagate pending deletion state into the children.
    ///
    /// Must run before any traversal reads or changes the children. A push
    /// into a detached child is also logged, so the rebuilt copy receives it.
    pub(crate) fn push_down(&self, log: &OperationLog<P>) {
        let mut st = self.state.lock();
        if !(st.push_left || st.push_right) {
            return;
        }
        let inherited = st.inherited();
        if st.push_left {
            self.left.inherit(inherited, log);
            st.push_left = false;
        }
        if st.push_right {
            self.right.inherit(inherited, log);
            st.push_right = false;
        }
    }

    fn inherit(&self, from: Inherited) {
        let mut st = self.state.lock();
        st.tree_downsample_deleted |= from.downsample_deleted;
        st.point_downsample_deleted |= from.downsample_deleted;
        st.tree_deleted = from.tree_deleted || st.tree_downsample_deleted;
        st.point_deleted = st.tree_deleted || st.point_downsample_deleted;
        if from.downsample_deleted {
            st.downsample_invalid = self.size;
        }
        st.invalid = if st.tree_deleted {
            self.size
        } else {
            st.downsample_invalid
        };
        st.push_left = true;
        st.push_right = true;
        // Revival is only pushed into subtrees without partial downsample
        // deletion, so the subtree is either entirely live or entirely dead.
        st.set_bbox(self.extent);
    }

    /// Recompute size, counters, flags and boxes from the children.
    pub(crate) fn refresh(&mut self) {
        let left = self.left.summary();
        let right = self.right.summary();
        let point_bounds = BoundingBox3D::from_point(&self.point);

        self.size = 1 + left.size + right.size;
        self.extent = left.extent.union(&right.extent).union(&point_bounds);

        let st = self.state.get_mut();
        st.invalid = usize::from(st.point_deleted) + left.invalid + right.invalid;
        st.downsample_invalid = usize::from(st.point_downsample_deleted)
            + left.downsample_invalid
            + right.downsample_invalid;
        st.tree_deleted = st.point_deleted && left.tree_deleted && right.tree_deleted;
        st.tree_downsample_deleted = st.point_downsample_deleted
            && left.tree_downsample_deleted
            && right.tree_downsample_deleted;

        let bbox = if st.tree_deleted {
            self.extent
        } else {
            let mut live = BoundingBox3D::empty();
            if !left.tree_deleted {
                live = live.union(&left.bbox);
            }
            if !right.tree_deleted {
                live = live.union(&right.bbox);
            }
            if !st.point_deleted {
                live = live.union(&point_bounds);
            }
            live
        };
        st.set_bbox(bbox);
    }

    /// Append live points to `live` and, when `removed` is given, points that
    /// were deleted for a reason other than downsampling to `removed`.
    pub(crate) fn collect(
        &self,
        log: &OperationLog<P>,
        live: &mut Vec<P>,
        mut removed: Option<&mut Vec<P>>,
    ) {
        self.push_down(log);
        let (point_deleted, downsample_deleted, tree_deleted) = {
            let st = self.state.lock();
            (
                st.point_deleted,
                st.point_downsample_deleted,
                st.tree_deleted,
            )
        };
        if tree_deleted && removed.is_none() {
            return;
        }
        if !point_deleted {
            live.push(self.point);
        }
        self.left.collect(log, live, removed.as_deref_mut());
        self.right.collect(log, live, removed.as_deref_mut());
        if point_deleted
            && !downsample_deleted
            && let Some(removed) = removed
        {
            removed.push(self.point);
        }
    }
}

impl<P: KdPoint> Link<P> {
    pub(crate) fn from_node(node: Node<P>) -> Self {
        Link::Node(Box::new(node))
    }

    pub(crate) fn is_empty(&self) -> bool {
        matches!(self, Link::Empty)
    }

    /// Run `f` on the node behind this link, taking shared access to a
    /// detached subtree for the duration of the call.
    pub(crate) fn visit<R>(&self, empty: R, f: impl FnOnce(&Node<P>) -> R) -> R {
        match self {
            Link::Empty => empty,
            Link::Node(node) => f(node),
            Link::Detached(detached) => detached.cell.read().visit(empty, f),
        }
    }

    pub(crate) fn summary(&self) -> Summary {
        self.visit(Summary::EMPTY, Node::summary)
    }

    /// Like [`summary`](Self::summary), but falls back to the snapshot taken
    /// at detach time instead of waiting for the worker to release it.
    pub(crate) fn try_summary(&self) -> Summary {
        match self {
            Link::Detached(detached) => match detached.cell.try_read() {
                Some(inner) => inner.summary(),
                None => detached.snapshot,
            },
            other => other.summary(),
        }
    }

    pub(crate) fn size(&self) -> usize {
        match self {
            Link::Empty => 0,
            Link::Node(node) => node.size,
            Link::Detached(_) => self.summary().size,
        }
    }

    /// Apply inherited deletion state to the root of this subtree.
    pub(crate) fn inherit(&self, from: Inherited, log: &OperationLog<P>) {
        match self {
            Link::Empty => {}
            Link::Node(node) => node.inherit(from),
            Link::Detached(detached) => {
                if let Link::Node(node) = &*detached.cell.read() {
                    node.inherit(from);
                }
                log.push(Operation::PushDown(from));
            }
        }
    }

    pub(crate) fn collect(
        &self,
        log: &OperationLog<P>,
        live: &mut Vec<P>,
        removed: Option<&mut Vec<P>>,
    ) {
        self.visit((), |node| node.collect(log, live, removed));
    }

    /// Check the aggregate invariants of every node, pushing pending state
    /// down as it goes.
    pub(crate) fn verify(&self, log: &OperationLog<P>) -> Result<Summary> {
        self.visit(Ok(Summary::EMPTY), |node| node.verify(log))
    }
}

impl<P: KdPoint> Node<P> {
    fn verify(&self, log: &OperationLog<P>) -> Result<Summary> {
        self.push_down(log);
        let left = self.left.verify(log)?;
        let right = self.right.verify(log)?;
        let st = *self.state.lock();
        let fail = |what: &str| {
            Err(IkdError::Invariant(format!(
                "node {}: {}",
                self.id.get(),
                what
            )))
        };

        if self.size != 1 + left.size + right.size {
            return fail("size does not match children");
        }
        if st.invalid != usize::from(st.point_deleted) + left.invalid + right.invalid {
            return fail("invalid count does not match children");
        }
        if st.downsample_invalid
            != usize::from(st.point_downsample_deleted)
                + left.downsample_invalid
                + right.downsample_invalid
        {
            return fail("downsample count does not match children");
        }
        if st.tree_deleted != (st.invalid == self.size) {
            return fail("subtree deletion flag disagrees with invalid count");
        }
        if st.point_downsample_deleted && !st.point_deleted {
            return fail("downsample-deleted point is still live");
        }

        let point_bounds = BoundingBox3D::from_point(&self.point);
        if self.extent != left.extent.union(&right.extent).union(&point_bounds) {
            return fail("extent does not match its points");
        }
        let live = if st.tree_deleted {
            self.extent
        } else {
            let mut live = BoundingBox3D::empty();
            for child in [&left, &right] {
                if !child.tree_deleted {
                    live = live.union(&child.bbox);
                }
            }
            if !st.point_deleted {
                live = live.union(&point_bounds);
            }
            live
        };
        if st.bbox != live {
            return fail("bounding box does not match live points");
        }

        Ok(Summary {
            size: self.size,
            invalid: st.invalid,
            downsample_invalid: st.downsample_invalid,
            tree_deleted: st.tree_deleted,
            tree_downsample_deleted: st.tree_downsample_deleted,
            bbox: st.bbox,
            extent: self.extent,
        })
    }
}
