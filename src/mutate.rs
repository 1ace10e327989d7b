//! Mutation traversals.
//!
//! Every mutation has the same shape: push pending deletion state down,
//! apply the change at this node, recurse into the children it may affect,
//! then refresh the aggregates and check whether the node should be rebuilt.
//!
//! Each child is entered through [`Mutator::route`], which decides how the
//! change reaches it:
//!
//! * a detached child (under background rebuild) is changed under its
//!   exclusive lock, with rebuilding disabled, and the change is appended to
//!   the operation log so the worker can replay it;
//! * the designated target (waiting for the worker) is changed with
//!   rebuilding disabled;
//! * anything else is changed directly.

use std::sync::Arc;

use smallvec::SmallVec;

use crate::build::{build, needs_rebuild};
use crate::config::TreeConfig;
use crate::error::{IkdError, try_reserve};
use crate::node::{Link, Node, NodeId, Side};
use crate::oplog::Operation;
use crate::rebuild::Designation;
use crate::tree::Shared;
use crate::types::{Axis, BoundingBox3D, KdPoint, POINT_EPSILON, same_point};

pub(crate) type Path = SmallVec<[Side; 32]>;

enum Route<P> {
    Direct,
    Designated,
    Detached(Arc<parking_lot::RwLock<Link<P>>>),
}

pub(crate) struct Mutator<'a, P: KdPoint> {
    shared: &'a Shared<P>,
    config: TreeConfig,
    designated: Option<NodeId>,
    path: Path,
    error: Option<IkdError>,
}

impl<'a, P: KdPoint> Mutator<'a, P> {
    /// A mutator for caller-issued operations. The designated target is read
    /// without blocking; if the worker holds it, the target is recognised
    /// structurally once it is detached.
    pub(crate) fn new(shared: &'a Shared<P>, config: TreeConfig) -> Self {
        let designated = shared
            .target
            .try_lock()
            .and_then(|target| target.as_ref().map(|d| d.id));
        Self {
            shared,
            config,
            designated,
            path: Path::new(),
            error: None,
        }
    }

    /// A mutator for replaying logged operations into a rebuilt subtree.
    pub(crate) fn replay(shared: &'a Shared<P>, config: TreeConfig) -> Self {
        Self {
            shared,
            config,
            designated: None,
            path: Path::new(),
            error: None,
        }
    }

    /// First error raised by a synchronous rebuild, if any.
    pub(crate) fn take_error(&mut self) -> Option<IkdError> {
        self.error.take()
    }

    pub(crate) fn insert(&mut self, root: &mut Link<P>, point: P) {
        self.route(
            root,
            true,
            || Operation::AddPoint(point),
            |m, link, allow| m.add_point(link, point, allow, Axis::Z),
        );
    }

    pub(crate) fn remove(&mut self, root: &mut Link<P>, point: P, exhaustive: bool) -> bool {
        self.route(
            root,
            true,
            || Operation::DeletePoint(point),
            |m, link, allow| m.delete_point(link, &point, allow, exhaustive),
        )
    }

    pub(crate) fn remove_box(
        &mut self,
        root: &mut Link<P>,
        bbox: &BoundingBox3D,
        downsample: bool,
    ) -> usize {
        let bbox = *bbox;
        self.route(
            root,
            true,
            || delete_box_op(bbox, downsample),
            |m, link, allow| m.delete_box(link, &bbox, allow, downsample),
        )
    }

    pub(crate) fn revive_box(&mut self, root: &mut Link<P>, bbox: &BoundingBox3D) {
        let bbox = *bbox;
        self.route(
            root,
            true,
            || Operation::AddBox(bbox),
            |m, link, allow| m.add_box(link, &bbox, allow),
        );
    }

    pub(crate) fn cover(&mut self, root: &mut Link<P>, point: P) -> bool {
        self.route(
            root,
            true,
            || Operation::SetCovered(point),
            |m, link, _| m.set_covered(link, &point),
        )
    }

    /// Apply one logged operation to a subtree that is not yet reachable
    /// from the tree.
    pub(crate) fn apply(&mut self, link: &mut Link<P>, op: Operation<P>) {
        match op {
            Operation::AddPoint(point) => self.add_point(link, point, false, Axis::Z),
            Operation::AddBox(bbox) => self.add_box(link, &bbox, false),
            Operation::DeletePoint(point) => {
                self.delete_point(link, &point, false, true);
            }
            Operation::DeleteBox(bbox) => {
                self.delete_box(link, &bbox, false, false);
            }
            Operation::DownsampleDelete(bbox) => {
                self.delete_box(link, &bbox, false, true);
            }
            Operation::SetCovered(point) => {
                self.set_covered(link, &point);
            }
            Operation::PushDown(inherited) => link.inherit(inherited, &self.shared.oplog),
        }
    }

    fn route<R>(
        &mut self,
        link: &mut Link<P>,
        allow_rebuild: bool,
        logged: impl FnOnce() -> Operation<P>,
        op: impl FnOnce(&mut Self, &mut Link<P>, bool) -> R,
    ) -> R {
        let route = match &*link {
            Link::Detached(detached) => Route::Detached(Arc::clone(&detached.cell)),
            Link::Node(node) if Some(node.id) == self.designated => Route::Designated,
            _ => Route::Direct,
        };
        match route {
            Route::Direct => op(self, link, allow_rebuild),
            Route::Designated => op(self, link, false),
            Route::Detached(cell) => {
                let mut inner = cell.write();
                let out = op(self, &mut *inner, false);
                self.shared.oplog.push(logged());
                out
            }
        }
    }

    fn descend<R>(
        &mut self,
        node: &mut Node<P>,
        side: Side,
        allow_rebuild: bool,
        logged: impl FnOnce() -> Operation<P>,
        op: impl FnOnce(&mut Self, &mut Link<P>, bool) -> R,
    ) -> R {
        self.path.push(side);
        let out = self.route(node.child_mut(side), allow_rebuild, logged, op);
        self.path.pop();
        out
    }

    fn add_point(&mut self, link: &mut Link<P>, point: P, allow: bool, parent_axis: Axis) {
        if link.is_empty() {
            let leaf = Node::leaf(self.shared.ids.next(), point, parent_axis.next());
            *link = Link::from_node(leaf);
            return;
        }
        let Link::Node(node) = link else {
            return;
        };
        node.push_down(&self.shared.oplog);
        let axis = node.axis;
        let side = if point.coord(axis) < node.point.coord(axis) {
            Side::Left
        } else {
            Side::Right
        };
        self.descend(
            node,
            side,
            allow,
            || Operation::AddPoint(point),
            |m, child, allow| m.add_point(child, point, allow, axis),
        );
        self.finish(link, allow);
    }

    /// Delete one live stored copy of `point`. Returns whether one was found.
    ///
    /// The split axis decides which child to search; ties on the split
    /// coordinate search both, since a balanced build may place equal
    /// coordinates on either side. `exhaustive` searches both children always.
    fn delete_point(
        &mut self,
        link: &mut Link<P>,
        point: &P,
        allow: bool,
        exhaustive: bool,
    ) -> bool {
        let Link::Node(node) = link else {
            return false;
        };
        node.push_down(&self.shared.oplog);
        {
            let mut st = node.state.lock();
            if st.tree_deleted {
                return false;
            }
            if !st.point_deleted && same_point(&node.point, point) {
                st.point_deleted = true;
                drop(st);
                node.refresh();
                return true;
            }
        }

        let (wanted, split) = (point.coord(node.axis), node.point.coord(node.axis));
        let point = *point;
        let mut removed = false;
        if exhaustive || wanted <= split {
            removed = self.descend(
                node,
                Side::Left,
                allow,
                || Operation::DeletePoint(point),
                |m, child, allow| m.delete_point(child, &point, allow, exhaustive),
            );
        }
        if !removed && (exhaustive || wanted >= split) {
            removed = self.descend(
                node,
                Side::Right,
                allow,
                || Operation::DeletePoint(point),
                |m, child, allow| m.delete_point(child, &point, allow, exhaustive),
            );
        }
        self.finish(link, allow);
        removed
    }

    /// Delete every live point inside `bbox`, returning how many were live.
    fn delete_box(
        &mut self,
        link: &mut Link<P>,
        bbox: &BoundingBox3D,
        allow: bool,
        downsample: bool,
    ) -> usize {
        let Link::Node(node) = link else {
            return 0;
        };
        node.push_down(&self.shared.oplog);
        let mut removed = 0;
        {
            let mut st = node.state.lock();
            if st.tree_deleted || bbox.excludes(&st.bbox) {
                return 0;
            }
            // A downsample deletion is permanent, so it may only cover the
            // subtree wholesale when every point is inside, deleted ones too.
            let reach = if downsample { node.extent } else { st.bbox };
            if bbox.covers(&reach) {
                removed = node.size - st.invalid;
                st.tree_deleted = true;
                st.point_deleted = true;
                st.invalid = node.size;
                st.push_left = true;
                st.push_right = true;
                if downsample {
                    st.tree_downsample_deleted = true;
                    st.point_downsample_deleted = true;
                    st.downsample_invalid = node.size;
                }
                st.set_bbox(node.extent);
                return removed;
            }
            if !st.point_deleted && bbox.contains(&node.point) {
                st.point_deleted = true;
                st.point_downsample_deleted |= downsample;
                removed += 1;
            }
        }

        let bbox = *bbox;
        for side in [Side::Left, Side::Right] {
            removed += self.descend(
                node,
                side,
                allow,
                || delete_box_op(bbox, downsample),
                |m, child, allow| m.delete_box(child, &bbox, allow, downsample),
            );
        }
        self.finish(link, allow);
        removed
    }

    /// Revive every point inside `bbox` that was not removed by downsampling.
    fn add_box(&mut self, link: &mut Link<P>, bbox: &BoundingBox3D, allow: bool) {
        let Link::Node(node) = link else {
            return;
        };
        node.push_down(&self.shared.oplog);
        {
            let mut st = node.state.lock();
            if bbox.excludes(&node.extent) {
                return;
            }
            // Wholesale revival is exact only if no point, or every point,
            // below was downsampled away; otherwise the live box is rebuilt
            // from the children.
            let uniform = st.downsample_invalid == 0 || st.tree_downsample_deleted;
            if uniform && bbox.covers(&node.extent) {
                st.tree_deleted = st.tree_downsample_deleted;
                st.point_deleted = st.point_downsample_deleted;
                st.invalid = st.downsample_invalid;
                st.push_left = true;
                st.push_right = true;
                st.set_bbox(node.extent);
                return;
            }
            if bbox.contains(&node.point) {
                st.point_deleted = st.point_downsample_deleted;
            }
        }

        let bbox = *bbox;
        for side in [Side::Left, Side::Right] {
            self.descend(
                node,
                side,
                allow,
                || Operation::AddBox(bbox),
                |m, child, allow| m.add_box(child, &bbox, allow),
            );
        }
        self.finish(link, allow);
    }

    /// Tag the first live stored copy of `point` as covered.
    fn set_covered(&mut self, link: &mut Link<P>, point: &P) -> bool {
        let Link::Node(node) = link else {
            return false;
        };
        node.push_down(&self.shared.oplog);
        let st = *node.state.lock();
        if st.tree_deleted || node.extent.expand(POINT_EPSILON).distance_sq_to(point) > 0.0 {
            return false;
        }
        if !st.point_deleted && same_point(&node.point, point) {
            node.point.set_covered(true);
            return true;
        }
        let point = *point;
        for side in [Side::Left, Side::Right] {
            let tagged = self.descend(
                node,
                side,
                false,
                || Operation::SetCovered(point),
                |m, child, _| m.set_covered(child, &point),
            );
            if tagged {
                return true;
            }
        }
        false
    }

    fn finish(&mut self, link: &mut Link<P>, allow: bool) {
        let Link::Node(node) = link else {
            return;
        };
        node.refresh();

        if self.designated == Some(node.id) && node.size < self.config.background_rebuild_size {
            if let Some(mut target) = self.shared.target.try_lock()
                && target.as_ref().is_some_and(|d| d.id == node.id)
            {
                log::debug!(
                    "Cancelled background rebuild of node {}: shrank to {} nodes",
                    node.id.get(),
                    node.size
                );
                *target = None;
            }
            self.designated = None;
        }

        if allow && needs_rebuild(node, &self.config) {
            self.rebuild(link);
        }
    }

    fn rebuild(&mut self, link: &mut Link<P>) {
        let Link::Node(node) = link else {
            return;
        };
        if node.size >= self.config.background_rebuild_size {
            self.designate(node.id, node.size);
            return;
        }

        let size = node.size;
        let mut live = Vec::new();
        if let Err(e) = try_reserve(&mut live, size) {
            log::warn!("Skipping rebuild of {} nodes: {}", size, e);
            self.error.get_or_insert(e);
            return;
        }
        {
            let mut removed = self.shared.removed_sync.lock();
            link.collect(&self.shared.oplog, &mut live, Some(&mut *removed));
        }
        log::trace!("Rebuilt subtree of {} nodes into {} live points", size, live.len());
        *link = build(&mut live, &self.shared.ids);
    }

    /// Hand a subtree to the background worker. A pending target is only
    /// replaced by a larger one; a smaller candidate is dropped and will be
    /// picked up again by the criterion on a later mutation.
    fn designate(&mut self, id: NodeId, size: usize) {
        let Some(mut target) = self.shared.target.try_lock() else {
            return;
        };
        if target.as_ref().is_some_and(|pending| pending.size >= size) {
            return;
        }
        log::debug!("Scheduled background rebuild of node {} ({} nodes)", id.get(), size);
        *target = Some(Designation {
            id,
            path: self.path.clone(),
            size,
        });
        self.designated = Some(id);
        self.shared.wake.notify_one();
    }
}

fn delete_box_op<P>(bbox: BoundingBox3D, downsample: bool) -> Operation<P> {
    if downsample {
        Operation::DownsampleDelete(bbox)
    } else {
        Operation::DeleteBox(bbox)
    }
}
