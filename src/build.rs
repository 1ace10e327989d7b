//! Balanced construction and the rebuild criterion.

use crate::config::TreeConfig;
use crate::node::{Link, Node, NodeIds};
use crate::types::{Axis, BoundingBox3D, KdPoint};

/// Build a balanced subtree over `points`, reordering them in place.
///
/// Each level splits on the axis with the largest spread and places the
/// median, found by selection rather than sorting, at the node.
pub(crate) fn build<P: KdPoint>(points: &mut [P], ids: &NodeIds) -> Link<P> {
    if points.is_empty() {
        return Link::Empty;
    }

    let mut bounds = BoundingBox3D::empty();
    for p in points.iter() {
        bounds.include(p);
    }
    let axis = longest_axis(&bounds);

    let mid = (points.len() - 1) / 2;
    points.select_nth_unstable_by(mid, |a, b| a.coord(axis).total_cmp(&b.coord(axis)));

    let (lower, rest) = points.split_at_mut(mid);
    let (median, upper) = rest.split_at_mut(1);

    let mut node = Node::leaf(ids.next(), median[0], axis);
    node.left = build(lower, ids);
    node.right = build(upper, ids);
    node.refresh();
    Link::from_node(node)
}

fn longest_axis(bounds: &BoundingBox3D) -> Axis {
    let mut best = Axis::X;
    for axis in [Axis::Y, Axis::Z] {
        if bounds.span(axis) > bounds.span(best) {
            best = axis;
        }
    }
    best
}

/// Whether `node` has drifted far enough from balance, or accumulated enough
/// deleted nodes, to be worth rebuilding.
pub(crate) fn needs_rebuild<P: KdPoint>(node: &Node<P>, config: &TreeConfig) -> bool {
    if node.size <= config.min_unbalanced_size {
        return false;
    }
    let invalid = node.state.lock().invalid;
    let delete_ratio = invalid as f32 / node.size as f32;
    if delete_ratio > config.delete_ratio_threshold {
        return true;
    }
    let balance = node.left.size() as f32 / (node.size - 1) as f32;
    balance > config.balance_ratio_threshold || balance < 1.0 - config.balance_ratio_threshold
}
