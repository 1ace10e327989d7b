//! Background rebuild engine.
//!
//! Mutations that find a large unbalanced subtree designate it instead of
//! rebuilding it inline. A dedicated worker thread then, for each designated
//! target:
//!
//! 1. detaches the subtree behind an admission lock, under a short exclusive
//!    hold of the tree;
//! 2. flattens its live points while readers of that subtree wait, and
//!    mutations wait before taking the tree lock;
//! 3. builds the replacement with no lock held;
//! 4. replays every mutation logged against the detached subtree meanwhile;
//! 5. splices the replacement back under a second short exclusive hold,
//!    refreshing the ancestors on the way out.
//!
//! Between steps 1 and 5 the detached subtree stays fully usable: readers
//! see the old nodes, and writers change them directly while also logging
//! the change for step 4.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::Serialize;

use crate::build::build;
use crate::config::TreeConfig;
use crate::error::{IkdError, Result, try_reserve};
use crate::mutate::{Mutator, Path};
use crate::node::{Detached, Link, NodeId, Side};
use crate::oplog::OperationLog;
use crate::tree::Shared;
use crate::types::KdPoint;

/// How long the idle worker sleeps before re-checking for shutdown.
const IDLE_WAIT: Duration = Duration::from_millis(5);

/// Replay yields the CPU after this many operations.
const REPLAY_YIELD_INTERVAL: usize = 10;

/// A subtree waiting for the worker, identified by its root's id and the
/// route to it from the tree root.
#[derive(Debug, Clone)]
pub(crate) struct Designation {
    pub id: NodeId,
    pub path: Path,
    pub size: usize,
}

/// Counters kept by the background rebuild worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RebuildStats {
    /// Completed background passes.
    pub passes: u64,
    /// Passes abandoned because the target went stale or could not be
    /// spliced back.
    pub aborted: u64,
    pub replayed_operations: u64,
    /// Longest the operation log has grown during a pass.
    pub peak_log_len: usize,
    /// Node count of the most recently detached subtree.
    pub last_rebuilt_size: usize,
}

pub(crate) fn spawn_worker<P: KdPoint>(shared: Arc<Shared<P>>) -> Result<JoinHandle<()>> {
    let handle = thread::Builder::new()
        .name("ikd-rebuild".into())
        .spawn(move || run(&shared))?;
    Ok(handle)
}

fn run<P: KdPoint>(shared: &Shared<P>) {
    log::info!("Rebuild worker started");
    loop {
        let mut target = shared.target.lock();
        if shared.shutdown.load(Ordering::Acquire) {
            break;
        }
        match target.clone() {
            Some(designation) => rebuild_pass(shared, &mut target, designation),
            None => {
                shared.wake.wait_for(&mut target, IDLE_WAIT);
            }
        }
    }
    log::info!("Rebuild worker stopped");
}

/// One full rebuild of `designation`. The caller holds the target slot for
/// the whole pass, so no new target can be designated meanwhile.
fn rebuild_pass<P: KdPoint>(
    shared: &Shared<P>,
    slot: &mut Option<Designation>,
    designation: Designation,
) {
    if let Some(pass) = prepare(shared, designation) {
        complete(shared, pass);
    }
    *slot = None;
}

/// A pass whose subtree has been detached and rebuilt, but not yet caught
/// up with the log or spliced back.
struct Pass<P> {
    designation: Designation,
    cell: Arc<RwLock<Link<P>>>,
    fresh: Link<P>,
    config: TreeConfig,
    detached_size: usize,
    rebuilt_size: usize,
    started: Instant,
}

/// Detach, flatten and build. `None` when the pass was abandoned.
fn prepare<P: KdPoint>(shared: &Shared<P>, designation: Designation) -> Option<Pass<P>> {
    let started = Instant::now();
    let id = designation.id;

    // The admission lock is taken before the subtree becomes reachable
    // through it, so nobody can enter before flattening is done.
    let cell = Arc::new(RwLock::new(Link::Empty));
    let mut old = cell.write();
    let mut live = Vec::new();
    let flatten = shared.flatten.write();
    let config = {
        let mut core = shared.tree.write();
        match detach(&mut core.root, &designation, &cell, &mut live) {
            Ok(Some(subtree)) => *old = subtree,
            Ok(None) => {
                log::warn!("Dropping stale background rebuild target {}", id.get());
                shared.stats.lock().aborted += 1;
                return None;
            }
            Err(e) => {
                log::error!("Abandoning background rebuild of node {}: {}", id.get(), e);
                shared.stats.lock().aborted += 1;
                return None;
            }
        }
        let stale = shared.oplog.clear();
        if stale > 0 {
            log::error!("Discarded {} operations logged outside a rebuild pass", stale);
        }
        core.config
    };

    let detached_size = old.size();
    {
        let mut removed = shared.removed_background.lock();
        old.collect(&shared.oplog, &mut live, Some(&mut *removed));
    }
    drop(old);
    drop(flatten);

    let rebuilt_size = live.len();
    let fresh = build(&mut live, &shared.ids);
    Some(Pass {
        designation,
        cell,
        fresh,
        config,
        detached_size,
        rebuilt_size,
        started,
    })
}

/// Replay the log into the rebuilt subtree and splice it back.
fn complete<P: KdPoint>(shared: &Shared<P>, pass: Pass<P>) {
    let Pass {
        designation,
        cell,
        mut fresh,
        config,
        detached_size,
        rebuilt_size,
        started,
    } = pass;
    let id = designation.id;

    let mut mutator = Mutator::replay(shared, config);
    let mut replayed = 0usize;
    while let Some(op) = shared.oplog.pop() {
        mutator.apply(&mut fresh, op);
        replayed += 1;
        if replayed % REPLAY_YIELD_INTERVAL == 0 {
            thread::yield_now();
        }
    }

    let mut core = shared.tree.write();
    // Writers are excluded from here on, so the log can be drained for good
    // once the path down to the splice point has pushed its state.
    let outcome = splice(&mut core.root, &designation.path, id, &cell, &shared.oplog, || {
        while let Some(op) = shared.oplog.pop() {
            mutator.apply(&mut fresh, op);
            replayed += 1;
        }
        fresh
    });
    match outcome {
        Ok(()) => {
            core.refresh_ratios();
            drop(core);
            let mut stats = shared.stats.lock();
            stats.passes += 1;
            stats.replayed_operations += replayed as u64;
            stats.peak_log_len = stats.peak_log_len.max(shared.oplog.take_peak());
            stats.last_rebuilt_size = detached_size;
            log::debug!(
                "Background rebuild of node {} done: {} nodes down to {}, {} operations replayed in {:?}",
                id.get(),
                detached_size,
                rebuilt_size,
                replayed,
                started.elapsed()
            );
        }
        Err(e) => {
            let dropped = shared.oplog.clear();
            drop(core);
            log::error!("{} ({} logged operations dropped)", e, dropped);
            shared.stats.lock().aborted += 1;
        }
    }
    // Last reference to the old nodes, released outside the tree lock.
    drop(cell);
}

/// Swap the designated subtree out of the tree for a detached link sharing
/// `cell`, reserving room in `live` for its points first.
///
/// `Ok(None)` means the designation is stale: the path no longer leads to a
/// node with the designated id.
fn detach<P: KdPoint>(
    root: &mut Link<P>,
    designation: &Designation,
    cell: &Arc<RwLock<Link<P>>>,
    live: &mut Vec<P>,
) -> Result<Option<Link<P>>> {
    let mut link = root;
    for side in &designation.path {
        match link {
            Link::Node(node) => link = node.child_mut(*side),
            _ => return Ok(None),
        }
    }
    let size = match &*link {
        Link::Node(node) if node.id == designation.id => node.size,
        _ => return Ok(None),
    };
    try_reserve(live, size)?;

    let detached = Link::Detached(Detached {
        id: designation.id,
        snapshot: link.summary(),
        cell: Arc::clone(cell),
    });
    Ok(Some(std::mem::replace(link, detached)))
}

/// Replace the detached link at `path` by the subtree `finish` returns,
/// then refresh every ancestor.
///
/// Pending push-downs along the path are applied first, so they reach the
/// detached subtree (and the log) before `finish` drains it.
fn splice<P: KdPoint>(
    link: &mut Link<P>,
    path: &[Side],
    id: NodeId,
    cell: &Arc<RwLock<Link<P>>>,
    log: &OperationLog<P>,
    finish: impl FnOnce() -> Link<P>,
) -> Result<()> {
    let mismatch = || IkdError::SpliceMismatch { expected: id.get() };
    match path.split_first() {
        None => {
            let ours = matches!(&*link, Link::Detached(d) if d.id == id && Arc::ptr_eq(&d.cell, cell));
            if !ours {
                return Err(mismatch());
            }
            *link = finish();
            Ok(())
        }
        Some((side, rest)) => {
            let Link::Node(node) = link else {
                return Err(mismatch());
            };
            node.push_down(log);
            splice(node.child_mut(*side), rest, id, cell, log, finish)?;
            node.refresh();
            Ok(())
        }
    }
}
