use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::Result;
use cozy_chess::Move;
use log::{debug, error, info};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::board::PositionHistory;
use crate::tree::{self, AuxState, Node};

use super::options::AuxOptions;
use super::pool::HelperPool;
use super::query::run_query;
use super::queues::{NodeQueueInner, PvCache, PvRecord, QueueEntry, NODE_QUEUE_CAP};

/// Worker-thread bookkeeping: how many workers are still alive, and
/// whether worker 0 finished the start-of-move purge.
pub(crate) struct LiveStats {
    pub workers: usize,
    pub initial_purge_run: bool,
}

/// Root and played history of the search the workers are serving.
pub(crate) struct SearchContext {
    pub root: Arc<Node>,
    pub history: PositionHistory,
}

/// State shared between the MCTS side and the helper workers. Lock order:
/// node queue, then PV queue, then helper io, then PV cache; the live
/// stats mutex is independent. No two of these are ever held together.
pub(crate) struct Shared {
    pub opts: AuxOptions,
    pub stop: AtomicBool,
    pub new_game: AtomicBool,
    pub queue: Mutex<NodeQueueInner>,
    pub queue_cv: Condvar,
    pub pvs: Mutex<VecDeque<PvRecord>>,
    pub cache: PvCache,
    pub pool: HelperPool,
    pub live: Mutex<LiveStats>,
    pub search: RwLock<Option<SearchContext>>,
}

impl Shared {
    pub fn new(opts: AuxOptions) -> Self {
        let instances = opts.instances.max(1);
        let queue = NodeQueueInner::new(opts.movetime_ms, opts.threshold);
        Self {
            opts,
            stop: AtomicBool::new(false),
            new_game: AtomicBool::new(true),
            queue: Mutex::new(queue),
            queue_cv: Condvar::new(),
            pvs: Mutex::new(VecDeque::new()),
            cache: PvCache::new(),
            pool: HelperPool::new(instances),
            live: Mutex::new(LiveStats { workers: 0, initial_purge_run: false }),
            search: RwLock::new(None),
        }
    }

    pub fn current_root(&self) -> Option<Arc<Node>> {
        self.search.read().unwrap().as_ref().map(|ctx| ctx.root.clone())
    }
}

/// Drives N helper engines against the search tree: spawns one worker per
/// helper, feeds them nominated nodes, collects their PVs for grafting,
/// and prunes both queues between moves.
pub struct Coordinator {
    shared: Arc<Shared>,
    handles: Vec<JoinHandle<()>>,
}

impl Coordinator {
    pub fn new(opts: AuxOptions) -> Self {
        Self { shared: Arc::new(Shared::new(opts)), handles: Vec::new() }
    }

    pub fn options(&self) -> &AuxOptions { &self.shared.opts }

    /// Dynamic nomination threshold for the MCTS backup stage.
    pub fn nomination_threshold(&self) -> u32 { self.shared.queue.lock().unwrap().threshold }

    pub fn queue_len(&self) -> usize { self.shared.queue.lock().unwrap().entries.len() }

    pub fn pv_queue_len(&self) -> usize { self.shared.pvs.lock().unwrap().len() }

    /// Mark the next search as the first of a new game: queues are wiped
    /// instead of purged and the dynamic knobs are re-read from options.
    pub fn set_new_game(&self) { self.shared.new_game.store(true, Ordering::Release); }

    /// Launch the helper workers for one search. No-op when no helper
    /// executable is configured.
    pub fn start(&mut self, root: Arc<Node>, history: PositionHistory) {
        if !self.shared.opts.enabled() {
            return;
        }
        self.shared.stop.store(false, Ordering::Release);
        {
            let mut q = self.shared.queue.lock().unwrap();
            q.final_purge_run = false;
        }
        *self.shared.search.write().unwrap() = Some(SearchContext { root, history });
        let instances = self.shared.opts.instances.max(1);
        for index in 0..instances {
            self.shared.live.lock().unwrap().workers += 1;
            let shared = self.shared.clone();
            self.handles.push(std::thread::spawn(move || worker_main(shared, index)));
        }
    }

    /// Nomination gate, called from MCTS backup. Marks the node PENDING
    /// and queues it with the current root as witness; silently drops the
    /// nomination (clearing the tag) when the queue is capped, and does
    /// nothing once the final purge has run.
    pub fn maybe_enqueue(&self, node: &Arc<Node>) {
        if self.shared.stop.load(Ordering::Acquire) {
            return;
        }
        let Some(root) = self.shared.current_root() else { return };
        let mut q = self.shared.queue.lock().unwrap();
        q.enqueue_calls += 1;
        if q.final_purge_run {
            return;
        }
        node.set_aux_state(AuxState::Pending);
        if q.entries.len() < NODE_QUEUE_CAP {
            q.entries.push_back((node.clone(), root));
            self.shared.queue_cv.notify_one();
        } else {
            node.set_aux_state(AuxState::Unset);
        }
    }

    /// Raise the stop flag, cancel every computing helper, and wake any
    /// worker waiting on the queue. Safe to call more than once.
    pub fn signal_stop(&self) {
        self.shared.stop.store(true, Ordering::Release);
        self.shared.pool.stop_all();
        self.shared.queue_cv.notify_all();
    }

    /// Join the workers and close out the move: end-of-move purge against
    /// the played move (or a full wipe when there is none), per-move
    /// statistics, cache clear, counter reset.
    pub fn wait(&mut self, played: Option<Move>) {
        if !self.shared.opts.enabled() {
            return;
        }
        self.signal_stop();
        {
            let mut q = self.shared.queue.lock().unwrap();
            q.final_purge_run = true;
            q.size_at_selection = q.entries.len();
        }
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }

        match played {
            Some(mv) => purge_after_move(&self.shared, mv),
            None => {
                let mut q = self.shared.queue.lock().unwrap();
                for (node, _) in q.entries.drain(..) {
                    node.set_aux_state(AuxState::Unset);
                }
                drop(q);
                self.shared.pvs.lock().unwrap().clear();
            }
        }

        self.publish_move_stats();
        self.shared.cache.clear();
        {
            let mut q = self.shared.queue.lock().unwrap();
            q.reset_move_counters();
        }
        self.shared.live.lock().unwrap().initial_purge_run = false;
        *self.shared.search.write().unwrap() = None;
    }

    fn publish_move_stats(&self) {
        if self.shared.opts.verbosity < 3 {
            return;
        }
        let cache_size = self.shared.cache.len();
        let pv_backlog = self.shared.pvs.lock().unwrap().len();
        let q = self.shared.queue.lock().unwrap();
        let avg_ms = if q.helper_evals > 0 { q.total_eval_ms as f64 / q.helper_evals as f64 } else { 0.0 };
        info!(
            "aux summary: queue_at_selection={} queue_after_purge={} evals={} avg_ms={:.1} \
             nodes_added={} pv_cache={} pv_backlog={} nominations={} threshold={}",
            q.size_at_selection,
            q.size_after_purge,
            q.helper_evals,
            avg_ms,
            q.nodes_added_by_helper,
            cache_size,
            pv_backlog,
            q.enqueue_calls,
            q.threshold,
        );
    }

    /// Next PV awaiting grafting, in per-helper emission order.
    pub fn pop_pv(&self) -> Option<PvRecord> { self.shared.pvs.lock().unwrap().pop_front() }

    pub fn drain_pvs(&self) -> Vec<PvRecord> {
        self.shared.pvs.lock().unwrap().drain(..).collect()
    }

    /// Grafting feedback for the per-move summary.
    pub fn note_nodes_added(&self, n: u64) {
        self.shared.queue.lock().unwrap().nodes_added_by_helper += n;
    }

    /// Terminate the subsystem: stop and join workers, then close helper
    /// pipes and reap the children.
    pub fn shutdown(&mut self) {
        if !self.shared.opts.enabled() {
            return;
        }
        self.signal_stop();
        self.wait(None);
        self.shared.pool.shutdown();
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        if !self.handles.is_empty() {
            self.signal_stop();
            for handle in self.handles.drain(..) {
                let _ = handle.join();
            }
        }
        self.shared.pool.shutdown();
    }
}

fn worker_main(shared: Arc<Shared>, index: usize) {
    if let Err(e) = worker_loop(&shared, index) {
        // A dead or unusable helper aborts the whole search; losing one
        // oracle silently would skew the tree instead.
        error!("aux worker {} aborting search: {:#}", index, e);
        shared.stop.store(true, Ordering::Release);
        shared.pool.stop_all();
        shared.queue_cv.notify_all();
    }
    let mut live = shared.live.lock().unwrap();
    live.workers -= 1;
    if live.workers == 0 {
        debug!("all aux workers idle");
    }
}

fn worker_loop(shared: &Shared, index: usize) -> Result<()> {
    shared.pool.start_helper(index, &shared.opts)?;

    if index == 0 {
        begin_move_bookkeeping(shared);
    } else {
        // Hold off until worker 0 finished purging, or stale entries
        // would race with fresh nominations.
        loop {
            if shared.stop.load(Ordering::Acquire) {
                return Ok(());
            }
            if shared.live.lock().unwrap().initial_purge_run {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    let root_infinite = index == 0 && shared.opts.root_infinite();
    let mut root_is_queued = false;
    let mut rng = SmallRng::seed_from_u64(0x5eed_0000 + index as u64);

    while !shared.stop.load(Ordering::Acquire) {
        let Some(root) = shared.current_root() else {
            std::thread::sleep(Duration::from_millis(5));
            continue;
        };

        if root_infinite {
            // Worker 0 keeps one endless query running on the root and
            // never consumes from the nomination queue.
            if root.num_edges() > 0 {
                {
                    let _q = shared.queue.lock().unwrap();
                    root.set_aux_state(AuxState::Pending);
                }
                checked_query(shared, index, &root, true)?;
            } else {
                std::thread::sleep(Duration::from_millis(100));
            }
            continue;
        }

        if index == 0 && !root_is_queued {
            // No on-root options: give the queue a root query to start
            // from instead of waiting for the first nomination.
            if root.num_edges() > 0 {
                let mut q = shared.queue.lock().unwrap();
                if !q.final_purge_run && q.entries.len() < NODE_QUEUE_CAP {
                    root.set_aux_state(AuxState::Pending);
                    q.entries.push_back((root.clone(), root.clone()));
                    shared.queue_cv.notify_one();
                }
                root_is_queued = true;
            } else {
                std::thread::sleep(Duration::from_millis(100));
                continue;
            }
        }

        let entry = {
            let mut q = shared.queue.lock().unwrap();
            while !shared.stop.load(Ordering::Acquire) && q.entries.is_empty() {
                q = shared.queue_cv.wait(q).unwrap();
            }
            if shared.stop.load(Ordering::Acquire) {
                return Ok(());
            }
            q.entries.pop_front()
        };
        let Some((target, witness)) = entry else { continue };

        // Bias helper effort toward shallow nodes: deep nodes go back to
        // the queue with probability 1 - 1/depth, without ever starving.
        let depth = match tree::depth_from(&target, &root) {
            None => {
                let _q = shared.queue.lock().unwrap();
                target.set_aux_state(AuxState::Unset);
                continue;
            }
            Some(d) => d,
        };
        if depth > shared.opts.max_depth {
            let mut q = shared.queue.lock().unwrap();
            if !q.entries.is_empty() {
                let sample: f64 = rng.gen();
                if 1.0 / (depth as f64) < sample {
                    q.entries.push_back((target, witness));
                    shared.queue_cv.notify_one();
                    continue;
                }
            }
        }

        checked_query(shared, index, &target, false)?;
    }
    Ok(())
}

// A fatal query error aborts the search; make sure the node in flight is
// renominatable first so the tag never sticks at pending.
fn checked_query(shared: &Shared, index: usize, target: &Arc<Node>, infinite: bool) -> Result<()> {
    match run_query(shared, index, target, infinite) {
        Ok(_) => Ok(()),
        Err(e) => {
            let _q = shared.queue.lock().unwrap();
            target.set_aux_state(AuxState::Unset);
            Err(e)
        }
    }
}

/// Per-move re-initialisation done by worker 0 before anyone consumes:
/// refresh the dynamic knobs, wipe (new game) or purge (new move) both
/// queues, then release the other workers.
fn begin_move_bookkeeping(shared: &Shared) {
    if shared.new_game.swap(false, Ordering::AcqRel) {
        let mut q = shared.queue.lock().unwrap();
        q.movetime_ms = shared.opts.movetime_ms;
        // With a single root-infinite instance nothing ever consumes the
        // queue, so switch nominations off at the source.
        q.threshold = if shared.opts.instances == 1 && shared.opts.root_infinite() {
            0
        } else {
            shared.opts.threshold
        };
        q.reset_move_counters();
        for (node, _) in q.entries.drain(..) {
            node.set_aux_state(AuxState::Unset);
        }
        drop(q);
        shared.pvs.lock().unwrap().clear();
        shared.cache.clear();
    } else {
        purge_start_of_move(shared);
    }
    shared.live.lock().unwrap().initial_purge_run = true;
    if shared.opts.verbosity >= 5 {
        debug!("worker 0 finished start-of-move bookkeeping");
    }
}

/// Start-of-move purge: drop queued nodes whose witness is no longer the
/// root, and rewrite queued PVs past the move that led to the new root.
pub(crate) fn purge_start_of_move(shared: &Shared) {
    let Some(root) = shared.current_root() else { return };

    {
        let mut q = shared.queue.lock().unwrap();
        let before = q.entries.len();
        let mut kept: VecDeque<QueueEntry> = VecDeque::with_capacity(before);
        while let Some((node, witness)) = q.entries.pop_front() {
            if Node::is_same(&witness, &root) {
                kept.push_back((node, witness));
            } else {
                node.set_aux_state(AuxState::Unset);
            }
        }
        q.entries = kept;
        q.size_after_purge = q.entries.len();
        if shared.opts.verbosity >= 4 && before > 0 {
            debug!("purged {} stale nominations, {} remain", before - q.entries.len(), q.entries.len());
        }
    }

    let root_move = root.edge_move();
    let mut pvs = shared.pvs.lock().unwrap();
    match root_move {
        None => {
            // Fresh root with no incoming edge: nothing queued can match.
            if !pvs.is_empty() {
                debug!("root has no incoming edge, clearing {} queued PVs", pvs.len());
                pvs.clear();
            }
        }
        Some(mv) => {
            let before = pvs.len();
            let mut kept = VecDeque::with_capacity(before);
            while let Some(mut pv) = pvs.pop_front() {
                if pv.moves.len() > 1 && pv.moves[0] == mv {
                    pv.moves.remove(0);
                    kept.push_back(pv);
                }
            }
            *pvs = kept;
            if shared.opts.verbosity >= 4 && before > 0 {
                debug!("purged {} stale PVs, {} remain", before - pvs.len(), pvs.len());
            }
        }
    }
}

/// End-of-move purge, run after the engine commits `played`: keep only
/// nodes that can still matter, re-witnessed by the grandchild of the old
/// root that becomes the next root if the opponent cooperates, and PVs
/// that start with the played move.
pub(crate) fn purge_after_move(shared: &Shared, played: Move) {
    let Some(root) = shared.current_root() else { return };

    {
        let mut q = shared.queue.lock().unwrap();
        let before = q.entries.len();
        let mut kept: VecDeque<QueueEntry> = VecDeque::new();
        while let Some((node, _old_witness)) = q.entries.pop_front() {
            match rewitness(&node, &root, played) {
                Some(witness) => kept.push_back((node, witness)),
                None => node.set_aux_state(AuxState::Unset),
            }
        }
        q.entries = kept;
        q.size_after_purge = q.entries.len();
        if shared.opts.verbosity >= 4 {
            debug!(
                "kept {} of {} nominations after playing {}",
                q.entries.len(),
                before,
                played
            );
        }
    }

    let mut pvs = shared.pvs.lock().unwrap();
    let before = pvs.len();
    let mut kept = VecDeque::with_capacity(before);
    while let Some(mut pv) = pvs.pop_front() {
        if pv.moves.len() > 1 && pv.moves[0] == played {
            pv.moves.remove(0);
            kept.push_back(pv);
        }
    }
    *pvs = kept;
    if shared.opts.verbosity >= 4 && before > 0 {
        debug!("kept {} of {} PVs after playing {}", pvs.len(), before, played);
    }
}

// Walk up from `node` to the child-of-root level. The node survives only
// if its path passes through the played move; the returned witness is the
// grandchild of the old root on that path, which is the root candidate
// for the next search.
fn rewitness(node: &Arc<Node>, root: &Arc<Node>, played: Move) -> Option<Arc<Node>> {
    let mut cur = node.clone();
    loop {
        let parent = cur.parent()?;
        let grand = parent.parent()?;
        if Node::is_same(&grand, root) {
            return if parent.edge_move() == Some(played) { Some(cur) } else { None };
        }
        cur = parent;
    }
}
