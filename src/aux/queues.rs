use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use cozy_chess::Move;

use crate::tree::Node;

/// Nomination queue cap: MCTS can nominate far faster than helpers
/// consume, and dropping is safer than unbounded growth.
pub const NODE_QUEUE_CAP: usize = 15_000;
/// Grafting queue cap: the tree-extension stage stalls when this backs up.
pub const PV_QUEUE_CAP: usize = 20_000;
/// Helper PVs shorter than this are too unreliable to graft.
pub const MIN_PV_LEN: usize = 4;
/// Hard cap on accepted PV length.
pub const MAX_PV_LEN: usize = 99;

/// A helper-produced line waiting to be grafted: the moves from the
/// search root (the root-to-target prefix followed by the helper's PV),
/// the tree depth the PV starts at, and the helper's reported node count.
#[derive(Clone, Debug)]
pub struct PvRecord {
    pub moves: Vec<Move>,
    pub start_depth: u32,
    pub support: u64,
}

/// Nomination entry: the node to analyse plus the root that was current
/// when it was queued. The purger compares the witness against the new
/// root to detect staleness without walking the tree.
pub(crate) type QueueEntry = (Arc<Node>, Arc<Node>);

/// Node queue plus the per-move counters that share its lock.
pub(crate) struct NodeQueueInner {
    pub entries: VecDeque<QueueEntry>,
    pub final_purge_run: bool,
    /// Dynamic per-query budget; re-read from options at each new game.
    pub movetime_ms: u64,
    /// Dynamic nomination threshold, forced to 0 in the one-instance
    /// root-infinite configuration where nothing consumes the queue.
    pub threshold: u32,
    pub enqueue_calls: u64,
    pub size_at_selection: usize,
    pub size_after_purge: usize,
    pub nodes_added_by_helper: u64,
    pub helper_evals: u64,
    pub total_eval_ms: u64,
}

impl NodeQueueInner {
    pub fn new(movetime_ms: u64, threshold: u32) -> Self {
        Self {
            entries: VecDeque::new(),
            final_purge_run: false,
            movetime_ms,
            threshold,
            enqueue_calls: 0,
            size_at_selection: 0,
            size_after_purge: 0,
            nodes_added_by_helper: 0,
            helper_evals: 0,
            total_eval_ms: 0,
        }
    }

    pub fn reset_move_counters(&mut self) {
        self.enqueue_calls = 0;
        self.size_at_selection = 0;
        self.size_after_purge = 0;
        self.nodes_added_by_helper = 0;
        self.helper_evals = 0;
        self.total_eval_ms = 0;
    }
}

/// Dedup set keyed by the serialized packed-move form of a helper PV, so
/// the same line computed by different helpers (or at different times
/// within a move) is grafted only once. Cleared between moves.
pub(crate) struct PvCache {
    set: Mutex<HashSet<String>>,
}

impl PvCache {
    pub fn new() -> Self { Self { set: Mutex::new(HashSet::new()) } }

    /// Returns true iff `key` was already present.
    pub fn seen_or_insert(&self, key: &str) -> bool {
        let mut set = self.set.lock().unwrap();
        !set.insert(key.to_string())
    }

    pub fn clear(&self) { self.set.lock().unwrap().clear(); }

    pub fn len(&self) -> usize { self.set.lock().unwrap().len() }
}

pub(crate) fn pv_cache_key(packed: &[u16]) -> String {
    packed.iter().map(|m| m.to_string()).collect::<Vec<_>>().join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_dedups_within_a_move() {
        let cache = PvCache::new();
        let key = pv_cache_key(&[132, 1836, 262]);
        assert!(!cache.seen_or_insert(&key));
        assert!(cache.seen_or_insert(&key));
        assert_eq!(cache.len(), 1);
        cache.clear();
        assert!(!cache.seen_or_insert(&key), "cache must forget between moves");
    }

    #[test]
    fn cache_key_is_positional() {
        assert_eq!(pv_cache_key(&[1, 2, 3]), "1,2,3");
        assert_ne!(pv_cache_key(&[12, 3]), pv_cache_key(&[1, 23]));
    }
}
