use std::sync::atomic::{AtomicU16, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};

use cozy_chess::Move;

// Tag sentinels; chosen above every packed move value.
const TAG_UNSET: u16 = 0;
const TAG_PENDING: u16 = 0xFFFE;
const TAG_DONE: u16 = 0xFFFF;

/// Helper-analysis state of a tree node. `Pending` means the node sits in
/// the nomination queue or is being queried right now; `Done` means a
/// helper query completed for it. Written only under the node-queue lock.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuxState {
    Unset,
    Pending,
    Done,
}

/// The slice of an MCTS tree node that the helper coordination touches:
/// parent link, incoming edge move, child-edge count, and the analysis
/// tag. Parent topology never changes after insertion, so upward walks
/// are lock-free.
pub struct Node {
    parent: Weak<Node>,
    edge_move: Option<Move>,
    children: Mutex<Vec<Arc<Node>>>,
    num_edges: AtomicU32,
    aux_tag: AtomicU16,
}

impl Node {
    pub fn new_root() -> Arc<Node> {
        Arc::new(Node {
            parent: Weak::new(),
            edge_move: None,
            children: Mutex::new(Vec::new()),
            num_edges: AtomicU32::new(0),
            aux_tag: AtomicU16::new(TAG_UNSET),
        })
    }

    /// Insert a child reached by `mv` and bump the edge count.
    pub fn add_child(self: &Arc<Node>, mv: Move) -> Arc<Node> {
        let child = Arc::new(Node {
            parent: Arc::downgrade(self),
            edge_move: Some(mv),
            children: Mutex::new(Vec::new()),
            num_edges: AtomicU32::new(0),
            aux_tag: AtomicU16::new(TAG_UNSET),
        });
        let mut kids = self.children.lock().unwrap();
        kids.push(child.clone());
        self.num_edges.store(kids.len() as u32, Ordering::Release);
        child
    }

    pub fn parent(&self) -> Option<Arc<Node>> { self.parent.upgrade() }

    /// Move on the edge leading into this node; None for the game root.
    pub fn edge_move(&self) -> Option<Move> { self.edge_move }

    pub fn num_edges(&self) -> u32 { self.num_edges.load(Ordering::Acquire) }

    pub fn children(&self) -> Vec<Arc<Node>> { self.children.lock().unwrap().clone() }

    pub fn find_child(&self, mv: Move) -> Option<Arc<Node>> {
        self.children.lock().unwrap().iter().find(|c| c.edge_move == Some(mv)).cloned()
    }

    pub fn aux_state(&self) -> AuxState {
        match self.aux_tag.load(Ordering::Acquire) {
            TAG_PENDING => AuxState::Pending,
            TAG_DONE => AuxState::Done,
            _ => AuxState::Unset,
        }
    }

    pub fn set_aux_state(&self, state: AuxState) {
        let tag = match state {
            AuxState::Unset => TAG_UNSET,
            AuxState::Pending => TAG_PENDING,
            AuxState::Done => TAG_DONE,
        };
        self.aux_tag.store(tag, Ordering::Release);
    }

    pub fn is_same(a: &Arc<Node>, b: &Arc<Node>) -> bool { Arc::ptr_eq(a, b) }
}

/// Plies between `node` and `root`, or None when the walk never reaches
/// `root` (the node left the current subtree).
pub fn depth_from(node: &Arc<Node>, root: &Arc<Node>) -> Option<u32> {
    let mut depth = 0;
    let mut cur = node.clone();
    while !Arc::ptr_eq(&cur, root) {
        cur = cur.parent()?;
        depth += 1;
    }
    Some(depth)
}

/// Edge moves from `root` down to `node`, in playing order.
pub fn moves_from_root(node: &Arc<Node>, root: &Arc<Node>) -> Option<Vec<Move>> {
    let mut moves = Vec::new();
    let mut cur = node.clone();
    while !Arc::ptr_eq(&cur, root) {
        moves.push(cur.edge_move()?);
        cur = cur.parent()?;
    }
    moves.reverse();
    Some(moves)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mv(uci: &str) -> Move {
        crate::board::parse_uci_move(&cozy_chess::Board::default(), uci)
            .or_else(|| uci.parse().ok())
            .expect("move")
    }

    #[test]
    fn walks_report_depth_and_moves() {
        let root = Node::new_root();
        let a = root.add_child(mv("e2e4"));
        let b = a.add_child(mv("e7e5"));
        assert_eq!(depth_from(&root, &root), Some(0));
        assert_eq!(depth_from(&b, &root), Some(2));
        let moves = moves_from_root(&b, &root).unwrap();
        assert_eq!(moves.len(), 2);
        assert_eq!(format!("{}", moves[0]), "e2e4");
        assert_eq!(root.num_edges(), 1);
    }

    #[test]
    fn detached_walks_fail() {
        let root = Node::new_root();
        let orphan_root = Node::new_root();
        let child = orphan_root.add_child(mv("e2e4"));
        drop(orphan_root);
        assert_eq!(depth_from(&child, &root), None);
        assert_eq!(moves_from_root(&child, &root), None);
    }

    #[test]
    fn tag_transitions() {
        let root = Node::new_root();
        assert_eq!(root.aux_state(), AuxState::Unset);
        root.set_aux_state(AuxState::Pending);
        assert_eq!(root.aux_state(), AuxState::Pending);
        root.set_aux_state(AuxState::Done);
        assert_eq!(root.aux_state(), AuxState::Done);
    }
}
