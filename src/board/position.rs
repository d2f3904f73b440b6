use anyhow::{anyhow, Result};
use cozy_chess::{Board, Color, Move, Piece};

/// Pack a move into 16 bits: 6 bits from-square, 6 bits to-square, 3 bits
/// promotion piece. This is the encoding used for PV cache keys and PV
/// records; 0xFFFE and 0xFFFF stay free for the node tag sentinels.
pub fn pack_move(mv: Move) -> u16 {
    let promo = match mv.promotion {
        None => 0u16,
        Some(Piece::Knight) => 1,
        Some(Piece::Bishop) => 2,
        Some(Piece::Rook) => 3,
        Some(Piece::Queen) => 4,
        Some(_) => 0,
    };
    (mv.from as u16) | ((mv.to as u16) << 6) | (promo << 12)
}

pub fn legal_moves(board: &Board) -> Vec<Move> {
    let mut v = Vec::new();
    board.generate_moves(|ml| { for m in ml { v.push(m); } false });
    v
}

fn find_move_uci(board: &Board, uci: &str) -> Option<Move> {
    let mut found = None;
    board.generate_moves(|ml| {
        for m in ml { if format!("{}", m) == uci { found = Some(m); break; } }
        found.is_some()
    });
    found
}

/// Parse a helper-emitted UCI move against `board`. Standard UCI writes
/// castling as a two-square king move (e1g1); cozy-chess encodes it as
/// king-takes-rook (e1h1), so translate before matching. Returns None for
/// tokens that do not name a legal move.
pub fn parse_uci_move(board: &Board, token: &str) -> Option<Move> {
    if let Some(m) = find_move_uci(board, token) {
        return Some(m);
    }
    let translated = match token {
        "e1g1" => "e1h1",
        "e1c1" => "e1a1",
        "e8g8" => "e8h8",
        "e8c8" => "e8a8",
        _ => return None,
    };
    let stm = board.side_to_move();
    let king_home = if stm == Color::White { "e1" } else { "e8" };
    if format!("{}", board.king(stm)) != king_home {
        return None;
    }
    find_move_uci(board, translated)
}

/// Apply `mv` only if it is legal on `board`.
pub fn apply_checked(board: &mut Board, mv: Move) -> bool {
    let mut legal = false;
    board.generate_moves(|ml| {
        for m in ml { if m == mv { legal = true; break; } }
        legal
    });
    if legal { board.play(mv); }
    legal
}

fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E3779B97F4A7C15);
    let mut z = x;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
    z ^ (z >> 31)
}

/// One ply of the played game: the board plus the repetition count that the
/// history computed for it when it was appended.
#[derive(Clone, Debug)]
pub struct Position {
    board: Board,
    repetitions: u32,
}

impl Position {
    pub fn new(board: Board) -> Self { Self { board, repetitions: 0 } }

    pub fn board(&self) -> &Board { &self.board }

    pub fn rule50_ply(&self) -> u32 { self.board.halfmove_clock() as u32 }

    pub fn repetitions(&self) -> u32 { self.repetitions }

    pub fn game_ply(&self) -> u32 {
        let full = self.board.fullmove_number() as u32;
        (full - 1) * 2 + if self.is_black_to_move() { 1 } else { 0 }
    }

    pub fn is_black_to_move(&self) -> bool { self.board.side_to_move() == Color::Black }

    pub fn legal_move_count(&self) -> usize {
        let mut ct = 0usize;
        self.board.generate_moves(|ml| { ct += ml.len(); false });
        ct
    }

    pub fn is_in_check(&self) -> bool { !self.board.checkers().is_empty() }

    /// 64-bit hash folding in the repetition count, so that a twice-seen
    /// board hashes differently from its first occurrence.
    pub fn hash(&self) -> u64 {
        splitmix64(self.board.hash() ^ (self.repetitions as u64).rotate_left(32))
    }

    pub fn fen(&self) -> String { format!("{}", self.board) }
}

/// The played game, root first, one position per half-move. The last
/// element is the current position; every element is the previous one plus
/// exactly one legal move.
#[derive(Clone, Debug)]
pub struct PositionHistory {
    positions: Vec<Position>,
}

impl PositionHistory {
    pub fn starting() -> Self { Self::from_board(Board::default()) }

    pub fn from_board(board: Board) -> Self {
        Self { positions: vec![Position::new(board)] }
    }

    pub fn from_fen(fen: &str) -> Result<Self> {
        let board = Board::from_fen(fen, false).map_err(|e| anyhow!("bad FEN: {:?}", e))?;
        Ok(Self::from_board(board))
    }

    pub fn reset(&mut self, board: Board) {
        self.positions.clear();
        self.positions.push(Position::new(board));
    }

    pub fn len(&self) -> usize { self.positions.len() }

    pub fn is_empty(&self) -> bool { self.positions.is_empty() }

    pub fn last(&self) -> &Position { self.positions.last().expect("history never empty") }

    pub fn get(&self, idx: usize) -> &Position { &self.positions[idx] }

    pub fn is_black_to_move(&self) -> bool { self.last().is_black_to_move() }

    /// Append one legal move to the history and recompute the repetition
    /// count of the resulting position.
    pub fn append(&mut self, mv: Move) -> Result<()> {
        let mut board = self.last().board.clone();
        if !apply_checked(&mut board, mv) {
            return Err(anyhow!("illegal move {} appended to history", mv));
        }
        self.positions.push(Position::new(board));
        let reps = self.compute_last_repetitions();
        self.positions.last_mut().expect("just pushed").repetitions = reps;
        Ok(())
    }

    // Backward scan over same-side-to-move positions, bounded by the 50-move
    // counter: a zeroing move makes everything before it unreachable.
    fn compute_last_repetitions(&self) -> u32 {
        let last = self.last();
        if last.rule50_ply() < 4 || self.positions.len() < 3 {
            return 0;
        }
        let last_hash = last.board.hash();
        let mut idx = self.positions.len() as isize - 3;
        while idx >= 0 {
            let pos = &self.positions[idx as usize];
            if pos.board.hash() == last_hash {
                return 1 + pos.repetitions;
            }
            if pos.rule50_ply() < 2 {
                return 0;
            }
            idx -= 2;
        }
        0
    }

    pub fn did_repeat_since_last_zeroing(&self) -> bool {
        for pos in self.positions.iter().rev() {
            if pos.repetitions > 0 { return true; }
            if pos.rule50_ply() == 0 { return false; }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn play(history: &mut PositionHistory, uci: &str) {
        let mv = parse_uci_move(history.last().board(), uci).expect("legal move");
        history.append(mv).unwrap();
    }

    #[test]
    fn append_tracks_side_to_move() {
        let mut h = PositionHistory::starting();
        play(&mut h, "e2e4");
        play(&mut h, "e7e5");
        play(&mut h, "g1f3");
        assert_eq!(h.len(), 4);
        assert!(h.is_black_to_move(), "expected black to move after 3 plies");
    }

    #[test]
    fn castling_token_translated() {
        let mut h =
            PositionHistory::from_fen("r1bqk1nr/pppp1ppp/2n5/2b1p3/2B1P3/5N2/PPPP1PPP/RNBQK2R w KQkq - 4 4")
                .unwrap();
        let mv = parse_uci_move(h.last().board(), "e1g1").expect("castling should parse");
        assert_eq!(format!("{}", mv), "e1h1");
        h.append(mv).unwrap();
        assert_eq!(format!("{}", h.last().board().king(Color::White)), "g1");
    }

    #[test]
    fn bad_tokens_rejected() {
        let h = PositionHistory::starting();
        assert!(parse_uci_move(h.last().board(), "e2e5").is_none());
        assert!(parse_uci_move(h.last().board(), "junk").is_none());
        // Castling rights gone: the translated token must not match either.
        let h2 = PositionHistory::from_fen("4k3/8/8/8/8/8/8/4K2R w - - 0 1").unwrap();
        assert!(parse_uci_move(h2.last().board(), "e1g1").is_none());
    }

    #[test]
    fn repetitions_counted() {
        let mut h = PositionHistory::starting();
        for uci in ["g1f3", "g8f6", "f3g1", "f6g8"] {
            play(&mut h, uci);
        }
        assert_eq!(h.last().repetitions(), 1);
        assert!(h.did_repeat_since_last_zeroing());
        for uci in ["g1f3", "g8f6", "f3g1", "f6g8"] {
            play(&mut h, uci);
        }
        assert_eq!(h.last().repetitions(), 2);
    }

    #[test]
    fn zeroing_move_resets_repetition_scan() {
        let mut h = PositionHistory::starting();
        for uci in ["g1f3", "g8f6", "f3g1", "f6g8", "e2e4"] {
            play(&mut h, uci);
        }
        assert_eq!(h.last().rule50_ply(), 0);
        assert!(!h.did_repeat_since_last_zeroing());
    }

    #[test]
    fn packed_moves_distinct() {
        let board = Board::default();
        let moves = legal_moves(&board);
        let mut seen = std::collections::HashSet::new();
        for m in &moves {
            assert!(seen.insert(pack_move(*m)), "packed collision for {}", m);
        }
        assert_eq!(seen.len(), 20);
    }

    #[test]
    fn repetition_fold_changes_hash() {
        let mut h = PositionHistory::starting();
        let first = h.last().hash();
        for uci in ["g1f3", "g8f6", "f3g1", "f6g8"] {
            play(&mut h, uci);
        }
        assert_ne!(h.last().hash(), first, "repetition count must perturb the hash");
    }
}
