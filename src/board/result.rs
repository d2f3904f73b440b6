use cozy_chess::Color;
use log::debug;

use super::position::PositionHistory;

/// Game outcome under the R-mobility convention. Beyond the classic
/// win/draw/loss, late-game positions decided by the 50-move rule or by
/// repetition are graded by the tightest mobility either side forced:
/// `Mobility { winner, legal_moves: k, in_check }` is Gk.0 when the
/// restricted side was in check and Gk.5 when it was not, for k in 1..=9.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GameResult {
    Undecided,
    Draw,
    /// White delivered checkmate.
    WhiteWon,
    /// Black delivered checkmate.
    BlackWon,
    /// White stalemated black.
    WhiteStalemate,
    /// Black stalemated white.
    BlackStalemate,
    Mobility { winner: Color, legal_moves: u8, in_check: bool },
}

impl GameResult {
    /// Small-integer packing: 1 black mate, 2 black stalemate, 3..20 black
    /// Gk wins ascending, 21 draw, 22 white stalemate, 23 unused, 24..41
    /// white Gk wins ascending, 42 white mate, 0 undecided.
    pub fn pack(self) -> u8 {
        match self {
            GameResult::Undecided => 0,
            GameResult::BlackWon => 1,
            GameResult::BlackStalemate => 2,
            GameResult::Draw => 21,
            GameResult::WhiteStalemate => 22,
            GameResult::WhiteWon => 42,
            GameResult::Mobility { winner, legal_moves, in_check } => {
                let base = if winner == Color::Black { 1 } else { 22 };
                base + 2 * legal_moves + if in_check { 0 } else { 1 }
            }
        }
    }

    pub fn unpack(v: u8) -> Option<GameResult> {
        Some(match v {
            0 => GameResult::Undecided,
            1 => GameResult::BlackWon,
            2 => GameResult::BlackStalemate,
            21 => GameResult::Draw,
            22 => GameResult::WhiteStalemate,
            42 => GameResult::WhiteWon,
            3..=20 | 24..=41 => {
                let winner = if v <= 20 { Color::Black } else { Color::White };
                let rel = v - if winner == Color::Black { 1 } else { 22 };
                GameResult::Mobility {
                    winner,
                    legal_moves: rel / 2,
                    in_check: rel % 2 == 0,
                }
            }
            _ => return None,
        })
    }

    /// Result as seen by the other player. Wins swap sides; draws and
    /// stalemate gradations are fixed points.
    pub fn flipped(self) -> GameResult {
        match self {
            GameResult::WhiteWon => GameResult::BlackWon,
            GameResult::BlackWon => GameResult::WhiteWon,
            GameResult::Mobility { winner, legal_moves, in_check } => GameResult::Mobility {
                winner: !winner,
                legal_moves,
                in_check,
            },
            other => other,
        }
    }

    pub fn is_decisive(self) -> bool {
        !matches!(self, GameResult::Undecided | GameResult::Draw)
    }
}

impl std::ops::Neg for GameResult {
    type Output = GameResult;
    fn neg(self) -> GameResult { self.flipped() }
}

/// Terminal classification of the current position. Checkmate and
/// stalemate are immediate; once the 50-move counter expires or the
/// position repeats twice, the game is graded by R-mobility instead of
/// being folded into a flat draw.
pub fn compute_game_result(history: &PositionHistory) -> GameResult {
    let last = history.last();
    if last.legal_move_count() == 0 {
        if last.is_in_check() {
            return if last.is_black_to_move() { GameResult::WhiteWon } else { GameResult::BlackWon };
        }
        return if last.is_black_to_move() {
            GameResult::WhiteStalemate
        } else {
            GameResult::BlackStalemate
        };
    }
    if last.rule50_ply() >= 100 || last.repetitions() >= 2 {
        return r_mobility_result(history);
    }
    GameResult::Undecided
}

// Walk backward from the current position through the plies covered by the
// 50-move counter. A position where the side to move has fewer than 10
// legal moves is a goal for its opponent; the tightest goal wins, ties
// resolving to the earliest occurrence. No goal at all is a plain draw.
fn r_mobility_result(history: &PositionHistory) -> GameResult {
    let rule50 = history.last().rule50_ply() as usize;
    let mut best_moves = 10usize;
    let mut result = GameResult::Draw;
    for back in 0..=rule50 {
        let Some(idx) = (history.len() - 1).checked_sub(back) else { break };
        let pos = history.get(idx);
        let legal = pos.legal_move_count();
        if legal < 10 && legal <= best_moves {
            best_moves = legal;
            let restricted = pos.board().side_to_move();
            result = GameResult::Mobility {
                winner: !restricted,
                legal_moves: legal as u8,
                in_check: pos.is_in_check(),
            };
            debug!(
                "r-mobility goal at ply {}: {:?} held to {} legal moves ({})",
                idx,
                restricted,
                legal,
                if pos.is_in_check() { "in check" } else { "not in check" }
            );
        }
    }
    result
}
