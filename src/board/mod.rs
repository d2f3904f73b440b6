pub mod position;
pub mod result;

pub use position::{pack_move, parse_uci_move, Position, PositionHistory};
pub use result::{compute_game_result, GameResult};
