// Coordination core for driving auxiliary alpha-beta helper engines
// alongside an MCTS search: process pool, work queues, PV grafting feed.
pub mod aux;
pub mod board;
pub mod tree;

// Re-exports kept minimal for the embedding engine
pub use aux::{AuxOptions, Coordinator, PvRecord};
pub use board::{GameResult, Position, PositionHistory};
pub use tree::{AuxState, Node};
