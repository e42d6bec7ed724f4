pub mod guard;
pub mod sizing;

pub use guard::PositionGuard;
pub use sizing::{LotSize, PositionSizer};
