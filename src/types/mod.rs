mod block;
mod stage;
mod transaction;

pub use block::{Block, BlockSummary};
pub use stage::{ActorRole, Stage, StageEvent, StageSubmission};
pub use transaction::Transaction;

pub type ProductId = String;
pub type FarmerId = String;
