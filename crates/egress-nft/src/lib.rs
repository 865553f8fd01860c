pub mod learner;
pub mod manager;
pub mod ruleset;

pub use learner::*;
pub use manager::*;
pub use ruleset::*;

// nftables script renderer, applier, and learned-set maintenance
