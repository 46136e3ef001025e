// Shared domain types used by the engine, the git layer, and the remote layer.

pub mod commit;
pub mod common;
pub mod pr;

pub use commit::*;
pub use common::*;
pub use pr::*;
