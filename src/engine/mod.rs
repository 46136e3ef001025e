// engine module: the PR synchronization reactor

pub mod cache;
mod context;
mod interface;
mod sync;
pub mod tasks;

pub use context::{EngineContext, EngineSettings};
pub use interface::{Engine, EngineHandle, Event, Request};
pub use sync::SyncEngine;
