pub mod types;
pub mod error;
pub mod config;
pub mod store;
pub mod exchange;
pub mod executor;
pub mod market;
pub mod orders;
pub mod notify;
pub mod reconciler;
pub mod trades;
pub mod watcher;
pub mod bots;
pub mod utils;

pub use error::{EngineError, Result};
pub use types::*;
