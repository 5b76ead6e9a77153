pub mod aggregator;
pub mod config;
pub mod db;
pub mod error;
pub mod execution;
pub mod executor;
pub mod gatekeeper;
pub mod io;
pub mod orchestrator;
pub mod paths;
pub mod planner;
pub mod progress;
pub mod release;
pub mod store;
pub mod types;

pub use error::{Result, RolloutError};
pub use orchestrator::{CancelOutcome, Orchestrator};
