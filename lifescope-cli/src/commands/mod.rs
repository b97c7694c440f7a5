//! CLI command implementations

mod config;
mod simulate;

pub use config::{load_config, show_config};
pub use simulate::{simulate, SimulateOptions};
