pub mod cli;
pub mod error;
pub mod loader;
pub mod model;

pub use loader::{Config, ConfigLoader};
