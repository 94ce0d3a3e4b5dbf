pub mod background;
pub mod cli;
pub mod config;
pub mod critical;
pub mod error;
mod event;
pub mod group;
pub mod host;
pub mod store;
pub mod window;

pub use error::{Error, Result};

/// Version of tab-groups
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
