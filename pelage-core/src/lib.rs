pub mod config;
pub mod density;
pub mod error;
pub mod geometry;
pub mod gpu;
pub mod params;
pub mod render;
pub mod sync;

pub use error::{PelageError, Result};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
