//! Frame orchestration: resources, pipeline programs, pass recording and
//! the per-frame driver.

pub mod orchestrator;
pub mod passes;
pub mod programs;
pub mod resources;

pub use orchestrator::{FrameStats, FurRenderer};
pub use programs::FurPrograms;
pub use resources::{FrameResourceSet, FrameSlot, StaticResources};
