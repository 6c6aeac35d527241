//! Backend-neutral GPU interface.
//!
//! The renderer talks to a `GpuDevice` in terms of opaque handles and a
//! recorded `CommandStream`. `RecordingDevice` keeps everything on the CPU
//! for tests and tracing; the Vulkan backend lives behind the `vulkan`
//! feature.

pub mod command;
pub mod recording;
pub mod state;
#[cfg(feature = "vulkan")]
pub mod vk;

use crate::error::Result;
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;

pub use command::{Command, CommandRecorder, CommandStream};
pub use recording::RecordingDevice;
pub use state::{ResourceState, ResourceTracker, Transition};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct BufferId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TextureId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ProgramId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct CommandListId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BufferUsage {
    Vertex,
    Index,
    Uniform,
    /// Host-visible staging for texture uploads.
    Upload,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BufferDesc {
    pub label: String,
    pub size: u64,
    pub usage: BufferUsage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Format {
    Rgba8Unorm,
    R8Unorm,
    R32Float,
}

impl Format {
    pub fn bytes_per_texel(self) -> u32 {
        match self {
            Format::Rgba8Unorm | Format::R32Float => 4,
            Format::R8Unorm => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TextureUsage {
    pub render_target: bool,
    pub sampled: bool,
    pub resolve_src: bool,
    pub resolve_dst: bool,
    pub copy_dst: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TextureDesc {
    pub label: String,
    pub width: u32,
    pub height: u32,
    pub format: Format,
    pub samples: u32,
    pub usage: TextureUsage,
    pub initial_state: ResourceState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Topology {
    TriangleList,
    TriangleListAdjacency,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlendMode {
    Opaque,
    /// ONE + ONE on color and alpha.
    Additive,
}

/// Fixed-function state plus precompiled shader stages for one pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgramDesc {
    pub label: String,
    pub vertex_shader: PathBuf,
    pub geometry_shader: Option<PathBuf>,
    pub fragment_shader: PathBuf,
    pub topology: Topology,
    pub blend: BlendMode,
    pub alpha_to_coverage: bool,
    pub sample_count: u32,
    pub color_formats: Vec<Format>,
    pub depth_write: bool,
    pub cull_back: bool,
}

pub trait GpuDevice: Timeline {
    fn create_buffer(&mut self, desc: &BufferDesc, contents: Option<&[u8]>) -> Result<BufferId>;
    fn write_buffer(&mut self, buffer: BufferId, offset: u64, data: &[u8]) -> Result<()>;
    fn create_texture(&mut self, desc: &TextureDesc) -> Result<TextureId>;
    fn create_program(&mut self, desc: &ProgramDesc) -> Result<ProgramId>;
    fn create_command_list(&mut self) -> Result<CommandListId>;
    fn submit(&mut self, list: CommandListId, stream: &CommandStream) -> Result<()>;
    fn present(&mut self, back_buffer: TextureId) -> Result<()>;
}

/// Monotonic queue completion counter.
pub trait Timeline {
    /// Ask the queue to publish `value` once all previously submitted work completes.
    fn signal(&mut self, value: u64) -> Result<()>;
    fn completed_value(&self) -> Result<u64>;
    /// Block until `completed_value() >= value`, failing with `SyncTimeout` after `timeout`.
    fn wait(&mut self, value: u64, timeout: Duration) -> Result<()>;
}
