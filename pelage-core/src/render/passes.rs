//! Per-frame pass recording. Each pass issues its own barriers before the
//! work that depends on them and leaves every texture it touched in the
//! state the next pass expects.

use super::programs::FurPrograms;
use super::resources::{FrameSlot, StaticResources};
use crate::error::Result;
use crate::gpu::{CommandRecorder, ResourceState, TextureId, Topology, Transition};

pub const SLOT_FRAME: u32 = 0;
pub const SLOT_FUR: u32 = 1;
pub const SLOT_DENSITY: u32 = 2;
pub const SLOT_SHADOWS: u32 = 3;

pub struct PassContext<'a> {
    pub statics: &'a StaticResources,
    pub slot: &'a FrameSlot,
    pub programs: &'a FurPrograms,
    pub shell_count: u32,
    pub width: u32,
    pub height: u32,
    pub background: [f32; 4],
}

fn batch(textures: &[TextureId], from: ResourceState, to: ResourceState) -> Vec<Transition> {
    textures.iter().map(|&t| Transition::new(t, from, to)).collect()
}

/// Opacity shadow maps: every shell slice is splatted into the N targets from the light.
pub fn record_shadow_pass(rec: &mut CommandRecorder, ctx: &PassContext) -> Result<()> {
    let s = ctx.statics;
    rec.barrier(&batch(&s.shadow_maps, ResourceState::ShaderReadable, ResourceState::RenderTarget))?;
    for &t in &s.shadow_maps {
        rec.clear(t, [0.0; 4])?;
    }
    rec.set_render_targets(&s.shadow_maps, s.shadow_map_size, s.shadow_map_size)?;
    rec.set_topology(Topology::TriangleList);
    rec.bind_vertex_buffer(s.vertex_buffer);
    rec.bind_index_buffer(s.index_buffer);
    rec.bind_program(ctx.programs.shadow);
    rec.bind_uniform(SLOT_FRAME, ctx.slot.light);
    rec.bind_uniform(SLOT_FUR, ctx.slot.fur);
    rec.bind_textures(SLOT_DENSITY, &[s.density])?;
    rec.draw_indexed(s.index_count, ctx.shell_count)?;
    rec.barrier(&batch(&s.shadow_maps, ResourceState::RenderTarget, ResourceState::ShaderReadable))
}

/// Fins first from the adjacency stream, then the instanced shell stack.
pub fn record_main_pass(rec: &mut CommandRecorder, ctx: &PassContext) -> Result<()> {
    let s = ctx.statics;
    rec.barrier(&[Transition::new(s.msaa_target, ResourceState::ResolveSource, ResourceState::RenderTarget)])?;
    rec.set_render_targets(&[s.msaa_target], ctx.width, ctx.height)?;
    rec.clear(s.msaa_target, ctx.background)?;
    rec.bind_vertex_buffer(s.vertex_buffer);
    rec.bind_uniform(SLOT_FRAME, ctx.slot.camera);
    rec.bind_uniform(SLOT_FUR, ctx.slot.fur);
    rec.bind_textures(SLOT_DENSITY, &[s.density])?;
    rec.bind_textures(SLOT_SHADOWS, &s.shadow_maps)?;

    rec.bind_program(ctx.programs.fin);
    rec.set_topology(Topology::TriangleListAdjacency);
    rec.bind_index_buffer(s.adjacency_buffer);
    rec.draw_indexed(s.adjacency_index_count, 1)?;

    rec.bind_program(ctx.programs.shell);
    rec.set_topology(Topology::TriangleList);
    rec.bind_index_buffer(s.index_buffer);
    rec.draw_indexed(s.index_count, ctx.shell_count)
}

pub fn record_resolve_pass(rec: &mut CommandRecorder, ctx: &PassContext, back_buffer: TextureId) -> Result<()> {
    let msaa = ctx.statics.msaa_target;
    rec.barrier(&[
        Transition::new(msaa, ResourceState::RenderTarget, ResourceState::ResolveSource),
        Transition::new(back_buffer, ResourceState::Presentable, ResourceState::ResolveDestination),
    ])?;
    rec.resolve(msaa, back_buffer)?;
    rec.barrier(&[Transition::new(back_buffer, ResourceState::ResolveDestination, ResourceState::Presentable)])
}

/// One-time upload of the density texture and the initial transitions that
/// put every texture into the state the frame loop expects on entry.
pub fn record_startup(rec: &mut CommandRecorder, statics: &StaticResources) -> Result<()> {
    let mut initial = vec![
        Transition::new(statics.density, ResourceState::Undefined, ResourceState::CopyDestination),
        Transition::new(statics.msaa_target, ResourceState::Undefined, ResourceState::ResolveSource),
    ];
    initial.extend(batch(&statics.shadow_maps, ResourceState::Undefined, ResourceState::ShaderReadable));
    initial.extend(batch(&statics.back_buffers, ResourceState::Undefined, ResourceState::Presentable));
    rec.barrier(&initial)?;
    rec.copy_buffer_to_texture(statics.density_staging, statics.density)?;
    rec.barrier(&[Transition::new(statics.density, ResourceState::CopyDestination, ResourceState::ShaderReadable)])
}
