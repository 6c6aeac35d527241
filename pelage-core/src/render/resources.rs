//! Static GPU resources shared by every frame, plus the per-slot buffers
//! and command lists of the frames-in-flight ring.

use super::programs::{COLOR_FORMAT, SHADOW_FORMAT};
use crate::config::RendererConfig;
use crate::density::DensityField;
use crate::error::Result;
use crate::geometry::{build_adjacency, TriangleMesh};
use crate::gpu::{
    BufferDesc, BufferId, BufferUsage, CommandListId, Format, GpuDevice, ResourceState, ResourceTracker, TextureDesc,
    TextureId, TextureUsage,
};
use crate::params::{FrameParams, FurUniform};

#[derive(Debug, Clone)]
pub struct StaticResources {
    pub vertex_buffer: BufferId,
    pub index_buffer: BufferId,
    pub adjacency_buffer: BufferId,
    pub index_count: u32,
    pub adjacency_index_count: u32,
    pub density: TextureId,
    pub density_staging: BufferId,
    pub shadow_maps: Vec<TextureId>,
    pub shadow_map_size: u32,
    pub msaa_target: TextureId,
    pub back_buffers: Vec<TextureId>,
}

#[derive(Debug, Clone, Copy)]
pub struct FrameSlot {
    pub camera: BufferId,
    pub light: BufferId,
    pub fur: BufferId,
    pub list: CommandListId,
}

#[derive(Debug, Clone)]
pub struct FrameResourceSet {
    pub statics: StaticResources,
    pub slots: Vec<FrameSlot>,
}

fn texture<D: GpuDevice + ?Sized>(
    device: &mut D,
    tracker: &mut ResourceTracker,
    desc: TextureDesc,
) -> Result<TextureId> {
    let id = device.create_texture(&desc)?;
    tracker.register(id, desc.label, desc.initial_state);
    Ok(id)
}

impl FrameResourceSet {
    /// Create everything. Textures start `Undefined`; the caller records the
    /// transitions that bring them into their steady-state.
    pub fn create<D: GpuDevice + ?Sized>(
        device: &mut D,
        tracker: &mut ResourceTracker,
        mesh: &TriangleMesh,
        density: &DensityField,
        config: &RendererConfig,
    ) -> Result<Self> {
        mesh.validate()?;
        let adjacency = build_adjacency(&mesh.vertices, &mesh.indices)?;

        let buffer = |label: &str, usage, bytes: &[u8]| BufferDesc {
            label: label.to_string(),
            size: bytes.len() as u64,
            usage,
        };
        let adjacency_bytes: &[u8] = bytemuck::cast_slice(&adjacency);
        let vertex_buffer =
            device.create_buffer(&buffer("vertices", BufferUsage::Vertex, mesh.vertex_bytes()), Some(mesh.vertex_bytes()))?;
        let index_buffer =
            device.create_buffer(&buffer("indices", BufferUsage::Index, mesh.index_bytes()), Some(mesh.index_bytes()))?;
        let adjacency_buffer =
            device.create_buffer(&buffer("indices_adj", BufferUsage::Index, adjacency_bytes), Some(adjacency_bytes))?;
        let density_staging = device
            .create_buffer(&buffer("density_staging", BufferUsage::Upload, density.as_bytes()), Some(density.as_bytes()))?;

        let density_tex = texture(
            device,
            tracker,
            TextureDesc {
                label: "density".into(),
                width: density.width,
                height: density.height,
                format: Format::R32Float,
                samples: 1,
                usage: TextureUsage { sampled: true, copy_dst: true, ..Default::default() },
                initial_state: ResourceState::Undefined,
            },
        )?;

        let shadow_maps = (0..config.shadow_map_count)
            .map(|i| {
                texture(
                    device,
                    tracker,
                    TextureDesc {
                        label: format!("osm[{}]", i),
                        width: config.shadow_map_size,
                        height: config.shadow_map_size,
                        format: SHADOW_FORMAT,
                        samples: 1,
                        usage: TextureUsage { render_target: true, sampled: true, ..Default::default() },
                        initial_state: ResourceState::Undefined,
                    },
                )
            })
            .collect::<Result<Vec<_>>>()?;

        let msaa_target = texture(
            device,
            tracker,
            TextureDesc {
                label: "msaa_color".into(),
                width: config.width,
                height: config.height,
                format: COLOR_FORMAT,
                samples: config.msaa_samples,
                usage: TextureUsage { render_target: true, resolve_src: true, ..Default::default() },
                initial_state: ResourceState::Undefined,
            },
        )?;

        let back_buffers = (0..config.back_buffer_count)
            .map(|i| {
                texture(
                    device,
                    tracker,
                    TextureDesc {
                        label: format!("back[{}]", i),
                        width: config.width,
                        height: config.height,
                        format: COLOR_FORMAT,
                        samples: 1,
                        usage: TextureUsage { resolve_dst: true, ..Default::default() },
                        initial_state: ResourceState::Undefined,
                    },
                )
            })
            .collect::<Result<Vec<_>>>()?;

        let frame_size = std::mem::size_of::<FrameParams>() as u64;
        let fur_size = std::mem::size_of::<FurUniform>() as u64;
        let slots = (0..config.frames_in_flight)
            .map(|i| -> Result<FrameSlot> {
                let ubo = |name: &str, size| BufferDesc { label: format!("{}[{}]", name, i), size, usage: BufferUsage::Uniform };
                Ok(FrameSlot {
                    camera: device.create_buffer(&ubo("frame_cb", frame_size), None)?,
                    light: device.create_buffer(&ubo("light_cb", frame_size), None)?,
                    fur: device.create_buffer(&ubo("fur_cb", fur_size), None)?,
                    list: device.create_command_list()?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        log::info!(
            "frame resources: {} vertices, {} indices ({} adjacency), density {}x{}, {} shadow maps, {} back buffers, {} frame slots",
            mesh.vertices.len(),
            mesh.indices.len(),
            adjacency.len(),
            density.width,
            density.height,
            shadow_maps.len(),
            back_buffers.len(),
            slots.len()
        );

        Ok(Self {
            statics: StaticResources {
                vertex_buffer,
                index_buffer,
                adjacency_buffer,
                index_count: mesh.indices.len() as u32,
                adjacency_index_count: adjacency.len() as u32,
                density: density_tex,
                density_staging,
                shadow_maps,
                shadow_map_size: config.shadow_map_size,
                msaa_target,
                back_buffers,
            },
            slots,
        })
    }
}
