use crate::config::{RendererConfig, ShaderPaths};
use crate::error::Result;
use crate::gpu::{BlendMode, Format, GpuDevice, ProgramDesc, ProgramId, Topology};

pub const COLOR_FORMAT: Format = Format::Rgba8Unorm;
pub const SHADOW_FORMAT: Format = Format::R8Unorm;

#[derive(Debug, Clone, Copy)]
pub struct FurPrograms {
    pub shadow: ProgramId,
    pub fin: ProgramId,
    pub shell: ProgramId,
}

/// Opacity shadow slices accumulate: additive on every target, no depth writes.
pub fn shadow_desc(shaders: &ShaderPaths, shadow_map_count: u32) -> ProgramDesc {
    ProgramDesc {
        label: "osm".into(),
        vertex_shader: shaders.shell_vert.clone(),
        geometry_shader: None,
        fragment_shader: shaders.osm_frag.clone(),
        topology: Topology::TriangleList,
        blend: BlendMode::Additive,
        alpha_to_coverage: false,
        sample_count: 1,
        color_formats: vec![SHADOW_FORMAT; shadow_map_count as usize],
        depth_write: false,
        cull_back: true,
    }
}

/// Fins are solid silhouette geometry built from the adjacency stream.
pub fn fin_desc(shaders: &ShaderPaths, samples: u32) -> ProgramDesc {
    ProgramDesc {
        label: "fin".into(),
        vertex_shader: shaders.fin_vert.clone(),
        geometry_shader: Some(shaders.fin_geom.clone()),
        fragment_shader: shaders.shell_frag.clone(),
        topology: Topology::TriangleListAdjacency,
        blend: BlendMode::Opaque,
        alpha_to_coverage: false,
        sample_count: samples,
        color_formats: vec![COLOR_FORMAT],
        depth_write: false,
        // emitted quad winding follows the edge direction
        cull_back: false,
    }
}

pub fn shell_desc(shaders: &ShaderPaths, samples: u32) -> ProgramDesc {
    ProgramDesc {
        label: "shell".into(),
        vertex_shader: shaders.shell_vert.clone(),
        geometry_shader: None,
        fragment_shader: shaders.shell_frag.clone(),
        topology: Topology::TriangleList,
        blend: BlendMode::Opaque,
        alpha_to_coverage: true,
        sample_count: samples,
        color_formats: vec![COLOR_FORMAT],
        depth_write: false,
        cull_back: true,
    }
}

impl FurPrograms {
    pub fn create<D: GpuDevice + ?Sized>(device: &mut D, config: &RendererConfig) -> Result<Self> {
        let shadow = device.create_program(&shadow_desc(&config.shaders, config.shadow_map_count))?;
        let fin = device.create_program(&fin_desc(&config.shaders, config.msaa_samples))?;
        let shell = device.create_program(&shell_desc(&config.shaders, config.msaa_samples))?;
        log::info!("created fur programs (msaa x{})", config.msaa_samples);
        Ok(Self { shadow, fin, shell })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_shells_use_alpha_to_coverage() {
        let s = ShaderPaths::default();
        assert!(shell_desc(&s, 4).alpha_to_coverage);
        assert!(!fin_desc(&s, 4).alpha_to_coverage);
        assert!(!shadow_desc(&s, 4).alpha_to_coverage);
    }

    #[test]
    fn shadow_program_accumulates_single_sampled() {
        let d = shadow_desc(&ShaderPaths::default(), 4);
        assert_eq!(d.blend, BlendMode::Additive);
        assert!(!d.depth_write);
        assert_eq!(d.sample_count, 1);
        assert_eq!(d.color_formats.len(), 4);
    }

    #[test]
    fn fin_program_reads_adjacency() {
        let d = fin_desc(&ShaderPaths::default(), 4);
        assert_eq!(d.topology, Topology::TriangleListAdjacency);
        assert!(d.geometry_shader.is_some());
        assert_eq!(d.sample_count, 4);
    }
}
