//! CPU-side mesh data: vertex layout, triangle meshes, adjacency and the
//! procedural shapes used as fallbacks and test fixtures.

pub mod adjacency;
pub mod sphere;
pub mod source;

use crate::error::{PelageError, Result};
use bytemuck::{Pod, Zeroable};

pub use adjacency::{analyze_edges, build_adjacency, EdgeReport};
pub use sphere::{generate_uv_sphere, open_quad_strip, tetrahedron};
pub use source::{load_or_fallback, MeshSource, ObjMeshSource};

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Default, Pod, Zeroable)]
pub struct Vertex {
    pub pos: [f32; 3],
    pub normal: [f32; 3],
    pub uv: [f32; 2],
}

impl Vertex {
    pub const STRIDE: u32 = std::mem::size_of::<Vertex>() as u32;
    pub const NORMAL_OFFSET: u32 = 12;
    pub const UV_OFFSET: u32 = 24;

    pub fn new(pos: [f32; 3], normal: [f32; 3], uv: [f32; 2]) -> Self {
        Self { pos, normal, uv }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TriangleMesh {
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u32>,
}

impl TriangleMesh {
    pub fn new(vertices: Vec<Vertex>, indices: Vec<u32>) -> Self {
        Self { vertices, indices }
    }

    /// An empty mesh is the mesh-source failure signal.
    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty() || self.indices.is_empty()
    }

    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }

    pub fn validate(&self) -> Result<()> {
        validate_indices(self.vertices.len(), &self.indices)
    }

    pub fn vertex_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.vertices)
    }

    pub fn index_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.indices)
    }
}

pub(crate) fn validate_indices(vertex_count: usize, indices: &[u32]) -> Result<()> {
    if indices.len() % 3 != 0 {
        return Err(PelageError::InvalidMesh(format!(
            "index count {} is not a multiple of 3",
            indices.len()
        )));
    }
    if let Some(bad) = indices.iter().find(|&&i| i as usize >= vertex_count) {
        return Err(PelageError::InvalidMesh(format!(
            "index {} out of range for {} vertices",
            bad, vertex_count
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vertex_layout_is_tightly_packed() {
        assert_eq!(Vertex::STRIDE, 32);
        assert_eq!(std::mem::align_of::<Vertex>(), 4);
    }

    #[test]
    fn validate_rejects_ragged_and_out_of_range() {
        let v = vec![Vertex::default(); 3];
        assert!(TriangleMesh::new(v.clone(), vec![0, 1, 2]).validate().is_ok());
        assert!(matches!(
            TriangleMesh::new(v.clone(), vec![0, 1]).validate(),
            Err(PelageError::InvalidMesh(_))
        ));
        assert!(matches!(
            TriangleMesh::new(v, vec![0, 1, 3]).validate(),
            Err(PelageError::InvalidMesh(_))
        ));
    }
}
