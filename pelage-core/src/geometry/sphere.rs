use super::{TriangleMesh, Vertex};
use std::f32::consts::PI;

// UV sphere centered at origin with single pole vertices so the caps share
// edges. The longitude seam is duplicated to keep texcoords continuous.
// slices: longitude segments (>= 3), stacks: latitude segments (>= 3)
pub fn generate_uv_sphere(radius: f32, slices: u32, stacks: u32) -> TriangleMesh {
    let slices = slices.max(3);
    let stacks = stacks.max(3);
    let mut vertices = Vec::with_capacity(((stacks - 1) * (slices + 1) + 2) as usize);
    let mut indices = Vec::with_capacity((slices * 6 * (stacks - 1)) as usize);

    vertices.push(Vertex::new([0.0, radius, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0]));

    let phi_step = PI / stacks as f32;
    let theta_step = 2.0 * PI / slices as f32;
    for i in 1..stacks {
        let phi = i as f32 * phi_step;
        for j in 0..=slices {
            let theta = j as f32 * theta_step;
            let n = [phi.sin() * theta.cos(), phi.cos(), phi.sin() * theta.sin()];
            let pos = [radius * n[0], radius * n[1], radius * n[2]];
            let uv = [theta / (2.0 * PI), phi / PI];
            vertices.push(Vertex::new(pos, n, uv));
        }
    }

    vertices.push(Vertex::new([0.0, -radius, 0.0], [0.0, -1.0, 0.0], [0.0, 1.0]));

    for i in 1..=slices {
        indices.extend_from_slice(&[0, i + 1, i]);
    }

    let base = 1u32;
    let ring = slices + 1;
    for i in 0..stacks - 2 {
        for j in 0..slices {
            let a = base + i * ring + j;
            let b = a + 1;
            let c = base + (i + 1) * ring + j;
            let d = c + 1;
            indices.extend_from_slice(&[a, b, c]);
            indices.extend_from_slice(&[c, b, d]);
        }
    }

    let south = vertices.len() as u32 - 1;
    let base = south - ring;
    for i in 0..slices {
        indices.extend_from_slice(&[south, base + i, base + i + 1]);
    }

    TriangleMesh::new(vertices, indices)
}

/// Regular tetrahedron with outward winding; every edge borders exactly two faces.
pub fn tetrahedron() -> TriangleMesh {
    let s = 1.0 / 3.0f32.sqrt();
    let corners = [[1.0, 1.0, 1.0], [1.0, -1.0, -1.0], [-1.0, 1.0, -1.0], [-1.0, -1.0, 1.0]];
    let uvs = [[0.0, 0.0], [1.0, 0.0], [0.0, 1.0], [1.0, 1.0]];
    let vertices = corners
        .iter()
        .zip(uvs)
        .map(|(p, uv)| Vertex::new(*p, [p[0] * s, p[1] * s, p[2] * s], uv))
        .collect();
    let indices = vec![0, 1, 2, 0, 3, 1, 1, 3, 2, 2, 3, 0];
    TriangleMesh::new(vertices, indices)
}

/// A row of `quads` unit quads in the XY plane. Every outer edge is a boundary.
pub fn open_quad_strip(quads: u32) -> TriangleMesh {
    let quads = quads.max(1);
    let mut vertices = Vec::with_capacity(2 * (quads as usize + 1));
    for row in 0..2 {
        for i in 0..=quads {
            let u = i as f32 / quads as f32;
            vertices.push(Vertex::new([i as f32, row as f32, 0.0], [0.0, 0.0, 1.0], [u, row as f32]));
        }
    }
    let top = quads + 1;
    let mut indices = Vec::with_capacity(quads as usize * 6);
    for i in 0..quads {
        let (a, b, c, d) = (i, i + 1, top + i, top + i + 1);
        indices.extend_from_slice(&[a, b, c, b, d, c]);
    }
    TriangleMesh::new(vertices, indices)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sphere_counts_match_ring_layout() {
        let m = generate_uv_sphere(1.0, 20, 20);
        assert_eq!(m.vertices.len(), 19 * 21 + 2);
        assert_eq!(m.triangle_count(), 20 * 2 + 18 * 20 * 2);
        assert!(m.validate().is_ok());
    }

    #[test]
    fn sphere_vertices_sit_on_the_radius() {
        let m = generate_uv_sphere(2.5, 9, 6);
        for v in &m.vertices {
            let len = (v.pos[0] * v.pos[0] + v.pos[1] * v.pos[1] + v.pos[2] * v.pos[2]).sqrt();
            assert!((len - 2.5).abs() < 1e-4);
        }
    }

    #[test]
    fn tetrahedron_faces_point_outward() {
        let m = tetrahedron();
        for t in m.indices.chunks(3) {
            let [a, b, c] = [m.vertices[t[0] as usize].pos, m.vertices[t[1] as usize].pos, m.vertices[t[2] as usize].pos];
            let e1 = [b[0] - a[0], b[1] - a[1], b[2] - a[2]];
            let e2 = [c[0] - a[0], c[1] - a[1], c[2] - a[2]];
            let n = [e1[1] * e2[2] - e1[2] * e2[1], e1[2] * e2[0] - e1[0] * e2[2], e1[0] * e2[1] - e1[1] * e2[0]];
            let centroid = [(a[0] + b[0] + c[0]) / 3.0, (a[1] + b[1] + c[1]) / 3.0, (a[2] + b[2] + c[2]) / 3.0];
            let dot = n[0] * centroid[0] + n[1] * centroid[1] + n[2] * centroid[2];
            assert!(dot > 0.0);
        }
    }

    #[test]
    fn quad_strip_layout() {
        let m = open_quad_strip(3);
        assert_eq!(m.vertices.len(), 8);
        assert_eq!(m.indices.len(), 18);
        assert!(m.validate().is_ok());
    }
}
