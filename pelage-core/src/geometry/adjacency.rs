//! Triangle-list-with-adjacency index generation for the fin pass.
//!
//! Output layout per triangle: `v0, opp(v0-v1), v1, opp(v1-v2), v2, opp(v2-v0)`.
//! An edge without a neighbour reports the edge's first vertex, which the
//! fin geometry stage treats as a degenerate (no-op) neighbour.

use super::{validate_indices, Vertex};
use crate::error::Result;
use std::collections::HashMap;

/// Order-independent edge key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
struct EdgeKey(u32, u32);

impl EdgeKey {
    fn new(a: u32, b: u32) -> Self {
        if a <= b { Self(a, b) } else { Self(b, a) }
    }

    fn contains(&self, v: u32) -> bool {
        self.0 == v || self.1 == v
    }
}

fn triangle(indices: &[u32], t: usize) -> [u32; 3] {
    [indices[t * 3], indices[t * 3 + 1], indices[t * 3 + 2]]
}

fn triangle_edges(tri: [u32; 3]) -> [EdgeKey; 3] {
    [EdgeKey::new(tri[0], tri[1]), EdgeKey::new(tri[1], tri[2]), EdgeKey::new(tri[2], tri[0])]
}

fn edge_map(indices: &[u32]) -> HashMap<EdgeKey, Vec<u32>> {
    let tri_count = indices.len() / 3;
    let mut map: HashMap<EdgeKey, Vec<u32>> = HashMap::with_capacity(tri_count * 3 / 2 + 1);
    for t in 0..tri_count {
        for e in triangle_edges(triangle(indices, t)) {
            map.entry(e).or_default().push(t as u32);
        }
    }
    map
}

/// Build the adjacency-extended index list (twice the length of `indices`).
///
/// Edges shared by three or more triangles take the first other triangle
/// found in submission order.
pub fn build_adjacency(vertices: &[Vertex], indices: &[u32]) -> Result<Vec<u32>> {
    validate_indices(vertices.len(), indices)?;
    let map = edge_map(indices);
    let tri_count = indices.len() / 3;
    let mut out = Vec::with_capacity(indices.len() * 2);

    for t in 0..tri_count {
        let tri = triangle(indices, t);
        let edges = triangle_edges(tri);
        let mut opposite = tri;
        for (e, edge) in edges.iter().enumerate() {
            let neighbour = map
                .get(edge)
                .and_then(|tris| tris.iter().copied().find(|&other| other as usize != t));
            if let Some(n) = neighbour {
                if let Some(v) = triangle(indices, n as usize).into_iter().find(|&v| !edge.contains(v)) {
                    opposite[e] = v;
                }
            }
        }
        out.extend_from_slice(&[tri[0], opposite[0], tri[1], opposite[1], tri[2], opposite[2]]);
    }

    Ok(out)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EdgeReport {
    pub edges: usize,
    pub boundary_edges: usize,
    pub non_manifold_edges: usize,
}

impl EdgeReport {
    pub fn is_closed_manifold(&self) -> bool {
        self.boundary_edges == 0 && self.non_manifold_edges == 0
    }
}

pub fn analyze_edges(indices: &[u32]) -> EdgeReport {
    let map = edge_map(&indices[..indices.len() - indices.len() % 3]);
    let mut report = EdgeReport { edges: map.len(), ..Default::default() };
    for tris in map.values() {
        match tris.len() {
            1 => report.boundary_edges += 1,
            2 => {}
            _ => report.non_manifold_edges += 1,
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PelageError;
    use crate::geometry::{generate_uv_sphere, open_quad_strip, tetrahedron};

    #[test]
    fn tetrahedron_matches_reference_table() {
        let mesh = tetrahedron();
        let adj = build_adjacency(&mesh.vertices, &mesh.indices).unwrap();
        // Every edge of a tetrahedron borders the face missing from the triangle.
        let expected: Vec<u32> = vec![
            0, 3, 1, 3, 2, 3, //
            0, 2, 3, 2, 1, 2, //
            1, 0, 3, 0, 2, 0, //
            2, 1, 3, 1, 0, 1, //
        ];
        assert_eq!(adj, expected);
    }

    #[test]
    fn boundary_edges_fall_back_to_own_vertex() {
        let mesh = open_quad_strip(1);
        let adj = build_adjacency(&mesh.vertices, &mesh.indices).unwrap();
        assert_eq!(adj, vec![0, 0, 1, 3, 2, 2, 1, 1, 3, 3, 2, 0]);
    }

    #[test]
    fn output_is_twice_input_and_in_range() {
        for mesh in [tetrahedron(), generate_uv_sphere(1.0, 20, 20), generate_uv_sphere(0.5, 7, 5), open_quad_strip(6)] {
            let adj = build_adjacency(&mesh.vertices, &mesh.indices).unwrap();
            assert_eq!(adj.len(), mesh.indices.len() * 2);
            assert!(adj.iter().all(|&i| (i as usize) < mesh.vertices.len()));
            // Even positions reproduce the base triangle list.
            let base: Vec<u32> = adj.iter().step_by(2).copied().collect();
            assert_eq!(base, mesh.indices);
        }
    }

    #[test]
    fn sphere_seam_edges_are_the_only_degenerate_neighbours() {
        let (slices, stacks) = (12, 8);
        let mesh = generate_uv_sphere(1.0, slices, stacks);
        let report = analyze_edges(&mesh.indices);
        // The texcoord seam duplicates one column of vertices.
        assert_eq!(report.boundary_edges, 2 * stacks as usize);
        assert_eq!(report.non_manifold_edges, 0);

        let adj = build_adjacency(&mesh.vertices, &mesh.indices).unwrap();
        let degenerate = adj
            .chunks(6)
            .map(|c| {
                let tri = [c[0], c[2], c[4]];
                (0..3).filter(|e| tri.contains(&c[e * 2 + 1])).count()
            })
            .sum::<usize>();
        assert_eq!(degenerate, report.boundary_edges);
    }

    #[test]
    fn tetrahedron_is_closed() {
        let report = analyze_edges(&tetrahedron().indices);
        assert_eq!(report, EdgeReport { edges: 6, boundary_edges: 0, non_manifold_edges: 0 });
        assert!(report.is_closed_manifold());
    }

    #[test]
    fn non_manifold_edge_uses_first_other_triangle() {
        // Three triangles fan around edge 0-1.
        let indices = vec![0, 1, 2, 1, 0, 3, 0, 1, 4];
        let adj = build_adjacency(&[Vertex::default(); 5], &indices).unwrap();
        assert_eq!(adj[1], 3);
        assert_eq!(adj[7], 2);
        assert_eq!(adj[13], 2);
        let report = analyze_edges(&indices);
        assert_eq!(report.non_manifold_edges, 1);
        assert!(!report.is_closed_manifold());
    }

    #[test]
    fn rejects_out_of_range_indices() {
        assert!(matches!(build_adjacency(&[Vertex::default(); 2], &[0, 1, 2]), Err(PelageError::InvalidMesh(_))));
    }
}
