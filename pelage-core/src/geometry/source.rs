//! Mesh import seam. The renderer only needs a `TriangleMesh`; anything that
//! can produce one implements `MeshSource`.

use super::{generate_uv_sphere, TriangleMesh, Vertex};
use crate::error::{PelageError, Result};
use std::collections::HashMap;
use std::path::Path;

pub trait MeshSource {
    fn load(&self, path: &Path) -> Result<TriangleMesh>;
}

/// Minimal Wavefront OBJ reader: `v`, `vt`, `vn` and `f` records. Polygons are
/// fan-triangulated and vertices are shared per unique (v, vt, vn) triple.
#[derive(Debug, Clone, Default)]
pub struct ObjMeshSource {
    /// Uniformly rescale so the farthest vertex sits at this distance from the origin.
    pub fit_radius: Option<f32>,
}

impl ObjMeshSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fit_radius(radius: f32) -> Self {
        Self { fit_radius: Some(radius) }
    }

    pub fn parse_str(&self, content: &str) -> std::result::Result<TriangleMesh, String> {
        let mut positions: Vec<[f32; 3]> = Vec::new();
        let mut normals: Vec<[f32; 3]> = Vec::new();
        let mut uvs: Vec<[f32; 2]> = Vec::new();
        let mut cache: HashMap<(usize, usize, usize), u32> = HashMap::new();
        let mut mesh = TriangleMesh::default();
        let mut has_normals = true;

        for (lineno, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut parts = line.split_whitespace();
            let Some(tag) = parts.next() else { continue };
            let rest: Vec<&str> = parts.collect();
            match tag {
                "v" => positions.push(parse_floats::<3>(&rest, lineno)?),
                "vn" => normals.push(parse_floats::<3>(&rest, lineno)?),
                "vt" => uvs.push(parse_floats::<2>(&rest, lineno)?),
                "f" => {
                    if rest.len() < 3 {
                        return Err(format!("line {}: face with fewer than 3 vertices", lineno + 1));
                    }
                    let corners = rest
                        .iter()
                        .map(|c| parse_corner(c, positions.len(), uvs.len(), normals.len(), lineno))
                        .collect::<std::result::Result<Vec<_>, _>>()?;
                    for i in 1..corners.len() - 1 {
                        for key in [corners[0], corners[i], corners[i + 1]] {
                            let idx = *cache.entry(key).or_insert_with(|| {
                                let (vi, ti, ni) = key;
                                let uv = if ti > 0 { uvs[ti - 1] } else { [0.0, 0.0] };
                                let normal = if ni > 0 { normals[ni - 1] } else { [0.0; 3] };
                                has_normals &= ni > 0;
                                mesh.vertices.push(Vertex::new(positions[vi - 1], normal, uv));
                                mesh.vertices.len() as u32 - 1
                            });
                            mesh.indices.push(idx);
                        }
                    }
                }
                // groups, materials and smoothing flags carry nothing we render
                _ => {}
            }
        }

        if !has_normals {
            compute_vertex_normals(&mut mesh);
        }
        if let Some(radius) = self.fit_radius {
            fit_to_radius(&mut mesh, radius);
        }
        Ok(mesh)
    }
}

impl MeshSource for ObjMeshSource {
    fn load(&self, path: &Path) -> Result<TriangleMesh> {
        let asset_err = |reason: String| PelageError::AssetLoad { path: path.display().to_string(), reason };
        let content = std::fs::read_to_string(path).map_err(|e| asset_err(e.to_string()))?;
        let mesh = self.parse_str(&content).map_err(asset_err)?;
        log::info!(
            "loaded {}: {} vertices, {} triangles",
            path.display(),
            mesh.vertices.len(),
            mesh.triangle_count()
        );
        Ok(mesh)
    }
}

fn parse_floats<const N: usize>(fields: &[&str], lineno: usize) -> std::result::Result<[f32; N], String> {
    if fields.len() < N {
        return Err(format!("line {}: expected {} components", lineno + 1, N));
    }
    let mut out = [0.0f32; N];
    for (o, f) in out.iter_mut().zip(fields) {
        *o = f.parse().map_err(|_| format!("line {}: bad number '{}'", lineno + 1, f))?;
    }
    Ok(out)
}

// Resolves one `v/vt/vn` corner to 1-based indices (0 = absent). Negative
// indices count back from the end of the list.
fn parse_corner(
    corner: &str,
    nv: usize,
    nt: usize,
    nn: usize,
    lineno: usize,
) -> std::result::Result<(usize, usize, usize), String> {
    let resolve = |field: Option<&str>, len: usize, required: bool| -> std::result::Result<usize, String> {
        match field.filter(|s| !s.is_empty()) {
            None if required => Err(format!("line {}: face corner '{}' has no position", lineno + 1, corner)),
            None => Ok(0),
            Some(s) => {
                let raw: i64 = s.parse().map_err(|_| format!("line {}: bad index '{}'", lineno + 1, s))?;
                let idx = if raw < 0 { len as i64 + raw + 1 } else { raw };
                if idx < 1 || idx as usize > len {
                    return Err(format!("line {}: index {} out of range", lineno + 1, raw));
                }
                Ok(idx as usize)
            }
        }
    };
    let mut fields = corner.split('/');
    let v = resolve(fields.next(), nv, true)?;
    let t = resolve(fields.next(), nt, false)?;
    let n = resolve(fields.next(), nn, false)?;
    Ok((v, t, n))
}

fn compute_vertex_normals(mesh: &mut TriangleMesh) {
    let mut acc = vec![glam::Vec3::ZERO; mesh.vertices.len()];
    for tri in mesh.indices.chunks_exact(3) {
        let [a, b, c] = [tri[0] as usize, tri[1] as usize, tri[2] as usize];
        let pa = glam::Vec3::from(mesh.vertices[a].pos);
        let n = (glam::Vec3::from(mesh.vertices[b].pos) - pa).cross(glam::Vec3::from(mesh.vertices[c].pos) - pa);
        for i in [a, b, c] {
            acc[i] += n;
        }
    }
    for (v, n) in mesh.vertices.iter_mut().zip(acc) {
        v.normal = n.normalize_or_zero().to_array();
    }
}

fn fit_to_radius(mesh: &mut TriangleMesh, radius: f32) {
    let extent = mesh
        .vertices
        .iter()
        .map(|v| glam::Vec3::from(v.pos).length())
        .fold(0.0f32, f32::max);
    if extent <= f32::EPSILON {
        return;
    }
    let s = radius / extent;
    for v in &mut mesh.vertices {
        v.pos = (glam::Vec3::from(v.pos) * s).to_array();
    }
}

/// Load through `source`; a failed or empty load is replaced by a unit sphere.
pub fn load_or_fallback(source: &dyn MeshSource, path: &Path) -> TriangleMesh {
    match source.load(path) {
        Ok(mesh) if !mesh.is_empty() => mesh,
        Ok(_) => {
            log::warn!("{} produced an empty mesh, falling back to sphere", path.display());
            generate_uv_sphere(1.0, 20, 20)
        }
        Err(e) => {
            log::warn!("{}; falling back to sphere", e);
            generate_uv_sphere(1.0, 20, 20)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const QUAD: &str = "\
# unit quad
v 0 0 0
v 1 0 0
v 1 1 0
v 0 1 0
vt 0 0
vt 1 0
vt 1 1
vt 0 1
vn 0 0 1
f 1/1/1 2/2/1 3/3/1 4/4/1
";

    #[test]
    fn quad_is_fan_triangulated() {
        let mesh = ObjMeshSource::new().parse_str(QUAD).unwrap();
        assert_eq!(mesh.vertices.len(), 4);
        assert_eq!(mesh.indices, vec![0, 1, 2, 0, 2, 3]);
        assert_eq!(mesh.vertices[2].uv, [1.0, 1.0]);
        assert_eq!(mesh.vertices[0].normal, [0.0, 0.0, 1.0]);
    }

    #[test]
    fn shared_corners_are_deduplicated() {
        let src = "v 0 0 0\nv 1 0 0\nv 0 1 0\nv 1 1 0\nf 1 2 3\nf 3 2 4\n";
        let mesh = ObjMeshSource::new().parse_str(src).unwrap();
        assert_eq!(mesh.vertices.len(), 4);
        assert_eq!(mesh.indices, vec![0, 1, 2, 2, 1, 3]);
        // No vn records: normals are derived from the faces.
        assert!((mesh.vertices[0].normal[2] - 1.0).abs() < 1e-5);
    }

    #[test]
    fn negative_indices_and_fit_radius() {
        let src = "v 2 0 0\nv 0 2 0\nv 0 0 2\nf -3 -2 -1\n";
        let mesh = ObjMeshSource::with_fit_radius(1.0).parse_str(src).unwrap();
        assert_eq!(mesh.indices, vec![0, 1, 2]);
        assert!((mesh.vertices[0].pos[0] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn malformed_faces_are_errors() {
        assert!(ObjMeshSource::new().parse_str("v 0 0 0\nf 1 2 3\n").is_err());
        assert!(ObjMeshSource::new().parse_str("v 0 0 x\n").is_err());
    }

    struct Empty;
    impl MeshSource for Empty {
        fn load(&self, _: &Path) -> Result<TriangleMesh> {
            Ok(TriangleMesh::default())
        }
    }

    #[test]
    fn missing_or_empty_meshes_fall_back_to_sphere() {
        let sphere = generate_uv_sphere(1.0, 20, 20);
        let missing = load_or_fallback(&ObjMeshSource::new(), Path::new("/nonexistent/fur.obj"));
        assert_eq!(missing, sphere);
        assert_eq!(load_or_fallback(&Empty, Path::new("any")), sphere);
    }

    #[test]
    fn missing_file_is_a_recoverable_asset_error() {
        let err = ObjMeshSource::new().load(Path::new("/nonexistent/fur.obj")).unwrap_err();
        assert!(!err.is_fatal());
    }
}
