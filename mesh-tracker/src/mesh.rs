use nalgebra::{Point3, Vector2};
use serde::{Deserialize, Serialize};

use crate::{MeshTrackerError, Result};

/// A trimesh with 3-D coordinates and texture coordinates, plus the
/// UV-to-3-D barycentric lifting used to turn texture-space reference points
/// into object points.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TexturedTriMesh {
    indices: Vec<[u32; 3]>,
    coords: Vec<[f64; 3]>,
    /// Texture coordinates in texture pixels.
    uvs: Vec<[f64; 2]>,
}

impl TexturedTriMesh {
    pub fn new(indices: Vec<[u32; 3]>, coords: Vec<[f64; 3]>, uvs: Vec<[f64; 2]>) -> Result<Self> {
        if coords.len() != uvs.len() || indices.is_empty() {
            return Err(MeshTrackerError::InvalidMesh);
        }
        for triangle in &indices {
            if triangle.iter().any(|&i| i as usize >= coords.len()) {
                return Err(MeshTrackerError::InvalidMesh);
            }
        }

        Ok(Self {
            indices,
            coords,
            uvs,
        })
    }

    #[inline]
    pub fn triangle_count(&self) -> usize {
        self.indices.len()
    }

    /// The texture-space corners of a triangle.
    pub fn triangle_uvs(&self, triangle_index: usize) -> [Vector2<f64>; 3] {
        let [a, b, c] = self.indices[triangle_index];
        [
            Vector2::from(self.uvs[a as usize]),
            Vector2::from(self.uvs[b as usize]),
            Vector2::from(self.uvs[c as usize]),
        ]
    }

    /// The 3-D corners of a triangle.
    pub fn triangle_coords(&self, triangle_index: usize) -> [Point3<f64>; 3] {
        let [a, b, c] = self.indices[triangle_index];
        [
            Point3::from(self.coords[a as usize]),
            Point3::from(self.coords[b as usize]),
            Point3::from(self.coords[c as usize]),
        ]
    }

    /// Barycentric coordinates of a texture point within a triangle, if the
    /// point lies inside it (with a small tolerance).
    fn barycentric(&self, triangle_index: usize, uv: &Vector2<f64>) -> Option<(f64, f64, f64)> {
        let [a, b, c] = self.triangle_uvs(triangle_index);

        let v0 = b - a;
        let v1 = c - a;
        let v2 = uv - a;

        let d00 = v0.dot(&v0);
        let d01 = v0.dot(&v1);
        let d11 = v1.dot(&v1);
        let d20 = v2.dot(&v0);
        let d21 = v2.dot(&v1);

        let denominator = d00 * d11 - d01 * d01;
        if denominator.abs() < 1e-12 {
            return None;
        }

        let v = (d11 * d20 - d01 * d21) / denominator;
        let w = (d00 * d21 - d01 * d20) / denominator;
        let u = 1.0 - v - w;

        const TOLERANCE: f64 = 1e-9;
        (u >= -TOLERANCE && v >= -TOLERANCE && w >= -TOLERANCE).then_some((u, v, w))
    }

    /// Lifts a texture point inside a specific triangle onto the mesh
    /// surface.
    pub fn lift_in_triangle(
        &self,
        triangle_index: usize,
        uv: &Vector2<f64>,
    ) -> Option<Point3<f64>> {
        let (u, v, w) = self.barycentric(triangle_index, uv)?;
        let [a, b, c] = self.triangle_coords(triangle_index);
        Some(Point3::from(
            a.coords * u + b.coords * v + c.coords * w,
        ))
    }

    /// Finds the triangle containing a texture point and lifts it.
    pub fn lift(&self, uv: &Vector2<f64>) -> Option<(usize, Point3<f64>)> {
        (0..self.triangle_count())
            .find_map(|index| self.lift_in_triangle(index, uv).map(|point| (index, point)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    /// A unit square in the x/y plane, textured 0..100 pixels.
    fn square() -> TexturedTriMesh {
        TexturedTriMesh::new(
            vec![[0, 1, 2], [0, 2, 3]],
            vec![
                [0.0, 0.0, 0.0],
                [1.0, 0.0, 0.0],
                [1.0, 1.0, 0.0],
                [0.0, 1.0, 0.0],
            ],
            vec![[0.0, 0.0], [100.0, 0.0], [100.0, 100.0], [0.0, 100.0]],
        )
        .unwrap()
    }

    #[test]
    fn lifts_texture_points_onto_surface() {
        let mesh = square();

        let (triangle, point) = mesh.lift(&Vector2::new(50.0, 25.0)).unwrap();
        assert_eq!(triangle, 0);
        assert_relative_eq!(point.x, 0.5);
        assert_relative_eq!(point.y, 0.25);
        assert_relative_eq!(point.z, 0.0);

        let (triangle, point) = mesh.lift(&Vector2::new(25.0, 75.0)).unwrap();
        assert_eq!(triangle, 1);
        assert_relative_eq!(point.x, 0.25);
        assert_relative_eq!(point.y, 0.75);
    }

    #[test]
    fn rejects_points_outside_all_triangles() {
        let mesh = square();
        assert!(mesh.lift(&Vector2::new(150.0, 50.0)).is_none());
    }

    #[test]
    fn validates_mesh_consistency() {
        assert!(TexturedTriMesh::new(
            vec![[0, 1, 9]],
            vec![[0.0; 3], [1.0, 0.0, 0.0]],
            vec![[0.0; 2], [1.0, 0.0]],
        )
        .is_err());
    }
}
