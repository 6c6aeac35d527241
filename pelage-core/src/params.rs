//! Per-frame uniform data and the fur controls.
//!
//! Matrices are stored column-major, which is what both glam and std140
//! `mat4` expect. Projections follow the left-handed, depth 0..1 convention.

use crate::config::SceneConfig;
use crate::error::{PelageError, Result};
use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3};
use serde::{Deserialize, Serialize};

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct FrameParams {
    pub view_proj: [[f32; 4]; 4],
    pub world: [[f32; 4]; 4],
    pub camera_pos: [f32; 3],
    pub time: f32,
    pub gravity: [f32; 3],
    pub wind_strength: f32,
    pub wind_direction: [f32; 3],
    pub _pad: f32,
    pub light_view_proj: [[f32; 4]; 4],
}

/// Camera and light instances for one frame, both derived from `sim_time`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameUniforms {
    pub camera: FrameParams,
    pub light: FrameParams,
}

impl FrameUniforms {
    pub fn compute(scene: &SceneConfig, aspect: f32, sim_time: f32) -> Self {
        let angle = sim_time * scene.orbit_speed;
        let eye = Vec3::new(
            scene.camera_radius * angle.cos(),
            scene.camera_height,
            scene.camera_radius * angle.sin(),
        );
        let view = Mat4::look_at_lh(eye, Vec3::ZERO, Vec3::Y);
        let proj = Mat4::perspective_lh(scene.fov_y_deg.to_radians(), aspect, scene.near, scene.far);

        let light_pos = Vec3::from(scene.light_position);
        let half = scene.light_extent * 0.5;
        let light_view = Mat4::look_at_lh(light_pos, Vec3::ZERO, Vec3::Y);
        let light_proj = Mat4::orthographic_lh(-half, half, -half, half, scene.light_near, scene.light_far);
        let light_view_proj = light_proj * light_view;

        let world = Mat4::from_rotation_x(scene.world_rotation_x_deg.to_radians());

        let camera = FrameParams {
            view_proj: (proj * view).to_cols_array_2d(),
            world: world.to_cols_array_2d(),
            camera_pos: eye.to_array(),
            time: sim_time,
            gravity: scene.gravity,
            wind_strength: scene.wind_strength,
            wind_direction: scene.wind_direction,
            _pad: 0.0,
            light_view_proj: light_view_proj.to_cols_array_2d(),
        };
        let light = FrameParams {
            view_proj: camera.light_view_proj,
            camera_pos: scene.light_position,
            ..camera
        };
        Self { camera, light }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FurParams {
    pub fur_length: f32,
    pub shell_count: u32,
    pub density: f32,
    pub thickness: f32,
    pub color: [f32; 3],
}

impl Default for FurParams {
    fn default() -> Self {
        // short, dense carpet pile
        Self { fur_length: 0.04, shell_count: 48, density: 120.0, thickness: 0.85, color: [0.85, 0.82, 0.78] }
    }
}

impl FurParams {
    pub fn validate(&self) -> Result<()> {
        let bad = |msg: String| Err(PelageError::InvalidParameter(msg));
        if self.fur_length <= 0.0 || !self.fur_length.is_finite() {
            return bad(format!("fur_length must be positive (got {})", self.fur_length));
        }
        if self.shell_count == 0 {
            return bad("shell_count must be at least 1".into());
        }
        if self.density <= 0.0 || !self.density.is_finite() {
            return bad(format!("density must be positive (got {})", self.density));
        }
        if !(0.0..=1.0).contains(&self.thickness) {
            return bad(format!("thickness must be in [0, 1] (got {})", self.thickness));
        }
        if self.color.iter().any(|c| !(0.0..=1.0).contains(c)) {
            return bad(format!("color components must be in [0, 1] (got {:?})", self.color));
        }
        Ok(())
    }

    pub fn uniform(&self) -> FurUniform {
        FurUniform {
            fur_length: self.fur_length,
            shell_count: self.shell_count,
            density: self.density,
            thickness: self.thickness,
            color: self.color,
            _pad: 0.0,
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct FurUniform {
    pub fur_length: f32,
    pub shell_count: u32,
    pub density: f32,
    pub thickness: f32,
    pub color: [f32; 3],
    pub _pad: f32,
}
