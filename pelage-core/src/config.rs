use crate::error::{PelageError, Result};
use crate::params::FurParams;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RendererConfig {
    pub width: u32,
    pub height: u32,
    pub msaa_samples: u32,
    pub back_buffer_count: u32,
    pub frames_in_flight: u32,
    pub shadow_map_size: u32,
    pub shadow_map_count: u32,
    pub background: [f32; 4],
    pub sync_timeout_ms: u64,
    pub density: DensityConfig,
    pub fur: FurParams,
    pub scene: SceneConfig,
    pub shaders: ShaderPaths,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            msaa_samples: 4,
            back_buffer_count: 2,
            frames_in_flight: 2,
            shadow_map_size: 1024,
            shadow_map_count: 4,
            background: [0.0, 0.2, 0.4, 1.0],
            sync_timeout_ms: 5_000,
            density: DensityConfig::default(),
            fur: FurParams::default(),
            scene: SceneConfig::default(),
            shaders: ShaderPaths::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DensityConfig {
    pub size: u32,
    pub cells: u32,
    pub seed: u64,
}

impl Default for DensityConfig {
    fn default() -> Self {
        Self { size: crate::density::DEFAULT_SIZE, cells: crate::density::DEFAULT_CELLS, seed: 0 }
    }
}

/// Camera orbit, light placement and the forces fed to the fur shaders.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SceneConfig {
    pub camera_radius: f32,
    pub camera_height: f32,
    pub orbit_speed: f32,
    pub fov_y_deg: f32,
    pub near: f32,
    pub far: f32,
    pub light_position: [f32; 3],
    pub light_extent: f32,
    pub light_near: f32,
    pub light_far: f32,
    pub world_rotation_x_deg: f32,
    pub gravity: [f32; 3],
    pub wind_strength: f32,
    pub wind_direction: [f32; 3],
}

impl Default for SceneConfig {
    fn default() -> Self {
        Self {
            camera_radius: 15.0,
            camera_height: 5.0,
            orbit_speed: 0.5,
            fov_y_deg: 45.0,
            near: 0.1,
            far: 100.0,
            light_position: [15.0, 15.0, -15.0],
            light_extent: 25.0,
            light_near: 0.1,
            light_far: 50.0,
            world_rotation_x_deg: 90.0,
            gravity: [0.0, -2.5, 0.0],
            wind_strength: 0.2,
            wind_direction: [1.0, 0.0, 0.0],
        }
    }
}

/// Precompiled SPIR-V for each stage. Paths are relative to the working directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShaderPaths {
    pub shell_vert: PathBuf,
    pub shell_frag: PathBuf,
    pub fin_vert: PathBuf,
    pub fin_geom: PathBuf,
    pub osm_frag: PathBuf,
}

impl Default for ShaderPaths {
    fn default() -> Self {
        let p = |name: &str| PathBuf::from("assets/shaders").join(name);
        Self {
            shell_vert: p("shell.vert.spv"),
            shell_frag: p("shell.frag.spv"),
            fin_vert: p("fin.vert.spv"),
            fin_geom: p("fin.geom.spv"),
            osm_frag: p("osm.frag.spv"),
        }
    }
}

impl RendererConfig {
    pub fn validate(&self) -> Result<()> {
        let bad = |msg: String| Err(PelageError::InvalidParameter(msg));
        if self.width == 0 || self.height == 0 {
            return bad(format!("surface size {}x{} must be non-zero", self.width, self.height));
        }
        if !matches!(self.msaa_samples, 1 | 2 | 4 | 8) {
            return bad(format!("msaa_samples must be 1, 2, 4 or 8 (got {})", self.msaa_samples));
        }
        if self.back_buffer_count == 0 {
            return bad("back_buffer_count must be at least 1".into());
        }
        if !(1..=3).contains(&self.frames_in_flight) {
            return bad(format!("frames_in_flight must be in 1..=3 (got {})", self.frames_in_flight));
        }
        if self.shadow_map_size == 0 || !(1..=8).contains(&self.shadow_map_count) {
            return bad(format!(
                "shadow maps: size {} count {} (count must be in 1..=8)",
                self.shadow_map_size, self.shadow_map_count
            ));
        }
        if self.density.size == 0 || !(1..=crate::density::MAX_CELLS).contains(&self.density.cells) {
            return bad(format!(
                "density size {} must be non-zero and cells {} in 1..={}",
                self.density.size,
                self.density.cells,
                crate::density::MAX_CELLS
            ));
        }
        self.fur.validate()
    }

    pub fn aspect(&self) -> f32 {
        self.width as f32 / self.height as f32
    }
}

pub fn load_from_yaml_str(s: &str) -> anyhow::Result<RendererConfig> {
    let cfg: RendererConfig = serde_yaml::from_str(s)?;
    cfg.validate()?;
    Ok(cfg)
}

pub fn load_from_path<P: AsRef<std::path::Path>>(path: P) -> anyhow::Result<RendererConfig> {
    let data = std::fs::read_to_string(path)?;
    load_from_yaml_str(&data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_round_trip_through_yaml() {
        let cfg = RendererConfig::default();
        let text = serde_yaml::to_string(&cfg).unwrap();
        let back = load_from_yaml_str(&text).unwrap();
        assert_eq!(back, cfg);
    }

    #[test]
    fn partial_documents_fill_in_defaults() {
        let cfg = load_from_yaml_str("width: 640\nfur:\n  shell_count: 16\ndensity:\n  seed: 9\n").unwrap();
        assert_eq!(cfg.width, 640);
        assert_eq!(cfg.height, 720);
        assert_eq!(cfg.fur.shell_count, 16);
        assert_eq!(cfg.fur.fur_length, FurParams::default().fur_length);
        assert_eq!(cfg.density.seed, 9);
        assert_eq!(cfg.density.cells, 32);
        assert_eq!(cfg.scene.camera_radius, 15.0);
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        assert!(load_from_yaml_str("frames_in_flight: 4\n").is_err());
        assert!(load_from_yaml_str("msaa_samples: 3\n").is_err());
        assert!(load_from_yaml_str("fur:\n  shell_count: 0\n").is_err());
        assert!(load_from_yaml_str("shadow_map_count: 0\n").is_err());
        assert!(load_from_yaml_str("density:\n  cells: 70000\n").is_err());
        assert!(load_from_yaml_str("density:\n  cells: 0\n").is_err());
    }

    #[test]
    fn shipped_config_parses() {
        let cfg = load_from_yaml_str(include_str!("../../assets/pelage.yaml")).unwrap();
        assert_eq!(cfg.density.seed, 1337);
        assert_eq!(cfg.shadow_map_count, 4);
        assert_eq!(cfg.fur.shell_count, 48);
    }
}
