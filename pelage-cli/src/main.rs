use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pelage_core::config::{self, RendererConfig};
use pelage_core::density::generate_density;
use pelage_core::geometry::{analyze_edges, load_or_fallback, ObjMeshSource, TriangleMesh};
use pelage_core::gpu::RecordingDevice;
use pelage_core::render::FurRenderer;
use pelage_core::VERSION;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "pelage", version = VERSION, about = "Shell-and-fin fur renderer")]
struct Cli {
    /// Renderer configuration (YAML); defaults apply when omitted
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// OBJ mesh; falls back to a unit sphere if it cannot be loaded
    #[arg(long, global = true, default_value = "assets/model.obj")]
    mesh: PathBuf,
    /// Rescale the loaded mesh to fit a sphere of this radius
    #[arg(long, global = true)]
    fit_radius: Option<f32>,
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print mesh statistics and edge topology
    Inspect,
    /// Generate the fur density field and write it as a grayscale PNG
    Density {
        #[arg(long, default_value = "density.png")]
        out: PathBuf,
    },
    /// Record frames through the headless backend and dump them as JSON
    Trace {
        #[arg(long, default_value_t = 1)]
        frames: u32,
        /// Include the full command stream of each frame
        #[arg(long)]
        commands: bool,
    },
    /// List Vulkan devices (requires --features vulkan)
    #[cfg(feature = "vulkan")]
    VkInfo,
    /// Render frames offscreen and write the last back buffer as PNG
    #[cfg(feature = "vulkan")]
    Render {
        #[arg(long, default_value_t = 1)]
        frames: u32,
        /// Seconds of simulation time between frames
        #[arg(long, default_value_t = 1.0 / 60.0)]
        dt: f32,
        #[arg(long, default_value = "fur.png")]
        out: PathBuf,
    },
}

fn load_config(path: Option<&PathBuf>) -> Result<RendererConfig> {
    let cfg = match path {
        Some(p) => config::load_from_path(p)?,
        None => RendererConfig::default(),
    };
    cfg.validate()?;
    Ok(cfg)
}

fn load_mesh(path: &PathBuf, fit_radius: Option<f32>) -> TriangleMesh {
    let source = match fit_radius {
        Some(r) => ObjMeshSource::with_fit_radius(r),
        None => ObjMeshSource::new(),
    };
    load_or_fallback(&source, path)
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    let cfg = load_config(cli.config.as_ref())?;
    match cli.cmd {
        Command::Inspect => {
            let mesh = load_mesh(&cli.mesh, cli.fit_radius);
            mesh.validate()?;
            let report = analyze_edges(&mesh.indices);
            println!("Mesh: {}", cli.mesh.display());
            println!("  vertices: {}", mesh.vertices.len());
            println!("  triangles: {}", mesh.triangle_count());
            println!(
                "  edges: {} ({} boundary, {} non-manifold)",
                report.edges, report.boundary_edges, report.non_manifold_edges
            );
            println!("  adjacency indices: {}", mesh.triangle_count() * 6);
        }
        Command::Density { out } => {
            let d = &cfg.density;
            let field = generate_density(d.size, d.size, d.cells, d.seed)?;
            let img = image::GrayImage::from_raw(field.width, field.height, field.to_luma8())
                .ok_or_else(|| anyhow::anyhow!("Failed to create image from density field"))?;
            img.save(&out).with_context(|| format!("writing {}", out.display()))?;
            println!("Wrote {}x{} density field ({} cells, seed {}) to {}", d.size, d.size, d.cells, d.seed, out.display());
        }
        Command::Trace { frames, commands } => {
            let mesh = load_mesh(&cli.mesh, cli.fit_radius);
            let dt = 1.0 / 60.0;
            let mut renderer = FurRenderer::new(RecordingDevice::new(), &mesh, cfg)?;
            let mut out = Vec::new();
            for i in 0..frames {
                let stats = renderer.render_frame(i as f32 * dt)?;
                let mut entry = serde_json::json!({ "stats": stats });
                if commands {
                    if let Some(stream) = renderer.device().last_stream() {
                        entry["stream"] = serde_json::to_value(stream)?;
                    }
                }
                out.push(entry);
            }
            renderer.shutdown()?;
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        #[cfg(feature = "vulkan")]
        Command::VkInfo => {
            let list = pelage_core::gpu::vk::enumerate_devices()?;
            if list.is_empty() {
                println!("No Vulkan devices found");
            }
            for (i, d) in list.iter().enumerate() {
                println!("[{}] {}", i, d);
            }
        }
        #[cfg(feature = "vulkan")]
        Command::Render { frames, dt, out } => {
            use pelage_core::gpu::vk::VulkanDevice;
            let mesh = load_mesh(&cli.mesh, cli.fit_radius);
            let (width, height) = (cfg.width, cfg.height);
            let device = VulkanDevice::new("pelage-render", cfg.shadow_map_count)?;
            let mut renderer = FurRenderer::new(device, &mesh, cfg)?;
            for i in 0..frames.max(1) {
                let stats = renderer.render_frame(i as f32 * dt)?;
                log::debug!("{:?}", stats);
            }
            renderer.shutdown()?;
            let back = renderer
                .last_presented()
                .ok_or_else(|| anyhow::anyhow!("no frame was presented"))?;
            let pixels = renderer.device_mut().read_texture(back)?;
            let img = image::RgbaImage::from_raw(width, height, pixels)
                .ok_or_else(|| anyhow::anyhow!("Failed to create image from raw"))?;
            img.save(&out).with_context(|| format!("writing {}", out.display()))?;
            println!("Wrote {}x{} image to {}", width, height, out.display());
        }
    }
    Ok(())
}
