use super::passes::{self, PassContext};
use super::programs::FurPrograms;
use super::resources::FrameResourceSet;
use crate::config::RendererConfig;
use crate::density::generate_density;
use crate::error::{PelageError, Result};
use crate::geometry::{analyze_edges, TriangleMesh};
use crate::gpu::{CommandRecorder, CommandStream, GpuDevice, ResourceState, ResourceTracker, TextureId};
use crate::params::{FrameUniforms, FurParams};
use crate::sync::FrameSynchronizer;
use serde::Serialize;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FrameStats {
    pub frame_index: u64,
    pub back_buffer: usize,
    pub slot: usize,
    pub fence_value: u64,
    pub draw_calls: usize,
    pub instances: u64,
    pub barriers: usize,
}

impl FrameStats {
    fn from_stream(stream: &CommandStream) -> Self {
        let (draw_calls, instances) =
            stream.draws().fold((0usize, 0u64), |(n, i), (_, inst)| (n + 1, i + inst as u64));
        Self {
            frame_index: 0,
            back_buffer: 0,
            slot: 0,
            fence_value: 0,
            draw_calls,
            instances,
            barriers: stream.barrier_count(),
        }
    }
}

/// Owns the device and drives the shadow, main and resolve passes each frame.
pub struct FurRenderer<D: GpuDevice> {
    device: D,
    config: RendererConfig,
    resources: FrameResourceSet,
    programs: FurPrograms,
    tracker: ResourceTracker,
    sync: FrameSynchronizer,
    fur: FurParams,
    frame_index: u64,
    back_buffer: usize,
}

impl<D: GpuDevice> FurRenderer<D> {
    pub fn new(mut device: D, mesh: &TriangleMesh, config: RendererConfig) -> Result<Self> {
        config.validate()?;
        if mesh.is_empty() {
            return Err(PelageError::InvalidMesh("mesh has no vertices or triangles".into()));
        }
        let report = analyze_edges(&mesh.indices);
        if report.non_manifold_edges > 0 {
            log::warn!(
                "mesh has {} non-manifold edges; fins use the first neighbouring triangle",
                report.non_manifold_edges
            );
        }

        let density = generate_density(config.density.size, config.density.size, config.density.cells, config.density.seed)?;
        let mut tracker = ResourceTracker::new();
        let resources = FrameResourceSet::create(&mut device, &mut tracker, mesh, &density, &config)?;
        let programs = FurPrograms::create(&mut device, &config)?;
        let mut sync = FrameSynchronizer::new(
            config.frames_in_flight as usize,
            Duration::from_millis(config.sync_timeout_ms),
        )?;

        let mut rec = CommandRecorder::new("startup", &tracker);
        passes::record_startup(&mut rec, &resources.statics)?;
        let (stream, committed) = rec.finish();
        let upload_list = device.create_command_list()?;
        device.submit(upload_list, &stream)?;
        tracker = committed;
        sync.flush(&mut device)?;

        log::info!(
            "fur renderer ready: {}x{}, {} frames in flight, {} shells",
            config.width,
            config.height,
            config.frames_in_flight,
            config.fur.shell_count
        );
        let fur = config.fur;
        Ok(Self { device, config, resources, programs, tracker, sync, fur, frame_index: 0, back_buffer: 0 })
    }

    /// Record, submit and present one frame for simulation time `sim_time` (seconds).
    pub fn render_frame(&mut self, sim_time: f32) -> Result<FrameStats> {
        let slot_index = (self.frame_index % self.sync.frames_in_flight() as u64) as usize;
        let slot = self.resources.slots[slot_index];
        self.sync.wait_slot(&mut self.device, slot_index)?;

        let uniforms = FrameUniforms::compute(&self.config.scene, self.config.aspect(), sim_time);
        self.device.write_buffer(slot.camera, 0, bytemuck::bytes_of(&uniforms.camera))?;
        self.device.write_buffer(slot.light, 0, bytemuck::bytes_of(&uniforms.light))?;
        self.device.write_buffer(slot.fur, 0, bytemuck::bytes_of(&self.fur.uniform()))?;

        let back_buffer = self.resources.statics.back_buffers[self.back_buffer];
        let ctx = PassContext {
            statics: &self.resources.statics,
            slot: &slot,
            programs: &self.programs,
            shell_count: self.fur.shell_count,
            width: self.config.width,
            height: self.config.height,
            background: self.config.background,
        };
        let mut rec = CommandRecorder::new(format!("frame {}", self.frame_index), &self.tracker);
        passes::record_shadow_pass(&mut rec, &ctx)?;
        passes::record_main_pass(&mut rec, &ctx)?;
        passes::record_resolve_pass(&mut rec, &ctx, back_buffer)?;
        let (stream, committed) = rec.finish();

        self.device.submit(slot.list, &stream)?;
        self.tracker = committed;
        self.tracker.require(back_buffer, ResourceState::Presentable)?;
        self.device.present(back_buffer)?;

        let fence_value = if self.sync.frames_in_flight() == 1 {
            self.sync.flush(&mut self.device)?
        } else {
            self.sync.signal_slot(&mut self.device, slot_index)?
        };

        let stats = FrameStats {
            frame_index: self.frame_index,
            back_buffer: self.back_buffer,
            slot: slot_index,
            fence_value,
            ..FrameStats::from_stream(&stream)
        };
        log::debug!(
            "frame {} slot {} back buffer {}: {} draws, {} instances, {} barriers, fence {}",
            stats.frame_index,
            stats.slot,
            stats.back_buffer,
            stats.draw_calls,
            stats.instances,
            stats.barriers,
            stats.fence_value
        );

        self.back_buffer = (self.back_buffer + 1) % self.resources.statics.back_buffers.len();
        self.frame_index += 1;
        Ok(stats)
    }

    /// Takes effect on the next frame's upload.
    pub fn set_fur_params(&mut self, params: FurParams) -> Result<()> {
        params.validate()?;
        self.fur = params;
        Ok(())
    }

    pub fn fur_params(&self) -> &FurParams {
        &self.fur
    }

    /// The output surface is fixed at creation.
    pub fn resize(&mut self, _width: u32, _height: u32) -> Result<()> {
        Err(PelageError::Unsupported("resizing the output surface"))
    }

    /// Drain the queue. Call before dropping the device.
    pub fn shutdown(&mut self) -> Result<()> {
        self.sync.shutdown(&mut self.device)
    }

    pub fn config(&self) -> &RendererConfig {
        &self.config
    }

    pub fn resources(&self) -> &FrameResourceSet {
        &self.resources
    }

    pub fn resource_state(&self, texture: TextureId) -> Result<ResourceState> {
        self.tracker.state(texture)
    }

    /// Back buffer holding the most recently presented frame.
    pub fn last_presented(&self) -> Option<TextureId> {
        let bbs = &self.resources.statics.back_buffers;
        (self.frame_index > 0).then(|| bbs[(self.back_buffer + bbs.len() - 1) % bbs.len()])
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    pub fn into_device(self) -> D {
        self.device
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{generate_uv_sphere, open_quad_strip, tetrahedron};
    use crate::gpu::{Command, RecordingDevice, Timeline};
    use crate::params::FurUniform;

    fn small_config() -> RendererConfig {
        let mut cfg = RendererConfig::default();
        cfg.width = 64;
        cfg.height = 48;
        cfg.shadow_map_size = 32;
        cfg.density.size = 32;
        cfg.density.cells = 4;
        cfg.density.seed = 1234;
        cfg.fur = FurParams { shell_count: 4, fur_length: 0.1, ..Default::default() };
        cfg
    }

    fn renderer(cfg: RendererConfig) -> FurRenderer<RecordingDevice> {
        FurRenderer::new(RecordingDevice::new(), &tetrahedron(), cfg).unwrap()
    }

    #[test]
    fn tetrahedron_frame_issues_expected_draws() {
        let mut r = renderer(small_config());
        let stats = r.render_frame(0.0).unwrap();
        let programs = r.programs;
        let stream = r.device().last_stream().unwrap().clone();

        let mut current = None;
        let mut shell_instances = 0;
        let mut fin_draws = 0;
        let mut shadow_instances = 0;
        for c in &stream.commands {
            match c {
                Command::BindProgram(p) => current = Some(*p),
                Command::DrawIndexed { index_count, instance_count } => match current {
                    Some(p) if p == programs.shell => {
                        assert_eq!(*index_count, 12);
                        shell_instances += instance_count;
                    }
                    Some(p) if p == programs.fin => {
                        assert_eq!((*index_count, *instance_count), (24, 1));
                        fin_draws += 1;
                    }
                    Some(p) if p == programs.shadow => shadow_instances += instance_count,
                    other => panic!("draw with program {:?}", other),
                },
                _ => {}
            }
        }
        assert_eq!(shell_instances, 4);
        assert_eq!(fin_draws, 1);
        assert_eq!(shadow_instances, 4);
        assert_eq!(stats.draw_calls, 3);
        assert_eq!(stats.instances, 9);
    }

    #[test]
    fn shadow_targets_are_cleared_and_written_before_main_pass() {
        let mut r = renderer(small_config());
        r.render_frame(0.5).unwrap();
        let shadows = r.resources().statics.shadow_maps.clone();
        let msaa = r.resources().statics.msaa_target;
        let stream = &r.device().last_stream().unwrap().commands;

        let main_start = stream
            .iter()
            .position(|c| matches!(c, Command::Barrier(ts) if ts.iter().any(|t| t.texture == msaa)))
            .unwrap();
        let shadow_part = &stream[..main_start];
        let cleared: Vec<_> = shadow_part
            .iter()
            .filter_map(|c| match c {
                Command::ClearColor { target, color } => Some((*target, *color)),
                _ => None,
            })
            .collect();
        assert_eq!(cleared, shadows.iter().map(|&t| (t, [0.0; 4])).collect::<Vec<_>>());
        assert!(shadow_part.iter().any(|c| matches!(c, Command::SetRenderTargets { targets, .. } if *targets == shadows)));
        assert!(shadow_part.iter().any(|c| matches!(c, Command::DrawIndexed { .. })));
        // Main pass samples the shadow maps only after they are readable again.
        let last_shadow_barrier = shadow_part.iter().rposition(|c| matches!(c, Command::Barrier(_))).unwrap();
        match &shadow_part[last_shadow_barrier] {
            Command::Barrier(ts) => assert!(ts.iter().all(|t| t.to == ResourceState::ShaderReadable)),
            _ => unreachable!(),
        }
    }

    #[test]
    fn back_buffers_alternate_and_end_presentable() {
        let mut r = renderer(small_config());
        let bbs = r.resources().statics.back_buffers.clone();
        let order: Vec<usize> = (0..5).map(|i| r.render_frame(i as f32 * 0.016).unwrap().back_buffer).collect();
        assert_eq!(order, vec![0, 1, 0, 1, 0]);
        assert_eq!(r.device().presents, vec![bbs[0], bbs[1], bbs[0], bbs[1], bbs[0]]);
        for &bb in &bbs {
            assert_eq!(r.resource_state(bb).unwrap(), ResourceState::Presentable);
        }
        assert_eq!(r.resource_state(r.resources().statics.msaa_target).unwrap(), ResourceState::ResolveSource);
        assert_eq!(r.last_presented(), Some(bbs[0]));
    }

    #[test]
    fn ring_waits_before_reusing_a_slot() {
        let mut r = renderer(small_config());
        let waits_after_startup = r.device().blocking_waits;
        let s0 = r.render_frame(0.0).unwrap();
        let s1 = r.render_frame(0.1).unwrap();
        assert_eq!((s0.slot, s1.slot), (0, 1));
        assert_eq!(r.device().blocking_waits, waits_after_startup);
        // Slot 0 is reused here; the recording device rejects reuse of an in-flight list.
        let s2 = r.render_frame(0.2).unwrap();
        assert_eq!(s2.slot, 0);
        assert_eq!(r.device().blocking_waits, waits_after_startup + 1);
        assert!(r.device().completed_value().unwrap() >= s0.fence_value);
        assert!(s2.fence_value > s1.fence_value);
    }

    #[test]
    fn single_frame_in_flight_flushes_every_frame() {
        let mut cfg = small_config();
        cfg.frames_in_flight = 1;
        let mut r = renderer(cfg);
        for i in 0..3 {
            let stats = r.render_frame(i as f32).unwrap();
            assert_eq!(stats.slot, 0);
            assert_eq!(r.device().completed_value().unwrap(), stats.fence_value);
        }
    }

    #[test]
    fn fur_changes_apply_on_next_upload() {
        let mut r = renderer(small_config());
        r.render_frame(0.0).unwrap();
        let next = FurParams { shell_count: 7, fur_length: 0.3, ..Default::default() };
        r.set_fur_params(next).unwrap();
        assert!(r.set_fur_params(FurParams { shell_count: 0, ..next }).is_err());
        let stats = r.render_frame(0.1).unwrap();
        let fur_buf = r.resources().slots[stats.slot].fur;
        let uploaded: FurUniform = bytemuck::pod_read_unaligned(r.device().buffer_contents(fur_buf).unwrap());
        assert_eq!(uploaded.shell_count, 7);
        assert_eq!(uploaded.fur_length, 0.3);
        assert_eq!(stats.instances, 7 + 1 + 7);
    }

    #[test]
    fn timed_out_frame_leaves_states_untouched() {
        let mut r = renderer(small_config());
        r.render_frame(0.0).unwrap();
        r.render_frame(0.1).unwrap();
        r.device_mut().stall();
        let msaa = r.resources().statics.msaa_target;
        let err = r.render_frame(0.2).unwrap_err();
        assert!(matches!(err, PelageError::SyncTimeout { .. }));
        assert_eq!(r.resource_state(msaa).unwrap(), ResourceState::ResolveSource);
    }

    #[test]
    fn startup_uploads_density_and_settles_states() {
        let r = renderer(small_config());
        let s = &r.resources().statics;
        for &t in s.shadow_maps.iter().chain([s.density].iter()) {
            assert_eq!(r.resource_state(t).unwrap(), ResourceState::ShaderReadable);
        }
        let startup = &r.device().submissions[0].stream;
        assert!(startup
            .commands
            .iter()
            .any(|c| matches!(c, Command::CopyBufferToTexture { dst, .. } if *dst == s.density)));
        assert!(r.device().presents.is_empty());
    }

    #[test]
    fn open_and_fallback_meshes_render() {
        for mesh in [open_quad_strip(4), generate_uv_sphere(1.0, 20, 20)] {
            let mut r = FurRenderer::new(RecordingDevice::new(), &mesh, small_config()).unwrap();
            let stats = r.render_frame(1.0).unwrap();
            assert_eq!(stats.draw_calls, 3);
            r.shutdown().unwrap();
        }
    }

    #[test]
    fn resize_is_unsupported_and_bad_meshes_fail_init() {
        let mut r = renderer(small_config());
        assert!(matches!(r.resize(10, 10), Err(PelageError::Unsupported(_))));
        let bad = TriangleMesh::new(tetrahedron().vertices, vec![0, 1, 9]);
        assert!(matches!(
            FurRenderer::new(RecordingDevice::new(), &bad, small_config()),
            Err(PelageError::InvalidMesh(_))
        ));
        assert!(matches!(
            FurRenderer::new(RecordingDevice::new(), &TriangleMesh::default(), small_config()),
            Err(PelageError::InvalidMesh(_))
        ));
    }
}
