//! Recorded command streams.
//!
//! `CommandRecorder` works on a private copy of the resource tracker, so a
//! frame that fails part-way through recording leaves the committed states
//! untouched. The caller swaps the recorder's tracker in only after the
//! stream has been submitted.

use super::state::{ResourceState, ResourceTracker, Transition};
use super::{BufferId, ProgramId, TextureId, Topology};
use crate::error::{PelageError, Result};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Command {
    Barrier(Vec<Transition>),
    ClearColor { target: TextureId, color: [f32; 4] },
    SetRenderTargets { targets: Vec<TextureId>, width: u32, height: u32 },
    BindProgram(ProgramId),
    SetTopology(Topology),
    BindVertexBuffer(BufferId),
    BindIndexBuffer(BufferId),
    BindUniform { slot: u32, buffer: BufferId },
    BindTextures { slot: u32, textures: Vec<TextureId> },
    DrawIndexed { index_count: u32, instance_count: u32 },
    Resolve { src: TextureId, dst: TextureId },
    CopyBufferToTexture { src: BufferId, dst: TextureId },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CommandStream {
    pub label: String,
    pub commands: Vec<Command>,
}

impl CommandStream {
    pub fn draws(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        self.commands.iter().filter_map(|c| match c {
            Command::DrawIndexed { index_count, instance_count } => Some((*index_count, *instance_count)),
            _ => None,
        })
    }

    pub fn barrier_count(&self) -> usize {
        self.commands
            .iter()
            .map(|c| match c {
                Command::Barrier(ts) => ts.len(),
                _ => 0,
            })
            .sum()
    }

    pub fn uniform_buffers(&self) -> impl Iterator<Item = BufferId> + '_ {
        self.commands.iter().filter_map(|c| match c {
            Command::BindUniform { buffer, .. } => Some(*buffer),
            _ => None,
        })
    }
}

pub struct CommandRecorder {
    tracker: ResourceTracker,
    stream: CommandStream,
    render_targets: Vec<TextureId>,
}

impl CommandRecorder {
    pub fn new(label: impl Into<String>, tracker: &ResourceTracker) -> Self {
        Self {
            tracker: tracker.clone(),
            stream: CommandStream { label: label.into(), commands: Vec::new() },
            render_targets: Vec::new(),
        }
    }

    pub fn tracker(&self) -> &ResourceTracker {
        &self.tracker
    }

    /// One batch of transitions. All of them are validated before the batch is recorded.
    pub fn barrier(&mut self, transitions: &[Transition]) -> Result<()> {
        let mut next = self.tracker.clone();
        for t in transitions {
            next.apply(t)?;
        }
        self.tracker = next;
        self.render_targets.retain(|rt| transitions.iter().all(|t| t.texture != *rt));
        self.stream.commands.push(Command::Barrier(transitions.to_vec()));
        Ok(())
    }

    pub fn clear(&mut self, target: TextureId, color: [f32; 4]) -> Result<()> {
        self.tracker.require(target, ResourceState::RenderTarget)?;
        self.stream.commands.push(Command::ClearColor { target, color });
        Ok(())
    }

    pub fn set_render_targets(&mut self, targets: &[TextureId], width: u32, height: u32) -> Result<()> {
        for &t in targets {
            self.tracker.require(t, ResourceState::RenderTarget)?;
        }
        self.render_targets = targets.to_vec();
        self.stream.commands.push(Command::SetRenderTargets { targets: targets.to_vec(), width, height });
        Ok(())
    }

    pub fn bind_program(&mut self, program: ProgramId) {
        self.stream.commands.push(Command::BindProgram(program));
    }

    pub fn set_topology(&mut self, topology: Topology) {
        self.stream.commands.push(Command::SetTopology(topology));
    }

    pub fn bind_vertex_buffer(&mut self, buffer: BufferId) {
        self.stream.commands.push(Command::BindVertexBuffer(buffer));
    }

    pub fn bind_index_buffer(&mut self, buffer: BufferId) {
        self.stream.commands.push(Command::BindIndexBuffer(buffer));
    }

    pub fn bind_uniform(&mut self, slot: u32, buffer: BufferId) {
        self.stream.commands.push(Command::BindUniform { slot, buffer });
    }

    pub fn bind_textures(&mut self, slot: u32, textures: &[TextureId]) -> Result<()> {
        for &t in textures {
            self.tracker.require(t, ResourceState::ShaderReadable)?;
        }
        self.stream.commands.push(Command::BindTextures { slot, textures: textures.to_vec() });
        Ok(())
    }

    pub fn draw_indexed(&mut self, index_count: u32, instance_count: u32) -> Result<()> {
        if self.render_targets.is_empty() {
            return Err(PelageError::Submission("draw recorded with no render targets bound".into()));
        }
        self.stream.commands.push(Command::DrawIndexed { index_count, instance_count });
        Ok(())
    }

    pub fn resolve(&mut self, src: TextureId, dst: TextureId) -> Result<()> {
        self.tracker.require(src, ResourceState::ResolveSource)?;
        self.tracker.require(dst, ResourceState::ResolveDestination)?;
        self.stream.commands.push(Command::Resolve { src, dst });
        Ok(())
    }

    pub fn copy_buffer_to_texture(&mut self, src: BufferId, dst: TextureId) -> Result<()> {
        self.tracker.require(dst, ResourceState::CopyDestination)?;
        self.stream.commands.push(Command::CopyBufferToTexture { src, dst });
        Ok(())
    }

    pub fn finish(self) -> (CommandStream, ResourceTracker) {
        (self.stream, self.tracker)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ResourceState::*;

    fn tracker() -> ResourceTracker {
        let mut t = ResourceTracker::new();
        t.register(TextureId(0), "msaa", ResolveSource);
        t.register(TextureId(1), "back[0]", Presentable);
        t.register(TextureId(2), "noise", ShaderReadable);
        t
    }

    #[test]
    fn recorder_leaves_committed_tracker_alone() {
        let committed = tracker();
        let mut rec = CommandRecorder::new("frame", &committed);
        rec.barrier(&[Transition::new(TextureId(0), ResolveSource, RenderTarget)]).unwrap();
        assert_eq!(committed.state(TextureId(0)).unwrap(), ResolveSource);
        let (stream, after) = rec.finish();
        assert_eq!(after.state(TextureId(0)).unwrap(), RenderTarget);
        assert_eq!(stream.barrier_count(), 1);
    }

    #[test]
    fn usage_must_match_state() {
        let mut rec = CommandRecorder::new("frame", &tracker());
        assert!(matches!(rec.clear(TextureId(0), [0.0; 4]), Err(PelageError::StateMismatch { .. })));
        assert!(rec.bind_textures(3, &[TextureId(2)]).is_ok());
        assert!(rec.bind_textures(3, &[TextureId(0)]).is_err());
        assert!(rec.resolve(TextureId(0), TextureId(1)).is_err());
    }

    #[test]
    fn draw_needs_bound_targets() {
        let mut rec = CommandRecorder::new("frame", &tracker());
        assert!(rec.draw_indexed(3, 1).is_err());
        rec.barrier(&[Transition::new(TextureId(0), ResolveSource, RenderTarget)]).unwrap();
        rec.set_render_targets(&[TextureId(0)], 4, 4).unwrap();
        rec.draw_indexed(3, 2).unwrap();
        // Transitioning a bound target unbinds it.
        rec.barrier(&[Transition::new(TextureId(0), RenderTarget, ResolveSource)]).unwrap();
        assert!(rec.draw_indexed(3, 1).is_err());
        let (stream, _) = rec.finish();
        assert_eq!(stream.draws().collect::<Vec<_>>(), vec![(3, 2)]);
    }

    #[test]
    fn batch_with_a_bad_transition_is_not_recorded() {
        let mut rec = CommandRecorder::new("frame", &tracker());
        let batch = [
            Transition::new(TextureId(0), ResolveSource, RenderTarget),
            Transition::new(TextureId(1), Presentable, CopyDestination),
        ];
        assert!(matches!(rec.barrier(&batch), Err(PelageError::InvalidTransition { .. })));
        assert_eq!(rec.tracker().state(TextureId(0)).unwrap(), ResolveSource);
        let (stream, _) = rec.finish();
        assert!(stream.commands.is_empty());
    }
}
