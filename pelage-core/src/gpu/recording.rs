//! Headless backend. Keeps the most recent submitted streams and models the
//! queue's completion counter so frame pacing can be tested without a GPU.

use super::command::CommandStream;
use super::{
    BufferDesc, BufferId, CommandListId, GpuDevice, ProgramDesc, ProgramId, TextureDesc, TextureId, Timeline,
};
use crate::error::{PelageError, Result};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;

/// Submissions kept for inspection; older streams are dropped first.
pub const RETAINED_SUBMISSIONS: usize = 64;

#[derive(Debug, Clone)]
pub struct Submission {
    pub list: CommandListId,
    pub stream: CommandStream,
}

/// CPU-only `GpuDevice`.
///
/// The simulated queue is idle until something is submitted. A signal on an
/// idle queue completes at once; a signal behind submitted work completes
/// when someone waits for it, unless the device is stalled, in which case
/// the wait times out.
#[derive(Debug, Default)]
pub struct RecordingDevice {
    pub buffers: Vec<(BufferDesc, Vec<u8>)>,
    pub textures: Vec<TextureDesc>,
    pub programs: Vec<ProgramDesc>,
    pub submissions: VecDeque<Submission>,
    pub presents: Vec<TextureId>,
    /// Highest value handed to `signal`.
    pub last_signal: u64,
    /// Waits that had to block because the value was not yet complete.
    pub blocking_waits: usize,
    pub stalled: bool,
    command_lists: u32,
    completed: u64,
    queue_busy: bool,
    // Work submitted since the last signal; it retires with the next signalled value.
    unsignalled_lists: Vec<CommandListId>,
    unsignalled_buffers: Vec<BufferId>,
    list_fences: HashMap<CommandListId, u64>,
    buffer_fences: HashMap<BufferId, u64>,
}

impl RecordingDevice {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a GPU that never finishes outstanding work.
    pub fn stall(&mut self) {
        self.stalled = true;
    }

    /// Let the simulated GPU drain everything signalled so far.
    pub fn complete_all(&mut self) {
        self.completed = self.completed.max(self.last_signal);
        self.queue_busy = false;
    }

    pub fn buffer_contents(&self, id: BufferId) -> Option<&[u8]> {
        self.buffers.get(id.0 as usize).map(|(_, data)| data.as_slice())
    }

    pub fn last_stream(&self) -> Option<&CommandStream> {
        self.submissions.back().map(|s| &s.stream)
    }

    fn in_flight(&self, fence: Option<&u64>) -> Option<u64> {
        fence.copied().filter(|&f| f > self.completed)
    }
}

impl GpuDevice for RecordingDevice {
    fn create_buffer(&mut self, desc: &BufferDesc, contents: Option<&[u8]>) -> Result<BufferId> {
        let mut data = vec![0u8; desc.size as usize];
        if let Some(src) = contents {
            if src.len() > data.len() {
                return Err(PelageError::Init(format!(
                    "{}: {} bytes of contents for a {}-byte buffer",
                    desc.label,
                    src.len(),
                    desc.size
                )));
            }
            data[..src.len()].copy_from_slice(src);
        }
        self.buffers.push((desc.clone(), data));
        Ok(BufferId(self.buffers.len() as u32 - 1))
    }

    fn write_buffer(&mut self, buffer: BufferId, offset: u64, data: &[u8]) -> Result<()> {
        if let Some(f) = self.in_flight(self.buffer_fences.get(&buffer)) {
            return Err(PelageError::Submission(format!(
                "write to {:?} while the GPU may still read it (fence {}, completed {})",
                buffer, f, self.completed
            )));
        }
        let (desc, contents) = self
            .buffers
            .get_mut(buffer.0 as usize)
            .ok_or_else(|| PelageError::UnknownResource(format!("{:?}", buffer)))?;
        let start = offset as usize;
        let end = start + data.len();
        if end > contents.len() {
            return Err(PelageError::Submission(format!("write past the end of {}", desc.label)));
        }
        contents[start..end].copy_from_slice(data);
        Ok(())
    }

    fn create_texture(&mut self, desc: &TextureDesc) -> Result<TextureId> {
        self.textures.push(desc.clone());
        Ok(TextureId(self.textures.len() as u32 - 1))
    }

    fn create_program(&mut self, desc: &ProgramDesc) -> Result<ProgramId> {
        self.programs.push(desc.clone());
        Ok(ProgramId(self.programs.len() as u32 - 1))
    }

    fn create_command_list(&mut self) -> Result<CommandListId> {
        self.command_lists += 1;
        Ok(CommandListId(self.command_lists - 1))
    }

    fn submit(&mut self, list: CommandListId, stream: &CommandStream) -> Result<()> {
        if list.0 >= self.command_lists {
            return Err(PelageError::UnknownResource(format!("{:?}", list)));
        }
        if let Some(f) = self.in_flight(self.list_fences.get(&list)) {
            return Err(PelageError::Submission(format!(
                "{:?} reused before fence {} completed (completed {})",
                list, f, self.completed
            )));
        }
        self.unsignalled_lists.push(list);
        self.unsignalled_buffers.extend(stream.uniform_buffers());
        if self.submissions.len() == RETAINED_SUBMISSIONS {
            self.submissions.pop_front();
        }
        self.submissions.push_back(Submission { list, stream: stream.clone() });
        self.queue_busy = true;
        Ok(())
    }

    fn present(&mut self, back_buffer: TextureId) -> Result<()> {
        self.presents.push(back_buffer);
        Ok(())
    }
}

impl Timeline for RecordingDevice {
    fn signal(&mut self, value: u64) -> Result<()> {
        for list in self.unsignalled_lists.drain(..) {
            self.list_fences.insert(list, value);
        }
        for buf in self.unsignalled_buffers.drain(..) {
            self.buffer_fences.insert(buf, value);
        }
        self.last_signal = self.last_signal.max(value);
        if !self.queue_busy && !self.stalled {
            self.completed = value;
        }
        Ok(())
    }

    fn completed_value(&self) -> Result<u64> {
        Ok(self.completed)
    }

    fn wait(&mut self, value: u64, _timeout: Duration) -> Result<()> {
        if self.completed >= value {
            return Ok(());
        }
        if self.stalled || value > self.last_signal {
            return Err(PelageError::SyncTimeout { value, completed: self.completed });
        }
        self.blocking_waits += 1;
        self.completed = value;
        if value == self.last_signal {
            self.queue_busy = false;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::BufferUsage;

    fn uniform(dev: &mut RecordingDevice) -> BufferId {
        let desc = BufferDesc { label: "frame".into(), size: 16, usage: BufferUsage::Uniform };
        dev.create_buffer(&desc, None).unwrap()
    }

    #[test]
    fn idle_queue_signals_complete_immediately() {
        let mut dev = RecordingDevice::new();
        dev.signal(1).unwrap();
        assert_eq!(dev.completed_value().unwrap(), 1);
        dev.wait(1, Duration::from_millis(1)).unwrap();
        assert_eq!(dev.blocking_waits, 0);
    }

    #[test]
    fn busy_queue_completes_on_wait() {
        let mut dev = RecordingDevice::new();
        let list = dev.create_command_list().unwrap();
        dev.submit(list, &CommandStream::default()).unwrap();
        dev.signal(1).unwrap();
        assert_eq!(dev.completed_value().unwrap(), 0);
        dev.wait(1, Duration::from_millis(1)).unwrap();
        assert_eq!(dev.completed_value().unwrap(), 1);
        assert_eq!(dev.blocking_waits, 1);
    }

    #[test]
    fn stalled_queue_times_out() {
        let mut dev = RecordingDevice::new();
        dev.stall();
        dev.signal(1).unwrap();
        assert!(matches!(dev.wait(1, Duration::from_millis(1)), Err(PelageError::SyncTimeout { value: 1, .. })));
    }

    #[test]
    fn in_flight_lists_and_buffers_are_guarded() {
        let mut dev = RecordingDevice::new();
        let buf = uniform(&mut dev);
        let list = dev.create_command_list().unwrap();
        let stream = CommandStream {
            label: "f".into(),
            commands: vec![crate::gpu::Command::BindUniform { slot: 0, buffer: buf }],
        };
        dev.submit(list, &stream).unwrap();
        dev.signal(1).unwrap();
        assert!(dev.write_buffer(buf, 0, &[1, 2, 3, 4]).is_err());
        assert!(dev.submit(list, &stream).is_err());
        dev.wait(1, Duration::from_millis(1)).unwrap();
        dev.write_buffer(buf, 0, &[1, 2, 3, 4]).unwrap();
        assert_eq!(&dev.buffer_contents(buf).unwrap()[..4], &[1, 2, 3, 4]);
        dev.submit(list, &stream).unwrap();
    }

    #[test]
    fn long_runs_keep_bounded_history() {
        let mut dev = RecordingDevice::new();
        let list = dev.create_command_list().unwrap();
        for value in 1..=(RETAINED_SUBMISSIONS as u64 * 4) {
            let stream = CommandStream { label: format!("frame {}", value), commands: Vec::new() };
            dev.submit(list, &stream).unwrap();
            dev.signal(value).unwrap();
            dev.wait(value, Duration::from_millis(1)).unwrap();
        }
        assert_eq!(dev.submissions.len(), RETAINED_SUBMISSIONS);
        assert_eq!(dev.last_stream().unwrap().label, format!("frame {}", RETAINED_SUBMISSIONS * 4));
        assert_eq!(dev.submissions[0].stream.label, format!("frame {}", RETAINED_SUBMISSIONS * 3 + 1));
    }

    #[test]
    fn waits_cover_every_value_up_to_the_last_signal() {
        let mut dev = RecordingDevice::new();
        let list = dev.create_command_list().unwrap();
        dev.submit(list, &CommandStream::default()).unwrap();
        dev.signal(5).unwrap();
        dev.wait(3, Duration::from_millis(1)).unwrap();
        assert_eq!(dev.completed_value().unwrap(), 3);
        assert!(matches!(dev.wait(6, Duration::from_millis(1)), Err(PelageError::SyncTimeout { value: 6, .. })));
        dev.wait(5, Duration::from_millis(1)).unwrap();
        assert_eq!(dev.completed_value().unwrap(), 5);
    }
}
