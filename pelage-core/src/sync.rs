//! CPU/GPU frame pacing.
//!
//! One monotonic counter feeds both the whole-queue `flush` and the
//! per-slot fences of the frames-in-flight ring. A slot's resources are
//! reused only once its fence value has completed.

use crate::error::{PelageError, Result};
use crate::gpu::Timeline;
use std::time::Duration;

pub const MAX_FRAMES_IN_FLIGHT: usize = 3;

#[derive(Debug, Clone)]
pub struct FrameSynchronizer {
    last_value: u64,
    slot_values: Vec<u64>,
    timeout: Duration,
}

impl FrameSynchronizer {
    pub fn new(frames_in_flight: usize, timeout: Duration) -> Result<Self> {
        if !(1..=MAX_FRAMES_IN_FLIGHT).contains(&frames_in_flight) {
            return Err(PelageError::InvalidParameter(format!(
                "frames_in_flight must be in 1..={} (got {})",
                MAX_FRAMES_IN_FLIGHT, frames_in_flight
            )));
        }
        Ok(Self { last_value: 0, slot_values: vec![0; frames_in_flight], timeout })
    }

    pub fn frames_in_flight(&self) -> usize {
        self.slot_values.len()
    }

    pub fn last_value(&self) -> u64 {
        self.last_value
    }

    pub fn slot_value(&self, slot: usize) -> u64 {
        self.slot_values[slot]
    }

    fn next_value(&mut self, timeline: &mut dyn Timeline) -> Result<u64> {
        self.last_value += 1;
        timeline.signal(self.last_value)?;
        Ok(self.last_value)
    }

    fn wait_for(&self, timeline: &mut dyn Timeline, value: u64) -> Result<()> {
        if timeline.completed_value()? >= value {
            return Ok(());
        }
        log::trace!("waiting for fence {}", value);
        timeline.wait(value, self.timeout)
    }

    /// Signal a fresh value and block until the queue has reached it.
    pub fn flush(&mut self, timeline: &mut dyn Timeline) -> Result<u64> {
        let value = self.next_value(timeline)?;
        self.wait_for(timeline, value)?;
        Ok(value)
    }

    /// Fence the work just submitted for `slot`.
    pub fn signal_slot(&mut self, timeline: &mut dyn Timeline, slot: usize) -> Result<u64> {
        let value = self.next_value(timeline)?;
        self.slot_values[slot] = value;
        Ok(value)
    }

    /// Block until the last work submitted for `slot` has completed.
    pub fn wait_slot(&self, timeline: &mut dyn Timeline, slot: usize) -> Result<()> {
        match self.slot_values[slot] {
            0 => Ok(()),
            value => self.wait_for(timeline, value),
        }
    }

    pub fn shutdown(&mut self, timeline: &mut dyn Timeline) -> Result<()> {
        let value = self.flush(timeline)?;
        log::debug!("synchronizer drained at fence {}", value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::{CommandStream, GpuDevice, RecordingDevice};

    fn sync(n: usize) -> FrameSynchronizer {
        FrameSynchronizer::new(n, Duration::from_millis(50)).unwrap()
    }

    #[test]
    fn flush_on_idle_queue_does_not_block() {
        let mut dev = RecordingDevice::new();
        let mut s = sync(2);
        assert_eq!(s.flush(&mut dev).unwrap(), 1);
        assert_eq!(dev.blocking_waits, 0);
    }

    #[test]
    fn flush_confirms_previous_submissions() {
        let mut dev = RecordingDevice::new();
        let list = dev.create_command_list().unwrap();
        let mut s = sync(2);
        dev.submit(list, &CommandStream::default()).unwrap();
        let first = s.signal_slot(&mut dev, 0).unwrap();
        dev.submit(list, &CommandStream::default()).unwrap_err();
        let v = s.flush(&mut dev).unwrap();
        assert!(v > first);
        assert!(dev.completed_value().unwrap() >= first);
        dev.submit(list, &CommandStream::default()).unwrap();
    }

    #[test]
    fn slot_waits_only_for_its_own_fence() {
        let mut dev = RecordingDevice::new();
        let lists = [dev.create_command_list().unwrap(), dev.create_command_list().unwrap()];
        let mut s = sync(2);
        for (slot, list) in lists.iter().enumerate() {
            s.wait_slot(&mut dev, slot).unwrap();
            dev.submit(*list, &CommandStream::default()).unwrap();
            s.signal_slot(&mut dev, slot).unwrap();
        }
        assert_eq!(dev.blocking_waits, 0);
        s.wait_slot(&mut dev, 0).unwrap();
        assert_eq!(dev.blocking_waits, 1);
        assert!(dev.completed_value().unwrap() >= s.slot_value(0));
        assert!(dev.completed_value().unwrap() < s.slot_value(1));
    }

    #[test]
    fn hung_gpu_is_a_timeout() {
        let mut dev = RecordingDevice::new();
        let list = dev.create_command_list().unwrap();
        dev.stall();
        let mut s = sync(1);
        dev.submit(list, &CommandStream::default()).unwrap();
        let err = s.flush(&mut dev).unwrap_err();
        assert!(matches!(err, PelageError::SyncTimeout { value: 1, completed: 0 }));
        assert!(err.is_fatal());
    }

    #[test]
    fn ring_size_is_bounded() {
        assert!(FrameSynchronizer::new(0, Duration::ZERO).is_err());
        assert!(FrameSynchronizer::new(4, Duration::ZERO).is_err());
        assert_eq!(sync(3).frames_in_flight(), 3);
    }
}
