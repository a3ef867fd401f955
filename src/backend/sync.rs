// Synchronization primitives
//
// Semaphores for GPU-GPU sync, with a CPU-side view of whether a signal
// operation is pending. The state is bookkeeping set by whoever submits the
// signal (acquire, queue submit), not something read back from the GPU.

use anyhow::{Context, Result};
use ash::vk;

use super::rhi::DeviceRef;

/// CPU-side view of a semaphore
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncState {
    /// Nothing pending, free to be used as a signal target
    #[default]
    Idle,
    /// A signal operation has been submitted and not yet waited on
    Submitted,
}

/// Binary or timeline semaphore owning its native handle
pub struct Semaphore {
    semaphore: vk::Semaphore,
    is_timeline: bool,
    cpu_state: SyncState,
    name: Option<String>,
    device: DeviceRef,
}

impl Semaphore {
    /// Create a semaphore; timeline semaphores start at 0
    pub fn new(device: DeviceRef, is_timeline: bool, name: Option<&str>) -> Result<Self> {
        let semaphore = device
            .create_semaphore(is_timeline, name)
            .with_context(|| format!("Failed to create semaphore {:?}", name))?;

        Ok(Self {
            semaphore,
            is_timeline,
            cpu_state: SyncState::Idle,
            name: name.map(str::to_owned),
            device,
        })
    }

    pub fn handle(&self) -> vk::Semaphore {
        self.semaphore
    }

    pub fn is_timeline(&self) -> bool {
        self.is_timeline
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn cpu_state(&self) -> SyncState {
        self.cpu_state
    }

    pub fn set_cpu_state(&mut self, state: SyncState) {
        self.cpu_state = state;
    }

    /// Recreate the native handle, dropping any pending signal.
    /// Blocks until the GPU is idle since the old handle may still be in use.
    /// On failure the old handle and state are kept.
    pub fn reset(&mut self) -> Result<()> {
        self.device.queue_wait_all()?;

        let semaphore = self
            .device
            .create_semaphore(self.is_timeline, self.name.as_deref())
            .with_context(|| format!("Failed to recreate semaphore {:?}", self.name))?;
        self.device
            .destroy_semaphore(std::mem::replace(&mut self.semaphore, semaphore));
        self.cpu_state = SyncState::Idle;

        Ok(())
    }

    /// Block until the counter reaches `value` or `timeout_ns` elapses.
    /// Returns false on timeout.
    pub fn wait(&self, value: u64, timeout_ns: u64) -> Result<bool> {
        assert!(self.is_timeline, "wait() requires a timeline semaphore");

        self.device
            .wait_semaphore(self.semaphore, value, timeout_ns)
            .context("Failed to wait for semaphore")
    }

    /// Set the counter to `value` from the host
    pub fn signal(&self, value: u64) -> Result<()> {
        assert!(self.is_timeline, "signal() requires a timeline semaphore");

        self.device
            .signal_semaphore(self.semaphore, value)
            .context("Failed to signal semaphore")
    }

    /// Current counter value
    pub fn value(&self) -> Result<u64> {
        assert!(self.is_timeline, "value() requires a timeline semaphore");

        self.device
            .semaphore_value(self.semaphore)
            .context("Failed to get semaphore counter value")
    }
}

impl std::fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Semaphore")
            .field("semaphore", &self.semaphore)
            .field("is_timeline", &self.is_timeline)
            .field("cpu_state", &self.cpu_state)
            .field("name", &self.name)
            .finish()
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        // Wait in case it's still in use by the GPU
        if let Err(e) = self.device.queue_wait_all() {
            log::error!("Failed to wait for idle before destroying semaphore: {:?}", e);
        }
        self.device.destroy_semaphore(self.semaphore);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::{Call, MockDevice};

    #[test]
    fn timeline_signal_then_value_and_wait() {
        let device = MockDevice::new();
        let semaphore = Semaphore::new(device.clone(), true, Some("timeline")).unwrap();

        assert_eq!(semaphore.value().unwrap(), 0);
        semaphore.signal(5).unwrap();
        assert_eq!(semaphore.value().unwrap(), 5);
        assert!(semaphore.wait(5, u64::MAX).unwrap());
        assert!(!semaphore.wait(6, 0).unwrap());
    }

    #[test]
    #[should_panic(expected = "wait() requires a timeline semaphore")]
    fn binary_rejects_wait() {
        let semaphore = Semaphore::new(MockDevice::new(), false, None).unwrap();
        let _ = semaphore.wait(1, u64::MAX);
    }

    #[test]
    #[should_panic(expected = "signal() requires a timeline semaphore")]
    fn binary_rejects_signal() {
        let semaphore = Semaphore::new(MockDevice::new(), false, None).unwrap();
        let _ = semaphore.signal(1);
    }

    #[test]
    #[should_panic(expected = "value() requires a timeline semaphore")]
    fn binary_rejects_value() {
        let semaphore = Semaphore::new(MockDevice::new(), false, None).unwrap();
        let _ = semaphore.value();
    }

    #[test]
    fn reset_always_returns_to_idle() {
        let device = MockDevice::new();
        for state in [SyncState::Idle, SyncState::Submitted] {
            let mut semaphore = Semaphore::new(device.clone(), false, Some("binary")).unwrap();
            semaphore.set_cpu_state(state);
            semaphore.reset().unwrap();
            assert_eq!(semaphore.cpu_state(), SyncState::Idle);
        }
    }

    #[test]
    fn reset_recreates_the_handle_after_idle_wait() {
        let device = MockDevice::new();
        let mut semaphore = Semaphore::new(device.clone(), true, None).unwrap();
        semaphore.signal(3).unwrap();
        let old = semaphore.handle();
        device.clear_calls();

        semaphore.reset().unwrap();

        assert_ne!(semaphore.handle(), old);
        assert_eq!(semaphore.value().unwrap(), 0);
        assert_eq!(
            device.calls()[..3],
            [
                Call::QueueWaitAll,
                Call::CreateSemaphore { timeline: true },
                Call::DestroySemaphore(old)
            ]
        );
    }

    #[test]
    fn failed_reset_keeps_the_old_handle() {
        let device = MockDevice::new();
        let mut semaphore = Semaphore::new(device.clone(), false, None).unwrap();
        semaphore.set_cpu_state(SyncState::Submitted);
        let old = semaphore.handle();

        device.fail_next_create_semaphore();
        assert!(semaphore.reset().is_err());
        assert_eq!(semaphore.handle(), old);
        assert_eq!(semaphore.cpu_state(), SyncState::Submitted);

        // Destroyed exactly once
        drop(semaphore);
        assert_eq!(device.live_semaphores(), 0);
        assert_eq!(device.count_calls(|c| *c == Call::DestroySemaphore(old)), 1);
    }

    #[test]
    fn drop_waits_for_idle_then_destroys() {
        let device = MockDevice::new();
        let semaphore = Semaphore::new(device.clone(), false, None).unwrap();
        let handle = semaphore.handle();
        device.clear_calls();

        drop(semaphore);

        assert_eq!(device.calls(), vec![Call::QueueWaitAll, Call::DestroySemaphore(handle)]);
        assert_eq!(device.live_semaphores(), 0);
    }
}
