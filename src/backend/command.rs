// Command pools and command lists
//
// A pool rotates through a few command lists so the CPU can record frame N+1
// while the GPU still runs frame N. Each list owns a binary "processed"
// semaphore it signals on submit; the swapchain it targets waits on those
// semaphores before presenting.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::atomic::{AtomicU64, Ordering};

use super::rhi::DeviceRef;
use super::sync::{Semaphore, SyncState};

/// Identifies a swapchain so command pools can say which one they render to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SwapchainId(pub u64);

impl SwapchainId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        SwapchainId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandListState {
    Idle,
    Recording,
    Submitted,
}

pub struct CommandList {
    cmd: vk::CommandBuffer,
    semaphore_processed: Semaphore,
    state: CommandListState,
    /// Submission value of the last submit, 0 if never submitted
    submission: u64,
}

impl CommandList {
    fn new(device: &DeviceRef, name: &str) -> Result<Self> {
        let cmd = device
            .allocate_command_buffer()
            .with_context(|| format!("Failed to allocate command buffer for {}", name))?;
        let semaphore_processed = Semaphore::new(device.clone(), false, Some(name))?;

        Ok(Self {
            cmd,
            semaphore_processed,
            state: CommandListState::Idle,
            submission: 0,
        })
    }

    pub fn handle(&self) -> vk::CommandBuffer {
        self.cmd
    }

    pub fn state(&self) -> CommandListState {
        self.state
    }

    pub fn submission(&self) -> u64 {
        self.submission
    }

    pub fn semaphore_processed(&self) -> &Semaphore {
        &self.semaphore_processed
    }

    pub fn semaphore_processed_mut(&mut self) -> &mut Semaphore {
        &mut self.semaphore_processed
    }
}

pub struct CommandPool {
    name: String,
    swapchain_id: SwapchainId,
    lists: Vec<CommandList>,
    index: usize,
    device: DeviceRef,
}

impl CommandPool {
    pub fn new(device: DeviceRef, name: &str, swapchain_id: SwapchainId, list_count: usize) -> Result<Self> {
        assert!(list_count > 0, "A command pool needs at least one command list");

        let lists = (0..list_count)
            .map(|i| CommandList::new(&device, &format!("{}_processed_{}", name, i)))
            .collect::<Result<Vec<_>>>()?;

        log::debug!("Created command pool {} with {} lists", name, list_count);

        Ok(Self {
            name: name.to_owned(),
            swapchain_id,
            lists,
            // First begin() rotates onto list 0
            index: list_count - 1,
            device,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn swapchain_id(&self) -> SwapchainId {
        self.swapchain_id
    }

    pub fn current_command_list(&self) -> &CommandList {
        &self.lists[self.index]
    }

    pub fn current_command_list_mut(&mut self) -> &mut CommandList {
        &mut self.lists[self.index]
    }

    /// Move to the next list and start recording into it.
    /// Blocks if the GPU is still running that list's previous submission.
    pub fn begin(&mut self) -> Result<vk::CommandBuffer> {
        self.index = (self.index + 1) % self.lists.len();
        let device = self.device.clone();
        let list = &mut self.lists[self.index];
        assert!(list.state != CommandListState::Recording, "Command list is already recording");

        device.wait_for_submission(list.submission)?;

        // Signalled but never waited on (nobody presented it), re-arm it
        if list.semaphore_processed.cpu_state() == SyncState::Submitted {
            list.semaphore_processed.reset()?;
        }

        device.begin_command_buffer(list.cmd)?;
        list.state = CommandListState::Recording;

        Ok(list.cmd)
    }

    /// End recording and submit, signalling the list's processed semaphore.
    ///
    /// Nothing is waited on: the work may run before the swapchain image is
    /// available. Use `submit_after` when it writes to the acquired image.
    pub fn submit(&mut self) -> Result<u64> {
        self.submit_waiting(&[])
    }

    /// Submit, making the GPU wait for `semaphore` first if it has a pending
    /// signal. That signal is consumed here, so it goes back to Idle and
    /// nobody else (e.g. present) waits on it again.
    pub fn submit_after(&mut self, semaphore: &mut Semaphore) -> Result<u64> {
        let wait = (semaphore.cpu_state() == SyncState::Submitted).then(|| semaphore.handle());
        let submission = self.submit_waiting(wait.as_slice())?;
        semaphore.set_cpu_state(SyncState::Idle);

        Ok(submission)
    }

    fn submit_waiting(&mut self, wait: &[vk::Semaphore]) -> Result<u64> {
        let device = self.device.clone();
        let list = &mut self.lists[self.index];
        assert!(list.state == CommandListState::Recording, "Command list is not recording");

        let submitted = device
            .end_command_buffer(list.cmd)
            .and_then(|()| device.queue_submit(list.cmd, wait, &[list.semaphore_processed.handle()]));
        let submission = match submitted {
            Ok(submission) => submission,
            Err(e) => {
                // Nothing was queued, the list can be begun again
                list.state = CommandListState::Idle;
                return Err(e.context(format!("Failed to submit command list of {}", self.name)));
            }
        };

        list.semaphore_processed.set_cpu_state(SyncState::Submitted);
        list.submission = submission;
        list.state = CommandListState::Submitted;

        Ok(submission)
    }

    /// End recording without submitting; the processed semaphore is never signalled
    pub fn discard(&mut self) -> Result<()> {
        let list = &mut self.lists[self.index];
        assert!(list.state == CommandListState::Recording, "Command list is not recording");

        self.device.end_command_buffer(list.cmd)?;
        list.state = CommandListState::Idle;

        Ok(())
    }
}

impl Drop for CommandPool {
    fn drop(&mut self) {
        if let Err(e) = self.device.queue_wait_all() {
            log::error!("Failed to wait for idle before destroying {}: {:?}", self.name, e);
        }
        for list in &self.lists {
            self.device.free_command_buffer(list.cmd);
        }
    }
}
