// Deferred deletion
//
// GPU objects may still be referenced by in-flight command buffers when the
// CPU side lets go of them. Instead of destroying them inline they are queued
// here together with the last submission value issued at retirement time, and
// only handed back for destruction once the device timeline has reached it.

use ash::vk;
use parking_lot::Mutex;
use std::collections::VecDeque;

/// A GPU object awaiting destruction, tagged by kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RhiResource {
    Buffer(vk::Buffer),
    Texture(vk::Image),
    TextureView(vk::ImageView),
}

#[derive(Debug)]
struct Retired {
    resource: RhiResource,
    submission: u64,
}

/// Retirement queue keyed by submission value
#[derive(Debug, Default)]
pub struct DeletionQueue {
    entries: Mutex<VecDeque<Retired>>,
}

impl DeletionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `resource`, safe to destroy once submission `submission` completes
    pub fn push(&self, resource: RhiResource, submission: u64) {
        log::debug!("Retiring {:?} after submission {}", resource, submission);
        self.entries.lock().push_back(Retired { resource, submission });
    }

    /// Remove every entry whose submission is <= `completed`.
    /// Submission values only grow, so entries are in order.
    pub fn drain_completed(&self, completed: u64) -> Vec<RhiResource> {
        let mut entries = self.entries.lock();
        let ready = entries
            .iter()
            .take_while(|entry| entry.submission <= completed)
            .count();

        entries.drain(..ready).map(|entry| entry.resource).collect()
    }

    /// Remove everything; only valid after the device is idle
    pub fn drain_all(&self) -> Vec<RhiResource> {
        self.entries.lock().drain(..).map(|entry| entry.resource).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
