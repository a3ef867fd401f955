// Fixed-size slot arenas for per-image swapchain state
//
// Backbuffers are indexed by the image the driver hands back from acquire,
// acquire semaphores by our own rotating sync counter. The driver may return
// images out of submission order, so the two index spaces are distinct types.

use std::marker::PhantomData;
use std::ops::{Index, IndexMut};

/// Upper bound on swapchain buffer count
pub const MAX_BUFFER_COUNT: usize = 3;

/// Index of a swapchain image, as returned by the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageIndex(pub u32);

/// Index of an acquire semaphore, rotated by the swapchain itself
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SyncIndex(pub usize);

impl SyncIndex {
    /// Next slot, wrapping at `count`
    pub fn next(self, count: usize) -> SyncIndex {
        SyncIndex((self.0 + 1) % count)
    }
}

pub trait SlotIndex: Copy {
    fn slot(self) -> usize;
}

impl SlotIndex for ImageIndex {
    fn slot(self) -> usize {
        self.0 as usize
    }
}

impl SlotIndex for SyncIndex {
    fn slot(self) -> usize {
        self.0
    }
}

/// Arena whose length is fixed when it is built
pub struct Slots<T, I: SlotIndex> {
    items: Vec<T>,
    _index: PhantomData<I>,
}

impl<T, I: SlotIndex> Slots<T, I> {
    pub fn new(items: Vec<T>) -> Self {
        Self {
            items,
            _index: PhantomData,
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, index: I) -> Option<&T> {
        self.items.get(index.slot())
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }

    /// Empty the arena, handing back the items for retirement
    pub fn take(&mut self) -> Vec<T> {
        std::mem::take(&mut self.items)
    }
}

impl<T, I: SlotIndex> Index<I> for Slots<T, I> {
    type Output = T;

    fn index(&self, index: I) -> &T {
        &self.items[index.slot()]
    }
}

impl<T, I: SlotIndex> IndexMut<I> for Slots<T, I> {
    fn index_mut(&mut self, index: I) -> &mut T {
        &mut self.items[index.slot()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_index_wraps() {
        let mut index = SyncIndex::default();
        let visited: Vec<usize> = (0..6)
            .map(|_| {
                index = index.next(3);
                index.0
            })
            .collect();
        assert_eq!(visited, vec![1, 2, 0, 1, 2, 0]);
    }

    #[test]
    fn take_empties_the_arena() {
        let mut slots: Slots<u32, ImageIndex> = Slots::new(vec![10, 20]);
        assert_eq!(slots[ImageIndex(1)], 20);
        slots[ImageIndex(0)] = 11;
        assert_eq!(slots.take(), vec![11, 20]);
        assert!(slots.is_empty());
        assert!(slots.get(ImageIndex(0)).is_none());
    }
}
