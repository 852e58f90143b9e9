use std::ops::{Index, IndexMut};

/// Position inside a fixed size ring. All arithmetic wraps at `size`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RingIndex {
    idx: usize,
    size: usize,
}

impl RingIndex {
    pub(crate) fn new(idx: usize, size: usize) -> Self {
        RingIndex {
            idx: idx % size,
            size,
        }
    }

    pub(crate) fn get(self) -> usize {
        self.idx
    }

    pub(crate) fn advance(self, n: usize) -> Self {
        RingIndex {
            idx: (self.idx + n) % self.size,
            size: self.size,
        }
    }

    pub(crate) fn next(self) -> Self {
        self.advance(1)
    }

    pub(crate) fn prev(self) -> Self {
        self.advance(self.size - 1)
    }
}

/// Fixed capacity slot array addressed by `RingIndex`.
#[derive(Debug, Clone)]
pub(crate) struct Ring<T> {
    slots: Box<[T]>,
}

impl<T: Copy + Default> Ring<T> {
    pub(crate) fn new(size: usize) -> Self {
        Ring {
            slots: vec![T::default(); size].into_boxed_slice(),
        }
    }

    pub(crate) fn size(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn start(&self) -> RingIndex {
        RingIndex::new(0, self.slots.len())
    }

    pub(crate) fn at(&self, idx: usize) -> RingIndex {
        RingIndex::new(idx, self.slots.len())
    }
}

impl<T> Index<RingIndex> for Ring<T> {
    type Output = T;

    fn index(&self, i: RingIndex) -> &T {
        &self.slots[i.idx]
    }
}

impl<T> IndexMut<RingIndex> for Ring<T> {
    fn index_mut(&mut self, i: RingIndex) -> &mut T {
        &mut self.slots[i.idx]
    }
}
