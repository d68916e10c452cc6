//! Frame-relative local storage
//!
//! Thread locals (registers and arrays) are kept in one growable
//! vector per kind, windowed by a base offset. Entering a call frame
//! appends default-initialized slots and moves the base; leaving it
//! truncates back and restores the caller's base. Slot indices in
//! bytecode are always relative to the current base.

use acsvm_bytecode::Word;

/// A stack of storage frames over a single vector
pub struct Store<T> {
    data: Vec<T>,
    base: usize,
}

impl<T: Default> Default for Store<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Default> Store<T> {
    /// Create an empty store with no frames
    pub fn new() -> Self {
        Self {
            data: Vec::new(),
            base: 0,
        }
    }

    /// Open a frame of `count` default slots; returns the previous base
    /// for the matching [`Store::exit`]
    pub fn enter(&mut self, count: usize) -> usize {
        let prev = self.base;
        self.base = self.data.len();
        self.data.resize_with(self.base + count, T::default);
        prev
    }

    /// Close the current frame, restoring `prev_base` from `enter`
    pub fn exit(&mut self, prev_base: usize) {
        self.data.truncate(self.base);
        self.base = prev_base;
    }

    /// Slot `idx` of the current frame
    pub fn get(&self, idx: Word) -> Option<&T> {
        self.data.get(self.base.checked_add(idx as usize)?)
    }

    /// Mutable slot `idx` of the current frame
    pub fn get_mut(&mut self, idx: Word) -> Option<&mut T> {
        let at = self.base.checked_add(idx as usize)?;
        self.data.get_mut(at)
    }

    /// Base offset of the current frame
    pub fn base(&self) -> usize {
        self.base
    }

    /// All slots across all frames, oldest first
    pub fn data(&self) -> &[T] {
        &self.data
    }

    /// Drop every frame
    pub fn clear(&mut self) {
        self.data.clear();
        self.base = 0;
    }

    /// Append one slot without touching the base; used when restoring
    /// serialized frames
    pub(crate) fn push_raw(&mut self, value: T) {
        self.data.push(value);
    }

    /// Force the base offset; used when restoring serialized frames
    pub(crate) fn set_base(&mut self, base: usize) {
        self.base = base;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_isolation() {
        let mut store: Store<Word> = Store::new();
        let outer = store.enter(2);
        *store.get_mut(0).unwrap() = 10;
        *store.get_mut(1).unwrap() = 20;

        let inner = store.enter(1);
        assert_eq!(*store.get(0).unwrap(), 0);
        *store.get_mut(0).unwrap() = 99;

        store.exit(inner);
        assert_eq!(*store.get(0).unwrap(), 10);
        assert_eq!(*store.get(1).unwrap(), 20);

        store.exit(outer);
        assert!(store.data().is_empty());
    }

    #[test]
    fn test_out_of_frame_access() {
        let mut store: Store<Word> = Store::new();
        store.enter(2);
        assert!(store.get(2).is_none());
        assert!(store.get_mut(u32::MAX).is_none());
    }

    #[test]
    fn test_clear() {
        let mut store: Store<Word> = Store::new();
        store.enter(3);
        store.clear();
        assert_eq!(store.base(), 0);
        assert!(store.get(0).is_none());
    }
}
