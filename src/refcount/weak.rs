use std::fmt;
use std::marker::PhantomData;
use std::ptr::NonNull;

use super::control_block::ControlBlock;
use super::strong::StrongHandle;

/// A non-owning observer of a `StrongHandle`'s payload.
///
/// Keeps the control block allocated, never the payload. Use `lock` to get
/// at the payload while it is still alive.
pub struct WeakHandle<T> {
    block: Option<NonNull<ControlBlock<T>>>,
    /// Never drops `T`, so it does not claim to own one.
    _observes: PhantomData<*const T>,
}

unsafe impl<T: Send + Sync> Send for WeakHandle<T> {}

unsafe impl<T: Send + Sync> Sync for WeakHandle<T> {}

impl<T> WeakHandle<T> {
    pub const fn empty() -> WeakHandle<T> {
        WeakHandle {
            block: None,
            _observes: PhantomData,
        }
    }

    pub fn new(strong: &StrongHandle<T>) -> WeakHandle<T> {
        let block = strong.block();
        if let Some(block) = block {
            // Safety: `strong` keeps the block allocated for this call.
            unsafe { block.as_ref() }.acquire_weak();
        }
        WeakHandle {
            block,
            _observes: PhantomData,
        }
    }

    fn control(&self) -> Option<&ControlBlock<T>> {
        // Safety: a non-empty weak handle keeps its block allocated.
        self.block.map(|block| unsafe { &*block.as_ptr() })
    }

    /// Starts observing `strong`'s block instead of the current one.
    ///
    /// The new block is acquired before the old one is released, and
    /// re-assigning the block already observed changes nothing.
    pub fn assign(&mut self, strong: &StrongHandle<T>) {
        if self.block == strong.block() {
            return;
        }
        *self = WeakHandle::new(strong);
    }

    /// Promotes to a strong handle, or returns an empty one if the payload
    /// has already been finalized.
    ///
    /// Promotion and the final strong release are ordered by a single CAS on
    /// the strong count, so there is no state in which both succeed.
    pub fn lock(&self) -> StrongHandle<T> {
        self.upgrade().unwrap_or_default()
    }

    pub fn upgrade(&self) -> Option<StrongHandle<T>> {
        let block = self.block?;
        // Safety: we hold a weak unit, so the block is still allocated.
        if unsafe { block.as_ref() }.try_acquire_strong() {
            Some(StrongHandle::from_acquired(block))
        } else {
            None
        }
    }

    pub fn use_count(&self) -> usize {
        self.control().map_or(0, ControlBlock::strong_count)
    }

    pub fn weak_count(&self) -> usize {
        self.control().map_or(0, ControlBlock::weak_count)
    }

    pub fn expired(&self) -> bool {
        self.use_count() == 0
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        self.block == other.block
    }

    pub fn reset(&mut self) {
        if let Some(block) = self.block.take() {
            // Safety: we owned one weak unit and just forgot the pointer.
            unsafe { ControlBlock::release_weak(block) }
        }
    }
}

impl<T> Default for WeakHandle<T> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<T> From<&StrongHandle<T>> for WeakHandle<T> {
    fn from(strong: &StrongHandle<T>) -> Self {
        WeakHandle::new(strong)
    }
}

impl<T> Clone for WeakHandle<T> {
    fn clone(&self) -> Self {
        if let Some(block) = self.control() {
            block.acquire_weak();
        }
        WeakHandle {
            block: self.block,
            _observes: PhantomData,
        }
    }
}

impl<T> Drop for WeakHandle<T> {
    fn drop(&mut self) {
        self.reset();
    }
}

impl<T: fmt::Debug> fmt::Debug for WeakHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.upgrade() {
            Some(strong) => fmt::Debug::fmt(&*strong, f),
            None if self.block.is_none() => f.write_str("(empty)"),
            None => f.write_str("(dead)"),
        }
    }
}
