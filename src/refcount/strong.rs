use std::fmt;
use std::marker::PhantomData;
use std::mem;
use std::ops::Deref;
use std::ptr::NonNull;

use super::backoff::Backoff;
use super::control_block::ControlBlock;
use super::weak::WeakHandle;
use crate::error::{HandleError, Result};

/// An owning handle. The payload lives as long as at least one non-empty
/// `StrongHandle` references its control block.
pub struct StrongHandle<T> {
    block: Option<NonNull<ControlBlock<T>>>,
    _owns: PhantomData<T>,
}

unsafe impl<T: Send + Sync> Send for StrongHandle<T> {}

unsafe impl<T: Send + Sync> Sync for StrongHandle<T> {}

impl<T> StrongHandle<T> {
    pub fn new(value: T) -> StrongHandle<T> {
        Self::with_backoff(value, Backoff::default())
    }

    /// Like `new`, with a custom contention policy for every handle that
    /// will share this control block.
    pub fn with_backoff(value: T, backoff: Backoff) -> StrongHandle<T> {
        Self::from_acquired(ControlBlock::new_with(backoff, || value))
    }

    /// Builds the payload inside a freshly allocated control block.
    ///
    /// The block is allocated before `init` runs; if `init` panics the
    /// allocation is released and no handle ever sees it.
    pub fn new_with(init: impl FnOnce() -> T) -> StrongHandle<T> {
        Self::from_acquired(ControlBlock::new_with(Backoff::default(), init))
    }

    /// Like `new`, but reports allocation failure instead of aborting.
    pub fn try_new(value: T) -> Result<StrongHandle<T>> {
        ControlBlock::try_new_with(Backoff::default(), || value).map(Self::from_acquired)
    }

    pub const fn empty() -> StrongHandle<T> {
        StrongHandle {
            block: None,
            _owns: PhantomData,
        }
    }

    /// Wraps a block whose strong count has already been incremented on
    /// behalf of the new handle.
    pub(super) fn from_acquired(block: NonNull<ControlBlock<T>>) -> StrongHandle<T> {
        StrongHandle {
            block: Some(block),
            _owns: PhantomData,
        }
    }

    pub(super) fn block(&self) -> Option<NonNull<ControlBlock<T>>> {
        self.block
    }

    fn control(&self) -> Option<&ControlBlock<T>> {
        // Safety: a non-empty strong handle keeps its block allocated.
        self.block.map(|block| unsafe { &*block.as_ptr() })
    }

    pub fn is_empty(&self) -> bool {
        self.block.is_none()
    }

    /// True if this handle references a block whose payload is alive.
    pub fn is_alive(&self) -> bool {
        self.control().is_some_and(|block| block.strong_count() > 0)
    }

    /// Number of strong handles sharing this payload, 0 if empty.
    ///
    /// Other threads may change it right after it is read.
    pub fn use_count(&self) -> usize {
        self.control().map_or(0, ControlBlock::strong_count)
    }

    pub fn weak_count(&self) -> usize {
        self.control().map_or(0, ControlBlock::weak_count)
    }

    pub fn get(&self) -> Option<&T> {
        // Safety: we hold a strong reference, so the payload is alive.
        self.control().map(|block| unsafe { block.payload() })
    }

    pub fn try_get(&self) -> Result<&T> {
        self.get().ok_or(HandleError::Empty)
    }

    /// Mutable access, only when no other strong or weak handle exists.
    pub fn get_mut(&mut self) -> Option<&mut T> {
        let block = self.block?;
        // Safety: the block is alive while we hold it.
        if unsafe { block.as_ref() }.is_unique() {
            // Safety: nothing else references the block and `self` is
            // borrowed mutably for as long as the returned reference lives.
            Some(unsafe { ControlBlock::payload_mut(block) })
        } else {
            None
        }
    }

    /// Moves the payload out if this is the only strong handle. Weak handles
    /// observe the payload as finalized afterwards.
    pub fn try_unwrap(this: Self) -> std::result::Result<T, Self> {
        let Some(block) = this.block else {
            return Err(this);
        };
        // Safety: `this` owns one strong reference to `block`.
        match unsafe { ControlBlock::try_take(block) } {
            Some(value) => {
                // The strong reference was consumed by `try_take`.
                mem::forget(this);
                Ok(value)
            }
            None => Err(this),
        }
    }

    pub fn downgrade(this: &Self) -> WeakHandle<T> {
        WeakHandle::new(this)
    }

    /// True if both handles reference the same control block, or are both empty.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        self.block == other.block
    }

    /// Makes `self` share `source`'s payload, releasing what it held before.
    /// Assigning from a handle to the same block changes nothing.
    pub fn assign(&mut self, source: &Self) {
        if self.ptr_eq(source) {
            return;
        }
        self.reset();
        *self = source.clone();
    }

    /// Releases the held reference and leaves the handle empty.
    pub fn reset(&mut self) {
        if let Some(block) = self.block.take() {
            // Safety: we owned one strong reference and just forgot the pointer.
            unsafe { ControlBlock::release_strong(block) }
        }
    }
}

impl<T> Default for StrongHandle<T> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<T> Deref for StrongHandle<T> {
    type Target = T;

    fn deref(&self) -> &T {
        match self.get() {
            Some(value) => value,
            None => panic!("dereferenced an empty StrongHandle"),
        }
    }
}

impl<T> Clone for StrongHandle<T> {
    fn clone(&self) -> Self {
        let Some(block) = self.block else {
            return Self::empty();
        };
        // `self` is a live strong reference, so the count is above zero and
        // the acquisition cannot be refused.
        let acquired = unsafe { block.as_ref() }.try_acquire_strong();
        debug_assert!(acquired, "strong count was zero under a live StrongHandle");
        Self::from_acquired(block)
    }

    fn clone_from(&mut self, source: &Self) {
        self.assign(source);
    }
}

impl<T> Drop for StrongHandle<T> {
    fn drop(&mut self) {
        self.reset();
    }
}

impl<T: fmt::Debug> fmt::Debug for StrongHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.get() {
            Some(value) => fmt::Debug::fmt(value, f),
            None => f.write_str("(empty)"),
        }
    }
}
