use std::alloc::{self, Layout};
use std::cell::UnsafeCell;
use std::mem::{self, ManuallyDrop};
use std::ptr::{self, NonNull};
use std::sync::atomic::Ordering::{Acquire, Relaxed, Release};
use std::sync::atomic::{fence, AtomicUsize};

use super::backoff::Backoff;
use crate::error::{HandleError, Result};

/// Counts past this point mean handles are being leaked in a loop.
const MAX_REFCOUNT: usize = usize::MAX / 2;

/// Value of `weak` while `is_unique` holds it locked.
const WEAK_LOCKED: usize = usize::MAX;

#[cfg(test)]
thread_local! {
    pub(crate) static BLOCKS_FINALIZED: std::cell::Cell<usize> = const { std::cell::Cell::new(0) };
}

/// Shared bookkeeping for one payload.
///
/// Strong handles collectively hold a single unit of `weak`, released by
/// whichever strong release takes `strong` to zero. The block is therefore
/// only ever freed by the decrement that takes `weak` from one to zero.
pub(crate) struct ControlBlock<T> {
    /// Number of `StrongHandle`s.
    strong: AtomicUsize,
    /// Number of `WeakHandle`s, plus one if there are any `StrongHandle`s.
    weak: AtomicUsize,
    backoff: Backoff,
    /// The payload. Dropped once `strong` reaches zero.
    payload: UnsafeCell<ManuallyDrop<T>>,
}

/// A block that has been allocated but not yet handed to any handle.
struct Unpublished<T>(NonNull<ControlBlock<T>>);

impl<T> Drop for Unpublished<T> {
    fn drop(&mut self) {
        // Safety: the allocation came from `ControlBlock::allocate` with the
        // same layout and its fields were never initialized.
        unsafe { alloc::dealloc(self.0.as_ptr().cast(), ControlBlock::<T>::layout()) }
    }
}

/// The weak unit all strong handles hold together, given up on drop.
struct SharedWeakUnit<T>(NonNull<ControlBlock<T>>);

impl<T> Drop for SharedWeakUnit<T> {
    fn drop(&mut self) {
        // Safety: only created by the release that took `strong` to zero,
        // which owns the unit.
        unsafe { ControlBlock::release_weak(self.0) }
    }
}

impl<T> ControlBlock<T> {
    fn layout() -> Layout {
        Layout::new::<Self>()
    }

    fn allocate() -> Result<NonNull<Self>> {
        let layout = Self::layout();
        // Safety: the layout is never zero-sized, the block holds two counters.
        let raw = unsafe { alloc::alloc(layout) }.cast::<Self>();
        NonNull::new(raw).ok_or(HandleError::AllocFailed {
            size: layout.size(),
            align: layout.align(),
        })
    }

    /// Allocates a block and builds the payload directly into it, with
    /// `strong == 1` and no weak handles.
    ///
    /// If `init` panics the allocation is released before unwinding continues.
    pub(crate) fn try_new_with(backoff: Backoff, init: impl FnOnce() -> T) -> Result<NonNull<Self>> {
        let block = Self::allocate()?;
        let pending = Unpublished(block);
        let payload = init();
        mem::forget(pending);
        // Safety: `block` is a fresh allocation of the right layout that no one
        // else has seen yet.
        unsafe {
            block.as_ptr().write(ControlBlock {
                strong: AtomicUsize::new(1),
                weak: AtomicUsize::new(1),
                backoff,
                payload: UnsafeCell::new(ManuallyDrop::new(payload)),
            });
        }
        Ok(block)
    }

    pub(crate) fn new_with(backoff: Backoff, init: impl FnOnce() -> T) -> NonNull<Self> {
        match Self::try_new_with(backoff, init) {
            Ok(block) => block,
            Err(_) => alloc::handle_alloc_error(Self::layout()),
        }
    }

    pub(crate) fn strong_count(&self) -> usize {
        self.strong.load(Relaxed)
    }

    pub(crate) fn weak_count(&self) -> usize {
        let weak = self.weak.load(Relaxed);
        if weak == WEAK_LOCKED {
            return 0;
        }
        if self.strong.load(Relaxed) > 0 {
            weak.saturating_sub(1)
        } else {
            weak
        }
    }

    /// Increments `strong` only if it is still above zero.
    pub(crate) fn try_acquire_strong(&self) -> bool {
        let mut contention = self.backoff.start();
        let mut n = self.strong.load(Relaxed);
        loop {
            if n == 0 {
                return false;
            }
            if n > MAX_REFCOUNT {
                std::process::abort();
            }
            match self
                .strong
                .compare_exchange_weak(n, n + 1, Acquire, Relaxed)
            {
                Ok(_) => return true,
                Err(actual) => {
                    n = actual;
                    contention.snooze();
                }
            }
        }
    }

    /// Increments `weak`. Waits out a concurrent `is_unique` check.
    pub(crate) fn acquire_weak(&self) {
        let mut contention = self.backoff.start();
        let mut n = self.weak.load(Relaxed);
        loop {
            if n == WEAK_LOCKED {
                contention.snooze();
                n = self.weak.load(Relaxed);
                continue;
            }
            if n > MAX_REFCOUNT {
                std::process::abort();
            }
            match self.weak.compare_exchange_weak(n, n + 1, Acquire, Relaxed) {
                Ok(_) => return,
                Err(actual) => {
                    n = actual;
                    contention.snooze();
                }
            }
        }
    }

    /// Decrements `counter` and returns its previous value.
    ///
    /// Panics if the counter is already zero: some handle was released twice.
    fn decrement(&self, counter: &AtomicUsize, name: &'static str) -> usize {
        let mut contention = self.backoff.start();
        let mut n = counter.load(Relaxed);
        loop {
            if n == 0 {
                log::error!("{name} count released while already zero");
                panic!("{name} count released while already zero");
            }
            match counter.compare_exchange_weak(n, n - 1, Release, Relaxed) {
                Ok(_) => return n,
                Err(actual) => {
                    n = actual;
                    contention.snooze();
                }
            }
        }
    }

    /// Gives up one strong reference. The last one drops the payload and then
    /// the weak unit held on behalf of all strong handles.
    ///
    /// Safety: the caller owns one strong reference to the live block `this`
    /// and does not use it again.
    pub(crate) unsafe fn release_strong(this: NonNull<Self>) {
        let block = this.as_ref();
        if block.decrement(&block.strong, "strong") == 1 {
            fence(Acquire);
            log::trace!(target: "shared_handles::control_block", "finalizing payload at {:p}", this);
            // Releases the strong handles' weak unit even if the payload's
            // destructor panics.
            let _unit = SharedWeakUnit(this);
            // Safety: the strong count is zero, nothing can reach the payload
            // anymore and `try_acquire_strong` refuses to bring it back.
            ManuallyDrop::drop(&mut *block.payload.get());
        }
    }

    /// Gives up one weak unit, freeing the block when it was the last.
    ///
    /// Safety: the caller owns one weak unit of the live block `this` and
    /// does not use it again.
    pub(crate) unsafe fn release_weak(this: NonNull<Self>) {
        let block = this.as_ref();
        if block.decrement(&block.weak, "weak") == 1 {
            fence(Acquire);
            Self::finalize(this);
        }
    }

    unsafe fn finalize(this: NonNull<Self>) {
        log::trace!(target: "shared_handles::control_block", "finalizing control block at {:p}", this);
        #[cfg(test)]
        BLOCKS_FINALIZED.with(|count| count.set(count.get() + 1));
        // The payload is `ManuallyDrop` and already gone, so there is
        // nothing left to drop in place.
        alloc::dealloc(this.as_ptr().cast(), Self::layout());
    }

    /// Safety: the caller holds a strong reference.
    pub(crate) unsafe fn payload(&self) -> &T {
        &*self.payload.get()
    }

    /// True if the caller's strong reference is the only handle of any kind.
    pub(crate) fn is_unique(&self) -> bool {
        // Acquire matches `release_weak`'s Release decrement, so any strong
        // handle a weak handle upgraded to before going away is visible below.
        if self
            .weak
            .compare_exchange(1, WEAK_LOCKED, Acquire, Relaxed)
            .is_err()
        {
            return false;
        }
        let unique = self.strong.load(Acquire) == 1;
        // Release matches the Acquire in `acquire_weak`.
        self.weak.store(1, Release);
        unique
    }

    /// Safety: the caller holds the only handle to `this` (see `is_unique`)
    /// and that handle is borrowed mutably for the returned lifetime.
    pub(crate) unsafe fn payload_mut<'a>(this: NonNull<Self>) -> &'a mut T {
        &mut *(*this.as_ptr()).payload.get()
    }

    /// Moves the payload out if the caller holds the only strong reference.
    /// On success the caller's strong reference is consumed.
    ///
    /// Safety: the caller owns one strong reference to the live block `this`.
    pub(crate) unsafe fn try_take(this: NonNull<Self>) -> Option<T> {
        let block = this.as_ref();
        if block.strong.compare_exchange(1, 0, Relaxed, Relaxed).is_err() {
            return None;
        }
        fence(Acquire);
        // Safety: strong just went from one to zero, so this is the last
        // access to the payload and it is never dropped in place.
        let value = ptr::read(&**block.payload.get());
        Self::release_weak(this);
        Some(value)
    }
}
