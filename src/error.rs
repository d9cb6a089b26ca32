//! Recoverable errors.
//!
//! Releasing a counter that is already zero is not represented here: it is a
//! bug in the caller and panics instead.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandleError {
    /// The allocator could not provide memory for a control block.
    #[error("failed to allocate a control block of {size} bytes (align {align})")]
    AllocFailed { size: usize, align: usize },

    /// The handle does not reference any control block.
    #[error("handle is empty")]
    Empty,
}

pub type Result<T, E = HandleError> = std::result::Result<T, E>;
