//! Thread-safe strong and weak handles sharing one out-of-band control block.
//!
//! A [`StrongHandle`] keeps its payload alive; a [`WeakHandle`] only keeps
//! the control block alive and can be promoted back with
//! [`WeakHandle::lock`] while at least one strong handle remains.
//!
//! ```
//! use shared_handles::{StrongHandle, WeakHandle};
//!
//! let strong = StrongHandle::new(String::from("entity"));
//! let weak = WeakHandle::new(&strong);
//! assert_eq!(weak.lock().as_str(), "entity");
//!
//! drop(strong);
//! assert!(weak.lock().is_empty());
//! ```
//!
//! Two payloads that hold strong handles to each other are never finalized.
//! Make at least one side of such a cycle a `WeakHandle`.

mod error;
mod refcount;

pub use error::{HandleError, Result};
pub use refcount::{Backoff, StrongHandle, WeakHandle};
