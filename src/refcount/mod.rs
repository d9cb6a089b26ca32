mod backoff;
mod control_block;
mod strong;
mod weak;

pub use backoff::Backoff;
pub use strong::StrongHandle;
pub use weak::WeakHandle;

#[cfg(test)]
mod proptests;
