use thiserror::Error;

use crate::object::CategoryId;

pub type Result<T> = std::result::Result<T, TrackerError>;

/// Errors surfaced by [`MemoryTracker`](crate::MemoryTracker).
///
/// Faults at addresses the tracker does not know about are *not* errors;
/// [`MemoryTracker::handle_access_violation`](crate::MemoryTracker::handle_access_violation)
/// reports those by returning `false`.
#[derive(Debug, Error)]
pub enum TrackerError {
    /// No factory registered for the requested object category. A
    /// configuration/programmer error: factories are installed once at
    /// startup, before any objects are requested.
    #[error("no factory registered for object category {category}")]
    MissingFactory { category: CategoryId },
}
