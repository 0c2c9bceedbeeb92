//! Owning-task identification
use core::{fmt, num::NonZeroUsize};

/// An opaque identifier of the task that owns an allocation.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskTag(NonZeroUsize);

impl TaskTag {
    #[inline]
    pub const fn new(raw: usize) -> Option<Self> {
        match NonZeroUsize::new(raw) {
            Some(x) => Some(Self(x)),
            None => None,
        }
    }

    #[inline]
    pub const fn get(self) -> usize {
        self.0.get()
    }
}

impl fmt::Debug for TaskTag {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "TaskTag({:#x})", self.get())
    }
}

/// Provides the identity of the calling task. Consulted when an allocation is
/// made if owner tracking is enabled.
pub trait TaskIdentity: Send + Sync {
    /// Get the current task, or `None` outside of any task (e.g., during
    /// initialization).
    fn current_task(&self) -> Option<TaskTag>;
}

/// A [`TaskIdentity`] that never knows the current task.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoTaskIdentity;

impl TaskIdentity for NoTaskIdentity {
    #[inline]
    fn current_task(&self) -> Option<TaskTag> {
        None
    }
}
