use crate::awaiter::{Await, Awaitable};
use crate::frame::SuspendSlot;

/// The first parameter of every coroutine body and its only capability to
/// suspend: [`Scope::on`] adapts anything awaitable into a future the body
/// can `.await`. Awaiting a future that did not come from the scope leaves
/// the runtime unable to tell why the body yielded, which is reported as a
/// panic when the frame is resumed.
pub struct Scope {
    slot: *const SuspendSlot,
}

// SAFETY: the scope only carries a pointer into its own frame, and a frame
// is driven by a single thread at a time.
unsafe impl Send for Scope {}

// SAFETY: as above; a frame is never polled from two threads at once, so
// there is never genuine concurrent access through a shared `&Scope`.
unsafe impl Sync for Scope {}

impl Scope {
    pub(crate) fn new(slot: &SuspendSlot) -> Scope {
        Scope { slot }
    }

    /// Await `expr`. The returned future resolves to the awaiter's output
    /// once the runtime resumes this coroutine.
    pub fn on<E>(&self, expr: E) -> Await<'_, E>
    where
        E: Awaitable,
        E::Awaiter: Send,
    {
        Await::new(self, expr)
    }

    /// The suspend slot of the frame this scope belongs to.
    ///
    /// # Safety
    /// Only valid while the frame is alive, which is guaranteed while its
    /// body (and thus the scope) is being polled.
    pub(crate) unsafe fn slot(&self) -> &SuspendSlot {
        &*self.slot
    }
}
