use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use pin_project::pin_project;

use crate::handle::Handle;
use crate::scope::Scope;

/// Normalized outcome of [`Awaiter::await_suspend`].
#[derive(Clone, Copy, Debug)]
pub enum Transfer {
    /// Do not suspend after all: resume the awaiting coroutine immediately.
    Again,
    /// Suspension committed; resume this handle next. The no-op handle hands
    /// control back to whoever drives the current chain.
    Next(Handle),
}

impl From<()> for Transfer {
    fn from(_: ()) -> Transfer {
        Transfer::Next(Handle::noop())
    }
}

impl From<bool> for Transfer {
    fn from(suspend: bool) -> Transfer {
        if suspend {
            Transfer::Next(Handle::noop())
        } else {
            Transfer::Again
        }
    }
}

impl From<Handle> for Transfer {
    fn from(next: Handle) -> Transfer {
        Transfer::Next(next)
    }
}

/// The suspension protocol. When a coroutine awaits something, the runtime
/// asks the awaiter whether the result is already there ([`await_ready`]),
/// lets it park the coroutine's handle somewhere ([`await_suspend`]) and,
/// once the coroutine is resumed, collects the awaited value
/// ([`await_resume`]).
///
/// `await_suspend` may hand the caller's handle to another thread; from that
/// moment on everything the awaiter wrote beforehand must be published to
/// the resumer (a queue with a lock, a channel). That edge is the only
/// synchronization the runtime requires of an awaiter.
///
/// [`await_ready`]: Awaiter::await_ready
/// [`await_suspend`]: Awaiter::await_suspend
/// [`await_resume`]: Awaiter::await_resume
pub trait Awaiter {
    type Output;

    /// `()` (suspend and yield to the driver), `bool` (`false` resumes
    /// immediately) or [`Handle`] (symmetric transfer; returning the caller
    /// keeps it running).
    type Suspend: Into<Transfer>;

    fn await_ready(&mut self) -> bool;

    fn await_suspend(&mut self, caller: Handle) -> Self::Suspend;

    fn await_resume(self) -> Self::Output;
}

/// A value a coroutine can await through [`Scope::on`]. Awaiter types
/// implement this by identity; other types derive their awaiter here.
pub trait Awaitable {
    type Awaiter: Awaiter;

    fn into_awaiter(self) -> Self::Awaiter;
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum AwaitState {
    Running,
    Halted,
}

/// Future returned by [`Scope::on`]. Drives one awaited expression through
/// the protocol: the first poll materializes the awaiter and either resolves
/// on the spot or parks it in the frame; the resumption poll takes it back
/// and produces the value.
#[pin_project]
#[must_use = "futures do nothing unless you `.await` or poll them"]
pub struct Await<'a, E: Awaitable> {
    scope: &'a Scope,
    expr: Option<E>,
    state: AwaitState,
}

impl<'a, E: Awaitable> Await<'a, E> {
    pub(crate) fn new(scope: &'a Scope, expr: E) -> Await<'a, E> {
        Await {
            scope,
            expr: Some(expr),
            state: AwaitState::Running,
        }
    }
}

impl<E> Future for Await<'_, E>
where
    E: Awaitable,
    E::Awaiter: Send,
{
    type Output = <E::Awaiter as Awaiter>::Output;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context) -> Poll<Self::Output> {
        let this = self.project();
        match *this.state {
            AwaitState::Running => {
                let expr = this.expr.take().expect("awaited after completion");
                let mut awaiter = expr.into_awaiter();
                if awaiter.await_ready() {
                    return Poll::Ready(awaiter.await_resume());
                }
                *this.state = AwaitState::Halted;
                // SAFETY: the slot outlives the body future; both belong to
                // the frame currently polling us.
                unsafe { this.scope.slot().store(awaiter) };
                Poll::Pending
            }
            AwaitState::Halted => {
                *this.state = AwaitState::Running;
                // SAFETY: being polled again means the frame is back under
                // this thread's control, with the awaiter still parked.
                let awaiter: E::Awaiter = unsafe { this.scope.slot().take() };
                Poll::Ready(awaiter.await_resume())
            }
        }
    }
}
