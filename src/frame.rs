use std::any::Any;
use std::cell::{Cell, UnsafeCell};
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::ptr::NonNull;
use std::task::{Context, Poll};

use pin_project::pin_project;

use crate::awaiter::{Awaiter, Transfer};
use crate::handle::Handle;
use crate::scope::Scope;

const FOREIGN_AWAIT: &str = "a coroutine returned Pending without parking an awaiter.
That usually means the body awaited a future which is not part of this runtime.";

/// Where a frame currently is in its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SuspensionPoint {
    /// The frame exists but its initial suspension has not been evaluated.
    InitialSuspendBegin,
    /// Parked on the initial suspension. No body code has run yet.
    InitialSuspend,
    /// Parked on the awaiting expression with this index.
    At(u32),
    /// The body finished. The frame waits to be destroyed.
    FinalSuspend,
}

/// State a coroutine factory attaches to its frame, shaped by the coroutine's
/// return type. The frame funnels the body's outcome through it and asks it
/// where control goes on final suspension.
pub(crate) trait Promise: Send + 'static {
    type Return;

    fn return_value(&mut self, value: Self::Return);

    fn unhandled_panic(&mut self, payload: Box<dyn Any + Send>);

    /// Handle to resume once the frame reaches its final suspension.
    fn final_transfer(&mut self) -> Handle;
}

/// Type-erased view of a frame, what a [`Handle`] points at.
pub(crate) trait RawFrame: Send {
    /// Run the frame until its next suspension and return the next handle to
    /// resume.
    ///
    /// # Safety
    /// The frame must not be done and must not be driven by another thread.
    unsafe fn resume(&mut self) -> Handle;

    fn done(&self) -> bool;

    #[cfg(test)]
    fn suspension_point(&self) -> SuspensionPoint;

    fn promise_any(&mut self) -> &mut dyn Any;
}

/// Shared cell through which a body's awaiters talk to their frame. It lives
/// in its own box so the [`Scope`] captured by the body can point at it
/// before the frame itself exists.
pub(crate) struct SuspendSlot {
    pending: UnsafeCell<Option<Pending>>,
    next_index: Cell<u32>,
}

/// One awaiter entry, parked in the slot for the duration of a suspension.
struct Pending {
    index: u32,
    awaiter: NonNull<()>,
    suspend: unsafe fn(NonNull<()>, Handle) -> Transfer,
    drop: unsafe fn(NonNull<()>),
}

// SAFETY: the awaiter behind the pointer is required to be Send when stored,
// and the slot is only touched by the thread currently driving the frame.
unsafe impl Send for SuspendSlot {}

impl SuspendSlot {
    fn new() -> SuspendSlot {
        SuspendSlot {
            pending: UnsafeCell::new(None),
            next_index: Cell::new(0),
        }
    }

    /// Park `awaiter` for the suspension about to be committed.
    ///
    /// # Safety
    /// Only the thread currently driving the frame may call this.
    pub(crate) unsafe fn store<A: Awaiter + Send>(&self, awaiter: A) {
        let pending = &mut *self.pending.get();
        assert!(
            pending.is_none(),
            "a coroutine entered an await while another one is still pending; \
             awaiting two things at once is not supported"
        );
        let index = self.next_index.get();
        self.next_index.set(index + 1);
        *pending = Some(Pending {
            index,
            awaiter: NonNull::new_unchecked(Box::into_raw(Box::new(awaiter)).cast()),
            suspend: suspend_erased::<A>,
            drop: drop_erased::<A>,
        });
    }

    /// Take the parked awaiter back on resumption.
    ///
    /// # Safety
    /// Same contract as [`SuspendSlot::store`]; `A` must be the type stored
    /// last.
    pub(crate) unsafe fn take<A: Awaiter + Send>(&self) -> A {
        let pending = (*self.pending.get())
            .take()
            .expect("resumed an await with no parked awaiter");
        *Box::from_raw(pending.awaiter.cast::<A>().as_ptr())
    }
}

unsafe fn suspend_erased<A: Awaiter>(awaiter: NonNull<()>, caller: Handle) -> Transfer {
    awaiter.cast::<A>().as_mut().await_suspend(caller).into()
}

unsafe fn drop_erased<A>(awaiter: NonNull<()>) {
    drop(Box::from_raw(awaiter.cast::<A>().as_ptr()));
}

impl Drop for SuspendSlot {
    fn drop(&mut self) {
        if let Some(pending) = self.pending.get_mut().take() {
            // SAFETY: the entry was leaked by `store` and never taken back.
            unsafe { (pending.drop)(pending.awaiter) };
        }
    }
}

/// Heap activation record of a coroutine: the promise, the body future and
/// the bookkeeping that lets the body suspend. Field order doubles as drop
/// order: the body (and its inline awaiters) first, then any parked awaiter
/// entry, then the promise.
#[pin_project]
pub(crate) struct Frame<P: Promise, F: Future<Output = P::Return>> {
    #[pin]
    body: F,
    slot: Box<SuspendSlot>,
    promise: P,
    point: SuspensionPoint,
}

/// Allocate a frame for the coroutine built by `f` and return the unique
/// handle to it. The frame parks on its initial suspension; no body code
/// runs here.
pub(crate) fn make_frame<P, F, Fun>(promise: P, f: Fun) -> Handle
where
    P: Promise,
    Fun: FnOnce(Scope) -> F,
    F: Future<Output = P::Return> + Send + 'static,
{
    let slot = Box::new(SuspendSlot::new());
    let scope = Scope::new(&slot);
    let body = f(scope);
    let mut frame = Box::new(Frame {
        body,
        slot,
        promise,
        point: SuspensionPoint::InitialSuspendBegin,
    });
    // The initial suspension is unconditional: park before any body code.
    frame.point = SuspensionPoint::InitialSuspend;
    Handle::from_owned_frame(frame)
}

impl<P, F> RawFrame for Frame<P, F>
where
    P: Promise,
    F: Future<Output = P::Return> + Send + 'static,
{
    unsafe fn resume(&mut self) -> Handle {
        debug_assert!(!self.done(), "resumed a frame past its final suspension");
        let this: *mut Self = self;
        loop {
            let waker = waker::noop();
            let mut cx = Context::from_waker(&waker);
            let poll = panic::catch_unwind(AssertUnwindSafe(|| {
                // SAFETY: the frame lives on the heap and never moves once a
                // handle to it exists.
                let projected = Pin::new_unchecked(&mut *this).project();
                projected.body.poll(&mut cx)
            }));
            match poll {
                Ok(Poll::Ready(value)) => {
                    let frame = &mut *this;
                    frame.promise.return_value(value);
                    frame.point = SuspensionPoint::FinalSuspend;
                    return frame.promise.final_transfer();
                }
                Err(payload) => {
                    let frame = &mut *this;
                    frame.promise.unhandled_panic(payload);
                    frame.point = SuspensionPoint::FinalSuspend;
                    return frame.promise.final_transfer();
                }
                Ok(Poll::Pending) => {
                    let (index, awaiter, suspend) = match &*(*this).slot.pending.get() {
                        Some(pending) => (pending.index, pending.awaiter, pending.suspend),
                        None => panic!("{}", FOREIGN_AWAIT),
                    };
                    (*this).point = SuspensionPoint::At(index);
                    let own = Handle::from_frame(&mut *this);
                    // Once `suspend` hands `own` to another executor the
                    // frame may be resumed or destroyed by any thread, so
                    // nothing past this call may touch `this`.
                    match suspend(awaiter, own) {
                        Transfer::Again => continue,
                        Transfer::Next(next) => return next,
                    }
                }
            }
        }
    }

    fn done(&self) -> bool {
        self.point == SuspensionPoint::FinalSuspend
    }

    #[cfg(test)]
    fn suspension_point(&self) -> SuspensionPoint {
        self.point
    }

    fn promise_any(&mut self) -> &mut dyn Any {
        &mut self.promise
    }
}

mod waker {
    use std::task::{RawWaker, RawWakerVTable, Waker};

    pub fn noop() -> Waker {
        // SAFETY: the vtable functions do nothing, which is memory safe.
        unsafe { Waker::from_raw(RAW_WAKER) }
    }

    const RAW_WAKER: RawWaker = RawWaker::new(std::ptr::null(), &VTABLE);
    const VTABLE: RawWakerVTable = RawWakerVTable::new(clone, do_nothing, do_nothing, do_nothing);

    unsafe fn clone(_: *const ()) -> RawWaker {
        RAW_WAKER
    }
    unsafe fn do_nothing(_: *const ()) {}
}
