use std::fmt;
use std::ptr::NonNull;

use crate::frame::{RawFrame, SuspensionPoint};

/// An opaque, copyable reference to a coroutine frame. A handle never owns
/// the frame; ownership sits with whoever holds the unique originating
/// handle, usually a [`Task`](crate::task::Task).
///
/// Resuming, destroying and inspecting a frame are `unsafe`: the caller
/// vouches that the frame is still alive and that no other thread is
/// driving it.
#[derive(Clone, Copy)]
pub struct Handle {
    frame: Option<NonNull<dyn RawFrame>>,
}

// SAFETY: a frame is driven by at most one thread at a time; every hand-off
// between threads goes through a synchronizing queue.
unsafe impl Send for Handle {}

impl Handle {
    /// The sentinel handle. Resuming it does nothing; a chain driver stops
    /// when it gets this back.
    pub fn noop() -> Handle {
        Handle { frame: None }
    }

    pub fn is_noop(&self) -> bool {
        self.frame.is_none()
    }

    pub(crate) fn from_frame(frame: &mut dyn RawFrame) -> Handle {
        // SAFETY: erasing the borrow's lifetime; callers are responsible for
        // not outliving the frame, per this type's documented invariants.
        let frame: &'static mut dyn RawFrame = unsafe { std::mem::transmute(frame) };
        Handle {
            frame: Some(NonNull::from(frame)),
        }
    }

    pub(crate) fn from_owned_frame(frame: Box<dyn RawFrame>) -> Handle {
        Handle {
            frame: Some(NonNull::from(Box::leak(frame))),
        }
    }

    /// Run the frame until its next suspension; returns the next handle to
    /// resume. Resuming the no-op handle returns the no-op handle.
    ///
    /// # Safety
    /// The frame must be alive, not done, and not driven by another thread.
    pub unsafe fn resume(self) -> Handle {
        match self.frame {
            Some(mut frame) => frame.as_mut().resume(),
            None => Handle::noop(),
        }
    }

    /// Drive a whole symmetric-transfer chain: resume this handle, then
    /// whatever it nominates, until some frame yields back the no-op
    /// sentinel. Stack use is constant in the length of the chain.
    ///
    /// # Safety
    /// As for [`Handle::resume`], for every frame in the chain.
    pub unsafe fn resume_chain(self) {
        let mut handle = self;
        while let Some(mut frame) = handle.frame {
            handle = frame.as_mut().resume();
        }
    }

    /// Free the frame. Parked awaiter entries are dropped in reverse
    /// construction order, then the promise.
    ///
    /// # Safety
    /// The handle must be the unique live reference to the frame and the
    /// frame must not be running. Not allowed on the no-op handle.
    pub unsafe fn destroy(self) {
        debug_assert!(!self.is_noop(), "destroyed the no-op handle");
        if let Some(frame) = self.frame {
            drop(Box::from_raw(frame.as_ptr()));
        }
    }

    /// True once the frame reached its final suspension.
    ///
    /// # Safety
    /// The frame must be alive.
    pub unsafe fn done(self) -> bool {
        self.frame.map_or(false, |frame| frame.as_ref().done())
    }

    #[cfg(test)]
    pub(crate) unsafe fn suspension_point(self) -> Option<SuspensionPoint> {
        self.frame.map(|frame| frame.as_ref().suspension_point())
    }

    /// Typed view of the frame's promise. Panics if `P` is not the promise
    /// type the frame was created with.
    ///
    /// # Safety
    /// The frame must be alive and not concurrently driven.
    pub(crate) unsafe fn promise_mut<'a, P: 'static>(self) -> &'a mut P {
        let frame = self.frame.expect("the no-op handle has no promise");
        (*frame.as_ptr())
            .promise_any()
            .downcast_mut::<P>()
            .expect("promise type mismatch")
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.frame {
            Some(frame) => write!(f, "Handle({:p})", frame.as_ptr()),
            None => f.write_str("Handle(noop)"),
        }
    }
}
