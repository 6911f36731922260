use std::any::Any;
use std::future::Future;
use std::marker::PhantomData;
use std::mem;
use std::panic;

use crate::awaiter::{Awaitable, Awaiter};
use crate::frame::{self, Promise};
use crate::handle::Handle;
use crate::scope::Scope;

/// Create a lazy coroutine from `f`. The closure runs right away to build
/// the body, but no body code executes until the task is awaited (or its
/// handle is resumed by a driver such as a thread pool).
pub fn task<Fun, F>(f: Fun) -> Task<F::Output>
where
    Fun: FnOnce(Scope) -> F,
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    Task {
        handle: frame::make_frame(TaskPromise::new(), f),
        _result: PhantomData,
    }
}

/// A lazy, one-shot coroutine future. Awaiting it records the awaiter as
/// the continuation and transfers into the body; when the body finishes,
/// the continuation is resumed by symmetric transfer and the result (or the
/// captured panic) surfaces at `await_resume`.
///
/// A task uniquely owns its frame: moving the task transfers ownership and
/// dropping it destroys the frame, including one that was never awaited (no
/// body code runs in that case).
pub struct Task<T> {
    handle: Handle,
    _result: PhantomData<T>,
}

// SAFETY: the body future is required to be Send at creation; the handle is
// only a reference to it.
unsafe impl<T: Send> Send for Task<T> {}

impl<T: Send + 'static> Task<T> {
    /// The frame handle, for drivers and custom awaiters. Ownership stays
    /// with the task, which must outlive any use of the returned handle.
    pub fn raw_handle(&self) -> Handle {
        self.handle
    }

    /// True once the body has finished and the result is waiting.
    pub fn is_done(&self) -> bool {
        // SAFETY: the task owns its frame, so the handle is alive.
        unsafe { self.handle.done() }
    }

    /// Record `continuation` and hand back this task's own frame, so the
    /// caller transfers straight into the body.
    fn start(&mut self, continuation: Handle) -> Handle {
        // SAFETY: the task owns its frame and nothing else is driving it.
        let promise = unsafe { self.handle.promise_mut::<TaskPromise<T>>() };
        promise.continuation = continuation;
        self.handle
    }

    fn take_result(&mut self) -> T {
        // SAFETY: as in `start`.
        let promise = unsafe { self.handle.promise_mut::<TaskPromise<T>>() };
        match mem::replace(&mut promise.result, TaskResult::Taken) {
            TaskResult::Value(value) => value,
            TaskResult::Panicked(payload) => panic::resume_unwind(payload),
            TaskResult::Empty => panic!("task resumed its awaiter before completing"),
            TaskResult::Taken => panic!("task awaited twice"),
        }
    }
}

impl<T> Drop for Task<T> {
    fn drop(&mut self) {
        // SAFETY: unique ownership. A frame parked elsewhere (a pool queue,
        // a custom awaiter) must be kept alive by keeping the task alive.
        unsafe { self.handle.destroy() };
    }
}

enum TaskResult<T> {
    Empty,
    Value(T),
    Panicked(Box<dyn Any + Send>),
    Taken,
}

pub(crate) struct TaskPromise<T> {
    result: TaskResult<T>,
    continuation: Handle,
}

impl<T> TaskPromise<T> {
    fn new() -> TaskPromise<T> {
        TaskPromise {
            result: TaskResult::Empty,
            continuation: Handle::noop(),
        }
    }
}

impl<T: Send + 'static> Promise for TaskPromise<T> {
    type Return = T;

    fn return_value(&mut self, value: T) {
        self.result = TaskResult::Value(value);
    }

    fn unhandled_panic(&mut self, payload: Box<dyn Any + Send>) {
        self.result = TaskResult::Panicked(payload);
    }

    fn final_transfer(&mut self) -> Handle {
        self.continuation
    }
}

/// Awaiter of an owned task. It holds the task for the duration of the
/// await, so a task awaited by value lives inside its awaiter entry and is
/// destroyed when the entry unwinds.
pub struct TaskAwaiter<T> {
    task: Task<T>,
}

impl<T: Send + 'static> TaskAwaiter<T> {
    #[cfg(test)]
    pub(crate) fn task(&self) -> &Task<T> {
        &self.task
    }
}

impl<T: Send + 'static> Awaiter for TaskAwaiter<T> {
    type Output = T;
    type Suspend = Handle;

    fn await_ready(&mut self) -> bool {
        false
    }

    fn await_suspend(&mut self, caller: Handle) -> Handle {
        self.task.start(caller)
    }

    fn await_resume(mut self) -> T {
        self.task.take_result()
    }
}

impl<T: Send + 'static> Awaitable for Task<T> {
    type Awaiter = TaskAwaiter<T>;

    fn into_awaiter(self) -> TaskAwaiter<T> {
        TaskAwaiter { task: self }
    }
}

/// Awaiter of a borrowed task. The task, and with it the result's storage,
/// stays with the caller.
pub struct TaskRefAwaiter<'a, T> {
    task: &'a mut Task<T>,
}

impl<T: Send + 'static> Awaiter for TaskRefAwaiter<'_, T> {
    type Output = T;
    type Suspend = Handle;

    fn await_ready(&mut self) -> bool {
        false
    }

    fn await_suspend(&mut self, caller: Handle) -> Handle {
        self.task.start(caller)
    }

    fn await_resume(self) -> T {
        self.task.take_result()
    }
}

impl<'a, T: Send + 'static> Awaitable for &'a mut Task<T> {
    type Awaiter = TaskRefAwaiter<'a, T>;

    fn into_awaiter(self) -> TaskRefAwaiter<'a, T> {
        TaskRefAwaiter { task: self }
    }
}
