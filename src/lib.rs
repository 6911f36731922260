//! Lazy, stackless coroutines with symmetric transfer, a deadline-scheduling
//! thread pool and cooperative cancellation.
//!
//! A coroutine is an `async` block taking a [`Scope`](scope::Scope);
//! everything it awaits goes through [`Scope::on`](scope::Scope::on), which
//! is how the runtime learns where the body parked itself. Tasks are lazy:
//! the body only runs once the task is awaited, or once its handle is
//! resumed by a driver such as a [`ThreadPool`](thread_pool::ThreadPool)
//! worker. A completing task resumes whoever awaited it by symmetric
//! transfer, so arbitrarily deep task chains run in constant stack.
//!
//! ```
//! use siesta::prelude::*;
//! use siesta::awaiter::{Awaitable, Awaiter};
//!
//! let doubled = task(|sc| async move {
//!     let four = sc.on(task(|_| async { 2 + 2 })).await;
//!     four * 2
//! });
//!
//! // Drive it by hand: suspend on the task, trampoline until the chain
//! // yields back, then collect the result.
//! let mut awaiter = doubled.into_awaiter();
//! assert!(!awaiter.await_ready());
//! let next = awaiter.await_suspend(Handle::noop());
//! unsafe { next.resume_chain() };
//! assert_eq!(awaiter.await_resume(), 8);
//! ```

pub mod awaiter;
pub mod cancellation;
mod frame;
pub mod handle;
pub mod scope;
pub mod task;
pub mod thread_pool;

pub mod prelude {
    #[doc(hidden)]
    pub use crate::cancellation::{CancellationSource, CancellationToken, Cancelled};
    #[doc(hidden)]
    pub use crate::handle::Handle;
    #[doc(hidden)]
    pub use crate::scope::Scope;
    #[doc(hidden)]
    pub use crate::task::{task, Task};
    #[doc(hidden)]
    pub use crate::thread_pool::ThreadPool;
}
