use std::collections::VecDeque;
use std::error::Error;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, ThreadId};

use log::trace;

/// The distinguished error an operation reports when it observes
/// cancellation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Cancelled;

impl fmt::Display for Cancelled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("operation cancelled")
    }
}

impl Error for Cancelled {}

struct CancelState {
    cancelled: AtomicBool,
    sources: AtomicUsize,
    callbacks: Mutex<Callbacks>,
    unblock: Condvar,
}

struct Callbacks {
    entries: VecDeque<CallbackEntry>,
    next_id: u64,
    /// Id of the callback the cancel routine is invoking right now, and the
    /// thread invoking it. Lets a deregistration racing that exact callback
    /// wait instead of freeing it under the iterator.
    firing: Option<(u64, ThreadId)>,
}

struct CallbackEntry {
    id: u64,
    callback: Box<dyn FnOnce() + Send>,
}

/// Owner of a shared cancellation state. Tokens observe it; [`cancel`]
/// trips it exactly once.
///
/// [`cancel`]: CancellationSource::cancel
pub struct CancellationSource {
    state: Arc<CancelState>,
}

impl CancellationSource {
    pub fn new() -> CancellationSource {
        CancellationSource {
            state: Arc::new(CancelState {
                cancelled: AtomicBool::new(false),
                sources: AtomicUsize::new(1),
                callbacks: Mutex::new(Callbacks {
                    entries: VecDeque::new(),
                    next_id: 0,
                    firing: None,
                }),
                unblock: Condvar::new(),
            }),
        }
    }

    pub fn token(&self) -> CancellationToken {
        CancellationToken {
            state: Some(Arc::clone(&self.state)),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::SeqCst)
    }

    /// Trip the flag, then run every registered callback exactly once, in
    /// registration order, outside the list lock. Idempotent; a reentrant
    /// call from inside a callback is a no-op. Callbacks may deregister
    /// themselves or others.
    pub fn cancel(&self) {
        if self.state.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        trace!("cancellation tripped");
        loop {
            let entry = {
                let mut callbacks = self.state.callbacks.lock().unwrap();
                match callbacks.entries.pop_front() {
                    Some(entry) => {
                        callbacks.firing = Some((entry.id, thread::current().id()));
                        entry
                    }
                    None => break,
                }
            };
            (entry.callback)();
            self.state.callbacks.lock().unwrap().firing = None;
            self.state.unblock.notify_all();
        }
    }
}

impl Clone for CancellationSource {
    fn clone(&self) -> CancellationSource {
        self.state.sources.fetch_add(1, Ordering::SeqCst);
        CancellationSource {
            state: Arc::clone(&self.state),
        }
    }
}

impl Drop for CancellationSource {
    fn drop(&mut self) {
        self.state.sources.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Default for CancellationSource {
    fn default() -> CancellationSource {
        CancellationSource::new()
    }
}

/// Lightweight observer of a [`CancellationSource`]. Cloning is cheap; every
/// token keeps the shared state alive.
#[derive(Clone, Default)]
pub struct CancellationToken {
    state: Option<Arc<CancelState>>,
}

impl CancellationToken {
    /// A token that can never be cancelled.
    pub fn none() -> CancellationToken {
        CancellationToken { state: None }
    }

    /// True while cancellation can still be observed: some source is alive,
    /// or the state already cancelled.
    pub fn can_be_cancelled(&self) -> bool {
        self.state.as_ref().map_or(false, |state| {
            state.cancelled.load(Ordering::SeqCst) || state.sources.load(Ordering::SeqCst) > 0
        })
    }

    pub fn is_cancelled(&self) -> bool {
        self.state
            .as_ref()
            .map_or(false, |state| state.cancelled.load(Ordering::SeqCst))
    }

    /// `Err(Cancelled)` once the source has cancelled.
    pub fn check_cancelled(&self) -> Result<(), Cancelled> {
        if self.is_cancelled() {
            Err(Cancelled)
        } else {
            Ok(())
        }
    }

    /// Run `callback` when the source cancels. Registering on an already
    /// cancelled token runs the callback synchronously and returns a spent
    /// registration. The registration's scope bounds the callback's
    /// liveness: once it is dropped the callback has either run or never
    /// will.
    pub fn register<F>(&self, callback: F) -> CancellationRegistration
    where
        F: FnOnce() + Send + 'static,
    {
        let Some(state) = &self.state else {
            return CancellationRegistration { state: None, id: 0 };
        };
        {
            let mut callbacks = state.callbacks.lock().unwrap();
            // Checked under the lock: if cancel trips the flag after this,
            // its drain runs after we unlock and finds the new entry.
            if !state.cancelled.load(Ordering::SeqCst) {
                let id = callbacks.next_id;
                callbacks.next_id += 1;
                callbacks.entries.push_back(CallbackEntry {
                    id,
                    callback: Box::new(callback),
                });
                return CancellationRegistration {
                    state: Some(Arc::clone(state)),
                    id,
                };
            }
        }
        callback();
        CancellationRegistration { state: None, id: 0 }
    }
}

/// Scope of one registered callback. Dropping it guarantees the callback is
/// not running and never will: a drop racing the callback's own invocation
/// blocks until the callback returns, except when the callback deregisters
/// itself.
pub struct CancellationRegistration {
    state: Option<Arc<CancelState>>,
    id: u64,
}

impl Drop for CancellationRegistration {
    fn drop(&mut self) {
        let Some(state) = self.state.take() else {
            return;
        };
        let mut callbacks = state.callbacks.lock().unwrap();
        if let Some(at) = callbacks.entries.iter().position(|entry| entry.id == self.id) {
            callbacks.entries.remove(at);
            return;
        }
        // Already ran, or is being invoked right now. Wait that out, unless
        // the callback is the one dropping us.
        while let Some((firing, on_thread)) = callbacks.firing {
            if firing != self.id || on_thread == thread::current().id() {
                break;
            }
            callbacks = state.unblock.wait(callbacks).unwrap();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::time::Duration;

    use super::*;

    #[test]
    fn callbacks_fire_once_in_registration_order() {
        let source = CancellationSource::new();
        let token = source.token();
        let order = Arc::new(Mutex::new(Vec::new()));
        let regs: Vec<_> = (0..5)
            .map(|i| {
                let order = Arc::clone(&order);
                token.register(move || order.lock().unwrap().push(i))
            })
            .collect();
        source.cancel();
        source.cancel();
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
        drop(regs);
    }

    #[test]
    fn registering_after_cancel_runs_synchronously() {
        let source = CancellationSource::new();
        let token = source.token();
        source.cancel();
        let ran = Arc::new(AtomicBool::new(false));
        let observed = Arc::clone(&ran);
        let reg = token.register(move || observed.store(true, Ordering::SeqCst));
        assert!(ran.load(Ordering::SeqCst));
        drop(reg);
    }

    #[test]
    fn dropped_registrations_never_fire() {
        let source = CancellationSource::new();
        let token = source.token();
        let count = Arc::new(AtomicUsize::new(0));
        let observed = Arc::clone(&count);
        let reg = token.register(move || {
            observed.fetch_add(1, Ordering::SeqCst);
        });
        drop(reg);
        source.cancel();
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn a_callback_may_deregister_itself() {
        let source = CancellationSource::new();
        let token = source.token();
        let slot: Arc<Mutex<Option<CancellationRegistration>>> = Arc::new(Mutex::new(None));
        let own = Arc::clone(&slot);
        let reg = token.register(move || {
            own.lock().unwrap().take();
        });
        *slot.lock().unwrap() = Some(reg);
        // must not deadlock on the registration waiting for itself
        source.cancel();
        assert!(slot.lock().unwrap().is_none());
    }

    #[test]
    fn deregistration_waits_for_a_firing_callback() {
        for _ in 0..100 {
            let source = CancellationSource::new();
            let token = source.token();
            let count = Arc::new(AtomicUsize::new(0));
            let observed = Arc::clone(&count);
            let reg = token.register(move || {
                observed.fetch_add(1, Ordering::SeqCst);
            });
            let canceller = thread::spawn(move || source.cancel());
            drop(reg);
            // once the registration is gone the count may no longer change
            let snapshot = count.load(Ordering::SeqCst);
            canceller.join().unwrap();
            assert_eq!(count.load(Ordering::SeqCst), snapshot);
            assert!(snapshot <= 1);
        }
    }

    #[test]
    fn can_be_cancelled_tracks_the_source() {
        let token = CancellationToken::none();
        assert!(!token.can_be_cancelled());

        let source = CancellationSource::new();
        let token = source.token();
        assert!(token.can_be_cancelled());
        assert!(!token.is_cancelled());
        drop(source);
        assert!(!token.can_be_cancelled());

        let source = CancellationSource::new();
        let token = source.token();
        source.cancel();
        drop(source);
        // cancellation outlives the source
        assert!(token.can_be_cancelled());
        assert!(token.is_cancelled());
    }

    #[test]
    fn check_cancelled_reports_the_distinguished_error() {
        let source = CancellationSource::new();
        let token = source.token();
        assert_eq!(token.check_cancelled(), Ok(()));
        source.cancel();
        assert_eq!(token.check_cancelled(), Err(Cancelled));
        assert_eq!(Cancelled.to_string(), "operation cancelled");
    }

    #[test]
    fn cloned_sources_share_the_state() {
        let source = CancellationSource::new();
        let clone = source.clone();
        let token = source.token();
        drop(source);
        // a live clone keeps the token cancellable
        assert!(token.can_be_cancelled());
        clone.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn late_registration_during_slow_cancel_still_fires() {
        // register from another thread while cancel drains a slow callback
        let source = CancellationSource::new();
        let token = source.token();
        let _slow = token.register(|| thread::sleep(Duration::from_millis(20)));
        let ran = Arc::new(AtomicBool::new(false));
        let observed = Arc::clone(&ran);
        let late = thread::spawn(move || {
            thread::sleep(Duration::from_millis(5));
            token.register(move || observed.store(true, Ordering::SeqCst))
        });
        source.cancel();
        let reg = late.join().unwrap();
        // whichever side won the race, cancel has returned and the callback
        // must have run exactly once by now
        assert!(ran.load(Ordering::SeqCst));
        drop(reg);
    }
}
