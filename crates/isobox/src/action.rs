//! Worker threads with cooperative abort.
//!
//! An action runs a blocking body on its own OS thread, outside the event
//! scope. Abort is cooperative: the body observes the abort request at
//! checkpoints ([`ActionScope::sleep`], [`ActionScope::checkpoint`]) and
//! unwinds by returning [`Error::Aborted`]. Bodies that never reach a
//! checkpoint run to completion even after an abort request.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::error::{Error, Result};
use crate::event_loop::EventLoop;

struct ActionInner {
    name: String,
    event_loop: Weak<EventLoop>,
    /// Set by [`Action::abort`]; observed at body checkpoints.
    aborted: AtomicBool,
    /// Wakes an [`ActionScope::sleep`] early when an abort arrives.
    wakeup: Condvar,
    wakeup_lock: Mutex<()>,
    /// Set once the body has returned and the action deregistered itself.
    finished: Mutex<bool>,
    finished_cond: Condvar,
    handle: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to a running (or finished) worker thread.
///
/// Cloning the handle is cheap; all clones refer to the same thread.
#[derive(Clone)]
pub struct Action {
    inner: Arc<ActionInner>,
}

impl Action {
    /// Name the action was started with.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Identity comparison between handles.
    pub fn same(a: &Action, b: &Action) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }

    /// Has an abort been requested?
    pub fn abort_requested(&self) -> bool {
        self.inner.aborted.load(Ordering::SeqCst)
    }

    /// Has the body returned?
    pub fn finished(&self) -> bool {
        *self.inner.finished.lock()
    }

    /// Request a cooperative abort and wake the action if it is sleeping.
    /// Does not wait for the action to terminate.
    pub fn abort(&self) {
        self.inner.aborted.store(true, Ordering::SeqCst);
        let _guard = self.inner.wakeup_lock.lock();
        self.inner.wakeup.notify_all();
    }

    /// Block until the body has returned. Returns immediately when called
    /// from the action's own thread, since waiting there would deadlock.
    pub fn join(&self) {
        if let Some(handle) = self.inner.handle.lock().take() {
            if handle.thread().id() == std::thread::current().id() {
                return;
            }
            // The body cannot panic through the catch_unwind barrier, so a
            // join error would mean the thread was killed externally.
            let _ = handle.join();
            return;
        }
        // Another handle holds (or already consumed) the join handle; wait
        // on the finished flag instead.
        let mut finished = self.inner.finished.lock();
        while !*finished {
            self.inner.finished_cond.wait(&mut finished);
        }
    }

    fn finish(&self) {
        if let Some(event_loop) = self.inner.event_loop.upgrade() {
            event_loop.deregister_action(self);
        }
        let mut finished = self.inner.finished.lock();
        *finished = true;
        self.inner.finished_cond.notify_all();
    }
}

impl std::fmt::Debug for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Action")
            .field("name", &self.inner.name)
            .field("finished", &self.finished())
            .finish()
    }
}

/// Passed to the action body; the body's window onto abort requests.
pub struct ActionScope {
    action: Action,
}

impl ActionScope {
    /// Handle to the action itself, e.g. for handing to other scopes.
    pub fn action(&self) -> Action {
        self.action.clone()
    }

    /// Return `Err(Error::Aborted)` if an abort has been requested. Call
    /// this inside long-running work; `?` it to unwind cooperatively.
    pub fn checkpoint(&self) -> Result<()> {
        if self.action.abort_requested() {
            Err(Error::Aborted)
        } else {
            Ok(())
        }
    }

    /// Sleep for `dur`, waking early with `Err(Error::Aborted)` if an abort
    /// request arrives.
    pub fn sleep(&self, dur: Duration) -> Result<()> {
        let inner = &self.action.inner;
        let deadline = std::time::Instant::now() + dur;
        let mut guard = inner.wakeup_lock.lock();
        loop {
            if inner.aborted.load(Ordering::SeqCst) {
                return Err(Error::Aborted);
            }
            if inner.wakeup.wait_until(&mut guard, deadline).timed_out() {
                return self.checkpoint();
            }
        }
    }
}

impl EventLoop {
    /// Spawn a worker thread registered with this isolate.
    ///
    /// The body runs outside the event scope and may block freely. An
    /// `Err(Error::Aborted)` return is a quiet cooperative unwind; any
    /// other error is logged and lost, since nobody is blocked waiting for
    /// an action's result. Results that matter go back through a stored
    /// completion or an internal proc.
    pub(crate) fn start_action<F>(self: &Arc<Self>, name: &str, body: F) -> Result<Action>
    where
        F: FnOnce(&ActionScope) -> Result<()> + Send + 'static,
    {
        if self.is_shutdown() {
            return Err(Error::Terminated);
        }
        let action = Action {
            inner: Arc::new(ActionInner {
                name: name.to_string(),
                event_loop: Arc::downgrade(self),
                aborted: AtomicBool::new(false),
                wakeup: Condvar::new(),
                wakeup_lock: Mutex::new(()),
                finished: Mutex::new(false),
                finished_cond: Condvar::new(),
                handle: Mutex::new(None),
            }),
        };
        self.register_action(action.clone());

        // Handshake so the spawned thread sees its own handle before the
        // body runs.
        let (tx, rx) = mpsc::sync_channel::<Action>(1);
        let thread_name = format!("isobox-action-{name}");
        let spawned = std::thread::Builder::new()
            .name(thread_name)
            .spawn(move || {
                let Ok(action) = rx.recv() else { return };
                let scope = ActionScope {
                    action: action.clone(),
                };
                let outcome = catch_unwind(AssertUnwindSafe(|| body(&scope)));
                match outcome {
                    Ok(Ok(())) | Ok(Err(Error::Aborted)) => {}
                    Ok(Err(err)) => {
                        tracing::error!("action `{}` failed: {}", action.name(), err);
                    }
                    Err(_) => {
                        tracing::error!("action `{}` panicked", action.name());
                    }
                }
                action.finish();
            });
        let handle = match spawned {
            Ok(handle) => handle,
            Err(err) => {
                self.deregister_action(&action);
                return Err(Error::Spawn(err.to_string()));
            }
        };
        *action.inner.handle.lock() = Some(handle);
        // rx lives on the thread; a send error would mean the thread died
        // before the handshake, which the spawn above precludes.
        let _ = tx.send(action.clone());

        // Shutdown may have raced the registration: a shutdown caller whose
        // snapshot predates this action will never join it, so it is aborted
        // and joined here before the handle escapes.
        if self.is_shutdown() {
            action.abort();
            action.join();
        }
        Ok(action)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_loop::GuardPolicy;
    use std::sync::atomic::AtomicUsize;

    fn test_loop() -> Arc<EventLoop> {
        EventLoop::new(Box::new(()), GuardPolicy::Disabled)
    }

    #[test]
    fn test_action_runs_and_deregisters() {
        let el = test_loop();
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = ran.clone();
        let action = el
            .start_action("worker", move |scope| {
                assert_eq!(scope.action().name(), "worker");
                ran2.store(true, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
        action.join();
        assert!(ran.load(Ordering::SeqCst));
        assert!(action.finished());
        assert_eq!(el.actions().len(), 0);
    }

    #[test]
    fn test_abort_wakes_sleeping_action() {
        let el = test_loop();
        let action = el
            .start_action("sleeper", |scope| scope.sleep(Duration::from_secs(60)))
            .unwrap();
        std::thread::sleep(Duration::from_millis(20));
        let started = std::time::Instant::now();
        action.abort();
        action.join();
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_checkpoint_observes_abort() {
        let el = test_loop();
        let loops = Arc::new(AtomicUsize::new(0));
        let loops2 = loops.clone();
        let action = el
            .start_action("worker", move |scope| loop {
                scope.checkpoint()?;
                loops2.fetch_add(1, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(1));
            })
            .unwrap();
        std::thread::sleep(Duration::from_millis(20));
        action.abort();
        action.join();
        assert!(loops.load(Ordering::SeqCst) > 0);
    }

    #[test]
    fn test_start_action_after_shutdown_fails() {
        let el = test_loop();
        el.send_shutdown();
        let res = el.start_action("late", |_scope| Ok(()));
        assert!(matches!(res, Err(Error::Terminated)));
    }

    #[test]
    fn test_start_action_racing_shutdown_never_leaks_a_thread() {
        for _ in 0..20 {
            let el = test_loop();
            let el2 = el.clone();
            let spawner = std::thread::spawn(move || {
                el2.start_action("racer", |scope| scope.sleep(Duration::from_secs(3600)))
            });
            let el3 = el.clone();
            let stopper = std::thread::spawn(move || {
                el3.send_shutdown();
                el3.shutdown(None).unwrap();
            });
            let res = spawner.join().unwrap();
            stopper.join().unwrap();
            // Whichever side won the race, nothing may still be running
            // once both calls have returned: an action that registered
            // after the shutdown snapshot is joined by start_action itself.
            if let Ok(action) = res {
                assert!(action.finished());
            }
            assert_eq!(el.actions().len(), 0);
        }
    }

    #[test]
    fn test_panicking_action_still_finishes() {
        let el = test_loop();
        let action = el
            .start_action("bomb", |_scope| panic!("deliberate"))
            .unwrap();
        action.join();
        assert!(action.finished());
        assert_eq!(el.actions().len(), 0);
    }
}
