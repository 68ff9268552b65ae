//! The call-serialization engine.
//!
//! There is no dedicated scheduler thread: whichever thread wants to run
//! internal logic acquires the isolate's lock and executes it on its own
//! stack ("borrowed execution"). The event loop owns the lock, the call
//! frame bookkeeping, the answer-channel protocol and the action registry;
//! every dispatch shape is built on [`EventLoop::with_frame`].

use std::any::Any;
use std::cell::RefCell;
use std::panic::Location;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, ReentrantMutex};

use crate::action::Action;
use crate::error::{Error, Result};
use crate::proc::{Completion, CompletionInner, CompletionState, CompletionTarget, ProcRef};
use crate::sanitizer::{sanitize, sanitize_all, ScopeRef};
use crate::value::{LoopId, Scope, Value};

// ─────────────────────────────────────────────────────────────────────────────
// Guard-time policy
// ─────────────────────────────────────────────────────────────────────────────

/// Diagnostic policy for internal calls that hold the lock too long.
#[derive(Clone, Default)]
pub enum GuardPolicy {
    /// No guard-time diagnostics.
    #[default]
    Disabled,
    /// Emit a `tracing` warning when an internal call exceeds the limit.
    Limit(Duration),
    /// Invoke a caller-supplied hook with (elapsed, call name) when an
    /// internal call exceeds the limit.
    Hook {
        limit: Duration,
        hook: Arc<dyn Fn(Duration, &str) + Send + Sync>,
    },
}

impl std::fmt::Debug for GuardPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GuardPolicy::Disabled => write!(f, "Disabled"),
            GuardPolicy::Limit(limit) => write!(f, "Limit({limit:?})"),
            GuardPolicy::Hook { limit, .. } => write!(f, "Hook({limit:?})"),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Answer channel
// ─────────────────────────────────────────────────────────────────────────────

/// Message flowing back to a blocked caller.
pub(crate) enum Answer {
    /// Request to execute an externally-owned closure on the caller's own
    /// thread before the terminal result arrives.
    Callback(Callback),
    /// Terminal result of the call.
    Result(Result<Value>),
}

/// A deferred external-closure invocation, executed by the blocked caller.
pub(crate) struct Callback {
    pub(crate) f: ProcRef,
    pub(crate) args: Vec<Value>,
    pub(crate) completion: Option<ProcRef>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Loop state
// ─────────────────────────────────────────────────────────────────────────────

/// Transient record of the call currently holding the lock.
pub(crate) struct CallFrame {
    pub(crate) name: String,
    pub(crate) answer: Option<Sender<Answer>>,
}

/// Everything guarded by the isolate lock.
struct LoopState {
    /// The isolate's internal state, only ever touched under the lock.
    state: Box<dyn Any + Send>,
    frame: Option<CallFrame>,
    actions: Vec<Action>,
}

/// Restores the previous call frame on every exit path, including unwinds.
struct FrameReset<'a> {
    cell: &'a RefCell<LoopState>,
    restore_to: Option<CallFrame>,
}

impl Drop for FrameReset<'_> {
    fn drop(&mut self) {
        self.cell.borrow_mut().frame = self.restore_to.take();
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// EventLoop
// ─────────────────────────────────────────────────────────────────────────────

/// Owns the isolate's mutual-exclusion lock and composes the dispatch
/// machinery. One per isolate.
pub struct EventLoop {
    id: LoopId,
    lock: ReentrantMutex<RefCell<LoopState>>,
    shutdown: Arc<AtomicBool>,
    /// Read-only snapshot of the action registry, replaced atomically after
    /// every mutation so the shutdown/finalizer path never needs the main
    /// lock.
    actions_snapshot: Mutex<Arc<[Action]>>,
    /// Channel-backed completions of in-flight deferred calls; released
    /// with `Error::Terminated` at shutdown.
    pending: Mutex<Vec<Weak<CompletionInner>>>,
    guard: GuardPolicy,
}

impl EventLoop {
    pub(crate) fn new(state: Box<dyn Any + Send>, guard: GuardPolicy) -> Arc<Self> {
        Arc::new(Self {
            id: LoopId::new(),
            lock: ReentrantMutex::new(RefCell::new(LoopState {
                state,
                frame: None,
                actions: Vec::new(),
            })),
            shutdown: Arc::new(AtomicBool::new(false)),
            actions_snapshot: Mutex::new(Arc::from(Vec::new())),
            pending: Mutex::new(Vec::new()),
            guard,
        })
    }

    /// Unique ID of this loop's event scope.
    pub fn id(&self) -> LoopId {
        self.id
    }

    /// Is the calling thread currently inside the event scope?
    ///
    /// This is lock-ownership inspection, not thread identity: an action
    /// thread becomes internal for the duration of a re-entrant call.
    pub fn is_event_scope(&self) -> bool {
        self.lock.is_owned_by_current_thread()
    }

    /// Has shutdown been requested?
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    // ─── call frames ────────────────────────────────────────────────────────

    /// Acquire the lock, record the call frame, run `body`, restore the
    /// frame and release the lock on every exit path, then feed the elapsed
    /// time to the guard-time policy.
    pub(crate) fn with_frame<R>(
        self: &Arc<Self>,
        name: &str,
        answer: Option<Sender<Answer>>,
        location: &'static Location<'static>,
        body: impl FnOnce(&EventScope<'_>) -> R,
    ) -> R {
        let scope = EventScope {
            event_loop: self,
            guard: self.lock.lock(),
        };
        // Guard time covers execution only, never the wait for the lock.
        let started = Instant::now();
        let prev = scope.guard.borrow_mut().frame.replace(CallFrame {
            name: name.to_string(),
            answer,
        });
        let _reset = FrameReset {
            cell: &*scope.guard,
            restore_to: prev,
        };
        let out = body(&scope);
        drop(_reset);
        drop(scope);
        self.guard_elapsed(started.elapsed(), name, location);
        out
    }

    /// Enter the event scope without touching the call frame. Used for
    /// direct (already-internal) proc invocations.
    pub(crate) fn enter<R>(self: &Arc<Self>, body: impl FnOnce(&EventScope<'_>) -> R) -> R {
        let scope = EventScope {
            event_loop: self,
            guard: self.lock.lock(),
        };
        body(&scope)
    }

    fn guard_elapsed(&self, elapsed: Duration, name: &str, location: &'static Location<'static>) {
        match &self.guard {
            GuardPolicy::Disabled => {}
            GuardPolicy::Limit(limit) => {
                if elapsed > *limit {
                    tracing::warn!(
                        "guard time exceeded: {:.3?} (limit {:?}) in `{}` called from {} - \
                         move blocking work to an action",
                        elapsed,
                        limit,
                        name,
                        location
                    );
                }
            }
            GuardPolicy::Hook { limit, hook } => {
                if elapsed > *limit {
                    hook(elapsed, name);
                }
            }
        }
    }

    // ─── dispatch shapes ────────────────────────────────────────────────────

    /// Fire-and-forget shape: the caller blocks for the duration of the
    /// body but receives no value. Body errors are logged and lost; this
    /// asymmetry is deliberate.
    pub(crate) fn dispatch_async(
        self: &Arc<Self>,
        name: &str,
        location: &'static Location<'static>,
        body: impl FnOnce(&EventScope<'_>) -> Result<Value>,
    ) {
        let id = self.id;
        self.with_frame(name, None, location, |scope| {
            if let Err(err) = body(scope) {
                tracing::error!("[{}] error in fire-and-forget call `{}`: {}", id, name, err);
            }
        })
    }

    /// Blocking-with-result shape: the result is sanitized for the external
    /// scope, pushed onto a fresh answer channel and read back through the
    /// callback loop.
    pub(crate) fn dispatch_sync(
        self: &Arc<Self>,
        name: &str,
        location: &'static Location<'static>,
        body: impl FnOnce(&EventScope<'_>) -> Result<Value>,
    ) -> Result<Value> {
        let (tx, rx) = channel();
        self.with_frame(name, Some(tx.clone()), location, |scope| -> Result<()> {
            let res = body(scope)?;
            let res = sanitize(
                res,
                &ScopeRef::Event(self.clone()),
                &ScopeRef::External,
                Some(name),
            )?;
            let _ = tx.send(Answer::Result(Ok(res)));
            Ok(())
        })?;
        self.callback_loop(rx)
    }

    /// Deferred-result shape: the body receives a channel-backed completion
    /// and is expected to store it; the lock is released as soon as the body
    /// returns and the caller waits on the answer channel.
    pub(crate) fn dispatch_yield(
        self: &Arc<Self>,
        name: &str,
        location: &'static Location<'static>,
        body: impl FnOnce(&EventScope<'_>, Completion) -> Result<()>,
    ) -> Result<Value> {
        let (tx, rx) = channel();
        let completion = Completion::channel(name, self.clone(), tx.clone());
        self.with_frame(name, Some(tx), location, |scope| body(scope, completion))?;
        self.callback_loop(rx)
    }

    /// Consume an answer channel until it yields a terminal result,
    /// executing interleaved callbacks on the calling thread. The calling
    /// thread is the one that volunteered to block, so it is the only
    /// thread ever asked to run unknown external code.
    pub(crate) fn callback_loop(self: &Arc<Self>, rx: Receiver<Answer>) -> Result<Value> {
        loop {
            match rx.recv() {
                Ok(Answer::Callback(cb)) => {
                    let res = cb.f.call(cb.args)?;
                    if let Some(completion) = cb.completion {
                        let res = sanitize(
                            res,
                            &ScopeRef::External,
                            &ScopeRef::Event(self.clone()),
                            completion.name(),
                        )?;
                        self.with_frame(
                            "external-closure-result",
                            None,
                            Location::caller(),
                            |_scope| completion.call(vec![res]),
                        )?;
                    }
                }
                Ok(Answer::Result(res)) => return res,
                // All senders gone before a terminal result: the isolate
                // shut down (or dropped the completion) while we waited.
                Err(_) => return Err(Error::Terminated),
            }
        }
    }

    /// Enqueue a callback onto the current call frame's answer channel.
    /// Only valid while a blocking or deferred-result call is active.
    pub(crate) fn enqueue_callback(
        self: &Arc<Self>,
        f: ProcRef,
        args: Vec<Value>,
        completion: Option<ProcRef>,
        name: Option<&str>,
    ) -> Result<()> {
        let args = sanitize_all(
            args,
            &ScopeRef::Event(self.clone()),
            &ScopeRef::External,
            name,
        )?;
        let guard = self.lock.lock();
        let state = guard.borrow();
        match &state.frame {
            Some(frame) => match &frame.answer {
                Some(answer) => answer
                    .send(Answer::Callback(Callback {
                        f,
                        args,
                        completion,
                    }))
                    .map_err(|_| Error::Terminated),
                None => Err(Error::InvalidAccess(format!(
                    "external closure {} was invoked by `{}`, which is a fire-and-forget \
                     call; only blocking or deferred-result calls can run external closures",
                    name.unwrap_or("<anonymous>"),
                    frame.name
                ))),
            },
            None => Err(Error::InvalidAccess(format!(
                "external closure {} was invoked without an active call frame",
                name.unwrap_or("<anonymous>")
            ))),
        }
    }

    // ─── action registry ────────────────────────────────────────────────────

    pub(crate) fn register_action(self: &Arc<Self>, action: Action) {
        let guard = self.lock.lock();
        let mut state = guard.borrow_mut();
        state.actions.push(action);
        *self.actions_snapshot.lock() = Arc::from(state.actions.clone());
    }

    pub(crate) fn deregister_action(self: &Arc<Self>, action: &Action) {
        let guard = self.lock.lock();
        let mut state = guard.borrow_mut();
        let before = state.actions.len();
        state.actions.retain(|a| !Action::same(a, action));
        if state.actions.len() == before {
            tracing::warn!("[{}] unknown action `{}` finished", self.id, action.name());
        }
        *self.actions_snapshot.lock() = Arc::from(state.actions.clone());
    }

    /// Lock-free view of the live actions.
    pub(crate) fn actions(&self) -> Arc<[Action]> {
        self.actions_snapshot.lock().clone()
    }

    // ─── pending completions ────────────────────────────────────────────────

    pub(crate) fn register_pending(&self, completion: &Completion) {
        let mut pending = self.pending.lock();
        pending.retain(|w| w.strong_count() > 0);
        pending.push(Arc::downgrade(&completion.inner));
    }

    /// Release every caller still blocked on an unresolved deferred call.
    /// The completion itself stays usable; a later resolve sees the
    /// released state and drops its value quietly.
    fn release_pending(&self) {
        for weak in self.pending.lock().drain(..) {
            let Some(inner) = weak.upgrade() else { continue };
            let mut state = inner.target.lock();
            if matches!(
                &*state,
                CompletionState::Pending(CompletionTarget::Channel(_))
            ) {
                if let CompletionState::Pending(CompletionTarget::Channel(tx)) =
                    std::mem::replace(&mut *state, CompletionState::Released)
                {
                    let _ = tx.send(Answer::Result(Err(Error::Terminated)));
                }
            }
        }
    }

    // ─── shutdown ───────────────────────────────────────────────────────────

    /// Set the shutdown flag and abort every registered action, using the
    /// lock-free snapshot. Safe to call from a destructor; never blocks on
    /// the main lock. Idempotent.
    pub(crate) fn send_shutdown(&self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        let actions = self.actions();
        tracing::debug!("[{}] shutdown requested, {} live actions", self.id, actions.len());
        for action in actions.iter() {
            action.abort();
        }
        self.release_pending();
    }

    /// Abort all actions and wait for them to terminate.
    ///
    /// From the event scope, joining is deferred onto a fresh unlocked
    /// thread so the internal caller is not blocked; the optional completion
    /// fires once every action has joined. From external scope the call
    /// blocks until all actions have joined; supplying a completion there is
    /// an error, since external callers can simply block.
    pub(crate) fn shutdown(self: &Arc<Self>, completion: Option<ProcRef>) -> Result<()> {
        self.send_shutdown();
        let actions = self.actions();
        if self.is_event_scope() {
            if let Some(completion) = completion {
                std::thread::Builder::new()
                    .name("isobox-shutdown".to_string())
                    .spawn(move || {
                        for action in actions.iter() {
                            action.join();
                        }
                        if let Err(err) = completion.call(Vec::new()) {
                            tracing::error!("shutdown completion failed: {}", err);
                        }
                    })
                    .map_err(|e| Error::Spawn(e.to_string()))?;
            }
            Ok(())
        } else {
            if completion.is_some() {
                return Err(Error::InvalidAccess(
                    "external shutdown blocks until all actions have terminated and does \
                     not take a completion handler"
                        .to_string(),
                ));
            }
            for action in actions.iter() {
                action.join();
            }
            Ok(())
        }
    }
}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop")
            .field("id", &self.id)
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// EventScope
// ─────────────────────────────────────────────────────────────────────────────

/// Handle to the event scope, passed to every internal body.
///
/// Holding an `EventScope` proves the calling thread owns the isolate lock.
/// State access goes through short [`EventScope::state`] borrows, so procs
/// and other scope operations can be invoked freely between accesses.
pub struct EventScope<'a> {
    event_loop: &'a Arc<EventLoop>,
    guard: parking_lot::ReentrantMutexGuard<'a, RefCell<LoopState>>,
}

impl EventScope<'_> {
    /// ID of the owning event loop.
    pub fn loop_id(&self) -> LoopId {
        self.event_loop.id
    }

    pub(crate) fn event_loop(&self) -> &Arc<EventLoop> {
        self.event_loop
    }

    /// Access the isolate's internal state.
    ///
    /// The borrow lasts only for the duration of `f`; invoking procs or
    /// other scope operations from inside `f` that need the state again
    /// will panic on the re-borrow.
    ///
    /// # Panics
    ///
    /// Panics if `S` is not the state type the isolate was built with.
    pub fn state<S: 'static, R>(&self, f: impl FnOnce(&mut S) -> R) -> R {
        let mut state = self.guard.borrow_mut();
        let s = state
            .state
            .downcast_mut::<S>()
            .expect("event scope state accessed with a different type than the isolate holds");
        f(s)
    }

    /// Create a fire-and-forget proc bound to this isolate.
    pub fn async_proc<F>(&self, name: impl Into<String>, f: F) -> Value
    where
        F: Fn(&EventScope<'_>, Vec<Value>) -> Result<Value> + Send + Sync + 'static,
    {
        Value::Closure(ProcRef::internal_async(
            self.event_loop.clone(),
            Some(name.into()),
            f,
        ))
    }

    /// Create a blocking-with-result proc bound to this isolate.
    pub fn sync_proc<F>(&self, name: impl Into<String>, f: F) -> Value
    where
        F: Fn(&EventScope<'_>, Vec<Value>) -> Result<Value> + Send + Sync + 'static,
    {
        Value::Closure(ProcRef::internal_sync(
            self.event_loop.clone(),
            Some(name.into()),
            f,
        ))
    }

    /// Create a deferred-result proc bound to this isolate. The closure
    /// receives a [`Completion`] it is expected to store and resolve later.
    pub fn yield_proc<F>(&self, name: impl Into<String>, f: F) -> Value
    where
        F: Fn(&EventScope<'_>, Vec<Value>, Completion) -> Result<()> + Send + Sync + 'static,
    {
        Value::Closure(ProcRef::internal_yield(
            self.event_loop.clone(),
            Some(name.into()),
            f,
        ))
    }

    /// Mark a value as shared-by-reference instead of copy-on-cross, bound
    /// to this event scope.
    pub fn shared(&self, value: Value) -> Value {
        Value::Ref(crate::value::WrappedRef::new(
            value,
            Scope::Event(self.event_loop.id),
            None,
        ))
    }

    /// Start a worker action on a dedicated thread (see [`Action`]).
    pub fn start_action<F>(&self, name: &str, body: F) -> Result<Action>
    where
        F: FnOnce(&crate::action::ActionScope) -> Result<()> + Send + 'static,
    {
        self.event_loop.start_action(name, body)
    }

    /// Shut the isolate down from inside the event scope. Joining the
    /// actions is deferred onto an unlocked worker; the optional completion
    /// proc fires once all actions have joined.
    pub fn shutdown_with(&self, completion: Option<ProcRef>) -> Result<()> {
        self.event_loop.shutdown(completion)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn test_loop() -> Arc<EventLoop> {
        EventLoop::new(Box::new(0i64), GuardPolicy::Disabled)
    }

    #[test]
    fn test_event_scope_detection() {
        let el = test_loop();
        assert!(!el.is_event_scope());
        el.enter(|scope| {
            assert!(scope.event_loop().is_event_scope());
        });
        assert!(!el.is_event_scope());
    }

    #[test]
    fn test_state_access() {
        let el = test_loop();
        el.enter(|scope| {
            scope.state(|s: &mut i64| *s = 12);
            assert_eq!(scope.state(|s: &mut i64| *s), 12);
        });
    }

    #[test]
    fn test_frame_restored_after_call() {
        let el = test_loop();
        el.dispatch_async("noop", Location::caller(), |_scope| Ok(Value::Null));
        let guard = el.lock.lock();
        assert!(guard.borrow().frame.is_none());
    }

    #[test]
    fn test_sync_dispatch_returns_result() {
        let el = test_loop();
        let res = el
            .dispatch_sync("double", Location::caller(), |_scope| Ok(Value::Int(21)))
            .unwrap();
        assert_eq!(res, Value::Int(21));
    }

    #[test]
    fn test_sync_dispatch_propagates_body_error() {
        let el = test_loop();
        let res = el.dispatch_sync("fail", Location::caller(), |_scope| {
            Err(Error::fault("boom"))
        });
        assert_eq!(res, Err(Error::Fault("boom".to_string())));
    }

    #[test]
    fn test_guard_hook_fires_over_limit_only() {
        use std::sync::atomic::AtomicUsize;

        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();
        let el = EventLoop::new(
            Box::new(()),
            GuardPolicy::Hook {
                limit: Duration::from_millis(20),
                hook: Arc::new(move |elapsed, _name| {
                    assert!(elapsed >= Duration::from_millis(40));
                    hits2.fetch_add(1, Ordering::SeqCst);
                }),
            },
        );

        el.dispatch_async("fast", Location::caller(), |_scope| Ok(Value::Null));
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        el.dispatch_async("slow", Location::caller(), |_scope| {
            std::thread::sleep(Duration::from_millis(40));
            Ok(Value::Null)
        });
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_guard_time_excludes_lock_wait() {
        use std::sync::atomic::AtomicUsize;

        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();
        let el = EventLoop::new(
            Box::new(()),
            GuardPolicy::Hook {
                limit: Duration::from_millis(50),
                hook: Arc::new(move |_elapsed, name| {
                    assert_eq!(name, "holder");
                    hits2.fetch_add(1, Ordering::SeqCst);
                }),
            },
        );

        let el2 = el.clone();
        let holder = std::thread::spawn(move || {
            el2.dispatch_async("holder", Location::caller(), |_scope| {
                std::thread::sleep(Duration::from_millis(120));
                Ok(Value::Null)
            });
        });
        // Queue an instant body behind the long holder; its lock wait must
        // not count against the guard limit.
        std::thread::sleep(Duration::from_millis(20));
        el.dispatch_async("fast", Location::caller(), |_scope| Ok(Value::Null));
        holder.join().unwrap();

        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let el = test_loop();
        el.send_shutdown();
        el.send_shutdown();
        assert!(el.is_shutdown());
        assert!(el.shutdown(None).is_ok());
    }
}
