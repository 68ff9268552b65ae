//! Closure kinds with scope-aware invocation semantics.
//!
//! Internally-created procs (async/sync/yield) share one rule: invoked from
//! the event scope they run in place, invoked externally they dispatch
//! through the owning event loop using the matching call shape. Plain
//! closures are wrapped per direction by the sanitizer; an external closure
//! wrapped for the event scope can only be invoked through the callback
//! protocol.

use std::fmt;
use std::panic::Location;
use std::sync::mpsc::Sender;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::event_loop::{Answer, EventLoop, EventScope};
use crate::sanitizer::{sanitize, sanitize_all, ScopeRef};
use crate::value::{Scope, Value};

pub(crate) type PlainFn = dyn Fn(Vec<Value>) -> Result<Value> + Send + Sync;
pub(crate) type EventFn = dyn Fn(&EventScope<'_>, Vec<Value>) -> Result<Value> + Send + Sync;
pub(crate) type YieldFn =
    dyn Fn(&EventScope<'_>, Vec<Value>, Completion) -> Result<()> + Send + Sync;

// ─────────────────────────────────────────────────────────────────────────────
// ProcRef
// ─────────────────────────────────────────────────────────────────────────────

/// Cloneable handle to a callable value.
#[derive(Clone)]
pub struct ProcRef {
    inner: Arc<ProcInner>,
}

struct ProcInner {
    name: Option<String>,
    kind: ProcKind,
}

pub(crate) enum ProcKind {
    /// Raw closure, created in any scope; wrapped per direction when it
    /// crosses the boundary.
    Plain { f: Arc<PlainFn> },
    /// Fire-and-forget proc owned by an event loop.
    Async {
        event_loop: Arc<EventLoop>,
        f: Box<EventFn>,
    },
    /// Blocking-with-result proc owned by an event loop.
    Sync {
        event_loop: Arc<EventLoop>,
        f: Box<EventFn>,
    },
    /// Deferred-result proc owned by an event loop.
    Yield {
        event_loop: Arc<EventLoop>,
        f: Box<YieldFn>,
    },
    /// A plain closure wrapped for use inside the event scope of
    /// `event_loop`; invocation enqueues a callback for the blocked caller.
    External {
        event_loop: Arc<EventLoop>,
        origin: Scope,
        plain: ProcRef,
    },
}

impl ProcRef {
    pub(crate) fn plain<F>(name: Option<String>, f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Result<Value> + Send + Sync + 'static,
    {
        Self::new(name, ProcKind::Plain { f: Arc::new(f) })
    }

    pub(crate) fn internal_async<F>(event_loop: Arc<EventLoop>, name: Option<String>, f: F) -> Self
    where
        F: Fn(&EventScope<'_>, Vec<Value>) -> Result<Value> + Send + Sync + 'static,
    {
        Self::new(
            name,
            ProcKind::Async {
                event_loop,
                f: Box::new(f),
            },
        )
    }

    pub(crate) fn internal_sync<F>(event_loop: Arc<EventLoop>, name: Option<String>, f: F) -> Self
    where
        F: Fn(&EventScope<'_>, Vec<Value>) -> Result<Value> + Send + Sync + 'static,
    {
        Self::new(
            name,
            ProcKind::Sync {
                event_loop,
                f: Box::new(f),
            },
        )
    }

    pub(crate) fn internal_yield<F>(event_loop: Arc<EventLoop>, name: Option<String>, f: F) -> Self
    where
        F: Fn(&EventScope<'_>, Vec<Value>, Completion) -> Result<()> + Send + Sync + 'static,
    {
        Self::new(
            name,
            ProcKind::Yield {
                event_loop,
                f: Box::new(f),
            },
        )
    }

    pub(crate) fn external_wrap(
        plain: ProcRef,
        event_loop: Arc<EventLoop>,
        origin: Scope,
        name: Option<String>,
    ) -> Self {
        Self::new(
            name,
            ProcKind::External {
                event_loop,
                origin,
                plain,
            },
        )
    }

    fn new(name: Option<String>, kind: ProcKind) -> Self {
        Self {
            inner: Arc::new(ProcInner { name, kind }),
        }
    }

    /// Diagnostic name, if one was given at creation.
    pub fn name(&self) -> Option<&str> {
        self.inner.name.as_deref()
    }

    pub(crate) fn kind(&self) -> &ProcKind {
        &self.inner.kind
    }

    /// Whether two handles refer to the same closure.
    pub fn same(a: &ProcRef, b: &ProcRef) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }

    fn display_name(&self) -> &str {
        self.inner.name.as_deref().unwrap_or("<anonymous>")
    }

    /// Invoke the closure with scope-aware semantics.
    ///
    /// Async/sync/yield procs run in place when the calling thread already
    /// owns the isolate lock and dispatch through the event loop otherwise.
    /// A yield proc invoked internally expects its last argument to be a
    /// closure acting as the completion. External-wrapped closures enqueue a
    /// callback for the caller blocked on the current call frame.
    #[track_caller]
    pub fn call(&self, mut args: Vec<Value>) -> Result<Value> {
        let location = Location::caller();
        match &self.inner.kind {
            ProcKind::Plain { f } => f(args),
            ProcKind::Async { event_loop, f } => {
                if event_loop.is_event_scope() {
                    event_loop.enter(|scope| f(scope, args))?;
                    Ok(Value::Null)
                } else {
                    let args = sanitize_all(
                        args,
                        &ScopeRef::External,
                        &ScopeRef::Event(event_loop.clone()),
                        self.name(),
                    )?;
                    event_loop.dispatch_async(self.display_name(), location, |scope| {
                        f(scope, args)
                    });
                    Ok(Value::Null)
                }
            }
            ProcKind::Sync { event_loop, f } => {
                if event_loop.is_event_scope() {
                    event_loop.enter(|scope| f(scope, args))
                } else {
                    let args = sanitize_all(
                        args,
                        &ScopeRef::External,
                        &ScopeRef::Event(event_loop.clone()),
                        self.name(),
                    )?;
                    event_loop.dispatch_sync(self.display_name(), location, |scope| f(scope, args))
                }
            }
            ProcKind::Yield { event_loop, f } => {
                if event_loop.is_event_scope() {
                    let completion = match args.pop() {
                        Some(Value::Closure(p)) => Completion::from_closure(
                            self.display_name(),
                            event_loop.clone(),
                            p,
                        ),
                        Some(other) => {
                            return Err(Error::InvalidAccess(format!(
                                "yield closure `{}` must be invoked with a closure as its \
                                 completion argument, got {}",
                                self.display_name(),
                                other.type_name()
                            )))
                        }
                        None => {
                            return Err(Error::InvalidAccess(format!(
                                "yield closure `{}` requires a completion argument",
                                self.display_name()
                            )))
                        }
                    };
                    event_loop.enter(|scope| f(scope, args, completion))?;
                    Ok(Value::Null)
                } else {
                    let args = sanitize_all(
                        args,
                        &ScopeRef::External,
                        &ScopeRef::Event(event_loop.clone()),
                        self.name(),
                    )?;
                    event_loop.dispatch_yield(self.display_name(), location, |scope, completion| {
                        f(scope, args, completion)
                    })
                }
            }
            ProcKind::External {
                event_loop, plain, ..
            } => {
                if event_loop.is_event_scope() {
                    event_loop.enqueue_callback(plain.clone(), args, None, self.name())?;
                    Ok(Value::Null)
                } else {
                    Err(Error::InvalidAccess(format!(
                        "external closure `{}` should have been unwrapped before external \
                         invocation",
                        self.display_name()
                    )))
                }
            }
        }
    }

    /// Invoke an external-wrapped closure and route its result back into the
    /// event scope through `completion` once the blocked caller has executed
    /// it. Only meaningful inside the event scope.
    pub fn call_with_completion(&self, args: Vec<Value>, completion: ProcRef) -> Result<Value> {
        match &self.inner.kind {
            ProcKind::External {
                event_loop, plain, ..
            } => {
                if event_loop.is_event_scope() {
                    event_loop.enqueue_callback(plain.clone(), args, Some(completion), self.name())?;
                    Ok(Value::Null)
                } else {
                    Err(Error::InvalidAccess(format!(
                        "external closure `{}` should have been unwrapped before external \
                         invocation",
                        self.display_name()
                    )))
                }
            }
            _ => Err(Error::InvalidAccess(format!(
                "completion routing is only supported for external closures, `{}` is not one",
                self.display_name()
            ))),
        }
    }
}

impl fmt::Debug for ProcRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.inner.kind {
            ProcKind::Plain { .. } => "plain",
            ProcKind::Async { .. } => "async",
            ProcKind::Sync { .. } => "sync",
            ProcKind::Yield { .. } => "yield",
            ProcKind::External { .. } => "external",
        };
        f.debug_struct("ProcRef")
            .field("kind", &kind)
            .field("name", &self.inner.name)
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Completion
// ─────────────────────────────────────────────────────────────────────────────

/// At-most-once terminal of a deferred-result call.
///
/// Resolving delivers the value to whichever scope is blocked waiting for
/// the call; resolving with a [`Value::Fault`] re-raises the wrapped error
/// there instead. A second resolve is a [`Error::MultipleResults`] error.
#[derive(Clone)]
pub struct Completion {
    pub(crate) inner: Arc<CompletionInner>,
}

pub(crate) struct CompletionInner {
    pub(crate) name: String,
    pub(crate) event_loop: Arc<EventLoop>,
    pub(crate) target: Mutex<CompletionState>,
}

pub(crate) enum CompletionState {
    /// Waiting for its one resolve.
    Pending(CompletionTarget),
    /// Already resolved; a further resolve is an error.
    Resolved,
    /// Shutdown released the blocked caller with `Terminated`; late
    /// resolves are dropped quietly.
    Released,
}

pub(crate) enum CompletionTarget {
    /// Deliver to an external caller blocked on the answer channel.
    Channel(Sender<Answer>),
    /// Hand to a closure supplied by an internal yield-proc invocation.
    Closure(ProcRef),
}

impl Completion {
    pub(crate) fn channel(name: &str, event_loop: Arc<EventLoop>, tx: Sender<Answer>) -> Self {
        let this = Self {
            inner: Arc::new(CompletionInner {
                name: name.to_string(),
                event_loop: event_loop.clone(),
                target: Mutex::new(CompletionState::Pending(CompletionTarget::Channel(tx))),
            }),
        };
        event_loop.register_pending(&this);
        this
    }

    pub(crate) fn from_closure(name: &str, event_loop: Arc<EventLoop>, closure: ProcRef) -> Self {
        Self {
            inner: Arc::new(CompletionInner {
                name: name.to_string(),
                event_loop,
                target: Mutex::new(CompletionState::Pending(CompletionTarget::Closure(closure))),
            }),
        }
    }

    /// Name of the call this completion belongs to.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Deliver the terminal result of the deferred call.
    ///
    /// Invoked from outside the event scope (usually an action thread), the
    /// delivery re-enters the event loop under a call frame so it stays
    /// serialized with every other internal call.
    #[track_caller]
    pub fn resolve(&self, value: Value) -> Result<()> {
        let location = Location::caller();
        let target = {
            let mut state = self.inner.target.lock();
            match std::mem::replace(&mut *state, CompletionState::Resolved) {
                CompletionState::Pending(target) => target,
                CompletionState::Resolved => {
                    return Err(Error::MultipleResults(self.inner.name.clone()))
                }
                CompletionState::Released => {
                    // The blocked caller was already released by shutdown;
                    // the late result is dropped.
                    *state = CompletionState::Released;
                    return Ok(());
                }
            }
        };
        match target {
            CompletionTarget::Channel(tx) => {
                let event_loop = &self.inner.event_loop;
                if event_loop.is_event_scope() {
                    self.deliver(tx, value)
                } else {
                    event_loop.with_frame(&self.inner.name, None, location, |_scope| {
                        self.deliver(tx, value)
                    })
                }
            }
            CompletionTarget::Closure(p) => p.call(vec![value]).map(|_| ()),
        }
    }

    /// Re-raise `error` in the scope blocked waiting for the result,
    /// instead of aborting the signaling thread.
    pub fn reject(&self, error: Error) -> Result<()> {
        self.resolve(Value::Fault(Box::new(error)))
    }

    fn deliver(&self, tx: Sender<Answer>, value: Value) -> Result<()> {
        let answer = match value {
            Value::Fault(err) => Err(*err),
            v => sanitize(
                v,
                &ScopeRef::Event(self.inner.event_loop.clone()),
                &ScopeRef::External,
                Some(&self.inner.name),
            ),
        };
        // A closed channel means the blocked caller was already released by
        // shutdown; the late result is dropped.
        let _ = tx.send(Answer::Result(answer));
        Ok(())
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("name", &self.inner.name)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_loop::GuardPolicy;

    fn test_loop() -> Arc<EventLoop> {
        EventLoop::new(Box::new(0i64), GuardPolicy::Disabled)
    }

    #[test]
    fn test_plain_call_is_direct() {
        let p = ProcRef::plain(Some("sum".into()), |args| {
            Ok(Value::Int(args.iter().filter_map(Value::as_i64).sum()))
        });
        let res = p.call(vec![Value::Int(2), Value::Int(3)]).unwrap();
        assert_eq!(res, Value::Int(5));
    }

    #[test]
    fn test_sync_proc_dispatches_from_outside() {
        let el = test_loop();
        let p = ProcRef::internal_sync(el, Some("get".into()), |scope, _args| {
            Ok(Value::Int(scope.state(|s: &mut i64| *s)))
        });
        assert_eq!(p.call(Vec::new()).unwrap(), Value::Int(0));
    }

    #[test]
    fn test_yield_proc_called_internally_needs_a_closure_completion() {
        let el = test_loop();
        let p = ProcRef::internal_yield(
            el.clone(),
            Some("later".into()),
            |_scope, _args, completion| completion.resolve(Value::Null),
        );
        let res = el.enter(|_scope| p.call(vec![Value::Int(1)]));
        assert!(matches!(res, Err(Error::InvalidAccess(_))));
    }

    #[test]
    fn test_closure_backed_completion_resolves_once() {
        let el = test_loop();
        let sink = ProcRef::internal_sync(el.clone(), Some("sink".into()), |scope, args| {
            let v = args.first().and_then(Value::as_i64).unwrap_or(0);
            scope.state(|s: &mut i64| *s += v);
            Ok(Value::Null)
        });
        let completion = Completion::from_closure("later", el.clone(), sink);
        completion.resolve(Value::Int(7)).unwrap();
        assert!(matches!(
            completion.resolve(Value::Int(8)),
            Err(Error::MultipleResults(_))
        ));
        let total = el.enter(|scope| scope.state(|s: &mut i64| *s));
        assert_eq!(total, 7);
    }

    #[test]
    fn test_external_wrapped_closure_rejected_outside_the_scope() {
        let el = test_loop();
        let plain = ProcRef::plain(Some("cb".into()), |_args| Ok(Value::Null));
        let wrapped = ProcRef::external_wrap(plain, el, Scope::External, Some("cb".into()));
        assert!(matches!(
            wrapped.call(Vec::new()),
            Err(Error::InvalidAccess(_))
        ));
    }
}
