//! The public container: typed state behind a call-serialized boundary.

use std::marker::PhantomData;
use std::panic::Location;
use std::sync::Arc;
use std::time::Duration;

use crate::action::{Action, ActionScope};
use crate::error::{Error, Result};
use crate::event_loop::{EventLoop, EventScope, GuardPolicy};
use crate::proc::Completion;
use crate::sanitizer::{sanitize_all, ScopeRef};
use crate::value::{LoopId, Scope, Value, WrappedRef};

/// Construction-time knobs for an [`Isolate`].
#[derive(Clone, Debug, Default)]
pub struct IsolateOptions {
    guard: GuardPolicy,
}

impl IsolateOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Warn through `tracing` whenever an internal call holds the lock
    /// longer than `limit`. A zero limit is rejected, since it would flag
    /// every call.
    pub fn guard_time(mut self, limit: Duration) -> Result<Self> {
        if limit.is_zero() {
            return Err(Error::Config(
                "guard time limit must be greater than zero".to_string(),
            ));
        }
        self.guard = GuardPolicy::Limit(limit);
        Ok(self)
    }

    /// Call `hook` with (elapsed, call name) whenever an internal call
    /// holds the lock longer than `limit`.
    pub fn guard_hook<F>(mut self, limit: Duration, hook: F) -> Result<Self>
    where
        F: Fn(Duration, &str) + Send + Sync + 'static,
    {
        if limit.is_zero() {
            return Err(Error::Config(
                "guard time limit must be greater than zero".to_string(),
            ));
        }
        self.guard = GuardPolicy::Hook {
            limit,
            hook: Arc::new(hook),
        };
        Ok(self)
    }
}

/// An actor-like container around a state value of type `S`.
///
/// All access to the state happens through calls that run one at a time
/// under the isolate's lock, on the calling thread. The state itself never
/// leaves the event scope; everything crossing the boundary in either
/// direction is sanitized (see the crate docs).
///
/// The handle is cheap to clone and shareable across threads. Dropping the
/// last handle requests shutdown but does not wait for running actions;
/// call [`Isolate::shutdown`] to wait.
pub struct Isolate<S> {
    event_loop: Arc<EventLoop>,
    _state: PhantomData<fn(S)>,
}

impl<S> Clone for Isolate<S> {
    fn clone(&self) -> Self {
        Self {
            event_loop: self.event_loop.clone(),
            _state: PhantomData,
        }
    }
}

impl<S: Send + 'static> Isolate<S> {
    pub fn new(state: S) -> Self {
        Self::with_options(state, IsolateOptions::new())
    }

    pub fn with_options(state: S, options: IsolateOptions) -> Self {
        Self {
            event_loop: EventLoop::new(Box::new(state), options.guard),
            _state: PhantomData,
        }
    }

    /// ID of this isolate's event scope.
    pub fn id(&self) -> LoopId {
        self.event_loop.id()
    }

    /// Is the calling thread currently inside this isolate's event scope?
    pub fn in_event_scope(&self) -> bool {
        self.event_loop.is_event_scope()
    }

    fn sanitize_inbound(&self, args: Vec<Value>, name: &str) -> Result<Vec<Value>> {
        sanitize_all(
            args,
            &ScopeRef::External,
            &ScopeRef::Event(self.event_loop.clone()),
            Some(name),
        )
    }

    /// Fire-and-forget call: runs `body` in the event scope, discards its
    /// value. Body errors are logged and lost; the `Err` here only reports
    /// argument-sanitization failures.
    #[track_caller]
    pub fn async_call(
        &self,
        name: &str,
        args: Vec<Value>,
        body: impl FnOnce(&EventScope<'_>, Vec<Value>) -> Result<Value>,
    ) -> Result<()> {
        let location = Location::caller();
        if self.event_loop.is_event_scope() {
            // Already inside the event scope (e.g. a re-entrant call from a
            // proc body); run directly under the re-entrant lock.
            self.event_loop.enter(|scope| {
                if let Err(err) = body(scope, args) {
                    tracing::error!("error in fire-and-forget call `{}`: {}", name, err);
                }
            });
            return Ok(());
        }
        let args = self.sanitize_inbound(args, name)?;
        self.event_loop
            .dispatch_async(name, location, |scope| body(scope, args));
        Ok(())
    }

    /// Blocking call: runs `body` in the event scope and returns its value,
    /// sanitized for the calling scope. While blocked, the calling thread
    /// services callbacks to its own closures.
    #[track_caller]
    pub fn sync_call(
        &self,
        name: &str,
        args: Vec<Value>,
        body: impl FnOnce(&EventScope<'_>, Vec<Value>) -> Result<Value>,
    ) -> Result<Value> {
        let location = Location::caller();
        if self.event_loop.is_event_scope() {
            return self.event_loop.enter(|scope| body(scope, args));
        }
        let args = self.sanitize_inbound(args, name)?;
        self.event_loop
            .dispatch_sync(name, location, |scope| body(scope, args))
    }

    /// Deferred-result call: `body` receives a [`Completion`] and returns
    /// without producing a value; the caller stays blocked until some later
    /// internal code resolves the completion. Must not be called from
    /// inside the event scope, where blocking on the completion would
    /// deadlock the isolate.
    #[track_caller]
    pub fn yield_call(
        &self,
        name: &str,
        args: Vec<Value>,
        body: impl FnOnce(&EventScope<'_>, Vec<Value>, Completion) -> Result<()>,
    ) -> Result<Value> {
        if self.event_loop.is_event_scope() {
            return Err(Error::InvalidAccess(format!(
                "deferred-result call `{name}` invoked from inside the event scope would \
                 deadlock; store a completion or use a proc instead"
            )));
        }
        let location = Location::caller();
        let args = self.sanitize_inbound(args, name)?;
        self.event_loop
            .dispatch_yield(name, location, |scope, completion| {
                body(scope, args, completion)
            })
    }

    /// Start a worker action on its own thread (see [`Action`]).
    pub fn start_action<F>(&self, name: &str, body: F) -> Result<Action>
    where
        F: FnOnce(&ActionScope) -> Result<()> + Send + 'static,
    {
        self.event_loop.start_action(name, body)
    }

    /// Actions currently registered with this isolate.
    pub fn live_actions(&self) -> Vec<Action> {
        self.event_loop.actions().to_vec()
    }

    /// Mark an externally-owned value as shared-by-reference: it crosses
    /// into the event scope without being copied and unwraps again on the
    /// way back out.
    pub fn shared(value: Value) -> Value {
        Value::Ref(WrappedRef::new(value, Scope::External, None))
    }

    /// Request shutdown and block until every action has terminated.
    /// Unresolved deferred calls are released with [`Error::Terminated`].
    /// Idempotent; concurrent callers all block until the actions are gone.
    pub fn shutdown(&self) -> Result<()> {
        if self.event_loop.is_event_scope() {
            return Err(Error::InvalidAccess(
                "blocking shutdown from inside the event scope would join actions under \
                 the lock; use EventScope::shutdown_with instead"
                    .to_string(),
            ));
        }
        self.event_loop.shutdown(None)
    }
}

impl<S> Drop for Isolate<S> {
    fn drop(&mut self) {
        // Last handle gone: flag shutdown and abort actions without taking
        // the main lock or joining, so dropping inside the event scope or
        // on an action thread stays safe.
        if Arc::strong_count(&self.event_loop) == 1 {
            self.event_loop.send_shutdown();
        }
    }
}

impl<S> std::fmt::Debug for Isolate<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Isolate")
            .field("id", &self.event_loop.id())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_call_reads_and_writes_state() {
        let iso = Isolate::new(10i64);
        let res = iso
            .sync_call("add", vec![Value::Int(5)], |scope, args| {
                let n = args[0].as_i64().unwrap_or(0);
                Ok(Value::Int(scope.state(|s: &mut i64| {
                    *s += n;
                    *s
                })))
            })
            .unwrap();
        assert_eq!(res, Value::Int(15));
    }

    #[test]
    fn test_async_call_swallows_body_error() {
        let iso = Isolate::new(());
        let res = iso.async_call("fail", Vec::new(), |_scope, _args| Err(Error::fault("boom")));
        assert_eq!(res, Ok(()));
    }

    #[test]
    fn test_yield_call_from_event_scope_is_rejected() {
        let iso = Isolate::new(());
        let inner = iso.clone();
        let res = iso.sync_call("outer", Vec::new(), move |_scope, _args| {
            let nested = inner.yield_call("inner", Vec::new(), |_s, _a, _c| Ok(()));
            assert!(matches!(nested, Err(Error::InvalidAccess(_))));
            Ok(Value::Null)
        });
        assert_eq!(res, Ok(Value::Null));
    }

    #[test]
    fn test_guard_time_zero_is_a_config_error() {
        let res = IsolateOptions::new().guard_time(Duration::ZERO);
        assert!(matches!(res, Err(Error::Config(_))));
    }

    #[test]
    fn test_reentrant_call_from_body() {
        let iso = Isolate::new(0i64);
        let inner = iso.clone();
        let res = iso
            .sync_call("outer", Vec::new(), move |_scope, _args| {
                inner.sync_call("inner", Vec::new(), |scope, _args| {
                    Ok(Value::Int(scope.state(|s: &mut i64| {
                        *s += 1;
                        *s
                    })))
                })
            })
            .unwrap();
        assert_eq!(res, Value::Int(1));
    }
}
