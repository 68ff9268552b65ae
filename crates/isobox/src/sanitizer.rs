//! Boundary-crossing value hygiene.
//!
//! Every value passing between the external scope and an event scope (or
//! between two event scopes) goes through [`sanitize`], which decides per
//! value: pass it through, deep-copy it, wrap it, or unwrap it. Copying
//! severs shared mutable structure so the scopes can never alias each
//! other's data; wrapping preserves identity for values that cannot or
//! should not be copied.

use std::sync::Arc;

use crate::error::Result;
use crate::event_loop::EventLoop;
use crate::proc::{ProcKind, ProcRef};
use crate::value::{Scope, Value, WrappedRef};

/// A scope with enough context to wrap closures for it.
///
/// [`Scope`] is the plain identity used inside values; `ScopeRef` carries
/// the live event loop needed to build callback wrappers.
#[derive(Clone)]
pub enum ScopeRef {
    External,
    Event(Arc<EventLoop>),
}

impl ScopeRef {
    pub fn scope(&self) -> Scope {
        match self {
            ScopeRef::External => Scope::External,
            ScopeRef::Event(el) => Scope::Event(el.id()),
        }
    }
}

impl std::fmt::Debug for ScopeRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScopeRef::External => write!(f, "External"),
            ScopeRef::Event(el) => write!(f, "Event({})", el.id()),
        }
    }
}

/// Sanitize a single value crossing from `source` into `target`.
///
/// `name` names the crossing (the call or closure involved) for error
/// messages and wrapped-reference labels.
pub fn sanitize(
    value: Value,
    source: &ScopeRef,
    target: &ScopeRef,
    name: Option<&str>,
) -> Result<Value> {
    match value {
        // Primitives copy by value; faults carry errors and stay inert.
        v @ (Value::Null
        | Value::Bool(_)
        | Value::Int(_)
        | Value::Float(_)
        | Value::Str(_)
        | Value::Fault(_)) => Ok(v),

        Value::Ref(r) => Ok(unwrap_ref(r, target)),
        Value::Closure(p) => sanitize_closure(p, source, target),

        // Action handles are thread-safe control handles, valid anywhere.
        v @ Value::Action(_) => Ok(v),

        // Opaque payloads cannot be copied; they cross as a reference bound
        // to the scope they came from.
        Value::Opaque(o) => Ok(Value::Ref(WrappedRef::new(
            Value::Opaque(o),
            source.scope(),
            name.map(str::to_string),
        ))),

        // Containers are deep-copied when fully copyable, otherwise
        // dissected so each element gets its own treatment.
        v @ (Value::Array(_) | Value::Object { .. }) => match deep_copy(&v) {
            Some(copy) => Ok(copy),
            None => dissect(v, source, target, name),
        },
    }
}

/// Sanitize every element of an argument list.
pub fn sanitize_all(
    values: Vec<Value>,
    source: &ScopeRef,
    target: &ScopeRef,
    name: Option<&str>,
) -> Result<Vec<Value>> {
    values
        .into_iter()
        .map(|v| sanitize(v, source, target, name))
        .collect()
}

/// A wrapped reference unwraps when it arrives at its owner and stays
/// wrapped everywhere else, identity preserved, so it can travel through
/// foreign scopes and still open only at home.
fn unwrap_ref(r: WrappedRef, target: &ScopeRef) -> Value {
    match r.unwrap_for(target.scope()) {
        Some(inner) => inner,
        None => Value::Ref(r),
    }
}

/// Closures cross by wrapping, never by copying.
///
/// Isolate-bound procs are safe callable handles in any scope and pass
/// through. A plain closure entering an event scope is wrapped so internal
/// calls to it are deferred back to a blocked external caller; the wrapper
/// unwraps again when it returns to the scope it came from. A plain closure
/// created inside an event scope leaves it as a scope-bound reference.
fn sanitize_closure(p: ProcRef, source: &ScopeRef, target: &ScopeRef) -> Result<Value> {
    enum Crossing {
        Pass,
        WrapCallback(Arc<EventLoop>),
        WrapRef,
    }
    let crossing = match p.kind() {
        ProcKind::Async { .. } | ProcKind::Sync { .. } | ProcKind::Yield { .. } => Crossing::Pass,
        ProcKind::External { origin, plain, .. } => {
            if *origin == target.scope() {
                return Ok(Value::Closure(plain.clone()));
            }
            Crossing::Pass
        }
        ProcKind::Plain { .. } => match (source, target) {
            (_, ScopeRef::Event(el)) => Crossing::WrapCallback(el.clone()),
            (ScopeRef::Event(_), ScopeRef::External) => Crossing::WrapRef,
            (ScopeRef::External, ScopeRef::External) => Crossing::Pass,
        },
    };
    let name = p.name().map(str::to_string);
    match crossing {
        Crossing::Pass => Ok(Value::Closure(p)),
        Crossing::WrapCallback(event_loop) => Ok(Value::Closure(ProcRef::external_wrap(
            p,
            event_loop,
            source.scope(),
            name,
        ))),
        Crossing::WrapRef => Ok(Value::Ref(WrappedRef::new(
            Value::Closure(p),
            source.scope(),
            name,
        ))),
    }
}

/// Attempt a full structural copy through the serde data model. Returns
/// `None` when the value contains anything that refuses serialization
/// (opaque payloads, references, closures, actions, faults).
fn deep_copy(value: &Value) -> Option<Value> {
    let json = serde_json::to_value(value).ok()?;
    Some(Value::from(json))
}

/// Element-wise fallback for containers that are not fully copyable: the
/// container shell is rebuilt and every element is sanitized on its own.
fn dissect(value: Value, source: &ScopeRef, target: &ScopeRef, name: Option<&str>) -> Result<Value> {
    match value {
        Value::Array(items) => Ok(Value::Array(sanitize_all(items, source, target, name)?)),
        Value::Object { type_id, fields } => {
            let fields = fields
                .into_iter()
                .map(|(k, v)| Ok((k, sanitize(v, source, target, name)?)))
                .collect::<Result<_>>()?;
            Ok(Value::Object { type_id, fields })
        }
        v => sanitize(v, source, target, name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_loop::GuardPolicy;

    fn test_loop() -> Arc<EventLoop> {
        EventLoop::new(Box::new(()), GuardPolicy::Disabled)
    }

    #[test]
    fn test_primitives_pass_through() {
        let el = test_loop();
        let source = ScopeRef::External;
        let target = ScopeRef::Event(el);
        for v in [
            Value::Null,
            Value::Bool(true),
            Value::Int(7),
            Value::Str("hi".to_string()),
        ] {
            assert_eq!(sanitize(v.clone(), &source, &target, None).unwrap(), v);
        }
    }

    #[test]
    fn test_copyable_container_is_deep_copied() {
        let el = test_loop();
        let v = Value::Array(vec![Value::Int(1), Value::Str("x".to_string())]);
        let out = sanitize(v.clone(), &ScopeRef::External, &ScopeRef::Event(el), None).unwrap();
        assert_eq!(out, v);
    }

    #[test]
    fn test_opaque_crosses_as_reference_and_returns_unwrapped() {
        let el = test_loop();
        let external = ScopeRef::External;
        let event = ScopeRef::Event(el);

        let v = Value::opaque(std::path::PathBuf::from("/tmp/x"));
        let crossed = sanitize(v.clone(), &external, &event, Some("open")).unwrap();
        let Value::Ref(r) = &crossed else {
            panic!("expected a wrapped reference, got {crossed:?}")
        };
        assert_eq!(r.scope(), Scope::External);

        // Coming back to the external scope restores the original value.
        let back = sanitize(crossed, &event, &external, None).unwrap();
        assert_eq!(back, v);
    }

    #[test]
    fn test_foreign_reference_stays_wrapped() {
        let a = test_loop();
        let b = test_loop();
        let r = WrappedRef::new(
            Value::Int(1),
            Scope::Event(a.id()),
            Some("secret".to_string()),
        );

        // Neither scope of this crossing owns it: it travels untouched.
        let out = sanitize(
            Value::Ref(r.clone()),
            &ScopeRef::Event(b),
            &ScopeRef::External,
            None,
        )
        .unwrap();
        let Value::Ref(kept) = &out else {
            panic!("expected a wrapped reference, got {out:?}")
        };
        assert!(WrappedRef::same(&r, kept));

        // It still opens only for its owner.
        let opened = sanitize(out, &ScopeRef::External, &ScopeRef::Event(a), None).unwrap();
        assert_eq!(opened, Value::Int(1));
    }

    #[test]
    fn test_container_with_closure_is_dissected() {
        let el = test_loop();
        let v = Value::Array(vec![
            Value::Int(5),
            Value::closure("cb", |_args| Ok(Value::Null)),
        ]);
        let out = sanitize(v, &ScopeRef::External, &ScopeRef::Event(el), None).unwrap();
        let Value::Array(items) = out else {
            panic!("expected array")
        };
        assert_eq!(items[0], Value::Int(5));
        let Value::Closure(p) = &items[1] else {
            panic!("expected closure")
        };
        assert!(matches!(p.kind(), ProcKind::External { .. }));
    }

    #[test]
    fn test_event_scope_plain_closure_leaves_as_reference() {
        let el = test_loop();
        let event = ScopeRef::Event(el.clone());
        let p = Value::closure("internal_cb", |_args| Ok(Value::Null));

        let out = sanitize(p.clone(), &event, &ScopeRef::External, None).unwrap();
        let Value::Ref(r) = &out else {
            panic!("expected a wrapped reference, got {out:?}")
        };
        assert_eq!(r.scope(), Scope::Event(el.id()));

        // Intact again once it comes home.
        let back = sanitize(out, &ScopeRef::External, &event, None).unwrap();
        assert_eq!(back, p);
    }

    #[test]
    fn test_plain_closure_round_trip_unwraps() {
        let el = test_loop();
        let external = ScopeRef::External;
        let event = ScopeRef::Event(el);
        let p = Value::closure("cb", |_args| Ok(Value::Int(9)));

        let crossed = sanitize(p.clone(), &external, &event, None).unwrap();
        let back = sanitize(crossed, &event, &external, None).unwrap();
        let (Value::Closure(orig), Value::Closure(restored)) = (&p, &back) else {
            panic!("expected closures")
        };
        assert!(ProcRef::same(orig, restored));
    }
}
