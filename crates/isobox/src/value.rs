//! Dynamic value type that can cross the internal/external boundary.
//!
//! Every argument and return value of an isolate call is a [`Value`]. The
//! sanitizer inspects values at each boundary crossing and decides whether
//! to pass them through, deep-copy them, or wrap them as scope-checked
//! references.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::ser::{Error as _, SerializeMap};
use serde::{Serialize, Serializer};

use crate::action::Action;
use crate::error::Error;
use crate::proc::ProcRef;

// ─────────────────────────────────────────────────────────────────────────────
// Scopes
// ─────────────────────────────────────────────────────────────────────────────

/// Unique identifier of an event loop (and thereby of its event scope).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LoopId(pub uuid::Uuid);

impl LoopId {
    /// Create a new unique loop ID.
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for LoopId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LoopId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The side of the boundary a value belongs to.
///
/// `External` covers every thread that does not hold an isolate lock;
/// `Event` identifies the internal scope of one specific isolate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// Any caller not holding an isolate lock.
    External,
    /// The internal (event) scope of the isolate with the given loop ID.
    Event(LoopId),
}

// ─────────────────────────────────────────────────────────────────────────────
// Opaque payloads
// ─────────────────────────────────────────────────────────────────────────────

/// An `Arc`-shared handle to an arbitrary Rust payload.
///
/// Opaque values are the irreducibly non-copyable leaves of the sanitizer's
/// fallback chain: they cannot be deep-copied and are carried across scopes
/// as scope-checked [`WrappedRef`]s instead. Identity is pointer identity.
#[derive(Clone)]
pub struct Opaque {
    inner: Arc<OpaqueInner>,
}

struct OpaqueInner {
    id: uuid::Uuid,
    type_name: &'static str,
    payload: Box<dyn Any + Send + Sync>,
}

impl Opaque {
    /// Wrap a payload as an opaque value.
    pub fn new<T: Any + Send + Sync>(payload: T) -> Self {
        Self {
            inner: Arc::new(OpaqueInner {
                id: uuid::Uuid::new_v4(),
                type_name: std::any::type_name::<T>(),
                payload: Box::new(payload),
            }),
        }
    }

    /// Unique ID of this payload, for diagnostics.
    pub fn id(&self) -> uuid::Uuid {
        self.inner.id
    }

    /// Type name of the wrapped payload.
    pub fn type_name(&self) -> &'static str {
        self.inner.type_name
    }

    /// Borrow the payload if it has the requested type.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.inner.payload.downcast_ref::<T>()
    }

    /// Whether two handles refer to the same payload.
    pub fn same(a: &Opaque, b: &Opaque) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }
}

impl fmt::Debug for Opaque {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Opaque")
            .field("id", &self.inner.id)
            .field("type", &self.inner.type_name)
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Wrapped references
// ─────────────────────────────────────────────────────────────────────────────

/// A value replaced by a scope-checked handle instead of a copy.
///
/// The wrapper can be stored and passed around freely, but it only unwraps
/// back to the raw value when observed from the scope that owns it.
#[derive(Clone)]
pub struct WrappedRef {
    inner: Arc<Value>,
    scope: Scope,
    name: Option<String>,
}

impl WrappedRef {
    /// Bind a value to an owning scope.
    pub fn new(value: Value, scope: Scope, name: Option<String>) -> Self {
        Self {
            inner: Arc::new(value),
            scope,
            name,
        }
    }

    /// The scope that owns the wrapped value.
    pub fn scope(&self) -> Scope {
        self.scope
    }

    /// Diagnostic name, usually the argument or field this was wrapped for.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Unwrap to the raw value when observed from the owning scope.
    ///
    /// `Arc`-backed leaves (opaque payloads, closures) keep their identity
    /// through the round trip.
    pub fn unwrap_for(&self, target: Scope) -> Option<Value> {
        if self.scope == target {
            Some((*self.inner).clone())
        } else {
            None
        }
    }

    /// Whether two wrappers refer to the same underlying value.
    pub fn same(a: &WrappedRef, b: &WrappedRef) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }
}

impl fmt::Debug for WrappedRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WrappedRef")
            .field("scope", &self.scope)
            .field("name", &self.name)
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Value
// ─────────────────────────────────────────────────────────────────────────────

/// Universal value crossing the internal/external boundary.
#[derive(Debug, Clone)]
pub enum Value {
    /// Null/absent value.
    Null,
    /// Boolean value.
    Bool(bool),
    /// 64-bit integer.
    Int(i64),
    /// 64-bit floating point.
    Float(f64),
    /// UTF-8 string.
    Str(String),
    /// Ordered array of values.
    Array(Vec<Value>),
    /// Mapping or fixed-field record (a record when `type_id` is set).
    Object {
        /// Optional record type identifier.
        type_id: Option<String>,
        /// Field values.
        fields: HashMap<String, Value>,
    },
    /// Opaque handle to an arbitrary Rust payload; never deep-copied.
    Opaque(Opaque),
    /// Scope-checked wrapped reference.
    Ref(WrappedRef),
    /// Any callable (plain closure or proc variant).
    Closure(ProcRef),
    /// Worker thread handle; self-synchronizing, passes through sanitation.
    Action(Action),
    /// Error-wrapper payload: resolving a completion with a fault re-raises
    /// the error in the scope blocked waiting for the result.
    Fault(Box<Error>),
}

impl Default for Value {
    fn default() -> Self {
        Value::Null
    }
}

impl Value {
    /// Create a plain closure value callable from any scope it is
    /// sanitized into.
    pub fn closure<F>(name: impl Into<String>, f: F) -> Value
    where
        F: Fn(Vec<Value>) -> crate::error::Result<Value> + Send + Sync + 'static,
    {
        Value::Closure(ProcRef::plain(Some(name.into()), f))
    }

    /// Wrap an arbitrary payload as an opaque value.
    pub fn opaque<T: Any + Send + Sync>(payload: T) -> Value {
        Value::Opaque(Opaque::new(payload))
    }

    /// Create an untyped object from key-value pairs.
    pub fn object_from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        let fields = pairs
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        Value::Object {
            type_id: None,
            fields,
        }
    }

    /// Check if value is null.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Get as boolean.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Get as i64 (also converts from float if lossless).
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Float(f) if f.fract() == 0.0 => Some(*f as i64),
            _ => None,
        }
    }

    /// Get as f64 (also converts from int).
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    /// Get as string reference.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Get as array reference.
    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(arr) => Some(arr),
            _ => None,
        }
    }

    /// Get as object fields reference.
    pub fn as_object(&self) -> Option<&HashMap<String, Value>> {
        match self {
            Value::Object { fields, .. } => Some(fields),
            _ => None,
        }
    }

    /// Get as closure reference.
    pub fn as_closure(&self) -> Option<&ProcRef> {
        match self {
            Value::Closure(p) => Some(p),
            _ => None,
        }
    }

    /// Get as wrapped reference.
    pub fn as_ref_value(&self) -> Option<&WrappedRef> {
        match self {
            Value::Ref(r) => Some(r),
            _ => None,
        }
    }

    /// Get a field from an object.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_object().and_then(|obj| obj.get(key))
    }

    pub(crate) fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::Array(_) => "array",
            Value::Object { .. } => "object",
            Value::Opaque(_) => "opaque",
            Value::Ref(_) => "ref",
            Value::Closure(_) => "closure",
            Value::Action(_) => "action",
            Value::Fault(_) => "fault",
        }
    }
}

/// Structural equality for plain data, pointer identity for shared handles.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => a == b,
            (
                Value::Object {
                    type_id: ta,
                    fields: fa,
                },
                Value::Object {
                    type_id: tb,
                    fields: fb,
                },
            ) => ta == tb && fa == fb,
            (Value::Opaque(a), Value::Opaque(b)) => Opaque::same(a, b),
            (Value::Ref(a), Value::Ref(b)) => WrappedRef::same(a, b),
            (Value::Closure(a), Value::Closure(b)) => ProcRef::same(a, b),
            (Value::Action(a), Value::Action(b)) => Action::same(a, b),
            (Value::Fault(a), Value::Fault(b)) => a == b,
            _ => false,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// From implementations
// ─────────────────────────────────────────────────────────────────────────────

impl From<()> for Value {
    fn from(_: ()) -> Self {
        Value::Null
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<usize> for Value {
    fn from(v: usize) -> Self {
        Value::Int(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(v: Vec<T>) -> Self {
        Value::Array(v.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(val) => val.into(),
            None => Value::Null,
        }
    }
}

impl From<HashMap<String, Value>> for Value {
    fn from(fields: HashMap<String, Value>) -> Self {
        Value::Object {
            type_id: None,
            fields,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// serde interop (deep-copy round trip)
// ─────────────────────────────────────────────────────────────────────────────

const TYPE_KEY: &str = "__type__";

/// Serialization covers only the copyable subset. Opaque payloads, wrapped
/// references, closures, actions and faults refuse to serialize, which is
/// what drives the sanitizer into its dissection fallback.
impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Null => serializer.serialize_unit(),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Int(i) => serializer.serialize_i64(*i),
            Value::Float(f) => serializer.serialize_f64(*f),
            Value::Str(s) => serializer.serialize_str(s),
            Value::Array(items) => items.serialize(serializer),
            Value::Object { type_id, fields } => {
                let extra = usize::from(type_id.is_some());
                let mut map = serializer.serialize_map(Some(fields.len() + extra))?;
                if let Some(tid) = type_id {
                    map.serialize_entry(TYPE_KEY, tid)?;
                }
                for (k, v) in fields {
                    map.serialize_entry(k, v)?;
                }
                map.end()
            }
            Value::Opaque(o) => Err(S::Error::custom(format!(
                "opaque value `{}` is not copyable",
                o.type_name()
            ))),
            Value::Ref(_) => Err(S::Error::custom("wrapped reference is not copyable")),
            Value::Closure(_) => Err(S::Error::custom("closure is not copyable")),
            Value::Action(_) => Err(S::Error::custom("action handle is not copyable")),
            Value::Fault(_) => Err(S::Error::custom("fault payload is not copyable")),
        }
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else if let Some(f) = n.as_f64() {
                    Value::Float(f)
                } else {
                    Value::Null
                }
            }
            serde_json::Value::String(s) => Value::Str(s),
            serde_json::Value::Array(arr) => {
                Value::Array(arr.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(mut obj) => {
                let type_id = match obj.remove(TYPE_KEY) {
                    Some(serde_json::Value::String(s)) => Some(s),
                    _ => None,
                };
                let fields = obj.into_iter().map(|(k, v)| (k, Value::from(v))).collect();
                Value::Object { type_id, fields }
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
