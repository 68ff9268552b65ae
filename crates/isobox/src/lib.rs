//! Actor-like state isolation with call serialization.
//!
//! An [`Isolate`] wraps a state value behind a lock that doubles as a
//! scheduler: calls from any thread run one at a time, on the calling
//! thread, inside the "event scope". The state itself never escapes;
//! every value crossing the boundary is sanitized on the way through:
//!
//! - primitives and fully-copyable containers are deep-copied, severing
//!   shared mutable structure between the scopes,
//! - closures are wrapped so that internal code can only invoke external
//!   closures by deferring them back to a blocked external caller,
//! - uncopyable payloads cross as references that only their owning scope
//!   can open.
//!
//! Blocking work goes onto [`Action`] worker threads, which run outside
//! the event scope and abort cooperatively at checkpoints. Deferred
//! results are delivered through [`Completion`] handles, usually resolved
//! from an action once the slow work is done.
//!
//! ```no_run
//! use isobox::{Isolate, Value};
//!
//! let counter = Isolate::new(0i64);
//! let n = counter.sync_call("increment", vec![Value::Int(2)], |scope, args| {
//!     let by = args[0].as_i64().unwrap_or(1);
//!     Ok(Value::Int(scope.state(|count: &mut i64| {
//!         *count += by;
//!         *count
//!     })))
//! })?;
//! assert_eq!(n, Value::Int(2));
//! # Ok::<(), isobox::Error>(())
//! ```

pub mod action;
pub mod error;
pub mod event_loop;
pub mod isolate;
pub mod proc;
pub mod sanitizer;
pub mod value;

pub use action::{Action, ActionScope};
pub use error::{Error, Result};
pub use event_loop::EventScope;
pub use isolate::{Isolate, IsolateOptions};
pub use proc::{Completion, ProcRef};
pub use value::{LoopId, Opaque, Scope, Value, WrappedRef};
