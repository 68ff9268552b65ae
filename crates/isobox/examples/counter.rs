//! A shared counter with a slow persistence action.
//!
//! Run with: cargo run --example counter

use std::thread;
use std::time::Duration;

use isobox::{Isolate, IsolateOptions, Result, Value};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let options = IsolateOptions::new().guard_time(Duration::from_millis(50))?;
    let counter = Isolate::with_options(0i64, options);

    // Ten threads hammer the counter concurrently; calls serialize.
    let mut handles = Vec::new();
    for _ in 0..10 {
        let counter = counter.clone();
        handles.push(thread::spawn(move || {
            for _ in 0..1000 {
                counter
                    .async_call("increment", Vec::new(), |scope, _args| {
                        scope.state(|count: &mut i64| *count += 1);
                        Ok(Value::Null)
                    })
                    .unwrap();
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    // A deferred-result call backed by a slow action.
    let snapshot = counter.yield_call("persist", Vec::new(), |scope, _args, completion| {
        let count = scope.state(|count: &mut i64| *count);
        scope.start_action("persist-worker", move |action| {
            // Stand-in for slow I/O; aborts early on shutdown.
            action.sleep(Duration::from_millis(100))?;
            completion.resolve(Value::Int(count))?;
            Ok(())
        })?;
        Ok(())
    })?;

    println!("persisted count: {snapshot:?}");
    counter.shutdown()?;
    Ok(())
}
