//! Telemetry - synchronous structured event emission
//!
//! Every subsystem emits named telemetry events (`["lattice", <domain>,
//! <event>]`) with a measurements map and a metadata map. Handlers are
//! registered process-wide and run synchronously in the emitter's context,
//! so they must not block. A handler that panics is detached; the emitter
//! is never impacted.

use serde_json::Value;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, RwLock};
use tracing::{debug, warn};

/// A registered telemetry handler.
///
/// Receives the event name path, measurements, and metadata. Must not block.
pub type TelemetryHandler = Arc<dyn Fn(&[&str], &Value, &Value) + Send + Sync>;

struct Registry {
    handlers: RwLock<Vec<(u64, TelemetryHandler)>>,
    next_id: AtomicU64,
}

fn registry() -> &'static Registry {
    static REGISTRY: OnceLock<Registry> = OnceLock::new();
    REGISTRY.get_or_init(|| Registry {
        handlers: RwLock::new(Vec::new()),
        next_id: AtomicU64::new(1),
    })
}

/// Attach a telemetry handler. Returns an id usable with `detach`.
pub fn attach(handler: TelemetryHandler) -> u64 {
    let reg = registry();
    let id = reg.next_id.fetch_add(1, Ordering::Relaxed);
    if let Ok(mut handlers) = reg.handlers.write() {
        handlers.push((id, handler));
    }
    id
}

/// Detach a previously attached handler. Unknown ids are ignored.
pub fn detach(id: u64) {
    if let Ok(mut handlers) = registry().handlers.write() {
        handlers.retain(|(hid, _)| *hid != id);
    }
}

/// Emit a telemetry event to every attached handler, synchronously.
///
/// `path` follows the `["lattice", <domain>, <event>]` convention.
/// Handlers that panic are detached after the pass; emission itself never
/// fails and never panics.
pub fn emit(path: &[&str], measurements: Value, metadata: Value) {
    debug!(event = %path.join("."), "telemetry");

    let reg = registry();
    let mut poisoned: Vec<u64> = Vec::new();
    {
        let handlers = match reg.handlers.read() {
            Ok(h) => h,
            Err(_) => return,
        };
        for (id, handler) in handlers.iter() {
            let result = catch_unwind(AssertUnwindSafe(|| {
                handler(path, &measurements, &metadata);
            }));
            if result.is_err() {
                warn!(event = %path.join("."), handler_id = *id, "Telemetry handler panicked — detaching");
                poisoned.push(*id);
            }
        }
    }
    for id in poisoned {
        detach(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_emit_reaches_handler() {
        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = Arc::clone(&seen);
        let id = attach(Arc::new(move |path, measurements, _meta| {
            assert_eq!(path, ["lattice", "test", "ping"]);
            assert_eq!(measurements["count"], json!(3));
            seen2.fetch_add(1, Ordering::SeqCst);
        }));

        emit(&["lattice", "test", "ping"], json!({"count": 3}), json!({}));
        assert_eq!(seen.load(Ordering::SeqCst), 1);

        detach(id);
        emit(&["lattice", "test", "ping"], json!({"count": 3}), json!({}));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panicking_handler_is_detached() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = Arc::clone(&calls);
        let _id = attach(Arc::new(move |_path, _m, _meta| {
            calls2.fetch_add(1, Ordering::SeqCst);
            panic!("handler bug");
        }));

        emit(&["lattice", "test", "boom"], json!({}), json!({}));
        emit(&["lattice", "test", "boom"], json!({}), json!({}));

        // Only the first emission reached the handler; it was detached after
        // panicking.
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
