//! Write observers.
//!
//! Observers are told about tagged writes after the remote store has
//! confirmed them. They cannot fail the write and get no say in its result.

use larder_core::KeyWritten;

/// Receives write notifications.
pub trait WriteObserver: Send + Sync {
    fn key_written(&self, event: &KeyWritten);
}

impl<F> WriteObserver for F
where
    F: Fn(&KeyWritten) + Send + Sync,
{
    fn key_written(&self, event: &KeyWritten) {
        self(event)
    }
}

/// Forwards notifications to `tracing` at debug level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl WriteObserver for TracingObserver {
    fn key_written(&self, event: &KeyWritten) {
        tracing::debug!(
            store = %event.store_name,
            key = %event.key,
            ttl_seconds = ?event.ttl_seconds,
            "Cache key written"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_closure_observer_receives_event() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let observer = move |event: &KeyWritten| sink.lock().unwrap().push(event.key.clone());

        observer.key_written(&KeyWritten {
            store_name: "remote".to_string(),
            key: "a".to_string(),
            value: json!(1),
            ttl_seconds: None,
        });

        assert_eq!(*seen.lock().unwrap(), vec!["a".to_string()]);
    }
}
