//! Execution id generation port.

use std::sync::atomic::{AtomicU64, Ordering};

/// Produces opaque execution ids. Injected so tests get stable ids.
pub trait IdGenerator: Send + Sync + std::fmt::Debug {
    fn next_id(&self) -> String;
}

/// Random v4 UUIDs, the default.
#[derive(Debug, Default)]
pub struct UuidGenerator;

impl IdGenerator for UuidGenerator {
    fn next_id(&self) -> String {
        uuid::Uuid::new_v4().to_string()
    }
}

/// Sequential ids with a configurable prefix, e.g. `mock-1`, `mock-2`.
#[derive(Debug)]
pub struct PrefixedGenerator {
    prefix: String,
    counter: AtomicU64,
}

impl PrefixedGenerator {
    #[must_use]
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            counter: AtomicU64::new(0),
        }
    }
}

impl IdGenerator for PrefixedGenerator {
    fn next_id(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        format!("{}-{}", self.prefix, n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefixed_ids_are_sequential() {
        let ids = PrefixedGenerator::new("mock");
        assert_eq!(ids.next_id(), "mock-1");
        assert_eq!(ids.next_id(), "mock-2");
    }

    #[test]
    fn uuids_are_unique() {
        let ids = UuidGenerator;
        assert_ne!(ids.next_id(), ids.next_id());
    }
}
