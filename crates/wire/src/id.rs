use std::sync::atomic::{AtomicI64, Ordering};

use crate::message::Id;

/// Monotonic request id generator.
///
/// The counter starts at 1. Without a prefix, ids are integers; with one,
/// ids are strings of the form `<prefix><counter>`, which helps correlate
/// log lines across connections. Uniqueness only matters per connection;
/// each connection owns its own generator.
#[derive(Debug, Default)]
pub struct IdGenerator {
    prefix: Option<Box<str>>,
    counter: AtomicI64,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self {
            prefix: None,
            counter: AtomicI64::new(0),
        }
    }

    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        let prefix: String = prefix.into();
        Self {
            prefix: if prefix.is_empty() {
                None
            } else {
                Some(prefix.into_boxed_str())
            },
            counter: AtomicI64::new(0),
        }
    }

    pub fn next_id(&self) -> Id {
        let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        match &self.prefix {
            Some(prefix) => Id::String(format!("{prefix}{n}")),
            None => Id::Integer(n),
        }
    }
}
