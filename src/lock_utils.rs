//! Lock poisoning recovery
//!
//! The box state store is shared between the DNS path, the gossip receiver
//! and the timer tasks. A panic in one of them must not take the resolver
//! down with it, so poisoned locks are recovered and reported at ERROR level.

use std::sync::{Mutex, MutexGuard};
use tracing::error;

/// Acquire a Mutex lock, recovering from poisoning if necessary.
///
/// `context` names what the lock protects and appears in the log line.
pub fn lock_or_recover<'a, T>(mutex: &'a Mutex<T>, context: &str) -> MutexGuard<'a, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            error!(
                target: "error",
                "Mutex poisoned for '{}' - continuing with last written state",
                context
            );
            poisoned.into_inner()
        }
    }
}
