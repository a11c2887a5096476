// Client-side modules: connection lifecycle, subscriptions, server pool.
use std::sync::{Mutex, MutexGuard};

pub mod connection;
pub(crate) mod server_pool;
pub mod subscription;

// Coarse-lock helper. A poisoned mutex only means another task panicked
// mid-update of plain counters/queues; recover the guard instead of
// cascading the panic through the whole connection.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
