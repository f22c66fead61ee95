use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

// A panicking worker must not take the whole transport down with it, so
// poisoned locks are recovered rather than propagated.

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

/// Maps an endpoint onto one of `partitions` worker queues. The same
/// endpoint always lands on the same partition.
pub(crate) fn partition_for(endpoint: SocketAddr, partitions: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    endpoint.hash(&mut hasher);
    (hasher.finish() % partitions.max(1) as u64) as usize
}
