//! # Closeable Gate
//!
//! A read/write lock that also carries an open/closed state. Acquisition
//! fails once the gate is closed, so "stop admitting new work" and "tear
//! down" happen atomically with respect to everyone else holding the lock.
//!
//! ## Invariants
//! - `read`/`write` return `None` once `close` has started; never after.
//! - Exactly one caller ever obtains a `CloseGuard`.
//! - Guards are synchronous and must not be held across an `.await`.

use std::ops::Deref;
use std::ops::DerefMut;
use std::sync::PoisonError;
use std::sync::RwLock;
use std::sync::RwLockReadGuard;
use std::sync::RwLockWriteGuard;

/// Lifecycle of a gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    Open,
    /// The closer holds the lock and is tearing the value down.
    Closing,
    Closed,
}

struct Slot<T> {
    state: GateState,
    value: T,
}

pub struct Gate<T> {
    inner: RwLock<Slot<T>>,
}

impl<T> Gate<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: RwLock::new(Slot {
                state: GateState::Open,
                value,
            }),
        }
    }

    /// Shared access, or `None` if the gate is no longer open.
    pub fn read(&self) -> Option<GateReadGuard<'_, T>> {
        let guard = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        (guard.state == GateState::Open).then_some(GateReadGuard { guard })
    }

    /// Exclusive access, or `None` if the gate is no longer open.
    pub fn write(&self) -> Option<GateWriteGuard<'_, T>> {
        let guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        (guard.state == GateState::Open).then_some(GateWriteGuard { guard })
    }

    /// Starts closing the gate. Only the first caller gets the guard; the gate
    /// becomes `Closed` when that guard is dropped.
    pub fn close(&self) -> Option<CloseGuard<'_, T>> {
        self.write().map(GateWriteGuard::close)
    }

    pub fn state(&self) -> GateState {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).state
    }

    pub fn is_open(&self) -> bool {
        self.state() == GateState::Open
    }
}

impl<T: Default> Default for Gate<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

pub struct GateReadGuard<'a, T> {
    guard: RwLockReadGuard<'a, Slot<T>>,
}

impl<T> Deref for GateReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard.value
    }
}

pub struct GateWriteGuard<'a, T> {
    guard: RwLockWriteGuard<'a, Slot<T>>,
}

impl<'a, T> GateWriteGuard<'a, T> {
    /// Closes the gate without releasing the lock in between.
    pub fn close(mut self) -> CloseGuard<'a, T> {
        self.guard.state = GateState::Closing;
        CloseGuard { guard: self.guard }
    }
}

impl<T> Deref for GateWriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard.value
    }
}

impl<T> DerefMut for GateWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard.value
    }
}

/// Exclusive access for teardown. Dropping it marks the gate `Closed`.
pub struct CloseGuard<'a, T> {
    guard: RwLockWriteGuard<'a, Slot<T>>,
}

impl<T> Deref for CloseGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard.value
    }
}

impl<T> DerefMut for CloseGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard.value
    }
}

impl<T> Drop for CloseGuard<'_, T> {
    fn drop(&mut self) {
        self.guard.state = GateState::Closed;
    }
}
