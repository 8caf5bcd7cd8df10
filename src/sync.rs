//! Synchronization primitives used by the latch, with loom support.
//!
//! Normal builds re-export std atomics and `parking_lot` locks. Under
//! `--cfg loom` the same names resolve to loom's model-checked versions so
//! `tests/loom_tests.rs` can explore interleavings of the latch protocol.
//!
//! Epoch reclamation is not switched: loom models only exercise the latch.

#![allow(unused)]

#[cfg(not(loom))]
pub(crate) use std::sync::atomic::{fence, AtomicUsize, Ordering};

#[cfg(loom)]
pub(crate) use loom::sync::atomic::{fence, AtomicUsize, Ordering};

#[cfg(not(loom))]
pub(crate) use std::hint::spin_loop;

#[cfg(loom)]
pub(crate) use loom::hint::spin_loop;

#[cfg(not(loom))]
pub(crate) use std::thread::yield_now;

#[cfg(loom)]
pub(crate) use loom::thread::yield_now;

// parking_lot locks hand out guards directly while loom's return a
// `LockResult`, so loom gets a thin adapter with the parking_lot surface.

#[cfg(not(loom))]
pub(crate) use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

#[cfg(loom)]
mod loom_rwlock {
	use loom::sync::{
		RwLock as LoomRwLock, RwLockReadGuard as LoomReadGuard, RwLockWriteGuard as LoomWriteGuard,
	};

	pub(crate) struct RwLock<T>(LoomRwLock<T>);

	impl<T> RwLock<T> {
		pub(crate) fn new(value: T) -> Self {
			RwLock(LoomRwLock::new(value))
		}

		pub(crate) fn read(&self) -> RwLockReadGuard<'_, T> {
			RwLockReadGuard(self.0.read().unwrap())
		}

		pub(crate) fn write(&self) -> RwLockWriteGuard<'_, T> {
			RwLockWriteGuard(self.0.write().unwrap())
		}

		pub(crate) fn try_read(&self) -> Option<RwLockReadGuard<'_, T>> {
			self.0.try_read().ok().map(RwLockReadGuard)
		}

		pub(crate) fn try_write(&self) -> Option<RwLockWriteGuard<'_, T>> {
			self.0.try_write().ok().map(RwLockWriteGuard)
		}
	}

	pub(crate) struct RwLockReadGuard<'a, T>(LoomReadGuard<'a, T>);

	pub(crate) struct RwLockWriteGuard<'a, T>(LoomWriteGuard<'a, T>);
}

#[cfg(loom)]
pub(crate) use loom_rwlock::{RwLock, RwLockReadGuard, RwLockWriteGuard};

#[cfg(not(loom))]
pub(crate) use std::cell::UnsafeCell;

#[cfg(loom)]
mod loom_unsafe_cell {
	/// Loom's cell hands out tracked pointers; the latch wants raw ones.
	pub(crate) struct UnsafeCell<T>(loom::cell::UnsafeCell<T>);

	impl<T> UnsafeCell<T> {
		pub(crate) fn new(value: T) -> Self {
			UnsafeCell(loom::cell::UnsafeCell::new(value))
		}

		pub(crate) fn get(&self) -> *mut T {
			// SAFETY: the latch protocol is what loom is checking; the raw
			// pointer is only dereferenced under that protocol.
			self.0.with_mut(|ptr| ptr)
		}

		pub(crate) fn get_const(&self) -> *const T {
			self.0.with(|ptr| ptr)
		}
	}
}

#[cfg(loom)]
pub(crate) use loom_unsafe_cell::UnsafeCell;

/// Read-only pointer into `cell`. Loom records it as a shared access, so
/// concurrent readers are not reported as racing each other.
#[cfg(not(loom))]
#[inline]
pub(crate) fn read_ptr<T>(cell: &UnsafeCell<T>) -> *const T {
	cell.get()
}

#[cfg(loom)]
#[inline]
pub(crate) fn read_ptr<T>(cell: &UnsafeCell<T>) -> *const T {
	cell.get_const()
}
