//! Versioned latch with optimistic, shared and exclusive access.
//!
//! Every tree node lives inside a [`HybridLatch`]. The latch packs three
//! things into one word:
//!
//! ```text
//!  63                              2   1   0
//! ┌─────────────────────────────────┬───┬───┐
//! │          version counter        │ O │ L │
//! └─────────────────────────────────┴───┴───┘
//!   L = exclusively locked, O = obsolete (retired, never locked again)
//! ```
//!
//! Readers never write to the latch. They take a [`Version`] snapshot, read
//! the protected data, and then [`OptimisticGuard::recheck`] that the word is
//! unchanged. The counter only moves when an exclusive holder actually
//! mutated the data, so a writer that latches a node and backs off without
//! touching it does not invalidate concurrent readers.
//!
//! Reads made under an optimistic guard may observe a half-written node.
//! They must not cause side effects until validated; a failed validation is
//! reported as [`error::Error::Unwind`] and the caller restarts.

use crate::error;
use crate::sync::{
	fence, read_ptr, spin_loop, yield_now, AtomicUsize, Ordering, RwLock, RwLockReadGuard,
	RwLockWriteGuard, UnsafeCell,
};

const LOCKED: usize = 0b01;
const OBSOLETE: usize = 0b10;
const VERSION_STEP: usize = 0b100;

/// Backoff used while waiting for an exclusive holder to leave.
struct SpinWait {
	counter: u32,
}

impl SpinWait {
	fn new() -> Self {
		SpinWait {
			counter: 0,
		}
	}

	fn spin(&mut self) {
		if self.counter < 10 {
			spin_loop();
		} else {
			yield_now();
		}
		self.counter = self.counter.saturating_add(1);
	}
}

/// A snapshot of a latch word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Version(usize);

impl Version {
	/// `true` if an exclusive holder was inside when the snapshot was taken.
	#[inline]
	pub fn is_locked(self) -> bool {
		self.0 & LOCKED != 0
	}

	/// `true` if the node had been retired when the snapshot was taken.
	#[inline]
	pub fn is_obsolete(self) -> bool {
		self.0 & OBSOLETE != 0
	}

	/// Number of mutating exclusive sections completed so far.
	#[inline]
	pub fn counter(self) -> usize {
		self.0 / VERSION_STEP
	}
}

/// A latch that grants optimistic, shared or exclusive access to `T`.
pub struct HybridLatch<T> {
	version: AtomicUsize,
	lock: RwLock<()>,
	data: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for HybridLatch<T> {}
unsafe impl<T: Send + Sync> Sync for HybridLatch<T> {}

impl<T> HybridLatch<T> {
	/// Creates an unlocked, live latch at version zero.
	#[inline]
	pub fn new(data: T) -> HybridLatch<T> {
		HybridLatch {
			version: AtomicUsize::new(0),
			lock: RwLock::new(()),
			data: UnsafeCell::new(data),
		}
	}

	/// Returns the current latch word without blocking.
	#[inline]
	pub fn version(&self) -> Version {
		Version(self.version.load(Ordering::Acquire))
	}

	/// Succeeds iff no exclusive section started or finished with a mutation
	/// since `snapshot` was taken, and the node was live at that point.
	#[inline]
	pub fn validate(&self, snapshot: Version) -> bool {
		if snapshot.is_locked() || snapshot.is_obsolete() {
			return false;
		}
		fence(Ordering::Acquire);
		self.version.load(Ordering::Relaxed) == snapshot.0
	}

	/// Acquires exclusive access, blocking while another thread holds the
	/// latch in shared or exclusive mode.
	///
	/// Fails with [`error::Error::Obsolete`] if the node has been retired.
	/// The returned guard releases on drop and bumps the version only if the
	/// data was accessed mutably.
	#[inline]
	pub fn exclusive(&self) -> error::Result<ExclusiveGuard<'_, T>> {
		let guard = self.lock.write();
		let version = self.version.load(Ordering::Relaxed);
		if version & OBSOLETE != 0 {
			return Err(error::Error::Obsolete);
		}
		self.enter_exclusive(version);
		Ok(ExclusiveGuard {
			latch: self,
			guard,
			data: self.data.get(),
			version: version | LOCKED,
			dirty: false,
			retire: false,
		})
	}

	/// Acquires shared access, blocking while an exclusive holder is inside.
	///
	/// Shared access is granted on obsolete nodes too; check
	/// [`SharedGuard::is_obsolete`] before trusting the contents.
	#[inline]
	pub fn shared(&self) -> SharedGuard<'_, T> {
		let guard = self.lock.read();
		let version = self.version.load(Ordering::Relaxed);
		SharedGuard {
			guard,
			data: read_ptr(&self.data),
			version,
		}
	}

	/// Takes an optimistic snapshot, spinning while an exclusive holder is
	/// inside.
	///
	/// Returns an RAII guard that does NOT validate anything on drop.
	#[inline]
	pub fn optimistic_or_spin(&self) -> OptimisticGuard<'_, T> {
		let mut version = self.version.load(Ordering::Acquire);
		if version & LOCKED != 0 {
			let mut spinwait = SpinWait::new();
			while version & LOCKED != 0 {
				spinwait.spin();
				version = self.version.load(Ordering::Acquire);
			}
		}
		OptimisticGuard {
			latch: self,
			data: read_ptr(&self.data),
			version,
		}
	}

	#[inline]
	fn enter_exclusive(&self, version: usize) {
		self.version.store(version | LOCKED, Ordering::Relaxed);
		fence(Ordering::Release);
	}
}

impl<T> std::convert::AsMut<T> for HybridLatch<T> {
	#[inline]
	fn as_mut(&mut self) -> &mut T {
		unsafe { &mut *self.data.get() }
	}
}

/// An unvalidated read view of the latched data.
pub struct OptimisticGuard<'a, T> {
	latch: &'a HybridLatch<T>,
	data: *const T,
	version: usize,
}

unsafe impl<'a, T: Sync> Sync for OptimisticGuard<'a, T> {}

impl<'a, T> OptimisticGuard<'a, T> {
	/// Validates every read made through this guard so far.
	///
	/// Returns [`error::Error::Unwind`] if a writer mutated the data or the
	/// node was retired since the snapshot.
	#[inline]
	pub fn recheck(&self) -> error::Result<()> {
		if self.latch.validate(Version(self.version)) {
			Ok(())
		} else {
			Err(error::Error::Unwind)
		}
	}

	/// Upgrades to shared access if nothing changed since the snapshot.
	#[inline]
	pub fn to_shared(self) -> error::Result<SharedGuard<'a, T>> {
		if self.version & (LOCKED | OBSOLETE) != 0 {
			return Err(error::Error::Unwind);
		}
		if let Some(guard) = self.latch.lock.try_read() {
			if self.version != self.latch.version.load(Ordering::Relaxed) {
				return Err(error::Error::Unwind);
			}
			Ok(SharedGuard {
				guard,
				data: self.data,
				version: self.version,
			})
		} else {
			Err(error::Error::Unwind)
		}
	}

	/// Upgrades to exclusive access if nothing changed since the snapshot.
	///
	/// Never blocks: a contended latch is reported as
	/// [`error::Error::Unwind`] and the caller restarts its descent.
	#[inline]
	pub fn to_exclusive(self) -> error::Result<ExclusiveGuard<'a, T>> {
		if self.version & (LOCKED | OBSOLETE) != 0 {
			return Err(error::Error::Unwind);
		}
		if let Some(guard) = self.latch.lock.try_write() {
			if self.version != self.latch.version.load(Ordering::Relaxed) {
				return Err(error::Error::Unwind);
			}
			self.latch.enter_exclusive(self.version);
			Ok(ExclusiveGuard {
				latch: self.latch,
				guard,
				data: self.data as *mut T,
				version: self.version | LOCKED,
				dirty: false,
				retire: false,
			})
		} else {
			Err(error::Error::Unwind)
		}
	}

	/// Returns the latch this guard was taken from.
	#[inline]
	pub fn latch(&self) -> &'a HybridLatch<T> {
		self.latch
	}
}

impl<'a, T> std::ops::Deref for OptimisticGuard<'a, T> {
	type Target = T;

	#[inline]
	fn deref(&self) -> &T {
		unsafe { &*self.data }
	}
}

/// RAII exclusive access; releases the latch when dropped.
pub struct ExclusiveGuard<'a, T> {
	latch: &'a HybridLatch<T>,
	#[allow(dead_code)]
	guard: RwLockWriteGuard<'a, ()>,
	data: *mut T,
	version: usize,
	dirty: bool,
	retire: bool,
}

unsafe impl<'a, T: Sync> Sync for ExclusiveGuard<'a, T> {}

impl<'a, T> ExclusiveGuard<'a, T> {
	/// Retires the node. The release bumps the version and sets the obsolete
	/// bit, so every outstanding snapshot fails and no later
	/// [`HybridLatch::exclusive`] succeeds.
	#[inline]
	pub fn mark_obsolete(&mut self) {
		self.dirty = true;
		self.retire = true;
	}

	/// Returns the latch this guard was taken from.
	#[inline]
	pub fn latch(&self) -> &'a HybridLatch<T> {
		self.latch
	}
}

impl<'a, T> Drop for ExclusiveGuard<'a, T> {
	#[inline]
	fn drop(&mut self) {
		let mut next = self.version & !LOCKED;
		if self.dirty {
			next += VERSION_STEP;
		}
		if self.retire {
			next |= OBSOLETE;
		}
		self.latch.version.store(next, Ordering::Release);
	}
}

impl<'a, T> std::ops::Deref for ExclusiveGuard<'a, T> {
	type Target = T;

	#[inline]
	fn deref(&self) -> &T {
		unsafe { &*self.data }
	}
}

impl<'a, T> std::ops::DerefMut for ExclusiveGuard<'a, T> {
	#[inline]
	fn deref_mut(&mut self) -> &mut T {
		self.dirty = true;
		unsafe { &mut *self.data }
	}
}

/// RAII shared access; releases the latch when dropped.
pub struct SharedGuard<'a, T> {
	#[allow(dead_code)]
	guard: RwLockReadGuard<'a, ()>,
	data: *const T,
	version: usize,
}

unsafe impl<'a, T: Sync> Sync for SharedGuard<'a, T> {}

impl<'a, T> SharedGuard<'a, T> {
	/// `true` if the node was retired before the shared latch was taken.
	#[inline]
	pub fn is_obsolete(&self) -> bool {
		self.version & OBSOLETE != 0
	}
}

impl<'a, T> std::ops::Deref for SharedGuard<'a, T> {
	type Target = T;

	#[inline]
	fn deref(&self) -> &T {
		unsafe { &*self.data }
	}
}
