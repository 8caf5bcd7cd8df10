//! Loom-based concurrency tests for blinktree.
//!
//! These tests use loom to explore the thread interleavings of the
//! `HybridLatch` primitive that every tree node sits behind.
//!
//! # Running Loom Tests
//!
//! Loom tests must be run with the `loom` cfg flag:
//!
//! ```bash
//! RUSTFLAGS="--cfg loom" cargo test --test loom_tests --release -- --test-threads=1
//! ```
//!
//! # Limitations
//!
//! Tree operations restart in unbounded spin-retry loops, which loom cannot
//! explore exhaustively. These tests stick to the latch's blocking modes
//! (shared and exclusive) and the obsolete flag, and only take optimistic
//! snapshots from a single thread.

#![cfg(loom)]

use blinktree::error::Error;
use blinktree::latch::HybridLatch;
use loom::sync::Arc;
use loom::thread;

// ===========================================================================
// Blocking Modes
// ===========================================================================

/// Exclusive sections are serialized and both increments survive.
#[test]
fn loom_latch_exclusive_serialization() {
	loom::model(|| {
		let latch = Arc::new(HybridLatch::new(0i32));

		let handles: Vec<_> = (0..2)
			.map(|_| {
				let latch = Arc::clone(&latch);
				thread::spawn(move || {
					let mut guard = latch.exclusive().unwrap();
					*guard += 1;
				})
			})
			.collect();

		for h in handles {
			h.join().unwrap();
		}

		assert_eq!(*latch.shared(), 2);
		// each mutating exclusive section bumps the counter once
		assert_eq!(latch.version().counter(), 2);
		assert!(!latch.version().is_locked());
	});
}

/// A shared reader observes either the state before or after the writer.
#[test]
fn loom_latch_shared_blocking() {
	loom::model(|| {
		let latch = Arc::new(HybridLatch::new((0i32, 0i32)));

		let reader = {
			let latch = Arc::clone(&latch);
			thread::spawn(move || {
				let guard = latch.shared();
				*guard
			})
		};

		let writer = {
			let latch = Arc::clone(&latch);
			thread::spawn(move || {
				let mut guard = latch.exclusive().unwrap();
				guard.0 = 42;
				guard.1 = 42;
			})
		};

		let seen = reader.join().unwrap();
		writer.join().unwrap();

		// never a torn pair
		assert!(seen == (0, 0) || seen == (42, 42));
		assert_eq!(*latch.shared(), (42, 42));
	});
}

/// Multiple shared readers can hold the latch at once.
#[test]
fn loom_latch_concurrent_shared() {
	loom::model(|| {
		let latch = Arc::new(HybridLatch::new(7i32));

		let handles: Vec<_> = (0..2)
			.map(|_| {
				let latch = Arc::clone(&latch);
				thread::spawn(move || *latch.shared())
			})
			.collect();

		for h in handles {
			assert_eq!(h.join().unwrap(), 7);
		}
		// shared access never moves the version
		assert_eq!(latch.version().counter(), 0);
	});
}

/// A writer inside the latch is never observed by another writer.
#[test]
fn loom_latch_exclusive_mutual_exclusion() {
	use loom::sync::atomic::{AtomicBool, Ordering};

	loom::model(|| {
		let latch = Arc::new(HybridLatch::new(()));
		let inside = Arc::new(AtomicBool::new(false));

		let handles: Vec<_> = (0..2)
			.map(|_| {
				let latch = Arc::clone(&latch);
				let inside = Arc::clone(&inside);
				thread::spawn(move || {
					let _guard = latch.exclusive().unwrap();
					assert!(!inside.swap(true, Ordering::SeqCst), "two writers inside");
					inside.store(false, Ordering::SeqCst);
				})
			})
			.collect();

		for h in handles {
			h.join().unwrap();
		}
	});
}

// ===========================================================================
// Versioning and Retirement
// ===========================================================================

/// An exclusive section that does not mutate leaves the version alone.
#[test]
fn loom_latch_clean_exclusive_keeps_version() {
	loom::model(|| {
		let latch = Arc::new(HybridLatch::new(5i32));

		let t = {
			let latch = Arc::clone(&latch);
			thread::spawn(move || {
				let guard = latch.exclusive().unwrap();
				assert_eq!(*guard, 5);
			})
		};

		let snapshot = latch.optimistic_or_spin();
		let value = *snapshot;
		t.join().unwrap();

		assert_eq!(value, 5);
		assert!(snapshot.recheck().is_ok());
	});
}

/// Once a node is retired, racing writers are refused with `Obsolete`.
#[test]
fn loom_latch_obsolete_refuses_writers() {
	loom::model(|| {
		let latch = Arc::new(HybridLatch::new(0i32));

		let retirer = {
			let latch = Arc::clone(&latch);
			thread::spawn(move || {
				let mut guard = latch.exclusive().unwrap();
				guard.mark_obsolete();
			})
		};

		let writer = {
			let latch = Arc::clone(&latch);
			thread::spawn(move || match latch.exclusive() {
				Ok(mut guard) => {
					*guard = 1;
					true
				}
				Err(e) => {
					assert_eq!(e, Error::Obsolete);
					false
				}
			})
		};

		retirer.join().unwrap();
		let wrote = writer.join().unwrap();

		let version = latch.version();
		assert!(version.is_obsolete());
		assert!(!version.is_locked());
		assert!(latch.exclusive().is_err());
		// a write only lands if it ran before retirement
		assert_eq!(*latch.shared(), i32::from(wrote));
		assert!(latch.shared().is_obsolete());
	});
}
