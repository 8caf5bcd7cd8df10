//! # blinktree: A Concurrent In-Memory B-link Tree
//!
//! This crate provides a concurrent ordered index built as a Lehman–Yao
//! B-link tree and synchronised with **optimistic lock coupling**. Readers
//! never take locks; writers latch only the nodes they modify.
//!
//! ## Design Overview
//!
//! **Optimistic Lock Coupling**: every node sits behind a
//! [`latch::HybridLatch`] carrying a version word. Readers snapshot the
//! version, read, and validate the snapshot afterwards. A failed validation
//! restarts the whole operation from the root.
//!
//! **High keys and sibling links**: every node knows the exclusive upper
//! bound of the keys it owns (`high_key`) and its right neighbour on the same
//! level (`sibling`). A split moves the upper half of a node into a new right
//! sibling and links it in *before* the parent learns about it, so a reader
//! that followed a stale parent pointer still finds its key by moving right.
//!
//! **No parent latches on the way down**: inserts remember the path they
//! descended and, after a split, latch the remembered parent and move right
//! from there until they reach the node that owns the new separator.
//!
//! ### Tree Structure
//!
//! ```text
//!                    ┌─────────────────┐
//!                    │   Root Latch    │  <- root pointer + generation
//!                    │  (HybridLatch)  │
//!                    └────────┬────────┘
//!                             ▼
//!                    ┌─────────────────┐
//!                    │  Internal Node  │───► sibling ───► ∅
//!                    │ keys | edges    │
//!                    │ high_key        │
//!                    └────────┬────────┘
//!              ┌──────────────┼──────────────┐
//!              ▼              ▼              ▼
//!        ┌──────────┐  ┌──────────┐  ┌──────────┐
//!        │   Leaf   │─►│   Leaf   │─►│   Leaf   │─► ∅
//!        └──────────┘  └──────────┘  └──────────┘
//! ```
//!
//! ## Basic Usage
//!
//! ```
//! use blinktree::Tree;
//!
//! let tree = Tree::new();
//!
//! tree.insert(10u64, "ten");
//! tree.insert(20u64, "twenty");
//!
//! assert_eq!(tree.get(&10), Some("ten"));
//!
//! let mut out = Vec::new();
//! assert_eq!(tree.range_lookup(&15, 10, &mut out), 1);
//! assert_eq!(out, vec![(20, "twenty")]);
//! ```
//!
//! ## Thread Safety
//!
//! The tree is `Sync` and meant to be shared via `Arc<Tree<K, V>>`. Nodes are
//! never freed while reachable; [`GenericTree::clear`] retires the old tree
//! through `crossbeam_epoch`, so concurrent readers finish safely.

#![allow(clippy::type_complexity)]

use crossbeam_epoch::{self as epoch, Atomic, Owned, Shared};
use smallvec::SmallVec;
use tracing::{debug, trace};

use std::borrow::Borrow;
use std::hash::Hash;
use std::ops::Bound;
use std::sync::atomic::{AtomicUsize, Ordering};

mod diagnostics;
pub mod error;
pub mod iter;
pub mod latch;
mod node;
mod sync;

use latch::{ExclusiveGuard, HybridLatch, OptimisticGuard};
use node::{Edge, InternalNode, LeafNode, LeafStorage, Node, NodeLatch};

pub use node::LeafLayout;

// ---------------------------------------------------------------------------
// Configuration Constants
// ---------------------------------------------------------------------------

/// Default number of separators per internal node.
const INNER_CAPACITY: usize = 64;

/// Default number of entries per leaf.
const LEAF_CAPACITY: usize = 64;

/// A B-link tree with the default geometry (64 separators per internal node,
/// 64 entries per leaf).
pub type Tree<K, V> = GenericTree<K, V, INNER_CAPACITY, LEAF_CAPACITY>;

/// Internal nodes visited on the way down, nearest parent last.
type Path<'e, K, V, const IC: usize, const LC: usize> = SmallVec<[&'e NodeLatch<K, V, IC, LC>; 8]>;

// ---------------------------------------------------------------------------
// Core Tree Structure
// ---------------------------------------------------------------------------

/// The latched root slot.
///
/// `generation` increases every time [`GenericTree::clear`] swaps in a fresh
/// tree. Split propagation compares it with the generation it descended
/// under and abandons propagation into a retired tree.
struct Root<K, V, const IC: usize, const LC: usize> {
	node: Edge<K, V, IC, LC>,
	generation: u64,
}

/// A concurrent B-link tree with configurable node capacities.
///
/// # Type Parameters
///
/// - `K`: The key type. Must implement `Clone + Ord + Hash`.
/// - `V`: The value type.
/// - `IC`: Internal node capacity in separators (at least 2).
/// - `LC`: Leaf capacity in entries (at least 2).
///
/// All operations take `&self` and may be called from any number of threads
/// at once.
pub struct GenericTree<K, V, const IC: usize, const LC: usize> {
	root: HybridLatch<Root<K, V, IC, LC>>,

	/// Level of the root node; 0 while the root is a leaf. Advisory.
	height: AtomicUsize,

	layout: LeafLayout,
}

impl<K: Clone + Ord + Hash, V, const IC: usize, const LC: usize> Default for GenericTree<K, V, IC, LC> {
	fn default() -> Self {
		Self::new()
	}
}

impl<K: Clone + Ord + Hash, V, const IC: usize, const LC: usize> GenericTree<K, V, IC, LC> {
	// -----------------------------------------------------------------------
	// Construction
	// -----------------------------------------------------------------------

	/// Creates an empty tree with sorted leaves.
	///
	/// # Example
	///
	/// ```
	/// use blinktree::Tree;
	///
	/// let tree: Tree<u64, u64> = Tree::new();
	/// assert!(tree.is_empty());
	/// assert_eq!(tree.height(), 0);
	/// ```
	pub fn new() -> Self {
		Self::with_layout(LeafLayout::default())
	}

	/// Creates an empty tree whose leaves use `layout`.
	///
	/// # Panics
	///
	/// Panics if `IC` or `LC` is below 2.
	///
	/// # Example
	///
	/// ```
	/// use blinktree::{LeafLayout, Tree};
	///
	/// let tree: Tree<u64, u64> = Tree::with_layout(LeafLayout::Hashed);
	/// tree.insert(7, 70);
	/// assert_eq!(tree.get(&7), Some(70));
	/// assert_eq!(tree.layout(), LeafLayout::Hashed);
	/// ```
	pub fn with_layout(layout: LeafLayout) -> Self {
		assert!(IC >= 2, "internal nodes need room for at least two separators");
		assert!(LC >= 2, "leaves need room for at least two entries");

		GenericTree {
			root: HybridLatch::new(Root {
				node: Atomic::new(HybridLatch::new(Node::Leaf(LeafNode::new(layout)))),
				generation: 0,
			}),
			height: AtomicUsize::new(0),
			layout,
		}
	}

	/// The leaf layout every leaf of this tree uses.
	pub fn layout(&self) -> LeafLayout {
		self.layout
	}

	/// Number of internal levels between the root and the leaves; 0 while
	/// the root is a leaf.
	///
	/// Read without synchronisation, so it may lag a concurrent root split.
	pub fn height(&self) -> usize {
		self.height.load(Ordering::Relaxed)
	}

	// -----------------------------------------------------------------------
	// Descent
	// -----------------------------------------------------------------------

	/// Optimistically enters the current root node.
	///
	/// Returns the guard together with the root generation it was read under.
	fn enter_root<'e>(
		&'e self,
		eg: &'e epoch::Guard,
	) -> error::Result<(OptimisticGuard<'e, Node<K, V, IC, LC>>, u64)> {
		let root = self.root.optimistic_or_spin();
		let generation = root.generation;
		let swip = root.node.load(Ordering::Acquire, eg);
		root.recheck()?;

		// SAFETY: the pointer was validated above and the epoch keeps it alive
		let latch = unsafe { swip.as_ref() }.ok_or(error::Error::Unwind)?;
		Ok((latch.optimistic_or_spin(), generation))
	}

	/// Moves optimistically from `p_guard` to the node behind `swip`.
	///
	/// The parent is validated after the pointer is loaded and before it is
	/// dereferenced; the child snapshot is then taken.
	pub(crate) fn lock_coupling<'e>(
		p_guard: &OptimisticGuard<'e, Node<K, V, IC, LC>>,
		swip: &Edge<K, V, IC, LC>,
		eg: &'e epoch::Guard,
	) -> error::Result<OptimisticGuard<'e, Node<K, V, IC, LC>>> {
		let shared = swip.load(Ordering::Acquire, eg);
		p_guard.recheck()?;

		// SAFETY: validated pointer, protected by the epoch guard
		let c_latch = unsafe { shared.as_ref() }.ok_or(error::Error::Unwind)?;
		Ok(c_latch.optimistic_or_spin())
	}

	/// Descends to the node on `level` that owns `key`, moving right along
	/// sibling links whenever `key` is at or past a node's high key.
	///
	/// Every internal node the descent leaves downward is pushed onto `path`.
	fn descend<'e, Q>(
		&'e self,
		key: &Q,
		level: u16,
		path: &mut Path<'e, K, V, IC, LC>,
		eg: &'e epoch::Guard,
	) -> error::Result<(OptimisticGuard<'e, Node<K, V, IC, LC>>, u64)>
	where
		K: Borrow<Q>,
		Q: ?Sized + Ord,
	{
		path.clear();
		let (mut guard, generation) = self.enter_root(eg)?;

		if guard.level() < level {
			// The root split that makes `level` exist is not installed yet.
			return Err(error::Error::Unwind);
		}

		loop {
			if !guard.covers(key) {
				guard = Self::lock_coupling(&guard, guard.sibling(), eg)?;
				continue;
			}

			if guard.level() == level {
				return Ok((guard, generation));
			}

			let internal = guard.as_internal();
			let edge = internal.edge_at(internal.child_pos(key))?;
			let child = Self::lock_coupling(&guard, edge, eg)?;
			path.push(guard.latch());
			guard = child;
		}
	}

	/// Descends to the leaf that owns `key`.
	pub(crate) fn find_leaf<'e, Q>(
		&'e self,
		key: &Q,
		eg: &'e epoch::Guard,
	) -> error::Result<OptimisticGuard<'e, Node<K, V, IC, LC>>>
	where
		K: Borrow<Q>,
		Q: ?Sized + Ord,
	{
		let mut path = Path::new();
		self.descend(key, 0, &mut path, eg).map(|(guard, _)| guard)
	}

	/// Descends along the leftmost edges to the node at `level`.
	///
	/// Splits only ever add nodes to the right, so the leftmost node of a
	/// level is fixed for the lifetime of the tree.
	pub(crate) fn find_leftmost<'e>(
		&'e self,
		level: u16,
		eg: &'e epoch::Guard,
	) -> error::Result<OptimisticGuard<'e, Node<K, V, IC, LC>>> {
		let (mut guard, _) = self.enter_root(eg)?;
		if guard.level() < level {
			return Err(error::Error::Unwind);
		}
		while guard.level() > level {
			let edge = guard.as_internal().edge_at(0)?;
			guard = Self::lock_coupling(&guard, edge, eg)?;
		}
		Ok(guard)
	}

	// -----------------------------------------------------------------------
	// Point Lookups
	// -----------------------------------------------------------------------

	/// Looks up `key` and applies `f` to its value.
	///
	/// `f` runs against an optimistic snapshot of the leaf and may be invoked
	/// again if the snapshot fails validation; only the result of the call
	/// made on a validated snapshot is returned. Do not perform side effects
	/// in `f`.
	///
	/// # Example
	///
	/// ```
	/// use blinktree::Tree;
	///
	/// let tree: Tree<u64, Vec<u8>> = Tree::new();
	/// tree.insert(1, vec![1, 2, 3]);
	///
	/// assert_eq!(tree.lookup(&1, |v| v.len()), Some(3));
	/// assert_eq!(tree.lookup(&2, |v| v.len()), None);
	/// ```
	pub fn lookup<Q, R, F>(&self, key: &Q, f: F) -> Option<R>
	where
		K: Borrow<Q>,
		Q: ?Sized + Ord + Hash,
		F: Fn(&V) -> R,
	{
		let eg = &epoch::pin();

		loop {
			let perform = || {
				let guard = self.find_leaf(key, eg)?;
				let found = guard.as_leaf().entries.find(key)?.map(&f);
				guard.recheck()?;
				error::Result::Ok(found)
			};

			match perform() {
				Ok(found) => return found,
				Err(_) => continue,
			}
		}
	}

	/// Returns a clone of the value stored for `key`.
	pub fn get<Q>(&self, key: &Q) -> Option<V>
	where
		K: Borrow<Q>,
		Q: ?Sized + Ord + Hash,
		V: Clone,
	{
		self.lookup(key, V::clone)
	}

	/// `true` if `key` is present.
	pub fn contains_key<Q>(&self, key: &Q) -> bool
	where
		K: Borrow<Q>,
		Q: ?Sized + Ord + Hash,
	{
		self.lookup(key, |_| ()).is_some()
	}

	// -----------------------------------------------------------------------
	// Insertion and Split Propagation
	// -----------------------------------------------------------------------

	/// Inserts `key` with `value`.
	///
	/// An existing entry for `key` is overwritten and its old value returned.
	/// A full leaf is split first; the split cascades upward and may install a
	/// new root.
	///
	/// # Example
	///
	/// ```
	/// use blinktree::Tree;
	///
	/// let tree: Tree<u64, &str> = Tree::new();
	///
	/// assert_eq!(tree.insert(1, "one"), None);
	/// assert_eq!(tree.insert(1, "uno"), Some("one"));
	/// ```
	pub fn insert(&self, key: K, value: V) -> Option<V> {
		let eg = &epoch::pin();
		let mut path = Path::new();

		let (mut leaf, generation) = loop {
			let attempt = self
				.descend(&key, 0, &mut path, eg)
				.and_then(|(guard, generation)| Ok((guard.to_exclusive()?, generation)));

			match attempt {
				Ok(locked) => break locked,
				Err(_) => continue,
			}
		};

		let node = leaf.as_leaf_mut();
		if let Some(slot) = node.entries.find_mut(&key) {
			return Some(std::mem::replace(slot, value));
		}

		if node.has_space() {
			node.entries.push(key, value);
			return None;
		}

		// Split before inserting so a leaf never grows past its capacity.
		let (separator, mut right) = node.split();
		if key < separator {
			node.entries.push(key, value);
		} else {
			right.entries.push(key, value);
		}
		trace!(left = node.len(), right = right.len(), "split leaf");

		let right = Owned::new(HybridLatch::new(Node::Leaf(right))).into_shared(eg);
		node.sibling.store(right, Ordering::Release);

		self.propagate(leaf, separator, right, generation, &mut path, eg);
		None
	}

	/// Publishes `(separator, right)` one level above `child`, splitting
	/// ancestors as needed.
	///
	/// `child` stays latched until its parent is latched, so no reader can
	/// reach the parent level between the split and the separator insert
	/// without the sibling link already in place. Latches are taken
	/// bottom-up and left-to-right, with the root latch last.
	fn propagate<'e>(
		&'e self,
		mut child: ExclusiveGuard<'e, Node<K, V, IC, LC>>,
		mut separator: K,
		mut right: Shared<'e, NodeLatch<K, V, IC, LC>>,
		generation: u64,
		path: &mut Path<'e, K, V, IC, LC>,
		eg: &'e epoch::Guard,
	) {
		loop {
			let level = child.level();

			let parent_latch = match path.pop() {
				Some(latch) => latch,
				None => {
					let mut root = self.root_exclusive();
					if root.generation != generation {
						// The tree was cleared underneath us.
						return;
					}

					let current = root.node.load(Ordering::Acquire, eg);
					if std::ptr::eq(current.as_raw(), child.latch()) {
						let new_root = InternalNode::new_root(
							level + 1,
							separator,
							Atomic::from(current),
							Atomic::from(right),
						);
						let slot = &mut *root;
						slot.node.store(Owned::new(HybridLatch::new(Node::Internal(new_root))), Ordering::Release);
						self.height.store(usize::from(level) + 1, Ordering::Release);
						debug!(height = level + 1, "installed new root");
						return;
					}
					drop(root);

					// Someone else grew the tree above `child`.
					match self.parent_for(&separator, level + 1, generation, path, eg) {
						Some(latch) => latch,
						None => return,
					}
				}
			};

			// An obsolete parent means the tree was cleared.
			let Ok(mut parent) = parent_latch.exclusive() else {
				return;
			};

			while !parent.covers(&separator) {
				let next = parent.sibling().load(Ordering::Acquire, eg);
				// SAFETY: links only change under the latch we hold
				let next = unsafe { next.as_ref() }.expect("fenced node without a right sibling");
				let Ok(next) = next.exclusive() else {
					return;
				};
				parent = next;
			}

			drop(child);

			let internal = parent.as_internal_mut();
			if internal.has_space() {
				internal.insert_separator(separator, Atomic::from(right));
				return;
			}

			let (up, mut sibling) = internal.split();
			if separator < up {
				internal.insert_separator(separator, Atomic::from(right));
			} else {
				sibling.insert_separator(separator, Atomic::from(right));
			}
			trace!(level = level + 1, left = internal.len(), right = sibling.len(), "split internal node");

			let sibling = Owned::new(HybridLatch::new(Node::Internal(sibling))).into_shared(eg);
			internal.sibling.store(sibling, Ordering::Release);

			child = parent;
			separator = up;
			right = sibling;
		}
	}

	/// Finds the node on `level` that should receive `separator`, waiting for
	/// an in-flight root split to install that level. Returns `None` once the
	/// tree has been cleared.
	fn parent_for<'e>(
		&'e self,
		separator: &K,
		level: u16,
		generation: u64,
		path: &mut Path<'e, K, V, IC, LC>,
		eg: &'e epoch::Guard,
	) -> Option<&'e NodeLatch<K, V, IC, LC>> {
		loop {
			let root = self.root.optimistic_or_spin();
			let current = root.generation;
			if root.recheck().is_err() {
				continue;
			}
			if current != generation {
				return None;
			}

			match self.descend(separator, level, path, eg) {
				Ok((guard, current)) if current == generation => return Some(guard.latch()),
				Ok(_) => return None,
				Err(_) => std::thread::yield_now(),
			}
		}
	}

	fn root_exclusive(&self) -> ExclusiveGuard<'_, Root<K, V, IC, LC>> {
		self.root.exclusive().expect("the root latch is never retired")
	}

	// -----------------------------------------------------------------------
	// Range Scans
	// -----------------------------------------------------------------------

	/// Copies up to `count` entries with keys `>= start` into `out`, in
	/// ascending key order, and returns how many were written.
	///
	/// `out` is cleared first. The scan walks the leaf level through sibling
	/// links; if any leaf fails validation the partial result is discarded
	/// and the scan restarts from the root.
	///
	/// # Example
	///
	/// ```
	/// use blinktree::Tree;
	///
	/// let tree: Tree<u64, u64> = Tree::new();
	/// for k in 0..100 {
	///     tree.insert(k, k * 2);
	/// }
	///
	/// let mut out = Vec::new();
	/// assert_eq!(tree.range_lookup(&95, 10, &mut out), 5);
	/// assert_eq!(out[0], (95, 190));
	/// ```
	pub fn range_lookup<Q>(&self, start: &Q, count: usize, out: &mut Vec<(K, V)>) -> usize
	where
		K: Borrow<Q>,
		Q: ?Sized + Ord,
		V: Clone,
	{
		out.clear();
		self.scan(Bound::Included(start), count, out)
	}

	/// Returns up to `count` entries with keys `>= start`.
	pub fn range<Q>(&self, start: &Q, count: usize) -> Vec<(K, V)>
	where
		K: Borrow<Q>,
		Q: ?Sized + Ord,
		V: Clone,
	{
		let mut out = Vec::with_capacity(count.min(LC * 4));
		self.range_lookup(start, count, &mut out);
		out
	}

	/// Appends up to `count` entries starting at `start` to `out` and returns
	/// how many were appended. Retries until one pass validates.
	pub(crate) fn scan<Q>(&self, start: Bound<&Q>, count: usize, out: &mut Vec<(K, V)>) -> usize
	where
		K: Borrow<Q>,
		Q: ?Sized + Ord,
		V: Clone,
	{
		if count == 0 {
			return 0;
		}

		let base = out.len();
		let eg = &epoch::pin();

		loop {
			match self.scan_from(start, count, base, out, eg) {
				Ok(()) => return out.len() - base,
				Err(_) => {
					out.truncate(base);
					continue;
				}
			}
		}
	}

	fn scan_from<'e, Q>(
		&'e self,
		start: Bound<&Q>,
		count: usize,
		base: usize,
		out: &mut Vec<(K, V)>,
		eg: &'e epoch::Guard,
	) -> error::Result<()>
	where
		K: Borrow<Q>,
		Q: ?Sized + Ord,
		V: Clone,
	{
		let mut guard = match start {
			Bound::Included(key) | Bound::Excluded(key) => self.find_leaf(key, eg)?,
			Bound::Unbounded => self.find_leftmost(0, eg)?,
		};

		loop {
			let wanted = count - (out.len() - base);
			guard.as_leaf().entries.collect_from(start, wanted, out)?;
			guard.recheck()?;

			if out.len() - base >= count {
				return Ok(());
			}

			let sibling = guard.sibling();
			if sibling.load(Ordering::Acquire, eg).is_null() {
				guard.recheck()?;
				return Ok(());
			}
			guard = Self::lock_coupling(&guard, sibling, eg)?;
		}
	}

	/// Returns an iterator over all entries in ascending key order.
	///
	/// # Example
	///
	/// ```
	/// use blinktree::Tree;
	///
	/// let tree: Tree<u64, char> = Tree::new();
	/// tree.insert(2, 'b');
	/// tree.insert(1, 'a');
	///
	/// let entries: Vec<_> = tree.iter().collect();
	/// assert_eq!(entries, vec![(1, 'a'), (2, 'b')]);
	/// ```
	pub fn iter(&self) -> iter::Iter<'_, K, V, IC, LC>
	where
		V: Clone,
	{
		iter::Iter::new(self, Bound::Unbounded)
	}

	/// Returns an iterator over the entries with keys `>= start`.
	pub fn iter_from(&self, start: &K) -> iter::Iter<'_, K, V, IC, LC>
	where
		V: Clone,
	{
		iter::Iter::new(self, Bound::Included(start.clone()))
	}

	// -----------------------------------------------------------------------
	// Whole-Tree Operations
	// -----------------------------------------------------------------------

	/// Number of entries, counted by walking the leaf level.
	pub fn len(&self) -> usize {
		self.leaf_stats().entries
	}

	/// `true` if the tree has no entries.
	///
	/// Splits never leave a leaf empty, so only the leftmost leaf is checked.
	pub fn is_empty(&self) -> bool {
		let eg = &epoch::pin();

		loop {
			let perform = || {
				let guard = self.find_leftmost(0, eg)?;
				let empty = guard.as_leaf().len() == 0;
				guard.recheck()?;
				error::Result::Ok(empty)
			};

			match perform() {
				Ok(empty) => return empty,
				Err(_) => continue,
			}
		}
	}

	/// Removes every entry.
	///
	/// A fresh empty leaf becomes the root and the old tree is retired node
	/// by node. Concurrent inserts into the old tree either complete before
	/// the swap or restart into the new tree.
	///
	/// # Example
	///
	/// ```
	/// use blinktree::Tree;
	///
	/// let tree: Tree<u64, u64> = Tree::new();
	/// for k in 0..1000 {
	///     tree.insert(k, k);
	/// }
	/// tree.clear();
	/// assert!(tree.is_empty());
	/// assert_eq!(tree.height(), 0);
	/// ```
	pub fn clear(&self) {
		let eg = &epoch::pin();

		let old = {
			let mut root = self.root_exclusive();
			let slot = &mut *root;
			let fresh = Owned::new(HybridLatch::new(Node::Leaf(LeafNode::new(self.layout))));
			let old = slot.node.swap(fresh, Ordering::AcqRel, eg);
			slot.generation += 1;
			self.height.store(0, Ordering::Release);
			old
		};

		// SAFETY: `old` is no longer reachable from the root
		let retired = unsafe { Self::retire_levels(old, eg) };
		debug!(retired, "cleared tree");
	}

	/// Marks every node reachable from `top` obsolete and defers its
	/// destruction. Walks each level left to right, holding one latch at a
	/// time.
	///
	/// # Safety
	///
	/// `top` must be unreachable from the root slot.
	unsafe fn retire_levels<'g>(top: Shared<'g, NodeLatch<K, V, IC, LC>>, eg: &'g epoch::Guard) -> usize {
		let mut retired = 0;
		let mut leftmost = top;

		while !leftmost.is_null() {
			let mut below = Shared::null();
			let mut current = leftmost;

			while let Some(latch) = unsafe { current.as_ref() } {
				let Ok(mut guard) = latch.exclusive() else {
					break;
				};
				if below.is_null() {
					if let Node::Internal(internal) = &*guard {
						below = internal.edge_at(0).map_or(Shared::null(), |edge| edge.load(Ordering::Acquire, eg));
					}
				}
				let next = guard.sibling().load(Ordering::Acquire, eg);
				guard.mark_obsolete();
				drop(guard);

				unsafe { eg.defer_destroy(current) };
				retired += 1;
				current = next;
			}

			leftmost = below;
		}

		retired
	}
}

impl<K, V, const IC: usize, const LC: usize> Drop for GenericTree<K, V, IC, LC> {
	fn drop(&mut self) {
		// SAFETY: `&mut self` rules out concurrent access
		let eg = unsafe { epoch::unprotected() };
		let mut leftmost = self.root.as_mut().node.load(Ordering::Relaxed, eg);

		while !leftmost.is_null() {
			let mut below = Shared::null();
			let mut current = leftmost;

			while !current.is_null() {
				// SAFETY: every node is owned by exactly one level chain
				let mut owned = unsafe { current.into_owned() };
				let latch: &mut NodeLatch<K, V, IC, LC> = &mut owned;
				let node: &mut Node<K, V, IC, LC> = latch.as_mut();
				if below.is_null() {
					if let Node::Internal(internal) = &*node {
						below = internal.edge_at(0).map_or(Shared::null(), |edge| edge.load(Ordering::Relaxed, eg));
					}
				}
				current = node.sibling().load(Ordering::Relaxed, eg);
			}

			leftmost = below;
		}
	}
}
