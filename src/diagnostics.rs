//! Whole-tree inspection: structural verification, leaf fill factor and an
//! exhaustive fallback lookup.
//!
//! None of these are hot-path operations. `sanity_check` assumes there are no
//! concurrent writers; the others tolerate them.

use crossbeam_epoch::{self as epoch, Shared};
use tracing::{debug, warn};

use std::borrow::Borrow;
use std::fmt;
use std::hash::Hash;
use std::sync::atomic::Ordering;

use crate::latch::SharedGuard;
use crate::node::{LeafStorage, Node, NodeLatch};
use crate::GenericTree;

/// Totals gathered from one pass over the leaf level.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct LeafStats {
	pub(crate) entries: usize,
	pub(crate) leaves: usize,
}

/// A node as seen by the top-down pass, with the key range its parent
/// assigned to it.
struct Placement<K, V, const IC: usize, const LC: usize> {
	latch: *const NodeLatch<K, V, IC, LC>,
	low: Option<K>,
	high: Option<K>,
}

impl<K: Clone + Ord + Hash, V, const IC: usize, const LC: usize> GenericTree<K, V, IC, LC> {
	/// Walks the leaf level left to right and counts leaves and entries.
	///
	/// Each leaf is read under its own optimistic snapshot and re-read on a
	/// failed validation; the walk restarts from the leftmost leaf only if it
	/// runs into a retired node.
	pub(crate) fn leaf_stats(&self) -> LeafStats {
		let eg = &epoch::pin();

		'restart: loop {
			let Ok(leftmost) = self.find_leftmost(0, eg) else {
				continue;
			};
			let mut latch = leftmost.latch();
			let mut stats = LeafStats::default();

			loop {
				let guard = latch.optimistic_or_spin();
				let len = guard.as_leaf().len();
				let next = guard.sibling().load(Ordering::Acquire, eg);

				if guard.recheck().is_err() {
					if latch.version().is_obsolete() {
						continue 'restart;
					}
					continue;
				}

				stats.entries += len;
				stats.leaves += 1;

				// SAFETY: validated pointer, protected by the epoch guard
				match unsafe { next.as_ref() } {
					Some(next) => latch = next,
					None => return stats,
				}
			}
		}
	}

	/// Fraction of leaf slots in use: live entries divided by
	/// `leaves × LC`.
	///
	/// Lies in `[1/LC, 1.0]` for any non-empty tree; `0.0` when empty.
	///
	/// # Example
	///
	/// ```
	/// use blinktree::GenericTree;
	///
	/// let tree: GenericTree<u64, u64, 8, 8> = GenericTree::new();
	/// for k in 0..8 {
	///     tree.insert(k, k);
	/// }
	/// assert_eq!(tree.utilization(), 1.0);
	/// ```
	pub fn utilization(&self) -> f64 {
		let stats = self.leaf_stats();
		stats.entries as f64 / (stats.leaves * LC) as f64
	}

	/// Looks `key` up without relying on the optimistic descent alone.
	///
	/// Starts at the leaf the descent reaches and walks right under shared
	/// latches. If the key is still missing, scans the entire leaf level from
	/// the leftmost leaf. A key found anywhere other than its target leaf is
	/// reported with a `warn!` event.
	pub fn find_anyway<Q>(&self, key: &Q) -> Option<V>
	where
		K: Borrow<Q>,
		Q: ?Sized + Ord + Hash,
		V: Clone,
	{
		let eg = &epoch::pin();

		let target = loop {
			match self.find_leaf(key, eg).and_then(|guard| guard.to_shared()) {
				Ok(guard) => break guard,
				Err(_) => continue,
			}
		};
		if let Some((value, hops)) = Self::walk_shared(target, key, eg) {
			if hops > 0 {
				warn!(hops, "key found right of its target leaf");
			}
			return Some(value);
		}

		let leftmost = loop {
			match self.find_leftmost(0, eg).and_then(|guard| guard.to_shared()) {
				Ok(guard) => break guard,
				Err(_) => continue,
			}
		};
		let (value, hops) = Self::walk_shared(leftmost, key, eg)?;
		warn!(hops, "key found outside its descent path");
		Some(value)
	}

	/// Shared lock coupling along the sibling chain, starting at `guard`.
	fn walk_shared<'e, Q>(
		mut guard: SharedGuard<'e, Node<K, V, IC, LC>>,
		key: &Q,
		eg: &'e epoch::Guard,
	) -> Option<(V, usize)>
	where
		K: Borrow<Q>,
		Q: ?Sized + Ord + Hash,
		K: 'e,
		V: Clone + 'e,
	{
		let mut hops = 0;
		loop {
			if let Ok(Some(value)) = guard.as_leaf().entries.find(key) {
				return Some((value.clone(), hops));
			}

			let next = guard.sibling().load(Ordering::Acquire, eg);
			// SAFETY: read under a shared latch, protected by the epoch guard
			let next = unsafe { next.as_ref() }?;
			guard = next.shared();
			hops += 1;
		}
	}

	/// Verifies the structure of the whole tree and panics on the first
	/// violation.
	///
	/// Checks, for every node reachable from the root:
	///
	/// - keys are strictly ascending and inside the range the parent assigns
	///   (`low <= k < high`), and the node's high key equals that bound;
	/// - every level is one sibling chain, visiting the same nodes in the same
	///   order as the top-down pass, with each high key equal to the next
	///   node's low bound and the last node unbounded;
	/// - levels decrease by one per edge and the root level equals
	///   [`height`](Self::height);
	/// - every stored key can be found again in its leaf.
	///
	/// Must not run concurrently with writers.
	pub fn sanity_check(&self)
	where
		K: fmt::Debug,
	{
		let eg = &epoch::pin();
		let root = self.root.shared();
		let root_node = root.node.load(Ordering::Acquire, eg);
		// SAFETY: the root slot never holds a null pointer
		let root_latch = unsafe { root_node.as_ref() }.expect("root slot is empty");

		let root_level = root_latch.shared().level();
		assert_eq!(usize::from(root_level), self.height(), "height counter disagrees with the root level");

		let mut levels: Vec<Vec<Placement<K, V, IC, LC>>> = (0..=root_level).map(|_| Vec::new()).collect();
		let mut entries = 0;
		self.check_subtree(root_latch, None, None, root_level, true, &mut levels, &mut entries, eg);

		for (level, placed) in levels.iter().enumerate() {
			Self::check_level_chain(level, placed, eg);
		}

		debug!(
			levels = levels.len(),
			nodes = levels.iter().map(Vec::len).sum::<usize>(),
			entries,
			"sanity check passed"
		);
	}

	#[allow(clippy::too_many_arguments)]
	fn check_subtree<'e>(
		&self,
		latch: &'e NodeLatch<K, V, IC, LC>,
		low: Option<K>,
		high: Option<K>,
		level: u16,
		is_root: bool,
		levels: &mut Vec<Vec<Placement<K, V, IC, LC>>>,
		entries: &mut usize,
		eg: &'e epoch::Guard,
	) where
		K: fmt::Debug,
	{
		let guard = latch.shared();
		assert!(!guard.is_obsolete(), "reachable node is obsolete");
		assert_eq!(guard.level(), level, "node sits on the wrong level");
		assert_eq!(guard.high_key(), high.as_ref(), "high key differs from the parent's separator");

		let in_range =
			|k: &K| low.as_ref().map_or(true, |lo| k >= lo) && high.as_ref().map_or(true, |hi| k < hi);

		let mut children = Vec::new();
		match &*guard {
			Node::Leaf(leaf) => {
				let keys = leaf.entries.ordered_keys();
				assert_eq!(keys.len(), leaf.len(), "leaf length disagrees with its entries");
				assert!(is_root || !keys.is_empty(), "non-root leaf is empty");
				assert_eq!(leaf.entries.layout(), self.layout, "leaf has the wrong layout");
				for pair in keys.windows(2) {
					assert!(pair[0] < pair[1], "leaf keys out of order: {:?} then {:?}", pair[0], pair[1]);
				}
				for key in &keys {
					assert!(in_range(*key), "leaf key {key:?} outside [{low:?}, {high:?})");
					assert!(
						matches!(leaf.entries.find(*key), Ok(Some(_))),
						"leaf key {key:?} cannot be found again"
					);
				}
				*entries += keys.len();
			}
			Node::Internal(internal) => {
				assert_eq!(internal.keys.len(), internal.edges.len(), "separator and edge counts differ");
				assert!(internal.upper_edge.is_some(), "internal node without an upper edge");
				for pair in internal.keys.windows(2) {
					assert!(pair[0] < pair[1], "separators out of order: {:?} then {:?}", pair[0], pair[1]);
				}
				for key in &internal.keys {
					assert!(in_range(key), "separator {key:?} outside [{low:?}, {high:?})");
				}

				let len = internal.len();
				for pos in 0..=len {
					let child_low = if pos == 0 { low.clone() } else { Some(internal.keys[pos - 1].clone()) };
					let child_high = if pos == len { high.clone() } else { Some(internal.keys[pos].clone()) };
					let edge = internal.edge_at(pos).expect("edge position within bounds");
					let child = edge.load(Ordering::Acquire, eg);
					// SAFETY: protected by the epoch guard
					let child = unsafe { child.as_ref() }.expect("null child edge");
					children.push((child, child_low, child_high));
				}
			}
		}
		drop(guard);

		levels[usize::from(level)].push(Placement {
			latch,
			low,
			high,
		});

		for (child, child_low, child_high) in children {
			self.check_subtree(child, child_low, child_high, level - 1, false, levels, entries, eg);
		}
	}

	fn check_level_chain(level: usize, placed: &[Placement<K, V, IC, LC>], eg: &epoch::Guard)
	where
		K: fmt::Debug,
	{
		let (first, last) = match (placed.first(), placed.last()) {
			(Some(first), Some(last)) => (first, last),
			_ => panic!("level {level} has no nodes"),
		};
		assert!(first.low.is_none(), "leftmost node on level {level} has a low bound");
		assert!(last.high.is_none(), "rightmost node on level {level} has a high key");
		for pair in placed.windows(2) {
			assert_eq!(pair[0].high, pair[1].low, "gap or overlap between siblings on level {level}");
		}

		let mut current = Shared::from(first.latch);
		let mut walked = 0;
		// SAFETY: nodes of the checked tree stay alive under the epoch guard
		while let Some(latch) = unsafe { current.as_ref() } {
			assert!(walked < placed.len(), "sibling chain on level {level} runs past the tree");
			assert!(
				std::ptr::eq(latch, placed[walked].latch),
				"sibling chain on level {level} diverges at node {walked}"
			);
			current = latch.shared().sibling().load(Ordering::Acquire, eg);
			walked += 1;
		}
		assert_eq!(walked, placed.len(), "sibling chain on level {level} ends early");
	}
}

#[cfg(all(test, not(loom)))]
mod tests {
	use crossbeam_epoch::{self as epoch, Owned};

	use std::sync::atomic::Ordering;

	use crate::latch::HybridLatch;
	use crate::node::{LeafEntries, LeafNode, LeafStorage, Node};
	use crate::{GenericTree, LeafLayout};

	type Small = GenericTree<u64, u64, 4, 4>;

	/// Runs `f` on the leftmost leaf under its exclusive latch.
	fn with_leftmost_leaf(tree: &Small, f: impl FnOnce(&mut LeafNode<u64, u64, 4, 4>)) {
		let eg = &epoch::pin();
		let mut guard = tree.find_leftmost(0, eg).and_then(|guard| guard.to_exclusive()).unwrap();
		f(guard.as_leaf_mut());
	}

	/// Splits `leaf` and links the right half, leaving the parent (or the
	/// root slot) unaware of the new node.
	fn split_without_separator(leaf: &mut LeafNode<u64, u64, 4, 4>) {
		let eg = &epoch::pin();
		let (_, right) = leaf.split();
		let right = Owned::new(HybridLatch::new(Node::Leaf(right))).into_shared(eg);
		leaf.sibling.store(right, Ordering::Release);
	}

	fn full_root_leaf() -> Small {
		let tree = Small::new();
		for k in 0..4 {
			tree.insert(k, k);
		}
		assert_eq!(tree.height(), 0);
		tree
	}

	fn two_level_tree() -> Small {
		let tree = Small::new();
		for k in 0..8 {
			tree.insert(k, k);
		}
		tree.sanity_check();
		tree
	}

	#[test]
	fn leaf_stats_counts_every_leaf() {
		let tree: GenericTree<u64, u64, 4, 4> = GenericTree::new();
		for k in 0..100 {
			tree.insert(k, k);
		}

		let stats = tree.leaf_stats();
		assert_eq!(stats.entries, 100);
		assert!(stats.leaves >= 25);
		assert_eq!(tree.len(), 100);
	}

	#[test]
	fn utilization_of_empty_tree_is_zero() {
		let tree: GenericTree<u64, u64, 4, 4> = GenericTree::new();
		assert_eq!(tree.utilization(), 0.0);
	}

	#[test]
	fn find_anyway_agrees_with_lookup() {
		for layout in [LeafLayout::Sorted, LeafLayout::Hashed] {
			let tree: GenericTree<u64, u64, 4, 4> = GenericTree::with_layout(layout);
			for k in (0..300).rev() {
				tree.insert(k, k + 7);
			}
			for k in 0..300 {
				assert_eq!(tree.find_anyway(&k), Some(k + 7));
			}
			assert_eq!(tree.find_anyway(&300), None);
		}
	}

	#[test]
	fn find_anyway_follows_an_unpublished_split() {
		let tree = full_root_leaf();
		with_leftmost_leaf(&tree, split_without_separator);

		assert_eq!(tree.find_anyway(&3), Some(3));
		assert_eq!(tree.find_anyway(&0), Some(0));
		assert_eq!(tree.find_anyway(&9), None);
		// the root leaf's fence still routes plain lookups to the right half
		assert_eq!(tree.get(&3), Some(3));
	}

	#[test]
	fn find_anyway_walks_right_past_a_stale_fence() {
		let tree = full_root_leaf();
		with_leftmost_leaf(&tree, |leaf| {
			split_without_separator(leaf);
			leaf.high_key = None;
		});

		// the left leaf now claims every key, so the optimistic path stops there
		assert_eq!(tree.get(&3), None);
		assert_eq!(tree.find_anyway(&3), Some(3));
		assert_eq!(tree.find_anyway(&4), None);
	}

	#[test]
	fn find_anyway_scans_from_the_leftmost_leaf() {
		let tree = two_level_tree();
		with_leftmost_leaf(&tree, |leaf| leaf.entries.push(100, 100));

		assert_eq!(tree.get(&100), None);
		assert_eq!(tree.find_anyway(&100), Some(100));
		assert_eq!(tree.find_anyway(&101), None);
		assert_eq!(tree.find_anyway(&7), Some(7));
	}

	#[test]
	#[should_panic(expected = "high key differs from the parent's separator")]
	fn sanity_check_rejects_an_unpublished_split() {
		let tree = full_root_leaf();
		with_leftmost_leaf(&tree, split_without_separator);
		tree.sanity_check();
	}

	#[test]
	#[should_panic(expected = "leaf keys out of order")]
	fn sanity_check_rejects_unordered_leaf_keys() {
		let tree = full_root_leaf();
		with_leftmost_leaf(&tree, |leaf| match &mut leaf.entries {
			LeafEntries::Sorted(entries) => entries.keys.swap(0, 2),
			LeafEntries::Hashed(_) => unreachable!("default layout is sorted"),
		});
		tree.sanity_check();
	}

	#[test]
	#[should_panic(expected = "high key differs from the parent's separator")]
	fn sanity_check_rejects_a_moved_high_key() {
		let tree = two_level_tree();
		with_leftmost_leaf(&tree, |leaf| {
			let high = leaf.high_key.expect("leftmost leaf of a two-level tree is fenced");
			leaf.high_key = Some(high + 1);
		});
		tree.sanity_check();
	}

	#[test]
	#[should_panic(expected = "outside")]
	fn sanity_check_rejects_a_misplaced_key() {
		let tree = two_level_tree();
		with_leftmost_leaf(&tree, |leaf| leaf.entries.push(100, 100));
		tree.sanity_check();
	}
}
