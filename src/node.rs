//! Node layouts for the B-link tree.
//!
//! Both node kinds carry a `high_key` (exclusive upper fence, `None` is +∞)
//! and a `sibling` link to the next node on the same level. A key `k` is
//! owned by a node iff `k < high_key`; when a descent lands on a node whose
//! fence is at or below the search key, the key has migrated right through a
//! split and the search follows `sibling`.
//!
//! ```text
//! level 1      [ 20 | 40 ]──────────────────────────►[ 70 ]──► ∅
//!             /     |     \                         /     \
//! level 0  [5 9]─►[20 31]─►[40 55]─────────────►[61 66]─►[70 88]─► ∅
//!          hk=20  hk=40    hk=61                 hk=70    hk=∞
//! ```
//!
//! Leaves come in two layouts behind the [`LeafStorage`] capability: a sorted
//! array and an open-addressed hash table. Both must produce their entries
//! in key order for range scans.

use crossbeam_epoch::Atomic;
use rustc_hash::FxHasher;
use smallvec::SmallVec;

use std::borrow::Borrow;
use std::hash::{BuildHasher, BuildHasherDefault, Hash};
use std::ops::Bound;

use crate::error;
use crate::latch::HybridLatch;

/// A latched node, the unit every pointer in the tree refers to.
pub(crate) type NodeLatch<K, V, const IC: usize, const LC: usize> = HybridLatch<Node<K, V, IC, LC>>;

/// A child or sibling link. Links never own the node they point to; nodes
/// are freed level by level through the sibling chains.
pub(crate) type Edge<K, V, const IC: usize, const LC: usize> = Atomic<NodeLatch<K, V, IC, LC>>;

/// Physical layout used for leaf entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LeafLayout {
	/// Keys and values in sorted parallel arrays. Binary-search lookups,
	/// range scans read entries in place.
	#[default]
	Sorted,
	/// Entries in a linear-probed hash table of `LC` slots. Single-probe
	/// lookups, range scans sort the leaf on demand.
	Hashed,
}

// ===========================================================================
// Node
// ===========================================================================

pub(crate) enum Node<K, V, const IC: usize, const LC: usize> {
	Internal(InternalNode<K, V, IC, LC>),
	Leaf(LeafNode<K, V, IC, LC>),
}

impl<K, V, const IC: usize, const LC: usize> Node<K, V, IC, LC> {
	#[inline]
	pub(crate) fn is_leaf(&self) -> bool {
		matches!(self, Node::Leaf(_))
	}

	/// Distance from the leaf level; leaves are level 0.
	#[inline]
	pub(crate) fn level(&self) -> u16 {
		match self {
			Node::Internal(internal) => internal.level,
			Node::Leaf(_) => 0,
		}
	}

	#[inline]
	pub(crate) fn high_key(&self) -> Option<&K> {
		match self {
			Node::Internal(internal) => internal.high_key.as_ref(),
			Node::Leaf(leaf) => leaf.high_key.as_ref(),
		}
	}

	#[inline]
	pub(crate) fn sibling(&self) -> &Edge<K, V, IC, LC> {
		match self {
			Node::Internal(internal) => &internal.sibling,
			Node::Leaf(leaf) => &leaf.sibling,
		}
	}

	/// `true` if `key` is below this node's high fence.
	#[inline]
	pub(crate) fn covers<Q>(&self, key: &Q) -> bool
	where
		K: Borrow<Q>,
		Q: ?Sized + Ord,
	{
		self.high_key().map_or(true, |hk| key < hk.borrow())
	}

	#[inline]
	pub(crate) fn as_leaf(&self) -> &LeafNode<K, V, IC, LC> {
		match self {
			Node::Leaf(leaf) => leaf,
			Node::Internal(_) => panic!("expected a leaf node"),
		}
	}

	#[inline]
	pub(crate) fn as_leaf_mut(&mut self) -> &mut LeafNode<K, V, IC, LC> {
		match self {
			Node::Leaf(leaf) => leaf,
			Node::Internal(_) => panic!("expected a leaf node"),
		}
	}

	#[inline]
	pub(crate) fn as_internal(&self) -> &InternalNode<K, V, IC, LC> {
		match self {
			Node::Internal(internal) => internal,
			Node::Leaf(_) => panic!("expected an internal node"),
		}
	}

	#[inline]
	pub(crate) fn as_internal_mut(&mut self) -> &mut InternalNode<K, V, IC, LC> {
		match self {
			Node::Internal(internal) => internal,
			Node::Leaf(_) => panic!("expected an internal node"),
		}
	}
}

// ===========================================================================
// Leaf storage capability
// ===========================================================================

/// Operations every leaf layout provides.
///
/// Readers call the `&self` methods under an optimistic guard, so they must
/// tolerate torn state: bounds are checked and inconsistencies surface as
/// [`error::Error::Unwind`] rather than panics. The `&mut self` methods run
/// under an exclusive latch.
pub(crate) trait LeafStorage<K, V>: Sized {
	fn len(&self) -> usize;

	/// Finds the value stored for `key`.
	fn find<Q>(&self, key: &Q) -> error::Result<Option<&V>>
	where
		K: Borrow<Q>,
		Q: ?Sized + Ord + Hash;

	fn find_mut<Q>(&mut self, key: &Q) -> Option<&mut V>
	where
		K: Borrow<Q>,
		Q: ?Sized + Ord + Hash;

	/// Stores an entry. The caller guarantees the key is absent and the leaf
	/// has room.
	fn push(&mut self, key: K, value: V);

	/// Appends clones of up to `limit` entries at or after `start`, in
	/// ascending key order.
	fn collect_from<Q>(
		&self,
		start: Bound<&Q>,
		limit: usize,
		out: &mut Vec<(K, V)>,
	) -> error::Result<()>
	where
		K: Borrow<Q> + Clone,
		V: Clone,
		Q: ?Sized + Ord;

	/// Keys in ascending order. Only meaningful under a shared or exclusive
	/// latch.
	fn ordered_keys(&self) -> Vec<&K>;

	/// Keeps the lower half, returns the median key (the first key of the
	/// upper half) and the upper half.
	fn split_off(&mut self) -> (K, Self);
}

// ---------------------------------------------------------------------------
// Sorted layout
// ---------------------------------------------------------------------------

pub(crate) struct SortedEntries<K, V, const LC: usize> {
	pub(crate) keys: SmallVec<[K; LC]>,
	pub(crate) values: SmallVec<[V; LC]>,
}

impl<K, V, const LC: usize> SortedEntries<K, V, LC> {
	pub(crate) fn new() -> Self {
		SortedEntries {
			keys: SmallVec::new(),
			values: SmallVec::new(),
		}
	}

	/// Position of the first key `>= key`, and whether it is an exact match.
	///
	/// The length is re-derived from the arrays on every probe so a torn read
	/// never indexes out of bounds.
	#[inline]
	pub(crate) fn lower_bound<Q>(&self, key: &Q) -> (usize, bool)
	where
		K: Borrow<Q>,
		Q: ?Sized + Ord,
	{
		let mut lower = 0;
		let mut upper = self.keys.len();

		while lower < upper {
			let mid = ((upper - lower) / 2) + lower;
			let Some(mid_key) = self.keys.get(mid) else {
				return (lower, false);
			};

			if key < mid_key.borrow() {
				upper = mid;
			} else if key > mid_key.borrow() {
				lower = mid + 1;
			} else {
				return (mid, true);
			}
		}

		(lower, false)
	}
}

impl<K: Clone + Ord, V, const LC: usize> LeafStorage<K, V> for SortedEntries<K, V, LC> {
	#[inline]
	fn len(&self) -> usize {
		self.keys.len()
	}

	fn find<Q>(&self, key: &Q) -> error::Result<Option<&V>>
	where
		K: Borrow<Q>,
		Q: ?Sized + Ord + Hash,
	{
		match self.lower_bound(key) {
			(pos, true) => self.values.get(pos).map(Some).ok_or(error::Error::Unwind),
			(_, false) => Ok(None),
		}
	}

	fn find_mut<Q>(&mut self, key: &Q) -> Option<&mut V>
	where
		K: Borrow<Q>,
		Q: ?Sized + Ord + Hash,
	{
		match self.lower_bound(key) {
			(pos, true) => self.values.get_mut(pos),
			(_, false) => None,
		}
	}

	fn push(&mut self, key: K, value: V) {
		debug_assert!(self.keys.len() < LC);
		let (pos, exact) = self.lower_bound(&key);
		debug_assert!(!exact);
		self.keys.insert(pos, key);
		self.values.insert(pos, value);
	}

	fn collect_from<Q>(
		&self,
		start: Bound<&Q>,
		limit: usize,
		out: &mut Vec<(K, V)>,
	) -> error::Result<()>
	where
		K: Borrow<Q> + Clone,
		V: Clone,
		Q: ?Sized + Ord,
	{
		let first = match start {
			Bound::Included(key) => self.lower_bound(key).0,
			Bound::Excluded(key) => match self.lower_bound(key) {
				(pos, true) => pos + 1,
				(pos, false) => pos,
			},
			Bound::Unbounded => 0,
		};
		let end = self.keys.len().min(first.saturating_add(limit));
		for pos in first..end {
			let key = self.keys.get(pos).ok_or(error::Error::Unwind)?;
			let value = self.values.get(pos).ok_or(error::Error::Unwind)?;
			out.push((key.clone(), value.clone()));
		}
		Ok(())
	}

	fn ordered_keys(&self) -> Vec<&K> {
		self.keys.iter().collect()
	}

	fn split_off(&mut self) -> (K, Self) {
		let mid = self.keys.len() / 2;
		let mut right = SortedEntries::new();
		right.keys.extend(self.keys.drain(mid..));
		right.values.extend(self.values.drain(mid..));
		let median = right.keys.first().expect("split of a leaf with fewer than two entries");
		(median.clone(), right)
	}
}

// ---------------------------------------------------------------------------
// Hashed layout
// ---------------------------------------------------------------------------

type SlotHasher = BuildHasherDefault<FxHasher>;

pub(crate) struct HashedEntries<K, V, const LC: usize> {
	pub(crate) slots: [Option<(K, V)>; LC],
	pub(crate) len: usize,
}

impl<K, V, const LC: usize> HashedEntries<K, V, LC> {
	pub(crate) fn new() -> Self {
		HashedEntries {
			slots: std::array::from_fn(|_| None),
			len: 0,
		}
	}

	#[inline]
	fn home_slot<Q: ?Sized + Hash>(key: &Q) -> usize {
		(SlotHasher::default().hash_one(key) % LC as u64) as usize
	}

	/// Drains every occupied slot.
	fn drain_entries(&mut self) -> Vec<(K, V)> {
		self.len = 0;
		self.slots.iter_mut().filter_map(Option::take).collect()
	}
}

impl<K: Clone + Ord + Hash, V, const LC: usize> LeafStorage<K, V> for HashedEntries<K, V, LC> {
	#[inline]
	fn len(&self) -> usize {
		self.len
	}

	fn find<Q>(&self, key: &Q) -> error::Result<Option<&V>>
	where
		K: Borrow<Q>,
		Q: ?Sized + Ord + Hash,
	{
		let home = Self::home_slot(key);
		for probe in 0..LC {
			match &self.slots[(home + probe) % LC] {
				None => return Ok(None),
				Some((k, v)) if k.borrow() == key => return Ok(Some(v)),
				Some(_) => {}
			}
		}
		Ok(None)
	}

	fn find_mut<Q>(&mut self, key: &Q) -> Option<&mut V>
	where
		K: Borrow<Q>,
		Q: ?Sized + Ord + Hash,
	{
		let home = Self::home_slot(key);
		let pos = (0..LC).map(|probe| (home + probe) % LC).find(|&pos| match &self.slots[pos] {
			None => true,
			Some((k, _)) => k.borrow() == key,
		})?;
		self.slots[pos].as_mut().map(|(_, v)| v)
	}

	fn push(&mut self, key: K, value: V) {
		debug_assert!(self.len < LC);
		let home = Self::home_slot(&key);
		for probe in 0..LC {
			let slot = &mut self.slots[(home + probe) % LC];
			if slot.is_none() {
				*slot = Some((key, value));
				self.len += 1;
				return;
			}
		}
		unreachable!("push into a full hashed leaf");
	}

	fn collect_from<Q>(
		&self,
		start: Bound<&Q>,
		limit: usize,
		out: &mut Vec<(K, V)>,
	) -> error::Result<()>
	where
		K: Borrow<Q> + Clone,
		V: Clone,
		Q: ?Sized + Ord,
	{
		// Copy first, then sort the copies: the slots may be rewritten under
		// us and sorting live data could see an inconsistent order.
		let mut found: Vec<(K, V)> = self
			.slots
			.iter()
			.flatten()
			.filter(|(k, _)| match start {
				Bound::Included(s) => k.borrow() >= s,
				Bound::Excluded(s) => k.borrow() > s,
				Bound::Unbounded => true,
			})
			.map(|(k, v)| (k.clone(), v.clone()))
			.collect();
		if found.len() > LC {
			return Err(error::Error::Unwind);
		}
		found.sort_unstable_by(|a, b| a.0.cmp(&b.0));
		out.extend(found.into_iter().take(limit));
		Ok(())
	}

	fn ordered_keys(&self) -> Vec<&K> {
		let mut keys: Vec<&K> = self.slots.iter().flatten().map(|(k, _)| k).collect();
		keys.sort_unstable();
		keys
	}

	fn split_off(&mut self) -> (K, Self) {
		let mut entries = self.drain_entries();
		entries.sort_unstable_by(|a, b| a.0.cmp(&b.0));
		let upper = entries.split_off(entries.len() / 2);

		let mut right = HashedEntries::new();
		let mut median = None;
		for (key, value) in upper {
			if median.is_none() {
				median = Some(key.clone());
			}
			right.push(key, value);
		}
		for (key, value) in entries {
			self.push(key, value);
		}
		(median.expect("split of a leaf with fewer than two entries"), right)
	}
}

// ---------------------------------------------------------------------------
// Leaf node
// ---------------------------------------------------------------------------

pub(crate) enum LeafEntries<K, V, const LC: usize> {
	Sorted(SortedEntries<K, V, LC>),
	Hashed(HashedEntries<K, V, LC>),
}

impl<K, V, const LC: usize> LeafEntries<K, V, LC> {
	pub(crate) fn new(layout: LeafLayout) -> Self {
		match layout {
			LeafLayout::Sorted => LeafEntries::Sorted(SortedEntries::new()),
			LeafLayout::Hashed => LeafEntries::Hashed(HashedEntries::new()),
		}
	}

	pub(crate) fn layout(&self) -> LeafLayout {
		match self {
			LeafEntries::Sorted(_) => LeafLayout::Sorted,
			LeafEntries::Hashed(_) => LeafLayout::Hashed,
		}
	}
}

impl<K: Clone + Ord + Hash, V, const LC: usize> LeafStorage<K, V> for LeafEntries<K, V, LC> {
	#[inline]
	fn len(&self) -> usize {
		match self {
			LeafEntries::Sorted(e) => e.len(),
			LeafEntries::Hashed(e) => e.len(),
		}
	}

	#[inline]
	fn find<Q>(&self, key: &Q) -> error::Result<Option<&V>>
	where
		K: Borrow<Q>,
		Q: ?Sized + Ord + Hash,
	{
		match self {
			LeafEntries::Sorted(e) => e.find(key),
			LeafEntries::Hashed(e) => e.find(key),
		}
	}

	#[inline]
	fn find_mut<Q>(&mut self, key: &Q) -> Option<&mut V>
	where
		K: Borrow<Q>,
		Q: ?Sized + Ord + Hash,
	{
		match self {
			LeafEntries::Sorted(e) => e.find_mut(key),
			LeafEntries::Hashed(e) => e.find_mut(key),
		}
	}

	#[inline]
	fn push(&mut self, key: K, value: V) {
		match self {
			LeafEntries::Sorted(e) => e.push(key, value),
			LeafEntries::Hashed(e) => e.push(key, value),
		}
	}

	#[inline]
	fn collect_from<Q>(
		&self,
		start: Bound<&Q>,
		limit: usize,
		out: &mut Vec<(K, V)>,
	) -> error::Result<()>
	where
		K: Borrow<Q> + Clone,
		V: Clone,
		Q: ?Sized + Ord,
	{
		match self {
			LeafEntries::Sorted(e) => e.collect_from(start, limit, out),
			LeafEntries::Hashed(e) => e.collect_from(start, limit, out),
		}
	}

	fn ordered_keys(&self) -> Vec<&K> {
		match self {
			LeafEntries::Sorted(e) => e.ordered_keys(),
			LeafEntries::Hashed(e) => e.ordered_keys(),
		}
	}

	fn split_off(&mut self) -> (K, Self) {
		match self {
			LeafEntries::Sorted(e) => {
				let (median, right) = e.split_off();
				(median, LeafEntries::Sorted(right))
			}
			LeafEntries::Hashed(e) => {
				let (median, right) = e.split_off();
				(median, LeafEntries::Hashed(right))
			}
		}
	}
}

/// A leaf: entries in one of the two layouts plus the B-link header.
pub(crate) struct LeafNode<K, V, const IC: usize, const LC: usize> {
	pub(crate) entries: LeafEntries<K, V, LC>,
	/// Exclusive upper fence; `None` is +∞.
	pub(crate) high_key: Option<K>,
	/// Next leaf to the right, null for the rightmost leaf.
	pub(crate) sibling: Edge<K, V, IC, LC>,
}

impl<K, V, const IC: usize, const LC: usize> LeafNode<K, V, IC, LC> {
	pub(crate) fn new(layout: LeafLayout) -> Self {
		LeafNode {
			entries: LeafEntries::new(layout),
			high_key: None,
			sibling: Atomic::null(),
		}
	}
}

impl<K: Clone + Ord + Hash, V, const IC: usize, const LC: usize> LeafNode<K, V, IC, LC> {
	#[inline]
	pub(crate) fn len(&self) -> usize {
		self.entries.len()
	}

	#[inline]
	pub(crate) fn has_space(&self) -> bool {
		self.len() < LC
	}

	/// Moves the upper half of the entries into a new right sibling.
	///
	/// On return `self` keeps keys `< median` with `high_key = median`; the
	/// returned node owns `[median, old high_key)` and inherits the old
	/// sibling link. The caller publishes the new node by storing it in
	/// `self.sibling` before releasing the latch.
	pub(crate) fn split(&mut self) -> (K, LeafNode<K, V, IC, LC>) {
		let (median, upper) = self.entries.split_off();
		let right = LeafNode {
			entries: upper,
			high_key: self.high_key.replace(median.clone()),
			sibling: self.sibling.clone(),
		};
		(median, right)
	}
}

// ===========================================================================
// Internal node
// ===========================================================================

/// An internal node routing descents toward the leaves.
///
/// ```text
/// keys:   [ K0,  K1,  ...  K(n-1) ]
/// edges:  [ E0,  E1,  ...  E(n-1) ]  upper_edge
///
/// E0 holds keys < K0, Ei holds [K(i-1), Ki), upper_edge holds
/// [K(n-1), high_key).
/// ```
pub(crate) struct InternalNode<K, V, const IC: usize, const LC: usize> {
	pub(crate) keys: SmallVec<[K; IC]>,
	pub(crate) edges: SmallVec<[Edge<K, V, IC, LC>; IC]>,
	pub(crate) upper_edge: Option<Edge<K, V, IC, LC>>,
	/// Exclusive upper fence; `None` is +∞.
	pub(crate) high_key: Option<K>,
	/// Next node to the right on the same level.
	pub(crate) sibling: Edge<K, V, IC, LC>,
	/// Height above the leaves, at least 1.
	pub(crate) level: u16,
}

impl<K, V, const IC: usize, const LC: usize> InternalNode<K, V, IC, LC> {
	pub(crate) fn new(level: u16) -> Self {
		InternalNode {
			keys: SmallVec::new(),
			edges: SmallVec::new(),
			upper_edge: None,
			high_key: None,
			sibling: Atomic::null(),
			level,
		}
	}

	/// A root over exactly two children split at `separator`.
	pub(crate) fn new_root(
		level: u16,
		separator: K,
		left: Edge<K, V, IC, LC>,
		right: Edge<K, V, IC, LC>,
	) -> Self {
		let mut root = InternalNode::new(level);
		root.keys.push(separator);
		root.edges.push(left);
		root.upper_edge = Some(right);
		root
	}

	#[inline]
	pub(crate) fn len(&self) -> usize {
		self.keys.len()
	}

	#[inline]
	pub(crate) fn has_space(&self) -> bool {
		self.len() < IC
	}

	/// Index of the edge to follow for `key`: the number of separators
	/// `<= key`.
	#[inline]
	pub(crate) fn child_pos<Q>(&self, key: &Q) -> usize
	where
		K: Borrow<Q>,
		Q: ?Sized + Ord,
	{
		let mut lower = 0;
		let mut upper = self.keys.len();

		while lower < upper {
			let mid = ((upper - lower) / 2) + lower;
			let Some(mid_key) = self.keys.get(mid) else {
				return lower;
			};

			if key < mid_key.borrow() {
				upper = mid;
			} else {
				lower = mid + 1;
			}
		}

		lower
	}

	/// Returns the edge at `pos`; `pos == len` is the upper edge.
	///
	/// Torn reads surface as [`error::Error::Unwind`].
	#[inline]
	pub(crate) fn edge_at(&self, pos: usize) -> error::Result<&Edge<K, V, IC, LC>> {
		if pos == self.keys.len() {
			self.upper_edge.as_ref().ok_or(error::Error::Unwind)
		} else {
			self.edges.get(pos).ok_or(error::Error::Unwind)
		}
	}
}

impl<K: Clone + Ord, V, const IC: usize, const LC: usize> InternalNode<K, V, IC, LC> {
	/// Installs `separator` with `right` as the child immediately after the
	/// child that currently owns `separator`.
	///
	/// ```text
	/// before: keys=[A, B]        edges=[e0, e1]        upper=e2
	///         e1 split at S, right half R
	/// after:  keys=[A, S, B]     edges=[e0, e1, R]     upper=e2
	/// ```
	pub(crate) fn insert_separator(&mut self, separator: K, right: Edge<K, V, IC, LC>) {
		debug_assert!(self.has_space());
		let pos = self.child_pos(&separator);
		if pos == self.keys.len() {
			let left = self
				.upper_edge
				.replace(right)
				.expect("internal node without an upper edge");
			self.keys.push(separator);
			self.edges.push(left);
		} else {
			self.keys.insert(pos, separator);
			self.edges.insert(pos + 1, right);
		}
	}

	/// Moves the upper half into a new right sibling and returns the
	/// separator that moves up to the parent.
	///
	/// ```text
	/// before: keys=[K0 K1 K2 K3 K4]  edges=[E0 E1 E2 E3 E4]  upper=E5
	/// after:  left  keys=[K0 K1]  edges=[E0 E1]  upper=E2  high=K2
	///         right keys=[K3 K4]  edges=[E3 E4]  upper=E5  high=old
	///         K2 goes up
	/// ```
	pub(crate) fn split(&mut self) -> (K, InternalNode<K, V, IC, LC>) {
		let mid = self.keys.len() / 2;

		let mut right = InternalNode::new(self.level);
		right.keys.extend(self.keys.drain(mid + 1..));
		right.edges.extend(self.edges.drain(mid + 1..));
		right.upper_edge = self.upper_edge.take();

		self.upper_edge = self.edges.pop();
		let separator = self.keys.pop().expect("split of an internal node without keys");

		right.high_key = self.high_key.replace(separator.clone());
		right.sibling = self.sibling.clone();
		(separator, right)
	}
}
