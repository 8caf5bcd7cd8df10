//! Ordered iteration over a `GenericTree`.
//!
//! [`Iter`] copies entries out of the leaf level in batches of one leaf's
//! worth and remembers the last key it handed out. Nothing is latched or
//! pinned between batches, so an iterator can be held across arbitrary
//! concurrent activity; every refill resumes strictly after the last key
//! returned, which keeps the output ascending and duplicate-free.

use std::hash::Hash;
use std::ops::Bound;

use crate::GenericTree;

/// Where the next batch starts.
#[derive(Debug, PartialEq, Clone)]
enum Anchor<K> {
	Start(Bound<K>),
	After(K),
	End,
}

/// Ascending iterator over `(key, value)` clones.
///
/// Created by [`GenericTree::iter`] and [`GenericTree::iter_from`].
pub struct Iter<'t, K, V, const IC: usize, const LC: usize> {
	tree: &'t GenericTree<K, V, IC, LC>,
	anchor: Anchor<K>,
	batch: std::vec::IntoIter<(K, V)>,
}

impl<'t, K: Clone + Ord + Hash, V: Clone, const IC: usize, const LC: usize> Iter<'t, K, V, IC, LC> {
	pub(crate) fn new(tree: &'t GenericTree<K, V, IC, LC>, start: Bound<K>) -> Self {
		Iter {
			tree,
			anchor: Anchor::Start(start),
			batch: Vec::new().into_iter(),
		}
	}

	fn refill(&mut self) {
		let mut batch = Vec::with_capacity(LC);
		let found = match &self.anchor {
			Anchor::Start(bound) => self.tree.scan(bound.as_ref(), LC, &mut batch),
			Anchor::After(key) => self.tree.scan(Bound::Excluded(key), LC, &mut batch),
			Anchor::End => return,
		};

		// A short batch means the scan ran off the end of the leaf level.
		self.anchor = match batch.last() {
			Some((key, _)) if found == LC => Anchor::After(key.clone()),
			_ => Anchor::End,
		};
		self.batch = batch.into_iter();
	}
}

impl<'t, K: Clone + Ord + Hash, V: Clone, const IC: usize, const LC: usize> Iterator for Iter<'t, K, V, IC, LC> {
	type Item = (K, V);

	fn next(&mut self) -> Option<Self::Item> {
		if let Some(entry) = self.batch.next() {
			return Some(entry);
		}
		self.refill();
		self.batch.next()
	}
}
