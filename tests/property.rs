//! # Property-Based Tests for blinktree
//!
//! Randomized tests driven by proptest. Each property runs the tree next to a
//! `BTreeMap` oracle, with small node capacities so that even short inputs
//! split nodes at several levels.
//!
//! ## Test Properties
//!
//! - Insert-then-lookup: every inserted key is retrievable
//! - Overwrite: insert returns the previous value exactly like `BTreeMap`
//! - Ordering: iteration and range lookups always yield ascending keys
//! - Range lookup: results match the oracle's range, bounded by `count`
//! - Layout independence: sorted and hashed leaves agree on every answer
//! - Structure: `sanity_check` passes after any insert sequence

use blinktree::{GenericTree, LeafLayout};
use proptest::prelude::*;
use std::collections::BTreeMap;

type Small = GenericTree<i32, i32, 4, 4>;

// ===========================================================================
// Strategy Helpers
// ===========================================================================

/// Generate a vector of unique keys for testing
fn unique_keys(max_len: usize) -> impl Strategy<Value = Vec<i32>> {
	prop::collection::hash_set(any::<i32>(), 0..max_len).prop_map(|s| s.into_iter().collect())
}

/// Generate key-value pairs drawn from a narrow key space, so that
/// overwrites are common
fn key_value_pairs(max_len: usize) -> impl Strategy<Value = Vec<(i32, i32)>> {
	prop::collection::vec((-500..500i32, any::<i32>()), 0..max_len)
}

fn layout() -> impl Strategy<Value = LeafLayout> {
	prop_oneof![Just(LeafLayout::Sorted), Just(LeafLayout::Hashed)]
}

/// Operations that can be performed on the tree
#[derive(Debug, Clone)]
enum Op {
	Insert(i32, i32),
	Lookup(i32),
	RangeLookup(i32, usize),
}

/// Generate a sequence of random operations
fn operations(max_ops: usize) -> impl Strategy<Value = Vec<Op>> {
	prop::collection::vec(
		prop_oneof![
			4 => (-1000..1000i32, any::<i32>()).prop_map(|(k, v)| Op::Insert(k, v)),
			2 => (-1000..1000i32).prop_map(Op::Lookup),
			1 => (-1000..1000i32, 0..40usize).prop_map(|(k, n)| Op::RangeLookup(k, n)),
		],
		0..max_ops,
	)
}

fn oracle_range(oracle: &BTreeMap<i32, i32>, start: i32, count: usize) -> Vec<(i32, i32)> {
	oracle.range(start..).take(count).map(|(k, v)| (*k, *v)).collect()
}

// ===========================================================================
// Insert-Then-Lookup Property
// ===========================================================================

proptest! {
	/// Property: after inserting unique keys, every one of them is found
	#[test]
	fn insert_then_lookup(keys in unique_keys(500), layout in layout()) {
		let tree = Small::with_layout(layout);
		for &k in &keys {
			prop_assert_eq!(tree.insert(k, k.wrapping_mul(3)), None);
		}

		for &k in &keys {
			prop_assert_eq!(tree.get(&k), Some(k.wrapping_mul(3)));
		}
		prop_assert_eq!(tree.len(), keys.len());
		tree.sanity_check();
	}

	/// Property: insert returns the value it replaced, like BTreeMap::insert
	#[test]
	fn overwrite_returns_previous(pairs in key_value_pairs(600), layout in layout()) {
		let tree = Small::with_layout(layout);
		let mut oracle = BTreeMap::new();

		for (k, v) in pairs {
			prop_assert_eq!(tree.insert(k, v), oracle.insert(k, v));
		}

		prop_assert_eq!(tree.len(), oracle.len());
		for (k, v) in &oracle {
			prop_assert_eq!(tree.get(k), Some(*v));
		}
		tree.sanity_check();
	}
}

// ===========================================================================
// Ordering Properties
// ===========================================================================

proptest! {
	/// Property: iteration yields exactly the oracle's entries, in order
	#[test]
	fn iteration_matches_oracle(pairs in key_value_pairs(600), layout in layout()) {
		let tree = Small::with_layout(layout);
		let mut oracle = BTreeMap::new();
		for (k, v) in pairs {
			tree.insert(k, v);
			oracle.insert(k, v);
		}

		let walked: Vec<(i32, i32)> = tree.iter().collect();
		let expected: Vec<(i32, i32)> = oracle.into_iter().collect();
		prop_assert_eq!(walked, expected);
	}

	/// Property: range_lookup returns the first `count` entries at or after
	/// `start`, ascending
	#[test]
	fn range_lookup_matches_oracle(
		keys in unique_keys(400),
		start in any::<i32>(),
		count in 0..80usize,
		layout in layout(),
	) {
		let tree = Small::with_layout(layout);
		let mut oracle = BTreeMap::new();
		for &k in &keys {
			tree.insert(k, !k);
			oracle.insert(k, !k);
		}

		let mut out = vec![(0, 0); 3];
		let written = tree.range_lookup(&start, count, &mut out);
		prop_assert_eq!(written, out.len());
		prop_assert!(written <= count);
		prop_assert_eq!(out, oracle_range(&oracle, start, count));
	}

	/// Property: iter_from agrees with the oracle's unbounded range
	#[test]
	fn iter_from_matches_oracle(keys in unique_keys(300), start in any::<i32>()) {
		let tree = Small::new();
		for &k in &keys {
			tree.insert(k, k);
		}

		let mut expected: Vec<i32> = keys.iter().copied().filter(|k| *k >= start).collect();
		expected.sort_unstable();
		let walked: Vec<i32> = tree.iter_from(&start).map(|(k, _)| k).collect();
		prop_assert_eq!(walked, expected);
	}
}

// ===========================================================================
// Oracle Comparison
// ===========================================================================

proptest! {
	#![proptest_config(ProptestConfig::with_cases(64))]

	/// Property: any mix of operations behaves like BTreeMap, for both leaf
	/// layouts at once
	#[test]
	fn mixed_operations_match_oracle(ops in operations(800)) {
		let sorted = Small::with_layout(LeafLayout::Sorted);
		let hashed = Small::with_layout(LeafLayout::Hashed);
		let mut oracle = BTreeMap::new();
		let mut out = Vec::new();

		for op in ops {
			match op {
				Op::Insert(k, v) => {
					let expected = oracle.insert(k, v);
					prop_assert_eq!(sorted.insert(k, v), expected);
					prop_assert_eq!(hashed.insert(k, v), expected);
				}
				Op::Lookup(k) => {
					let expected = oracle.get(&k).copied();
					prop_assert_eq!(sorted.get(&k), expected);
					prop_assert_eq!(hashed.get(&k), expected);
				}
				Op::RangeLookup(k, n) => {
					let expected = oracle_range(&oracle, k, n);
					sorted.range_lookup(&k, n, &mut out);
					prop_assert_eq!(&out, &expected);
					hashed.range_lookup(&k, n, &mut out);
					prop_assert_eq!(&out, &expected);
				}
			}
		}

		sorted.sanity_check();
		hashed.sanity_check();
		prop_assert_eq!(sorted.len(), oracle.len());
		prop_assert_eq!(hashed.len(), oracle.len());
	}

	/// Property: utilization stays within [1/LC, 1] once the tree has a key
	#[test]
	fn utilization_is_bounded(keys in unique_keys(500)) {
		prop_assume!(!keys.is_empty());
		let tree = Small::new();
		for &k in &keys {
			tree.insert(k, k);
		}

		let u = tree.utilization();
		prop_assert!((0.25..=1.0).contains(&u), "utilization {}", u);
	}
}
