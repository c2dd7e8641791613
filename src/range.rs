use std::collections::BTreeMap;

/// Ordered set of half-open `[blkid, blkid + nblks)` intervals
/// recording blocks queued for freeing in one txg.
///
/// Intervals are disjoint, non-adjacent and strictly increasing by
/// start block. Callers clear a range before inserting it, so inserts
/// never overlap; inserts that touch an existing neighbour are
/// coalesced to keep the set non-adjacent.
#[derive(Debug, Default)]
pub struct RangeSet {
	map: BTreeMap<u64, u64>,
}

impl RangeSet {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn is_empty(&self) -> bool {
		self.map.is_empty()
	}

	pub fn len(&self) -> usize {
		self.map.len()
	}

	pub fn iter(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
		self.map.iter().map(|(&b, &n)| (b, n))
	}

	/// Insert `[blkid, blkid + nblks)`. No existing interval may start
	/// at `blkid` or overlap the inserted range.
	pub fn insert(&mut self, blkid: u64, nblks: u64) {
		assert!(nblks > 0);
		assert!(!self.map.contains_key(&blkid));
		debug_assert!(self.find(blkid).is_none());
		debug_assert!(blkid.checked_add(nblks).is_some());

		let mut blkid = blkid;
		let mut nblks = nblks;

		// coalesce with a predecessor ending exactly at blkid
		let prev = self.map.range(..blkid).next_back().map(|(&b, &n)| (b, n));
		if let Some((pb, pn)) = prev {
			debug_assert!(pb + pn <= blkid);
			if pb + pn == blkid {
				self.map.remove(&pb);
				blkid = pb;
				nblks += pn;
			}
		}

		// coalesce with a successor starting exactly at the end
		if let Some(sn) = self.map.remove(&(blkid + nblks)) {
			nblks += sn;
		}

		self.map.insert(blkid, nblks);
	}

	/// Locate the interval containing `blkid`.
	pub fn find(&self, blkid: u64) -> Option<(u64, u64)> {
		let (&b, &n) = self.map.range(..=blkid).next_back()?;
		(blkid < b + n).then_some((b, n))
	}

	pub fn contains(&self, blkid: u64) -> bool {
		self.find(blkid).is_some()
	}

	/// Remove `[blkid, blkid + nblks)` from every overlapping
	/// interval: full cover deletes, an end overlap shrinks, an
	/// interior overlap splits the interval in two.
	pub fn clear(&mut self, blkid: u64, nblks: u64) {
		assert!(nblks <= u64::MAX - blkid);
		let endblk = blkid + nblks;

		// every interval starting before endblk and ending past blkid
		let overlapping: Vec<(u64, u64)> = self
			.map
			.range(..endblk)
			.map(|(&b, &n)| (b, n))
			.filter(|&(b, n)| b + n > blkid)
			.collect();

		for (b, n) in overlapping {
			let end = b + n;
			if blkid <= b && endblk >= end {
				// clear this entire range
				self.map.remove(&b);
			} else if blkid <= b {
				// clear the beginning of this range
				self.map.remove(&b);
				self.map.insert(endblk, end - endblk);
			} else if endblk >= end {
				// clear the end of this range
				self.map.insert(b, blkid - b);
			} else {
				// clear a chunk out of this range
				self.map.insert(b, blkid - b);
				self.map.insert(endblk, end - endblk);
			}
		}
	}
}

#[cfg(test)]
mod t {
	use rstest::rstest;

	use super::*;

	fn set(ranges: &[(u64, u64)]) -> RangeSet {
		let mut s = RangeSet::new();
		for &(b, n) in ranges {
			s.insert(b, n);
		}
		s
	}

	fn contents(s: &RangeSet) -> Vec<(u64, u64)> {
		s.iter().collect()
	}

	#[test]
	fn find_edges() {
		let s = set(&[(100, 50)]);
		assert_eq!(s.find(99), None);
		assert_eq!(s.find(100), Some((100, 50)));
		assert_eq!(s.find(149), Some((100, 50)));
		assert_eq!(s.find(150), None);
	}

	#[rstest]
	#[case::full_cover(&[(100, 50)], (90, 70), &[])]
	#[case::exact(&[(100, 50)], (100, 50), &[])]
	#[case::left_overlap(&[(100, 50)], (90, 30), &[(120, 30)])]
	#[case::right_overlap(&[(100, 50)], (140, 30), &[(100, 40)])]
	#[case::interior_split(&[(100, 50)], (120, 10), &[(100, 20), (130, 20)])]
	#[case::no_overlap(&[(100, 50)], (200, 10), &[(100, 50)])]
	#[case::multiple(&[(10, 10), (30, 10), (50, 10)], (15, 40), &[(10, 5), (55, 5)])]
	fn clear(
		#[case] before: &[(u64, u64)],
		#[case] remove: (u64, u64),
		#[case] after: &[(u64, u64)],
	) {
		let mut s = set(before);
		s.clear(remove.0, remove.1);
		assert_eq!(contents(&s), after);
	}

	#[test]
	fn insert_coalesces() {
		let mut s = set(&[(0, 10), (20, 10)]);
		s.insert(10, 10);
		assert_eq!(contents(&s), &[(0, 30)]);
	}

	#[test]
	fn clear_then_insert_is_idempotent() {
		// freeing the same range twice leaves a single interval
		let mut s = RangeSet::new();
		for _ in 0..2 {
			s.clear(6, 100);
			s.insert(6, 100);
		}
		assert_eq!(contents(&s), &[(6, 100)]);
	}

	#[test]
	#[should_panic]
	fn double_insert_panics() {
		let mut s = set(&[(5, 5)]);
		s.insert(5, 1);
	}
}
