use std::sync::atomic::{AtomicI64, Ordering};

use crate::data::TXG_MASK;

/// Handle onto one open transaction group.
///
/// The txg engine proper lives outside this crate; a `Tx` carries the
/// assigned txg number and the per-transaction space estimate that
/// `willuse_space` accumulates against the quota.
#[derive(Debug)]
pub struct Tx {
	txg:           u64,
	private_ok:    bool,
	space_towrite: AtomicI64,
}

impl Tx {
	pub fn new(txg: u64) -> Self {
		assert!(txg != 0);
		Self {
			txg,
			private_ok: false,
			space_towrite: AtomicI64::new(0),
		}
	}

	/// A transaction that may touch private (bootstrap) objects.
	pub fn private(txg: u64) -> Self {
		Self {
			private_ok: true,
			..Self::new(txg)
		}
	}

	pub fn txg(&self) -> u64 {
		self.txg
	}

	/// Shadow-array slot for this txg.
	pub fn txgoff(&self) -> usize {
		(self.txg & TXG_MASK) as usize
	}

	pub fn private_ok(&self) -> bool {
		self.private_ok
	}

	/// Record a conservative estimate of space this transaction will
	/// write (positive) or free (negative).
	pub fn willuse_space(&self, space: i64) {
		self.space_towrite.fetch_add(space, Ordering::AcqRel);
	}

	pub fn space_towrite(&self) -> i64 {
		self.space_towrite.load(Ordering::Acquire)
	}
}

#[cfg(test)]
mod t {
	use super::*;

	#[test]
	fn txgoff_wraps() {
		assert_eq!(Tx::new(7).txgoff(), 3);
		assert_eq!(Tx::new(8).txgoff(), 0);
	}

	#[test]
	fn space_accumulates() {
		let tx = Tx::new(3);
		tx.willuse_space(4096);
		tx.willuse_space(-512);
		assert_eq!(tx.space_towrite(), 3584);
	}
}
