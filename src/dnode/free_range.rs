use super::*;
use crate::data::{p2nphase, DNODE_SIZE};

/// Zero `[start, start + len)` of a level-0 block's content. For
/// meta-dnode blocks only fully covered images are cleared.
fn zero_block(data: &mut DbufData, start: usize, len: usize) {
	match data {
		DbufData::Bytes(b) => {
			let end = (start + len).min(b.len());
			if start < end {
				b[start..end].fill(0);
			}
		}
		DbufData::Dnodes(slots) => {
			let first = (start + DNODE_SIZE - 1) >> DNODE_SHIFT;
			let last = ((start + len) >> DNODE_SHIFT).min(slots.len());
			for slot in &mut slots[first.min(last)..last] {
				*slot = DnodePhys::zero();
			}
		}
		DbufData::Indirect(_) => unreachable!("partial zero of an indirect block"),
	}
}

impl Dnode {
	/// Delete the content of `[off, off + len)`; a `len` of
	/// `u64::MAX` truncates. Partial head and tail blocks are zeroed
	/// through the buffer cache, the aligned interior is queued on
	/// this txg's free-range set, and the spanning level-1 indirects
	/// are dirtied so the sync pass rewrites them.
	pub fn free_range(self: &Arc<Self>, off: u64, len: u64, tx: &Tx) {
		const FTAG: Tag = Tag::Caller("free_range");

		log::trace!(
			"free_range(obj={}, off={off}, len={len:#x}, txg={});",
			self.object,
			tx.txg()
		);

		let mut geom = self.geom_mut();
		let blksz = self.datablksz() as u64;
		let blkshift = self.datablkshift();
		let epbs = self.indblkshift() as u32 - BLKPTR_SHIFT;
		let mut dirtied = false;

		// past the end of the object: nothing to free
		let objsize = blksz * (geom.maxblkid + 1);
		if off >= objsize {
			return;
		}

		let mut off = off;
		let mut len = len;
		let trunc = len == u64::MAX;
		if trunc {
			len = u64::MAX - off;
		}

		// block align the region to free
		let mut head;
		let start;
		if geom.maxblkid == 0 {
			// single block, possibly not a power of two
			head = if off == 0 { 0 } else { blksz - off };
			start = off;
		} else {
			assert!(blksz.is_power_of_two());
			head = p2nphase(off, blksz);
			start = p2phase(off, blksz);
		}

		// zero out any partial block data at the start of the range
		if head > 0 {
			debug_assert_eq!(start + head, blksz);
			if len < head {
				head = len;
			}
			if let Ok(db) = self.hold_dbuf_impl(0, whichblock(blkshift, off), true, FTAG) {
				// don't dirty it unless it is on disk or dirty
				let mut st = db.state();
				let resident =
					st.dirty.iter().any(|&d| d) || st.blkptr.map_or(false, |bp| !bp.is_hole());
				if resident {
					st.dirty[tx.txgoff()] = true;
					zero_block(&mut st.data, start as usize, head as usize);
					dirtied = true;
				}
				drop(st);
				db.rele(FTAG);
			}
			off += head;
			len -= head;
		}

		// a range inside a single block is fully handled by the head
		if len == 0 {
			if dirtied {
				self.setdirty(tx);
			}
			return;
		}

		// the remaining range starts past the end of the object
		if off > geom.maxblkid << blkshift {
			if dirtied {
				self.setdirty(tx);
			}
			return;
		}

		// zero out any partial block data at the end of the range
		let mut tail = match off.checked_add(len) {
			None | Some(u64::MAX) => 0,
			Some(_) => len % blksz,
		};
		if tail > 0 {
			if len < tail {
				tail = len;
			}
			if let Ok(db) = self.hold_dbuf_impl(0, whichblock(blkshift, off + len), true, FTAG) {
				let mut st = db.state();
				let resident =
					st.dirty.iter().any(|&d| d) || st.blkptr.map_or(false, |bp| !bp.is_hole());
				if resident {
					st.dirty[tx.txgoff()] = true;
					zero_block(&mut st.data, 0, tail as usize);
					dirtied = true;
				}
				drop(st);
				db.rele(FTAG);
			}
			len -= tail;
		}

		// the range did not include a full block
		if len == 0 {
			if dirtied {
				self.setdirty(tx);
			}
			return;
		}

		// dirty the level-1 indirects covering the ends of the
		// interior; the right end does not survive a truncate
		if geom.nlevels > 1 && off != 0 {
			let db = self.hold_dbuf(1, (off - head) >> (blkshift + epbs), FTAG);
			db.mark_dirty(tx);
			db.rele(FTAG);
		}
		if geom.nlevels > 1 && !trunc {
			let db = self.hold_dbuf(1, (off + len + tail - 1) >> (blkshift + epbs), FTAG);
			db.mark_dirty(tx);
			db.rele(FTAG);
		}

		debug_assert!(blkshift == 0 || p2phase(off, blksz) == 0);
		let blkid = off >> blkshift;
		let nblks = len >> blkshift;

		if trunc {
			geom.maxblkid = if blkid != 0 { blkid - 1 } else { 0 };
		}

		// Queue the aligned interior on this txg's range set; the
		// sync pass drains it into actual block frees.
		{
			let mut st = self.state();
			let ranges = &mut st.ranges[tx.txgoff()];
			ranges.clear(blkid, nblks);
			ranges.insert(blkid, nblks);
			log::debug!(
				"free_range(obj={}) queued blkid={blkid} nblks={nblks:#x} txg={}",
				self.object,
				tx.txg()
			);
		}

		// drop cached buffers covering the freed range
		self.evict_dbufs_range(blkid, nblks);

		self.setdirty(tx);
	}

	/// Whether `blkid` was freed in a recent (still open) txg, or the
	/// whole object is being deleted.
	pub fn block_freed(&self, blkid: u64) -> bool {
		if blkid == BONUS_BLKID {
			return false;
		}
		let st = self.state();
		if st.free_txg != 0 {
			return true;
		}
		st.ranges.iter().any(|r| r.contains(blkid))
	}
}

#[cfg(test)]
mod t {
	use super::*;
	use crate::objset::{HoldFlag, Objset};

	const FTAG: Tag = Tag::Caller("test");

	fn file_object(os: &Arc<Objset>, object: u64, blocksize: u32, tx: &Tx) -> Arc<Dnode> {
		let dn = os
			.dnode_hold_impl(object, HoldFlag::MustBeFree, FTAG)
			.unwrap();
		dn.allocate(ObjectType::PlainFile, blocksize, 0, ObjectType::None, 0, tx);
		dn
	}

	#[test]
	fn noop_past_end_of_object() {
		let os = Objset::new();
		let tx = Tx::new(3);
		let dn = file_object(&os, 4, 4096, &tx);

		// maxblkid is 0, so anything at or past one block is a no-op
		dn.free_range(4096, u64::MAX, &tx);
		assert!(dn.state().ranges.iter().all(|r| r.is_empty()));

		os.sync_done(3);
		dn.rele(FTAG);
	}

	#[test]
	fn truncate_is_idempotent() {
		let os = Objset::new();
		let tx = Tx::new(5);
		let dn = file_object(&os, 4, 4096, &tx);
		dn.new_blkid(9, &tx);

		for _ in 0..2 {
			dn.free_range(6 * 4096, u64::MAX, &tx);
			assert_eq!(dn.maxblkid(), 5);
			let st = dn.state();
			let ranges: Vec<_> = st.ranges[tx.txgoff()].iter().collect();
			assert_eq!(ranges.len(), 1);
			assert_eq!(ranges[0].0, 6);
		}

		os.sync_done(5);
		dn.rele(FTAG);
	}

	#[test]
	fn truncate_to_zero_leaves_empty_object() {
		let os = Objset::new();
		let tx = Tx::new(7);
		let dn = file_object(&os, 11, 512, &tx);

		dn.free_range(0, u64::MAX, &tx);
		assert_eq!(dn.maxblkid(), 0);
		assert!(dn.block_freed(0));

		// the sync pass drains the queued range
		os.sync_done(7);
		assert!(dn.state().ranges.iter().all(|r| r.is_empty()));
		dn.rele(FTAG);
	}

	#[test]
	fn head_zeroing_of_dirty_block() {
		let os = Objset::new();
		let tx = Tx::new(2);
		let dn = file_object(&os, 12, 4096, &tx);
		dn.new_blkid(3, &tx);

		// a dirty buffer for block 1, filled with data
		let db = dn.hold_dbuf(0, 1, FTAG);
		db.mark_dirty(&tx);
		{
			let mut st = db.state();
			match &mut st.data {
				DbufData::Bytes(b) => b.fill(0xaa),
				_ => unreachable!(),
			}
		}

		// free from the middle of block 1 onward
		dn.free_range(4096 + 100, u64::MAX, &tx);

		let st = db.state();
		match &st.data {
			DbufData::Bytes(b) => {
				assert!(b[..100].iter().all(|&x| x == 0xaa));
				assert!(b[100..].iter().all(|&x| x == 0));
			}
			_ => unreachable!(),
		}
		assert_eq!(dn.maxblkid(), 1);

		drop(st);
		db.rele(FTAG);
		os.sync_done(2);
		dn.rele(FTAG);
	}

	#[test]
	fn block_freed_polarity() {
		let os = Objset::new();
		let tx = Tx::new(4);
		let dn = file_object(&os, 13, 4096, &tx);
		dn.new_blkid(9, &tx);

		dn.free_range(4 * 4096, 2 * 4096, &tx);
		assert!(!dn.block_freed(3));
		assert!(dn.block_freed(4));
		assert!(dn.block_freed(5));
		assert!(!dn.block_freed(6));
		assert!(!dn.block_freed(BONUS_BLKID));

		os.sync_done(4);
		dn.rele(FTAG);
	}
}
