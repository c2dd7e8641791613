use std::{io::Result as IoResult, sync::atomic::Ordering};

use super::*;
use crate::data::{p2roundup, CHECKSUM_INHERIT, COMPRESS_INHERIT, PRIVATE_OBJECT};

impl Dnode {
	/// Turn a free slot into an object of type `ot`.
	///
	/// The caller owns the only hold and the slot's image is still
	/// zero. A zero `blocksize` or `ibs` picks the configured
	/// default; both are clamped into their legal ranges.
	pub fn allocate(
		self: &Arc<Self>,
		ot: ObjectType,
		blocksize: u32,
		ibs: u32,
		bonustype: ObjectType,
		bonuslen: u16,
		tx: &Tx,
	) {
		let blocksize = if blocksize == 0 {
			1 << default_blockshift()
		} else {
			blocksize
		}
		.clamp(MIN_BLOCKSIZE, MAX_BLOCKSIZE);
		let ibs = if ibs == 0 { default_indblkshift() } else { ibs }
			.clamp(MIN_INDBLKSHIFT, MAX_INDBLKSHIFT);

		log::debug!(
			"allocate(obj={}, txg={}, blocksize={blocksize}, ibs={ibs})",
			self.object,
			tx.txg()
		);

		assert!(ot != ObjectType::None);
		assert_eq!(bonustype == ObjectType::None, bonuslen == 0);
		assert!((bonuslen as usize) <= MAX_BONUSLEN);
		assert!(self.with_phys(|p| p.is_zero()));
		assert_eq!(self.allocated_txg(), 0);
		assert!(self.tx_holds.is_zero());
		assert!(self.holds.count() <= 1);
		assert!(self.dbufs.lock().unwrap().is_empty());

		{
			let geom = self.geom();
			assert_eq!(geom.maxblkid, 0);
			for i in 0..TXG_SIZE {
				assert_eq!(geom.next_nlevels[i], 0);
				assert_eq!(geom.next_indblkshift[i], 0);
				assert_eq!(self.dirtyblksz[i].load(Ordering::Acquire), 0);
			}
		}
		{
			let st = self.state();
			assert_eq!(st.kind, ObjectType::None);
			for r in &st.ranges {
				assert!(r.is_empty());
			}
		}

		{
			let mut geom = self.geom_mut();
			self.setdblksz(blocksize);
			self.set_indblkshift(ibs);
			geom.nlevels = 1;
		}
		{
			let mut st = self.state();
			st.kind = ot;
			st.nblkptr = (1 + ((MAX_BONUSLEN - bonuslen as usize) >> BLKPTR_SHIFT)) as u8;
			st.bonustype = bonustype as u8;
			st.bonuslen = bonuslen;
			st.checksum = CHECKSUM_INHERIT;
			st.compress = COMPRESS_INHERIT;
			st.free_txg = 0;
		}

		self.allocated_txg.store(tx.txg(), Ordering::Release);
		self.setdirty(tx);
	}

	/// Change an allocated object's type and geometry while keeping
	/// its identity. Any change to the block size or bonus layout
	/// first frees the whole address space.
	pub fn reallocate(
		self: &Arc<Self>,
		ot: ObjectType,
		blocksize: u32,
		bonustype: ObjectType,
		bonuslen: u16,
		tx: &Tx,
	) {
		log::debug!(
			"reallocate(obj={}, txg={}, blocksize={blocksize})",
			self.object,
			tx.txg()
		);

		assert!((MIN_BLOCKSIZE..=MAX_BLOCKSIZE).contains(&blocksize));
		assert_eq!(blocksize % MIN_BLOCKSIZE, 0);
		assert!(self.dbufs.lock().unwrap().is_empty());
		assert!(self.object & PRIVATE_OBJECT == 0 || tx.private_ok());
		assert_eq!(bonustype == ObjectType::None, bonuslen == 0);
		assert!((bonuslen as usize) <= MAX_BONUSLEN);
		for i in 0..TXG_SIZE {
			assert_eq!(self.dirtyblksz[i].load(Ordering::Acquire), 0);
		}

		let (old_bonustype, old_bonuslen) = {
			let st = self.state();
			(st.bonustype, st.bonuslen)
		};
		if blocksize != self.datablksz()
			|| old_bonustype != bonustype as u8
			|| old_bonuslen != bonuslen
		{
			// free all old data
			self.free_range(0, u64::MAX, tx);
		}

		// change blocksize
		{
			let _geom = self.geom_mut();
			self.setdblksz(blocksize);
			self.setdirty(tx);
			// the dnode is dirty now, so the slot is ours to overwrite
			assert!(self.dirtyblksz[tx.txgoff()].load(Ordering::Acquire) != 0);
			self.dirtyblksz[tx.txgoff()].store(blocksize, Ordering::Release);
		}

		// change bonus size; a zero-length bonus is widened to one
		// byte so the buffer cache always holds a bonus buffer
		let mut bonuslen = bonuslen;
		let db = if old_bonuslen != bonuslen {
			if bonuslen == 0 {
				bonuslen = 1;
			}
			let db = self.hold_bonus(Tag::Caller("reallocate"));
			db.resize(bonuslen as usize, tx);
			Some(db)
		} else {
			None
		};

		// change bonus type and the block pointers it displaces
		{
			let mut st = self.state();
			st.kind = ot;
			st.bonustype = bonustype as u8;
			st.bonuslen = bonuslen;
			st.nblkptr = (1 + ((MAX_BONUSLEN - bonuslen as usize) >> BLKPTR_SHIFT)) as u8;
			st.checksum = CHECKSUM_INHERIT;
			st.compress = COMPRESS_INHERIT;
			assert!(st.nblkptr as usize <= MAX_NBLKPTR);
		}
		self.allocated_txg.store(tx.txg(), Ordering::Release);

		if let Some(db) = db {
			db.rele(Tag::Caller("reallocate"));
		}
	}

	/// Queue this object for deletion in `tx`'s txg. A no-op on free
	/// or already-freeing objects.
	pub fn free(self: &Arc<Self>, tx: &Tx) {
		log::debug!("free(obj={}, txg={})", self.object, tx.txg());

		{
			let mut st = self.state();
			if st.kind == ObjectType::None || st.free_txg != 0 {
				return;
			}
			st.free_txg = tx.txg();
		}

		// If the dnode is already dirty, it moves from the dirty list
		// to the free list; otherwise setdirty routes it there.
		let os = self.objset();
		let off = tx.txgoff();
		let moved = {
			let mut lists = os.lists();
			if self.dirtyblksz[off].load(Ordering::Acquire) > 0 {
				if let Some(pos) = lists.dirty[off].iter().position(|d| Arc::ptr_eq(d, self)) {
					let dn = lists.dirty[off].remove(pos);
					lists.freed[off].push(dn);
				}
				true
			} else {
				false
			}
		};
		if !moved {
			self.setdirty(tx);
		}
	}

	/// Try to change the data block size and indirect shift. Only
	/// legal while nothing is allocated or cached beyond the first
	/// block; shrinking below the first block's live size is refused.
	pub fn set_blksz(self: &Arc<Self>, size: u32, ibs: u32, tx: &Tx) -> IoResult<()> {
		const FTAG: Tag = Tag::Caller("set_blksz");

		log::trace!("set_blksz(obj={}, {size}, {ibs});", self.object);

		let size = if size == 0 {
			MIN_BLOCKSIZE
		} else if size > MAX_BLOCKSIZE {
			MAX_BLOCKSIZE
		} else {
			p2roundup(size as u64, MIN_BLOCKSIZE as u64) as u32
		};
		let ibs = if ibs == 0 {
			self.indblkshift() as u32
		} else {
			ibs
		};

		if size >> MIN_BLOCKSHIFT == self.datablkszsec() as u32 && ibs == self.indblkshift() as u32
		{
			return Ok(());
		}

		let mut geom = self.geom_mut();
		let off = tx.txgoff();

		// no allocated blocks beyond the first
		if self.with_phys(|p| p.maxblkid) != 0 {
			return Err(err!(ENOTSUP));
		}

		// Buffers for blocks beyond the first would be the wrong
		// size; with the structural lock held in write mode nothing
		// can be added behind our back.
		let mut have_db0 = false;
		for (&(_, blkid), _) in self.dbufs.lock().unwrap().iter() {
			if blkid == 0 {
				have_db0 = true;
			} else if blkid != BONUS_BLKID {
				return Err(err!(ENOTSUP));
			}
		}

		// fast-track if there is no data in the file
		let bp0_hole = self.with_phys(|p| p.nblkptr == 0 || p.blkptr(0).is_hole());
		if bp0_hole && !have_db0 {
			self.setdblksz(size);
			self.set_indblkshift(ibs);
			self.setdirty(tx);
			self.dirtyblksz[off].store(size, Ordering::Release);
			geom.next_indblkshift[off] = ibs as u8;
			return Ok(());
		}

		// obtain the old block
		let db = self.hold_dbuf(0, 0, FTAG);

		// not allowed to decrease the size if there is data present
		if (size as usize) < db.size() {
			db.rele(FTAG);
			return Err(err!(ENOTSUP));
		}

		db.resize(size as usize, tx);
		self.setdblksz(size);
		self.set_indblkshift(ibs);
		self.setdirty(tx);
		self.dirtyblksz[off].store(size, Ordering::Release);
		geom.next_indblkshift[off] = ibs as u8;
		db.rele(FTAG);

		Ok(())
	}

	/// Note that `blkid` is about to be written: raise `maxblkid`,
	/// publish the tree height this txg needs, and materialize the
	/// new root layer when the height grows.
	pub fn new_blkid(self: &Arc<Self>, blkid: u64, tx: &Tx) {
		if blkid == BONUS_BLKID {
			return;
		}
		let mut geom = self.geom_mut();
		self.new_blkid_locked(&mut geom, blkid, tx);
	}

	pub(crate) fn new_blkid_locked(self: &Arc<Self>, geom: &mut Geometry, blkid: u64, tx: &Tx) {
		const FTAG: Tag = Tag::Caller("new_blkid");

		let off = tx.txgoff();

		if blkid > geom.maxblkid {
			geom.maxblkid = blkid;
		}

		// Compute the number of levels necessary to support the new
		// blkid: each extra level multiplies the reach of the root
		// pointers by the entries per indirect block.
		let nblkptr = self.state().nblkptr;
		let epbs = self.indblkshift() as u32 - BLKPTR_SHIFT;
		let mut new_nlevels: u8 = 1;
		let mut reach = nblkptr as u128;
		while reach <= blkid as u128 {
			new_nlevels += 1;
			reach <<= epbs;
		}
		let old_nlevels = geom.nlevels;

		if new_nlevels > geom.next_nlevels[off] {
			geom.next_nlevels[off] = new_nlevels;
		}

		if new_nlevels > old_nlevels {
			log::debug!(
				"dnode {} increasing nlevels from {old_nlevels} to {new_nlevels}",
				self.object
			);
			geom.nlevels = new_nlevels;

			// Dirty the leftmost indirect at the old top so the new
			// root layer is written out over it.
			let db = self.hold_dbuf(old_nlevels, 0, FTAG);
			db.mark_dirty(tx);
			db.rele(FTAG);
		}
	}
}
