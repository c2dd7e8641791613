use std::io::Result as IoResult;

use super::*;

/// Step through a block-pointer array looking for an entry whose fill
/// count falls inside `[minfill, maxfill]`, advancing `offset` by one
/// `span` stride per miss.
fn scan_fill(
	bps: &[BlockPtr],
	count: u64,
	offset: &mut u64,
	span: u32,
	epbs: u32,
	minfill: u64,
	maxfill: u64,
) -> IoResult<()> {
	let mut i = ((*offset >> span) & ((1u64 << epbs) - 1)) as usize;
	while (i as u64) < count {
		let fill = bps[i].fill;
		if fill >= minfill && fill <= maxfill {
			return Ok(());
		}
		*offset += 1u64 << span;
		i += 1;
	}
	Err(err!(ESRCH))
}

impl Dnode {
	/// Find the next hole or data span at or after `*offset`.
	///
	/// `blkfill` is the expected number of items per level-0 block: 1
	/// for file data, the dnodes-per-block count when walking a
	/// meta-dnode, and a fraction of it when hunting for
	/// partially-empty meta-dnode indirects.
	pub fn next_offset(
		&self,
		hole: bool,
		offset: &mut u64,
		minlvl: u32,
		blkfill: u64,
	) -> IoResult<()> {
		log::trace!(
			"next_offset(obj={}, hole={hole}, off={:#x}, minlvl={minlvl}, blkfill={blkfill});",
			self.object,
			*offset
		);

		let initial = *offset;
		let _struct = self.geom();

		let maxlvl = self.with_phys(|p| p.nlevels as u32);
		if maxlvl == 0 {
			return Err(err!(ESRCH));
		}

		let datablkshift = self.datablkshift();
		if datablkshift == 0 {
			// a single embedded block: the only hole is past its end
			if *offset < self.datablksz() as u64 {
				if hole {
					*offset = self.datablksz() as u64;
				}
				return Ok(());
			}
			return Err(err!(ESRCH));
		}

		// Ascend until some level matches, then descend refining the
		// offset at each level below it.
		let mut error: IoResult<()> = Ok(());
		let mut lvl = minlvl;
		while lvl <= maxlvl {
			error = self.next_offset_level(hole, offset, lvl, blkfill, datablkshift);
			if error.is_ok() {
				break;
			}
			lvl += 1;
		}
		while lvl > minlvl && error.is_ok() {
			lvl -= 1;
			error = self.next_offset_level(hole, offset, lvl, blkfill, datablkshift);
		}

		if initial > *offset {
			// wrapped past the end
			return Err(err!(ESRCH));
		}
		error
	}

	fn next_offset_level(
		&self,
		hole: bool,
		offset: &mut u64,
		lvl: u32,
		blkfill: u64,
		datablkshift: u32,
	) -> IoResult<()> {
		const FTAG: Tag = Tag::Caller("next_offset");

		let (p_nlevels, p_nblkptr, p_indblkshift) =
			self.with_phys(|p| (p.nlevels as u32, p.nblkptr as u64, p.indblkshift as u32));
		let epbs = p_indblkshift - BLKPTR_SHIFT;

		log::trace!(
			"probing object {} offset {:#x} level {lvl} of {p_nlevels}",
			self.object,
			*offset
		);

		let fill_window = |lvl: u32| {
			let mut minfill = 0u64;
			let mut maxfill = blkfill << ((lvl - 1) * epbs);
			if hole {
				maxfill -= 1;
			} else {
				minfill += 1;
			}
			(minfill, maxfill)
		};

		if lvl == p_nlevels {
			// the embedded root pointers
			let bps = self.with_phys(|p| {
				(0..p.nblkptr as usize).map(|i| p.blkptr(i)).collect::<Vec<_>>()
			});
			let span = (lvl - 1) * epbs + datablkshift;
			let (minfill, maxfill) = fill_window(lvl);
			return scan_fill(&bps, p_nblkptr, offset, span, epbs, minfill, maxfill);
		}

		let blkid = whichblock(datablkshift, *offset) >> (epbs * lvl);
		let db = match self.hold_dbuf_impl(lvl as u8, blkid, true, FTAG) {
			Ok(db) => db,
			Err(e) if e.raw_os_error() == Some(libc::ENOENT) => {
				// a missing block is one big hole
				return if hole { Ok(()) } else { Err(err!(ESRCH)) };
			}
			Err(e) => return Err(e),
		};

		let result = {
			let st = db.state();
			match &st.data {
				DbufData::Dnodes(slots) => {
					// Level-0 walk of a meta-dnode block: step through
					// the images in dnode-sized strides until one
					// matches the requested polarity.
					debug_assert!(self.is_meta());
					let span = DNODE_SHIFT;
					let mut i = ((*offset >> span) & (blkfill - 1)) as usize;
					let mut found = false;
					while (i as u64) < blkfill {
						let free = slots.get(i).map_or(true, |s| s.is_free());
						if free == hole {
							found = true;
							break;
						}
						*offset += 1u64 << span;
						i += 1;
					}
					if found {
						Ok(())
					} else {
						Err(err!(ESRCH))
					}
				}
				DbufData::Indirect(bps) => {
					let span = (lvl - 1) * epbs + datablkshift;
					let (minfill, maxfill) = fill_window(lvl);
					scan_fill(bps, bps.len() as u64, offset, span, epbs, minfill, maxfill)
				}
				DbufData::Bytes(_) => {
					unreachable!("level-0 scan of a non-meta object")
				}
			}
		};
		db.rele(FTAG);
		result
	}
}

#[cfg(test)]
mod t {
	use super::*;
	use crate::objset::{HoldFlag, Objset};

	const FTAG: Tag = Tag::Caller("test");

	/// An object with two levels of indirection and a lone data block
	/// at blkid 3: root -> one L1 indirect -> data.
	fn sparse_object(os: &Arc<Objset>) -> Arc<Dnode> {
		let tx = Tx::new(4);
		let dn = os.dnode_hold_impl(21, HoldFlag::MustBeFree, FTAG).unwrap();
		dn.allocate(ObjectType::PlainFile, 4096, 10, ObjectType::None, 0, &tx);
		os.sync_done(4);

		dn.with_phys_mut(|p| {
			p.kind = ObjectType::PlainFile as u8;
			p.indblkshift = 10;
			p.nlevels = 2;
			p.nblkptr = MAX_NBLKPTR as u8;
			p.datablkszsec = 8;
			p.maxblkid = 3;
			p.set_blkptr(0, BlockPtr { addr: 1, fill: 1 });
		});

		let l1 = dn.hold_dbuf(1, 0, FTAG);
		{
			let mut st = l1.state();
			match &mut st.data {
				DbufData::Indirect(bps) => bps[3] = BlockPtr { addr: 2, fill: 1 },
				_ => unreachable!(),
			}
		}
		l1.rele(FTAG);

		dn
	}

	#[test]
	fn hole_at_start() {
		let os = Objset::new();
		let dn = sparse_object(&os);
		let mut offset = 0;
		dn.next_offset(true, &mut offset, 1, 1).unwrap();
		assert_eq!(offset, 0);
		dn.rele(FTAG);
	}

	#[test]
	fn data_at_blkid_3() {
		let os = Objset::new();
		let dn = sparse_object(&os);
		let mut offset = 0;
		dn.next_offset(false, &mut offset, 1, 1).unwrap();
		assert_eq!(offset, 3 * 4096);
		dn.rele(FTAG);
	}

	#[test]
	fn hole_after_data() {
		let os = Objset::new();
		let dn = sparse_object(&os);
		let mut offset = 3 * 4096;
		dn.next_offset(true, &mut offset, 1, 1).unwrap();
		assert_eq!(offset, 4 * 4096);
		dn.rele(FTAG);
	}

	#[test]
	fn data_scan_past_end_wraps_to_esrch() {
		let os = Objset::new();
		let dn = sparse_object(&os);
		let mut offset = 4 * 4096;
		let e = dn.next_offset(false, &mut offset, 1, 1).unwrap_err();
		assert_eq!(e.raw_os_error(), Some(libc::ESRCH));
		dn.rele(FTAG);
	}

	#[test]
	fn never_synced_object_has_no_content() {
		let os = Objset::new();
		let tx = Tx::new(2);
		let dn = os.dnode_hold_impl(5, HoldFlag::MustBeFree, FTAG).unwrap();
		dn.allocate(ObjectType::PlainFile, 4096, 0, ObjectType::None, 0, &tx);

		// the image still shows zero levels until the txg syncs
		let mut offset = 0;
		let e = dn.next_offset(false, &mut offset, 1, 1).unwrap_err();
		assert_eq!(e.raw_os_error(), Some(libc::ESRCH));

		os.sync_done(2);
		dn.rele(FTAG);
	}

	#[test]
	fn single_embedded_block() {
		let os = Objset::new();
		let tx = Tx::new(3);
		let dn = os.dnode_hold_impl(6, HoldFlag::MustBeFree, FTAG).unwrap();
		// three sectors: not a power of two, so datablkshift stays 0
		dn.allocate(ObjectType::PlainFile, 1536, 0, ObjectType::None, 0, &tx);
		os.sync_done(3);

		let mut offset = 100;
		dn.next_offset(true, &mut offset, 1, 1).unwrap();
		assert_eq!(offset, 1536);

		let mut offset = 2000;
		let e = dn.next_offset(true, &mut offset, 1, 1).unwrap_err();
		assert_eq!(e.raw_os_error(), Some(libc::ESRCH));

		dn.rele(FTAG);
	}

	/// Walking the meta-dnode finds allocated and free slots.
	#[test]
	fn meta_dnode_object_walk() {
		let os = Objset::new();
		let tx = Tx::new(8);
		for object in [3u64, 5, 9] {
			let dn = os.dnode_hold_impl(object, HoldFlag::MustBeFree, FTAG).unwrap();
			dn.allocate(ObjectType::PlainFile, 4096, 0, ObjectType::None, 0, &tx);
			dn.rele(FTAG);
		}
		os.sync_done(8);

		let mdn = os.meta_dnode();
		let blkfill = crate::data::DNODES_PER_BLOCK;

		// next allocated object after 3
		let mut offset = 4 << DNODE_SHIFT;
		mdn.next_offset(false, &mut offset, 0, blkfill).unwrap();
		assert_eq!(offset >> DNODE_SHIFT, 5);

		// next free slot after 5
		let mut offset = 5 << DNODE_SHIFT;
		mdn.next_offset(true, &mut offset, 0, blkfill).unwrap();
		assert_eq!(offset >> DNODE_SHIFT, 6);
	}
}
