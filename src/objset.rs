use std::{
	io::Result as IoResult,
	sync::{
		atomic::{AtomicBool, AtomicI64, Ordering},
		Arc, Mutex, MutexGuard, Weak,
	},
};

use crate::{
	data::{
		DnodePhys, ObjectType, CHECKSUM_INHERIT, COMPRESS_INHERIT, DNODE_SHIFT, DNODE_SIZE,
		MAX_INDBLKSHIFT, MAX_NBLKPTR, MAX_OBJECT, META_BLOCKSHIFT, MIN_BLOCKSHIFT, TXG_MASK,
		TXG_SIZE,
	},
	dnode::{whichblock, Children, Dnode, META_DNODE_OBJECT},
	err,
	refcount::Tag,
	tx::Tx,
};

/// Worst-case inflation applied to positive space estimates: three
/// ditto copies at 2x parity expansion.
pub(crate) const ASIZE_WORST_CASE: i64 = 6;

/// What a caller demands of the slot it is holding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HoldFlag {
	Any,
	MustBeAllocated,
	MustBeFree,
}

#[derive(Default)]
pub(crate) struct OsLists {
	/// Every live handle in this objectset.
	pub dnodes: Vec<Weak<Dnode>>,

	/// Handles dirtied in each open txg.
	pub dirty: [Vec<Arc<Dnode>>; TXG_SIZE],

	/// Handles queued for deletion in each open txg.
	pub freed: [Vec<Arc<Dnode>>; TXG_SIZE],
}

/// A set of objects sharing one meta-dnode.
///
/// The meta-dnode's data blocks hold the dnode images of every other
/// object; holding an object materializes a handle out of the right
/// slot of the right block.
pub struct Objset {
	meta:  Arc<Dnode>,
	lists: Mutex<OsLists>,

	// dataset-level dirty tracking
	ds_dirty:      [AtomicBool; TXG_SIZE],
	space_towrite: AtomicI64,
}

fn meta_phys() -> DnodePhys {
	let mut phys = DnodePhys::zero();
	phys.kind = ObjectType::Meta as u8;
	phys.indblkshift = MAX_INDBLKSHIFT as u8;
	phys.nlevels = 1;
	phys.nblkptr = MAX_NBLKPTR as u8;
	phys.datablkszsec = ((1u32 << META_BLOCKSHIFT) >> MIN_BLOCKSHIFT) as u16;
	phys.checksum = CHECKSUM_INHERIT;
	phys.compress = COMPRESS_INHERIT;
	phys
}

impl Objset {
	/// Create an empty objectset with a fresh meta-dnode.
	pub fn new() -> Arc<Self> {
		Self::open(meta_phys())
	}

	/// Open an objectset around an existing meta-dnode image.
	pub fn open(meta: DnodePhys) -> Arc<Self> {
		let os = Arc::new_cyclic(|weak: &Weak<Objset>| Objset {
			meta:          Dnode::special_open(weak.clone(), meta, META_DNODE_OBJECT),
			lists:         Mutex::new(OsLists::default()),
			ds_dirty:      Default::default(),
			space_towrite: AtomicI64::new(0),
		});
		os.insert_dnode(&os.meta);
		os
	}

	pub fn meta_dnode(&self) -> &Arc<Dnode> {
		&self.meta
	}

	pub(crate) fn lists(&self) -> MutexGuard<'_, OsLists> {
		self.lists.lock().unwrap()
	}

	pub(crate) fn insert_dnode(&self, dn: &Arc<Dnode>) {
		let mut lists = self.lists();
		lists.dnodes.retain(|w| w.strong_count() > 0);
		lists.dnodes.push(Arc::downgrade(dn));
	}

	pub fn live_dnodes(&self) -> Vec<Arc<Dnode>> {
		self.lists().dnodes.iter().filter_map(Weak::upgrade).collect()
	}

	pub fn dirty_dnodes(&self, txg: u64) -> Vec<Arc<Dnode>> {
		self.lists().dirty[(txg & TXG_MASK) as usize].clone()
	}

	pub fn freed_dnodes(&self, txg: u64) -> Vec<Arc<Dnode>> {
		self.lists().freed[(txg & TXG_MASK) as usize].clone()
	}

	/// Hold the dnode of an allocated object.
	pub fn dnode_hold(self: &Arc<Self>, object: u64, tag: Tag) -> IoResult<Arc<Dnode>> {
		self.dnode_hold_impl(object, HoldFlag::MustBeAllocated, tag)
	}

	/// Hold the dnode for `object`, materializing a handle out of the
	/// meta-dnode block that stores its image. Succeeds for free
	/// slots too unless the flag says otherwise.
	pub fn dnode_hold_impl(
		self: &Arc<Self>,
		object: u64,
		flag: HoldFlag,
		tag: Tag,
	) -> IoResult<Arc<Dnode>> {
		const FTAG: Tag = Tag::Caller("dnode_hold");

		log::trace!("dnode_hold({object}, {flag:?});");

		if object == 0 || object >= MAX_OBJECT {
			return Err(err!(EINVAL));
		}

		let mdn = &self.meta;
		mdn.verify();

		// Resolve the containing meta-dnode block under the
		// meta-dnode's structural lock, then let go of it.
		let db = {
			let _struct = mdn.geom();
			let blk = whichblock(mdn.datablkshift(), object << DNODE_SHIFT);
			mdn.hold_dbuf(0, blk, FTAG)
		};

		assert!(db.size() >= DNODE_SIZE);
		let epb = db.size() >> DNODE_SHIFT;
		let idx = (object & (epb as u64 - 1)) as usize;

		// Install the child-handle table on the block, first caller
		// wins.
		let user = match db.user() {
			Some(u) => u.clone(),
			None => db.set_user(Children::new(epb)),
		};
		let children = match user.as_any().downcast_ref::<Children>() {
			Some(c) => c,
			None => unreachable!("meta block user is the child table"),
		};

		let dn = children
			.get_or_create(idx, || {
				Dnode::create(Arc::downgrade(self), db.clone(), idx, object)
			})
			.clone();

		let reject = {
			let st = dn.state();
			if st.free_txg != 0 {
				Some(err!(ENOENT))
			} else if flag == HoldFlag::MustBeAllocated && st.kind == ObjectType::None {
				Some(err!(ENOENT))
			} else if flag == HoldFlag::MustBeFree && st.kind != ObjectType::None {
				Some(err!(EEXIST))
			} else {
				None
			}
		};
		if let Some(e) = reject {
			db.rele(FTAG);
			return Err(e);
		}

		dn.hold_ref(tag);
		dn.verify();
		debug_assert_eq!(dn.object(), object);
		db.rele(FTAG);

		Ok(dn)
	}

	/// Drive the pageout path: drop every unheld meta-dnode block,
	/// destroying the handles it carried.
	pub fn evict_meta_blocks(&self) {
		self.meta.evict_dbufs();
	}

	/// Complete a txg: drain the per-txg dirty and free lists,
	/// reconciling each handle's state into its image.
	pub fn sync_done(&self, txg: u64) {
		let off = (txg & TXG_MASK) as usize;
		let (dirty, freed) = {
			let mut lists = self.lists();
			(
				std::mem::take(&mut lists.dirty[off]),
				std::mem::take(&mut lists.freed[off]),
			)
		};
		for dn in dirty.iter().chain(freed.iter()) {
			dn.sync_done(txg);
		}
		self.ds_dirty[off].store(false, Ordering::Release);
	}

	pub(crate) fn dataset_dirty(&self, tx: &Tx) {
		self.ds_dirty[tx.txgoff()].store(true, Ordering::Release);
	}

	pub fn dataset_dirtied(&self, txg: u64) -> bool {
		self.ds_dirty[(txg & TXG_MASK) as usize].load(Ordering::Acquire)
	}

	pub(crate) fn willuse_space(&self, space: i64, tx: &Tx) {
		self.space_towrite.fetch_add(space, Ordering::AcqRel);
		tx.willuse_space(space);
	}

	/// Space estimated but not yet written, across open txgs.
	pub fn pending_space(&self) -> i64 {
		self.space_towrite.load(Ordering::Acquire)
	}
}

#[cfg(test)]
mod t {
	use super::*;

	#[test]
	fn meta_dnode_geometry() {
		let os = Objset::new();
		let mdn = os.meta_dnode();
		assert_eq!(mdn.object(), 0);
		assert_eq!(mdn.datablksz(), 1 << META_BLOCKSHIFT);
		assert_eq!(mdn.datablkshift(), META_BLOCKSHIFT);
		assert_eq!(mdn.kind(), ObjectType::Meta);
	}

	#[test]
	fn hold_rejects_bad_object_ids() {
		let os = Objset::new();
		let t = Tag::Caller("test");
		let e = os.dnode_hold(0, t).unwrap_err();
		assert_eq!(e.raw_os_error(), Some(libc::EINVAL));
		let e = os.dnode_hold(MAX_OBJECT, t).unwrap_err();
		assert_eq!(e.raw_os_error(), Some(libc::EINVAL));
	}

	#[test]
	fn hold_flags() {
		let os = Objset::new();
		let t = Tag::Caller("test");

		// a cold slot is free
		let e = os.dnode_hold(33, t).unwrap_err();
		assert_eq!(e.raw_os_error(), Some(libc::ENOENT));

		let dn = os.dnode_hold_impl(33, HoldFlag::MustBeFree, t).unwrap();
		assert_eq!(dn.kind(), ObjectType::None);
		assert_eq!(dn.holds(), 1);
		dn.rele(t);
	}

	#[test]
	fn hold_same_slot_twice() {
		let os = Objset::new();
		let t = Tag::Caller("test");
		let a = os.dnode_hold_impl(9, HoldFlag::Any, t).unwrap();
		let b = os.dnode_hold_impl(9, HoldFlag::Any, t).unwrap();
		assert!(Arc::ptr_eq(&a, &b));
		assert_eq!(a.holds(), 2);
		b.rele(t);
		a.rele(t);
		assert_eq!(a.holds(), 0);
	}
}
