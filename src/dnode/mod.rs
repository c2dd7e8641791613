use std::{
	any::Any,
	collections::BTreeMap,
	sync::{
		atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
		Arc, Mutex, MutexGuard, OnceLock, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak,
	},
};

use crate::{
	data::{
		p2phase, BlockPtr, DnodePhys, ObjectType, BLKPTR_SHIFT, BLKPTR_SIZE, DEV_BSHIFT,
		DNODE_SHIFT, MAX_BLOCKSHIFT, MAX_BLOCKSIZE, MAX_BONUSLEN, MAX_INDBLKSHIFT, MAX_LEVELS,
		MAX_NBLKPTR, MIN_BLOCKSHIFT, MIN_BLOCKSIZE, MIN_INDBLKSHIFT, TXG_MASK, TXG_SIZE,
	},
	dbuf::{Dbuf, DbufData, DbufUser, BONUS_BLKID},
	err,
	objset::Objset,
	range::RangeSet,
	refcount::{Refcount, Tag},
	tx::Tx,
};

mod alloc;
mod free_range;
mod scan;

/// Object number of the meta-dnode.
pub(crate) const META_DNODE_OBJECT: u64 = 0;

static DEFAULT_BLOCKSHIFT: AtomicU32 = AtomicU32::new(MIN_BLOCKSHIFT);
static DEFAULT_INDBLKSHIFT: AtomicU32 = AtomicU32::new(MAX_INDBLKSHIFT);
static VERIFY: AtomicBool = AtomicBool::new(false);

/// log2 of the data block size used when `allocate` is passed zero.
pub fn default_blockshift() -> u32 {
	DEFAULT_BLOCKSHIFT.load(Ordering::Relaxed)
}

pub fn set_default_blockshift(shift: u32) {
	assert!((MIN_BLOCKSHIFT..=MAX_BLOCKSHIFT).contains(&shift));
	DEFAULT_BLOCKSHIFT.store(shift, Ordering::Relaxed);
}

/// Indirect-block shift used when `allocate` is passed zero.
pub fn default_indblkshift() -> u32 {
	DEFAULT_INDBLKSHIFT.load(Ordering::Relaxed)
}

pub fn set_default_indblkshift(shift: u32) {
	assert!((MIN_INDBLKSHIFT..=MAX_INDBLKSHIFT).contains(&shift));
	DEFAULT_INDBLKSHIFT.store(shift, Ordering::Relaxed);
}

/// Enable the (debug-build) consistency checks run on hold and open.
pub fn set_verify(on: bool) {
	VERIFY.store(on, Ordering::Relaxed);
}

/// Structural state guarded by the handle's rwlock: tree height,
/// indirect shift, the high-water block id and the per-txg pending
/// geometry.
#[derive(Debug)]
pub(crate) struct Geometry {
	pub nlevels:          u8,
	pub maxblkid:         u64,
	pub next_nlevels:     [u8; TXG_SIZE],
	pub next_indblkshift: [u8; TXG_SIZE],
}

/// State guarded by the handle mutex: type and bonus layout, the
/// pending-free txg and the per-txg free-range sets.
pub(crate) struct DnodeState {
	pub kind:      ObjectType,
	pub bonustype: u8,
	pub bonuslen:  u16,
	pub nblkptr:   u8,
	pub checksum:  u8,
	pub compress:  u8,
	pub free_txg:  u64,
	pub ranges:    [RangeSet; TXG_SIZE],
}

/// In-memory handle onto one object's dnode.
///
/// Lock order: the structural rwlock, then the objectset lists, then
/// the `dbufs` map, then the handle mutex, then any buffer's own
/// state. The data-block-size trio is read lock-free; writers update
/// it under the structural lock.
pub struct Dnode {
	os:     Weak<Objset>,
	object: u64,

	/// The meta-dnode block holding this dnode's image; `None` for
	/// special (bootstrap) dnodes, whose image is owned outright.
	dbuf:       Option<Arc<Dbuf>>,
	slot:       usize,
	phys_owned: Option<Mutex<DnodePhys>>,

	datablksz:    AtomicU32,
	datablkszsec: AtomicU32,
	datablkshift: AtomicU32,
	indblkshift:  AtomicU32,

	geom:  RwLock<Geometry>,
	state: Mutex<DnodeState>,
	dbufs: Mutex<BTreeMap<(u8, u64), Arc<Dbuf>>>,

	holds:    Refcount,
	tx_holds: Refcount,

	/// Nonzero iff dirty in that txg; records the block size at the
	/// moment of first dirtying. First writer wins.
	dirtyblksz: [AtomicU32; TXG_SIZE],

	allocated_txg: AtomicU64,
}

impl std::fmt::Debug for Dnode {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Dnode").field("object", &self.object).finish()
	}
}

/// Block id containing a byte offset; a zero shift means the object
/// is a single block.
pub(crate) fn whichblock(datablkshift: u32, offset: u64) -> u64 {
	if datablkshift == 0 {
		0
	} else {
		offset >> datablkshift
	}
}

impl Dnode {
	fn init(
		os: Weak<Objset>,
		dbuf: Option<Arc<Dbuf>>,
		slot: usize,
		phys: DnodePhys,
		object: u64,
	) -> Arc<Self> {
		log::trace!("dnode create(obj={object});");

		let kind = match phys.object_type() {
			Some(t) => t,
			None => panic!("dnode {object} has invalid type {}", phys.kind),
		};

		let geom = Geometry {
			nlevels:          phys.nlevels,
			maxblkid:         phys.maxblkid,
			next_nlevels:     [0; TXG_SIZE],
			next_indblkshift: [0; TXG_SIZE],
		};
		let state = DnodeState {
			kind,
			bonustype: phys.bonustype,
			bonuslen: phys.bonuslen,
			nblkptr: phys.nblkptr,
			checksum: phys.checksum,
			compress: phys.compress,
			free_txg: 0,
			ranges: Default::default(),
		};

		let (datablkszsec, indblkshift) = (phys.datablkszsec, phys.indblkshift);
		let phys_owned = if dbuf.is_none() {
			Some(Mutex::new(phys))
		} else {
			None
		};

		let dn = Arc::new(Self {
			os: os.clone(),
			object,
			dbuf,
			slot,
			phys_owned,
			datablksz: AtomicU32::new(0),
			datablkszsec: AtomicU32::new(0),
			datablkshift: AtomicU32::new(0),
			indblkshift: AtomicU32::new(indblkshift as u32),
			geom: RwLock::new(geom),
			state: Mutex::new(state),
			dbufs: Mutex::new(BTreeMap::new()),
			holds: Refcount::new(),
			tx_holds: Refcount::new(),
			dirtyblksz: Default::default(),
			allocated_txg: AtomicU64::new(0),
		});

		if datablkszsec != 0 {
			dn.setdblksz((datablkszsec as u32) << MIN_BLOCKSHIFT);
		}

		if let Some(os) = os.upgrade() {
			os.insert_dnode(&dn);
		}
		dn
	}

	/// Materialize a handle from its image slot inside a meta-dnode
	/// block.
	pub(crate) fn create(os: Weak<Objset>, db: Arc<Dbuf>, slot: usize, object: u64) -> Arc<Self> {
		let phys = {
			let st = db.state();
			match &st.data {
				DbufData::Dnodes(slots) => slots[slot].clone(),
				_ => unreachable!("dnode {object} backed by a non-meta buffer"),
			}
		};
		Self::init(os, Some(db), slot, phys, object)
	}

	/// Open a special (bootstrap) dnode whose image lives outside any
	/// meta-dnode block. Closing one is dropping its last reference.
	pub(crate) fn special_open(os: Weak<Objset>, phys: DnodePhys, object: u64) -> Arc<Self> {
		let dn = Self::init(os, None, 0, phys, object);
		dn.verify();
		dn
	}

	pub fn object(&self) -> u64 {
		self.object
	}

	pub fn objset(&self) -> Arc<Objset> {
		match self.os.upgrade() {
			Some(os) => os,
			None => panic!("dnode {} outlived its objectset", self.object),
		}
	}

	pub(crate) fn is_meta(&self) -> bool {
		self.object == META_DNODE_OBJECT
	}

	pub(crate) fn geom(&self) -> RwLockReadGuard<'_, Geometry> {
		self.geom.read().unwrap()
	}

	pub(crate) fn geom_mut(&self) -> RwLockWriteGuard<'_, Geometry> {
		self.geom.write().unwrap()
	}

	pub(crate) fn state(&self) -> MutexGuard<'_, DnodeState> {
		self.state.lock().unwrap()
	}

	/// Set the data block size fields as a unit. `datablkshift` is the
	/// exact log2 when the size is a power of two and zero otherwise.
	/// Callers hold the structural lock in write mode.
	pub(crate) fn setdblksz(&self, size: u32) {
		assert_eq!(p2phase(size as u64, MIN_BLOCKSIZE as u64), 0);
		assert!((MIN_BLOCKSIZE..=MAX_BLOCKSIZE).contains(&size));
		self.datablksz.store(size, Ordering::Release);
		self.datablkszsec
			.store(size >> MIN_BLOCKSHIFT, Ordering::Release);
		let shift = if size.is_power_of_two() {
			size.trailing_zeros()
		} else {
			0
		};
		self.datablkshift.store(shift, Ordering::Release);
	}

	/// Run `f` against the on-disk image.
	pub fn with_phys<R>(&self, f: impl FnOnce(&DnodePhys) -> R) -> R {
		match (&self.phys_owned, &self.dbuf) {
			(Some(phys), _) => f(&phys.lock().unwrap()),
			(None, Some(db)) => {
				let st = db.state();
				match &st.data {
					DbufData::Dnodes(slots) => f(&slots[self.slot]),
					_ => unreachable!("dnode backed by a non-meta buffer"),
				}
			}
			(None, None) => unreachable!("dnode without an image"),
		}
	}

	/// Run `f` against the on-disk image, mutably. Writers hold the
	/// structural lock and the txg discipline guarantees the
	/// containing buffer is itself dirty.
	pub fn with_phys_mut<R>(&self, f: impl FnOnce(&mut DnodePhys) -> R) -> R {
		match (&self.phys_owned, &self.dbuf) {
			(Some(phys), _) => f(&mut phys.lock().unwrap()),
			(None, Some(db)) => {
				let mut st = db.state();
				match &mut st.data {
					DbufData::Dnodes(slots) => f(&mut slots[self.slot]),
					_ => unreachable!("dnode backed by a non-meta buffer"),
				}
			}
			(None, None) => unreachable!("dnode without an image"),
		}
	}

	pub fn kind(&self) -> ObjectType {
		self.state().kind
	}

	pub fn bonustype(&self) -> u8 {
		self.state().bonustype
	}

	pub fn bonuslen(&self) -> u16 {
		self.state().bonuslen
	}

	pub fn nblkptr(&self) -> u8 {
		self.state().nblkptr
	}

	pub fn datablksz(&self) -> u32 {
		self.datablksz.load(Ordering::Acquire)
	}

	pub fn datablkszsec(&self) -> u16 {
		self.datablkszsec.load(Ordering::Acquire) as u16
	}

	pub fn datablkshift(&self) -> u32 {
		self.datablkshift.load(Ordering::Acquire)
	}

	pub fn indblkshift(&self) -> u8 {
		self.indblkshift.load(Ordering::Acquire) as u8
	}

	/// Install a new indirect-block shift. Callers hold the
	/// structural lock in write mode.
	pub(crate) fn set_indblkshift(&self, ibs: u32) {
		assert!(ibs <= MAX_INDBLKSHIFT);
		self.indblkshift.store(ibs, Ordering::Release);
	}

	pub fn nlevels(&self) -> u8 {
		self.geom().nlevels
	}

	pub fn maxblkid(&self) -> u64 {
		self.geom().maxblkid
	}

	pub fn allocated_txg(&self) -> u64 {
		self.allocated_txg.load(Ordering::Acquire)
	}

	pub fn free_txg(&self) -> u64 {
		self.state().free_txg
	}

	pub fn holds(&self) -> u64 {
		self.holds.count()
	}

	pub fn is_dirty(&self, txg: u64) -> bool {
		self.dirty_blksz(txg) > 0
	}

	/// Block size recorded at the moment of first dirtying in `txg`.
	pub fn dirty_blksz(&self, txg: u64) -> u32 {
		self.dirtyblksz[(txg & TXG_MASK) as usize].load(Ordering::Acquire)
	}

	/// Take a further reference on an already-held dnode.
	pub fn add_ref(&self, tag: Tag) {
		assert!(self.holds.count() > 0);
		self.holds.add(tag);
	}

	/// Take a reference; the first hold pins the containing buffer.
	pub(crate) fn hold_ref(&self, tag: Tag) {
		if self.holds.add(tag) == 1 {
			if let Some(db) = &self.dbuf {
				db.hold(Tag::Object(self.object));
			}
		}
	}

	/// Release a reference taken with the same tag. Dropping the last
	/// hold unpins the containing buffer; special dnodes have none.
	pub fn rele(&self, tag: Tag) {
		let refs = self.holds.remove(tag);
		if refs == 0 {
			if let Some(db) = &self.dbuf {
				db.rele(Tag::Object(self.object));
			}
		}
	}

	pub fn tx_hold(&self, tag: Tag) {
		self.tx_holds.add(tag);
	}

	pub fn tx_rele(&self, tag: Tag) {
		self.tx_holds.remove(tag);
	}

	pub fn tx_hold_count(&self) -> u64 {
		self.tx_holds.count()
	}

	/// Mark this dnode dirty against `tx`, enqueueing it on the
	/// objectset's dirty (or free) list for that txg. Idempotent
	/// within a txg.
	pub fn setdirty(self: &Arc<Self>, tx: &Tx) {
		// The meta-dnode syncs with its objectset, never through the
		// per-txg dnode lists.
		if self.is_meta() {
			return;
		}

		debug_assert!(self.with_phys(|p| !p.is_free()) || self.allocated_txg() != 0);

		let os = self.objset();
		let off = tx.txgoff();
		let free_txg = self.state().free_txg;
		let blksz = self.datablksz();

		{
			let mut lists = os.lists();

			// already marked dirty: nothing to do
			if self.dirtyblksz[off].load(Ordering::Acquire) > 0 {
				return;
			}

			debug_assert!(!self.holds.is_zero() || !self.dbufs.lock().unwrap().is_empty());
			assert!(blksz != 0);
			self.dirtyblksz[off].store(blksz, Ordering::Release);

			log::debug!("setdirty(obj={}, txg={})", self.object, tx.txg());

			if free_txg > 0 && free_txg <= tx.txg() {
				lists.freed[off].push(self.clone());
			} else {
				lists.dirty[off].push(self.clone());
			}
		}

		// The dnode holds its containing buffer as long as it is
		// held; each child buffer holds the dnode. This synthetic
		// hold keeps the handle alive until the txg syncs.
		self.holds.add(Tag::Txg(tx.txg()));

		if let Some(db) = &self.dbuf {
			db.mark_dirty(tx);
		}
		os.dataset_dirty(tx);
	}

	/// Consistency checks, run when the verify flag is set (debug
	/// builds only). Callers must not hold the structural lock.
	pub fn verify(&self) {
		#[cfg(debug_assertions)]
		if VERIFY.load(Ordering::Relaxed) {
			self.verify_impl();
		}
	}

	#[cfg(debug_assertions)]
	fn verify_impl(&self) {
		let geom = self.geom();
		let st = self.state();
		let blksz = self.datablksz();
		let shift = self.datablkshift();

		if st.kind != ObjectType::None || self.allocated_txg() != 0 {
			assert!(self.indblkshift() as u32 <= MAX_INDBLKSHIFT);
			if shift != 0 {
				assert!((MIN_BLOCKSHIFT..=MAX_BLOCKSHIFT).contains(&shift));
				assert_eq!(1u32 << shift, blksz);
			}
			assert!(geom.nlevels as u32 <= MAX_LEVELS);
			assert!(st.nblkptr >= 1 && st.nblkptr as usize <= MAX_NBLKPTR);
			assert!(st.bonuslen as usize <= MAX_BONUSLEN);
			assert_eq!(blksz, (self.datablkszsec() as u32) << MIN_BLOCKSHIFT);
			assert_eq!(blksz.is_power_of_two(), shift != 0);
			assert!((st.nblkptr as usize - 1) * BLKPTR_SIZE + st.bonuslen as usize <= MAX_BONUSLEN);
			for i in 0..TXG_SIZE {
				assert!(geom.next_nlevels[i] <= geom.nlevels);
			}
		}
		self.with_phys(|p| {
			assert!(p.object_type().is_some());
			if !p.is_free() {
				assert!(p.nlevels <= geom.nlevels);
			}
		});
		assert!(self.is_meta() || self.dbuf.is_some());
	}

	/// Account sectors actually written or freed for this object
	/// (syncing context).
	pub fn diduse_space(&self, space: i64) {
		log::trace!("diduse_space(obj={}, space={space});", self.object);
		assert_eq!(p2phase(space.unsigned_abs(), 1 << DEV_BSHIFT), 0);

		let _st = self.state();
		self.with_phys_mut(|p| {
			if space > 0 {
				let sectors = (space as u64) >> DEV_BSHIFT;
				assert!(p.secphys <= u64::MAX - sectors);
				p.secphys += sectors;
			} else {
				let sectors = space.unsigned_abs() >> DEV_BSHIFT;
				assert!(p.secphys >= sectors);
				p.secphys -= sectors;
			}
		});
	}

	/// Forward a conservative space estimate to the dataset and
	/// transaction quota trackers (open context). Positive estimates
	/// are inflated to the allocator's worst case.
	pub fn willuse_space(&self, space: i64, tx: &Tx) {
		let space = if space > 0 {
			space.saturating_mul(crate::objset::ASIZE_WORST_CASE)
		} else {
			space
		};
		self.objset().willuse_space(space, tx);
	}

	/// Highest byte offset that may contain data, from the on-disk
	/// image.
	pub fn max_nonzero_offset(&self) -> u64 {
		let blksz = self.datablksz() as u64;
		self.with_phys(|p| {
			if p.nblkptr == 0 || (p.maxblkid == 0 && p.blkptr(0).is_hole()) {
				0
			} else {
				(p.maxblkid + 1) * blksz
			}
		})
	}

	/// Reconcile this txg's dirty state into the on-disk image and
	/// drop the synthetic hold. Called by the objectset's sync path.
	pub(crate) fn sync_done(self: &Arc<Self>, txg: u64) {
		let off = (txg & TXG_MASK) as usize;
		assert!(self.dirtyblksz[off].load(Ordering::Acquire) > 0);

		let freed = {
			let mut geom = self.geom_mut();
			let mut st = self.state();
			let freed = st.free_txg != 0 && st.free_txg <= txg;

			if !freed {
				let (sec, maxblkid) = (self.datablkszsec(), geom.maxblkid);
				let indblkshift = self.indblkshift();
				self.with_phys_mut(|p| {
					p.kind = st.kind as u8;
					p.indblkshift = indblkshift;
					p.nlevels = geom.nlevels;
					p.nblkptr = st.nblkptr;
					p.bonustype = st.bonustype;
					p.bonuslen = st.bonuslen;
					p.checksum = st.checksum;
					p.compress = st.compress;
					p.datablkszsec = sec;
					p.maxblkid = maxblkid;
				});
			}

			// queued frees are emitted during sync; the set drains
			st.ranges[off] = RangeSet::new();

			geom.next_nlevels[off] = 0;
			geom.next_indblkshift[off] = 0;
			freed
		};

		if freed {
			self.sync_free(txg);
		}

		self.dirtyblksz[off].store(0, Ordering::Release);
		self.rele(Tag::Txg(txg));
	}

	/// Finalize deletion: the slot reads as free again.
	fn sync_free(self: &Arc<Self>, txg: u64) {
		log::debug!("sync_free(obj={}, txg={txg})", self.object);
		self.evict_dbufs();
		{
			let mut geom = self.geom_mut();
			let mut st = self.state();
			self.with_phys_mut(|p| *p = DnodePhys::zero());
			st.kind = ObjectType::None;
			st.bonustype = 0;
			st.bonuslen = 0;
			st.nblkptr = 0;
			st.free_txg = 0;
			for r in st.ranges.iter_mut() {
				*r = RangeSet::new();
			}
			geom.nlevels = 0;
			geom.maxblkid = 0;
		}
		self.allocated_txg.store(0, Ordering::Release);
	}

	// ------------------------------------------------------------------
	// Buffer cache plumbing.

	/// Hold the cached block at `(level, blkid)`, materializing it if
	/// absent. With `fail_sparse`, holding a hole fails with `ENOENT`.
	pub fn hold_dbuf_impl(
		&self,
		level: u8,
		blkid: u64,
		fail_sparse: bool,
		tag: Tag,
	) -> std::io::Result<Arc<Dbuf>> {
		let mut dbufs = self.dbufs.lock().unwrap();
		if let Some(db) = dbufs.get(&(level, blkid)) {
			db.hold(tag);
			return Ok(db.clone());
		}

		let bp = self.resolve_blkptr(level, blkid, &dbufs);
		if fail_sparse && bp.map_or(true, |bp| bp.is_hole()) {
			return Err(err!(ENOENT));
		}

		let db = Dbuf::new(level, blkid, self.materialize(level), bp);
		db.hold(tag);
		dbufs.insert((level, blkid), db.clone());
		Ok(db)
	}

	pub fn hold_dbuf(&self, level: u8, blkid: u64, tag: Tag) -> Arc<Dbuf> {
		match self.hold_dbuf_impl(level, blkid, false, tag) {
			Ok(db) => db,
			Err(_) => unreachable!("hold without fail_sparse is infallible"),
		}
	}

	/// Hold the bonus buffer, creating it from the image if absent. A
	/// zero-length bonus is widened to one byte so a buffer is always
	/// present.
	pub fn hold_bonus(&self, tag: Tag) -> Arc<Dbuf> {
		let mut dbufs = self.dbufs.lock().unwrap();
		if let Some(db) = dbufs.get(&(0, BONUS_BLKID)) {
			db.hold(tag);
			return db.clone();
		}

		let bonuslen = self.state().bonuslen as usize;
		let mut data = vec![0u8; bonuslen.max(1)];
		self.with_phys(|p| {
			let n = bonuslen.min(p.bonuslen as usize);
			data[..n].copy_from_slice(&p.bonus()[..n]);
		});
		let db = Dbuf::new(0, BONUS_BLKID, DbufData::Bytes(data), None);
		db.hold(tag);
		dbufs.insert((0, BONUS_BLKID), db.clone());
		db
	}

	pub(crate) fn cached_dbuf(&self, level: u8, blkid: u64) -> Option<Arc<Dbuf>> {
		self.dbufs.lock().unwrap().get(&(level, blkid)).cloned()
	}

	pub fn cached_dbuf_count(&self) -> usize {
		self.dbufs.lock().unwrap().len()
	}

	/// Fresh content for a block of this object at the given level.
	fn materialize(&self, level: u8) -> DbufData {
		if level > 0 {
			let epbs = self.indblkshift() as u32 - BLKPTR_SHIFT;
			DbufData::Indirect(vec![BlockPtr::HOLE; 1 << epbs])
		} else if self.is_meta() {
			let epb = self.with_phys(|p| p.datablksz() as usize >> DNODE_SHIFT);
			DbufData::Dnodes(vec![DnodePhys::zero(); epb])
		} else {
			let blksz = self.with_phys(|p| p.datablksz());
			let blksz = if blksz == 0 { self.datablksz() } else { blksz };
			DbufData::Bytes(vec![0; blksz as usize])
		}
	}

	/// Resolve the block pointer covering `(level, blkid)` through
	/// cached parents and the embedded root array. `None` means the
	/// pointer is not reachable through the cache.
	fn resolve_blkptr(
		&self,
		level: u8,
		blkid: u64,
		dbufs: &BTreeMap<(u8, u64), Arc<Dbuf>>,
	) -> Option<BlockPtr> {
		let (nlevels, nblkptr, indblkshift) =
			self.with_phys(|p| (p.nlevels, p.nblkptr, p.indblkshift));
		if nlevels == 0 || level >= nlevels {
			return Some(BlockPtr::HOLE);
		}
		if level == nlevels - 1 {
			return Some(if blkid < nblkptr as u64 {
				self.with_phys(|p| p.blkptr(blkid as usize))
			} else {
				BlockPtr::HOLE
			});
		}

		let epbs = indblkshift as u32 - BLKPTR_SHIFT;
		let pidx = blkid >> epbs;
		if let Some(pdb) = dbufs.get(&(level + 1, pidx)) {
			let st = pdb.state();
			return match &st.data {
				DbufData::Indirect(bps) => Some(
					bps.get(p2phase(blkid, 1 << epbs) as usize)
						.copied()
						.unwrap_or(BlockPtr::HOLE),
				),
				_ => Some(BlockPtr::HOLE),
			};
		}
		match self.resolve_blkptr(level + 1, pidx, dbufs) {
			Some(bp) if bp.is_hole() => Some(BlockPtr::HOLE),
			_ => None,
		}
	}

	/// Drop unheld cached data buffers in `[blkid, blkid + nblks)`;
	/// held ones are zeroed in place so reads in the range see holes.
	pub(crate) fn evict_dbufs_range(&self, blkid: u64, nblks: u64) {
		let mut dbufs = self.dbufs.lock().unwrap();
		let end = blkid.saturating_add(nblks);
		let keys: Vec<(u8, u64)> = dbufs
			.range((0u8, blkid)..(0u8, end))
			.map(|(&k, _)| k)
			.filter(|&(_, b)| b != BONUS_BLKID)
			.collect();
		for k in keys {
			let held = dbufs.get(&k).map_or(0, |db| db.holds());
			if held == 0 {
				if let Some(db) = dbufs.remove(&k) {
					db.evict();
				}
			} else if let Some(db) = dbufs.get(&k) {
				let mut st = db.state();
				st.dirty = [false; TXG_SIZE];
				if let DbufData::Bytes(b) = &mut st.data {
					b.fill(0);
				}
			}
		}
	}

	/// Page out every unheld cached buffer, notifying attached users.
	pub fn evict_dbufs(&self) {
		let mut dbufs = self.dbufs.lock().unwrap();
		dbufs.retain(|_, db| {
			if db.holds() == 0 {
				db.evict();
				false
			} else {
				true
			}
		});
	}
}

/// Per-meta-block table of child dnode handles, installed on the
/// block's buffer and destroyed with it at pageout.
pub(crate) struct Children {
	slots: Box<[OnceLock<Arc<Dnode>>]>,
}

impl Children {
	pub fn new(epb: usize) -> Arc<Self> {
		Arc::new(Self {
			slots: (0..epb).map(|_| OnceLock::new()).collect(),
		})
	}

	/// Install a handle in `idx` unless one is already visible;
	/// exactly one handle survives per live slot.
	pub fn get_or_create(&self, idx: usize, make: impl FnOnce() -> Arc<Dnode>) -> &Arc<Dnode> {
		self.slots[idx].get_or_init(make)
	}
}

impl DbufUser for Children {
	/// Pageout of the containing block: every remaining handle must be
	/// idle.
	fn evicted(&self) {
		for slot in self.slots.iter() {
			if let Some(dn) = slot.get() {
				// Holds on the dnode imply holds on its containing
				// buffer, which would have made it ineligible for
				// eviction.
				assert!(dn.holds.is_zero());
				assert!(dn.tx_holds.is_zero());
				assert!(dn.dbufs.lock().unwrap().is_empty());
				for i in 0..TXG_SIZE {
					assert_eq!(dn.dirtyblksz[i].load(Ordering::Acquire), 0);
				}
			}
		}
	}

	fn as_any(&self) -> &dyn Any {
		self
	}
}
