use std::{
	any::Any,
	sync::{Arc, Mutex, MutexGuard, OnceLock},
};

use crate::{
	data::{BlockPtr, DnodePhys, TXG_SIZE},
	refcount::{Refcount, Tag},
	tx::Tx,
};

/// Pseudo block id of the bonus buffer.
pub const BONUS_BLKID: u64 = u64::MAX;

/// Content of one cached block.
#[derive(Debug)]
pub enum DbufData {
	/// File data or the bonus buffer.
	Bytes(Vec<u8>),

	/// An indirect block: an array of block pointers.
	Indirect(Vec<BlockPtr>),

	/// A meta-dnode data block: an array of dnode images.
	Dnodes(Vec<DnodePhys>),
}

impl DbufData {
	pub fn size(&self) -> usize {
		match self {
			Self::Bytes(b) => b.len(),
			Self::Indirect(bps) => bps.len() * crate::data::BLKPTR_SIZE,
			Self::Dnodes(dns) => dns.len() * crate::data::DNODE_SIZE,
		}
	}
}

/// User data attached to a buffer, notified when the buffer is paged
/// out.
pub trait DbufUser: Send + Sync {
	fn evicted(&self);
	fn as_any(&self) -> &dyn Any;
}

pub struct DbufState {
	pub data: DbufData,

	/// Dirtied in these txgs.
	pub dirty: [bool; TXG_SIZE],

	/// The block pointer this buffer was read through, if any.
	pub blkptr: Option<BlockPtr>,
}

/// One cached block, keyed by `(level, blkid)` within its dnode.
pub struct Dbuf {
	level: u8,
	blkid: u64,
	state: Mutex<DbufState>,
	holds: Refcount,
	user:  OnceLock<Arc<dyn DbufUser>>,
}

impl Dbuf {
	pub(crate) fn new(level: u8, blkid: u64, data: DbufData, blkptr: Option<BlockPtr>) -> Arc<Self> {
		Arc::new(Self {
			level,
			blkid,
			state: Mutex::new(DbufState {
				data,
				dirty: [false; TXG_SIZE],
				blkptr,
			}),
			holds: Refcount::new(),
			user: OnceLock::new(),
		})
	}

	pub fn level(&self) -> u8 {
		self.level
	}

	pub fn blkid(&self) -> u64 {
		self.blkid
	}

	pub fn state(&self) -> MutexGuard<'_, DbufState> {
		self.state.lock().unwrap()
	}

	pub fn hold(&self, tag: Tag) {
		self.holds.add(tag);
	}

	pub fn rele(&self, tag: Tag) {
		self.holds.remove(tag);
	}

	pub fn holds(&self) -> u64 {
		self.holds.count()
	}

	/// Logical size of the cached content.
	pub fn size(&self) -> usize {
		self.state().data.size()
	}

	pub fn is_dirty(&self) -> bool {
		self.state().dirty.iter().any(|&d| d)
	}

	pub fn is_dirty_in(&self, txg: u64) -> bool {
		self.state().dirty[(txg & crate::data::TXG_MASK) as usize]
	}

	/// Mark this buffer dirty against the given transaction.
	pub fn mark_dirty(&self, tx: &Tx) {
		log::trace!("dbuf mark_dirty(lvl={}, blkid={:#x}, txg={})", self.level, self.blkid, tx.txg());
		self.state().dirty[tx.txgoff()] = true;
	}

	/// Change the logical size of a byte buffer (bonus growth, block
	/// size changes). Grown space reads as zeros.
	pub fn resize(&self, newsize: usize, tx: &Tx) {
		let mut st = self.state();
		match &mut st.data {
			DbufData::Bytes(b) => b.resize(newsize, 0),
			_ => panic!("resize of a non-byte buffer"),
		}
		st.dirty[tx.txgoff()] = true;
	}

	/// Install user data; the first caller wins and the installed
	/// value is returned either way.
	pub fn set_user(&self, user: Arc<dyn DbufUser>) -> Arc<dyn DbufUser> {
		self.user.get_or_init(move || user).clone()
	}

	pub fn user(&self) -> Option<&Arc<dyn DbufUser>> {
		self.user.get()
	}

	/// Page this buffer out, notifying the attached user.
	pub(crate) fn evict(&self) {
		debug_assert!(self.holds.is_zero());
		if let Some(user) = self.user.get() {
			user.evicted();
		}
	}
}
