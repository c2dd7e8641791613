//! In-memory dnode layer of a copy-on-write transactional object store.
//!
//! A dnode is the on-disk descriptor for one logical object: its type,
//! block geometry, the embedded root block pointers, a variable-length
//! bonus region and usage counters. This crate materializes dnode
//! handles out of the meta-dnode's data blocks, coordinates concurrent
//! holders, tracks per-transaction-group dirty state, grows the block
//! tree as objects are written, records ranges queued for freeing and
//! answers hole/data queries over the sparse address space.

mod data;
mod dbuf;
mod dnode;
mod objset;
mod range;
mod refcount;
mod tx;

/// (INTERNAL) Constructs an [`std::io::Error`] from an `errno`.
#[macro_export]
macro_rules! err {
	($name:ident) => {
		std::io::Error::from_raw_os_error(libc::$name)
	};
}

pub use crate::{
	data::{
		dnode_buf_byteswap, BlockPtr, ByteswapKind, DnodePhys, ObjectType, ObjectTypeInfo,
		BLKPTR_SHIFT, BLKPTR_SIZE, CHECKSUM_INHERIT, COMPRESS_INHERIT, DEV_BSHIFT,
		DNODES_PER_BLOCK, DNODE_CORE_SIZE, DNODE_SHIFT,
		DNODE_SIZE, MAX_BLOCKSHIFT, MAX_BLOCKSIZE, MAX_BONUSLEN, MAX_INDBLKSHIFT, MAX_LEVELS,
		MAX_NBLKPTR, MAX_OBJECT, META_BLOCKSHIFT, MIN_BLOCKSHIFT, MIN_BLOCKSIZE,
		MIN_INDBLKSHIFT, PRIVATE_OBJECT, TXG_MASK, TXG_SIZE,
	},
	dbuf::{Dbuf, DbufData, DbufState, DbufUser, BONUS_BLKID},
	dnode::{
		default_blockshift, default_indblkshift, set_default_blockshift,
		set_default_indblkshift, set_verify, Dnode,
	},
	objset::{HoldFlag, Objset},
	range::RangeSet,
	refcount::{Refcount, Tag},
	tx::Tx,
};
