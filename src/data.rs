use std::io::{Error as IoError, ErrorKind, Result as IoResult};

use bincode::{Decode, Encode};
use static_assertions::{const_assert, const_assert_eq};

/// log2 of the smallest allocatable block (one sector).
pub const MIN_BLOCKSHIFT: u32 = 9;

/// Smallest data block size.
pub const MIN_BLOCKSIZE: u32 = 1 << MIN_BLOCKSHIFT;

/// log2 of the largest data block size.
pub const MAX_BLOCKSHIFT: u32 = 17;

/// Largest data block size (128KiB).
pub const MAX_BLOCKSIZE: u32 = 1 << MAX_BLOCKSHIFT;

/// log2 of the device sector size used for space accounting.
pub const DEV_BSHIFT: u32 = 9;

/// log2 of the on-disk dnode image size.
pub const DNODE_SHIFT: u32 = 9;

/// Size of the on-disk dnode image.
pub const DNODE_SIZE: usize = 1 << DNODE_SHIFT;

/// Bytes of fixed header preceding the block-pointer/bonus tail.
pub const DNODE_CORE_SIZE: usize = 64;

/// log2 of the size of one embedded block pointer.
pub const BLKPTR_SHIFT: u32 = 4;

/// Size of one embedded block pointer.
pub const BLKPTR_SIZE: usize = 1 << BLKPTR_SHIFT;

/// Size of the tail region shared by the root block pointers and the
/// bonus buffer.
pub const TAIL_SIZE: usize = DNODE_SIZE - DNODE_CORE_SIZE;

/// Maximum extent of the bonus region (one block pointer always
/// remains).
pub const MAX_BONUSLEN: usize = DNODE_SIZE - DNODE_CORE_SIZE - BLKPTR_SIZE;

/// Maximum number of embedded root block pointers.
pub const MAX_NBLKPTR: usize = 1 + (MAX_BONUSLEN >> BLKPTR_SHIFT);

/// Smallest permitted indirect-block shift.
pub const MIN_INDBLKSHIFT: u32 = 10;

/// Largest permitted indirect-block shift (16KiB indirect blocks).
pub const MAX_INDBLKSHIFT: u32 = 14;

/// Upper bound on the height of the block tree.
pub const MAX_LEVELS: u32 = 30;

/// Number of transaction groups in flight.
pub const TXG_SIZE: usize = 4;

/// Mask mapping a txg number onto its shadow-array slot.
pub const TXG_MASK: u64 = (TXG_SIZE - 1) as u64;

/// Object numbers are 48 bits.
pub const MAX_OBJECT: u64 = 1 << 48;

/// Bit marking bootstrap objects reachable only by private
/// transactions.
pub const PRIVATE_OBJECT: u64 = 1 << 63;

/// log2 of the meta-dnode data block size.
pub const META_BLOCKSHIFT: u32 = 14;

/// Dnode images per meta-dnode data block.
pub const DNODES_PER_BLOCK: u64 = 1 << (META_BLOCKSHIFT - DNODE_SHIFT);

/// Checksum policy id meaning "inherit from the dataset".
pub const CHECKSUM_INHERIT: u8 = 0;

/// Compression policy id meaning "inherit from the dataset".
pub const COMPRESS_INHERIT: u8 = 0;

const_assert_eq!(DNODE_CORE_SIZE + BLKPTR_SIZE + MAX_BONUSLEN, DNODE_SIZE);
const_assert_eq!(MAX_NBLKPTR * BLKPTR_SIZE, TAIL_SIZE);
const_assert!(DNODES_PER_BLOCK.is_power_of_two());

/// Object type tag stored in a dnode image. `None` marks a free slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ObjectType {
	None = 0,
	Meta = 1,
	ObjectDirectory = 2,
	SpaceMap = 3,
	PlainFile = 4,
	Directory = 5,
	Stats = 6,
}

/// How a region owned by an object type is byte-swapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteswapKind {
	Uint8,
	Uint64,
}

pub struct ObjectTypeInfo {
	pub name:     &'static str,
	pub byteswap: ByteswapKind,
}

impl ObjectType {
	pub const NUM_TYPES: u8 = 7;

	pub fn from_u8(v: u8) -> Option<Self> {
		match v {
			0 => Some(Self::None),
			1 => Some(Self::Meta),
			2 => Some(Self::ObjectDirectory),
			3 => Some(Self::SpaceMap),
			4 => Some(Self::PlainFile),
			5 => Some(Self::Directory),
			6 => Some(Self::Stats),
			_ => None,
		}
	}

	pub const fn info(self) -> ObjectTypeInfo {
		match self {
			Self::None => ObjectTypeInfo {
				name:     "none",
				byteswap: ByteswapKind::Uint8,
			},
			Self::Meta => ObjectTypeInfo {
				name:     "meta dnode",
				byteswap: ByteswapKind::Uint64,
			},
			Self::ObjectDirectory => ObjectTypeInfo {
				name:     "object directory",
				byteswap: ByteswapKind::Uint64,
			},
			Self::SpaceMap => ObjectTypeInfo {
				name:     "space map",
				byteswap: ByteswapKind::Uint64,
			},
			Self::PlainFile => ObjectTypeInfo {
				name:     "plain file contents",
				byteswap: ByteswapKind::Uint8,
			},
			Self::Directory => ObjectTypeInfo {
				name:     "directory contents",
				byteswap: ByteswapKind::Uint64,
			},
			Self::Stats => ObjectTypeInfo {
				name:     "object stats",
				byteswap: ByteswapKind::Uint64,
			},
		}
	}
}

/// One embedded block pointer: two 64-bit words.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Encode, Decode)]
pub struct BlockPtr {
	/// Abstract device address; zero marks a hole.
	pub addr: u64,

	/// Number of non-hole leaf entries beneath this pointer.
	pub fill: u64,
}

impl BlockPtr {
	pub const HOLE: BlockPtr = BlockPtr { addr: 0, fill: 0 };

	pub fn is_hole(&self) -> bool {
		self.addr == 0
	}
}

/// On-disk dnode image.
///
/// The fixed 64-byte header is followed by a 448-byte tail holding
/// `nblkptr` root block pointers and, from the end of that array, the
/// bonus region.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct DnodePhys {
	pub kind:         u8, //   0: ObjectType tag; 0 (None) marks a free slot
	pub indblkshift:  u8, //   1: log2 of indirect block size
	pub nlevels:      u8, //   2: height of the block tree
	pub nblkptr:      u8, //   3: number of root block pointers
	pub bonustype:    u8, //   4: ObjectType of the bonus region
	pub checksum:     u8, //   5: inherited checksum policy id
	pub compress:     u8, //   6: inherited compression policy id
	pub pad:          u8,
	pub datablkszsec: u16, //   8: data block size in 512-byte sectors
	pub bonuslen:     u16, //  10: length of the bonus region
	pub pad2:         [u8; 4],
	pub maxblkid:     u64, //  16: highest block id ever dirtied
	pub secphys:      u64, //  24: physical sectors used by this object
	pub pad3:         [u64; 4],
	pub tail:         [u8; TAIL_SIZE], //  64: blkptr array overlaid with bonus
}

fn config() -> impl bincode::config::Config {
	bincode::config::standard()
		.with_fixed_int_encoding()
		.with_little_endian()
}

impl DnodePhys {
	pub fn zero() -> Self {
		Self {
			kind:         0,
			indblkshift:  0,
			nlevels:      0,
			nblkptr:      0,
			bonustype:    0,
			checksum:     0,
			compress:     0,
			pad:          0,
			datablkszsec: 0,
			bonuslen:     0,
			pad2:         [0; 4],
			maxblkid:     0,
			secphys:      0,
			pad3:         [0; 4],
			tail:         [0; TAIL_SIZE],
		}
	}

	pub fn is_zero(&self) -> bool {
		*self == Self::zero()
	}

	pub fn is_free(&self) -> bool {
		self.kind == ObjectType::None as u8
	}

	pub fn object_type(&self) -> Option<ObjectType> {
		ObjectType::from_u8(self.kind)
	}

	pub fn datablksz(&self) -> u32 {
		(self.datablkszsec as u32) << MIN_BLOCKSHIFT
	}

	/// Read the `i`th root block pointer out of the tail.
	pub fn blkptr(&self, i: usize) -> BlockPtr {
		assert!(i < self.nblkptr as usize);
		let o = i * BLKPTR_SIZE;
		BlockPtr {
			addr: word(&self.tail[o..o + 8]),
			fill: word(&self.tail[o + 8..o + 16]),
		}
	}

	pub fn set_blkptr(&mut self, i: usize, bp: BlockPtr) {
		assert!(i < self.nblkptr as usize);
		let o = i * BLKPTR_SIZE;
		self.tail[o..o + 8].copy_from_slice(&bp.addr.to_ne_bytes());
		self.tail[o + 8..o + 16].copy_from_slice(&bp.fill.to_ne_bytes());
	}

	/// The bonus region begins where the block-pointer array ends.
	pub fn bonus(&self) -> &[u8] {
		let o = self.nblkptr as usize * BLKPTR_SIZE;
		&self.tail[o..o + self.bonuslen as usize]
	}

	pub fn bonus_mut(&mut self) -> &mut [u8] {
		let o = self.nblkptr as usize * BLKPTR_SIZE;
		&mut self.tail[o..o + self.bonuslen as usize]
	}

	/// Swap every scalar field and the block-pointer words, then hand
	/// the bonus region to its type's registered swap routine. The
	/// swap is an involution: applying it twice restores the image.
	pub fn byteswap(&mut self) {
		if self.is_free() {
			*self = Self::zero();
			return;
		}

		self.datablkszsec = self.datablkszsec.swap_bytes();
		self.bonuslen = self.bonuslen.swap_bytes();
		self.maxblkid = self.maxblkid.swap_bytes();
		self.secphys = self.secphys.swap_bytes();

		// nblkptr is a single byte, so it reads the same in either
		// byte order; bonuslen cannot be trusted the same way.
		assert!(self.indblkshift as u32 <= MAX_BLOCKSHIFT);
		assert!(self.nblkptr as usize <= MAX_NBLKPTR);
		let nwords = self.nblkptr as usize * BLKPTR_SIZE / 8;
		for w in self.tail[..nwords * 8].chunks_exact_mut(8) {
			w.reverse();
		}

		// The region handed to the bonus swap routine runs from the
		// end of the blkptr array to the end of the image; it may be
		// longer than the live bonus buffer because the buffer sits
		// right after the last block pointer rather than packed
		// against the end.
		if self.bonuslen != 0 {
			let off = (self.nblkptr as usize - 1) * BLKPTR_SIZE;
			let kind = ObjectType::from_u8(self.bonustype)
				.map(|t| t.info().byteswap)
				.unwrap_or(ByteswapKind::Uint8);
			let region = &mut self.tail[BLKPTR_SIZE + off..];
			if kind == ByteswapKind::Uint64 {
				for w in region.chunks_exact_mut(8) {
					w.reverse();
				}
			}
		}
	}

	/// Serialize to the 512-byte on-disk form.
	pub fn to_bytes(&self) -> IoResult<Vec<u8>> {
		bincode::encode_to_vec(self, config())
			.map_err(|_| IoError::new(ErrorKind::InvalidInput, "failed to encode dnode image"))
	}

	pub fn from_bytes(buf: &[u8]) -> IoResult<Self> {
		bincode::decode_from_slice(buf, config())
			.map(|(phys, _)| phys)
			.map_err(|_| IoError::new(ErrorKind::InvalidInput, "failed to decode dnode image"))
	}
}

/// Byte-swap every dnode image in a meta-dnode data block.
pub fn dnode_buf_byteswap(buf: &mut [DnodePhys]) {
	for dnp in buf.iter_mut() {
		dnp.byteswap();
	}
}

fn word(buf: &[u8]) -> u64 {
	let mut b = [0u8; 8];
	b.copy_from_slice(buf);
	u64::from_ne_bytes(b)
}

/// `x` modulo the power-of-two `align`.
pub(crate) fn p2phase(x: u64, align: u64) -> u64 {
	debug_assert!(align.is_power_of_two());
	x & (align - 1)
}

/// Bytes from `x` up to the next `align` boundary (zero if aligned).
pub(crate) fn p2nphase(x: u64, align: u64) -> u64 {
	debug_assert!(align.is_power_of_two());
	x.wrapping_neg() & (align - 1)
}

/// Round `x` up to the next multiple of the power-of-two `align`.
pub(crate) fn p2roundup(x: u64, align: u64) -> u64 {
	debug_assert!(x > 0 && align.is_power_of_two());
	((x - 1) | (align - 1)) + 1
}

#[cfg(test)]
mod t {
	use super::*;

	#[test]
	fn encoded_size() {
		let dnp = DnodePhys::zero();
		assert_eq!(dnp.to_bytes().unwrap().len(), DNODE_SIZE);
	}

	#[test]
	fn nblkptr_formula() {
		// One pointer when the bonus fills its maximum extent, the
		// full array when there is no bonus at all.
		assert_eq!(1 + ((MAX_BONUSLEN - MAX_BONUSLEN) >> BLKPTR_SHIFT), 1);
		assert_eq!(1 + (MAX_BONUSLEN >> BLKPTR_SHIFT), MAX_NBLKPTR);
	}

	#[test]
	fn blkptr_round_trip() {
		let mut dnp = DnodePhys::zero();
		dnp.kind = ObjectType::PlainFile as u8;
		dnp.nblkptr = 3;
		let bp = BlockPtr { addr: 0xdead_beef, fill: 7 };
		dnp.set_blkptr(2, bp);
		assert_eq!(dnp.blkptr(2), bp);
		assert!(dnp.blkptr(0).is_hole());
	}

	#[test]
	fn bonus_window() {
		let mut dnp = DnodePhys::zero();
		dnp.kind = ObjectType::PlainFile as u8;
		dnp.bonustype = ObjectType::Stats as u8;
		dnp.bonuslen = 192;
		dnp.nblkptr = (1 + ((MAX_BONUSLEN - 192) >> BLKPTR_SHIFT)) as u8;
		assert_eq!(dnp.nblkptr, 16);
		dnp.bonus_mut().fill(0xaa);
		assert_eq!(dnp.bonus().len(), 192);
		// the bonus must not alias any block pointer
		for i in 0..dnp.nblkptr as usize {
			assert!(dnp.blkptr(i).is_hole());
		}
	}

	mod byteswap {
		use super::*;

		fn sample() -> DnodePhys {
			let mut dnp = DnodePhys::zero();
			dnp.kind = ObjectType::PlainFile as u8;
			dnp.indblkshift = MAX_INDBLKSHIFT as u8;
			dnp.nlevels = 2;
			dnp.nblkptr = 16;
			dnp.bonustype = ObjectType::Stats as u8;
			dnp.bonuslen = 192;
			dnp.datablkszsec = 8;
			dnp.maxblkid = 0x0102_0304;
			dnp.secphys = 0xa5a5;
			dnp.set_blkptr(3, BlockPtr { addr: 77, fill: 2 });
			dnp.bonus_mut()[0..8].copy_from_slice(&1u64.to_ne_bytes());
			dnp
		}

		#[test]
		fn involution() {
			let mut dnp = sample();
			let orig = dnp.clone();
			dnp.byteswap();
			assert_ne!(dnp, orig);
			dnp.byteswap();
			assert_eq!(dnp, orig);
		}

		#[test]
		fn scalars_swapped() {
			let mut dnp = sample();
			dnp.byteswap();
			assert_eq!(dnp.maxblkid, 0x0102_0304u64.swap_bytes());
			assert_eq!(dnp.datablkszsec, 8u16.swap_bytes());
		}

		/// A free slot byte-swaps to an all-zero image.
		#[test]
		fn free_slot_zeroes() {
			let mut dnp = DnodePhys::zero();
			dnp.maxblkid = 99;
			dnp.byteswap();
			assert!(dnp.is_zero());
		}

		#[test]
		fn whole_block() {
			let mut buf = vec![sample(), DnodePhys::zero(), sample()];
			let orig = buf.clone();
			dnode_buf_byteswap(&mut buf);
			dnode_buf_byteswap(&mut buf);
			assert_eq!(buf, orig);
		}
	}
}
