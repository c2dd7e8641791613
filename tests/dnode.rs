use std::{
	sync::{Arc, Barrier},
	thread,
};

use rdmu::{
	BlockPtr, DbufData, Dnode, HoldFlag, ObjectType, Objset, RangeSet, Tag, Tx, BONUS_BLKID,
	DNODE_SHIFT, MAX_BONUSLEN, MAX_INDBLKSHIFT,
};
use rstest::rstest;

const FTAG: Tag = Tag::Caller("test");

fn hold_free(os: &Arc<Objset>, object: u64) -> Arc<Dnode> {
	os.dnode_hold_impl(object, HoldFlag::MustBeFree, FTAG)
		.unwrap()
}

#[test]
fn allocate_and_grow() {
	let os = Objset::new();
	let tx = Tx::new(7);
	let dn = hold_free(&os, 2);

	dn.allocate(ObjectType::PlainFile, 512, 17, ObjectType::Stats, 192, &tx);

	assert_eq!(dn.nblkptr() as usize, 1 + ((MAX_BONUSLEN - 192) >> 4));
	assert_eq!(dn.nblkptr(), 16);
	assert_eq!(dn.nlevels(), 1);
	assert_eq!(dn.datablksz(), 512);
	// an out-of-range indirect shift clamps to the maximum
	assert_eq!(dn.indblkshift() as u32, MAX_INDBLKSHIFT);
	assert_eq!(dn.allocated_txg(), 7);

	let dirty = os.dirty_dnodes(7);
	assert_eq!(dirty.len(), 1);
	assert!(Arc::ptr_eq(&dirty[0], &dn));
	assert_eq!(dn.dirty_blksz(7), 512);

	// marking dirty again in the same txg changes nothing
	dn.setdirty(&tx);
	assert_eq!(os.dirty_dnodes(7).len(), 1);

	os.sync_done(7);
	assert!(!dn.is_dirty(7));
	dn.rele(FTAG);
}

/// Clearing the middle of an interval splits it in two.
#[test]
fn free_range_split() {
	let mut set = RangeSet::new();
	set.insert(100, 50);
	set.clear(120, 10);
	assert_eq!(set.iter().collect::<Vec<_>>(), &[(100, 20), (130, 20)]);
}

#[test]
fn truncate_semantics() {
	let os = Objset::new();
	let tx = Tx::new(12);
	let dn = hold_free(&os, 30);
	dn.allocate(ObjectType::PlainFile, 4096, 0, ObjectType::None, 0, &tx);
	dn.new_blkid(9, &tx);
	assert_eq!(dn.maxblkid(), 9);

	// block 5 exists and is dirty, with live data
	let db = dn.hold_dbuf(0, 5, FTAG);
	db.mark_dirty(&tx);
	match &mut db.state().data {
		DbufData::Bytes(b) => b.fill(0x5a),
		_ => unreachable!(),
	}

	dn.free_range(5 * 4096 + 100, u64::MAX, &tx);

	// the head of the range is zeroed in place
	match &db.state().data {
		DbufData::Bytes(b) => {
			assert!(b[..100].iter().all(|&x| x == 0x5a));
			assert!(b[100..].iter().all(|&x| x == 0));
		}
		_ => unreachable!(),
	}

	// the object now ends at block 5 and the interior is queued
	assert_eq!(dn.maxblkid(), 5);
	assert!(!dn.block_freed(5));
	assert!(dn.block_freed(6));
	assert!(dn.block_freed(1 << 20));

	db.rele(FTAG);
	os.sync_done(12);
	assert!(!dn.block_freed(6));
	dn.rele(FTAG);
}

/// Two threads race to materialize the same cold slot: exactly one
/// handle becomes visible and both callers hold it.
#[test]
fn concurrent_first_hold() {
	let os = Objset::new();
	let barrier = Arc::new(Barrier::new(2));

	let spawn = |tag: &'static str| {
		let os = os.clone();
		let barrier = barrier.clone();
		thread::spawn(move || {
			barrier.wait();
			os.dnode_hold_impl(42, HoldFlag::Any, Tag::Caller(tag))
				.unwrap()
		})
	};
	let t0 = spawn("t0");
	let t1 = spawn("t1");
	let a = t0.join().unwrap();
	let b = t1.join().unwrap();

	assert!(Arc::ptr_eq(&a, &b));
	assert_eq!(a.holds(), 2);

	a.rele(Tag::Caller("t0"));
	b.rele(Tag::Caller("t1"));
	assert_eq!(a.holds(), 0);
}

/// A hold and a matching release leave the count where it started.
#[test]
fn hold_rele_round_trip() {
	let os = Objset::new();
	let dn = os.dnode_hold_impl(17, HoldFlag::Any, FTAG).unwrap();
	assert_eq!(dn.holds(), 1);

	dn.add_ref(Tag::Caller("extra"));
	assert_eq!(dn.holds(), 2);
	dn.rele(Tag::Caller("extra"));
	assert_eq!(dn.holds(), 1);

	dn.rele(FTAG);
	assert_eq!(dn.holds(), 0);
}

/// Paging out the meta-dnode block destroys idle handles; the next
/// hold materializes a fresh one.
#[test]
fn pageout_destroys_idle_handles() {
	let os = Objset::new();
	let old = os.dnode_hold_impl(50, HoldFlag::Any, FTAG).unwrap();
	old.rele(FTAG);

	os.evict_meta_blocks();

	let new = os.dnode_hold_impl(50, HoldFlag::Any, FTAG).unwrap();
	assert!(!Arc::ptr_eq(&old, &new));
	new.rele(FTAG);
}

/// While a handle is held, its meta-dnode block is pinned and
/// survives pageout attempts.
#[test]
fn held_handle_pins_its_block() {
	let os = Objset::new();
	let dn = os.dnode_hold_impl(51, HoldFlag::Any, FTAG).unwrap();

	os.evict_meta_blocks();

	let again = os.dnode_hold_impl(51, HoldFlag::Any, FTAG).unwrap();
	assert!(Arc::ptr_eq(&dn, &again));
	again.rele(FTAG);
	dn.rele(FTAG);
}

#[rstest]
#[case::hole(true, 0, 0)]
#[case::data(false, 0, 3 * 4096)]
fn sparse_scan(#[case] hole: bool, #[case] start: u64, #[case] expect: u64) {
	let os = Objset::new();
	let tx = Tx::new(4);
	let dn = hold_free(&os, 21);
	dn.allocate(ObjectType::PlainFile, 4096, 10, ObjectType::None, 0, &tx);
	os.sync_done(4);

	// two levels, a lone data block at blkid 3
	dn.with_phys_mut(|p| {
		p.nlevels = 2;
		p.maxblkid = 3;
		p.set_blkptr(0, BlockPtr { addr: 1, fill: 1 });
	});
	let l1 = dn.hold_dbuf(1, 0, FTAG);
	match &mut l1.state().data {
		DbufData::Indirect(bps) => bps[3] = BlockPtr { addr: 2, fill: 1 },
		_ => unreachable!(),
	}
	l1.rele(FTAG);

	let mut offset = start;
	dn.next_offset(hole, &mut offset, 1, 1).unwrap();
	assert_eq!(offset, expect);

	dn.rele(FTAG);
}

#[test]
fn reallocate_widens_zero_bonus() {
	let os = Objset::new();
	let dn = hold_free(&os, 40);

	let tx = Tx::new(3);
	dn.allocate(ObjectType::PlainFile, 512, 0, ObjectType::Stats, 192, &tx);
	assert_eq!(dn.nblkptr(), 16);
	os.sync_done(3);

	let tx = Tx::new(5);
	dn.reallocate(ObjectType::Directory, 512, ObjectType::None, 0, &tx);

	// the zero-length bonus is widened so a buffer stays present
	assert_eq!(dn.bonuslen(), 1);
	assert_eq!(dn.nblkptr() as usize, 1 + ((MAX_BONUSLEN - 1) >> 4));
	assert_eq!(dn.kind(), ObjectType::Directory);
	assert_eq!(dn.allocated_txg(), 5);

	let bonus = dn.hold_dbuf_impl(0, BONUS_BLKID, false, FTAG).unwrap();
	assert_eq!(bonus.size(), 1);
	bonus.rele(FTAG);

	os.sync_done(5);
	dn.rele(FTAG);
}

#[test]
fn space_accounting() {
	let os = Objset::new();
	let tx = Tx::new(2);
	let dn = hold_free(&os, 8);
	dn.allocate(ObjectType::PlainFile, 4096, 0, ObjectType::None, 0, &tx);

	// estimates are inflated to the allocator's worst case
	dn.willuse_space(4096, &tx);
	assert_eq!(os.pending_space(), 6 * 4096);
	assert_eq!(tx.space_towrite(), 6 * 4096);

	// actual usage lands on the image in sectors
	dn.diduse_space(8192);
	assert_eq!(dn.with_phys(|p| p.secphys), 16);
	dn.diduse_space(-4096);
	assert_eq!(dn.with_phys(|p| p.secphys), 8);

	os.sync_done(2);
	dn.rele(FTAG);
}

/// Freeing an object routes it from the dirty list to the free list
/// and the slot reads as free again after sync.
#[test]
fn free_then_sync_recycles_the_slot() {
	let os = Objset::new();
	let tx = Tx::new(6);
	let dn = hold_free(&os, 60);
	dn.allocate(ObjectType::PlainFile, 4096, 0, ObjectType::None, 0, &tx);
	dn.free(&tx);

	assert_eq!(dn.free_txg(), 6);
	assert!(os.dirty_dnodes(6).is_empty());
	assert_eq!(os.freed_dnodes(6).len(), 1);

	// a freeing object can no longer be held
	let e = os
		.dnode_hold_impl(60, HoldFlag::Any, Tag::Caller("late"))
		.unwrap_err();
	assert_eq!(e.raw_os_error(), Some(libc::ENOENT));

	os.sync_done(6);
	assert_eq!(dn.kind(), ObjectType::None);
	assert!(dn.with_phys(|p| p.is_zero()));
	dn.rele(FTAG);

	// and the slot is allocatable again
	let tx = Tx::new(8);
	let dn = hold_free(&os, 60);
	dn.allocate(ObjectType::Directory, 512, 0, ObjectType::None, 0, &tx);
	os.sync_done(8);
	dn.rele(FTAG);
}

/// Objects are found by walking the meta-dnode like any other sparse
/// object, one dnode-sized stride at a time.
#[test]
fn object_walk() {
	let os = Objset::new();
	let tx = Tx::new(9);
	for object in [2u64, 7, 11] {
		let dn = hold_free(&os, object);
		dn.allocate(ObjectType::PlainFile, 4096, 0, ObjectType::None, 0, &tx);
		dn.rele(FTAG);
	}
	os.sync_done(9);

	let mdn = os.meta_dnode();
	let mut found = Vec::new();
	let mut offset = 1 << DNODE_SHIFT;
	while mdn
		.next_offset(false, &mut offset, 0, rdmu::DNODES_PER_BLOCK)
		.is_ok()
	{
		found.push(offset >> DNODE_SHIFT);
		offset += 1 << DNODE_SHIFT;
	}
	assert_eq!(found, &[2, 7, 11]);
}
