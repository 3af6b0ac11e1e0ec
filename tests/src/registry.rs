//! Registry properties: insert/lookup, invalidation, rehash, memory
//! accounting.

use weave_core::interrupt::INT_SYSCALL;
use weave_core::types::{page_of, PAGE_SIZE};
use weave_exec::compile;
use weave_gadgets::{isa, Gadgets};

use crate::common::Vm;

#[test]
fn insert_then_lookup_yields_same_block() {
    let vm = Vm::new(4);
    vm.load(0x1000, &[isa::trap(INT_SYSCALL as u16)]);

    let mut tlb = vm.tlb;
    let r = vm.weave.insert(compile::<Gadgets>(0x1000, &mut tlb));
    assert_eq!(vm.weave.lookup(0x1000), Some(r));
    assert_eq!(vm.weave.lookup(0x1004), None);
    assert_eq!(vm.weave.num_blocks(), 1);
    assert!(vm.weave.mem_used() > 0);
}

#[test]
fn invalidated_block_leaves_every_index() {
    let vm = Vm::new(4);
    vm.load(0x1000, &[isa::trap(0)]);

    let mut tlb = vm.tlb;
    let r = vm.weave.insert(compile::<Gadgets>(0x1000, &mut tlb));
    vm.weave.invalidate_page(1);

    assert_eq!(vm.weave.lookup(0x1000), None);
    assert!(unsafe { r.get() }.is_jetsam());
    assert_eq!(vm.weave.num_blocks(), 0);
    assert_eq!(vm.weave.mem_used(), 0);
    assert_eq!(vm.weave.jetsam_len(), 1);
}

#[test]
fn invalidate_all_is_idempotent() {
    let vm = Vm::new(4);
    vm.load(0x1000, &[isa::trap(0)]);
    vm.load(0x2000, &[isa::trap(0)]);

    let mut tlb = vm.tlb;
    vm.weave.insert(compile::<Gadgets>(0x1000, &mut tlb));
    vm.weave.insert(compile::<Gadgets>(0x2000, &mut tlb));

    vm.weave.invalidate_all();
    assert_eq!(vm.weave.jetsam_len(), 2);
    vm.weave.invalidate_all();
    assert_eq!(vm.weave.jetsam_len(), 2);
    assert_eq!(vm.weave.num_blocks(), 0);
}

#[test]
fn invalidation_only_touches_matching_pages() {
    let vm = Vm::new(4);
    vm.load(0x1000, &[isa::trap(0)]);
    vm.load(0x2000, &[isa::trap(0)]);

    let mut tlb = vm.tlb;
    vm.weave.insert(compile::<Gadgets>(0x1000, &mut tlb));
    vm.weave.insert(compile::<Gadgets>(0x2000, &mut tlb));

    vm.weave.invalidate_page(2);
    assert!(vm.weave.lookup(0x1000).is_some());
    assert_eq!(vm.weave.lookup(0x2000), None);
}

#[test]
fn two_page_block_is_invalidated_from_its_end_page() {
    let mut vm = Vm::new(4);
    // NOPs (zeroed memory) from 0x1800 run the generator into the
    // page-bound cut; the block ends on page 2.
    let block = compile::<Gadgets>(0x1800, &mut vm.tlb);
    assert_eq!(page_of(block.addr), 1);
    assert_eq!(page_of(block.end_addr), 2);
    let r = vm.weave.insert(block);

    vm.weave.invalidate_page(2);
    assert_eq!(vm.weave.lookup(0x1800), None);
    assert!(unsafe { r.get() }.is_jetsam());
}

#[test]
fn page_bound_cut_never_spans_three_pages() {
    let mut vm = Vm::new(4);
    let block = compile::<Gadgets>(0x1800, &mut vm.tlb);
    // the generator stops within one maximum instruction length of a
    // full page
    assert!(block.end_addr - block.addr <= PAGE_SIZE);
    assert!(page_of(block.end_addr) - page_of(block.addr) <= 1);
}

#[test]
fn many_blocks_survive_rehash() {
    let vm = Vm::new(16);
    // a trap instruction every 4 bytes over several pages
    let n = 3000u32;
    for k in 0..n {
        vm.load(0x1000 + k * 4, &[isa::trap(0)]);
    }
    let mut tlb = vm.tlb;
    for k in 0..n {
        vm.weave.insert(compile::<Gadgets>(0x1000 + k * 4, &mut tlb));
    }
    assert_eq!(vm.weave.num_blocks(), n as usize);
    for k in 0..n {
        let r = vm.weave.lookup(0x1000 + k * 4).expect("block lost");
        assert_eq!(unsafe { r.get() }.addr, 0x1000 + k * 4);
    }
}
