//! Dispatch-loop scenarios: interrupts, chaining, invalidation under
//! execution, timers, single-step.

use weave_core::interrupt::{INT_DEBUG, INT_PAGEFAULT, INT_SYSCALL, INT_TIMER};
use weave_gadgets::isa;

use crate::common::Vm;

#[test]
fn single_block_single_interrupt() {
    let mut vm = Vm::new(4);
    vm.load(0x1000, &[isa::movi(0, 7), isa::trap(INT_SYSCALL as u16)]);
    vm.cpu.eip = 0x1000;

    let interrupt = vm.run();
    assert_eq!(interrupt, INT_SYSCALL);
    assert_eq!(vm.cpu.trapno, INT_SYSCALL);
    assert_eq!(vm.cpu.regs[0], 7);
    assert_eq!(vm.weave.num_blocks(), 1);
}

#[test]
fn fall_through_blocks_get_chained() {
    let mut vm = Vm::new(4);
    // A: branch never taken, falls through into B on the next page
    vm.load(0x1ffc, &[isa::brnz(3, 0x40)]);
    vm.load(0x2000, &[isa::trap(INT_SYSCALL as u16)]);
    vm.cpu.eip = 0x1ffc;

    assert_eq!(vm.run(), INT_SYSCALL);

    // A's fall-through slot now points into B's code ...
    let a = vm.weave.lookup(0x1ffc).unwrap();
    let a = unsafe { a.get() };
    assert_eq!(a.old_jump_ip[0], 0x2000);
    assert!(a.jump_word_value(0).unwrap() > u64::from(u32::MAX));
    // ... and both directions of the edge are recorded
    assert_eq!(vm.weave.outgoing_chain(0x1ffc, 0), Some(0x2000));
    assert_eq!(vm.weave.incoming_chains(0x2000, 0), vec![0x1ffc]);
    // the taken slot still holds its bare guest IP
    assert_eq!(a.jump_word_value(1), Some(0x1ffc + 0x40));
}

#[test]
fn invalidation_unchains_and_recompiles() {
    let mut vm = Vm::new(4);
    vm.load(0x1ffc, &[isa::brnz(3, 0x40)]);
    vm.load(0x2000, &[isa::trap(INT_SYSCALL as u16)]);
    vm.cpu.eip = 0x1ffc;
    assert_eq!(vm.run(), INT_SYSCALL);
    assert_eq!(vm.weave.num_blocks(), 2);

    // invalidating B's page disconnects B and restores A's slot
    vm.weave.invalidate_page(2);
    assert_eq!(vm.weave.lookup(0x2000), None);
    assert_eq!(vm.weave.jetsam_len(), 1);
    let a = vm.weave.lookup(0x1ffc).unwrap();
    let a = unsafe { a.get() };
    assert_eq!(a.jump_word_value(0), Some(a.old_jump_ip[0]));
    assert_eq!(a.old_jump_ip[0], 0x2000);
    assert_eq!(vm.weave.outgoing_chain(0x1ffc, 0), None);

    // the next run recompiles B, re-chains, and reclaims the carcass
    vm.cpu.eip = 0x1ffc;
    assert_eq!(vm.run(), INT_SYSCALL);
    assert_eq!(vm.weave.num_blocks(), 2);
    assert_eq!(vm.weave.jetsam_len(), 0);
    assert_eq!(vm.weave.outgoing_chain(0x1ffc, 0), Some(0x2000));
}

#[test]
fn self_loop_hits_the_timer_budget() {
    let mut vm = Vm::new(4);
    vm.load(0x1000, &[isa::jmp(0)]);
    vm.cpu.eip = 0x1000;

    assert_eq!(vm.run(), INT_TIMER);
    assert_eq!(vm.cpu.trapno, INT_TIMER);
    // 1024 cycles of budget plus the dispatch loop's own increment
    assert_eq!(vm.cpu.cycle, 1025);
    assert_eq!(vm.cpu.eip, 0x1000);
    // the loop chained the block to itself on its second iteration
    assert_eq!(vm.weave.outgoing_chain(0x1000, 0), Some(0x1000));
    assert_eq!(vm.weave.incoming_chains(0x1000, 0), vec![0x1000]);
}

#[test]
fn poke_interrupts_a_chained_loop() {
    let mut vm = Vm::new(4);
    vm.load(0x1000, &[isa::jmp(0)]);
    vm.cpu.eip = 0x1000;
    assert_eq!(vm.run(), INT_TIMER);

    let cycle = vm.cpu.cycle;
    vm.cpu.poke_handle().poke();
    assert_eq!(vm.run(), INT_TIMER);
    // the poke fired on the first edge crossing, not the full budget
    assert!(vm.cpu.cycle - cycle < 4);
}

#[test]
fn single_step_forces_debug() {
    let mut vm = Vm::new(4);
    vm.load(0x1000, &[isa::movi(1, 3), isa::trap(INT_SYSCALL as u16)]);
    vm.cpu.eip = 0x1000;
    vm.cpu.tf = true;

    assert_eq!(vm.run(), INT_DEBUG);
    assert_eq!(vm.cpu.eip, 0x1004);
    assert_eq!(vm.cpu.regs[1], 3);
    // throwaway block: nothing was inserted
    assert_eq!(vm.weave.num_blocks(), 0);

    // stepping the trap instruction reports the trap, not DEBUG
    assert_eq!(vm.run(), INT_SYSCALL);
    assert_eq!(vm.cpu.eip, 0x1004);
}

#[test]
fn fetch_from_unmapped_page_faults() {
    let mut vm = Vm::new(2);
    vm.cpu.eip = 0x2000;
    assert_eq!(vm.run(), INT_PAGEFAULT);
    assert_eq!(vm.cpu.eip, 0x2000);
}
