//! The block-entry primitive: a threaded-code interpreter over gadget
//! words.

use std::sync::atomic::{AtomicU64, Ordering};

use weave_core::block::Block;
use weave_core::interrupt::{Interrupt, INT_NONE, INT_TIMER, TIMER_INTERVAL};
use weave_core::mmu::Tlb;
use weave_core::types::Addr;
use weave_exec::{BlockEntry, Frame};

use crate::gadget;
use crate::Gadgets;

/// Where control goes after reading a jump-target slot.
enum Flow {
    /// Hand `interrupt` back to the dispatch loop.
    Exit(Interrupt),
    /// Keep executing at a chained successor's code.
    Chain(*const AtomicU64),
}

#[inline]
unsafe fn read_word(cursor: &mut *const AtomicU64) -> u64 {
    let word = (**cursor).load(Ordering::Relaxed);
    *cursor = cursor.add(1);
    word
}

/// Resolve the target word in `slot`.
///
/// An unchained slot holds a bare guest IP; execution returns to the
/// dispatcher. A chained slot holds the successor's code address;
/// execution continues there without returning. Crossing a chained
/// edge consumes a cycle and performs the poke and timer checks the
/// dispatcher would otherwise run, so even a fully chained guest loop
/// stays interruptible.
unsafe fn follow(slot: *const AtomicU64, frame: &mut Frame) -> Flow {
    let target = (*slot).load(Ordering::Relaxed);
    if target <= u64::from(u32::MAX) {
        frame.cpu.eip = target as Addr;
        return Flow::Exit(INT_NONE);
    }

    let next = target as usize as *const AtomicU64;
    // every block starts with an ENTER header carrying its guest IP
    debug_assert_eq!((*next).load(Ordering::Relaxed), gadget::ENTER);
    let next_ip = (*next.add(1)).load(Ordering::Relaxed) as Addr;

    frame.cpu.cycle += 1;
    if frame.cpu.consume_poke() || frame.cpu.cycle % TIMER_INTERVAL == 0 {
        frame.cpu.eip = next_ip;
        return Flow::Exit(INT_TIMER);
    }
    Flow::Chain(next)
}

impl BlockEntry for Gadgets {
    unsafe fn enter(block: &Block, frame: &mut Frame, _tlb: &mut Tlb) -> Interrupt {
        let mut cursor = block.code_ptr();
        loop {
            match read_word(&mut cursor) {
                gadget::ENTER => {
                    frame.cpu.eip = read_word(&mut cursor) as Addr;
                }
                gadget::MOVI => {
                    let reg = read_word(&mut cursor) as usize;
                    frame.cpu.regs[reg] = read_word(&mut cursor) as u32;
                }
                gadget::ADDI => {
                    let reg = read_word(&mut cursor) as usize;
                    let imm = read_word(&mut cursor) as u32;
                    frame.cpu.regs[reg] = frame.cpu.regs[reg].wrapping_add(imm);
                }
                gadget::JMP => match follow(cursor, frame) {
                    Flow::Exit(interrupt) => return interrupt,
                    Flow::Chain(next) => cursor = next,
                },
                gadget::BRNZ => {
                    let reg = read_word(&mut cursor) as usize;
                    let taken_slot = cursor;
                    let fall_slot = cursor.add(1);
                    let slot = if frame.cpu.regs[reg] != 0 {
                        taken_slot
                    } else {
                        fall_slot
                    };
                    match follow(slot, frame) {
                        Flow::Exit(interrupt) => return interrupt,
                        Flow::Chain(next) => cursor = next,
                    }
                }
                gadget::TRAP => {
                    let code = read_word(&mut cursor) as Interrupt;
                    frame.cpu.eip = read_word(&mut cursor) as Addr;
                    return code;
                }
                word => unreachable!("corrupt gadget stream: {word:#x}"),
            }
        }
    }
}
