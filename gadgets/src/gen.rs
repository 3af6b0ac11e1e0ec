//! Lowering guest instructions to gadget words.

use weave_core::block::GenState;
use weave_core::cpu::NUM_REGS;
use weave_core::interrupt::{INT_PAGEFAULT, INT_UNDEFINED};
use weave_core::mmu::Tlb;
use weave_core::types::Addr;
use weave_exec::Translator;

use crate::gadget;
use crate::isa::{self, INSN_LEN};
use crate::Gadgets;

/// Emit a `TRAP` gadget and end the block.
fn emit_trap(state: &mut GenState, code: i32, ip: Addr) {
    state.push(gadget::TRAP);
    state.push(code as u64);
    state.push(u64::from(ip));
    state.finish();
}

/// Emit a terminal jump whose target word at `target` becomes jump
/// slot `slot`.
fn emit_jump_slot(state: &mut GenState, slot: usize, target: Addr) {
    let off = state.push(u64::from(target));
    state.set_jump_slot(slot, off);
}

impl Translator for Gadgets {
    fn gen_start(ip: Addr) -> GenState {
        let mut state = GenState::new(ip);
        state.push(gadget::ENTER);
        state.push(u64::from(ip));
        state
    }

    fn gen_step(state: &mut GenState, tlb: &mut Tlb) -> bool {
        let ip = state.ip;
        let fetched = tlb.fetch_u32(ip);
        state.ip = ip.wrapping_add(INSN_LEN);
        let insn = match fetched {
            Ok(insn) => insn,
            Err(fault) => {
                log::trace!("{ip:#010x} --- {fault}");
                emit_trap(state, INT_PAGEFAULT, ip);
                return false;
            }
        };

        let (op, reg, imm) = isa::decode(insn);
        match op {
            // a register field out of range decodes as undefined
            isa::OP_MOVI | isa::OP_ADDI | isa::OP_BRNZ
                if usize::from(reg) >= NUM_REGS =>
            {
                emit_trap(state, INT_UNDEFINED, ip);
                false
            }
            isa::OP_NOP => true,
            isa::OP_MOVI => {
                state.push(gadget::MOVI);
                state.push(u64::from(reg));
                state.push(u64::from(imm));
                true
            }
            isa::OP_ADDI => {
                state.push(gadget::ADDI);
                state.push(u64::from(reg));
                state.push(u64::from(imm as i16 as i32 as u32));
                true
            }
            isa::OP_JMP => {
                state.push(gadget::JMP);
                emit_jump_slot(state, 0, isa::rel_target(ip, imm));
                state.finish();
                false
            }
            isa::OP_BRNZ => {
                state.push(gadget::BRNZ);
                state.push(u64::from(reg));
                emit_jump_slot(state, 1, isa::rel_target(ip, imm));
                emit_jump_slot(state, 0, ip.wrapping_add(INSN_LEN));
                state.finish();
                false
            }
            isa::OP_TRAP => {
                emit_trap(state, i32::from(imm), ip);
                false
            }
            _ => {
                emit_trap(state, INT_UNDEFINED, ip);
                false
            }
        }
    }

    fn gen_exit(state: &mut GenState) {
        if state.is_done() {
            return;
        }
        let fall = state.ip;
        state.push(gadget::JMP);
        emit_jump_slot(state, 0, fall);
        state.finish();
    }
}
