//! The per-thread dispatch loop.
//!
//! Drives the lookup → compile → execute cycle against a weave until
//! the translated code raises an interrupt, then performs one
//! quiescent reclamation check before handing the interrupt back.

use std::sync::Arc;

use log::trace;

use weave_core::block::{Block, BlockRef};
use weave_core::cpu::CpuState;
use weave_core::interrupt::{Interrupt, INT_DEBUG, INT_NONE, INT_TIMER, TIMER_INTERVAL};
use weave_core::mmu::Tlb;
use weave_core::types::{Addr, PAGE_SIZE};

use crate::frame::Frame;
use crate::weave::Weave;
use crate::{BlockEntry, ExecStats, Translator};

/// Slots in the per-invocation block cache.
pub const CACHE_SIZE: usize = 1 << 10;

#[inline]
fn cache_index(ip: Addr) -> usize {
    ((ip ^ (ip >> 12)) as usize) % CACHE_SIZE
}

/// Compile one block starting at `ip`.
///
/// Steps the generator until it ends the block on its own or the
/// translated span comes within one maximum instruction length of a
/// full page, which bounds every block to at most two consecutive
/// pages.
pub fn compile<T: Translator>(ip: Addr, tlb: &mut Tlb) -> Box<Block> {
    trace!("{ip:#010x} --- compiling");
    let mut state = T::gen_start(ip);
    loop {
        if !T::gen_step(&mut state, tlb) {
            break;
        }
        if state.ip - ip >= PAGE_SIZE - 15 {
            T::gen_exit(&mut state);
            break;
        }
    }
    let block = T::gen_end(state);
    assert!(block.end_addr - block.addr <= PAGE_SIZE);
    block
}

/// Run `cpu` until any interrupt fires; the interrupt is returned and
/// stored in `cpu.trapno`. `weave` must be the registry bound to the
/// CPU's address space.
pub fn cpu_run_to_interrupt<B>(weave: &Weave, cpu: &mut CpuState, tlb: &mut Tlb) -> Interrupt
where
    B: Translator + BlockEntry,
{
    cpu.bind_poked();
    tlb.refresh(cpu.mmu());
    let interrupt = if cpu.tf {
        cpu_single_step::<B>(cpu, tlb)
    } else {
        cpu_step_to_interrupt::<B>(weave, cpu, tlb)
    };
    cpu.trapno = interrupt;

    weave.reclaim_jetsam();
    interrupt
}

fn cpu_step_to_interrupt<B>(weave: &Weave, cpu: &mut CpuState, tlb: &mut Tlb) -> Interrupt
where
    B: Translator + BlockEntry,
{
    assert!(
        Arc::ptr_eq(weave.mmu(), cpu.mmu()),
        "weave bound to a different address space"
    );
    let reader = weave.jetsam_lock.read();

    let mut cache: Box<[Option<BlockRef>]> = vec![None; CACHE_SIZE].into_boxed_slice();
    let mut frame = Frame::new(cpu);

    let mut interrupt = INT_NONE;
    while interrupt == INT_NONE {
        let ip = frame.cpu.eip;
        let idx = cache_index(ip);
        // SAFETY: cached references cannot be freed while this thread
        // holds the jetsam lock shared; a stale (jetsam) entry is
        // still executable and gets overwritten on the next miss.
        let mut block = match cache[idx] {
            Some(r) if unsafe { r.get() }.addr == ip => {
                frame.stats.cache_hit += 1;
                Some(r)
            }
            _ => None,
        };
        if block.is_none() {
            let mut inner = weave.lock();
            let r = match inner.lookup(ip) {
                Some(r) => {
                    trace!("{ip:#010x} --- missed cache");
                    frame.stats.weave_hit += 1;
                    r
                }
                None => {
                    frame.stats.compiled += 1;
                    inner.insert(compile::<B>(ip, tlb))
                }
            };
            cache[idx] = Some(r);
            block = Some(r);
        }
        let block = block.unwrap();

        if let Some(last) = frame.last_block {
            // SAFETY: held in the frame under the shared jetsam lock.
            let lb = unsafe { last.get() };
            if lb.jump_ip[0].is_some() || lb.jump_ip[1].is_some() {
                let inner = weave.lock();
                chain_blocks(&*inner, last, block, &mut frame.stats);
                drop(inner);
            }
        }
        frame.last_block = Some(block);

        // The block may be jetsam by now; that is fine, it cannot be
        // freed until every thread on this weave stops executing.
        // SAFETY: shared jetsam lock held for the whole loop.
        interrupt = unsafe { B::enter(block.get(), &mut frame, tlb) };

        if interrupt == INT_NONE && frame.cpu.consume_poke() {
            frame.stats.poked += 1;
            interrupt = INT_TIMER;
        }
        frame.cpu.cycle += 1;
        if interrupt == INT_NONE && frame.cpu.cycle % TIMER_INTERVAL == 0 {
            interrupt = INT_TIMER;
        }
        *cpu = frame.cpu.clone();
        frame.stats.loop_iters += 1;
    }

    trace!("dispatch exit {interrupt}:\n{}", frame.stats);
    drop(frame);
    drop(cache);
    drop(reader);
    interrupt
}

/// Patch the last executed block to jump straight into `next` wherever
/// one of its target slots still holds `next`'s guest IP.
///
/// Holding the registry guard is what makes the chain-state access
/// sound; taking it by reference keeps the requirement in the
/// signature.
fn chain_blocks(
    _registry: &crate::weave::WeaveInner,
    last: BlockRef,
    next: BlockRef,
    stats: &mut ExecStats,
) {
    // SAFETY: both ends are held by the running frame (shared jetsam
    // lock) or were just looked up under the registry lock.
    let lb = unsafe { last.get() };
    let nb = unsafe { next.get() };
    // No new pointers may be minted to a jetsam block; it is assumed
    // to have none left.
    if lb.is_jetsam() || nb.is_jetsam() {
        stats.chain_skipped_jetsam += 1;
        return;
    }
    for i in 0..2 {
        let Some(slot) = lb.jump_word(i) else { continue };
        // SAFETY: registry lock held (guard in scope).
        if unsafe { lb.chain() }.jump_to[i].is_some() {
            // already chained; the slot no longer holds a bare IP
            continue;
        }
        let word = slot.load(std::sync::atomic::Ordering::Relaxed);
        if word & 0xffff_ffff != u64::from(nb.addr) {
            continue;
        }
        let target = nb.code_ptr() as u64;
        // a chained word is told apart from a guest IP by exceeding
        // 32 bits; holds on the 64-bit hosts this crate targets
        debug_assert!(target > u64::from(u32::MAX));
        slot.store(target, std::sync::atomic::Ordering::Relaxed);
        // SAFETY: registry lock held; borrows do not overlap.
        unsafe { nb.chain_mut() }.jumps_from[i].push(last);
        unsafe { lb.chain_mut() }.jump_to[i] = Some(next);
        stats.chain_patched += 1;
    }
}

/// Trap-flag mode: compile exactly one instruction as a throwaway
/// block, run it once, and force `INT_DEBUG` if nothing else fired.
fn cpu_single_step<B>(cpu: &mut CpuState, tlb: &mut Tlb) -> Interrupt
where
    B: Translator + BlockEntry,
{
    let mut state = B::gen_start(cpu.eip);
    B::gen_step(&mut state, tlb);
    B::gen_exit(&mut state);
    let block = B::gen_end(state);

    let mut frame = Frame::new(cpu);
    // SAFETY: the block was never inserted into a weave, so it has no
    // chained edges and execution cannot leave it; no jetsam lock is
    // needed.
    let interrupt = unsafe { B::enter(&block, &mut frame, tlb) };
    *cpu = frame.cpu.clone();
    if interrupt == INT_NONE {
        INT_DEBUG
    } else {
        interrupt
    }
}
