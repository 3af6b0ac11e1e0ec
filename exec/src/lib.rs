//! Weave execution engine — the per-address-space block registry and
//! the per-thread dispatch loop that drives the
//! lookup → compile → execute cycle, with block chaining and
//! quiescence-based reclamation of invalidated blocks.

pub mod exec_loop;
pub mod frame;
pub mod weave;

pub use exec_loop::{compile, cpu_run_to_interrupt, CACHE_SIZE};
pub use frame::{Frame, RET_CACHE_SIZE};
pub use weave::Weave;

use std::fmt;

use weave_core::block::{Block, GenState};
use weave_core::interrupt::Interrupt;
use weave_core::mmu::Tlb;
use weave_core::types::Addr;

/// The code generator driven by block compilation.
///
/// `compile` calls `gen_start` once, then `gen_step` per guest
/// instruction until the generator ends the block (returns `false`) or
/// the translated span hits the page-bound rule, in which case
/// `gen_exit` emits a trailing exit; `gen_end` finalizes.
pub trait Translator {
    /// Begin a new block at `ip`.
    fn gen_start(ip: Addr) -> GenState {
        GenState::new(ip)
    }

    /// Translate one guest instruction into gadget words. Returns
    /// `false` when the instruction ended the block.
    fn gen_step(state: &mut GenState, tlb: &mut Tlb) -> bool;

    /// Emit a trailing exit to the fall-through IP, unless the block
    /// already ended.
    fn gen_exit(state: &mut GenState);

    /// Finalize the block descriptor.
    fn gen_end(state: GenState) -> Box<Block> {
        state.into_block()
    }
}

/// The block-entry primitive: resumes execution of translated code.
pub trait BlockEntry {
    /// Execute `block` against `frame` until the translated code hands
    /// control back, returning the interrupt it raised (`INT_NONE` for
    /// a plain return to the dispatcher). May mutate `frame.cpu`, the
    /// frame's scratch fields, and chained target slots' referents.
    ///
    /// # Safety
    /// If `block` belongs to a weave, the caller must hold that
    /// weave's jetsam lock in shared mode: execution may follow
    /// chained code pointers into other blocks, which must not be
    /// reclaimed mid-flight.
    unsafe fn enter(block: &Block, frame: &mut Frame, tlb: &mut Tlb) -> Interrupt;
}

/// Counters for one dispatch-loop invocation.
#[derive(Default)]
pub struct ExecStats {
    pub loop_iters: u64,
    // block lookup
    pub cache_hit: u64,
    pub weave_hit: u64,
    pub compiled: u64,
    // chaining
    pub chain_patched: u64,
    pub chain_skipped_jetsam: u64,
    // loop exits
    pub poked: u64,
}

impl fmt::Display for ExecStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "loop iters:     {}", self.loop_iters)?;
        writeln!(f, "  cache hit:    {}", self.cache_hit)?;
        writeln!(f, "  weave hit:    {}", self.weave_hit)?;
        writeln!(f, "  compiled:     {}", self.compiled)?;
        writeln!(f, "chain patched:  {}", self.chain_patched)?;
        writeln!(f, "chain skipped:  {}", self.chain_skipped_jetsam)?;
        writeln!(f, "poked:          {}", self.poked)?;
        Ok(())
    }
}
