//! Weave core types — guest addresses, interrupt codes, the block
//! descriptor, CPU state, and the MMU/TLB collaborators.
//!
//! The weave itself (the per-address-space block registry) and the
//! dispatch loop that drives it live in the `weave-exec` crate.

pub mod block;
pub mod cpu;
pub mod interrupt;
pub mod mmu;
pub mod types;

pub use block::{Block, BlockRef, GenState, BLOCK_INITIAL_CAPACITY};
pub use cpu::{CpuState, PokeHandle, NUM_REGS};
pub use interrupt::Interrupt;
pub use mmu::{MemoryFault, Mmu, Tlb};
pub use types::{page_of, Addr, Page, MEM_PAGES, PAGE_BITS, PAGE_SIZE};
