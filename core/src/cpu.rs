//! Guest CPU state and the cross-thread poke signal.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::interrupt::{Interrupt, INT_NONE};
use crate::mmu::Mmu;
use crate::types::Addr;

/// Number of general-purpose guest registers.
pub const NUM_REGS: usize = 4;

/// Architectural state of one guest thread.
///
/// The dispatch loop works on a copy embedded in its frame and writes
/// the copy back after every executed block, so this struct is the
/// externally observable state.
#[derive(Clone)]
pub struct CpuState {
    pub eip: Addr,
    pub regs: [u32; NUM_REGS],
    /// Executed-block counter driving the timer budget.
    pub cycle: u64,
    /// Trap flag: run in single-step mode.
    pub tf: bool,
    /// Interrupt code of the last dispatch-loop exit.
    pub trapno: Interrupt,
    mmu: Arc<Mmu>,
    poked: Option<Arc<AtomicBool>>,
}

impl CpuState {
    pub fn new(mmu: Arc<Mmu>) -> Self {
        Self {
            eip: 0,
            regs: [0; NUM_REGS],
            cycle: 0,
            tf: false,
            trapno: INT_NONE,
            mmu,
            poked: None,
        }
    }

    /// The address space this CPU executes in.
    #[inline]
    pub fn mmu(&self) -> &Arc<Mmu> {
        &self.mmu
    }

    /// Bind the poke flag to a private one if nothing has bound it yet.
    /// The dispatch loop does this on entry; CPUs that should share a
    /// wake signal can be bound to the same flag up front.
    pub fn bind_poked(&mut self) -> &Arc<AtomicBool> {
        self.poked
            .get_or_insert_with(|| Arc::new(AtomicBool::new(false)))
    }

    /// Cross-thread handle for poking this CPU. Binds the flag first
    /// if needed; clones of the handle stay valid while the CPU runs.
    pub fn poke_handle(&mut self) -> PokeHandle {
        PokeHandle(self.bind_poked().clone())
    }

    /// Consume a pending poke. Sequentially-consistent exchange so a
    /// poke published on another thread is never missed.
    pub fn consume_poke(&self) -> bool {
        match &self.poked {
            Some(flag) => flag.swap(false, Ordering::SeqCst),
            None => false,
        }
    }
}

/// Cloneable handle that forces `INT_TIMER` on the target CPU's next
/// poke check.
#[derive(Clone)]
pub struct PokeHandle(Arc<AtomicBool>);

impl PokeHandle {
    pub fn poke(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}
