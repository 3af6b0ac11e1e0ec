//! The per-invocation execution frame.

use weave_core::block::BlockRef;
use weave_core::cpu::CpuState;
use weave_core::types::Addr;

use crate::ExecStats;

/// Entries in the block-entry primitive's return cache.
pub const RET_CACHE_SIZE: usize = 4096;

/// State owned by one dispatch-loop invocation.
///
/// The CPU state is copied in on entry and copied back out after every
/// executed block; everything else dies with the call.
pub struct Frame {
    pub cpu: CpuState,
    /// Scratch address for a two-word value straddling a page.
    pub value_addr: Addr,
    /// Scratch buffer for that value.
    pub value: [u64; 2],
    /// Most recently executed block; drives chaining.
    pub last_block: Option<BlockRef>,
    /// Return-IP → call-gadget-argument map owned by the block-entry
    /// primitive.
    pub ret_cache: Box<[u64]>,
    pub stats: ExecStats,
}

impl Frame {
    pub fn new(cpu: &CpuState) -> Self {
        Self {
            cpu: cpu.clone(),
            value_addr: 0,
            value: [0; 2],
            last_block: None,
            ret_cache: vec![0; RET_CACHE_SIZE].into_boxed_slice(),
            stats: ExecStats::default(),
        }
    }
}
