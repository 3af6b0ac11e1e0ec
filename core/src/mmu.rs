//! Guest memory and the per-thread fetch TLB.
//!
//! This is the minimal address-space collaborator the translator
//! needs: flat guest memory plus a direct-mapped cache of page checks.
//! Rewriting or unmapping guest code goes through `write_bytes`
//! followed by an explicit weave invalidation by the caller.

use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;

use crate::types::{page_of, Addr, Page, OFFSET_MASK, PAGE_SIZE};

/// Failed guest memory access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MemoryFault {
    #[error("unmapped guest address {addr:#010x}")]
    Unmapped { addr: Addr },
}

/// One guest address space.
pub struct Mmu {
    mem: RwLock<Box<[u8]>>,
}

impl Mmu {
    /// Create an address space of `pages` zeroed guest pages starting
    /// at address 0.
    pub fn new(pages: usize) -> Arc<Self> {
        Arc::new(Self {
            mem: RwLock::new(vec![0; pages * PAGE_SIZE as usize].into_boxed_slice()),
        })
    }

    /// Mapped size in bytes.
    pub fn size(&self) -> usize {
        self.mem.read().len()
    }

    /// Whether `page` is mapped.
    pub fn check_page(&self, page: Page) -> Result<(), MemoryFault> {
        let start = (page as u64) << crate::types::PAGE_BITS;
        if start >= self.mem.read().len() as u64 {
            return Err(MemoryFault::Unmapped {
                addr: start as Addr,
            });
        }
        Ok(())
    }

    /// Little-endian 4-byte read. May straddle a page boundary.
    pub fn read_u32(&self, addr: Addr) -> Result<u32, MemoryFault> {
        let mem = self.mem.read();
        let start = addr as usize;
        let end = start.checked_add(4).filter(|&e| e <= mem.len());
        match end {
            Some(end) => {
                let mut bytes = [0u8; 4];
                bytes.copy_from_slice(&mem[start..end]);
                Ok(u32::from_le_bytes(bytes))
            }
            None => Err(MemoryFault::Unmapped { addr }),
        }
    }

    /// Write raw bytes into guest memory. The caller is responsible
    /// for invalidating any weave pages this touches.
    pub fn write_bytes(&self, addr: Addr, bytes: &[u8]) -> Result<(), MemoryFault> {
        let mut mem = self.mem.write();
        let start = addr as usize;
        let end = start
            .checked_add(bytes.len())
            .filter(|&e| e <= mem.len())
            .ok_or(MemoryFault::Unmapped { addr })?;
        mem[start..end].copy_from_slice(bytes);
        Ok(())
    }
}

/// Entries in a TLB.
pub const TLB_SIZE: usize = 64;

/// Per-thread direct-mapped cache of page checks over one MMU.
///
/// Each dispatch call refreshes it against the CPU's address space
/// before any fetch goes through.
pub struct Tlb {
    mmu: Arc<Mmu>,
    entries: Box<[Option<Page>; TLB_SIZE]>,
}

impl Tlb {
    pub fn new(mmu: Arc<Mmu>) -> Self {
        Self {
            mmu,
            entries: Box::new([None; TLB_SIZE]),
        }
    }

    /// Drop all cached translations and rebind to `mmu`.
    pub fn refresh(&mut self, mmu: &Arc<Mmu>) {
        if !Arc::ptr_eq(&self.mmu, mmu) {
            self.mmu = mmu.clone();
        }
        self.entries.fill(None);
    }

    fn check(&mut self, page: Page) -> Result<(), MemoryFault> {
        let idx = page as usize % TLB_SIZE;
        if self.entries[idx] != Some(page) {
            self.mmu.check_page(page)?;
            self.entries[idx] = Some(page);
        }
        Ok(())
    }

    /// Fetch one 4-byte guest instruction word.
    pub fn fetch_u32(&mut self, addr: Addr) -> Result<u32, MemoryFault> {
        self.check(page_of(addr))?;
        if addr & OFFSET_MASK > PAGE_SIZE - 4 {
            // fetch straddles into the next page
            self.check(page_of(addr) + 1)?;
        }
        self.mmu.read_u32(addr)
    }
}
