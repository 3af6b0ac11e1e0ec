//! The weave: per-address-space registry of translated blocks.
//!
//! Blocks are indexed by guest IP in a growable hash and by page in a
//! fixed-size page hash so invalidation can find every block touching
//! a page. Invalidation disconnects blocks and parks them on the
//! jetsam list; actual freeing is deferred to a quiescent point where
//! no dispatch loop holds block references (see [`Weave::reclaim_jetsam`]).

use std::sync::Arc;

use log::trace;
use parking_lot::{Mutex, MutexGuard, RwLock};

use weave_core::block::{Block, BlockRef};
use weave_core::mmu::Mmu;
use weave_core::types::{page_of, Addr, Page, MEM_PAGES};

/// Starting number of IP-hash buckets.
pub const INITIAL_HASH_SIZE: usize = 1 << 10;

/// Number of page-hash buckets (fixed).
pub const PAGE_HASH_SIZE: usize = 1 << 10;

/// One page-hash bucket: blocks starting in the page, and blocks only
/// ending in it.
#[derive(Default)]
struct PageBucket {
    blocks: [Vec<BlockRef>; 2],
}

pub(crate) struct WeaveInner {
    hash: Vec<Vec<BlockRef>>,
    page_hash: Vec<PageBucket>,
    jetsam: Vec<BlockRef>,
    mem_used: usize,
    num_blocks: usize,
}

impl WeaveInner {
    /// Find the block starting exactly at `addr`.
    pub(crate) fn lookup(&self, addr: Addr) -> Option<BlockRef> {
        let bucket = &self.hash[addr as usize % self.hash.len()];
        bucket
            .iter()
            // SAFETY: bucket members are live: the registry lock is
            // held (we have &self through it) and jetsam blocks are
            // never in the hash.
            .find(|r| unsafe { r.get() }.addr == addr)
            .copied()
    }

    /// Register a freshly compiled block.
    pub(crate) fn insert(&mut self, block: Box<Block>) -> BlockRef {
        let r = BlockRef::new(block);
        // SAFETY: just allocated, registry lock held.
        let b = unsafe { r.get() };
        self.mem_used += b.used;
        self.num_blocks += 1;

        let len = self.hash.len();
        self.hash[b.addr as usize % len].push(r);
        self.page_bucket(page_of(b.addr), 0).push(r);
        if page_of(b.addr) != page_of(b.end_addr) {
            self.page_bucket(page_of(b.end_addr), 1).push(r);
        }

        // target an average hash chain length of 1-2
        if self.num_blocks >= self.hash.len() * 2 {
            let new_size = self.hash.len() * 2;
            self.resize_hash(new_size);
        }
        r
    }

    fn page_bucket(&mut self, page: Page, i: usize) -> &mut Vec<BlockRef> {
        &mut self.page_hash[page as usize % PAGE_HASH_SIZE].blocks[i]
    }

    fn resize_hash(&mut self, new_size: usize) {
        trace!(
            "resizing hash to {new_size}, using {} bytes for gadgets",
            self.mem_used
        );
        let mut new_hash: Vec<Vec<BlockRef>> = vec![Vec::new(); new_size];
        for bucket in self.hash.drain(..) {
            for r in bucket {
                // SAFETY: hash members are live, registry lock held.
                let addr = unsafe { r.get() }.addr;
                new_hash[addr as usize % new_size].push(r);
            }
        }
        self.hash = new_hash;
    }

    /// Remove every pointer to the block: IP hash, page buckets, and
    /// both directions of the chain graph. Predecessors get their
    /// target slots restored to the original guest IP before the edge
    /// is dropped. The block itself cannot be freed yet; another
    /// thread may be executing it.
    pub(crate) fn disconnect(&mut self, r: BlockRef) {
        // SAFETY: caller guarantees `r` is live; registry lock held.
        let b = unsafe { r.get() };
        self.mem_used -= b.used;
        self.num_blocks -= 1;

        let len = self.hash.len();
        self.hash[b.addr as usize % len].retain(|x| *x != r);
        self.page_bucket(page_of(b.addr), 0).retain(|x| *x != r);
        self.page_bucket(page_of(b.end_addr), 1).retain(|x| *x != r);

        for i in 0..2 {
            // Drop the outgoing edge: take this block out of its
            // successor's incoming list. A self-chained block is left
            // for the incoming pass below.
            // SAFETY: registry lock held; no overlapping chain borrows.
            let succ = unsafe { b.chain_mut() }.jump_to[i].take();
            if let Some(s) = succ {
                if s != r {
                    unsafe { s.get().chain_mut() }.jumps_from[i].retain(|x| *x != r);
                }
            }
        }
        for i in 0..2 {
            // Unchain every predecessor: restore the patched target
            // slot to the bare guest IP, then drop the edge.
            // SAFETY: registry lock held.
            let preds = std::mem::take(&mut unsafe { b.chain_mut() }.jumps_from[i]);
            for p in preds {
                // SAFETY: chained predecessors are live: freeing a
                // block removes it from every incoming list first.
                let pb = unsafe { p.get() };
                if let Some(slot) = pb.jump_word(i) {
                    slot.store(pb.old_jump_ip[i], std::sync::atomic::Ordering::Relaxed);
                }
                unsafe { pb.chain_mut() }.jump_to[i] = None;
            }
        }
    }

    /// Disconnect and free a block in one step.
    fn block_free(&mut self, r: BlockRef) {
        self.disconnect(r);
        // SAFETY: disconnected and, by caller contract, unreachable
        // from any other thread.
        unsafe { r.free() };
    }

    /// Free everything on the jetsam list. Caller must have
    /// established quiescence.
    fn free_jetsam(&mut self) {
        if !self.jetsam.is_empty() {
            trace!("freeing {} jetsam blocks", self.jetsam.len());
        }
        for r in self.jetsam.drain(..) {
            // SAFETY: jetsam blocks are already disconnected and no
            // dispatch loop is running (quiescent point).
            unsafe { r.free() };
        }
    }

    #[cfg(test)]
    fn hash_size(&self) -> usize {
        self.hash.len()
    }
}

/// The per-address-space registry of translated blocks.
pub struct Weave {
    mmu: Arc<Mmu>,
    pub(crate) inner: Mutex<WeaveInner>,
    /// Held shared by every running dispatch loop, exclusively by
    /// jetsam reclamation: exclusive acquisition is the quiescent
    /// point at which no thread holds block references. Always taken
    /// before the registry lock, never inside it.
    pub(crate) jetsam_lock: RwLock<()>,
}

impl Weave {
    /// Create a weave bound to one address space.
    pub fn new(mmu: Arc<Mmu>) -> Self {
        Self {
            mmu,
            inner: Mutex::new(WeaveInner {
                hash: vec![Vec::new(); INITIAL_HASH_SIZE],
                page_hash: (0..PAGE_HASH_SIZE).map(|_| PageBucket::default()).collect(),
                jetsam: Vec::new(),
                mem_used: 0,
                num_blocks: 0,
            }),
            jetsam_lock: RwLock::new(()),
        }
    }

    /// The address space this weave serves.
    pub fn mmu(&self) -> &Arc<Mmu> {
        &self.mmu
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, WeaveInner> {
        self.inner.lock()
    }

    /// Find the block starting at `ip`.
    pub fn lookup(&self, ip: Addr) -> Option<BlockRef> {
        self.lock().lookup(ip)
    }

    /// Register a compiled block.
    pub fn insert(&self, block: Box<Block>) -> BlockRef {
        self.lock().insert(block)
    }

    /// Disconnect every block overlapping pages `[start, end)` and
    /// park it on the jetsam list. Safe to call while other threads
    /// execute translations from this weave; they keep running any
    /// stale block they already hold until their next dispatch.
    pub fn invalidate_range(&self, start: Page, end: Page) {
        let mut inner = self.lock();
        let mut count = 0usize;
        for page in start..end {
            for i in 0..2 {
                let bucket = &inner.page_hash[page as usize % PAGE_HASH_SIZE].blocks[i];
                let victims: Vec<BlockRef> = bucket
                    .iter()
                    .filter(|r| {
                        // page-hash buckets collide; only blocks
                        // actually on this page are invalidated
                        // SAFETY: bucket members are live, lock held.
                        let b = unsafe { r.get() };
                        page == if i == 0 { page_of(b.addr) } else { page_of(b.end_addr) }
                    })
                    .copied()
                    .collect();
                for r in victims {
                    inner.disconnect(r);
                    // SAFETY: still live; freeing is deferred.
                    unsafe { r.get() }.set_jetsam();
                    inner.jetsam.push(r);
                    count += 1;
                }
            }
        }
        if count > 0 {
            trace!("invalidated {count} blocks in pages {start:#x}..{end:#x}");
        }
    }

    /// Disconnect every block overlapping `page`.
    pub fn invalidate_page(&self, page: Page) {
        self.invalidate_range(page, page + 1);
    }

    /// Disconnect every block in the weave.
    pub fn invalidate_all(&self) {
        self.invalidate_range(0, MEM_PAGES);
    }

    /// Free jetsam blocks once every other executing thread has left
    /// its dispatch loop. Must not be called with the jetsam lock
    /// already held shared by this thread; the dispatch entry point
    /// runs it after releasing its shared hold.
    pub fn reclaim_jetsam(&self) {
        let inner = self.lock();
        if inner.jetsam.is_empty() {
            return;
        }
        drop(inner);
        // Exclusive acquisition waits for every other weave thread to
        // reach this point, so they have all dropped their block
        // pointers.
        let quiesce = self.jetsam_lock.write();
        let mut inner = self.lock();
        inner.free_jetsam();
        drop(quiesce);
    }

    /// Number of live (non-jetsam) blocks.
    pub fn num_blocks(&self) -> usize {
        self.lock().num_blocks
    }

    /// Approximate bytes of translated code in live blocks.
    pub fn mem_used(&self) -> usize {
        self.lock().mem_used
    }

    /// Number of blocks awaiting reclamation.
    pub fn jetsam_len(&self) -> usize {
        self.lock().jetsam.len()
    }

    /// Guest addresses of the blocks chained into `addr`'s block via
    /// slot `i`. Debug/test introspection.
    pub fn incoming_chains(&self, addr: Addr, i: usize) -> Vec<Addr> {
        let inner = self.lock();
        match inner.lookup(addr) {
            // SAFETY: looked up under the registry lock.
            Some(r) => unsafe { r.get().chain() }.jumps_from[i]
                .iter()
                .map(|p| unsafe { p.get() }.addr)
                .collect(),
            None => Vec::new(),
        }
    }

    /// Guest address of the block `addr`'s block has been chained to
    /// via slot `i`, if any. Debug/test introspection.
    pub fn outgoing_chain(&self, addr: Addr, i: usize) -> Option<Addr> {
        let inner = self.lock();
        let r = inner.lookup(addr)?;
        // SAFETY: looked up under the registry lock.
        let succ = unsafe { r.get().chain() }.jump_to[i]?;
        Some(unsafe { succ.get() }.addr)
    }
}

impl Drop for Weave {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        let all: Vec<BlockRef> = inner.hash.iter().flatten().copied().collect();
        for r in all {
            inner.block_free(r);
        }
        inner.free_jetsam();
    }
}
