//! The translated-block descriptor and the generator working state.

use std::cell::UnsafeCell;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::types::Addr;

/// Starting capacity of a block's gadget buffer, in words: roughly the
/// average number of gadgets and parameters in a basic block.
pub const BLOCK_INITIAL_CAPACITY: usize = 16;

/// One translated basic block of guest code.
///
/// The code buffer is a sequence of gadget words produced by the
/// translator. Up to two of those words are outgoing-jump target slots
/// (fall-through in slot 0, taken branch in slot 1); chaining patches
/// them in place from a bare guest IP to the code address of the
/// successor block, and disconnecting the successor restores them.
pub struct Block {
    /// Guest IP this block begins at. Identity within the weave.
    pub addr: Addr,
    /// Guest IP of the last byte translated. May lie on the page after
    /// `addr`'s, never further.
    pub end_addr: Addr,
    /// Bytes of translated code, for memory accounting.
    pub used: usize,

    code: Box<[AtomicU64]>,
    /// Word offsets into `code` of the outgoing-jump target slots.
    pub jump_ip: [Option<u32>; 2],
    /// Original (unchained) contents of those slots, restored when the
    /// chained-to successor is disconnected.
    pub old_jump_ip: [u64; 2],

    is_jetsam: AtomicBool,
    chain: UnsafeCell<ChainState>,
}

/// Chain-graph edges of a block. Mutated only under the weave lock.
#[derive(Default)]
pub struct ChainState {
    /// Predecessor blocks whose slot `i` currently points into this
    /// block's code.
    pub jumps_from: [Vec<BlockRef>; 2],
    /// Successor this block's slot `i` has been patched to, if any.
    pub jump_to: [Option<BlockRef>; 2],
}

// SAFETY: `code` words are atomics; `is_jetsam` is atomic; `chain` is
// only accessed under the owning weave's registry lock (see
// `Block::chain`/`chain_mut`); the remaining fields are immutable after
// construction.
unsafe impl Send for Block {}
unsafe impl Sync for Block {}

impl Block {
    /// The gadget words of this block.
    #[inline]
    pub fn code(&self) -> &[AtomicU64] {
        &self.code
    }

    /// Raw pointer to the first gadget word. This is the value a
    /// chained predecessor's target slot holds.
    #[inline]
    pub fn code_ptr(&self) -> *const AtomicU64 {
        self.code.as_ptr()
    }

    /// The outgoing-jump target slot `i`, if the block has one.
    #[inline]
    pub fn jump_word(&self, i: usize) -> Option<&AtomicU64> {
        self.jump_ip[i].map(|off| &self.code[off as usize])
    }

    /// Current contents of target slot `i`.
    pub fn jump_word_value(&self, i: usize) -> Option<u64> {
        self.jump_word(i).map(|w| w.load(Ordering::Relaxed))
    }

    /// Whether the block has been disconnected from the registry and
    /// awaits reclamation.
    #[inline]
    pub fn is_jetsam(&self) -> bool {
        self.is_jetsam.load(Ordering::Acquire)
    }

    /// Flag the block as jetsam. Called under the weave lock after
    /// disconnecting it; no new pointers to the block may be minted
    /// once this is set.
    pub fn set_jetsam(&self) {
        self.is_jetsam.store(true, Ordering::Release);
    }

    /// Shared view of the chain edges.
    ///
    /// # Safety
    /// Caller must hold the owning weave's registry lock.
    pub unsafe fn chain(&self) -> &ChainState {
        &*self.chain.get()
    }

    /// Mutable view of the chain edges.
    ///
    /// # Safety
    /// Caller must hold the owning weave's registry lock, and must not
    /// overlap this borrow with another `chain`/`chain_mut` borrow of
    /// the same block.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn chain_mut(&self) -> &mut ChainState {
        &mut *self.chain.get()
    }
}

/// Reference to a heap-allocated [`Block`].
///
/// Blocks are owned collectively by the weave registry: a block is
/// freed only by weave teardown or by jetsam reclamation at a
/// quiescent point, which is what makes holding these across lock
/// boundaries sound.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct BlockRef(NonNull<Block>);

// SAFETY: Block is Send + Sync; the jetsam protocol guarantees the
// pointee is not freed while any thread may still dereference it.
unsafe impl Send for BlockRef {}
unsafe impl Sync for BlockRef {}

impl BlockRef {
    /// Move a freshly generated block to the heap and take its address.
    pub fn new(block: Box<Block>) -> Self {
        Self(NonNull::from(Box::leak(block)))
    }

    /// Dereference the block.
    ///
    /// # Safety
    /// The block must not have been freed: the caller either holds the
    /// weave's jetsam lock in shared mode (dispatch loop), holds the
    /// registry lock over a block it just looked up, or otherwise
    /// knows no reclamation can run.
    #[inline]
    pub unsafe fn get<'a>(self) -> &'a Block {
        self.0.as_ref()
    }

    /// Free the block's storage.
    ///
    /// # Safety
    /// The block must be disconnected, no thread may still hold a
    /// dereferenceable copy of this reference, and it must not be
    /// freed twice.
    pub unsafe fn free(self) {
        drop(Box::from_raw(self.0.as_ptr()));
    }
}

/// Working state of the code generator while it builds one block.
///
/// `gen_start` creates it, `gen_step` appends gadget words one guest
/// instruction at a time, `gen_exit`/block-ending instructions mark it
/// finished, and `gen_end` turns it into a [`Block`].
pub struct GenState {
    /// Guest IP the block starts at.
    pub start_ip: Addr,
    /// Guest IP of the next instruction to translate. Advanced by
    /// `gen_step`; one past the last translated byte once finished.
    pub ip: Addr,
    code: Vec<u64>,
    jump_ip: [Option<u32>; 2],
    done: bool,
}

impl GenState {
    pub fn new(ip: Addr) -> Self {
        Self {
            start_ip: ip,
            ip,
            code: Vec::with_capacity(BLOCK_INITIAL_CAPACITY),
            jump_ip: [None; 2],
            done: false,
        }
    }

    /// Append one gadget word, returning its offset.
    pub fn push(&mut self, word: u64) -> u32 {
        let off = self.code.len() as u32;
        self.code.push(word);
        off
    }

    /// Register the word at `off` as the outgoing-jump target slot `i`.
    pub fn set_jump_slot(&mut self, i: usize, off: u32) {
        assert!(i < 2);
        assert!((off as usize) < self.code.len());
        self.jump_ip[i] = Some(off);
    }

    /// Mark the block as ended by a block-terminating instruction.
    pub fn finish(&mut self) {
        self.done = true;
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Finalize into a block descriptor.
    pub fn into_block(self) -> Box<Block> {
        assert!(self.done, "generator did not terminate the block");
        let used = self.code.capacity() * std::mem::size_of::<u64>();
        let old_jump_ip = [0, 1].map(|i| {
            self.jump_ip[i]
                .map(|off| self.code[off as usize])
                .unwrap_or(0)
        });
        Box::new(Block {
            addr: self.start_ip,
            end_addr: self.ip - 1,
            used,
            code: self.code.into_iter().map(AtomicU64::new).collect(),
            jump_ip: self.jump_ip,
            old_jump_ip,
            is_jetsam: AtomicBool::new(false),
            chain: UnsafeCell::new(ChainState::default()),
        })
    }
}
