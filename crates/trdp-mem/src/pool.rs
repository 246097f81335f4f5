use std::sync::Mutex;

use thiserror::Error;
use tracing::{debug, warn};

/// Number of pre-defined block size classes.
pub const NUM_CLASSES: usize = 15;

/// Block size ladder. Requests round up to the smallest class that fits;
/// anything above the top class is refused.
const CLASS_SIZES: [u32; NUM_CLASSES] = [
    48, 72, 128, 180, 256, 512, 1024, 1480, 2048, 4096, 8192, 16384, 32768, 65536, 131072,
];

#[derive(Error, Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum MemError {
    #[error("pool exhausted or request above largest class")]
    Exhausted,
    #[error("invalid argument")]
    Param,
    #[error("block reference is freed or unknown")]
    Stale,
}

/// Handle to one allocated block. Plain indices, cheap to copy; the pool
/// detects use after free via the slot's zeroed length field.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct BlockRef {
    class: u8,
    idx: u32,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ClassStats {
    pub block_size: u32,
    pub used: u32,
    pub free: u32,
    pub preallocated: u32,
}

/// Snapshot of pool occupancy. `free` is the arena area not held by live
/// blocks; blocks parked on a free list still count as free even though they
/// only satisfy requests of their own class.
#[derive(Copy, Clone, Debug, Default)]
pub struct MemStats {
    pub total: usize,
    pub free: usize,
    pub min_free_ever: usize,
    pub alloc_count: u64,
    pub alloc_errors: u64,
    pub free_errors: u64,
    pub per_class: [ClassStats; NUM_CLASSES],
}

struct Slot {
    buf: Box<[u8]>,
    /// Logical size of the live allocation; 0 marks the slot free.
    len: u32,
}

struct Class {
    size: u32,
    slots: Vec<Slot>,
    free: Vec<u32>,
    preallocated: u32,
}

struct Inner {
    classes: [Class; NUM_CLASSES],
    /// Budget in bytes; 0 delegates to the process heap (unbounded).
    arena: usize,
    /// Arena bytes carved into blocks so far. Blocks return to their class
    /// free list, never to the unfragmented area.
    in_use: usize,
    min_free_ever: usize,
    alloc_count: u64,
    alloc_errors: u64,
    free_errors: u64,
}

/// Fixed-size-class pool. Thread-safe behind its own mutex, independent of
/// any session lock, so one pool can back several sessions.
pub struct BlockPool {
    inner: Mutex<Inner>,
}

impl BlockPool {
    /// Create a pool with an `arena_bytes` budget (0 = heap-delegated) and a
    /// per-class pre-fragmentation request. Pre-fragmentation is silently
    /// disabled when it would consume more than half of the arena.
    pub fn new(arena_bytes: usize, prealloc: &[u32; NUM_CLASSES]) -> Self {
        let mut inner = Inner {
            classes: std::array::from_fn(|i| Class {
                size: CLASS_SIZES[i],
                slots: Vec::new(),
                free: Vec::new(),
                preallocated: 0,
            }),
            arena: arena_bytes,
            in_use: 0,
            min_free_ever: arena_bytes,
            alloc_count: 0,
            alloc_errors: 0,
            free_errors: 0,
        };

        let requested: usize =
            prealloc.iter().zip(CLASS_SIZES).map(|(&n, size)| n as usize * size as usize).sum();
        if arena_bytes > 0 && requested > arena_bytes / 2 {
            debug!(requested, arena = arena_bytes, "pre-fragmentation disabled, over half arena");
        } else {
            for (class, &count) in inner.classes.iter_mut().zip(prealloc) {
                for _ in 0..count {
                    let idx = class.slots.len() as u32;
                    class.slots.push(Slot { buf: vec![0; class.size as usize].into(), len: 0 });
                    class.free.push(idx);
                }
                class.preallocated = count;
            }
        }
        // Pre-fragmented blocks are carved out of the arena for good.
        inner.in_use = 0;

        Self { inner: Mutex::new(inner) }
    }

    /// Heap-delegated pool with no budget and no pre-fragmentation.
    pub fn unbounded() -> Self {
        Self::new(0, &[0; NUM_CLASSES])
    }

    /// Allocate a zero-filled block of at least `len` bytes. Never blocks;
    /// exhaustion is returned for the caller to decide on.
    pub fn alloc(&self, len: usize) -> Result<BlockRef, MemError> {
        if len == 0 {
            return Err(MemError::Param);
        }
        let Some(class_idx) = CLASS_SIZES.iter().position(|&s| len <= s as usize) else {
            let inner = &mut *self.inner.lock().expect("pool lock");
            inner.alloc_errors += 1;
            return Err(MemError::Exhausted);
        };

        let inner = &mut *self.inner.lock().expect("pool lock");
        let budget_left = inner.arena == 0 ||
            inner.carved() + CLASS_SIZES[class_idx] as usize <= inner.arena;
        let class = &mut inner.classes[class_idx];

        let idx = if let Some(idx) = class.free.pop() {
            let slot = &mut class.slots[idx as usize];
            slot.buf.fill(0);
            slot.len = len as u32;
            idx
        } else if budget_left {
            let idx = class.slots.len() as u32;
            class.slots.push(Slot { buf: vec![0; class.size as usize].into(), len: len as u32 });
            idx
        } else {
            inner.alloc_errors += 1;
            return Err(MemError::Exhausted);
        };

        inner.in_use += CLASS_SIZES[class_idx] as usize;
        inner.alloc_count += 1;
        let free_now = inner.free_bytes();
        inner.min_free_ever = inner.min_free_ever.min(free_now);

        Ok(BlockRef { class: class_idx as u8, idx })
    }

    /// Return a block to its class list. Unknown references and double frees
    /// are logged, counted, and ignored.
    pub fn free(&self, block: BlockRef) {
        let inner = &mut *self.inner.lock().expect("pool lock");
        if block.class as usize >= inner.classes.len() {
            warn!(class = block.class, "free of unknown class");
            inner.free_errors += 1;
            return;
        }
        let class = &mut inner.classes[block.class as usize];
        let size = class.size;
        match class.slots.get_mut(block.idx as usize) {
            None => {
                warn!(class = block.class, idx = block.idx, "free of unknown block");
                inner.free_errors += 1;
            }
            Some(slot) if slot.len == 0 => {
                warn!(class = block.class, idx = block.idx, "double free detected");
                inner.free_errors += 1;
            }
            Some(slot) => {
                slot.len = 0;
                class.free.push(block.idx);
                inner.in_use -= size as usize;
            }
        }
    }

    /// Logical size of a live block.
    pub fn len(&self, block: BlockRef) -> Result<usize, MemError> {
        let inner = &*self.inner.lock().expect("pool lock");
        inner.slot(block).map(|slot| slot.len as usize)
    }

    /// Copy `src` into the block, starting at offset 0. The copy must fit
    /// the block's logical size.
    pub fn write(&self, block: BlockRef, src: &[u8]) -> Result<(), MemError> {
        let inner = &mut *self.inner.lock().expect("pool lock");
        let slot = inner.slot_mut(block)?;
        if src.len() > slot.len as usize {
            return Err(MemError::Param);
        }
        slot.buf[..src.len()].copy_from_slice(src);
        Ok(())
    }

    /// Run `f` over the block's live bytes.
    pub fn with<R>(&self, block: BlockRef, f: impl FnOnce(&[u8]) -> R) -> Result<R, MemError> {
        let inner = &*self.inner.lock().expect("pool lock");
        let slot = inner.slot(block)?;
        Ok(f(&slot.buf[..slot.len as usize]))
    }

    /// Run `f` over the block's live bytes, mutably.
    pub fn with_mut<R>(
        &self,
        block: BlockRef,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> Result<R, MemError> {
        let inner = &mut *self.inner.lock().expect("pool lock");
        let slot = inner.slot_mut(block)?;
        let len = slot.len as usize;
        Ok(f(&mut slot.buf[..len]))
    }

    pub fn stats(&self) -> MemStats {
        let inner = &*self.inner.lock().expect("pool lock");
        let mut per_class = [ClassStats::default(); NUM_CLASSES];
        for (out, class) in per_class.iter_mut().zip(&inner.classes) {
            *out = ClassStats {
                block_size: class.size,
                used: (class.slots.len() - class.free.len()) as u32,
                free: class.free.len() as u32,
                preallocated: class.preallocated,
            };
        }
        MemStats {
            total: inner.arena,
            free: inner.free_bytes(),
            min_free_ever: inner.min_free_ever,
            alloc_count: inner.alloc_count,
            alloc_errors: inner.alloc_errors,
            free_errors: inner.free_errors,
            per_class,
        }
    }
}

impl Inner {
    /// Arena bytes carved into block slots (live or parked on a free list).
    fn carved(&self) -> usize {
        self.classes.iter().map(|c| c.slots.len() * c.size as usize).sum()
    }

    fn free_bytes(&self) -> usize {
        self.arena.saturating_sub(self.in_use)
    }

    fn slot(&self, block: BlockRef) -> Result<&Slot, MemError> {
        self.classes
            .get(block.class as usize)
            .and_then(|c| c.slots.get(block.idx as usize))
            .filter(|slot| slot.len > 0)
            .ok_or(MemError::Stale)
    }

    fn slot_mut(&mut self, block: BlockRef) -> Result<&mut Slot, MemError> {
        self.classes
            .get_mut(block.class as usize)
            .and_then(|c| c.slots.get_mut(block.idx as usize))
            .filter(|slot| slot.len > 0)
            .ok_or(MemError::Stale)
    }
}
