use alloc::vec::Vec;
use bitflags::bitflags;
use core::fmt;
use thiserror::Error;
use tracing::{debug, trace, warn};

/// Handle to a block inside the pool, the byte offset of its first byte
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockAddr(usize);

impl BlockAddr {
    pub(crate) const fn new(offset: usize) -> Self {
        Self(offset)
    }

    /// Byte offset of the block from the start of the pool
    pub const fn offset(self) -> usize {
        self.0
    }
}

impl fmt::Display for BlockAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#X}", self.0)
    }
}

/// Everything that can go wrong while talking to the pool
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocatorError {
    /// No free block is large enough for the request
    #[error("no free block can hold {requested} bytes")]
    AllocationExhausted {
        /// Bytes asked for
        requested: usize,
    },
    /// The address does not belong to any used block
    #[error("no used block starts at {0}")]
    BlockNotFound(BlockAddr),
    /// Zero sized pools and zero sized blocks are not supported
    #[error("size must be greater than zero")]
    InvalidSize,
    /// A read or write would run past the end of its block
    #[error("access of {len} bytes at offset {offset} overruns block {addr}")]
    OutOfBounds {
        /// Block being accessed
        addr: BlockAddr,
        /// Offset into the block
        offset: usize,
        /// Length of the access
        len: usize,
    },
    /// The allocator has not been initialized, or has been deinitialized
    #[error("allocator is not initialized")]
    Uninitialized,
    /// `init` was called on a live allocator
    #[error("allocator is already initialized")]
    AlreadyInitialized,
}

bitflags! {
    /// Which neighbours a freed block is merged with
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Coalesce: u8 {
        /// Merge with the following block when it is free
        const FORWARD = 0b01;
        /// Merge with the preceding block when it is free
        const BACKWARD = 0b10;
    }
}

impl Default for Coalesce {
    fn default() -> Self {
        Self::FORWARD | Self::BACKWARD
    }
}

/// Settings used when creating a pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    /// Total size of the pool in bytes
    pub size: usize,
    /// Coalescing policy applied on free
    pub coalesce: Coalesce,
}

impl PoolConfig {
    /// A pool of `size` bytes that coalesces in both directions
    pub fn new(size: usize) -> Self {
        Self {
            size,
            coalesce: Coalesce::default(),
        }
    }

    /// Replace the coalescing policy
    pub fn coalesce(mut self, coalesce: Coalesce) -> Self {
        self.coalesce = coalesce;
        self
    }
}

/// Snapshot of how the pool is carved up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    /// Size of the pool
    pub total: usize,
    /// Bytes held by used blocks
    pub used: usize,
    /// Bytes held by free blocks
    pub free: usize,
    /// Number of descriptors in the chain
    pub blocks: usize,
    /// Largest single free block, the biggest request that can succeed
    pub largest_free: usize,
}

/// Describes one contiguous region of the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Block {
    addr: usize,
    size: usize,
    allocated: bool,
}

impl Block {
    fn free(addr: usize, size: usize) -> Self {
        Self {
            addr,
            size,
            allocated: false,
        }
    }

    fn end(&self) -> usize {
        self.addr + self.size
    }
}

/// A first-fit allocator over one fixed buffer.
///
/// The descriptor chain is kept in address order, which is what splitting
/// produces naturally. Nothing here locks; see [`crate::Allocator`] for the
/// shared version.
pub struct MemoryPool {
    /// Capacity is reserved up front; the length only grows to the end of the
    /// highest block handed out so far, so untouched pages stay untouched.
    buffer: Vec<u8>,
    size: usize,
    blocks: Vec<Block>,
    coalesce: Coalesce,
}

impl MemoryPool {
    /// Reserve the buffer and describe it with a single free block
    pub fn new(config: PoolConfig) -> Result<Self, AllocatorError> {
        if config.size == 0 {
            return Err(AllocatorError::InvalidSize);
        }

        let mut buffer = Vec::new();
        buffer
            .try_reserve_exact(config.size)
            .map_err(|_| AllocatorError::AllocationExhausted {
                requested: config.size,
            })?;

        let mut blocks = Vec::new();
        blocks.push(Block::free(0, config.size));

        debug!(size = config.size, coalesce = ?config.coalesce, "pool initialized");
        Ok(Self {
            buffer,
            size: config.size,
            blocks,
            coalesce: config.coalesce,
        })
    }

    /// Size of the whole pool
    pub fn size(&self) -> usize {
        self.size
    }

    /// Bytes of the buffer zeroed so far
    #[cfg(test)]
    fn touched(&self) -> usize {
        self.buffer.len()
    }

    /// Index of the used block starting at `addr`
    fn used_block(&self, addr: BlockAddr) -> Result<usize, AllocatorError> {
        self.blocks
            .iter()
            .position(|block| block.addr == addr.0 && block.allocated)
            .ok_or(AllocatorError::BlockNotFound(addr))
    }

    /// Take the first free block that fits and split the rest off as a new free block
    pub fn allocate_first_fit(&mut self, size: usize) -> Result<BlockAddr, AllocatorError> {
        if size == 0 {
            return Err(AllocatorError::InvalidSize);
        }

        let Some(index) = self
            .blocks
            .iter()
            .position(|block| !block.allocated && block.size >= size)
        else {
            warn!(requested = size, "pool exhausted");
            return Err(AllocatorError::AllocationExhausted { requested: size });
        };

        let block = &mut self.blocks[index];
        let leftover = block.size - size;
        block.allocated = true;
        block.size = size;
        let addr = block.addr;

        // an exact fit leaves nothing to describe
        if leftover > 0 {
            self.blocks
                .insert(index + 1, Block::free(addr + size, leftover));
        }

        // within the reserved capacity, never reallocates
        if addr + size > self.buffer.len() {
            self.buffer.resize(addr + size, 0);
        }

        trace!(addr, size, leftover, "allocated");
        Ok(BlockAddr(addr))
    }

    /// Mark the block free and merge it with free neighbours
    pub fn free_coalesce(&mut self, addr: BlockAddr) -> Result<(), AllocatorError> {
        let mut index = match self.used_block(addr) {
            Ok(index) => index,
            Err(err) => {
                warn!(%addr, "free of unknown block");
                return Err(err);
            }
        };
        self.blocks[index].allocated = false;

        // front
        if self.coalesce.contains(Coalesce::FORWARD)
            && self
                .blocks
                .get(index + 1)
                .is_some_and(|next| !next.allocated)
        {
            let next = self.blocks.remove(index + 1);
            self.blocks[index].size += next.size;
            trace!(%addr, merged = next.addr, "coalesced forward");
        }

        // back
        if self.coalesce.contains(Coalesce::BACKWARD)
            && index > 0
            && !self.blocks[index - 1].allocated
        {
            let current = self.blocks.remove(index);
            index -= 1;
            self.blocks[index].size += current.size;
            trace!(%addr, into = self.blocks[index].addr, "coalesced backward");
        }

        trace!(%addr, size = self.blocks[index].size, "freed");
        Ok(())
    }

    /// Grow a block, moving it when it is too small.
    ///
    /// A block that is already large enough is returned as is, even when
    /// `new_size` is smaller. Otherwise a new block is allocated while the old
    /// one is still held, the old contents copied over, and the old block freed.
    /// On failure the original block is untouched.
    pub fn resize(&mut self, addr: BlockAddr, new_size: usize) -> Result<BlockAddr, AllocatorError> {
        let index = self.used_block(addr)?;
        let old_size = self.blocks[index].size;
        if old_size >= new_size {
            return Ok(addr);
        }

        let new_addr = self.allocate_first_fit(new_size)?;
        self.buffer
            .copy_within(addr.0..addr.0 + old_size, new_addr.0);
        self.free_coalesce(addr)?;

        debug!(from = %addr, to = %new_addr, old_size, new_size, "block moved");
        Ok(new_addr)
    }

    /// Size of the used block at `addr`
    pub fn block_size(&self, addr: BlockAddr) -> Result<usize, AllocatorError> {
        let index = self.used_block(addr)?;
        Ok(self.blocks[index].size)
    }

    /// Byte range of `len` bytes at `offset` inside the used block at `addr`
    fn span(
        &self,
        addr: BlockAddr,
        offset: usize,
        len: usize,
    ) -> Result<core::ops::Range<usize>, AllocatorError> {
        let block = self.blocks[self.used_block(addr)?];
        let out_of_bounds = AllocatorError::OutOfBounds { addr, offset, len };
        let start = block.addr.checked_add(offset).ok_or(out_of_bounds)?;
        let end = start.checked_add(len).ok_or(out_of_bounds)?;
        if end > block.end() {
            return Err(out_of_bounds);
        }
        Ok(start..end)
    }

    /// Copy bytes out of a used block
    pub fn read(&self, addr: BlockAddr, offset: usize, buf: &mut [u8]) -> Result<(), AllocatorError> {
        let span = self.span(addr, offset, buf.len())?;
        buf.copy_from_slice(&self.buffer[span]);
        Ok(())
    }

    /// Copy bytes into a used block
    pub fn write(&mut self, addr: BlockAddr, offset: usize, bytes: &[u8]) -> Result<(), AllocatorError> {
        let span = self.span(addr, offset, bytes.len())?;
        self.buffer[span].copy_from_slice(bytes);
        Ok(())
    }

    /// Walk the chain and total it up
    pub fn stats(&self) -> PoolStats {
        self.blocks.iter().fold(
            PoolStats {
                total: self.size(),
                ..PoolStats::default()
            },
            |mut stats, block| {
                stats.blocks += 1;
                if block.allocated {
                    stats.used += block.size;
                } else {
                    stats.free += block.size;
                    stats.largest_free = stats.largest_free.max(block.size);
                }
                stats
            },
        )
    }
}

impl fmt::Debug for MemoryPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // we want a better debug for the chain than the raw vec
        struct Entry<'a>(&'a Block);

        impl fmt::Debug for Entry<'_> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_struct("Block")
                    .field("addr", &Hex(self.0.addr))
                    .field("size", &self.0.size)
                    .field("allocated", &self.0.allocated)
                    .finish()
            }
        }

        struct Hex(usize);

        impl fmt::Debug for Hex {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:#X}", self.0)
            }
        }

        f.debug_list()
            .entries(self.blocks.iter().map(Entry))
            .finish()
    }
}
