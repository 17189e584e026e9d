//! A fixed size pool allocator and a linked list that lives inside it.
//!
//! [`Allocator`] carves one preallocated buffer into blocks handed out
//! first-fit, splitting free blocks on allocation and coalescing them on
//! free. [`LinkedList`] stores every node in blocks leased from its own
//! allocator.
//!
//! Both types lock internally. A list operation holds the list lock for its
//! whole body and takes the allocator lock once per allocator call; the
//! allocator never calls back into the list, so locks always nest
//! list then allocator.

#![no_std]
#![deny(
    missing_docs,
    trivial_casts,
    trivial_numeric_casts,
    unsafe_code,
    unstable_features,
    unused_import_braces,
    unused_qualifications
)]

extern crate alloc;

/// The pool engine
mod pool;
/// The linked list on top of the pool
mod list;

pub use list::{LinkedList, ListError, NodeRef, NODE_SIZE};
pub use pool::{AllocatorError, BlockAddr, Coalesce, MemoryPool, PoolConfig, PoolStats};

use spin::{Mutex, MutexGuard};
use tracing::debug;

/// Allows putting a type behind a Mutex
#[derive(Debug)]
pub struct Locked<T> {
    inner: Mutex<T>,
}

impl<T> Locked<T> {
    /// Create a new Mutex locked type
    pub const fn new(inner: T) -> Self {
        Self {
            inner: Mutex::new(inner),
        }
    }

    /// Get the interior
    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.inner.lock()
    }
}

/// The pool allocator shared between threads.
///
/// Starts uninitialized; every call other than [`Allocator::init`] fails with
/// [`AllocatorError::Uninitialized`] until a pool exists. Each call holds the
/// lock for its whole duration.
#[derive(Debug)]
pub struct Allocator {
    pool: Locked<Option<MemoryPool>>,
}

impl Allocator {
    /// Create a new empty allocator, must init before using
    pub const fn new() -> Self {
        Self {
            pool: Locked::new(None),
        }
    }

    /// Reserve a pool of `size` bytes with the default coalescing policy
    pub fn init(&self, size: usize) -> Result<(), AllocatorError> {
        self.init_with(PoolConfig::new(size))
    }

    /// Reserve a pool as described by `config`
    pub fn init_with(&self, config: PoolConfig) -> Result<(), AllocatorError> {
        let mut pool = self.pool.lock();
        if pool.is_some() {
            return Err(AllocatorError::AlreadyInitialized);
        }
        *pool = Some(MemoryPool::new(config)?);
        Ok(())
    }

    /// Release the pool. The allocator must be initialized again before reuse.
    pub fn deinit(&self) -> Result<(), AllocatorError> {
        let released = self
            .pool
            .lock()
            .take()
            .ok_or(AllocatorError::Uninitialized)?;
        debug!(size = released.size(), "pool released");
        Ok(())
    }

    /// True between `init` and `deinit`
    pub fn is_initialized(&self) -> bool {
        self.pool.lock().is_some()
    }

    /// Run `f` on the pool while holding the lock
    fn with_pool<R>(
        &self,
        f: impl FnOnce(&mut MemoryPool) -> Result<R, AllocatorError>,
    ) -> Result<R, AllocatorError> {
        let mut guard = self.pool.lock();
        let pool = guard.as_mut().ok_or(AllocatorError::Uninitialized)?;
        f(pool)
    }

    /// Hand out the first free block of at least `size` bytes
    pub fn allocate(&self, size: usize) -> Result<BlockAddr, AllocatorError> {
        self.with_pool(|pool| pool.allocate_first_fit(size))
    }

    /// Give a block back to the pool
    pub fn free(&self, addr: BlockAddr) -> Result<(), AllocatorError> {
        self.with_pool(|pool| pool.free_coalesce(addr))
    }

    /// Make sure the block at `addr` holds at least `new_size` bytes, moving it if needed
    pub fn resize(&self, addr: BlockAddr, new_size: usize) -> Result<BlockAddr, AllocatorError> {
        self.with_pool(|pool| pool.resize(addr, new_size))
    }

    /// Size of the used block at `addr`
    pub fn block_size(&self, addr: BlockAddr) -> Result<usize, AllocatorError> {
        self.with_pool(|pool| pool.block_size(addr))
    }

    /// Copy `buf.len()` bytes out of the block at `addr`, starting at `offset`
    pub fn read(&self, addr: BlockAddr, offset: usize, buf: &mut [u8]) -> Result<(), AllocatorError> {
        self.with_pool(|pool| pool.read(addr, offset, buf))
    }

    /// Copy `bytes` into the block at `addr`, starting at `offset`
    pub fn write(&self, addr: BlockAddr, offset: usize, bytes: &[u8]) -> Result<(), AllocatorError> {
        self.with_pool(|pool| pool.write(addr, offset, bytes))
    }

    /// Current layout of the pool
    pub fn stats(&self) -> Result<PoolStats, AllocatorError> {
        self.with_pool(|pool| Ok(pool.stats()))
    }
}

impl Default for Allocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    extern crate std;
    use std::{dbg, format};

    static ALLOCATOR: Allocator = Allocator::new();

    /// Test that nothing works before init
    #[test]
    fn uninitialized() {
        let allocator = Allocator::new();
        assert!(!allocator.is_initialized());
        assert_eq!(allocator.allocate(8), Err(AllocatorError::Uninitialized));
        assert_eq!(allocator.stats(), Err(AllocatorError::Uninitialized));
        assert_eq!(allocator.deinit(), Err(AllocatorError::Uninitialized));
    }

    /// Test that a second init is refused and the first pool survives
    #[test]
    fn double_init() {
        let allocator = Allocator::new();
        allocator.init(64).unwrap();
        let addr = allocator.allocate(8).unwrap();
        assert_eq!(allocator.init(128), Err(AllocatorError::AlreadyInitialized));
        assert_eq!(allocator.block_size(addr), Ok(8));
        assert_eq!(allocator.stats().unwrap().total, 64);
    }

    /// Test that deinit makes the allocator unusable until the next init
    #[test]
    fn deinit_then_reinit() {
        let allocator = Allocator::new();
        allocator.init(64).unwrap();
        let addr = allocator.allocate(8).unwrap();
        allocator.deinit().unwrap();
        assert_eq!(allocator.free(addr), Err(AllocatorError::Uninitialized));

        allocator.init(32).unwrap();
        assert_eq!(allocator.stats().unwrap().free, 32);
    }

    /// Test the resize walk through: shrink in place, then grow and move
    #[test]
    fn resize_scenario() {
        let allocator = Allocator::new();
        allocator.init(256).unwrap();
        let a = allocator.allocate(8).unwrap();
        allocator.write(a, 0, b"pooldata").unwrap();

        assert_eq!(allocator.resize(a, 4), Ok(a));

        let b = allocator.resize(a, 16).unwrap();
        assert_ne!(a, b);
        let mut buf = [0u8; 8];
        allocator.read(b, 0, &mut buf).unwrap();
        assert_eq!(&buf, b"pooldata");
        assert_eq!(allocator.block_size(a), Err(AllocatorError::BlockNotFound(a)));
        dbg!(&allocator);
    }

    /// Test that a static allocator works like any other
    #[test]
    fn static_allocator() {
        ALLOCATOR.init_with(PoolConfig::new(128).coalesce(Coalesce::FORWARD)).unwrap();
        let one = ALLOCATOR.allocate(64).unwrap();
        let two = ALLOCATOR.allocate(64).unwrap();
        assert_eq!(
            ALLOCATOR.allocate(1),
            Err(AllocatorError::AllocationExhausted { requested: 1 })
        );
        ALLOCATOR.free(two).unwrap();
        ALLOCATOR.free(one).unwrap();
        let stats = ALLOCATOR.stats().unwrap();
        assert_eq!(stats.blocks, 1);
        assert_eq!(format!("{}", AllocatorError::BlockNotFound(one)), "no used block starts at 0x0");
        ALLOCATOR.deinit().unwrap();
    }
}
