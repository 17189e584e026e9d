use crate::{Allocator, AllocatorError, BlockAddr, Locked, PoolConfig, PoolStats};
use alloc::string::{String, ToString};
use alloc::vec::Vec;
use core::fmt;
use thiserror::Error;
use tracing::trace;

/// Bytes leased from the pool for every node
pub const NODE_SIZE: usize = 16;

/// Offset of the little endian `u16` payload inside a node
const VALUE_OFFSET: usize = 0;
/// Offset of the little endian `u64` link inside a node
const NEXT_OFFSET: usize = 8;
/// Link value meaning "no next node"
const NIL: u64 = u64::MAX;

/// Reference to a node, valid until that node is deleted
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NodeRef(BlockAddr);

impl NodeRef {
    /// The pool block backing this node
    pub const fn addr(self) -> BlockAddr {
        self.0
    }
}

impl fmt::Display for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node@{}", self.0)
    }
}

/// Errors coming out of list operations
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListError {
    /// The backing allocator refused
    #[error(transparent)]
    Allocator(#[from] AllocatorError),
    /// The node is stale or belongs to no chain reachable from head
    #[error("{0} is not reachable from the list head")]
    InvalidReference(NodeRef),
}

/// A singly linked list of `u16` whose nodes live in its own pool.
///
/// Values are typed `u16`, so anything outside that range is rejected where it
/// is converted, before it ever reaches the list.
#[derive(Debug)]
pub struct LinkedList {
    allocator: Allocator,
    head: Locked<Option<NodeRef>>,
}

impl LinkedList {
    /// Create an empty list backed by a pool of `pool_size` bytes
    pub fn init(pool_size: usize) -> Result<Self, ListError> {
        Self::init_with(PoolConfig::new(pool_size))
    }

    /// Create an empty list backed by a pool built from `config`
    pub fn init_with(config: PoolConfig) -> Result<Self, ListError> {
        let allocator = Allocator::new();
        allocator.init_with(config)?;
        Ok(Self {
            allocator,
            head: Locked::new(None),
        })
    }

    /// Layout of the pool holding the nodes. The pool itself stays private to
    /// the list; nodes are only ever freed through list operations.
    pub fn stats(&self) -> Result<PoolStats, ListError> {
        Ok(self.allocator.stats()?)
    }

    /// False once [`LinkedList::cleanup`] has released the pool
    pub fn is_initialized(&self) -> bool {
        self.allocator.is_initialized()
    }

    /// First node, if any
    pub fn head(&self) -> Option<NodeRef> {
        *self.head.lock()
    }

    fn load_value(&self, node: NodeRef) -> Result<u16, ListError> {
        let mut buf = [0u8; 2];
        self.allocator.read(node.0, VALUE_OFFSET, &mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    fn load_next(&self, node: NodeRef) -> Result<Option<NodeRef>, ListError> {
        let mut buf = [0u8; 8];
        self.allocator.read(node.0, NEXT_OFFSET, &mut buf)?;
        let link = u64::from_le_bytes(buf);
        if link == NIL {
            return Ok(None);
        }
        let offset = usize::try_from(link).map_err(|_| ListError::InvalidReference(node))?;
        Ok(Some(NodeRef(BlockAddr::new(offset))))
    }

    fn store_next(&self, node: NodeRef, next: Option<NodeRef>) -> Result<(), ListError> {
        let link = next.map_or(NIL, |next| next.0.offset() as u64);
        self.allocator.write(node.0, NEXT_OFFSET, &link.to_le_bytes())?;
        Ok(())
    }

    /// Lease a node from the pool and fill it in
    fn alloc_node(&self, value: u16, next: Option<NodeRef>) -> Result<NodeRef, ListError> {
        let node = NodeRef(self.allocator.allocate(NODE_SIZE)?);
        self.allocator
            .write(node.0, VALUE_OFFSET, &value.to_le_bytes())?;
        self.store_next(node, next)?;
        Ok(node)
    }

    /// Walk from `start` and return the first node `stop` accepts
    fn find_from(
        &self,
        start: Option<NodeRef>,
        mut stop: impl FnMut(NodeRef) -> Result<bool, ListError>,
    ) -> Result<Option<NodeRef>, ListError> {
        let mut current = start;
        while let Some(node) = current {
            if stop(node)? {
                return Ok(Some(node));
            }
            current = self.load_next(node)?;
        }
        Ok(None)
    }

    fn ensure_reachable(&self, head: Option<NodeRef>, node: NodeRef) -> Result<(), ListError> {
        match self.find_from(head, |current| Ok(current == node))? {
            Some(_) => Ok(()),
            None => Err(ListError::InvalidReference(node)),
        }
    }

    /// Append `value` after the last node
    pub fn insert(&self, value: u16) -> Result<NodeRef, ListError> {
        let mut head = self.head.lock();
        let last = self.find_from(*head, |node| Ok(self.load_next(node)?.is_none()))?;
        let node = self.alloc_node(value, None)?;
        match last {
            Some(last) => self.store_next(last, Some(node))?,
            None => *head = Some(node),
        }
        trace!(value, %node, "inserted");
        Ok(node)
    }

    /// Insert `value` right after `prev`. Does nothing when `prev` is `None`.
    pub fn insert_after(&self, prev: Option<NodeRef>, value: u16) -> Result<Option<NodeRef>, ListError> {
        let Some(prev) = prev else {
            return Ok(None);
        };
        let head = self.head.lock();
        self.ensure_reachable(*head, prev)?;

        let node = self.alloc_node(value, self.load_next(prev)?)?;
        self.store_next(prev, Some(node))?;
        trace!(value, %node, after = %prev, "inserted");
        Ok(Some(node))
    }

    /// Insert `value` right before `next`, which must be reachable from head
    pub fn insert_before(&self, next: NodeRef, value: u16) -> Result<NodeRef, ListError> {
        let mut head = self.head.lock();
        if *head == Some(next) {
            let node = self.alloc_node(value, Some(next))?;
            *head = Some(node);
            trace!(value, %node, "inserted at head");
            return Ok(node);
        }

        let prev = self
            .find_from(*head, |node| Ok(self.load_next(node)? == Some(next)))?
            .ok_or(ListError::InvalidReference(next))?;
        let node = self.alloc_node(value, Some(next))?;
        self.store_next(prev, Some(node))?;
        trace!(value, %node, before = %next, "inserted");
        Ok(node)
    }

    /// Remove the first node holding `value`. Returns whether one was found.
    pub fn delete(&self, value: u16) -> Result<bool, ListError> {
        let mut head = self.head.lock();
        let mut prev = None;
        let mut current = *head;
        while let Some(node) = current {
            let next = self.load_next(node)?;
            if self.load_value(node)? == value {
                match prev {
                    Some(prev) => self.store_next(prev, next)?,
                    None => *head = next,
                }
                self.allocator.free(node.0)?;
                trace!(value, %node, "deleted");
                return Ok(true);
            }
            prev = current;
            current = next;
        }
        Ok(false)
    }

    /// First node holding `value`
    pub fn search(&self, value: u16) -> Result<Option<NodeRef>, ListError> {
        let head = self.head.lock();
        self.find_from(*head, |node| Ok(self.load_value(node)? == value))
    }

    /// Payload of `node`
    pub fn value(&self, node: NodeRef) -> Result<u16, ListError> {
        let head = self.head.lock();
        self.ensure_reachable(*head, node)?;
        self.load_value(node)
    }

    /// Node following `node`
    pub fn next(&self, node: NodeRef) -> Result<Option<NodeRef>, ListError> {
        let head = self.head.lock();
        self.ensure_reachable(*head, node)?;
        self.load_next(node)
    }

    /// Number of nodes
    pub fn count(&self) -> Result<usize, ListError> {
        let head = self.head.lock();
        let mut count = 0;
        self.find_from(*head, |_| {
            count += 1;
            Ok(false)
        })?;
        Ok(count)
    }

    /// Every payload, head first
    pub fn to_vec(&self) -> Result<Vec<u16>, ListError> {
        let head = self.head.lock();
        let mut values = Vec::new();
        self.find_from(*head, |node| {
            values.push(self.load_value(node)?);
            Ok(false)
        })?;
        Ok(values)
    }

    /// Render `start..=end` as `[v1, v2, ...]`.
    ///
    /// `None` for `start` means the head, `None` for `end` means the tail. When
    /// `end` comes before `start` the rendering runs to the tail.
    pub fn display_range(&self, start: Option<NodeRef>, end: Option<NodeRef>) -> Result<String, ListError> {
        let head = self.head.lock();
        for node in [start, end].into_iter().flatten() {
            self.ensure_reachable(*head, node)?;
        }

        let mut out = String::from("[");
        let mut current = start.or(*head);
        while let Some(node) = current {
            if out.len() > 1 {
                out.push_str(", ");
            }
            out.push_str(&self.load_value(node)?.to_string());
            if Some(node) == end {
                break;
            }
            current = self.load_next(node)?;
        }
        out.push(']');
        Ok(out)
    }

    /// Render the whole list
    pub fn display(&self) -> Result<String, ListError> {
        self.display_range(None, None)
    }

    /// Free every node and release the pool
    pub fn cleanup(&self) -> Result<(), ListError> {
        let mut head = self.head.lock();
        let mut current = head.take();
        while let Some(node) = current {
            current = self.load_next(node)?;
            self.allocator.free(node.0)?;
        }
        self.allocator.deinit()?;
        Ok(())
    }
}
