//! Hash-consed storage for operation nodes.

use std::{
    hash::{Hash, Hasher},
    sync::{
        Arc, RwLock, RwLockReadGuard, RwLockWriteGuard,
        atomic::{AtomicU32, Ordering},
    },
};

use rustc_hash::{FxHashMap, FxHasher};
use smallvec::SmallVec;

use crate::{
    error::PoolError,
    op::{Op, OpRef, OpType},
};

const UNLINKED: u32 = u32::MAX;

/// An interned op together with its program address once linked.
#[derive(Debug)]
pub struct PoolEntry {
    pub op: Op,
    linked_address: AtomicU32,
}

impl PoolEntry {
    fn new(op: Op) -> Self {
        Self {
            op,
            linked_address: AtomicU32::new(UNLINKED),
        }
    }

    pub fn linked_address(&self) -> Option<u32> {
        match self.linked_address.load(Ordering::Acquire) {
            UNLINKED => None,
            address => Some(address),
        }
    }

    /// Records `address` unless one is already set; returns the stored address.
    pub(crate) fn set_linked_address(&self, address: u32) -> u32 {
        match self
            .linked_address
            .compare_exchange(UNLINKED, address, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => address,
            Err(existing) => existing,
        }
    }
}

#[derive(Debug, Default)]
struct PoolInner {
    entries: Vec<Arc<PoolEntry>>,
    buckets: FxHashMap<(OpType, u64), SmallVec<[OpRef; 1]>>,
}

/// Thread-safe, structurally deduplicated op storage.
///
/// Interning an op that is equal to one already stored returns the existing
/// reference. Children must be interned before their parents, which keeps the
/// graph acyclic and every child index below its parent's.
#[derive(Debug, Default)]
pub struct OpPool {
    inner: RwLock<PoolInner>,
}

pub fn structural_hash(op: &Op) -> u64 {
    let mut hasher = FxHasher::default();
    op.hash(&mut hasher);
    hasher.finish()
}

impl OpPool {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, PoolInner> {
        self.inner.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, PoolInner> {
        self.inner.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Returns the reference of an op equal to `op`, storing it first if needed.
    pub fn intern(&self, op: Op) -> Result<OpRef, PoolError> {
        let key = (op.op_type(), structural_hash(&op));

        if let Some(existing) = self.find(&key, &op) {
            return Ok(existing);
        }

        let mut inner = self.write();
        // Another thread may have stored it between the two locks.
        let raced = inner.buckets.get(&key).and_then(|bucket| {
            bucket
                .iter()
                .find(|r| inner.entries[r.id() as usize].op == op)
                .copied()
        });
        if let Some(existing) = raced {
            return Ok(existing);
        }

        let len = inner.entries.len();
        if let Some(child) = op.children().into_iter().find(|child| child.id() as usize >= len) {
            return Err(PoolError::DanglingChild { child, len });
        }

        let op_ref = OpRef::new(len as u32);
        inner.entries.push(Arc::new(PoolEntry::new(op)));
        inner.buckets.entry(key).or_default().push(op_ref);
        Ok(op_ref)
    }

    fn find(&self, key: &(OpType, u64), op: &Op) -> Option<OpRef> {
        let inner = self.read();
        inner
            .buckets
            .get(key)?
            .iter()
            .find(|r| inner.entries[r.id() as usize].op == *op)
            .copied()
    }

    pub fn entry(&self, op_ref: OpRef) -> Result<Arc<PoolEntry>, PoolError> {
        self.read()
            .entries
            .get(op_ref.id() as usize)
            .cloned()
            .ok_or(PoolError::UnknownOp(op_ref))
    }

    pub fn get(&self, op_ref: OpRef) -> Result<Op, PoolError> {
        self.entry(op_ref).map(|entry| entry.op.clone())
    }

    pub fn op_type(&self, op_ref: OpRef) -> Result<OpType, PoolError> {
        self.entry(op_ref).map(|entry| entry.op.op_type())
    }

    pub fn len(&self) -> usize {
        self.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Convenience for the constant `true`/`false` ops.
    pub fn bool_constant(&self, value: bool) -> Result<OpRef, PoolError> {
        self.intern(Op::BoolConstant(value))
    }
}
