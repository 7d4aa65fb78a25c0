use std::{
    io,
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
};

use ahash::AHashMap;
use parking_lot::RwLock;

use crate::{ErrorKind, Result};

use super::{BlockDevice, BlockId, Transfer};

/// A sparse disk held in memory. Blocks that were never written read as zeros.
pub struct MemDisk {
    block_size: usize,
    blocks: RwLock<AHashMap<BlockId, Box<[u8]>>>,
    reads: AtomicUsize,
    writes: AtomicUsize,
    faulty: AtomicBool,
}

impl MemDisk {
    pub fn new(block_size: usize) -> Self {
        Self {
            block_size,
            blocks: Default::default(),
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
            faulty: AtomicBool::new(false),
        }
    }

    /// Number of completed read transfers.
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::Relaxed)
    }

    /// Number of completed write transfers.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::Relaxed)
    }

    /// Make every following transfer fail with an I/O error, or stop doing so.
    pub fn set_faulty(&self, faulty: bool) {
        self.faulty.store(faulty, Ordering::Relaxed);
    }

    /// The current on-disk contents of `block`, if it was ever written.
    pub fn block(&self, block: BlockId) -> Option<Vec<u8>> {
        self.blocks.read().get(&block).map(|b| b.to_vec())
    }

    /// Place contents on the disk without counting a transfer.
    pub fn set_block(&self, block: BlockId, data: &[u8]) {
        assert_eq!(data.len(), self.block_size, "partial block");
        self.blocks.write().insert(block, data.into());
    }
}

impl BlockDevice for MemDisk {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn transfer(&self, block: BlockId, data: Transfer<'_>) -> Result<()> {
        if data.len() != self.block_size {
            return Err(ErrorKind::BlockSizeMismatch {
                expected: self.block_size,
                actual: data.len(),
            }
            .into());
        }
        if self.faulty.load(Ordering::Relaxed) {
            return Err(io::Error::new(io::ErrorKind::Other, "injected device fault").into());
        }

        match data {
            Transfer::Read(buf) => {
                match self.blocks.read().get(&block) {
                    Some(stored) => buf.copy_from_slice(stored),
                    None => buf.fill(0),
                }
                self.reads.fetch_add(1, Ordering::Relaxed);
            }
            Transfer::Write(buf) => {
                self.blocks.write().insert(block, buf.into());
                self.writes.fetch_add(1, Ordering::Relaxed);
            }
        }
        Ok(())
    }
}
