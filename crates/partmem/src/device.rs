//! The block device boundary.
//!
//! The cache only ever issues whole-block, synchronous transfers. Anything that
//! can move one block in either direction can sit behind it.

use std::{
    fmt,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use crate::Result;

pub use self::{mem::MemDisk, tracing::TracingDevice};

mod mem;
mod tracing;

/// Address of one block: the device it lives on and its index there.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockId {
    pub dev: u32,
    pub blockno: u32,
}

impl BlockId {
    pub fn new(dev: u32, blockno: u32) -> Self {
        Self { dev, blockno }
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.dev, self.blockno)
    }
}

/// Direction and payload of a transfer.
#[derive(Debug)]
pub enum Transfer<'a> {
    /// Fill the buffer from the device.
    Read(&'a mut [u8]),
    /// Flush the buffer to the device.
    Write(&'a [u8]),
}

impl<'a> Transfer<'a> {
    pub fn len(&self) -> usize {
        match self {
            Transfer::Read(buf) => buf.len(),
            Transfer::Write(buf) => buf.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub trait BlockDevice {
    fn block_size(&self) -> usize;

    /// Move exactly one block. Blocks the caller until the transfer completes;
    /// there are no partial transfers.
    fn transfer(&self, block: BlockId, data: Transfer<'_>) -> Result<()>;
}

impl<D> BlockDevice for Arc<D>
where
    D: BlockDevice + ?Sized,
{
    fn block_size(&self) -> usize {
        (**self).block_size()
    }

    fn transfer(&self, block: BlockId, data: Transfer<'_>) -> Result<()> {
        (**self).transfer(block, data)
    }
}

pub type Device = Arc<dyn BlockDevice + Send + Sync>;

/// A fresh in-memory disk whose transfers are traced.
pub fn memory(block_size: usize) -> Device {
    static MEM_ID: AtomicUsize = AtomicUsize::new(0);
    let mem = MemDisk::new(block_size);
    let id = format!("mem.{}", MEM_ID.fetch_add(1, Ordering::Relaxed));
    Arc::new(TracingDevice::new(mem, id))
}
