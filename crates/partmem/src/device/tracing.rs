use std::fmt::Display;

use tracing::trace;

use super::{BlockDevice, BlockId, Transfer};

pub struct TracingDevice<D> {
    id: String,
    inner: D,
}

impl<D> TracingDevice<D> {
    pub fn new<ID>(inner: D, id: ID) -> Self
    where
        ID: Display,
    {
        let id = id.to_string();
        Self { id, inner }
    }

    pub fn get_ref(&self) -> &D {
        &self.inner
    }
}

impl<D> BlockDevice for TracingDevice<D>
where
    D: BlockDevice,
{
    fn block_size(&self) -> usize {
        self.inner.block_size()
    }

    fn transfer(&self, block: BlockId, data: Transfer<'_>) -> crate::Result<()> {
        match &data {
            Transfer::Read(buf) => trace!("device.read({}, {}, {})", self.id, block, buf.len()),
            Transfer::Write(buf) => trace!("device.write({}, {}, {})", self.id, block, buf.len()),
        }
        self.inner.transfer(block, data)
    }
}
