//! Services provided by the checkpoint tool hosting this crate.

use crate::device::ProcessMemory;
use crate::error::Result;
use crate::records::SharedMemDescriptor;
use crate::types::Pid;

pub trait Host: Sync {
    /// Open the address space of `pid`. Each transfer worker opens its own.
    fn open_process_memory(&self, pid: Pid, writable: bool) -> Result<Box<dyn ProcessMemory>>;

    fn write_image(&self, name: &str, bytes: &[u8]) -> Result<()>;

    /// Read image `name`, `Ok(None)` if it does not exist.
    fn read_image(&self, name: &str) -> Result<Option<Vec<u8>>>;

    /// Describe the runtime's shared-memory segment. An absent segment has
    /// size 0.
    fn shared_memory(&self) -> Result<SharedMemDescriptor> {
        Ok(SharedMemDescriptor::default())
    }

    /// Make sure a segment matching `desc` exists.
    fn recreate_shared_memory(&self, _desc: &SharedMemDescriptor) -> Result<()> {
        Ok(())
    }
}
