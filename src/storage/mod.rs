//! Storage drivers, volume management and the FAT adapter.

pub mod devmgr;
pub mod fat;
pub mod sd;
pub mod usb;

use std::sync::Arc;

use parking_lot::Mutex;

/// Sector size shared by every supported device.
pub const SECTOR_SIZE: usize = 512;

/// Errors of the sector-level drivers.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StorageError {
    /// Transfer addressed sectors beyond the medium.
    OutOfRange,
    /// The device reported a transport or medium error.
    Device,
    /// The device is gone.
    NotPresent,
}

/// A block device addressed in 512-byte sectors.
pub trait SectorDevice: Send {
    /// Total sector count of the medium.
    fn sector_count(&self) -> u32;

    /// Read whole sectors starting at `first` into `buf` (a multiple of
    /// [`SECTOR_SIZE`] long).
    fn read_sectors(&mut self, first: u32, buf: &mut [u8]) -> Result<(), StorageError>;

    /// Write whole sectors starting at `first`.
    fn write_sectors(&mut self, first: u32, data: &[u8]) -> Result<(), StorageError>;
}

/// A sector device shared between the FAT library, the raw cluster layer
/// and the drivers. The mutex is the serialization point for all media
/// access on a slot.
pub type SharedDevice = Arc<Mutex<dyn SectorDevice>>;

/// Wrap a device for sharing.
pub fn share<T: SectorDevice + 'static>(device: T) -> SharedDevice {
    Arc::new(Mutex::new(device))
}

/// A RAM-backed sector device. Production slots are SD cards and USB
/// drives; this exists for the test suites and host-side tooling.
#[derive(Debug)]
pub struct MemoryDevice {
    data: Vec<u8>,
}

impl MemoryDevice {
    /// Wrap a byte image; the length is rounded down to whole sectors.
    pub fn new(data: Vec<u8>) -> MemoryDevice {
        MemoryDevice { data }
    }

    /// A zero-filled device of `sectors` sectors.
    pub fn zeroed(sectors: u32) -> MemoryDevice {
        MemoryDevice {
            data: vec![0; sectors as usize * SECTOR_SIZE],
        }
    }

    /// The raw image.
    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

impl SectorDevice for MemoryDevice {
    fn sector_count(&self) -> u32 {
        (self.data.len() / SECTOR_SIZE) as u32
    }

    fn read_sectors(&mut self, first: u32, buf: &mut [u8]) -> Result<(), StorageError> {
        debug_assert_eq!(buf.len() % SECTOR_SIZE, 0);
        let start = first as usize * SECTOR_SIZE;
        let end = start + buf.len();
        if end > self.data.len() {
            return Err(StorageError::OutOfRange);
        }
        buf.copy_from_slice(&self.data[start..end]);
        Ok(())
    }

    fn write_sectors(&mut self, first: u32, data: &[u8]) -> Result<(), StorageError> {
        debug_assert_eq!(data.len() % SECTOR_SIZE, 0);
        let start = first as usize * SECTOR_SIZE;
        let end = start + data.len();
        if end > self.data.len() {
            return Err(StorageError::OutOfRange);
        }
        self.data[start..end].copy_from_slice(data);
        Ok(())
    }
}
