//! USB mass-storage driver, bulk-only transport.
//!
//! Straight implementation of the published BOT protocol: a 31-byte
//! command-block wrapper out, a data phase on the bulk endpoints, a
//! 13-byte command-status wrapper back. SCSI `READ(10)`/`WRITE(10)` carry
//! the sectors. On a transport error the device is reset with the
//! class-specific request, both endpoints are un-halted and the cycle is
//! retried a bounded number of times. The wrapper fields are little-endian
//! per the USB spec; the SCSI command blocks are big-endian per theirs.

use std::fmt;
use std::thread;
use std::time::Duration;

use log::info;
use log::warn;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;
use zerocopy::Unaligned;
use zerocopy::little_endian::U32 as U32le;

use crate::storage::SECTOR_SIZE;
use crate::storage::SectorDevice;
use crate::storage::StorageError;

/// CBW signature, "USBC".
pub const CBW_SIGNATURE: u32 = 0x4342_5355;
/// CSW signature, "USBS".
pub const CSW_SIGNATURE: u32 = 0x5342_5355;
/// Direction flag for device-to-host data phases.
pub const CBW_FLAGS_IN: u8 = 1 << 7;

/// Class-specific bulk-only reset request.
pub const REQUEST_RESET: u8 = 0xFF;
/// Class-specific get-max-LUN request.
pub const REQUEST_GET_MAX_LUN: u8 = 0xFE;

const SCSI_READ_CAPACITY: u8 = 0x25;
const SCSI_READ_10: u8 = 0x28;
const SCSI_WRITE_10: u8 = 0x2A;

/// Retries of a failed command cycle before giving up.
pub const CYCLE_RETRIES: u32 = 3;

/// Largest single data-phase chunk; longer transfers are split.
pub const MAX_TRANSFER_SIZE: usize = 16 * 1024;

/// Command block wrapper.
#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct Cbw {
    /// [`CBW_SIGNATURE`].
    pub signature: U32le,
    /// Monotonic tag echoed by the matching CSW.
    pub tag: U32le,
    /// Expected data-phase length.
    pub transfer_length: U32le,
    /// Direction bit.
    pub flags: u8,
    /// Target logical unit.
    pub lun: u8,
    /// Valid bytes in `cb`.
    pub cb_length: u8,
    /// SCSI command block.
    pub cb: [u8; 16],
}

/// Command status wrapper.
#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct Csw {
    /// [`CSW_SIGNATURE`].
    pub signature: U32le,
    /// Tag of the CBW this status answers.
    pub tag: U32le,
    /// Bytes of the data phase the device did not process.
    pub data_residue: U32le,
    /// 0 on success.
    pub status: u8,
}

const _: () = assert!(size_of::<Cbw>() == 31);
const _: () = assert!(size_of::<Csw>() == 13);

/// Bulk endpoints and the control pipe of one attached device, as the
/// kernel's USB host interface exposes them.
pub trait UsbPort: Send {
    /// Bulk transfer host-to-device; returns bytes moved or negative.
    fn bulk_out(&mut self, endpoint: u8, data: &[u8]) -> i32;

    /// Bulk transfer device-to-host; returns bytes moved or negative.
    fn bulk_in(&mut self, endpoint: u8, buf: &mut [u8]) -> i32;

    /// Control request on endpoint zero.
    fn control(&mut self, request_type: u8, request: u8, value: u16, index: u16, data: &mut [u8])
    -> i32;

    /// Clear a halted endpoint.
    fn clear_halt(&mut self, endpoint: u8) -> i32;
}

/// Bulk-only transport state for one device.
pub struct UsbStorage<P> {
    port: P,
    ep_in: u8,
    ep_out: u8,
    interface: u16,
    lun: u8,
    tag: u32,
    sector_count: u32,
    ready: bool,
    bounce: Box<[u8]>,
}

impl<P> fmt::Debug for UsbStorage<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UsbStorage")
            .field("lun", &self.lun)
            .field("sector_count", &self.sector_count)
            .field("ready", &self.ready)
            .finish_non_exhaustive()
    }
}

impl<P: UsbPort> UsbStorage<P> {
    /// Wrap an enumerated bulk-only device.
    pub fn new(port: P, ep_in: u8, ep_out: u8, interface: u16) -> UsbStorage<P> {
        UsbStorage {
            port,
            ep_in,
            ep_out,
            interface,
            lun: 0,
            tag: 0,
            sector_count: 0,
            ready: false,
            bounce: vec![0; MAX_TRANSFER_SIZE].into_boxed_slice(),
        }
    }

    fn reset(&mut self) -> i32 {
        // Host-to-device, class, interface recipient.
        let ret = self
            .port
            .control(0x21, REQUEST_RESET, 0, self.interface, &mut []);
        thread::sleep(Duration::from_millis(60));
        self.port.clear_halt(self.ep_in);
        thread::sleep(Duration::from_millis(10));
        self.port.clear_halt(self.ep_out);
        thread::sleep(Duration::from_millis(10));
        ret
    }

    fn send_cbw(&mut self, len: u32, flags: u8, cb: &[u8]) -> Result<(), StorageError> {
        if cb.is_empty() || cb.len() > 16 {
            return Err(StorageError::Device);
        }
        self.tag = self.tag.wrapping_add(1);
        let mut cbw = Cbw {
            signature: CBW_SIGNATURE.into(),
            tag: self.tag.into(),
            transfer_length: len.into(),
            flags,
            lun: self.lun,
            cb_length: if cb.len() > 6 { 10 } else { 6 },
            cb: [0; 16],
        };
        cbw.cb[..cb.len()].copy_from_slice(cb);
        match self.port.bulk_out(self.ep_out, cbw.as_bytes()) {
            n if n == size_of::<Cbw>() as i32 => Ok(()),
            n if n >= 0 => Err(StorageError::Device),
            _ => Err(StorageError::Device),
        }
    }

    fn read_csw(&mut self) -> Result<(), StorageError> {
        let mut buf = [0u8; size_of::<Csw>()];
        let n = self.port.bulk_in(self.ep_in, &mut buf);
        if n != size_of::<Csw>() as i32 {
            return Err(StorageError::Device);
        }
        let csw = Csw::read_from_bytes(&buf).unwrap();
        if csw.signature.get() != CSW_SIGNATURE {
            warn!("bad CSW signature {:08x}", csw.signature.get());
            return Err(StorageError::Device);
        }
        if csw.tag.get() != self.tag {
            warn!("CSW tag mismatch {} != {}", csw.tag.get(), self.tag);
            return Err(StorageError::Device);
        }
        if csw.status != 0 {
            return Err(StorageError::Device);
        }
        Ok(())
    }

    fn data_phase(&mut self, data: &mut [u8], write: bool) -> Result<(), StorageError> {
        let mut done = 0;
        while done < data.len() {
            let chunk = (data.len() - done).min(MAX_TRANSFER_SIZE);
            // Callers hand us buffers of unknown alignment; the endpoint
            // needs 32-byte aligned DMA, so misaligned chunks bounce.
            let misaligned = data[done..].as_ptr() as usize % 32 != 0;
            let n = if misaligned {
                if write {
                    self.bounce[..chunk].copy_from_slice(&data[done..done + chunk]);
                }
                let n = if write {
                    let bounce = std::mem::take(&mut self.bounce);
                    let n = self.port.bulk_out(self.ep_out, &bounce[..chunk]);
                    self.bounce = bounce;
                    n
                } else {
                    let mut bounce = std::mem::take(&mut self.bounce);
                    let n = self.port.bulk_in(self.ep_in, &mut bounce[..chunk]);
                    self.bounce = bounce;
                    n
                };
                if !write && n > 0 {
                    data[done..done + n as usize].copy_from_slice(&self.bounce[..n as usize]);
                }
                n
            } else if write {
                self.port.bulk_out(self.ep_out, &data[done..done + chunk])
            } else {
                self.port.bulk_in(self.ep_in, &mut data[done..done + chunk])
            };
            if n as usize != chunk {
                return Err(StorageError::Device);
            }
            done += chunk;
        }
        Ok(())
    }

    /// One full command cycle with the protocol's retry/reset policy.
    fn cycle(&mut self, cb: &[u8], data: &mut [u8], write: bool) -> Result<(), StorageError> {
        let mut retries = CYCLE_RETRIES + 1;
        loop {
            retries -= 1;
            let flags = if write { 0 } else { CBW_FLAGS_IN };
            let attempt = self
                .send_cbw(data.len() as u32, flags, cb)
                .and_then(|()| self.data_phase(data, write))
                .and_then(|()| self.read_csw());
            match attempt {
                Ok(()) => return Ok(()),
                Err(e) if retries == 0 => return Err(e),
                Err(_) => {
                    warn!("command cycle failed, resetting device");
                    self.reset();
                }
            }
        }
    }

    /// Query max LUN and capacity; the device must report 512-byte
    /// sectors.
    pub fn startup(&mut self) -> Result<(), StorageError> {
        let mut max_lun = [0u8; 1];
        // Device-to-host, class, interface recipient.
        if self
            .port
            .control(0xA1, REQUEST_GET_MAX_LUN, 0, self.interface, &mut max_lun)
            < 0
        {
            max_lun[0] = 0;
        }
        self.lun = 0;

        let cb = [SCSI_READ_CAPACITY, self.lun << 5, 0, 0, 0, 0, 0, 0, 0, 0];
        let mut capacity = [0u8; 8];
        self.cycle(&cb, &mut capacity, false)?;
        let last_block = u32::from_be_bytes(capacity[0..4].try_into().unwrap());
        let block_len = u32::from_be_bytes(capacity[4..8].try_into().unwrap());
        if block_len != SECTOR_SIZE as u32 {
            warn!("unsupported sector size {block_len}");
            return Err(StorageError::Device);
        }
        self.sector_count = last_block.saturating_add(1);
        self.ready = true;
        info!("usb storage ready, {} sectors", self.sector_count);
        Ok(())
    }

    /// Whether [`UsbStorage::startup`] succeeded.
    pub fn is_ready(&self) -> bool {
        self.ready
    }

    fn rw10(command: u8, lun: u8, sector: u32, sectors: u16) -> [u8; 10] {
        let s = sector.to_be_bytes();
        let n = sectors.to_be_bytes();
        [command, lun << 5, s[0], s[1], s[2], s[3], 0, n[0], n[1], 0]
    }
}

impl<P: UsbPort> SectorDevice for UsbStorage<P> {
    fn sector_count(&self) -> u32 {
        self.sector_count
    }

    fn read_sectors(&mut self, first: u32, buf: &mut [u8]) -> Result<(), StorageError> {
        if !self.ready {
            return Err(StorageError::NotPresent);
        }
        let sectors = buf.len() / SECTOR_SIZE;
        let cb = Self::rw10(SCSI_READ_10, self.lun, first, sectors as u16);
        self.cycle(&cb, buf, false)
    }

    fn write_sectors(&mut self, first: u32, data: &[u8]) -> Result<(), StorageError> {
        if !self.ready {
            return Err(StorageError::NotPresent);
        }
        let sectors = data.len() / SECTOR_SIZE;
        let cb = Self::rw10(SCSI_WRITE_10, self.lun, first, sectors as u16);
        let mut copy = data.to_vec();
        self.cycle(&cb, &mut copy, true)
    }
}

/// A USB slot for the device manager. Presence is "the device still
/// answers"; a vanished device reads as ejected and the slot recovers
/// when enumeration hands us a new port.
pub struct UsbMediaSource<P: UsbPort> {
    device: std::sync::Arc<parking_lot::Mutex<UsbStorage<P>>>,
}

impl<P: UsbPort> fmt::Debug for UsbMediaSource<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UsbMediaSource").finish_non_exhaustive()
    }
}

impl<P: UsbPort> UsbMediaSource<P> {
    /// Wrap an enumerated device for slot management.
    pub fn new(device: UsbStorage<P>) -> UsbMediaSource<P> {
        UsbMediaSource {
            device: std::sync::Arc::new(parking_lot::Mutex::new(device)),
        }
    }
}

impl<P: UsbPort + 'static> crate::storage::devmgr::MediaSource for UsbMediaSource<P> {
    fn poll_present(&mut self) -> bool {
        let mut dev = self.device.lock();
        if dev.is_ready() {
            return true;
        }
        dev.startup().is_ok()
    }

    fn open(&mut self) -> Result<crate::storage::SharedDevice, StorageError> {
        {
            let mut dev = self.device.lock();
            if !dev.is_ready() {
                dev.startup()?;
            }
        }
        Ok(std::sync::Arc::clone(&self.device) as crate::storage::SharedDevice)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct MockUsb {
        disk: Vec<u8>,
        pending: Option<Cbw>,
        data_done: u32,
        fail_next: u32,
        hard_fail: bool,
        resets: u32,
        halts_cleared: u32,
        tags: Vec<u32>,
    }

    impl MockUsb {
        fn new(sectors: usize) -> MockUsb {
            MockUsb {
                disk: vec![0; sectors * SECTOR_SIZE],
                ..MockUsb::default()
            }
        }

        fn make_csw(&mut self, status: u8) -> Csw {
            let cbw = self.pending.take().unwrap();
            Csw {
                signature: CSW_SIGNATURE.into(),
                tag: cbw.tag,
                data_residue: (cbw.transfer_length.get() - self.data_done).into(),
                status,
            }
        }

        fn lba(cb: &[u8]) -> usize {
            u32::from_be_bytes(cb[2..6].try_into().unwrap()) as usize * SECTOR_SIZE
        }
    }

    impl UsbPort for MockUsb {
        fn bulk_out(&mut self, _ep: u8, data: &[u8]) -> i32 {
            if self.hard_fail {
                return -7101;
            }
            if self.fail_next > 0 {
                self.fail_next -= 1;
                return -7101;
            }
            if self.pending.is_none() {
                let cbw = Cbw::read_from_bytes(data).unwrap();
                assert_eq!(cbw.signature.get(), CBW_SIGNATURE);
                self.tags.push(cbw.tag.get());
                self.pending = Some(cbw);
                self.data_done = 0;
                return data.len() as i32;
            }
            // WRITE data phase.
            let cbw = self.pending.unwrap();
            let start = Self::lba(&cbw.cb) + self.data_done as usize;
            self.disk[start..start + data.len()].copy_from_slice(data);
            self.data_done += data.len() as u32;
            data.len() as i32
        }

        fn bulk_in(&mut self, _ep: u8, buf: &mut [u8]) -> i32 {
            if self.hard_fail {
                return -7101;
            }
            if self.fail_next > 0 {
                self.fail_next -= 1;
                return -7101;
            }
            let cbw = self.pending.unwrap();
            if self.data_done == cbw.transfer_length.get() {
                // Status phase.
                let csw = self.make_csw(0);
                buf[..size_of::<Csw>()].copy_from_slice(csw.as_bytes());
                return size_of::<Csw>() as i32;
            }
            // READ data phase.
            match cbw.cb[0] {
                0x25 => {
                    let last = (self.disk.len() / SECTOR_SIZE - 1) as u32;
                    buf[0..4].copy_from_slice(&last.to_be_bytes());
                    buf[4..8].copy_from_slice(&(SECTOR_SIZE as u32).to_be_bytes());
                }
                0x28 => {
                    let start = Self::lba(&cbw.cb) + self.data_done as usize;
                    buf.copy_from_slice(&self.disk[start..start + buf.len()]);
                }
                other => panic!("unexpected SCSI command {other:#x}"),
            }
            self.data_done += buf.len() as u32;
            buf.len() as i32
        }

        fn control(
            &mut self,
            _request_type: u8,
            request: u8,
            _value: u16,
            _index: u16,
            data: &mut [u8],
        ) -> i32 {
            match request {
                REQUEST_GET_MAX_LUN => {
                    data[0] = 0;
                    0
                }
                REQUEST_RESET => {
                    self.resets += 1;
                    self.pending = None;
                    0
                }
                _ => -4,
            }
        }

        fn clear_halt(&mut self, _endpoint: u8) -> i32 {
            self.halts_cleared += 1;
            0
        }
    }

    fn ready_storage(sectors: usize) -> UsbStorage<MockUsb> {
        let mut dev = UsbStorage::new(MockUsb::new(sectors), 0x81, 0x02, 0);
        dev.startup().unwrap();
        dev
    }

    #[test]
    fn startup_reads_capacity() {
        let dev = ready_storage(64);
        assert_eq!(dev.sector_count(), 64);
        assert!(dev.is_ready());
    }

    #[test]
    fn read_write_round_trip() {
        let mut dev = ready_storage(64);
        let data: Vec<u8> = (0..3 * SECTOR_SIZE).map(|i| (i % 255) as u8).collect();
        dev.write_sectors(7, &data).unwrap();
        let mut back = vec![0u8; data.len()];
        dev.read_sectors(7, &mut back).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn tags_are_monotonic() {
        let mut dev = ready_storage(16);
        let mut buf = vec![0u8; SECTOR_SIZE];
        dev.read_sectors(0, &mut buf).unwrap();
        dev.read_sectors(1, &mut buf).unwrap();
        let tags = &dev.port.tags;
        assert!(tags.windows(2).all(|w| w[1] == w[0] + 1));
    }

    #[test]
    fn failed_cycle_resets_and_retries() {
        let mut dev = ready_storage(16);
        dev.port.fail_next = 1;
        let mut buf = vec![0u8; SECTOR_SIZE];
        dev.read_sectors(2, &mut buf).unwrap();
        assert_eq!(dev.port.resets, 1);
        assert_eq!(dev.port.halts_cleared, 2);
    }

    #[test]
    fn persistent_failure_gives_up() {
        let mut dev = ready_storage(16);
        dev.port.hard_fail = true;
        let mut buf = vec![0u8; SECTOR_SIZE];
        assert_eq!(dev.read_sectors(2, &mut buf), Err(StorageError::Device));
        assert_eq!(dev.port.resets, CYCLE_RETRIES);
    }

    #[test]
    fn large_transfer_is_chunked() {
        let mut dev = ready_storage(128);
        let data: Vec<u8> = (0..40 * SECTOR_SIZE).map(|i| (i * 3 % 247) as u8).collect();
        dev.write_sectors(0, &data).unwrap();
        let mut back = vec![0u8; data.len()];
        dev.read_sectors(0, &mut back).unwrap();
        assert_eq!(back, data);
    }
}
