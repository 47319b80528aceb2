//! SD host-controller driver.
//!
//! The card sits behind the kernel's SD interface, which exposes the host
//! controller through ioctls: register access, clock control and a
//! command/DMA transport. [`SdioPort`] is that ioctl surface; the driver
//! speaks the card-initialization and multi-block transfer protocol over
//! it and presents the result as a [`SectorDevice`].

use std::fmt;

use bitflags::bitflags;
use log::error;
use log::info;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

use crate::storage::SECTOR_SIZE;
use crate::storage::SectorDevice;
use crate::storage::StorageError;

/// Ioctl numbers of the SD host interface.
pub mod ioctl {
    /// Write a host-controller register.
    pub const WRITE_HCR: u32 = 0x1;
    /// Read a host-controller register.
    pub const READ_HCR: u32 = 0x2;
    /// Reset the card and capture its relative address.
    pub const RESET_CARD: u32 = 0x4;
    /// Set the controller clock divisor.
    pub const SET_CLOCK: u32 = 0x6;
    /// Send a command without a data phase.
    pub const SEND_COMMAND: u32 = 0x7;
    /// Read the controller status word.
    pub const GET_STATUS: u32 = 0xB;
}

bitflags! {
    /// Controller status word.
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct SdStatus: u32 {
        /// A card is physically present.
        const INSERTED = 1 << 0;
        /// The card is a memory card (not SDIO).
        const MEMORY = 1 << 16;
        /// High-capacity card: commands take block instead of byte
        /// addresses.
        const SDHC = 1 << 20;
    }
}

/// Host-control register offset and its 4-bit-bus enable flag.
const HCR_HOST_CONTROL_1: u32 = 0x28;
const HCR_HOST_CONTROL_1_4BIT: u32 = 1 << 1;

mod cmd {
    pub const SELECT: u32 = 7;
    pub const SET_BLOCKLEN: u32 = 16;
    pub const READ_MULTIPLE_BLOCK: u32 = 18;
    pub const WRITE_MULTIPLE_BLOCK: u32 = 25;
    pub const APP_CMD: u32 = 55;
    pub const ACMD_SET_BUS_WIDTH: u32 = 6;
}

const RESPONSE_TYPE_R1: u32 = 0x1;
const RESPONSE_TYPE_R1B: u32 = 0x2;
const COMMAND_TYPE_AC: u32 = 3;

/// Sectors the internal bounce buffer holds; larger transfers are chunked.
pub const BOUNCE_SECTORS: usize = 8;

/// Register-access block of the `READ_HCR`/`WRITE_HCR` ioctls.
#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct RegOp {
    /// Register offset.
    pub reg: u32,
    reserved0: u32,
    reserved1: u32,
    /// Access width in bytes.
    pub size: u32,
    /// Value to write; unused for reads.
    pub val: u32,
    reserved2: u32,
}

/// Command block of the `SEND_COMMAND` ioctl and the DMA transport.
#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct CommandBlock {
    /// Command index.
    pub command: u32,
    /// Command class.
    pub command_type: u32,
    /// Expected response format.
    pub response_type: u32,
    /// Command argument.
    pub arg: u32,
    /// Data-phase block count.
    pub block_count: u32,
    /// Data-phase block size.
    pub block_size: u32,
    /// Whether a DMA buffer accompanies the command.
    pub is_dma: u32,
    reserved: [u32; 2],
}

const _: () = assert!(size_of::<CommandBlock>() == 0x24);

/// The kernel's SD host-controller ioctl surface.
pub trait SdioPort: Send {
    /// Plain ioctl with one input and one output buffer.
    fn ioctl(&mut self, cmd: u32, input: &[u8], output: &mut [u8]) -> i32;

    /// The ioctlv transport for commands with a data phase: the command
    /// block and the DMA buffer go in, the 16-byte response comes out.
    /// `write` gives the data direction.
    fn send_dma_command(
        &mut self,
        request: &CommandBlock,
        buffer: &mut [u8],
        write: bool,
        response: &mut [u8; 16],
    ) -> i32;
}

/// Driver state for one SD slot.
pub struct SdCard<P> {
    port: P,
    rca: u16,
    sdhc: bool,
    ready: bool,
    bounce: Box<[u8]>,
}

impl<P> fmt::Debug for SdCard<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SdCard")
            .field("rca", &self.rca)
            .field("sdhc", &self.sdhc)
            .field("ready", &self.ready)
            .finish_non_exhaustive()
    }
}

impl<P: SdioPort> SdCard<P> {
    /// Wrap an opened host-controller port. The card is not initialized
    /// until [`SdCard::startup`].
    pub fn new(port: P) -> SdCard<P> {
        SdCard {
            port,
            rca: 0,
            sdhc: false,
            ready: false,
            bounce: vec![0; BOUNCE_SECTORS * SECTOR_SIZE].into_boxed_slice(),
        }
    }

    fn reset_card(&mut self) -> Result<(), StorageError> {
        let mut out = [0u8; 4];
        if self.port.ioctl(ioctl::RESET_CARD, &[], &mut out) < 0 {
            error!("failed to reset card");
            return Err(StorageError::Device);
        }
        self.rca = (u32::from_ne_bytes(out) >> 16) as u16;
        info!("card reset, rca {:04x}", self.rca);
        Ok(())
    }

    fn status(&mut self) -> Result<SdStatus, StorageError> {
        let mut out = [0u8; 4];
        if self.port.ioctl(ioctl::GET_STATUS, &[], &mut out) < 0 {
            return Err(StorageError::Device);
        }
        Ok(SdStatus::from_bits_retain(u32::from_ne_bytes(out)))
    }

    fn read_hcr(&mut self, reg: u32, size: u32) -> Result<u32, StorageError> {
        let op = RegOp {
            reg,
            reserved0: 0,
            reserved1: 0,
            size,
            val: 0,
            reserved2: 0,
        };
        let mut out = [0u8; 4];
        if self.port.ioctl(ioctl::READ_HCR, op.as_bytes(), &mut out) < 0 {
            return Err(StorageError::Device);
        }
        Ok(u32::from_ne_bytes(out))
    }

    fn write_hcr(&mut self, reg: u32, size: u32, val: u32) -> Result<(), StorageError> {
        let op = RegOp {
            reg,
            reserved0: 0,
            reserved1: 0,
            size,
            val,
            reserved2: 0,
        };
        if self.port.ioctl(ioctl::WRITE_HCR, op.as_bytes(), &mut []) < 0 {
            return Err(StorageError::Device);
        }
        Ok(())
    }

    fn set_clock(&mut self, divisor: u32) -> Result<(), StorageError> {
        if self
            .port
            .ioctl(ioctl::SET_CLOCK, &divisor.to_ne_bytes(), &mut [])
            < 0
        {
            return Err(StorageError::Device);
        }
        Ok(())
    }

    fn command(
        &mut self,
        command: u32,
        response_type: u32,
        arg: u32,
    ) -> Result<u32, StorageError> {
        let block = CommandBlock {
            command,
            command_type: COMMAND_TYPE_AC,
            response_type,
            arg,
            block_count: 0,
            block_size: 0,
            is_dma: 0,
            reserved: [0; 2],
        };
        let mut out = [0u8; 16];
        if self
            .port
            .ioctl(ioctl::SEND_COMMAND, block.as_bytes(), &mut out)
            < 0
        {
            return Err(StorageError::Device);
        }
        Ok(u32::from_ne_bytes(out[..4].try_into().unwrap()))
    }

    fn select(&mut self) -> Result<(), StorageError> {
        self.command(cmd::SELECT, RESPONSE_TYPE_R1B, u32::from(self.rca) << 16)
            .map(|_| ())
    }

    fn deselect(&mut self) -> Result<(), StorageError> {
        self.command(cmd::SELECT, RESPONSE_TYPE_R1B, 0).map(|_| ())
    }

    fn enable_host_4bit_bus(&mut self) -> Result<(), StorageError> {
        let val = self.read_hcr(HCR_HOST_CONTROL_1, 1)?;
        self.write_hcr(HCR_HOST_CONTROL_1, 1, val | HCR_HOST_CONTROL_1_4BIT)
    }

    fn enable_card_4bit_bus(&mut self) -> Result<(), StorageError> {
        self.command(cmd::APP_CMD, RESPONSE_TYPE_R1, u32::from(self.rca) << 16)?;
        self.command(cmd::ACMD_SET_BUS_WIDTH, RESPONSE_TYPE_R1, 0x2)
            .map(|_| ())
    }

    /// Full card bring-up: reset, presence and type checks, 4-bit bus on
    /// both ends, full-speed clock, 512-byte blocks.
    pub fn startup(&mut self) -> Result<(), StorageError> {
        self.ready = false;
        self.reset_card()?;

        let status = self.status()?;
        if !status.contains(SdStatus::INSERTED) {
            info!("no card inserted");
            return Err(StorageError::NotPresent);
        }
        if !status.contains(SdStatus::MEMORY) {
            info!("not a memory card");
            return Err(StorageError::Device);
        }
        self.sdhc = status.contains(SdStatus::SDHC);

        self.enable_host_4bit_bus()?;
        self.set_clock(1)?;
        self.select()?;

        let finish = self
            .command(cmd::SET_BLOCKLEN, RESPONSE_TYPE_R1, SECTOR_SIZE as u32)
            .and_then(|_| self.enable_card_4bit_bus());
        self.deselect()?;
        finish?;

        self.ready = true;
        info!("card ready, sdhc: {}", self.sdhc);
        Ok(())
    }

    /// Whether a card is physically present.
    pub fn is_inserted(&mut self) -> bool {
        self.status()
            .map(|s| s.contains(SdStatus::INSERTED))
            .unwrap_or(false)
    }

    /// Whether [`SdCard::startup`] has completed since the last insertion.
    pub fn is_ready(&self) -> bool {
        self.ready
    }

    fn transfer_chunk(
        &mut self,
        write: bool,
        first_sector: u32,
        sectors: usize,
    ) -> Result<(), StorageError> {
        let command = if write {
            cmd::WRITE_MULTIPLE_BLOCK
        } else {
            cmd::READ_MULTIPLE_BLOCK
        };
        // High-capacity cards take block addresses, the rest byte offsets.
        let arg = if self.sdhc {
            first_sector
        } else {
            first_sector * SECTOR_SIZE as u32
        };
        let block = CommandBlock {
            command,
            command_type: COMMAND_TYPE_AC,
            response_type: RESPONSE_TYPE_R1,
            arg,
            block_count: sectors as u32,
            block_size: SECTOR_SIZE as u32,
            is_dma: 1,
            reserved: [0; 2],
        };
        let mut response = [0u8; 16];
        let len = sectors * SECTOR_SIZE;
        let mut buffer = std::mem::take(&mut self.bounce);
        let ret = self
            .port
            .send_dma_command(&block, &mut buffer[..len], write, &mut response);
        self.bounce = buffer;
        if ret < 0 {
            error!("sd transfer failed: {ret}");
            return Err(StorageError::Device);
        }
        Ok(())
    }

    fn transfer(&mut self, write: bool, first: u32, buf: &mut [u8]) -> Result<(), StorageError> {
        if !self.ready {
            return Err(StorageError::NotPresent);
        }
        self.select()?;

        let mut sector = first;
        let mut done = 0;
        let result = loop {
            if done == buf.len() {
                break Ok(());
            }
            let chunk = (buf.len() - done).min(BOUNCE_SECTORS * SECTOR_SIZE);
            let sectors = chunk / SECTOR_SIZE;
            if write {
                self.bounce[..chunk].copy_from_slice(&buf[done..done + chunk]);
            }
            if let Err(e) = self.transfer_chunk(write, sector, sectors) {
                break Err(e);
            }
            if !write {
                buf[done..done + chunk].copy_from_slice(&self.bounce[..chunk]);
            }
            sector += sectors as u32;
            done += chunk;
        };

        self.deselect()?;
        result
    }
}

impl<P: SdioPort> SectorDevice for SdCard<P> {
    fn sector_count(&self) -> u32 {
        // Capacity is not interrogated; the filesystem carries its own
        // bounds and the card errors on reads past the medium.
        u32::MAX
    }

    fn read_sectors(&mut self, first: u32, buf: &mut [u8]) -> Result<(), StorageError> {
        self.transfer(false, first, buf)
    }

    fn write_sectors(&mut self, first: u32, data: &[u8]) -> Result<(), StorageError> {
        let mut copy = data.to_vec();
        self.transfer(true, first, &mut copy)
    }
}

/// The SD slot as the device manager sees it: presence comes from the
/// controller status word, bring-up is the full card init.
pub struct SdMediaSource<P: SdioPort> {
    card: std::sync::Arc<parking_lot::Mutex<SdCard<P>>>,
}

impl<P: SdioPort> fmt::Debug for SdMediaSource<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SdMediaSource").finish_non_exhaustive()
    }
}

impl<P: SdioPort> SdMediaSource<P> {
    /// Wrap a card for slot management.
    pub fn new(card: SdCard<P>) -> SdMediaSource<P> {
        SdMediaSource {
            card: std::sync::Arc::new(parking_lot::Mutex::new(card)),
        }
    }
}

impl<P: SdioPort + 'static> crate::storage::devmgr::MediaSource for SdMediaSource<P> {
    fn poll_present(&mut self) -> bool {
        self.card.lock().is_inserted()
    }

    fn open(&mut self) -> Result<crate::storage::SharedDevice, StorageError> {
        self.card.lock().startup()?;
        Ok(std::sync::Arc::clone(&self.card) as crate::storage::SharedDevice)
    }
}
