//! Virtual disc reader.
//!
//! A retail disc image lives as one or two files on external FAT storage;
//! this module makes it look like a disc in the drive. Raw reads straddle
//! the parts, partition reads decrypt the 0x8000-byte blocks of the data
//! area (0x400 bytes of hash metadata holding the IV, 0x7C00 bytes of
//! payload) under the partition's title key, and a cluster map built at
//! open time keeps the drive's habit of long backward seeks cheap.

use std::fmt;
use std::sync::Arc;

use log::error;
use log::info;
use log::warn;
use zerocopy::FromBytes;

use crate::abi::DiskId;
use crate::abi::PartitionHeader;
use crate::abi::TMD_MAX_SIZE;
use crate::abi::TMD_MIN_SIZE;
use crate::emu::es::TitleContext;
use crate::error::DiError;
use crate::error::DiResult;
use crate::hw::aes::AesEngine;
use crate::storage::devmgr::DeviceManager;
use crate::storage::devmgr::Drive;
use crate::storage::fat::ClusterFile;

/// Encryption unit of a partition's data area.
pub const BLOCK_SIZE: usize = 0x8000;

/// Hash metadata at the head of each block.
pub const BLOCK_HEADER_SIZE: usize = 0x400;

/// Payload bytes per block.
pub const BLOCK_DATA_SIZE: usize = BLOCK_SIZE - BLOCK_HEADER_SIZE;

/// Offset of the 16-byte CBC IV inside a block's hash metadata.
pub const BLOCK_IV_OFFSET: usize = 0x3D0;

/// The common key that unwraps ticket title keys.
pub const COMMON_KEY: [u8; 16] = [
    0xeb, 0xe4, 0x2a, 0x22, 0x5e, 0x85, 0x93, 0xe4, 0x48, 0xd9, 0xc5, 0x45, 0x73, 0x81, 0xaa,
    0xf7,
];

/// Ticket common-key index selecting the region key.
pub const COMMON_KEY_INDEX_KOREAN: u8 = 1;

struct Part {
    file: ClusterFile,
    size: u64,
}

struct OpenPartition {
    /// Word offset of the partition on the image.
    offset: u32,
    header: PartitionHeader,
    title_key: [u8; 16],
}

/// A disc image split over one or two files on a mounted drive.
pub struct SplitImage {
    devices: Arc<DeviceManager>,
    drive: Drive,
    aes: Arc<AesEngine>,
    title_ctx: Arc<TitleContext>,
    parts: Vec<Part>,
    total_size: u64,
    disk_id_read: bool,
    partition: Option<OpenPartition>,
    /// Word offset of the block held decrypted below; `1` can never be a
    /// block offset, so it marks the cache empty.
    cached_block: u32,
    block_buf: Vec<u8>,
    decrypted: Vec<u8>,
}

impl fmt::Debug for SplitImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SplitImage")
            .field("drive", &self.drive)
            .field("parts", &self.parts.len())
            .field("total_size", &self.total_size)
            .field("partition_open", &self.partition.is_some())
            .finish_non_exhaustive()
    }
}

const CACHE_EMPTY: u32 = 1;

impl SplitImage {
    /// Open the image file(s) by path on `drive` and build the cluster
    /// maps.
    pub fn open(
        devices: Arc<DeviceManager>,
        drive: Drive,
        aes: Arc<AesEngine>,
        title_ctx: Arc<TitleContext>,
        paths: &[&str],
    ) -> Result<SplitImage, DiError> {
        assert!(!paths.is_empty() && paths.len() <= 2);

        let mut parts = Vec::new();
        for path in paths {
            let part = devices
                .with_volume(drive, |vol| {
                    let entry = vol.locate(path)?;
                    Ok((vol.device(), vol.geometry(), entry))
                })
                .map_err(|e| {
                    error!("failed to open image part {path}: {e}");
                    DiError::Drive
                })?;
            let (device, geometry, entry) = part;
            let mut file = ClusterFile::new(device, geometry, entry.start_cluster);
            file.build_map();
            parts.push(Part {
                file,
                size: u64::from(entry.size),
            });
        }

        let total_size = parts.iter().map(|p| p.size).sum();
        info!(
            "opened disc image: {} part(s), {:#x} bytes",
            parts.len(),
            total_size
        );

        Ok(SplitImage {
            devices,
            drive,
            aes,
            title_ctx,
            parts,
            total_size,
            disk_id_read: false,
            partition: None,
            cached_block: CACHE_EMPTY,
            block_buf: vec![0; BLOCK_SIZE],
            decrypted: vec![0; BLOCK_DATA_SIZE],
        })
    }

    /// Whether the backing drive is still present.
    pub fn is_inserted(&self) -> bool {
        self.devices.is_inserted(self.drive)
    }

    /// The device manager the image lives on.
    pub fn devices_handle(&self) -> Arc<DeviceManager> {
        Arc::clone(&self.devices)
    }

    /// Absolute image read. `word_offset` is in 4-byte words.
    pub fn read_raw(&mut self, buf: &mut [u8], word_offset: u32) -> DiResult {
        if buf.is_empty() {
            warn!("zero length read");
            return Err(DiError::Drive);
        }
        let offset = u64::from(word_offset) * 4;
        if offset + buf.len() as u64 > self.total_size {
            error!("read off the end of the image");
            return Err(DiError::Drive);
        }

        let part_size = self.parts[0].size;
        let mut pos = offset;
        let mut done = 0usize;
        while done < buf.len() {
            let part_index = (pos / part_size) as usize;
            let within = pos % part_size;
            let part = &mut self.parts[part_index];
            let take = (buf.len() - done).min((part.size - within) as usize);
            let got = part
                .file
                .read_at(within, &mut buf[done..done + take])
                .map_err(|_| DiError::Drive)?;
            if got != take {
                return Err(DiError::Drive);
            }
            pos += take as u64;
            done += take;
        }
        Ok(())
    }

    /// Header-area read; the caller enforces the allowed window.
    pub fn unencrypted_read(&mut self, buf: &mut [u8], word_offset: u32) -> DiResult {
        self.read_raw(buf, word_offset)
    }

    /// The 32-byte disc header. Must be called before a partition can be
    /// opened.
    pub fn read_disk_id(&mut self) -> Result<DiskId, DiError> {
        let mut buf = [0u8; size_of::<DiskId>()];
        self.read_raw(&mut buf, 0)?;
        self.disk_id_read = true;
        Ok(DiskId::read_from_bytes(&buf).unwrap())
    }

    fn partition(&self) -> Result<&OpenPartition, DiError> {
        self.partition.as_ref().ok_or(DiError::Invalid)
    }

    /// Copy the open partition's TMD into `out`.
    pub fn read_tmd(&mut self, out: &mut [u8]) -> DiResult {
        let (offset, header) = {
            let p = self.partition()?;
            (p.offset, p.header)
        };
        let tmd_len = header.tmd_byte_length.get() as usize;
        if !(TMD_MIN_SIZE..=TMD_MAX_SIZE).contains(&tmd_len) {
            error!("TMD size is invalid");
            return Err(DiError::Security);
        }
        if header.tmd_word_offset.get() == 0 {
            error!("TMD offset is invalid");
            return Err(DiError::Security);
        }
        if out.len() < tmd_len {
            return Err(DiError::Security);
        }
        self.read_raw(
            &mut out[..tmd_len],
            offset + header.tmd_word_offset.get(),
        )
        .map_err(|_| {
            error!("failed to read TMD from disc image");
            DiError::Drive
        })
    }

    /// Open the partition whose descriptor sits at `word_offset`, verify
    /// its identity, derive the title key and return the TMD through
    /// `tmd_out`.
    pub fn open_partition(&mut self, word_offset: u32, tmd_out: &mut [u8]) -> DiResult {
        if self.partition.is_some() {
            error!("attempt to open a partition while one is open");
            return Err(DiError::Invalid);
        }
        if !self.disk_id_read {
            error!("the disc header must be read before opening a partition");
            return Err(DiError::Invalid);
        }

        let mut raw = vec![0u8; size_of::<PartitionHeader>()];
        self.read_raw(&mut raw, word_offset).map_err(|_| {
            error!("failed to read partition at {word_offset:#x}");
            DiError::Drive
        })?;
        let header = PartitionHeader::read_from_bytes(&raw).unwrap();

        // The data area must lie inside the image.
        let data_end = u64::from(word_offset)
            + u64::from(header.data_word_offset.get())
            + u64::from(header.data_word_length.get());
        if data_end * 4 > self.total_size {
            error!("partition data area exceeds the image");
            return Err(DiError::Security);
        }

        self.partition = Some(OpenPartition {
            offset: word_offset,
            header,
            title_key: [0; 16],
        });
        if let Err(e) = self.read_tmd(tmd_out) {
            self.partition = None;
            return Err(e);
        }

        let title_id = header.ticket.info.title_id.get();
        if let Err(e) = self.title_ctx.di_verify(title_id, &header.ticket) {
            self.partition = None;
            error!("partition verification failed: {e:?}");
            return Err(DiError::Verify);
        }

        let key = match header.ticket.info.common_key_index {
            COMMON_KEY_INDEX_KOREAN => {
                // The region key is imported at bootstrap; without it the
                // common key is the only option.
                crate::system::korean_key().unwrap_or(COMMON_KEY)
            }
            _ => COMMON_KEY,
        };
        let mut iv = [0u8; 16];
        iv[..8].copy_from_slice(&title_id.to_be_bytes());
        let mut title_key = [0u8; 16];
        if self
            .aes
            .decrypt(&key, &iv, &header.ticket.title_key, &mut title_key)
            .is_err()
        {
            self.partition = None;
            return Err(DiError::Invalid);
        }

        let partition = self.partition.as_mut().unwrap();
        partition.title_key = title_key;
        self.cached_block = CACHE_EMPTY;
        info!("partition at {word_offset:#x} open, title {title_id:016x}");
        Ok(())
    }

    /// Close the open partition. The block cache dies with the key.
    pub fn close_partition(&mut self) {
        self.partition = None;
        self.cached_block = CACHE_EMPTY;
    }

    /// Whether a partition is open.
    pub fn is_partition_open(&self) -> bool {
        self.partition.is_some()
    }

    fn load_block(&mut self, block_word_offset: u32) -> DiResult {
        if self.cached_block == block_word_offset {
            return Ok(());
        }

        let mut block = std::mem::take(&mut self.block_buf);
        let result = self.read_raw(&mut block, block_word_offset);
        self.block_buf = block;
        result.map_err(|e| {
            error!("failed to read block from disc image");
            e
        })?;

        let title_key = self.partition()?.title_key;
        let mut iv = [0u8; 16];
        iv.copy_from_slice(&self.block_buf[BLOCK_IV_OFFSET..BLOCK_IV_OFFSET + 16]);
        self.aes
            .decrypt(
                &title_key,
                &iv,
                &self.block_buf[BLOCK_HEADER_SIZE..],
                &mut self.decrypted,
            )
            .map_err(|_| DiError::Drive)?;
        self.cached_block = block_word_offset;
        Ok(())
    }

    /// Read from the open partition's decrypted data stream.
    /// `word_offset` is relative to the partition data area; the length
    /// must be a multiple of 32.
    pub fn read_from_partition(&mut self, buf: &mut [u8], word_offset: u32) -> DiResult {
        let data_start = {
            let p = self.partition().map_err(|e| {
                error!("attempt to read with no open partition");
                e
            })?;
            p.offset + p.header.data_word_offset.get()
        };
        if buf.len() % 32 != 0 {
            error!("read length not 32-byte aligned");
            return Err(DiError::Drive);
        }
        if buf.is_empty() {
            return Ok(());
        }

        let data_words = (BLOCK_DATA_SIZE >> 2) as u32;
        let block_words = (BLOCK_SIZE >> 2) as u32;
        let mut block_word_offset = data_start + word_offset / data_words * block_words;
        let mut copy_offset = ((word_offset % data_words) << 2) as usize;
        let mut done = 0usize;

        while done < buf.len() {
            self.load_block(block_word_offset)?;
            let take = (buf.len() - done).min(BLOCK_DATA_SIZE - copy_offset);
            buf[done..done + take]
                .copy_from_slice(&self.decrypted[copy_offset..copy_offset + take]);
            done += take;
            copy_offset = 0;
            block_word_offset += block_words;
        }
        Ok(())
    }
}

/// The disc backends the drive emulator can serve from. There is one
/// today; the dispatch stays a tagged variant so future image formats
/// slot in without a trait object.
#[derive(Debug)]
pub enum VirtualDisc {
    /// A (possibly split) plain image file.
    SplitImage(SplitImage),
}

impl VirtualDisc {
    /// Whether the backing medium is present.
    pub fn is_inserted(&self) -> bool {
        match self {
            VirtualDisc::SplitImage(iso) => iso.is_inserted(),
        }
    }

    /// See [`SplitImage::unencrypted_read`].
    pub fn unencrypted_read(&mut self, buf: &mut [u8], word_offset: u32) -> DiResult {
        match self {
            VirtualDisc::SplitImage(iso) => iso.unencrypted_read(buf, word_offset),
        }
    }

    /// See [`SplitImage::read_from_partition`].
    pub fn read_from_partition(&mut self, buf: &mut [u8], word_offset: u32) -> DiResult {
        match self {
            VirtualDisc::SplitImage(iso) => iso.read_from_partition(buf, word_offset),
        }
    }

    /// See [`SplitImage::read_disk_id`].
    pub fn read_disk_id(&mut self) -> Result<DiskId, DiError> {
        match self {
            VirtualDisc::SplitImage(iso) => iso.read_disk_id(),
        }
    }

    /// See [`SplitImage::read_tmd`].
    pub fn read_tmd(&mut self, out: &mut [u8]) -> DiResult {
        match self {
            VirtualDisc::SplitImage(iso) => iso.read_tmd(out),
        }
    }

    /// See [`SplitImage::open_partition`].
    pub fn open_partition(&mut self, word_offset: u32, tmd_out: &mut [u8]) -> DiResult {
        match self {
            VirtualDisc::SplitImage(iso) => iso.open_partition(word_offset, tmd_out),
        }
    }

    /// See [`SplitImage::close_partition`].
    pub fn close_partition(&mut self) {
        match self {
            VirtualDisc::SplitImage(iso) => iso.close_partition(),
        }
    }

    /// Whether a partition is open.
    pub fn is_partition_open(&self) -> bool {
        match self {
            VirtualDisc::SplitImage(iso) => iso.is_partition_open(),
        }
    }
}
