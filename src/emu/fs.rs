//! Emulated internal filesystem.
//!
//! The internal storage service has two faces: file paths opened directly
//! (`IOS_Open("/tmp/file.bin")`, then read/write/seek and one stats
//! ioctl), and the manager device `/dev/fs` whose ioctls do the
//! housekeeping (create, delete, rename, attributes, directory listing).
//! This emulator stands in front of both. Opens whose path the replaced
//! set covers are served from FAT storage; everything else is reissued
//! against the genuine service under the caller's identity and its answer
//! forwarded unchanged.
//!
//! The descriptor space is partitioned so dispatch can classify a handle
//! without bookkeeping:
//!
//! * `0..15` replaced files backed by FAT,
//! * `100..115` forwards to real filesystem descriptors,
//! * `200..232` manager handles (several may be open at once),
//! * `300..315` direct-access handles for the external-FAT device path.
//!
//! The partitioning is fixed for the life of the process.

use std::fmt;
use std::sync::Arc;

use log::error;
use log::info;
use log::warn;
use num_enum::TryFromPrimitive;
use zerocopy::FromBytes;
use zerocopy::FromZeros;
use zerocopy::IntoBytes;

use crate::abi::AttrBlock;
use crate::abi::DIRECT_MAX_PATH;
use crate::abi::DirectStat;
use crate::abi::FAT_ATTR_DIRECTORY;
use crate::abi::FS_MAX_PATH;
use crate::abi::FileStats;
use crate::abi::RenameBlock;
use crate::abi::path_array;
use crate::config::Config;
use crate::config::is_path_valid;
use crate::error::FsError;
use crate::error::FsResult;
use crate::error::IosError;
use crate::error::fs_reply;
use crate::ipc::Caller;
use crate::ipc::MAX_VECTORS;
use crate::ipc::OpenMode;
use crate::ipc::SeekOrigin;
use crate::ipc::Vectors;
use crate::resource::KernelIpc;
use crate::resource::Resource;
use crate::storage::devmgr::DeviceManager;
use crate::storage::devmgr::Drive;
use crate::storage::fat::EntryInfo;
use crate::storage::fat::PathKind;
use crate::util::cstr;
use crate::util::word_copy;

/// Alias prefix the open hook rewrites filesystem paths onto.
pub const ALIAS_PREFIX: char = '$';

/// The direct-access device path for external FAT storage.
pub const DIRECT_PATH: &str = "/dev/saoirse/file";

/// The real manager's path.
pub const REAL_PATH: &str = "/dev/fs";

const REPLACED_BASE: i32 = 0;
const REPLACED_COUNT: usize = 15;

const REAL_BASE: i32 = 100;
const REAL_COUNT: usize = 15;

const MGR_BASE: i32 = 200;
// The true limit is whatever the real service enforces; 32 concurrent
// manager handles is more than any title opens.
const MGR_COUNT: usize = 32;

const DIRECT_BASE: i32 = 300;
const DIRECT_COUNT: usize = 15;

/// Streaming buffer used when a rename crosses from the real filesystem
/// into FAT.
const COPY_BUFFER_SIZE: usize = 0x2000;

/// Manager and file ioctl numbers of the filesystem service.
#[derive(Clone, Copy, Debug, Eq, PartialEq, TryFromPrimitive)]
#[repr(u32)]
#[allow(missing_docs)]
pub enum FsIoctl {
    Format = 0x1,
    GetStats = 0x2,
    CreateDir = 0x3,
    ReadDir = 0x4,
    SetAttr = 0x5,
    GetAttr = 0x6,
    Delete = 0x7,
    Rename = 0x8,
    CreateFile = 0x9,
    GetFileStats = 0xB,
    GetUsage = 0xC,
    Shutdown = 0xD,
    DirectOpen = 0x1000,
    DirectOpenDir = 0x1001,
    DirectDirNext = 0x1002,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum DescType {
    Replaced,
    Real,
    Manager,
    Direct,
    Unknown,
}

fn descriptor_type(fd: i32) -> DescType {
    match fd {
        _ if (REPLACED_BASE..REPLACED_BASE + REPLACED_COUNT as i32).contains(&fd) => {
            DescType::Replaced
        }
        _ if (REAL_BASE..REAL_BASE + REAL_COUNT as i32).contains(&fd) => DescType::Real,
        _ if (MGR_BASE..MGR_BASE + MGR_COUNT as i32).contains(&fd) => DescType::Manager,
        _ if (DIRECT_BASE..DIRECT_BASE + DIRECT_COUNT as i32).contains(&fd) => DescType::Direct,
        _ => DescType::Unknown,
    }
}

/// One replaced-file slot. The FAT backing stays cached across closes
/// (`opened` outlives `in_use`) so a reopen of the same path rewinds
/// instead of resolving again.
#[derive(Clone, Debug)]
struct FileSlot {
    in_use: bool,
    opened: bool,
    /// Slot was claimed through a rewritten filesystem open rather than
    /// the direct device.
    ipc_file: bool,
    /// The path as the caller spelled it.
    path: String,
    /// The path on the backing volume.
    vol_path: String,
    drive: Drive,
    mode: OpenMode,
    is_dir: bool,
    pos: u64,
    /// Next entry for direct directory iteration.
    dir_index: usize,
    /// Mount generation the backing was opened under.
    generation: u64,
}

impl FileSlot {
    fn empty() -> FileSlot {
        FileSlot {
            in_use: false,
            opened: false,
            ipc_file: false,
            path: String::new(),
            vol_path: String::new(),
            drive: Drive::Sd,
            mode: OpenMode::empty(),
            is_dir: false,
            pos: 0,
            dir_index: 0,
            generation: 0,
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct DirectSlot {
    in_use: bool,
    /// Replaced-range descriptor this direct handle resolved to.
    fd: Option<i32>,
}

/// The filesystem emulator.
pub struct EmuFs {
    config: Config,
    devices: Arc<DeviceManager>,
    kernel: Arc<dyn KernelIpc>,
    files: [FileSlot; REPLACED_COUNT],
    direct: [DirectSlot; DIRECT_COUNT],
    /// Real `/dev/fs` descriptors behind each manager handle.
    managers: [i32; MGR_COUNT],
}

impl fmt::Debug for EmuFs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EmuFs")
            .field("open_files", &self.files.iter().filter(|s| s.in_use).count())
            .finish_non_exhaustive()
    }
}

/// Replaced files live on this drive.
const REPLACED_DRIVE: Drive = Drive::Sd;

/// Split a direct path into its drive and volume path: `1:/a/b` names
/// drive 1, a bare `/a/b` defaults to the SD slot.
fn parse_direct_path(path: &str) -> Option<(Drive, String)> {
    let mut chars = path.chars();
    match (chars.next(), chars.next()) {
        (Some(d), Some(':')) if d.is_ascii_digit() => {
            let drive = Drive::try_from(d as u32 - '0' as u32).ok()?;
            Some((drive, chars.collect()))
        }
        _ => Some((Drive::Sd, path.to_owned())),
    }
}

impl EmuFs {
    /// Stand up the filesystem emulator.
    pub fn new(config: Config, devices: Arc<DeviceManager>, kernel: Arc<dyn KernelIpc>) -> EmuFs {
        EmuFs {
            config,
            devices,
            kernel,
            files: std::array::from_fn(|_| FileSlot::empty()),
            direct: [DirectSlot {
                in_use: false,
                fd: None,
            }; DIRECT_COUNT],
            managers: [-1; MGR_COUNT],
        }
    }

    // --- slot bookkeeping ------------------------------------------------

    fn is_file_fd_valid(&self, fd: i32) -> bool {
        (0..REPLACED_COUNT as i32).contains(&fd) && {
            let slot = &self.files[fd as usize];
            slot.in_use && !slot.is_dir
        }
    }

    fn is_dir_fd_valid(&self, fd: i32) -> bool {
        (0..REPLACED_COUNT as i32).contains(&fd) && {
            let slot = &self.files[fd as usize];
            slot.in_use && slot.is_dir
        }
    }

    /// Claim a slot for `path`, reusing a cached descriptor when the same
    /// path is already backed.
    fn register_descriptor(&mut self, path: &str) -> FsResult {
        // Reuse an already-backed slot for the same path.
        for (i, slot) in self.files.iter_mut().enumerate() {
            if slot.opened && slot.ipc_file && slot.path == path {
                if slot.in_use {
                    return Err(FsError::Locked);
                }
                slot.in_use = true;
                return Ok(i as i32);
            }
        }

        let fd = self.find_available_descriptor()?;
        let slot = &mut self.files[fd as usize];
        slot.opened = false;
        slot.in_use = true;
        slot.ipc_file = true;
        slot.path = path.to_owned();
        Ok(fd)
    }

    /// Pick a free slot, preferring ones with no cached backing.
    fn find_available_descriptor(&self) -> FsResult {
        let mut best = 0usize;
        for (i, slot) in self.files.iter().enumerate() {
            if !slot.in_use && self.files[best].in_use {
                best = i;
            }
            if !slot.opened && self.files[best].opened && !slot.in_use {
                best = i;
            }
        }
        if self.files[best].in_use {
            return Err(FsError::MaxOpen);
        }
        Ok(best as i32)
    }

    fn find_open_descriptor(&self, path: &str) -> Option<usize> {
        self.files
            .iter()
            .position(|slot| slot.opened && slot.path == path)
    }

    /// Drop a slot's cached backing unless the descriptor is busy.
    fn try_close_descriptor(&mut self, fd: usize) -> Result<(), FsError> {
        let slot = &mut self.files[fd];
        if slot.in_use {
            return Err(FsError::Locked);
        }
        slot.opened = false;
        Ok(())
    }

    /// A slot's backing volume must still be the one it was opened on;
    /// an eject force-closes everything it carried.
    fn check_slot_alive(&mut self, fd: i32) -> Result<(), FsError> {
        let slot = &mut self.files[fd as usize];
        if self.devices.is_mounted(slot.drive)
            && self.devices.generation(slot.drive) == slot.generation
        {
            return Ok(());
        }
        warn!("backing volume for descriptor {fd} is gone");
        slot.in_use = false;
        slot.opened = false;
        Err(FsError::NotReady)
    }

    fn manager_real_fd(&self, fd: i32) -> Option<i32> {
        let real = self.managers[(fd - MGR_BASE) as usize];
        (real >= 0).then_some(real)
    }

    /// Resolve direct handles onto their replaced-file descriptor for
    /// read/write/seek/ioctl.
    fn resolve_fd(&self, fd: i32) -> Result<i32, FsError> {
        if descriptor_type(fd) != DescType::Direct {
            return Ok(fd);
        }
        let slot = &self.direct[(fd - DIRECT_BASE) as usize];
        match (slot.in_use, slot.fd) {
            (true, Some(real)) => Ok(real),
            _ => {
                error!("attempting to use an unopened direct file");
                Err(FsError::Invalid)
            }
        }
    }

    fn is_replaced(&self, path: &str) -> bool {
        self.config.is_path_replaced(path)
    }

    // --- open ------------------------------------------------------------

    fn open_manager(&mut self, caller: Caller) -> FsResult {
        let Some(index) = self.managers.iter().position(|&fd| fd < 0) else {
            return Err(FsError::MaxOpen);
        };

        // The real manager is opened under the caller's identity so its
        // own permission checks keep applying to forwarded commands.
        info!("open {REAL_PATH} for uid {:08x} gid {:04x}", caller.uid, caller.gid);
        let real = self.kernel.open_as(REAL_PATH, 0, caller);
        if real < 0 {
            info!("{REAL_PATH} open error: {real}");
            return Ok(real);
        }
        self.managers[index] = real;
        Ok(MGR_BASE + index as i32)
    }

    fn open_replaced(&mut self, path: &str, mode: u32) -> FsResult {
        if mode > (OpenMode::READ | OpenMode::WRITE).bits() {
            return Err(FsError::Invalid);
        }
        let mode = OpenMode::from_bits_truncate(mode);

        let fd = self.register_descriptor(path)?;
        info!("registered file descriptor {fd}");
        let generation = self.devices.generation(REPLACED_DRIVE);

        let slot = &mut self.files[fd as usize];
        slot.mode = mode;
        slot.drive = REPLACED_DRIVE;

        if slot.opened {
            // Cached backing: a reopen just rewinds.
            info!("file already open, reusing descriptor");
            slot.pos = 0;
            slot.generation = generation;
            return Ok(fd);
        }

        let vol_path = path.to_owned();
        let kind = self.devices.with_volume(REPLACED_DRIVE, |vol| vol.kind_of(&vol_path));
        match kind {
            Ok(PathKind::File) => {}
            Ok(PathKind::Dir) => {
                self.files[fd as usize].in_use = false;
                return Err(FsError::Invalid);
            }
            Err(e) => {
                error!("failed to open file '{vol_path}': {e}");
                self.files[fd as usize].in_use = false;
                return Err(e);
            }
        }

        let slot = &mut self.files[fd as usize];
        slot.opened = true;
        slot.is_dir = false;
        slot.vol_path = vol_path;
        slot.pos = 0;
        slot.generation = generation;
        info!("opened file '{path}' (fd={fd}, mode={mode:?})");
        Ok(fd)
    }

    fn open_forwarded(&mut self, path: &str, mode: u32, caller: Caller) -> FsResult {
        info!("forwarding open of '{path}' to the real filesystem");
        let real = self.kernel.open_as(path, mode, caller);
        if real < 0 {
            return Ok(real);
        }
        if real >= REAL_COUNT as i32 {
            // The forward range cannot express this descriptor.
            self.kernel.close(real);
            return Err(FsError::MaxOpen);
        }
        Ok(REAL_BASE + real)
    }

    fn open_rewritten(&mut self, alias: &str, mode: u32, caller: Caller) -> FsResult {
        // Undo the hook's prefix substitution.
        let path = format!("/{}", &alias[1..]);
        info!("open(\"{path}\", {mode:#x})");

        if path == REAL_PATH {
            return self.open_manager(caller);
        }
        if path.starts_with("/dev") {
            // Fall through to the next resource manager in the chain.
            return Ok(IosError::NotFound.into());
        }
        if self.is_replaced(&path) {
            return self.open_replaced(&path, mode);
        }
        self.open_forwarded(&path, mode, caller)
    }

    fn open_direct_device(&mut self) -> FsResult {
        let Some(index) = self.direct.iter().position(|slot| !slot.in_use) else {
            return Err(FsError::MaxOpen);
        };
        self.direct[index] = DirectSlot {
            in_use: true,
            fd: None,
        };
        Ok(DIRECT_BASE + index as i32)
    }

    // --- file I/O --------------------------------------------------------

    fn req_close(&mut self, fd: i32) -> FsResult {
        match descriptor_type(fd) {
            DescType::Manager => {
                let Some(real) = self.manager_real_fd(fd) else {
                    return Err(FsError::Invalid);
                };
                self.kernel.close(real);
                self.managers[(fd - MGR_BASE) as usize] = -1;
                Ok(0)
            }

            DescType::Real => Ok(self.kernel.close(fd - REAL_BASE)),

            DescType::Direct => {
                info!("closing direct handle {fd}");
                let slot = &mut self.direct[(fd - DIRECT_BASE) as usize];
                if !slot.in_use {
                    return Ok(0);
                }
                let inner = slot.fd.take();
                slot.in_use = false;

                if let Some(inner) = inner {
                    // Direct files carry no reopen cache; drop the whole
                    // backing with the handle.
                    let file = &mut self.files[inner as usize];
                    file.in_use = false;
                    file.opened = false;
                }
                Ok(0)
            }

            DescType::Replaced => {
                if !self.is_file_fd_valid(fd) {
                    return Err(FsError::Invalid);
                }
                // Writes are flushed per operation; the close only parks
                // the cached backing for reuse.
                self.files[fd as usize].in_use = false;
                info!("closed file descriptor {fd}");
                Ok(0)
            }

            DescType::Unknown => Err(FsError::Invalid),
        }
    }

    fn req_read(&mut self, fd: i32, buf: &mut [u8]) -> FsResult {
        if !self.is_file_fd_valid(fd) {
            return Err(FsError::Invalid);
        }
        if buf.is_empty() {
            return Ok(0);
        }
        if !self.files[fd as usize].mode.contains(OpenMode::READ) {
            return Err(FsError::NoAccess);
        }
        self.check_slot_alive(fd)?;

        let (vol_path, drive, pos) = {
            let slot = &self.files[fd as usize];
            (slot.vol_path.clone(), slot.drive, slot.pos)
        };
        let read = self
            .devices
            .with_volume(drive, |vol| vol.read_at(&vol_path, pos, buf))?;
        self.files[fd as usize].pos = pos + read as u64;
        Ok(read as i32)
    }

    fn req_write(&mut self, fd: i32, data: &[u8]) -> FsResult {
        if !self.is_file_fd_valid(fd) {
            return Err(FsError::Invalid);
        }
        if data.is_empty() {
            return Ok(0);
        }
        if !self.files[fd as usize].mode.contains(OpenMode::WRITE) {
            return Err(FsError::NoAccess);
        }
        self.check_slot_alive(fd)?;

        let (vol_path, drive, pos) = {
            let slot = &self.files[fd as usize];
            (slot.vol_path.clone(), slot.drive, slot.pos)
        };
        let wrote = self
            .devices
            .with_volume(drive, |vol| vol.write_at(&vol_path, pos, data))?;
        self.files[fd as usize].pos = pos + wrote as u64;
        Ok(wrote as i32)
    }

    fn req_seek(&mut self, fd: i32, offset: i32, origin: i32) -> FsResult {
        if !self.is_file_fd_valid(fd) {
            return Err(FsError::Invalid);
        }
        let Ok(origin) = SeekOrigin::try_from(origin) else {
            return Err(FsError::Invalid);
        };
        self.check_slot_alive(fd)?;

        let (vol_path, drive, pos) = {
            let slot = &self.files[fd as usize];
            (slot.vol_path.clone(), slot.drive, slot.pos)
        };
        let size = self
            .devices
            .with_volume(drive, |vol| vol.file_size(&vol_path))?;

        let base = match origin {
            SeekOrigin::Set => 0,
            SeekOrigin::Cur => pos as i64,
            SeekOrigin::End => size as i64,
        };
        let target = base + i64::from(offset);
        if target < 0 || target as u64 > size {
            return Err(FsError::Invalid);
        }
        self.files[fd as usize].pos = target as u64;
        Ok(target as i32)
    }

    // --- manager ioctls --------------------------------------------------

    fn attr_block_path<'a>(&self, input: &'a [u8]) -> Result<(&'a AttrBlock, &'a str), FsError> {
        if input.len() < size_of::<AttrBlock>() {
            return Err(FsError::Invalid);
        }
        let (block, _) = AttrBlock::ref_from_prefix(input).map_err(|_| FsError::Invalid)?;
        let path = cstr(&block.path).ok_or(FsError::Invalid)?;
        if !is_path_valid(path) {
            return Err(FsError::Invalid);
        }
        Ok((block, path))
    }

    fn forward_ioctl(&self, fd: i32, cmd: u32, input: &[u8], output: &mut [u8]) -> FsResult {
        let Some(real) = self.manager_real_fd(fd) else {
            return Err(FsError::Invalid);
        };
        Ok(self.kernel.ioctl(real, cmd, input, output))
    }

    fn mgr_create_dir(&mut self, fd: i32, input: &[u8], output: &mut [u8]) -> FsResult {
        let (_, path) = self.attr_block_path(input)?;
        if !self.is_replaced(path) {
            return self.forward_ioctl(fd, FsIoctl::CreateDir as u32, input, output);
        }
        let path = path.to_owned();
        self.devices
            .with_volume(REPLACED_DRIVE, |vol| vol.create_dir(&path))?;
        info!("created directory '{path}'");
        Ok(0)
    }

    fn mgr_set_attr(&mut self, fd: i32, input: &[u8], output: &mut [u8]) -> FsResult {
        let (_, path) = self.attr_block_path(input)?;
        if !self.is_replaced(path) {
            return self.forward_ioctl(fd, FsIoctl::SetAttr as u32, input, output);
        }
        // FAT has nowhere to keep the permission bits; existence is all
        // that gets checked.
        let path = path.to_owned();
        self.devices
            .with_volume(REPLACED_DRIVE, |vol| vol.kind_of(&path))?;
        Ok(0)
    }

    fn mgr_get_attr(&mut self, fd: i32, input: &[u8], output: &mut [u8]) -> FsResult {
        if input.len() < FS_MAX_PATH || output.len() < size_of::<AttrBlock>() {
            return Err(FsError::Invalid);
        }
        let path = cstr(&input[..FS_MAX_PATH]).ok_or(FsError::Invalid)?;
        if !is_path_valid(path) {
            return Err(FsError::Invalid);
        }
        if !self.is_replaced(path) {
            return self.forward_ioctl(fd, FsIoctl::GetAttr as u32, input, output);
        }
        let lookup = path.to_owned();
        self.devices
            .with_volume(REPLACED_DRIVE, |vol| vol.kind_of(&lookup))?;

        let mut block = AttrBlock::new_zeroed();
        block.owner_id = 0.into();
        block.group_id = 0.into();
        block.path = path_array::<FS_MAX_PATH>(path).ok_or(FsError::Invalid)?;
        block.owner_perm = 3;
        block.group_perm = 3;
        block.other_perm = 1;
        block.attributes = 0;
        word_copy(&mut output[..size_of::<AttrBlock>()], block.as_bytes());
        Ok(0)
    }

    fn mgr_delete(&mut self, fd: i32, input: &[u8], output: &mut [u8]) -> FsResult {
        if input.len() < FS_MAX_PATH {
            return Err(FsError::Invalid);
        }
        let path = cstr(&input[..FS_MAX_PATH]).ok_or(FsError::Invalid)?;
        if !is_path_valid(path) {
            return Err(FsError::Invalid);
        }
        if !self.is_replaced(path) {
            return self.forward_ioctl(fd, FsIoctl::Delete as u32, input, output);
        }

        // A cached descriptor for the victim must be dropped first, and
        // an in-use one blocks the delete.
        if let Some(open_fd) = self.find_open_descriptor(path) {
            self.try_close_descriptor(open_fd)?;
        }

        let path = path.to_owned();
        self.devices
            .with_volume(REPLACED_DRIVE, |vol| vol.remove(&path))?;
        info!("deleted '{path}'");
        Ok(0)
    }

    /// Stream a real-filesystem file into a FAT target. Only `/tmp` may
    /// be drained this way.
    fn copy_from_real_fs(&mut self, real_path: &str, dest_vol_path: &str) -> Result<(), FsError> {
        if !real_path.starts_with("/tmp") {
            error!("attempting to move a file from outside of /tmp");
            return Err(FsError::NoAccess);
        }

        let src = self.kernel.open(real_path, OpenMode::READ.bits());
        if src < 0 {
            error!("failed to open source file: {src}");
            return Err(FsError::NotFound);
        }

        let size = self.kernel.seek(src, 0, SeekOrigin::End as i32);
        let result = (|| {
            if size < 0 || self.kernel.seek(src, 0, SeekOrigin::Set as i32) < 0 {
                return Err(FsError::Unknown);
            }
            let mut buffer = vec![0u8; COPY_BUFFER_SIZE];
            let mut pos = 0usize;
            while pos < size as usize {
                let want = (size as usize - pos).min(COPY_BUFFER_SIZE);
                let got = self.kernel.read(src, &mut buffer[..want]);
                if got != want as i32 {
                    error!("failed to read from source file: {got} != {want}");
                    return Err(FsError::Unknown);
                }
                let wrote = self.devices.with_volume(REPLACED_DRIVE, |vol| {
                    vol.write_at(dest_vol_path, pos as u64, &buffer[..want])
                })?;
                if wrote != want {
                    return Err(FsError::Unknown);
                }
                pos += want;
            }
            Ok(())
        })();
        self.kernel.close(src);
        result
    }

    fn mgr_rename(&mut self, fd: i32, input: &[u8], output: &mut [u8]) -> FsResult {
        if input.len() < size_of::<RenameBlock>() {
            return Err(FsError::Invalid);
        }
        let (block, _) = RenameBlock::ref_from_prefix(input).map_err(|_| FsError::Invalid)?;
        let old = cstr(&block.path_old).ok_or(FsError::Invalid)?.to_owned();
        let new = cstr(&block.path_new).ok_or(FsError::Invalid)?.to_owned();
        info!("rename(\"{old}\", \"{new}\")");

        if !is_path_valid(&old) || !is_path_valid(&new) {
            return Err(FsError::Invalid);
        }

        let old_replaced = self.is_replaced(&old);
        let new_replaced = self.is_replaced(&new);

        if !old_replaced && !new_replaced {
            return self.forward_ioctl(fd, FsIoctl::Rename as u32, input, output);
        }

        if !old_replaced && new_replaced {
            // Crossing into FAT: copy, then delete the original through
            // the real manager.
            match self.find_open_descriptor(&new) {
                None => {
                    self.devices
                        .with_volume(REPLACED_DRIVE, |vol| vol.create_file_always(&new))?;
                    self.copy_from_real_fs(&old, &new)?;
                }
                Some(open_fd) => {
                    if self.files[open_fd].in_use {
                        return Err(FsError::Locked);
                    }
                    let vol_path = self.files[open_fd].vol_path.clone();
                    self.devices
                        .with_volume(REPLACED_DRIVE, |vol| vol.truncate(&vol_path))?;
                    self.copy_from_real_fs(&old, &vol_path)?;
                    self.files[open_fd].pos = 0;
                }
            }

            let mut path_buf = [0u8; FS_MAX_PATH];
            path_buf[..old.len()].copy_from_slice(old.as_bytes());
            return self.forward_ioctl(fd, FsIoctl::Delete as u32, &path_buf, &mut []);
        }

        if old_replaced != new_replaced {
            // FAT back into the real filesystem is not supported.
            return Err(FsError::Invalid);
        }

        self.devices
            .with_volume(REPLACED_DRIVE, |vol| vol.rename(&old, &new))?;
        info!("renamed '{old}' to '{new}'");
        Ok(0)
    }

    fn mgr_create_file(&mut self, fd: i32, input: &[u8], output: &mut [u8]) -> FsResult {
        let (_, path) = self.attr_block_path(input)?;
        info!("create file \"{path}\"");
        if !self.is_replaced(path) {
            return self.forward_ioctl(fd, FsIoctl::CreateFile as u32, input, output);
        }
        let path = path.to_owned();
        self.devices
            .with_volume(REPLACED_DRIVE, |vol| vol.create_file_new(&path))?;

        // Cache the fresh file in a free slot so the open that usually
        // follows is cheap.
        if let Ok(free) = self.find_available_descriptor() {
            let generation = self.devices.generation(REPLACED_DRIVE);
            let slot = &mut self.files[free as usize];
            slot.opened = true;
            slot.ipc_file = true;
            slot.is_dir = false;
            slot.path = path.clone();
            slot.vol_path = path.clone();
            slot.drive = REPLACED_DRIVE;
            slot.pos = 0;
            slot.generation = generation;
        }
        info!("created file '{path}'");
        Ok(0)
    }

    fn file_ioctl(&mut self, fd: i32, cmd: u32, output: &mut [u8]) -> FsResult {
        if cmd == FsIoctl::GetFileStats as u32 {
            if output.len() < size_of::<FileStats>() {
                return Err(FsError::Invalid);
            }
            self.check_slot_alive(fd)?;
            let (vol_path, drive, pos) = {
                let slot = &self.files[fd as usize];
                (slot.vol_path.clone(), slot.drive, slot.pos)
            };
            let size = self
                .devices
                .with_volume(drive, |vol| vol.file_size(&vol_path))?;
            let stats = FileStats {
                size: (size as u32).into(),
                pos: (pos as u32).into(),
            };
            word_copy(&mut output[..size_of::<FileStats>()], stats.as_bytes());
            return Ok(0);
        }
        error!("unknown file ioctl: {cmd}");
        Err(FsError::Invalid)
    }

    fn mgr_ioctl(&mut self, fd: i32, cmd: u32, input: &[u8], output: &mut [u8]) -> FsResult {
        match FsIoctl::try_from(cmd) {
            // A command to wipe the filesystem and brick the console; not
            // on this watch.
            Ok(FsIoctl::Format) => {
                error!("attempt to use Format");
                Err(FsError::NoAccess)
            }
            Ok(FsIoctl::CreateDir) => self.mgr_create_dir(fd, input, output),
            Ok(FsIoctl::SetAttr) => self.mgr_set_attr(fd, input, output),
            Ok(FsIoctl::GetAttr) => self.mgr_get_attr(fd, input, output),
            Ok(FsIoctl::Delete) => self.mgr_delete(fd, input, output),
            Ok(FsIoctl::Rename) => self.mgr_rename(fd, input, output),
            Ok(FsIoctl::CreateFile) => self.mgr_create_file(fd, input, output),
            // Only waits for pending work, of which there is none.
            Ok(FsIoctl::Shutdown) => Ok(0),
            _ => {
                error!("unknown manager ioctl: {cmd}");
                Err(FsError::Invalid)
            }
        }
    }

    // --- direct-access ioctlvs -------------------------------------------

    fn direct_path_from_vector(vec: &[u8]) -> Result<&str, FsError> {
        if vec.is_empty() || vec.len() > DIRECT_MAX_PATH {
            error!("invalid path length: {}", vec.len());
            return Err(FsError::Invalid);
        }
        let path = cstr(vec).ok_or_else(|| {
            error!("path does not terminate");
            FsError::Invalid
        })?;
        Ok(path)
    }

    fn direct_open(&mut self, fd: i32, vectors: &Vectors<'_>, dir: bool) -> FsResult {
        let want_inputs = if dir { 1 } else { 2 };
        if vectors.input.len() != want_inputs || !vectors.output.is_empty() {
            error!("direct open: wrong vector count");
            return Err(FsError::Invalid);
        }
        let path = Self::direct_path_from_vector(&vectors.input[0])?;
        let mode = if dir {
            OpenMode::READ
        } else {
            if vectors.input[1].len() != 4 {
                error!("direct open: invalid open mode length");
                return Err(FsError::Invalid);
            }
            let raw = u32::from_be_bytes(vectors.input[1].as_slice().try_into().unwrap());
            OpenMode::from_bits(raw).ok_or(FsError::Invalid)?
        };

        let direct_index = (fd - DIRECT_BASE) as usize;
        if self.direct[direct_index].fd.is_some() {
            error!("direct open: file already open");
            return Err(FsError::Invalid);
        }

        let (drive, vol_path) = parse_direct_path(path).ok_or(FsError::Invalid)?;
        let inner = self.find_available_descriptor()?;
        let kind = {
            let lookup = vol_path.clone();
            self.devices.with_volume(drive, |vol| vol.kind_of(&lookup))?
        };
        match (dir, kind) {
            (true, PathKind::Dir) | (false, PathKind::File) => {}
            _ => return Err(FsError::NotFound),
        }

        let generation = self.devices.generation(drive);
        let slot = &mut self.files[inner as usize];
        slot.in_use = true;
        slot.opened = true;
        slot.ipc_file = false;
        slot.is_dir = dir;
        slot.path = path.to_owned();
        slot.vol_path = vol_path;
        slot.drive = drive;
        slot.mode = mode;
        slot.pos = 0;
        slot.dir_index = 0;
        slot.generation = generation;

        self.direct[direct_index].fd = Some(inner);
        info!("opened direct {} '{path}' (fd={fd})", if dir { "dir" } else { "file" });
        Ok(0)
    }

    fn direct_dir_next(&mut self, fd: i32, vectors: &mut Vectors<'_>) -> FsResult {
        if !vectors.input.is_empty() || vectors.output.len() != 1 {
            error!("DirNext: wrong vector count");
            return Err(FsError::Invalid);
        }
        if vectors.output[0].len() != size_of::<DirectStat>() {
            error!("DirNext: wrong stat length: {}", vectors.output[0].len());
            return Err(FsError::Invalid);
        }
        vectors.output[0].fill(0);

        let direct_index = (fd - DIRECT_BASE) as usize;
        let inner = match (self.direct[direct_index].in_use, self.direct[direct_index].fd) {
            (true, Some(inner)) => inner,
            _ => {
                error!("DirNext: file not open");
                return Err(FsError::Invalid);
            }
        };
        if !self.is_dir_fd_valid(inner) {
            error!("DirNext: descriptor is not a directory");
            return Err(FsError::Invalid);
        }
        self.check_slot_alive(inner)?;

        let (vol_path, drive, index) = {
            let slot = &self.files[inner as usize];
            (slot.vol_path.clone(), slot.drive, slot.dir_index)
        };
        let entries = self
            .devices
            .with_volume(drive, |vol| vol.read_dir(&vol_path))?;

        let Some(entry) = entries.get(index) else {
            // A blank name tells the caller the directory is done.
            info!("DirNext: reached end of directory");
            return Ok(0);
        };
        self.files[inner as usize].dir_index = index + 1;

        let mut stat = DirectStat::new_zeroed();
        stat.dir_offset = (index as u64).into();
        stat.size = entry.size.into();
        stat.attribute = entry.attr | if entry.is_dir { FAT_ATTR_DIRECTORY } else { 0 };
        let name = entry.name.as_bytes();
        let n = name.len().min(DIRECT_MAX_PATH - 1);
        stat.name[..n].copy_from_slice(&name[..n]);
        word_copy(vectors.output[0].as_mut_slice(), stat.as_bytes());
        Ok(0)
    }

    // --- manager ioctlvs -------------------------------------------------

    fn forward_ioctlv(&self, fd: i32, cmd: u32, vectors: Vectors<'_>) -> FsResult {
        let Some(real) = self.manager_real_fd(fd) else {
            return Err(FsError::Invalid);
        };
        Ok(self.kernel.ioctlv(real, cmd, vectors))
    }

    fn select_dir_name(entry: &EntryInfo) -> Option<&str> {
        if entry.name.len() <= 12 {
            return Some(&entry.name);
        }
        // Long names do not fit the fixed stride; fall back to the short
        // form when it is usable.
        if entry.short_name.is_empty() || entry.short_name == "?" {
            return None;
        }
        Some(&entry.short_name)
    }

    fn mgr_read_dir(&mut self, fd: i32, vectors: &mut Vectors<'_>) -> FsResult {
        let in_count = vectors.input.len();
        if in_count != vectors.output.len() || !(1..=2).contains(&in_count) {
            error!("ReadDir: wrong vector count");
            return Err(FsError::Invalid);
        }
        if vectors.input[0].len() < FS_MAX_PATH {
            error!("ReadDir: invalid input path vector");
            return Err(FsError::Invalid);
        }
        let path = cstr(&vectors.input[0][..FS_MAX_PATH])
            .ok_or(FsError::Invalid)?
            .to_owned();
        info!("ReadDir(\"{path}\")");

        let max_count = if in_count == 2 {
            if vectors.input[1].len() < 4 {
                error!("ReadDir: invalid max file count vector");
                return Err(FsError::Invalid);
            }
            u32::from_be_bytes(vectors.input[1][..4].try_into().unwrap())
        } else {
            0
        };
        if in_count == 2 && vectors.output[0].len() < max_count as usize * 13 {
            error!("ReadDir: invalid output file names vector");
            return Err(FsError::Invalid);
        }
        let count_vec = vectors.output.len() - 1;
        if vectors.output[count_vec].len() < 4 {
            error!("ReadDir: invalid output file count vector");
            return Err(FsError::Invalid);
        }

        if !self.is_replaced(&path) {
            return self.forward_ioctlv(
                fd,
                FsIoctl::ReadDir as u32,
                Vectors {
                    input: vectors.input,
                    output: &mut *vectors.output,
                },
            );
        }

        let entries = self
            .devices
            .with_volume(REPLACED_DRIVE, |vol| vol.read_dir(&path))?;

        if in_count == 2 {
            vectors.output[0][..max_count as usize * 13].fill(0);
        }
        let mut count = 0u32;
        for entry in &entries {
            let Some(name) = Self::select_dir_name(entry) else {
                continue;
            };
            if count < max_count {
                let mut cell = [0u8; 13];
                let n = name.len().min(12);
                cell[..n].copy_from_slice(&name.as_bytes()[..n]);
                let at = count as usize * 13;
                word_copy(&mut vectors.output[0][at..at + 13], &cell);
            }
            count += 1;
        }
        info!("ReadDir: count: {count}");
        word_copy(
            &mut vectors.output[count_vec][..4],
            &count.to_be_bytes(),
        );
        Ok(0)
    }

    fn req_ioctlv(&mut self, fd: i32, cmd: u32, mut vectors: Vectors<'_>) -> FsResult {
        if vectors.input.len() > MAX_VECTORS || vectors.output.len() > MAX_VECTORS {
            return Err(FsError::Invalid);
        }

        if descriptor_type(fd) == DescType::Direct {
            return match FsIoctl::try_from(cmd) {
                Ok(FsIoctl::DirectOpen) => self.direct_open(fd, &vectors, false),
                Ok(FsIoctl::DirectOpenDir) => self.direct_open(fd, &vectors, true),
                Ok(FsIoctl::DirectDirNext) => self.direct_dir_next(fd, &mut vectors),
                _ => {
                    error!("unknown direct ioctlv: {cmd}");
                    Err(FsError::Invalid)
                }
            };
        }

        if descriptor_type(fd) != DescType::Manager {
            return Err(FsError::Invalid);
        }

        match FsIoctl::try_from(cmd) {
            Ok(FsIoctl::ReadDir) => self.mgr_read_dir(fd, &mut vectors),
            Ok(FsIoctl::GetUsage) => self.forward_ioctlv(fd, cmd, vectors),
            _ => {
                error!("unknown manager ioctlv: {cmd}");
                Err(FsError::Invalid)
            }
        }
    }
}

impl Resource for EmuFs {
    fn open(&mut self, path: &str, mode: u32, caller: Caller) -> i32 {
        if path.starts_with(ALIAS_PREFIX) {
            return fs_reply(self.open_rewritten(path, mode, caller));
        }
        if path == DIRECT_PATH {
            return fs_reply(self.open_direct_device());
        }
        IosError::NotFound.into()
    }

    fn close(&mut self, fd: i32) -> i32 {
        info!("close({fd})");
        fs_reply(self.req_close(fd))
    }

    fn read(&mut self, fd: i32, buf: &mut [u8]) -> i32 {
        match descriptor_type(fd) {
            DescType::Real => self.kernel.read(fd - REAL_BASE, buf),
            _ => match self.resolve_fd(fd) {
                Ok(fd) => fs_reply(self.req_read(fd, buf)),
                Err(e) => e.into(),
            },
        }
    }

    fn write(&mut self, fd: i32, data: &[u8]) -> i32 {
        match descriptor_type(fd) {
            DescType::Real => self.kernel.write(fd - REAL_BASE, data),
            _ => match self.resolve_fd(fd) {
                Ok(fd) => fs_reply(self.req_write(fd, data)),
                Err(e) => e.into(),
            },
        }
    }

    fn seek(&mut self, fd: i32, offset: i32, origin: i32) -> i32 {
        match descriptor_type(fd) {
            DescType::Real => self.kernel.seek(fd - REAL_BASE, offset, origin),
            _ => match self.resolve_fd(fd) {
                Ok(fd) => fs_reply(self.req_seek(fd, offset, origin)),
                Err(e) => e.into(),
            },
        }
    }

    fn ioctl(&mut self, fd: i32, cmd: u32, input: &[u8], output: &mut [u8]) -> i32 {
        if descriptor_type(fd) == DescType::Real {
            return self.kernel.ioctl(fd - REAL_BASE, cmd, input, output);
        }
        let fd = match self.resolve_fd(fd) {
            Ok(fd) => fd,
            Err(e) => return e.into(),
        };
        if self.is_file_fd_valid(fd) {
            return fs_reply(self.file_ioctl(fd, cmd, output));
        }
        if descriptor_type(fd) == DescType::Manager {
            return fs_reply(self.mgr_ioctl(fd, cmd, input, output));
        }
        FsError::Invalid.into()
    }

    fn ioctlv(&mut self, fd: i32, cmd: u32, vectors: Vectors<'_>) -> i32 {
        if descriptor_type(fd) == DescType::Real {
            return self.kernel.ioctlv(fd - REAL_BASE, cmd, vectors);
        }
        fs_reply(self.req_ioctlv(fd, cmd, vectors))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::storage::devmgr::tests::manager_with_sd;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::atomic::Ordering;

    /// A miniature real filesystem: a handful of in-memory files plus a
    /// call log for the manager ioctls.
    #[derive(Debug, Default)]
    pub(crate) struct FakeRealFs {
        pub(crate) files: Mutex<HashMap<String, Vec<u8>>>,
        handles: Mutex<HashMap<i32, (String, usize)>>,
        next_fd: Mutex<i32>,
        pub(crate) mgr_calls: Mutex<Vec<(u32, Vec<u8>)>>,
        pub(crate) mgr_ioctlvs: Mutex<Vec<u32>>,
        pub(crate) mgr_opens: Mutex<Vec<Caller>>,
        pub(crate) mgr_result: i32,
    }

    const MGR_FD: i32 = 7;

    impl KernelIpc for FakeRealFs {
        fn open(&self, path: &str, _mode: u32) -> i32 {
            if path == REAL_PATH {
                return MGR_FD;
            }
            let files = self.files.lock();
            if !files.contains_key(path) {
                return FsError::NotFound.into();
            }
            let mut next = self.next_fd.lock();
            *next += 1;
            let fd = *next;
            self.handles.lock().insert(fd, (path.to_owned(), 0));
            fd
        }

        fn open_as(&self, path: &str, mode: u32, caller: Caller) -> i32 {
            if path == REAL_PATH {
                self.mgr_opens.lock().push(caller);
            }
            self.open(path, mode)
        }

        fn close(&self, fd: i32) -> i32 {
            self.handles.lock().remove(&fd);
            0
        }

        fn read(&self, fd: i32, buf: &mut [u8]) -> i32 {
            let mut handles = self.handles.lock();
            let Some((path, pos)) = handles.get_mut(&fd) else {
                return FsError::Invalid.into();
            };
            let files = self.files.lock();
            let data = &files[path.as_str()];
            let n = buf.len().min(data.len().saturating_sub(*pos));
            buf[..n].copy_from_slice(&data[*pos..*pos + n]);
            *pos += n;
            n as i32
        }

        fn write(&self, _fd: i32, _data: &[u8]) -> i32 {
            FsError::NoAccess.into()
        }

        fn seek(&self, fd: i32, offset: i32, origin: i32) -> i32 {
            let mut handles = self.handles.lock();
            let Some((path, pos)) = handles.get_mut(&fd) else {
                return FsError::Invalid.into();
            };
            let len = self.files.lock()[path.as_str()].len() as i64;
            let base = match origin {
                0 => 0,
                1 => *pos as i64,
                2 => len,
                _ => return FsError::Invalid.into(),
            };
            let target = base + i64::from(offset);
            if target < 0 || target > len {
                return FsError::Invalid.into();
            }
            *pos = target as usize;
            target as i32
        }

        fn ioctl(&self, fd: i32, cmd: u32, input: &[u8], _output: &mut [u8]) -> i32 {
            assert_eq!(fd, MGR_FD, "manager forwards must use the real handle");
            self.mgr_calls.lock().push((cmd, input.to_vec()));
            if cmd == FsIoctl::Delete as u32 {
                if let Some(path) = cstr(input) {
                    self.files.lock().remove(path);
                }
            }
            self.mgr_result
        }

        fn ioctlv(&self, fd: i32, cmd: u32, _vectors: Vectors<'_>) -> i32 {
            assert_eq!(fd, MGR_FD);
            self.mgr_ioctlvs.lock().push(cmd);
            self.mgr_result
        }
    }

    pub(crate) fn emu_with_sd() -> (EmuFs, Arc<FakeRealFs>, Arc<DeviceManager>) {
        let (devices, present) = manager_with_sd();
        present.store(true, Ordering::Relaxed);
        devices.poll_once();
        let kernel = Arc::new(FakeRealFs::default());
        let fs = EmuFs::new(
            Config::default(),
            Arc::clone(&devices),
            Arc::clone(&kernel) as Arc<dyn KernelIpc>,
        );
        (fs, kernel, devices)
    }

    const SAVE: &str = "/title/00010004/524d4350/data/save.bin";
    const SAVE_ALIAS: &str = "$title/00010004/524d4350/data/save.bin";

    fn seed_save(devices: &DeviceManager, content: &[u8]) {
        devices
            .with_volume(Drive::Sd, |vol| {
                vol.create_dir("/title").ok();
                vol.create_dir("/title/00010004").ok();
                vol.create_dir("/title/00010004/524d4350").ok();
                vol.create_dir("/title/00010004/524d4350/data").ok();
                vol.create_file_new(SAVE)?;
                vol.write_at(SAVE, 0, content)?;
                Ok(0)
            })
            .unwrap();
    }

    fn attr_input(path: &str) -> Vec<u8> {
        let mut block = AttrBlock::new_zeroed();
        block.path = path_array::<FS_MAX_PATH>(path).unwrap();
        block.as_bytes().to_vec()
    }

    #[test]
    fn manager_open_captures_identity_and_forwards_unreplaced() {
        let (mut fs, kernel, _devices) = emu_with_sd();
        let caller = Caller { uid: 0x1234, gid: 1 };
        let mgr = fs.open("$dev/fs", 0, caller);
        assert_eq!(mgr, MGR_BASE);
        assert_eq!(kernel.mgr_opens.lock().as_slice(), &[caller]);

        // Scenario: CreateDir for an unreplaced path forwards verbatim
        // and the real result comes back unchanged.
        let input = attr_input("/tmp/xyz");
        let ret = fs.ioctl(mgr, FsIoctl::CreateDir as u32, &input, &mut []);
        assert_eq!(ret, 0);
        let calls = kernel.mgr_calls.lock();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, FsIoctl::CreateDir as u32);
        assert_eq!(calls[0].1, input);
    }

    #[test]
    fn forwarded_errors_pass_through_unchanged() {
        let (mut fs, _kernel, _devices) = emu_with_sd();
        let mut fs2 = {
            let kernel = Arc::new(FakeRealFs {
                mgr_result: FsError::NoAccess.into(),
                ..FakeRealFs::default()
            });
            let devices = fs.devices.clone();
            EmuFs::new(Config::default(), devices, kernel)
        };
        let mgr = fs2.open("$dev/fs", 0, Caller::default());
        let ret = fs2.ioctl(mgr, FsIoctl::CreateDir as u32, &attr_input("/tmp/x"), &mut []);
        assert_eq!(ret, i32::from(FsError::NoAccess));
        drop(fs);
    }

    #[test]
    fn replaced_open_read_and_reuse() {
        let (mut fs, _kernel, devices) = emu_with_sd();
        seed_save(&devices, b"0123456789abcdef0123456789abcdef");

        let fd = fs.open(SAVE_ALIAS, OpenMode::READ.bits(), Caller::default());
        assert!((0..REPLACED_COUNT as i32).contains(&fd), "fd {fd} not in replaced range");

        let mut buf = [0u8; 32];
        assert_eq!(fs.read(fd, &mut buf), 32);
        assert_eq!(&buf, b"0123456789abcdef0123456789abcdef");
        assert!(fs.files[fd as usize].in_use);

        // Second concurrent open of the same path is locked out.
        assert_eq!(
            fs.open(SAVE_ALIAS, OpenMode::READ.bits(), Caller::default()),
            i32::from(FsError::Locked)
        );

        // Close parks the backing; reopen reuses the slot and rewinds.
        assert_eq!(fs.close(fd), 0);
        assert!(!fs.files[fd as usize].in_use);
        assert!(fs.files[fd as usize].opened);
        let fd2 = fs.open(SAVE_ALIAS, OpenMode::READ.bits(), Caller::default());
        assert_eq!(fd2, fd);
        let mut buf = [0u8; 4];
        assert_eq!(fs.read(fd2, &mut buf), 4);
        assert_eq!(&buf, b"0123");
    }

    #[test]
    fn missing_replaced_file_is_not_found() {
        let (mut fs, _kernel, _devices) = emu_with_sd();
        assert_eq!(
            fs.open(SAVE_ALIAS, OpenMode::READ.bits(), Caller::default()),
            i32::from(FsError::NotFound)
        );
    }

    #[test]
    fn mode_checks_on_read_and_write() {
        let (mut fs, _kernel, devices) = emu_with_sd();
        seed_save(&devices, b"data");

        let fd = fs.open(SAVE_ALIAS, OpenMode::READ.bits(), Caller::default());
        assert_eq!(fs.write(fd, b"xx"), i32::from(FsError::NoAccess));
        fs.close(fd);

        let fd = fs.open(SAVE_ALIAS, OpenMode::WRITE.bits(), Caller::default());
        let mut buf = [0u8; 2];
        assert_eq!(fs.read(fd, &mut buf), i32::from(FsError::NoAccess));
        assert_eq!(fs.write(fd, b"XY"), 2);
        fs.close(fd);

        devices
            .with_volume(Drive::Sd, |vol| {
                let mut buf = [0u8; 4];
                vol.read_at(SAVE, 0, &mut buf)?;
                assert_eq!(&buf, b"XYta");
                Ok(0)
            })
            .unwrap();
    }

    #[test]
    fn invalid_open_mode_is_rejected() {
        let (mut fs, _kernel, devices) = emu_with_sd();
        seed_save(&devices, b"data");
        assert_eq!(
            fs.open(SAVE_ALIAS, 7, Caller::default()),
            i32::from(FsError::Invalid)
        );
    }

    #[test]
    fn seek_origins_and_bounds() {
        let (mut fs, _kernel, devices) = emu_with_sd();
        seed_save(&devices, b"0123456789");
        let fd = fs.open(SAVE_ALIAS, OpenMode::READ.bits(), Caller::default());

        assert_eq!(fs.seek(fd, 4, SeekOrigin::Set as i32), 4);
        assert_eq!(fs.seek(fd, 2, SeekOrigin::Cur as i32), 6);
        assert_eq!(fs.seek(fd, -1, SeekOrigin::End as i32), 9);
        assert_eq!(fs.seek(fd, 1, SeekOrigin::End as i32), i32::from(FsError::Invalid));
        assert_eq!(fs.seek(fd, -11, SeekOrigin::End as i32), i32::from(FsError::Invalid));
        assert_eq!(fs.seek(fd, 0, 3), i32::from(FsError::Invalid));

        // Position survives a failed seek.
        let mut buf = [0u8; 1];
        assert_eq!(fs.read(fd, &mut buf), 1);
        assert_eq!(&buf, b"9");
    }

    #[test]
    fn get_file_stats() {
        let (mut fs, _kernel, devices) = emu_with_sd();
        seed_save(&devices, b"0123456789");
        let fd = fs.open(SAVE_ALIAS, OpenMode::READ.bits(), Caller::default());
        fs.seek(fd, 3, SeekOrigin::Set as i32);

        let mut out = [0u8; 8];
        assert_eq!(fs.ioctl(fd, FsIoctl::GetFileStats as u32, &[], &mut out), 0);
        let stats = FileStats::read_from_bytes(&out).unwrap();
        assert_eq!(stats.size.get(), 10);
        assert_eq!(stats.pos.get(), 3);
    }

    #[test]
    fn format_is_refused_and_shutdown_succeeds() {
        let (mut fs, kernel, _devices) = emu_with_sd();
        let mgr = fs.open("$dev/fs", 0, Caller::default());
        assert_eq!(
            fs.ioctl(mgr, FsIoctl::Format as u32, &[], &mut []),
            i32::from(FsError::NoAccess)
        );
        assert_eq!(fs.ioctl(mgr, FsIoctl::Shutdown as u32, &[], &mut []), 0);
        assert!(kernel.mgr_calls.lock().is_empty());
    }

    #[test]
    fn create_file_on_replaced_path() {
        let (mut fs, _kernel, devices) = emu_with_sd();
        devices
            .with_volume(Drive::Sd, |vol| {
                vol.create_dir("/title").ok();
                vol.create_dir("/title/00010004").ok();
                vol.create_dir("/title/00010004/524d4350").ok();
                vol.create_dir("/title/00010004/524d4350/data")
            })
            .unwrap();
        let mgr = fs.open("$dev/fs", 0, Caller::default());

        assert_eq!(
            fs.ioctl(mgr, FsIoctl::CreateFile as u32, &attr_input(SAVE), &mut []),
            0
        );
        assert_eq!(
            fs.ioctl(mgr, FsIoctl::CreateFile as u32, &attr_input(SAVE), &mut []),
            i32::from(FsError::Exists)
        );
    }

    #[test]
    fn get_attr_stubs_permissions() {
        let (mut fs, _kernel, devices) = emu_with_sd();
        seed_save(&devices, b"x");
        let mgr = fs.open("$dev/fs", 0, Caller::default());

        let mut input = vec![0u8; FS_MAX_PATH];
        input[..SAVE.len()].copy_from_slice(SAVE.as_bytes());
        let mut out = vec![0u8; size_of::<AttrBlock>()];
        assert_eq!(fs.ioctl(mgr, FsIoctl::GetAttr as u32, &input, &mut out), 0);
        let block = AttrBlock::read_from_bytes(&out).unwrap();
        assert_eq!(block.owner_perm, 3);
        assert_eq!(block.group_perm, 3);
        assert_eq!(block.other_perm, 1);
        assert_eq!(cstr(&block.path), Some(SAVE));
    }

    #[test]
    fn delete_closes_cached_descriptor_but_respects_in_use() {
        let (mut fs, _kernel, devices) = emu_with_sd();
        seed_save(&devices, b"payload");
        let mgr = fs.open("$dev/fs", 0, Caller::default());

        let fd = fs.open(SAVE_ALIAS, OpenMode::READ.bits(), Caller::default());
        let mut input = vec![0u8; FS_MAX_PATH];
        input[..SAVE.len()].copy_from_slice(SAVE.as_bytes());

        // In use: locked.
        assert_eq!(
            fs.ioctl(mgr, FsIoctl::Delete as u32, &input, &mut []),
            i32::from(FsError::Locked)
        );

        fs.close(fd);
        assert_eq!(fs.ioctl(mgr, FsIoctl::Delete as u32, &input, &mut []), 0);
        assert_eq!(
            fs.open(SAVE_ALIAS, OpenMode::READ.bits(), Caller::default()),
            i32::from(FsError::NotFound)
        );
    }

    fn rename_input(old: &str, new: &str) -> Vec<u8> {
        let mut block = RenameBlock::new_zeroed();
        block.path_old = path_array::<FS_MAX_PATH>(old).unwrap();
        block.path_new = path_array::<FS_MAX_PATH>(new).unwrap();
        block.as_bytes().to_vec()
    }

    #[test]
    fn rename_from_tmp_copies_then_deletes() {
        let (mut fs, kernel, devices) = emu_with_sd();
        devices
            .with_volume(Drive::Sd, |vol| {
                vol.create_dir("/title").ok();
                vol.create_dir("/title/00010004").ok();
                vol.create_dir("/title/00010004/524d4350").ok();
                vol.create_dir("/title/00010004/524d4350/data")
            })
            .unwrap();
        // Big enough to exercise the 8 KB streaming buffer.
        let payload: Vec<u8> = (0..COPY_BUFFER_SIZE * 2 + 77).map(|i| (i % 251) as u8).collect();
        kernel
            .files
            .lock()
            .insert("/tmp/new.dat".to_owned(), payload.clone());

        let mgr = fs.open("$dev/fs", 0, Caller::default());
        let input = rename_input("/tmp/new.dat", SAVE);
        assert_eq!(fs.ioctl(mgr, FsIoctl::Rename as u32, &input, &mut []), 0);

        // Content landed on FAT.
        devices
            .with_volume(Drive::Sd, |vol| {
                let mut buf = vec![0u8; payload.len()];
                assert_eq!(vol.read_at(SAVE, 0, &mut buf)?, payload.len());
                assert_eq!(buf, payload);
                Ok(0)
            })
            .unwrap();

        // The delete went to the real manager, for the old path.
        let calls = kernel.mgr_calls.lock();
        let delete = calls
            .iter()
            .find(|(cmd, _)| *cmd == FsIoctl::Delete as u32)
            .expect("delete must be forwarded");
        assert_eq!(cstr(&delete.1), Some("/tmp/new.dat"));
    }

    #[test]
    fn rename_from_outside_tmp_is_refused() {
        let (mut fs, kernel, devices) = emu_with_sd();
        devices
            .with_volume(Drive::Sd, |vol| {
                vol.create_dir("/title").ok();
                vol.create_dir("/title/00010004").ok();
                vol.create_dir("/title/00010004/524d4350").ok();
                vol.create_dir("/title/00010004/524d4350/data")
            })
            .unwrap();
        kernel
            .files
            .lock()
            .insert("/shared2/x.dat".to_owned(), vec![1, 2, 3]);
        let mgr = fs.open("$dev/fs", 0, Caller::default());
        let input = rename_input("/shared2/x.dat", SAVE);
        assert_eq!(
            fs.ioctl(mgr, FsIoctl::Rename as u32, &input, &mut []),
            i32::from(FsError::NoAccess)
        );
        assert!(kernel.files.lock().contains_key("/shared2/x.dat"));
    }

    #[test]
    fn rename_fat_to_real_fs_is_invalid() {
        let (mut fs, _kernel, devices) = emu_with_sd();
        seed_save(&devices, b"x");
        let mgr = fs.open("$dev/fs", 0, Caller::default());
        let input = rename_input(SAVE, "/tmp/out.dat");
        assert_eq!(
            fs.ioctl(mgr, FsIoctl::Rename as u32, &input, &mut []),
            i32::from(FsError::Invalid)
        );
    }

    #[test]
    fn read_dir_count_only_and_names() {
        let (mut fs, _kernel, devices) = emu_with_sd();
        devices
            .with_volume(Drive::Sd, |vol| {
                vol.create_dir("/title").ok();
                vol.create_dir("/title/00010004").ok();
                vol.create_dir("/title/00010004/524d4350").ok();
                vol.create_dir("/title/00010004/524d4350/data")?;
                vol.create_file_new("/title/00010004/524d4350/data/rksys.dat")?;
                vol.create_file_new("/title/00010004/524d4350/data/save.bin")?;
                Ok(0)
            })
            .unwrap();
        let mgr = fs.open("$dev/fs", 0, Caller::default());

        let dir = "/title/00010004/524d4350/data/";
        let mut path_vec = vec![0u8; FS_MAX_PATH];
        path_vec[..dir.len()].copy_from_slice(dir.as_bytes());

        // One in/out pair: count only, no name buffer is touched.
        let input: Vec<Vec<u8>> = vec![path_vec.clone()];
        let mut output: Vec<Vec<u8>> = vec![vec![0u8; 4]];
        let ret = fs.req_ioctlv(
            mgr,
            FsIoctl::ReadDir as u32,
            Vectors {
                input: &input,
                output: &mut output,
            },
        );
        assert_eq!(ret, Ok(0));
        assert_eq!(u32::from_be_bytes(output[0][..4].try_into().unwrap()), 2);

        // Two pairs: names in a 13-byte stride.
        let input: Vec<Vec<u8>> = vec![path_vec, 2u32.to_be_bytes().to_vec()];
        let mut output: Vec<Vec<u8>> = vec![vec![0u8; 2 * 13], vec![0u8; 4]];
        let ret = fs.req_ioctlv(
            mgr,
            FsIoctl::ReadDir as u32,
            Vectors {
                input: &input,
                output: &mut output,
            },
        );
        assert_eq!(ret, Ok(0));
        let names: Vec<&str> = output[0]
            .chunks(13)
            .map(|c| cstr(c).unwrap())
            .collect();
        assert!(names.contains(&"rksys.dat"));
        assert!(names.contains(&"save.bin"));
        assert_eq!(u32::from_be_bytes(output[1][..4].try_into().unwrap()), 2);
    }

    #[test]
    fn direct_open_read_and_dir_iteration() {
        let (mut fs, _kernel, devices) = emu_with_sd();
        devices
            .with_volume(Drive::Sd, |vol| {
                vol.create_dir("/stuff")?;
                vol.create_file_new("/stuff/a.bin")?;
                vol.write_at("/stuff/a.bin", 0, b"direct content")?;
                vol.create_dir("/stuff/sub")?;
                Ok(0)
            })
            .unwrap();

        let dfd = fs.open(DIRECT_PATH, 0, Caller::default());
        assert!((DIRECT_BASE..DIRECT_BASE + DIRECT_COUNT as i32).contains(&dfd));

        // Open a file through the direct device.
        let path = b"0:/stuff/a.bin\0".to_vec();
        let mode = OpenMode::READ.bits().to_be_bytes().to_vec();
        let input: Vec<Vec<u8>> = vec![path, mode];
        let ret = fs.req_ioctlv(
            dfd,
            FsIoctl::DirectOpen as u32,
            Vectors {
                input: &input,
                output: &mut [],
            },
        );
        assert_eq!(ret, Ok(0));

        let mut buf = [0u8; 14];
        assert_eq!(fs.read(dfd, &mut buf), 14);
        assert_eq!(&buf, b"direct content");
        assert_eq!(fs.close(dfd), 0);

        // Iterate a directory through a fresh direct handle.
        let dfd = fs.open(DIRECT_PATH, 0, Caller::default());
        let input: Vec<Vec<u8>> = vec![b"0:/stuff\0".to_vec()];
        let ret = fs.req_ioctlv(
            dfd,
            FsIoctl::DirectOpenDir as u32,
            Vectors {
                input: &input,
                output: &mut [],
            },
        );
        assert_eq!(ret, Ok(0));

        let mut seen = Vec::new();
        loop {
            let mut output: Vec<Vec<u8>> = vec![vec![0u8; size_of::<DirectStat>()]];
            let ret = fs.req_ioctlv(
                dfd,
                FsIoctl::DirectDirNext as u32,
                Vectors {
                    input: &[],
                    output: &mut output,
                },
            );
            assert_eq!(ret, Ok(0));
            let stat = DirectStat::read_from_bytes(&output[0]).unwrap();
            let name = cstr(&stat.name).unwrap().to_owned();
            if name.is_empty() {
                break;
            }
            seen.push((name, stat.attribute));
        }
        assert_eq!(seen.len(), 2);
        assert!(seen.iter().any(|(n, a)| n == "a.bin" && a & FAT_ATTR_DIRECTORY == 0));
        assert!(seen.iter().any(|(n, a)| n == "sub" && a & FAT_ATTR_DIRECTORY != 0));
    }

    #[test]
    fn direct_open_on_unopened_handle_is_required() {
        let (mut fs, _kernel, _devices) = emu_with_sd();
        let dfd = fs.open(DIRECT_PATH, 0, Caller::default());
        // Using the handle before Direct_Open resolves nothing.
        let mut buf = [0u8; 4];
        assert_eq!(fs.read(dfd, &mut buf), i32::from(FsError::Invalid));
    }

    #[test]
    fn forwarded_file_open_uses_the_real_range() {
        let (mut fs, kernel, _devices) = emu_with_sd();
        kernel
            .files
            .lock()
            .insert("/tmp/log.txt".to_owned(), b"real file".to_vec());

        let fd = fs.open("$tmp/log.txt", OpenMode::READ.bits(), Caller::default());
        assert!((REAL_BASE..REAL_BASE + REAL_COUNT as i32).contains(&fd));
        let mut buf = [0u8; 9];
        assert_eq!(fs.read(fd, &mut buf), 9);
        assert_eq!(&buf, b"real file");
        assert_eq!(fs.close(fd), 0);
    }

    #[test]
    fn device_paths_fall_through() {
        let (mut fs, _kernel, _devices) = emu_with_sd();
        assert_eq!(
            fs.open("$dev/net/ip/top", 0, Caller::default()),
            i32::from(IosError::NotFound)
        );
    }

    #[test]
    fn eject_forces_descriptors_closed() {
        let (mut fs, _kernel, devices) = emu_with_sd();
        seed_save(&devices, b"data");
        let fd = fs.open(SAVE_ALIAS, OpenMode::READ.bits(), Caller::default());

        // A device fault takes the volume away between operations.
        devices.set_error(Drive::Sd);
        let mut buf = [0u8; 4];
        assert_eq!(fs.read(fd, &mut buf), i32::from(FsError::NotReady));
        assert!(!fs.files[fd as usize].in_use, "slot must be force-closed");
    }

    #[test]
    fn unknown_manager_ioctl_is_invalid() {
        let (mut fs, _kernel, _devices) = emu_with_sd();
        let mgr = fs.open("$dev/fs", 0, Caller::default());
        assert_eq!(
            fs.ioctl(mgr, 0x42, &[], &mut []),
            i32::from(FsError::Invalid)
        );
    }
}
