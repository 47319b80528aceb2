//! Emulated optical-disc interface.
//!
//! Claims the rewritten `/dev/di` path and serves drive commands from the
//! virtual disc. On top of plain emulation sits the patch layer: word
//! ranges of the disc whose top address bit is set are redirected into
//! files on external storage, recreated straight from their FAT cluster
//! numbers. Two private ioctls install the patch table and latch the
//! "game started" flag; once latched, neither can change again, which is
//! what keeps the running game from tampering with its own patches.

use std::fmt;
use std::sync::Arc;

use log::error;
use log::info;
use log::warn;
use num_enum::TryFromPrimitive;
use zerocopy::FromBytes;
use zerocopy::IntoBytes;

use crate::abi::DiscPatch;
use crate::abi::DriveInfo;
use crate::abi::TMD_MAX_SIZE;
use crate::disc::VirtualDisc;
use crate::error::DiError;
use crate::error::IosError;
use crate::error::di_reply;
use crate::ipc::Caller;
use crate::ipc::Vectors;
use crate::resource::KernelIpc;
use crate::resource::Resource;
use crate::storage::devmgr::DeviceManager;
use crate::storage::devmgr::Drive;
use crate::storage::fat::ClusterFile;
use crate::util::word_copy;

/// Alias the open hook rewrites `/dev/di` onto.
pub const ALIAS_PATH: &str = "~dev/di";

/// The real drive's path.
pub const REAL_PATH: &str = "/dev/di";

/// Drive command numbers, as found both in the ioctl number and the first
/// byte of the command block.
#[derive(Clone, Copy, Debug, Eq, PartialEq, TryFromPrimitive)]
#[repr(u32)]
#[allow(missing_docs)]
pub enum DiIoctl {
    /// Install the disc-patch table (private).
    PatchDisc = 0x00,
    /// Latch the game-started flag (private).
    StartGame = 0x01,
    Inquiry = 0x12,
    ReadDiskId = 0x70,
    Read = 0x71,
    GetCoverRegister = 0x7A,
    ClearCoverInterrupt = 0x86,
    Reset = 0x8A,
    OpenPartition = 0x8B,
    ClosePartition = 0x8C,
    UnencryptedRead = 0x8D,
    ReadDiskBca = 0xDA,
    GetStatusRegister = 0xDB,
    GetControlRegister = 0xDC,
}

/// Size of the command block accompanying every drive ioctl.
pub const COMMAND_BLOCK_SIZE: usize = 32;

/// Most patches an install may carry.
pub const MAX_PATCHES: usize = 200;

/// Word offsets with this bit set are patch-table territory.
const PATCH_FLAG: u32 = 0x8000_0000;

/// Word window `UnencryptedRead` accepts.
const UNENCRYPTED_LIMIT: u32 = 0x14000;

/// Copy-protection probe ranges answered with a drive error; the second
/// is the dual-layer variant.
const PROBE_RANGES: [(u32, u32); 2] = [(0x460A_0000, 0x460A_0008), (0x7ED4_0000, 0x7ED4_0008)];

/// Parsed command block.
#[derive(Clone, Copy, Debug)]
pub struct DvdCommand {
    /// Command byte, matching the ioctl number.
    pub cmd: u8,
    /// Command arguments, big-endian words on the wire.
    pub args: [u32; 7],
}

impl DvdCommand {
    fn parse(input: &[u8]) -> Option<DvdCommand> {
        if input.len() < COMMAND_BLOCK_SIZE {
            return None;
        }
        let mut args = [0u32; 7];
        for (i, arg) in args.iter_mut().enumerate() {
            let at = 4 + i * 4;
            *arg = u32::from_be_bytes(input[at..at + 4].try_into().unwrap());
        }
        Some(DvdCommand {
            cmd: input[0],
            args,
        })
    }
}

/// A patch at rest: the installed record plus nothing else; files are
/// recreated from the cluster facts at read time.
#[derive(Clone, Copy, Debug)]
struct Patch {
    disc_offset: u32,
    disc_length: u32,
    start_cluster: u32,
    cluster_hint: u32,
    file_offset: u32,
    drive: Drive,
}

/// The emulated drive.
pub struct EmuDi {
    devices: Arc<DeviceManager>,
    kernel: Arc<dyn KernelIpc>,
    real_fd: i32,
    disc: Option<VirtualDisc>,
    patches: Vec<Patch>,
    game_started: bool,
}

impl fmt::Debug for EmuDi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EmuDi")
            .field("patches", &self.patches.len())
            .field("game_started", &self.game_started)
            .field("virtual", &self.disc.is_some())
            .finish_non_exhaustive()
    }
}

fn write_output(output: &mut [u8], data: &[u8]) -> Result<(), DiError> {
    if output.len() < data.len() {
        return Err(DiError::Security);
    }
    word_copy(&mut output[..data.len()], data);
    Ok(())
}

impl EmuDi {
    /// Stand up the drive emulator. The real drive is opened for the
    /// commands that still forward; it may legitimately be absent.
    pub fn new(
        devices: Arc<DeviceManager>,
        kernel: Arc<dyn KernelIpc>,
        disc: Option<VirtualDisc>,
    ) -> EmuDi {
        let real_fd = kernel.open(REAL_PATH, 0);
        if real_fd < 0 {
            info!("real drive not available: {real_fd}");
        }
        EmuDi {
            devices,
            kernel,
            real_fd,
            disc,
            patches: Vec::new(),
            game_started: false,
        }
    }

    /// Attach the virtual disc that replaces the medium.
    pub fn set_disc(&mut self, disc: VirtualDisc) {
        self.disc = Some(disc);
    }

    /// Whether the game-started flag has been latched.
    pub fn game_started(&self) -> bool {
        self.game_started
    }

    fn install_patches(&mut self, input: &[u8]) -> i32 {
        if self.game_started {
            // The table is immutable from the moment the game runs.
            return DiError::Security.into();
        }
        if input.is_empty() || input.len() % size_of::<DiscPatch>() != 0 {
            return IosError::Invalid.into();
        }
        if input.len() > MAX_PATCHES * size_of::<DiscPatch>() {
            error!("not enough memory for disc patches");
            return IosError::Invalid.into();
        }

        let mut patches = Vec::with_capacity(input.len() / size_of::<DiscPatch>());
        for raw in input.chunks_exact(size_of::<DiscPatch>()) {
            let rec = DiscPatch::read_from_bytes(raw).unwrap();
            let Ok(drive) = Drive::try_from(rec.drive.get()) else {
                return IosError::Invalid.into();
            };
            patches.push(Patch {
                disc_offset: rec.disc_offset.get(),
                disc_length: rec.disc_length.get(),
                start_cluster: rec.start_cluster.get(),
                cluster_hint: rec.cluster_hint.get(),
                file_offset: rec.file_offset.get(),
                drive,
            });
        }
        // The table must be ordered and overlap-free or lookup breaks.
        for pair in patches.windows(2) {
            if pair[0].disc_offset + pair[0].disc_length > pair[1].disc_offset {
                error!("patch table is not sorted/disjoint");
                return IosError::Invalid.into();
            }
        }

        info!("installed {} disc patches", patches.len());
        self.patches = patches;
        0
    }

    fn start_game(&mut self) -> i32 {
        if self.game_started {
            return DiError::Security.into();
        }
        warn!("starting game");
        self.game_started = true;
        0
    }

    /// Find the first patch whose range contains `offset`, or the table
    /// length when none does.
    fn search_patch(&self, offset: u32) -> usize {
        use std::cmp::Ordering;
        self.patches
            .binary_search_by(|p| {
                if offset < p.disc_offset {
                    Ordering::Greater
                } else if offset >= p.disc_offset + p.disc_length {
                    Ordering::Less
                } else {
                    Ordering::Equal
                }
            })
            .unwrap_or(self.patches.len())
    }

    fn real_read(&mut self, out: &mut [u8], word_offset: u32) -> i32 {
        if let Some(disc) = self.disc.as_mut() {
            return di_reply(disc.read_from_partition(out, word_offset));
        }
        if self.real_fd < 0 {
            return DiError::Drive.into();
        }
        let mut block = [0u8; COMMAND_BLOCK_SIZE];
        block[0] = DiIoctl::Read as u8;
        block[4..8].copy_from_slice(&(out.len() as u32).to_be_bytes());
        block[8..12].copy_from_slice(&word_offset.to_be_bytes());
        self.kernel
            .ioctl(self.real_fd, DiIoctl::Read as u32, &block, out)
    }

    /// Serve one read, splicing in the patch table wherever the word
    /// offset carries the patch flag.
    fn read(&mut self, out: &mut [u8], mut offset: u32, length: u32) -> i32 {
        if length == 0 {
            return DiError::Ok.into();
        }
        let mut out = &mut out[..length as usize];

        if offset & PATCH_FLAG == 0 {
            let last_word = offset + (length >> 2) - 1;
            if last_word & PATCH_FLAG == 0 {
                return self.real_read(out, offset);
            }
            // The read straddles into patch territory.
            let plain_bytes = (PATCH_FLAG - offset) as usize * 4;
            let ret = self.real_read(&mut out[..plain_bytes], offset);
            if ret != i32::from(DiError::Ok) {
                error!("partial read failed: {ret}");
                out[..plain_bytes].fill(0);
            }
            out = &mut out[plain_bytes..];
            offset = PATCH_FLAG;
        }

        let mut idx = self.search_patch(offset);
        while !out.is_empty() {
            if idx >= self.patches.len() {
                // Past the table: zeros, reported as success. Some games
                // read straight off the end of their own file tables.
                warn!("read past the patch table");
                out.fill(0);
                return DiError::Ok.into();
            }
            let patch = self.patches[idx];

            if offset < patch.disc_offset {
                // Gap between patches reads as zeros.
                let gap = ((patch.disc_offset - offset) as usize * 4).min(out.len());
                out[..gap].fill(0);
                out = &mut out[gap..];
                offset += (gap >> 2) as u32;
                continue;
            }

            let Some((device, geometry)) = self.devices.cluster_source(patch.drive) else {
                error!("patch drive {:?} is not mounted", patch.drive);
                return DiError::Drive.into();
            };
            let mut file = ClusterFile::new(device, geometry, patch.start_cluster)
                .with_hint(patch.file_offset, patch.cluster_hint);

            let into_patch = (offset - patch.disc_offset) as usize * 4;
            let take = (patch.disc_length as usize * 4 - into_patch).min(out.len());
            let at = u64::from(patch.file_offset) + into_patch as u64;
            match file.read_at(at, &mut out[..take]) {
                Ok(got) => {
                    if got < take {
                        error!("patch read fell short at {at:#x}");
                        out[got..take].fill(0);
                    }
                }
                Err(e) => {
                    error!("patch read failed: {e:?}");
                    out[..take].fill(0);
                }
            }

            out = &mut out[take..];
            offset += (take >> 2) as u32;
            idx += 1;
        }
        DiError::Ok.into()
    }

    fn emulated_ioctl(&mut self, block: &DvdCommand, cmd: u32, output: &mut [u8]) -> i32 {
        let Some(ioctl) = DiIoctl::try_from(cmd).ok() else {
            error!("unknown ioctl {cmd:#04x}");
            return DiError::Security.into();
        };

        let result = match ioctl {
            DiIoctl::Reset => {
                // A reset spins the drive back to the no-partition state.
                if let Some(disc) = self.disc.as_mut() {
                    disc.close_partition();
                }
                Ok(())
            }
            DiIoctl::ClearCoverInterrupt => Ok(()),

            DiIoctl::Inquiry => {
                if output.len() != size_of::<DriveInfo>() {
                    error!("Inquiry: output buffer length does not match DriveInfo");
                    Err(DiError::Security)
                } else if self.real_fd < 0 {
                    Err(DiError::Drive)
                } else {
                    let mut raw = [0u8; COMMAND_BLOCK_SIZE];
                    raw[0] = block.cmd;
                    return self
                        .kernel
                        .ioctl(self.real_fd, DiIoctl::Inquiry as u32, &raw, output);
                }
            }

            DiIoctl::GetStatusRegister | DiIoctl::GetControlRegister => {
                write_output(output, &0u32.to_be_bytes())
            }

            DiIoctl::GetCoverRegister => {
                let dicvr: u32 = match &self.disc {
                    Some(disc) if disc.is_inserted() => 0,
                    _ => 1,
                };
                write_output(output, &dicvr.to_be_bytes())
            }

            DiIoctl::ReadDiskId => match self.disc.as_mut() {
                None => Err(DiError::Drive),
                Some(disc) => match disc.read_disk_id() {
                    Ok(id) => {
                        info!(
                            "read disc id: {}",
                            std::str::from_utf8(&id.game_id).unwrap_or("????")
                        );
                        write_output(output, id.as_bytes())
                    }
                    Err(e) => Err(e),
                },
            },

            DiIoctl::UnencryptedRead => {
                let byte_length = block.args[0];
                let word_offset = block.args[1];
                if byte_length as usize != output.len() {
                    error!("UnencryptedRead: output buffer length does not match command block");
                    return DiError::Security.into();
                }
                let word_end = word_offset.wrapping_add(byte_length.div_ceil(4));
                if PROBE_RANGES
                    .iter()
                    .any(|&(lo, hi)| word_offset >= lo && word_end <= hi)
                {
                    // The modchip probe must look like a real drive error.
                    return DiError::Drive.into();
                }
                if word_end > UNENCRYPTED_LIMIT {
                    return DiError::Security.into();
                }
                match self.disc.as_mut() {
                    Some(disc) => disc.unencrypted_read(output, word_offset),
                    None => Err(DiError::Drive),
                }
            }

            DiIoctl::ReadDiskBca => {
                // Answered locally; one known title reads this as copy
                // protection.
                if output.len() < 0x40 {
                    Err(DiError::Security)
                } else {
                    let mut bca = [0u8; 0x40];
                    bca[0x33] = 1;
                    write_output(output, &bca)
                }
            }

            DiIoctl::ClosePartition => {
                if let Some(disc) = self.disc.as_mut() {
                    disc.close_partition();
                }
                Ok(())
            }

            other => {
                error!("unknown ioctl {:#04x}", other as u32);
                Err(DiError::Security)
            }
        };
        di_reply(result)
    }

    fn emulated_ioctlv(&mut self, block: &DvdCommand, cmd: u32, vectors: Vectors<'_>) -> i32 {
        match DiIoctl::try_from(cmd) {
            Ok(DiIoctl::OpenPartition) => {
                info!("open partition");
                if vectors.input.len() != 3 || vectors.output.len() != 2 {
                    error!("invalid I/O vector count");
                    return DiError::Security.into();
                }
                // An in-ticket may be supplied; when present it must be
                // complete. The certificate chain is accepted verbatim.
                if !vectors.input[1].is_empty()
                    && vectors.input[1].len() < size_of::<crate::abi::Ticket>()
                {
                    error!("input ticket vector size is too short");
                    return DiError::Security.into();
                }
                if vectors.output[0].len() < TMD_MAX_SIZE {
                    error!("output TMD vector size is too short");
                    return DiError::Security.into();
                }
                if vectors.output[1].len() < 4 {
                    error!("output ES error vector size is too short");
                    return DiError::Security.into();
                }

                let Some(disc) = self.disc.as_mut() else {
                    return DiError::Drive.into();
                };
                di_reply(disc.open_partition(block.args[0], vectors.output[0].as_mut_slice()))
            }
            _ => {
                error!("unknown ioctlv {cmd:#04x}");
                DiError::Security.into()
            }
        }
    }
}

impl Resource for EmuDi {
    fn open(&mut self, path: &str, _mode: u32, _caller: Caller) -> i32 {
        if path == ALIAS_PATH {
            // One logical drive; handle zero is the only handle.
            0
        } else {
            IosError::NotFound.into()
        }
    }

    fn close(&mut self, _fd: i32) -> i32 {
        0
    }

    fn ioctl(&mut self, _fd: i32, cmd: u32, input: &[u8], output: &mut [u8]) -> i32 {
        // The private proxy ioctls come from the host, not the drive
        // protocol, and reply kernel-style codes.
        match DiIoctl::try_from(cmd) {
            Ok(DiIoctl::PatchDisc) => return self.install_patches(input),
            Ok(DiIoctl::StartGame) => return self.start_game(),
            _ => {}
        }

        let Some(block) = DvdCommand::parse(input) else {
            error!("wrong input command block size");
            return DiError::Security.into();
        };

        if cmd == DiIoctl::Read as u32 {
            if u32::from(block.cmd) != DiIoctl::Read as u32 {
                return DiError::Invalid.into();
            }
            let length = block.args[0];
            let offset = block.args[1];
            if length as usize > output.len() {
                error!("read: output size {:#x} < length {length:#x}", output.len());
                return DiError::Security.into();
            }
            return self.read(output, offset, length & !3);
        }

        if self.disc.is_some() {
            return self.emulated_ioctl(&block, cmd, output);
        }

        // No virtual disc: hand the command to the real drive untouched.
        if self.real_fd < 0 {
            return DiError::Drive.into();
        }
        self.kernel.ioctl(self.real_fd, cmd, input, output)
    }

    fn ioctlv(&mut self, _fd: i32, cmd: u32, vectors: Vectors<'_>) -> i32 {
        if vectors.input.is_empty() || vectors.input[0].len() < COMMAND_BLOCK_SIZE {
            error!("wrong input command block size");
            return DiError::Security.into();
        }
        let block = DvdCommand::parse(&vectors.input[0]).unwrap();

        if self.disc.is_some() {
            return self.emulated_ioctlv(&block, cmd, vectors);
        }
        if self.real_fd < 0 {
            return DiError::Drive.into();
        }
        self.kernel.ioctlv(self.real_fd, cmd, vectors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disc::tests::PARTITION_WORDS;
    use crate::disc::tests::disc_on_sd;
    use crate::resource::tests::NoKernel;

    fn command(cmd: DiIoctl, args: &[u32]) -> Vec<u8> {
        let mut block = vec![0u8; COMMAND_BLOCK_SIZE];
        block[0] = cmd as u8;
        for (i, a) in args.iter().enumerate() {
            block[4 + i * 4..8 + i * 4].copy_from_slice(&a.to_be_bytes());
        }
        block
    }

    fn drive_with_disc() -> (EmuDi, crate::disc::tests::TestImage) {
        let (disc, image, _ctx) = disc_on_sd(false);
        let devices = {
            // The SplitImage holds the manager; grab another handle
            // through a fresh reference for the drive itself.
            disc_devices(&disc)
        };
        let mut di = EmuDi::new(devices, Arc::new(NoKernel), None);
        di.set_disc(VirtualDisc::SplitImage(disc));
        (di, image)
    }

    fn disc_devices(disc: &crate::disc::SplitImage) -> Arc<DeviceManager> {
        disc.devices_handle()
    }

    fn open_partition(di: &mut EmuDi) {
        let mut id = vec![0u8; 0x20];
        let block = command(DiIoctl::ReadDiskId, &[]);
        assert_eq!(
            di.ioctl(0, DiIoctl::ReadDiskId as u32, &block, &mut id),
            i32::from(DiError::Ok)
        );

        let block = command(DiIoctl::OpenPartition, &[PARTITION_WORDS]);
        let input: Vec<Vec<u8>> = vec![block, vec![], vec![]];
        let mut output: Vec<Vec<u8>> = vec![vec![0; TMD_MAX_SIZE], vec![0; 4]];
        let ret = di.ioctlv(
            0,
            DiIoctl::OpenPartition as u32,
            Vectors {
                input: &input,
                output: &mut output,
            },
        );
        assert_eq!(ret, i32::from(DiError::Ok));
    }

    #[test]
    fn open_accepts_only_the_alias() {
        let (mut di, _image) = drive_with_disc();
        assert_eq!(di.open(ALIAS_PATH, 0, Caller::default()), 0);
        assert_eq!(
            di.open("/dev/di", 0, Caller::default()),
            i32::from(IosError::NotFound)
        );
    }

    #[test]
    fn disk_id_and_cover_register() {
        let (mut di, _image) = drive_with_disc();
        let block = command(DiIoctl::ReadDiskId, &[]);
        let mut out = vec![0u8; 0x20];
        assert_eq!(
            di.ioctl(0, DiIoctl::ReadDiskId as u32, &block, &mut out),
            i32::from(DiError::Ok)
        );
        assert_eq!(&out[..4], b"RMCP");

        let block = command(DiIoctl::GetCoverRegister, &[]);
        let mut out = vec![0u8; 4];
        assert_eq!(
            di.ioctl(0, DiIoctl::GetCoverRegister as u32, &block, &mut out),
            i32::from(DiError::Ok)
        );
        assert_eq!(u32::from_be_bytes(out.try_into().unwrap()), 0);
    }

    #[test]
    fn status_registers_read_zero() {
        let (mut di, _image) = drive_with_disc();
        for cmd in [DiIoctl::GetStatusRegister, DiIoctl::GetControlRegister] {
            let block = command(cmd, &[]);
            let mut out = vec![0xFFu8; 4];
            assert_eq!(di.ioctl(0, cmd as u32, &block, &mut out), i32::from(DiError::Ok));
            assert_eq!(out, vec![0; 4]);
        }
    }

    #[test]
    fn unencrypted_read_window_and_probes() {
        let (mut di, image) = drive_with_disc();

        // In-window read returns header bytes.
        let block = command(DiIoctl::UnencryptedRead, &[0x20, 0]);
        let mut out = vec![0u8; 0x20];
        assert_eq!(
            di.ioctl(0, DiIoctl::UnencryptedRead as u32, &block, &mut out),
            i32::from(DiError::Ok)
        );
        assert_eq!(out, image.bytes[..0x20]);

        // The window edge: word 0x14000 is out.
        let block = command(DiIoctl::UnencryptedRead, &[0x20, UNENCRYPTED_LIMIT]);
        let mut out = vec![0xAAu8; 0x20];
        assert_eq!(
            di.ioctl(0, DiIoctl::UnencryptedRead as u32, &block, &mut out),
            i32::from(DiError::Security)
        );
        assert_eq!(out, vec![0xAA; 0x20], "output must be untouched");

        // Modchip probes answer with a drive error and leave the buffer.
        for (lo, _hi) in PROBE_RANGES {
            let block = command(DiIoctl::UnencryptedRead, &[0x20, lo]);
            let mut out = vec![0x55u8; 0x20];
            assert_eq!(
                di.ioctl(0, DiIoctl::UnencryptedRead as u32, &block, &mut out),
                i32::from(DiError::Drive)
            );
            assert_eq!(out, vec![0x55; 0x20]);
        }
    }

    #[test]
    fn bca_read() {
        let (mut di, _image) = drive_with_disc();
        let block = command(DiIoctl::ReadDiskBca, &[]);
        let mut out = vec![0u8; 0x40];
        assert_eq!(
            di.ioctl(0, DiIoctl::ReadDiskBca as u32, &block, &mut out),
            i32::from(DiError::Ok)
        );
        assert_eq!(out[0x33], 1);
        let mut short = vec![0u8; 0x20];
        assert_eq!(
            di.ioctl(0, DiIoctl::ReadDiskBca as u32, &block, &mut short),
            i32::from(DiError::Security)
        );
    }

    #[test]
    fn partition_read_through_drive_ioctl() {
        let (mut di, image) = drive_with_disc();
        open_partition(&mut di);

        let block = command(DiIoctl::Read, &[0x40, 0]);
        let mut out = vec![0u8; 0x40];
        assert_eq!(
            di.ioctl(0, DiIoctl::Read as u32, &block, &mut out),
            i32::from(DiError::Ok)
        );
        assert_eq!(out, image.plaintext[..0x40]);
    }

    fn install_one_patch(di: &mut EmuDi, patch: &DiscPatch) -> i32 {
        di.ioctl(0, DiIoctl::PatchDisc as u32, patch.as_bytes(), &mut [])
    }

    fn patch_for_file(di: &EmuDi, name: &str, content: &[u8], disc_offset: u32) -> DiscPatch {
        let devices = di.devices.clone();
        let path = format!("/saoirse/{name}");
        let entry = devices
            .with_volume(Drive::Sd, |vol| {
                vol.create_file_always(&path)?;
                vol.write_at(&path, 0, content)?;
                vol.locate(&path)
            })
            .unwrap();
        DiscPatch {
            disc_offset: disc_offset.into(),
            disc_length: ((content.len() / 4) as u32).into(),
            start_cluster: entry.start_cluster.into(),
            cluster_hint: entry.start_cluster.into(),
            file_offset: 0.into(),
            drive: (Drive::Sd as u32).into(),
        }
    }

    #[test]
    fn patched_read_splices_file_content() {
        let (mut di, _image) = drive_with_disc();
        open_partition(&mut di);

        let content: Vec<u8> = (0..4096u32).map(|i| (i % 256) as u8).collect();
        let patch = patch_for_file(&di, "p0.bin", &content, 0x8000_0100);
        assert_eq!(install_one_patch(&mut di, &patch), 0);

        // Whole-patch read.
        let block = command(DiIoctl::Read, &[4096, 0x8000_0100]);
        let mut out = vec![0u8; 4096];
        assert_eq!(
            di.ioctl(0, DiIoctl::Read as u32, &block, &mut out),
            i32::from(DiError::Ok)
        );
        assert_eq!(out, content);

        // Offset into the middle of the patch.
        let block = command(DiIoctl::Read, &[64, 0x8000_0100 + 0x10]);
        let mut out = vec![0u8; 64];
        di.ioctl(0, DiIoctl::Read as u32, &block, &mut out);
        assert_eq!(out, content[0x40..0x40 + 64]);

        // Reads past the table come back zeroed but successful.
        let block = command(DiIoctl::Read, &[64, 0x8000_0100 + (content.len() as u32 / 4)]);
        let mut out = vec![0xEEu8; 64];
        assert_eq!(
            di.ioctl(0, DiIoctl::Read as u32, &block, &mut out),
            i32::from(DiError::Ok)
        );
        assert_eq!(out, vec![0; 64]);
    }

    #[test]
    fn patch_table_locks_after_game_start() {
        let (mut di, _image) = drive_with_disc();
        let content = vec![7u8; 512];
        let patch = patch_for_file(&di, "p1.bin", &content, 0x8000_0000);
        assert_eq!(install_one_patch(&mut di, &patch), 0);
        assert_eq!(di.ioctl(0, DiIoctl::StartGame as u32, &[], &mut []), 0);
        assert!(di.game_started());

        // A second install is refused and the table is untouched.
        let other = patch_for_file(&di, "p2.bin", &content, 0x8000_4000);
        assert_eq!(
            install_one_patch(&mut di, &other),
            i32::from(DiError::Security)
        );
        assert_eq!(di.patches.len(), 1);
        assert_eq!(di.patches[0].disc_offset, 0x8000_0000);

        // So is a second start.
        assert_eq!(
            di.ioctl(0, DiIoctl::StartGame as u32, &[], &mut []),
            i32::from(DiError::Security)
        );
    }

    #[test]
    fn overlapping_patch_table_is_rejected() {
        let (mut di, _image) = drive_with_disc();
        let content = vec![1u8; 256];
        let a = patch_for_file(&di, "p3.bin", &content, 0x8000_0000);
        let mut table = a.as_bytes().to_vec();
        let mut b = a;
        b.disc_offset = 0x8000_0020.into();
        table.extend_from_slice(b.as_bytes());
        assert_eq!(
            di.ioctl(0, DiIoctl::PatchDisc as u32, &table, &mut []),
            i32::from(IosError::Invalid)
        );
        assert!(di.patches.is_empty());
    }

    #[test]
    fn empty_patch_install_is_invalid() {
        let (mut di, _image) = drive_with_disc();
        assert_eq!(
            di.ioctl(0, DiIoctl::PatchDisc as u32, &[], &mut []),
            i32::from(IosError::Invalid)
        );
    }

    #[test]
    fn unknown_ioctl_is_a_security_error() {
        let (mut di, _image) = drive_with_disc();
        let block = command(DiIoctl::Reset, &[]);
        assert_eq!(
            di.ioctl(0, 0x99, &block, &mut []),
            i32::from(DiError::Security)
        );
    }

    #[test]
    fn reset_closes_the_partition() {
        let (mut di, _image) = drive_with_disc();
        open_partition(&mut di);
        let block = command(DiIoctl::Reset, &[]);
        assert_eq!(
            di.ioctl(0, DiIoctl::Reset as u32, &block, &mut []),
            i32::from(DiError::Ok)
        );
        // A fresh open succeeds because the reset closed the last one.
        open_partition(&mut di);
    }
}
