//! On-disc and on-wire records of the console.
//!
//! Fixed-layout structures shared with the host, the disc format and the
//! title store. The console is big-endian and none of these records carry
//! alignment padding, so every multi-byte field is a `zerocopy` big-endian
//! integer and the structs are valid at any byte offset.
//!
//! Sizes are part of the contract (callers validate vector lengths against
//! them) and are pinned by const assertions below.

use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;
use zerocopy::Unaligned;
use zerocopy::big_endian::U16;
use zerocopy::big_endian::U32;
use zerocopy::big_endian::U64;

/// Maximum length of an internal-filesystem path, terminator included.
pub const FS_MAX_PATH: usize = 64;

/// Maximum length of a direct-access (external FAT) path.
pub const DIRECT_MAX_PATH: usize = 2048;

/// Magic number identifying a disc header at offset 0x18.
pub const DISC_MAGIC: u32 = 0x5D1C_9EA3;

/// The 32-byte disc header at image offset 0.
#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct DiskId {
    /// Four-character game identifier, e.g. `RMCP`.
    pub game_id: [u8; 4],
    /// Maker code.
    pub group_id: U16,
    /// Disc number within a multi-disc title.
    pub disc_number: u8,
    /// Disc revision.
    pub disc_version: u8,
    /// Audio streaming enable flag.
    pub audio_streaming: u8,
    /// Streaming buffer size selector.
    pub stream_buffer_size: u8,
    /// Unused.
    pub reserved: [u8; 14],
    /// [`DISC_MAGIC`] for discs of this platform.
    pub magic: U32,
    /// Magic of the predecessor platform, zero here.
    pub gc_magic: U32,
}

/// Drive identification record returned by `Inquiry`.
#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct DriveInfo {
    /// Drive firmware revision.
    pub revision: U16,
    /// Device code.
    pub device_code: U16,
    /// Firmware release date, BCD.
    pub release_date: U32,
    /// Unused tail.
    pub padding: [u8; 0x18],
}

/// One launch-restriction entry of a ticket.
#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct TicketLimit {
    /// Restriction kind.
    pub tag: U32,
    /// Restriction argument.
    pub value: U32,
}

/// Identity portion of a ticket, shared verbatim with ticket views.
#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct TicketInfo {
    /// Unique ticket identifier.
    pub ticket_id: U64,
    /// Console the ticket is bound to, zero for common tickets.
    pub console_id: U32,
    /// Title the ticket licenses.
    pub title_id: U64,
    /// Unknown field kept verbatim.
    pub unknown_0x1e4: U16,
    /// Minimum title version the ticket permits.
    pub ticket_title_version: U16,
    /// Mask of permitted sibling titles.
    pub permitted_titles_mask: U16,
    /// Permission mask.
    pub permit_mask: U32,
    /// Whether the title may be exported to external storage.
    pub allow_title_export: u8,
    /// Selects which common key decrypts [`Ticket::title_key`].
    pub common_key_index: u8,
    /// Reserved.
    pub reserved: [u8; 0x30],
    /// Content-index bitmask.
    pub cidx_mask: [u8; 0x40],
    /// Padding.
    pub fill1: [u8; 2],
    /// Launch restrictions.
    pub limits: [TicketLimit; 8],
    /// Padding.
    pub fill2: [u8; 2],
}

/// A signed ticket as stored on disc and in the title store.
#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct Ticket {
    /// Signature algorithm selector.
    pub sig_type: U32,
    /// RSA-2048 signature over the body.
    pub sig_block: [u8; 0x100],
    /// Padding to the signed region.
    pub fill1: [u8; 0x3C],
    /// Certificate chain issuer.
    pub issuer: [u8; 64],
    /// Padding.
    pub fill2: [u8; 0x3F],
    /// Title key, AES-encrypted under the common key.
    pub title_key: [u8; 16],
    /// Padding.
    pub fill3: u8,
    /// Identity and restrictions.
    pub info: TicketInfo,
}

/// The in-memory ticket digest the title service hands to callers.
#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct TicketView {
    /// View index.
    pub view: U32,
    /// Identity copied from the ticket.
    pub info: TicketInfo,
}

/// One content entry of a TMD.
#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct TmdContent {
    /// Content identifier.
    pub cid: U32,
    /// Content index.
    pub index: U16,
    /// Content flags.
    pub flags: U16,
    /// Byte size.
    pub size: U64,
    /// SHA-1 digest of the content.
    pub hash: [u8; 0x14],
}

/// Header of a title-metadata record; `num_contents` entries of
/// [`TmdContent`] follow it.
#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct TmdHeader {
    /// Signature algorithm selector.
    pub sig_type: U32,
    /// RSA-2048 signature over the body.
    pub sig_block: [u8; 0x100],
    /// Padding to the signed region.
    pub fill1: [u8; 60],
    /// Certificate chain issuer.
    pub issuer: [u8; 64],
    /// Format version.
    pub version: u8,
    /// Certificate revocation list version.
    pub ca_crl_version: u8,
    /// Signer revocation list version.
    pub signer_crl_version: u8,
    /// Set for titles of the successor platform.
    pub alt_platform: u8,
    /// Kernel title this title runs under.
    pub sys_version: U64,
    /// The title this record describes.
    pub title_id: U64,
    /// Title kind.
    pub title_type: U32,
    /// Maker code.
    pub group_id: U16,
    /// Zero.
    pub zero: U16,
    /// Sales region.
    pub region: U16,
    /// Parental-control ratings, passed through verbatim.
    pub ratings: [u8; 16],
    /// Reserved.
    pub reserved: [u8; 12],
    /// Permitted IPC device mask, passed through verbatim.
    pub ipc_mask: [u8; 12],
    /// Reserved.
    pub reserved2: [u8; 18],
    /// Hardware-access rights, passed through verbatim.
    pub access_rights: U32,
    /// Title version.
    pub title_version: U16,
    /// Number of [`TmdContent`] entries following the header.
    pub num_contents: U16,
    /// Index of the content booted first.
    pub boot_index: U16,
    /// Padding.
    pub fill2: U16,
}

/// Byte size of the smallest valid TMD (one content entry).
pub const TMD_MIN_SIZE: usize = size_of::<TmdHeader>() + size_of::<TmdContent>();

/// Byte size of the fixed 512-content TMD variant the drive returns.
pub const TMD_MAX_SIZE: usize = size_of::<TmdHeader>() + 512 * size_of::<TmdContent>();

/// Partition descriptor, read from the partition's word offset on disc.
/// All offsets are in 4-byte words relative to the partition start.
#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct PartitionHeader {
    /// The partition's ticket, carrying the encrypted title key.
    pub ticket: Ticket,
    /// TMD length in bytes.
    pub tmd_byte_length: U32,
    /// TMD location.
    pub tmd_word_offset: U32,
    /// Certificate chain length in bytes.
    pub cert_chain_byte_length: U32,
    /// Certificate chain location.
    pub cert_chain_word_offset: U32,
    /// Hash-table location.
    pub h3_table_word_offset: U32,
    /// Start of the encrypted data area.
    pub data_word_offset: U32,
    /// Length of the encrypted data area in words.
    pub data_word_length: U32,
}

/// Attribute block passed to the filesystem manager's create/attribute
/// ioctls.
#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct AttrBlock {
    /// Owner identifier.
    pub owner_id: U32,
    /// Group identifier.
    pub group_id: U16,
    /// NUL-terminated path.
    pub path: [u8; FS_MAX_PATH],
    /// Owner access bits.
    pub owner_perm: u8,
    /// Group access bits.
    pub group_perm: u8,
    /// Access bits for everyone else.
    pub other_perm: u8,
    /// File attribute bits.
    pub attributes: u8,
    /// Padding.
    pub pad: [u8; 2],
}

/// Input block of the filesystem manager's rename ioctl.
#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct RenameBlock {
    /// NUL-terminated source path.
    pub path_old: [u8; FS_MAX_PATH],
    /// NUL-terminated destination path.
    pub path_new: [u8; FS_MAX_PATH],
}

/// Output record of the direct-access directory iterator.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct DirectStat {
    /// Continuation cookie.
    pub dir_offset: U64,
    /// Entry size in bytes.
    pub size: U64,
    /// FAT attribute bits.
    pub attribute: u8,
    /// NUL-terminated entry name; empty marks the end of the directory.
    pub name: [u8; DIRECT_MAX_PATH],
}

impl std::fmt::Debug for DirectStat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectStat")
            .field("dir_offset", &self.dir_offset.get())
            .field("size", &self.size.get())
            .field("attribute", &self.attribute)
            .field("name", &crate::util::cstr(&self.name).unwrap_or("<bad>"))
            .finish()
    }
}

/// FAT attribute bit reported for directories in [`DirectStat::attribute`].
pub const FAT_ATTR_DIRECTORY: u8 = 0x10;

/// Output of the per-file stats ioctl.
#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct FileStats {
    /// File size in bytes.
    pub size: U32,
    /// Current cursor position.
    pub pos: U32,
}

/// One disc patch: a word range of the virtual disc redirected into a file
/// on external storage, addressed by its FAT cluster so no path lookup is
/// needed at read time.
#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct DiscPatch {
    /// First patched word on the disc.
    pub disc_offset: U32,
    /// Patched length in words.
    pub disc_length: U32,
    /// First cluster of the backing file.
    pub start_cluster: U32,
    /// Cluster the read cursor starts in, a seek accelerator.
    pub cluster_hint: U32,
    /// Byte offset within the backing file matching `disc_offset`.
    pub file_offset: U32,
    /// Logical drive holding the backing file.
    pub drive: U32,
}

/// Input of the notification channel's clock-set ioctl.
#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct SetTimeArgs {
    /// Hardware timer sample taken by the host.
    pub tick: U32,
    /// Epoch, in seconds, matching that sample.
    pub epoch: U64,
}

const _: () = assert!(size_of::<DiskId>() == 0x20);
const _: () = assert!(size_of::<DriveInfo>() == 0x20);
const _: () = assert!(size_of::<TicketInfo>() == 0xD4);
const _: () = assert!(size_of::<Ticket>() == 0x2A4);
const _: () = assert!(size_of::<TicketView>() == 0xD8);
const _: () = assert!(size_of::<TmdHeader>() == 0x1E4);
const _: () = assert!(size_of::<TmdContent>() == 0x24);
const _: () = assert!(size_of::<PartitionHeader>() == 0x2C0);
const _: () = assert!(size_of::<AttrBlock>() == 76);
const _: () = assert!(size_of::<RenameBlock>() == 128);
const _: () = assert!(size_of::<DirectStat>() == 2065);
const _: () = assert!(size_of::<DiscPatch>() == 24);
const _: () = assert!(size_of::<SetTimeArgs>() == 12);

/// Copy a path into a fixed NUL-terminated buffer, if it fits.
pub fn path_array<const N: usize>(path: &str) -> Option<[u8; N]> {
    let bytes = path.as_bytes();
    if bytes.len() >= N {
        return None;
    }
    let mut out = [0u8; N];
    out[..bytes.len()].copy_from_slice(bytes);
    Some(out)
}
