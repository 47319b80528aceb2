//! FAT adapter: `fatfs` glue plus a raw cluster layer.
//!
//! Two views of the same volume coexist. Path-based file operations go
//! through the `fatfs` crate, wrapped in [`Volume`] so the rest of the
//! system never holds borrow-tied file objects. The raw layer
//! ([`Geometry`], [`ClusterFile`]) reads the FAT directly through the
//! sector device; it is what lets a disc patch recreate a file object from
//! a bare cluster number with no path lookup, and what gives the virtual
//! disc constant-time backward seeks via a prebuilt cluster map.

use std::fmt;
use std::io;
use std::io::Read;
use std::io::Seek;
use std::io::SeekFrom;
use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use log::warn;

use crate::error::FsError;
use crate::storage::SECTOR_SIZE;
use crate::storage::SharedDevice;
use crate::storage::StorageError;
use crate::time::TimeBase;
use crate::time::civil_from_epoch;

/// Map a FAT-library error onto the service taxonomy. This is the single
/// translation point; nothing else in the crate inspects `io::Error`.
pub(crate) fn fs_error_from_io(err: &io::Error) -> FsError {
    use io::ErrorKind;
    match err.kind() {
        ErrorKind::NotFound => FsError::NotFound,
        ErrorKind::AlreadyExists => FsError::Exists,
        ErrorKind::PermissionDenied => FsError::NoAccess,
        ErrorKind::InvalidInput => FsError::Invalid,
        ErrorKind::UnexpectedEof => FsError::Invalid,
        // Medium and filesystem-structure failures surface as InvalidData
        // (no filesystem) or pass through from the sector layer.
        ErrorKind::InvalidData | ErrorKind::Other => FsError::Corrupt,
        _ => FsError::Unknown,
    }
}

fn device_io_error(err: StorageError) -> io::Error {
    io::Error::other(format!("sector device: {err:?}"))
}

/// `std::io` view of a shared sector device, for the FAT library. Partial
/// sector writes read-modify-write the containing sector.
pub struct SectorStream {
    device: SharedDevice,
    pos: u64,
}

impl fmt::Debug for SectorStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SectorStream").field("pos", &self.pos).finish_non_exhaustive()
    }
}

impl SectorStream {
    /// Wrap a shared device.
    pub fn new(device: SharedDevice) -> SectorStream {
        SectorStream { device, pos: 0 }
    }

    fn len(&self) -> u64 {
        let dev = self.device.lock();
        u64::from(dev.sector_count()) * SECTOR_SIZE as u64
    }
}

impl Read for SectorStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let len = self.len();
        if self.pos >= len {
            return Ok(0);
        }
        let take = buf.len().min((len - self.pos) as usize);
        if take == 0 {
            return Ok(0);
        }
        let first = (self.pos / SECTOR_SIZE as u64) as u32;
        let offset = (self.pos % SECTOR_SIZE as u64) as usize;
        let sectors = (offset + take).div_ceil(SECTOR_SIZE);
        let mut tmp = vec![0u8; sectors * SECTOR_SIZE];
        self.device
            .lock()
            .read_sectors(first, &mut tmp)
            .map_err(device_io_error)?;
        buf[..take].copy_from_slice(&tmp[offset..offset + take]);
        self.pos += take as u64;
        Ok(take)
    }
}

impl Write for SectorStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let len = self.len();
        if self.pos >= len {
            return Err(io::Error::new(io::ErrorKind::WriteZero, "past end of device"));
        }
        let take = buf.len().min((len - self.pos) as usize);
        if take == 0 {
            return Ok(0);
        }
        let first = (self.pos / SECTOR_SIZE as u64) as u32;
        let offset = (self.pos % SECTOR_SIZE as u64) as usize;
        let sectors = (offset + take).div_ceil(SECTOR_SIZE);
        let mut tmp = vec![0u8; sectors * SECTOR_SIZE];
        let mut dev = self.device.lock();
        dev.read_sectors(first, &mut tmp).map_err(device_io_error)?;
        tmp[offset..offset + take].copy_from_slice(&buf[..take]);
        dev.write_sectors(first, &tmp).map_err(device_io_error)?;
        self.pos += take as u64;
        Ok(take)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Seek for SectorStream {
    fn seek(&mut self, from: SeekFrom) -> io::Result<u64> {
        let len = self.len();
        let next = match from {
            SeekFrom::Start(p) => Some(p),
            SeekFrom::End(d) => len.checked_add_signed(d),
            SeekFrom::Current(d) => self.pos.checked_add_signed(d),
        };
        match next {
            Some(p) => {
                self.pos = p;
                Ok(p)
            }
            None => Err(io::Error::new(io::ErrorKind::InvalidInput, "seek out of range")),
        }
    }
}

/// FAT timestamps from the shared clock.
///
/// Timestamps must never go backwards even while the clock is unseeded, so
/// the provider remembers the last second it handed out and clamps upward;
/// before the host seeds the clock, each call advances by one second.
#[derive(Clone, Debug)]
pub struct TimeKeeper {
    time: Arc<TimeBase>,
    last: Arc<AtomicU64>,
}

impl TimeKeeper {
    /// Create a provider over the shared clock.
    pub fn new(time: Arc<TimeBase>) -> TimeKeeper {
        TimeKeeper {
            time,
            last: Arc::new(AtomicU64::new(FAT_EPOCH)),
        }
    }

    fn current_secs(&self) -> u64 {
        let now = self.time.now();
        self.last
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |last| {
                Some(now.max(last + 1))
            })
            .map(|last| now.max(last + 1))
            .unwrap_or(now)
    }
}

impl fatfs::TimeProvider for TimeKeeper {
    fn get_current_date(&self) -> fatfs::Date {
        self.get_current_date_time().date
    }

    fn get_current_date_time(&self) -> fatfs::DateTime {
        let (y, mo, d, h, mi, s) = civil_from_epoch(self.current_secs());
        fatfs::DateTime {
            date: fatfs::Date {
                year: u16::min(y, 2099),
                month: mo.into(),
                day: d.into(),
            },
            time: fatfs::Time {
                hour: h.into(),
                min: mi.into(),
                sec: s.into(),
                millis: 0,
            },
        }
    }
}

/// Seconds from 1970 to the FAT timestamp epoch (1980-01-01).
const FAT_EPOCH: u64 = 315_532_800;

/// What a path refers to.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PathKind {
    /// A regular file.
    File,
    /// A directory.
    Dir,
}

/// One enumerated directory entry.
#[derive(Clone, Debug)]
pub struct EntryInfo {
    /// Long name.
    pub name: String,
    /// 8.3 short name.
    pub short_name: String,
    /// Size in bytes, zero for directories.
    pub size: u64,
    /// Raw FAT attribute bits.
    pub attr: u8,
    /// Whether the entry is a directory.
    pub is_dir: bool,
}

type FatFilesystem = fatfs::FileSystem<SectorStream>;

/// A mounted FAT volume.
///
/// Files are addressed by path on every call rather than held open, so the
/// volume object carries no borrow-tied state; the per-slot mutex in the
/// device manager serializes all access, which is also the locking the FAT
/// library requires.
pub struct Volume {
    fs: FatFilesystem,
    geometry: Geometry,
    device: SharedDevice,
    working_dir: String,
}

impl fmt::Debug for Volume {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Volume")
            .field("geometry", &self.geometry)
            .field("working_dir", &self.working_dir)
            .finish_non_exhaustive()
    }
}

impl Volume {
    /// Mount the filesystem on `device`. `working_dir` resolves relative
    /// paths, matching the mount-time directory change.
    pub fn mount(
        device: SharedDevice,
        time: TimeKeeper,
        working_dir: &str,
    ) -> Result<Volume, FsError> {
        let geometry = Geometry::read(&device).map_err(|_| FsError::Corrupt)?;
        let options = fatfs::FsOptions::new()
            .update_accessed_date(false)
            .time_provider(time);
        let fs = fatfs::FileSystem::new(SectorStream::new(Arc::clone(&device)), options)
            .map_err(|e| fs_error_from_io(&e))?;
        Ok(Volume {
            fs,
            geometry,
            device,
            working_dir: working_dir.trim_matches('/').to_owned(),
        })
    }

    /// Boot-sector geometry of the mounted volume.
    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    /// The sector device under the filesystem.
    pub fn device(&self) -> SharedDevice {
        Arc::clone(&self.device)
    }

    /// Resolve a path: absolute paths hang off the volume root, relative
    /// ones off the working directory. Trailing separators are dropped,
    /// callers pass directory paths both ways.
    fn resolve(&self, path: &str) -> String {
        let path = path.trim_end_matches('/');
        match path.strip_prefix('/') {
            Some(rooted) => rooted.to_owned(),
            None if self.working_dir.is_empty() => path.to_owned(),
            None => format!("{}/{}", self.working_dir, path),
        }
    }

    /// What `path` refers to, if it exists.
    pub fn kind_of(&self, path: &str) -> Result<PathKind, FsError> {
        let p = self.resolve(path);
        if p.is_empty() {
            return Ok(PathKind::Dir);
        }
        let root = self.fs.root_dir();
        if root.open_dir(&p).is_ok() {
            return Ok(PathKind::Dir);
        }
        match root.open_file(&p) {
            Ok(_) => Ok(PathKind::File),
            Err(e) => Err(fs_error_from_io(&e)),
        }
    }

    /// Size of the file at `path`.
    pub fn file_size(&self, path: &str) -> Result<u64, FsError> {
        let p = self.resolve(path);
        let mut file = self.fs.root_dir().open_file(&p).map_err(|e| fs_error_from_io(&e))?;
        file.seek(SeekFrom::End(0)).map_err(|e| fs_error_from_io(&e))
    }

    /// Read from `path` at byte `pos`; short reads report how much the
    /// file actually held.
    pub fn read_at(&self, path: &str, pos: u64, buf: &mut [u8]) -> Result<usize, FsError> {
        let p = self.resolve(path);
        let mut file = self.fs.root_dir().open_file(&p).map_err(|e| fs_error_from_io(&e))?;
        file.seek(SeekFrom::Start(pos)).map_err(|e| fs_error_from_io(&e))?;
        let mut done = 0;
        while done < buf.len() {
            match file.read(&mut buf[done..]) {
                Ok(0) => break,
                Ok(n) => done += n,
                Err(e) => return Err(fs_error_from_io(&e)),
            }
        }
        Ok(done)
    }

    /// Write to `path` at byte `pos`, extending the file as needed.
    pub fn write_at(&self, path: &str, pos: u64, data: &[u8]) -> Result<usize, FsError> {
        let p = self.resolve(path);
        let mut file = self.fs.root_dir().open_file(&p).map_err(|e| fs_error_from_io(&e))?;
        file.seek(SeekFrom::Start(pos)).map_err(|e| fs_error_from_io(&e))?;
        file.write_all(data).map_err(|e| fs_error_from_io(&e))?;
        file.flush().map_err(|e| fs_error_from_io(&e))?;
        Ok(data.len())
    }

    /// Truncate the file at `path` to zero bytes.
    pub fn truncate(&self, path: &str) -> Result<(), FsError> {
        let p = self.resolve(path);
        let mut file = self.fs.root_dir().open_file(&p).map_err(|e| fs_error_from_io(&e))?;
        file.truncate().map_err(|e| fs_error_from_io(&e))
    }

    /// Create a file that must not exist yet.
    pub fn create_file_new(&self, path: &str) -> Result<(), FsError> {
        let p = self.resolve(path);
        let root = self.fs.root_dir();
        if root.open_file(&p).is_ok() {
            return Err(FsError::Exists);
        }
        root.create_file(&p).map(|_| ()).map_err(|e| fs_error_from_io(&e))
    }

    /// Create or truncate a file.
    pub fn create_file_always(&self, path: &str) -> Result<(), FsError> {
        let p = self.resolve(path);
        let mut file = self.fs.root_dir().create_file(&p).map_err(|e| fs_error_from_io(&e))?;
        file.truncate().map_err(|e| fs_error_from_io(&e))
    }

    /// Create a directory.
    pub fn create_dir(&self, path: &str) -> Result<(), FsError> {
        let p = self.resolve(path);
        self.fs.root_dir().create_dir(&p).map(|_| ()).map_err(|e| fs_error_from_io(&e))
    }

    /// Remove a file or empty directory.
    pub fn remove(&self, path: &str) -> Result<(), FsError> {
        let p = self.resolve(path);
        self.fs.root_dir().remove(&p).map_err(|e| fs_error_from_io(&e))
    }

    /// Rename/move within the volume.
    pub fn rename(&self, old: &str, new: &str) -> Result<(), FsError> {
        let po = self.resolve(old);
        let pn = self.resolve(new);
        let root = self.fs.root_dir();
        root.rename(&po, &root, &pn).map_err(|e| fs_error_from_io(&e))
    }

    /// Enumerate a directory.
    pub fn read_dir(&self, path: &str) -> Result<Vec<EntryInfo>, FsError> {
        let p = self.resolve(path);
        let root = self.fs.root_dir();
        let dir = if p.is_empty() {
            root
        } else {
            root.open_dir(&p).map_err(|e| fs_error_from_io(&e))?
        };
        let mut out = Vec::new();
        for entry in dir.iter() {
            let entry = entry.map_err(|e| fs_error_from_io(&e))?;
            let name = entry.file_name();
            if name == "." || name == ".." {
                continue;
            }
            out.push(EntryInfo {
                short_name: String::from_utf8_lossy(entry.short_file_name_as_bytes()).into_owned(),
                size: entry.len(),
                attr: entry.attributes().bits(),
                is_dir: entry.is_dir(),
                name,
            });
        }
        Ok(out)
    }

    /// Locate `path` in the raw directory structure and return its first
    /// cluster and size. Only 8.3 names resolve here; the callers that
    /// need this (disc images, patch sources) use short names by
    /// convention.
    pub fn locate(&self, path: &str) -> Result<RawEntry, FsError> {
        let p = self.resolve(path);
        lookup_path(&self.device, &self.geometry, &p).ok_or(FsError::NotFound)
    }
}

/// FAT flavor of a volume.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FatKind {
    /// 16-bit FAT entries.
    Fat16,
    /// 32-bit FAT entries.
    Fat32,
}

/// Fixed layout facts parsed from the boot sector, enough to walk cluster
/// chains without the FAT library.
#[derive(Clone, Copy, Debug)]
pub struct Geometry {
    /// FAT flavor.
    pub kind: FatKind,
    /// Sectors per cluster.
    pub sectors_per_cluster: u32,
    /// First sector of the first FAT.
    pub fat_start: u32,
    /// First sector of the fixed root directory region (FAT16).
    pub root_dir_start: u32,
    /// Number of 32-byte entries in the fixed root directory (FAT16).
    pub root_dir_entries: u32,
    /// Root directory cluster (FAT32).
    pub root_cluster: u32,
    /// First sector of the data region.
    pub data_start: u32,
}

impl Geometry {
    /// Parse the boot sector of `device`.
    pub fn read(device: &SharedDevice) -> Result<Geometry, StorageError> {
        let mut sector = [0u8; SECTOR_SIZE];
        device.lock().read_sectors(0, &mut sector)?;
        Geometry::parse(&sector).ok_or(StorageError::Device)
    }

    /// Parse a boot sector.
    pub fn parse(sector: &[u8; SECTOR_SIZE]) -> Option<Geometry> {
        let u16_at = |o: usize| u16::from_le_bytes([sector[o], sector[o + 1]]);
        let u32_at =
            |o: usize| u32::from_le_bytes([sector[o], sector[o + 1], sector[o + 2], sector[o + 3]]);

        if u16_at(510) != 0xAA55 || u16_at(11) as usize != SECTOR_SIZE {
            return None;
        }
        let sectors_per_cluster = u32::from(sector[13]);
        if sectors_per_cluster == 0 || !sectors_per_cluster.is_power_of_two() {
            return None;
        }
        let reserved = u32::from(u16_at(14));
        let num_fats = u32::from(sector[16]);
        let root_dir_entries = u32::from(u16_at(17));
        let fat_size16 = u32::from(u16_at(22));
        let (kind, fat_size, root_cluster) = if root_dir_entries == 0 {
            (FatKind::Fat32, u32_at(36), u32_at(44))
        } else {
            (FatKind::Fat16, fat_size16, 0)
        };
        if fat_size == 0 || num_fats == 0 {
            return None;
        }
        let root_dir_start = reserved + num_fats * fat_size;
        let root_dir_sectors = root_dir_entries.div_ceil(SECTOR_SIZE as u32 / 32);
        Some(Geometry {
            kind,
            sectors_per_cluster,
            fat_start: reserved,
            root_dir_start,
            root_dir_entries,
            root_cluster,
            data_start: root_dir_start + root_dir_sectors,
        })
    }

    /// Bytes per cluster.
    pub fn cluster_bytes(&self) -> u32 {
        self.sectors_per_cluster * SECTOR_SIZE as u32
    }

    /// First sector of a data cluster.
    pub fn cluster_sector(&self, cluster: u32) -> u32 {
        self.data_start + (cluster - 2) * self.sectors_per_cluster
    }

    /// Read the FAT entry for `cluster`, i.e. the next cluster in its
    /// chain, or `None` at end of chain or on a free/damaged entry.
    pub fn next_cluster(&self, device: &SharedDevice, cluster: u32) -> Option<u32> {
        let mut sector = [0u8; SECTOR_SIZE];
        match self.kind {
            FatKind::Fat16 => {
                let byte = cluster * 2;
                device
                    .lock()
                    .read_sectors(self.fat_start + byte / SECTOR_SIZE as u32, &mut sector)
                    .ok()?;
                let o = (byte % SECTOR_SIZE as u32) as usize;
                let next = u32::from(u16::from_le_bytes([sector[o], sector[o + 1]]));
                (0x0002..0xFFF8).contains(&next).then_some(next)
            }
            FatKind::Fat32 => {
                let byte = cluster * 4;
                device
                    .lock()
                    .read_sectors(self.fat_start + byte / SECTOR_SIZE as u32, &mut sector)
                    .ok()?;
                let o = (byte % SECTOR_SIZE as u32) as usize;
                let next = u32::from_le_bytes([sector[o], sector[o + 1], sector[o + 2], sector[o + 3]])
                    & 0x0FFF_FFFF;
                (0x0000_0002..0x0FFF_FFF8).contains(&next).then_some(next)
            }
        }
    }
}

/// Raw directory entry facts needed to construct a [`ClusterFile`].
#[derive(Clone, Copy, Debug)]
pub struct RawEntry {
    /// First data cluster.
    pub start_cluster: u32,
    /// File size in bytes.
    pub size: u32,
    /// Directory flag.
    pub is_dir: bool,
}

fn short_name_of(entry: &[u8]) -> String {
    let name = std::str::from_utf8(&entry[0..8]).unwrap_or("").trim_end();
    let ext = std::str::from_utf8(&entry[8..11]).unwrap_or("").trim_end();
    if ext.is_empty() {
        name.to_owned()
    } else {
        format!("{name}.{ext}")
    }
}

fn scan_dir_sector(sector: &[u8], component: &str) -> Option<Option<RawEntry>> {
    for entry in sector.chunks_exact(32) {
        match entry[0] {
            0x00 => return Some(None),
            0xE5 => continue,
            _ => {}
        }
        let attr = entry[11];
        if attr & 0x0F == 0x0F || attr & 0x08 != 0 {
            continue;
        }
        if short_name_of(entry).eq_ignore_ascii_case(component) {
            let cluster = u32::from(u16::from_le_bytes([entry[26], entry[27]]))
                | u32::from(u16::from_le_bytes([entry[20], entry[21]])) << 16;
            let size = u32::from_le_bytes([entry[28], entry[29], entry[30], entry[31]]);
            return Some(Some(RawEntry {
                start_cluster: cluster,
                size,
                is_dir: attr & 0x10 != 0,
            }));
        }
    }
    None
}

/// Resolve `path` (8.3 components, `/`-separated, no drive prefix) to its
/// raw directory entry.
pub fn lookup_path(device: &SharedDevice, geometry: &Geometry, path: &str) -> Option<RawEntry> {
    let mut current: Option<RawEntry> = None;

    for component in path.split('/').filter(|c| !c.is_empty()) {
        let mut found = None;

        match current {
            // Root directory.
            None => match geometry.kind {
                FatKind::Fat16 => {
                    let sectors = geometry.root_dir_entries.div_ceil(SECTOR_SIZE as u32 / 32);
                    let mut sector = [0u8; SECTOR_SIZE];
                    for s in 0..sectors {
                        device
                            .lock()
                            .read_sectors(geometry.root_dir_start + s, &mut sector)
                            .ok()?;
                        if let Some(hit) = scan_dir_sector(&sector, component) {
                            found = hit;
                            break;
                        }
                    }
                }
                FatKind::Fat32 => {
                    found = scan_dir_chain(device, geometry, geometry.root_cluster, component)?;
                }
            },
            Some(dir) if dir.is_dir => {
                found = scan_dir_chain(device, geometry, dir.start_cluster, component)?;
            }
            // A file in the middle of a path.
            Some(_) => return None,
        }

        current = Some(found?);
    }

    current
}

#[allow(clippy::unnecessary_wraps)]
fn scan_dir_chain(
    device: &SharedDevice,
    geometry: &Geometry,
    start: u32,
    component: &str,
) -> Option<Option<RawEntry>> {
    let mut cluster = start;
    let mut sector = [0u8; SECTOR_SIZE];
    loop {
        for s in 0..geometry.sectors_per_cluster {
            if device
                .lock()
                .read_sectors(geometry.cluster_sector(cluster) + s, &mut sector)
                .is_err()
            {
                return Some(None);
            }
            if let Some(hit) = scan_dir_sector(&sector, component) {
                return Some(hit);
            }
        }
        match geometry.next_cluster(device, cluster) {
            Some(next) => cluster = next,
            None => return Some(None),
        }
    }
}

/// A read-only file reconstructed from raw FAT facts: a start cluster, an
/// optional cluster hint, and the geometry. No directory entry or path is
/// involved, which is exactly what the disc-patch table requires.
pub struct ClusterFile {
    device: SharedDevice,
    geometry: Geometry,
    start_cluster: u32,
    /// (cluster index within the file, cluster number): where the last
    /// walk ended, so sequential reads don't rewalk the chain.
    hint: Option<(u32, u32)>,
    /// Prebuilt chain for constant-time seeks, when the caller paid for
    /// one.
    map: Option<Vec<u32>>,
}

impl fmt::Debug for ClusterFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterFile")
            .field("start_cluster", &self.start_cluster)
            .field("mapped", &self.map.is_some())
            .finish_non_exhaustive()
    }
}

impl ClusterFile {
    /// Open a cluster chain without a map; seeks walk the chain from the
    /// hint or the start.
    pub fn new(device: SharedDevice, geometry: Geometry, start_cluster: u32) -> ClusterFile {
        ClusterFile {
            device,
            geometry,
            start_cluster,
            hint: None,
            map: None,
        }
    }

    /// Seed the walk hint: `cluster` is the chain member covering the
    /// cluster index that contains `byte_offset`.
    pub fn with_hint(mut self, byte_offset: u32, cluster: u32) -> ClusterFile {
        if cluster >= 2 {
            self.hint = Some((byte_offset / self.geometry.cluster_bytes(), cluster));
        }
        self
    }

    /// Walk the whole chain once and keep it, making every later seek
    /// O(1). Used by the virtual disc, whose reads jump backwards freely.
    pub fn build_map(&mut self) {
        let mut map = Vec::new();
        let mut cluster = self.start_cluster;
        loop {
            map.push(cluster);
            match self.geometry.next_cluster(&self.device, cluster) {
                Some(next) => cluster = next,
                None => break,
            }
        }
        self.map = Some(map);
    }

    /// Number of clusters in the prebuilt map.
    pub fn mapped_clusters(&self) -> Option<usize> {
        self.map.as_ref().map(Vec::len)
    }

    fn cluster_at(&mut self, index: u32) -> Option<u32> {
        if let Some(map) = &self.map {
            return map.get(index as usize).copied();
        }
        let (mut at, mut cluster) = match self.hint {
            Some((hi, hc)) if hi <= index => (hi, hc),
            _ => (0, self.start_cluster),
        };
        while at < index {
            cluster = self.geometry.next_cluster(&self.device, cluster)?;
            at += 1;
        }
        self.hint = Some((index, cluster));
        Some(cluster)
    }

    /// Read `buf.len()` bytes at `offset` within the file. Returns the
    /// byte count actually read; the count falls short when the chain
    /// ends first.
    pub fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize, StorageError> {
        let cbytes = u64::from(self.geometry.cluster_bytes());
        let mut done = 0usize;
        while done < buf.len() {
            let pos = offset + done as u64;
            let index = (pos / cbytes) as u32;
            let within = (pos % cbytes) as usize;
            let Some(cluster) = self.cluster_at(index) else {
                warn!("cluster chain ended at index {index}");
                break;
            };
            let take = buf.len() - done;
            let take = take.min(cbytes as usize - within);

            // Whole-sector transfer covering the requested span.
            let first_sector =
                self.geometry.cluster_sector(cluster) + (within / SECTOR_SIZE) as u32;
            let head = within % SECTOR_SIZE;
            let sectors = (head + take).div_ceil(SECTOR_SIZE);
            let mut tmp = vec![0u8; sectors * SECTOR_SIZE];
            self.device.lock().read_sectors(first_sector, &mut tmp)?;
            buf[done..done + take].copy_from_slice(&tmp[head..head + take]);
            done += take;
        }
        Ok(done)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::storage::MemoryDevice;
    use crate::storage::share;
    use crate::time::tests::FakeTicks;

    pub(crate) fn keeper() -> TimeKeeper {
        TimeKeeper::new(TimeBase::new(Arc::new(FakeTicks::default())))
    }

    /// A formatted 16 MiB FAT16 volume.
    pub(crate) fn formatted_device() -> SharedDevice {
        let mut image = vec![0u8; 16 * 1024 * 1024];
        fatfs::format_volume(
            &mut std::io::Cursor::new(&mut image),
            fatfs::FormatVolumeOptions::new().fat_type(fatfs::FatType::Fat16),
        )
        .unwrap();
        share(MemoryDevice::new(image))
    }

    pub(crate) fn mounted() -> Volume {
        Volume::mount(formatted_device(), keeper(), "").unwrap()
    }

    #[test]
    fn sector_stream_read_modify_write() {
        let dev = share(MemoryDevice::zeroed(8));
        let mut stream = SectorStream::new(Arc::clone(&dev));
        stream.seek(SeekFrom::Start(500)).unwrap();
        stream.write_all(&[0xAA; 100]).unwrap();
        stream.seek(SeekFrom::Start(498)).unwrap();
        let mut buf = [0u8; 104];
        stream.read_exact(&mut buf).unwrap();
        assert_eq!(buf[0], 0);
        assert_eq!(buf[1], 0);
        assert_eq!(&buf[2..102], &[0xAA; 100]);
        assert_eq!(buf[102], 0);
    }

    #[test]
    fn volume_file_round_trip() {
        let vol = mounted();
        vol.create_file_new("/save.bin").unwrap();
        assert_eq!(vol.create_file_new("/save.bin"), Err(FsError::Exists));
        vol.write_at("/save.bin", 0, b"hello fat world").unwrap();
        let mut buf = [0u8; 15];
        assert_eq!(vol.read_at("/save.bin", 0, &mut buf), Ok(15));
        assert_eq!(&buf, b"hello fat world");
        assert_eq!(vol.file_size("/save.bin"), Ok(15));
        assert_eq!(vol.kind_of("/save.bin"), Ok(PathKind::File));
    }

    #[test]
    fn volume_errors_map_to_taxonomy() {
        let vol = mounted();
        assert_eq!(vol.file_size("/missing.bin"), Err(FsError::NotFound));
        assert_eq!(vol.remove("/missing.bin"), Err(FsError::NotFound));
        vol.create_dir("/d").unwrap();
        assert_eq!(vol.create_dir("/d"), Err(FsError::Exists));
    }

    #[test]
    fn working_dir_resolves_relative_paths() {
        let dev = formatted_device();
        let vol = Volume::mount(Arc::clone(&dev), keeper(), "").unwrap();
        vol.create_dir("/saoirse").unwrap();
        vol.create_file_new("/saoirse/note.txt").unwrap();
        vol.write_at("/saoirse/note.txt", 0, b"hi").unwrap();
        drop(vol);

        let vol = Volume::mount(dev, keeper(), "saoirse").unwrap();
        let mut buf = [0u8; 2];
        assert_eq!(vol.read_at("note.txt", 0, &mut buf), Ok(2));
        assert_eq!(&buf, b"hi");
        // Absolute paths ignore the working directory.
        assert_eq!(vol.kind_of("/saoirse"), Ok(PathKind::Dir));
    }

    #[test]
    fn raw_lookup_and_cluster_read_match_library() {
        let vol = mounted();
        vol.create_dir("/saoirse").unwrap();
        vol.create_file_new("/saoirse/disc.bin").unwrap();
        // Spans several clusters so the chain walk is exercised.
        let payload: Vec<u8> = (0u32..200_000).map(|i| (i * 31 % 251) as u8).collect();
        vol.write_at("/saoirse/disc.bin", 0, &payload).unwrap();

        let raw = vol.locate("/saoirse/disc.bin").unwrap();
        assert!(!raw.is_dir);
        assert_eq!(raw.size as usize, payload.len());

        let mut file = ClusterFile::new(vol.device(), vol.geometry(), raw.start_cluster);
        let mut buf = vec![0u8; 4096];
        // Unaligned offset crossing cluster boundaries.
        file.read_at(1234, &mut buf).unwrap();
        assert_eq!(&buf[..], &payload[1234..1234 + 4096]);

        // Backwards seek through the map.
        file.build_map();
        file.read_at(7, &mut buf[..16]).unwrap();
        assert_eq!(&buf[..16], &payload[7..23]);
    }

    #[test]
    fn cluster_hint_accelerated_read() {
        let vol = mounted();
        vol.create_file_new("/big.bin").unwrap();
        let payload: Vec<u8> = (0u32..100_000).map(|i| (i % 256) as u8).collect();
        vol.write_at("/big.bin", 0, &payload).unwrap();
        let raw = vol.locate("/big.bin").unwrap();

        let geometry = vol.geometry();
        let cbytes = geometry.cluster_bytes();
        // Find the cluster that holds byte offset cbytes*2 by walking.
        let mut plain = ClusterFile::new(vol.device(), geometry, raw.start_cluster);
        let hint_cluster = {
            let mut c = raw.start_cluster;
            for _ in 0..2 {
                c = geometry.next_cluster(&vol.device(), c).unwrap();
            }
            c
        };
        let mut hinted = ClusterFile::new(vol.device(), geometry, raw.start_cluster)
            .with_hint(cbytes * 2, hint_cluster);

        let at = u64::from(cbytes) * 2 + 100;
        let mut a = vec![0u8; 512];
        let mut b = vec![0u8; 512];
        plain.read_at(at, &mut a).unwrap();
        hinted.read_at(at, &mut b).unwrap();
        assert_eq!(a, b);
        assert_eq!(&a[..], &payload[at as usize..at as usize + 512]);
    }

    #[test]
    fn timestamps_never_regress() {
        use fatfs::TimeProvider;
        let tk = keeper();
        let a = tk.get_current_date_time();
        let b = tk.get_current_date_time();
        let to_tuple = |dt: fatfs::DateTime| {
            (dt.date.year, dt.date.month, dt.date.day, dt.time.hour, dt.time.min, dt.time.sec)
        };
        assert!(to_tuple(b) > to_tuple(a));
    }
}
