//! Storage device manager.
//!
//! One background thread owns all mount state: every 64 ms it polls
//! physical presence on each slot and walks the per-slot lifecycle
//! (not-inserted → inserted → mounted → unmounted), mounting FAT volumes,
//! recovering from errors on eject and reporting hot-plug events to the
//! host channel. Everything else in the process reads mount state through
//! accessors and borrows volumes under the manager's lock, which also
//! serializes all FAT-library access.

use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::info;
use log::warn;
use num_enum::TryFromPrimitive;
use parking_lot::Mutex;

use crate::channel::IpcLog;
use crate::config::Config;
use crate::error::FsError;
use crate::queue::Queue;
use crate::queue::Timer;
use crate::storage::SharedDevice;
use crate::storage::StorageError;
use crate::storage::fat::Geometry;
use crate::storage::fat::PathKind;
use crate::storage::fat::TimeKeeper;
use crate::storage::fat::Volume;
use crate::time::TimeBase;

/// Polling period of the presence scan.
pub const POLL_INTERVAL: Duration = Duration::from_millis(64);

/// Directory expected at the root of every usable volume.
pub const MOUNT_DIR: &str = "saoirse";

/// Log file written on the designated drive.
pub const LOG_PATH: &str = "/log.txt";

/// Logical drive numbers. The numbering is shared with the host: it is
/// what a disc patch's drive field and the hot-plug events carry.
#[derive(Clone, Copy, Debug, Eq, PartialEq, TryFromPrimitive)]
#[repr(u32)]
pub enum Drive {
    /// The front SD slot, also the log-file sink.
    Sd = 0,
    /// External USB mass storage.
    Usb = 1,
}

/// Number of device slots.
pub const DRIVE_COUNT: usize = 2;

impl Drive {
    fn index(self) -> usize {
        self as usize
    }

    fn all() -> [Drive; DRIVE_COUNT] {
        [Drive::Sd, Drive::Usb]
    }
}

/// Physical medium behind one slot: a presence poll plus the bring-up
/// that yields a sector device.
pub trait MediaSource: Send {
    /// Poll whether a medium is physically present.
    fn poll_present(&mut self) -> bool;

    /// Initialize the medium and hand out its sector device.
    fn open(&mut self) -> Result<SharedDevice, StorageError>;
}

struct Slot {
    source: Option<Box<dyn MediaSource>>,
    volume: Option<Volume>,
    inserted: bool,
    error: bool,
    mounted: bool,
    /// Bumped on every unmount; stale file handles compare against it.
    generation: u64,
}

impl Slot {
    fn new() -> Slot {
        Slot {
            source: None,
            volume: None,
            inserted: false,
            error: false,
            mounted: false,
            generation: 0,
        }
    }
}

#[derive(Debug, Default)]
struct LogFile {
    enabled: bool,
    pos: u64,
}

enum Event {
    Inserted(Drive),
    Removed(Drive),
}

/// The mount-state owner.
pub struct DeviceManager {
    slots: Mutex<[Slot; DRIVE_COUNT]>,
    log_file: Mutex<LogFile>,
    ticks: Queue<()>,
    time: Arc<TimeBase>,
    config: Config,
    events: Mutex<Option<Arc<IpcLog>>>,
}

impl fmt::Debug for DeviceManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceManager").finish_non_exhaustive()
    }
}

impl DeviceManager {
    /// Drive that receives the log file.
    pub const LOG_DRIVE: Drive = Drive::Sd;

    /// Create a manager with no attached media.
    pub fn new(config: Config, time: Arc<TimeBase>) -> Arc<DeviceManager> {
        Arc::new(DeviceManager {
            slots: Mutex::new([Slot::new(), Slot::new()]),
            log_file: Mutex::new(LogFile::default()),
            ticks: Queue::new(1),
            time,
            config,
            events: Mutex::new(None),
        })
    }

    /// Attach the physical medium behind a slot.
    pub fn attach(&self, drive: Drive, source: Box<dyn MediaSource>) {
        self.slots.lock()[drive.index()].source = Some(source);
    }

    /// Route hot-plug events to the host channel.
    pub fn set_event_sink(&self, channel: Arc<IpcLog>) {
        *self.events.lock() = Some(channel);
    }

    /// Wake the polling thread early, e.g. after an I/O error.
    pub fn force_update(&self) {
        let _ = self.ticks.try_send(());
    }

    /// Mark a slot bad until its medium is removed.
    pub fn set_error(&self, drive: Drive) {
        self.slots.lock()[drive.index()].error = true;
        self.force_update();
    }

    /// Whether a usable medium is present.
    pub fn is_inserted(&self, drive: Drive) -> bool {
        let slots = self.slots.lock();
        let slot = &slots[drive.index()];
        slot.inserted && !slot.error
    }

    /// Whether the slot's volume is mounted.
    pub fn is_mounted(&self, drive: Drive) -> bool {
        let slots = self.slots.lock();
        let slot = &slots[drive.index()];
        slot.inserted && !slot.error && slot.mounted
    }

    /// Unmount epoch of a slot; a file handle opened under an older epoch
    /// is dead.
    pub fn generation(&self, drive: Drive) -> u64 {
        self.slots.lock()[drive.index()].generation
    }

    /// Run `f` against the mounted volume of `drive`.
    pub fn with_volume<T>(
        &self,
        drive: Drive,
        f: impl FnOnce(&Volume) -> Result<T, FsError>,
    ) -> Result<T, FsError> {
        let slots = self.slots.lock();
        let slot = &slots[drive.index()];
        if !slot.mounted || slot.error {
            return Err(FsError::NotReady);
        }
        match &slot.volume {
            Some(volume) => f(volume),
            None => Err(FsError::NotReady),
        }
    }

    /// Raw device and geometry of a mounted volume, for the cluster
    /// layer. The device carries its own lock, so the caller does not
    /// hold the manager's.
    pub fn cluster_source(&self, drive: Drive) -> Option<(SharedDevice, Geometry)> {
        let slots = self.slots.lock();
        let slot = &slots[drive.index()];
        if !slot.mounted || slot.error {
            return None;
        }
        slot.volume.as_ref().map(|v| (v.device(), v.geometry()))
    }

    /// Append one line to the log file, if it is open. Must never log
    /// itself: this sits under the global logger.
    pub fn write_log(&self, line: &str) {
        let Some(mut log_file) = self.log_file.try_lock() else {
            return;
        };
        if !log_file.enabled {
            return;
        }
        let Some(slots) = self.slots.try_lock() else {
            return;
        };
        let slot = &slots[Self::LOG_DRIVE.index()];
        let Some(volume) = slot.volume.as_ref().filter(|_| slot.mounted) else {
            return;
        };
        let pos = log_file.pos;
        if let Ok(n) = volume.write_at(LOG_PATH, pos, line.as_bytes()) {
            let _ = volume.write_at(LOG_PATH, pos + n as u64, b"\n");
            log_file.pos = pos + n as u64 + 1;
        }
    }

    fn open_log_file(&self, volume: &Volume) {
        if volume.create_file_always(LOG_PATH).is_ok() {
            let mut log_file = self.log_file.lock();
            log_file.enabled = true;
            log_file.pos = 0;
            info!("log file opened");
        }
    }

    fn update_slot(&self, drive: Drive, events: &mut Vec<Event>) {
        let mut slots = self.slots.lock();
        let slot = &mut slots[drive.index()];

        slot.inserted = match slot.source.as_mut() {
            Some(source) => source.poll_present(),
            None => false,
        };

        // An eject clears a sticky error so reinsertion can retry.
        if !slot.inserted {
            slot.error = false;
        }

        if !slot.inserted && slot.mounted {
            info!("unmount device {}", drive as u32);
            if drive == Self::LOG_DRIVE {
                self.log_file.lock().enabled = false;
            }
            slot.error = true;
            slot.mounted = false;
            slot.volume = None;
            slot.generation += 1;
            slot.error = false;
            events.push(Event::Removed(drive));
        }

        if slot.inserted && !slot.mounted && !slot.error {
            info!("mount device {}", drive as u32);
            slot.error = true;

            let Some(source) = slot.source.as_mut() else {
                return;
            };
            let device = match source.open() {
                Ok(device) => device,
                Err(e) => {
                    warn!("device {} bring-up failed: {e:?}", drive as u32);
                    return;
                }
            };
            let volume = match Volume::mount(
                device,
                TimeKeeper::new(Arc::clone(&self.time)),
                MOUNT_DIR,
            ) {
                Ok(volume) => volume,
                Err(e) => {
                    warn!("failed to mount device {}: {e}", drive as u32);
                    return;
                }
            };
            // The working directory must exist, or the medium is not ours.
            match volume.kind_of(&format!("/{MOUNT_DIR}")) {
                Ok(PathKind::Dir) => {}
                _ => {
                    warn!("device {} has no {MOUNT_DIR} directory", drive as u32);
                    return;
                }
            }

            if drive == Self::LOG_DRIVE && self.config.file_log {
                self.open_log_file(&volume);
            }
            slot.volume = Some(volume);
            slot.mounted = true;
            slot.error = false;
            events.push(Event::Inserted(drive));
            info!("device {} mounted", drive as u32);
        }
    }

    /// One poll pass over every slot.
    pub fn poll_once(&self) {
        let mut events = Vec::new();
        for drive in Drive::all() {
            self.update_slot(drive, &mut events);
        }
        // Events go out after the state lock is dropped; the channel
        // blocks on the host's poll cadence.
        let sink = self.events.lock().clone();
        if let Some(channel) = sink {
            for event in events {
                match event {
                    Event::Inserted(d) => channel.notify_device_insert(d as u8),
                    Event::Removed(d) => channel.notify_device_remove(d as u8),
                }
            }
        }
    }

    /// Start the 64 ms polling thread.
    pub fn spawn(self: &Arc<Self>) -> thread::JoinHandle<()> {
        let mgr = Arc::clone(self);
        let _timer = Timer::repeating(POLL_INTERVAL, mgr.ticks.clone());
        thread::Builder::new()
            .name("devmgr".into())
            .spawn(move || {
                // Timer lives as long as the thread.
                let _hold = _timer;
                loop {
                    mgr.ticks.receive();
                    mgr.poll_once();
                }
            })
            .expect("spawn device manager thread")
    }
}
