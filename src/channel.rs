//! Host notification channel.
//!
//! One registered path carries everything the host hears from us: log
//! lines, readiness notices, storage hot-plug events and the channel
//! shutdown. The host parks a single long-poll ioctl here; its reply code
//! says which kind of payload was written into its buffer. Because the
//! park queue holds exactly one request, the emulator naturally
//! back-pressures instead of producing events faster than the host drains
//! them. The same path also accepts the "start game" rendezvous and the
//! clock seed.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;

use log::error;
use num_enum::TryFromPrimitive;
use zerocopy::FromBytes;

use crate::abi::SetTimeArgs;
use crate::error::IosError;
use crate::ipc::Request;
use crate::ipc::RequestBody;
use crate::queue::Queue;
use crate::resource::Resource;
use crate::time::TimeBase;
use crate::util::word_copy;

/// The channel's registered path.
pub const DEVICE_PATH: &str = "/dev/saoirse";

/// Payload size of the parked long-poll buffer.
pub const PRINT_SIZE: usize = 256;

/// Ioctls accepted on the channel.
#[derive(Clone, Copy, Debug, Eq, PartialEq, TryFromPrimitive)]
#[repr(u32)]
pub enum LogIoctl {
    /// Park a long-poll; replied when the emulator has something to say.
    RegisterPrintHook = 0,
    /// Release the bootstrap's start-game rendezvous.
    StartGameEvent = 1,
    /// Seed the shared clock.
    SetTime = 2,
}

/// Reply codes of the parked long-poll.
#[derive(Clone, Copy, Debug, Eq, PartialEq, TryFromPrimitive)]
#[repr(i32)]
pub enum LogReply {
    /// Channel is shutting down.
    Close = 0,
    /// The buffer holds a log line.
    Print = 1,
    /// A resource finished starting.
    Notice = 2,
    /// The buffer's first byte is the drive that appeared.
    DevInsert = 3,
    /// The buffer's first byte is the drive that vanished.
    DevRemove = 4,
}

/// Shared state of the notification channel.
pub struct IpcLog {
    /// The single parked host request; capacity 1 is the back-pressure.
    parked: Queue<Request>,
    start: Queue<()>,
    enabled: AtomicBool,
    /// Nothing can be delivered before the host has opened the channel;
    /// emissions before that are dropped instead of parked against a
    /// poll that does not exist yet.
    opened: AtomicBool,
    time: Arc<TimeBase>,
}

impl std::fmt::Debug for IpcLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IpcLog")
            .field("enabled", &self.is_enabled())
            .finish_non_exhaustive()
    }
}

impl IpcLog {
    /// Create the channel.
    pub fn new(time: Arc<TimeBase>) -> Arc<IpcLog> {
        Arc::new(IpcLog {
            parked: Queue::new(1),
            start: Queue::new(1),
            enabled: AtomicBool::new(true),
            opened: AtomicBool::new(false),
            time,
        })
    }

    /// Whether the host still listens; gates all event production.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    fn is_open(&self) -> bool {
        self.opened.load(Ordering::Acquire)
    }

    fn emit(&self, kind: LogReply, payload: &[u8]) {
        if !self.is_enabled() || !self.is_open() {
            return;
        }
        let mut req = self.parked.receive();
        if let Some(out) = req.ioctl_output() {
            let n = payload.len().min(out.len());
            word_copy(&mut out[..n], &payload[..n]);
        }
        req.reply(kind as i32);
    }

    /// Deliver one log line to the host, blocking until it polls.
    pub fn print(&self, line: &str) {
        let mut buf = [0u8; PRINT_SIZE];
        let n = line.len().min(PRINT_SIZE - 1);
        buf[..n].copy_from_slice(&line.as_bytes()[..n]);
        self.emit(LogReply::Print, &buf);
    }

    /// Tell the host another resource finished starting up.
    pub fn notify(&self) {
        self.emit(LogReply::Notice, &[]);
    }

    /// Report a storage device appearing.
    pub fn notify_device_insert(&self, id: u8) {
        self.emit(LogReply::DevInsert, &[id]);
    }

    /// Report a storage device vanishing.
    pub fn notify_device_remove(&self, id: u8) {
        self.emit(LogReply::DevRemove, &[id]);
    }

    /// Block until the host requests the game start.
    pub fn wait_for_start(&self) {
        self.start.receive();
    }
}

/// The channel's resource-manager face. Overrides raw dispatch because the
/// long-poll must be parked, not answered.
#[derive(Debug)]
pub struct IpcLogService {
    channel: Arc<IpcLog>,
}

impl IpcLogService {
    /// Wrap the shared channel.
    pub fn new(channel: Arc<IpcLog>) -> IpcLogService {
        IpcLogService { channel }
    }
}

impl Resource for IpcLogService {
    fn handle_request(&mut self, req: Request) {
        match &req.body {
            RequestBody::Open { path, .. } => {
                let found = path == DEVICE_PATH && self.channel.is_enabled();
                if found {
                    self.channel.opened.store(true, Ordering::Release);
                    req.reply(0);
                } else {
                    req.reply_error(IosError::NotFound);
                }
            }

            RequestBody::Close => {
                // Gate off new emissions, give in-flight ones a moment to
                // land in the park queue, then drain the poll so the host
                // side unblocks. The drain is opportunistic: a host may
                // close without a poll parked, and a blocking wait here
                // would then never return.
                self.channel.enabled.store(false, Ordering::Release);
                thread::sleep(Duration::from_millis(10));
                if let Some(parked) = self.channel.parked.try_receive() {
                    parked.reply(LogReply::Close as i32);
                }
                req.reply(0);
            }

            RequestBody::Ioctl { cmd, input, output } => {
                match LogIoctl::try_from(*cmd) {
                    Ok(LogIoctl::RegisterPrintHook) => {
                        if output.len() != PRINT_SIZE {
                            req.reply_error(IosError::Invalid);
                            return;
                        }
                        if let Err(extra) = self.channel.parked.try_send(req) {
                            error!("second print hook while one is parked");
                            extra.reply_error(IosError::Invalid);
                        }
                    }
                    Ok(LogIoctl::StartGameEvent) => {
                        let _ = self.channel.start.try_send(());
                        req.reply(0);
                    }
                    Ok(LogIoctl::SetTime) => match SetTimeArgs::read_from_bytes(input) {
                        Ok(args) => {
                            self.channel.time.set(args.tick.get(), args.epoch.get());
                            req.reply(0);
                        }
                        Err(_) => req.reply_error(IosError::Invalid),
                    },
                    Err(_) => req.reply_error(IosError::Invalid),
                }
            }

            _ => req.reply_error(IosError::Invalid),
        }
    }
}

/// `log` facade sink that mirrors every record to the host channel.
///
/// Install with [`log::set_boxed_logger`] at bootstrap. Lines are dropped
/// while the channel is closed; while it is open, emission blocks on the
/// host's poll cadence, which is the intended flow control.
pub struct ChannelLogger {
    channel: Arc<IpcLog>,
    devices: parking_lot::Mutex<Option<Arc<crate::storage::devmgr::DeviceManager>>>,
}

impl std::fmt::Debug for ChannelLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelLogger").finish_non_exhaustive()
    }
}

impl ChannelLogger {
    /// Create a sink for `channel`.
    pub fn new(channel: Arc<IpcLog>) -> ChannelLogger {
        ChannelLogger {
            channel,
            devices: parking_lot::Mutex::new(None),
        }
    }

    /// Also append records to the device manager's log file.
    pub fn with_file_sink(self, devices: Arc<crate::storage::devmgr::DeviceManager>) -> ChannelLogger {
        *self.devices.lock() = Some(devices);
        self
    }
}

impl log::Log for ChannelLogger {
    fn enabled(&self, _metadata: &log::Metadata<'_>) -> bool {
        self.channel.is_enabled()
    }

    fn log(&self, record: &log::Record<'_>) {
        let line = format!("[{} {}] {}", record.level(), record.target(), record.args());
        if let Some(devices) = self.devices.lock().as_ref() {
            devices.write_log(&line);
        }
        if self.channel.is_enabled() {
            self.channel.print(&line);
        }
    }

    fn flush(&self) {}
}
