//! System bootstrap.
//!
//! Owns every singleton (the clock, the crypto engines, the notification
//! channel, the device manager and the three emulators) and drives the
//! startup sequence: background threads first, then the blocking wait for
//! the host's start-game rendezvous, then alias registration, and only
//! after every alias is in place the kernel patch. Rewritten paths must
//! never dispatch into a void, so that ordering is load-bearing.

use std::fmt;
use std::sync::Arc;
use std::sync::OnceLock;
use std::thread;

use log::error;
use log::info;

use crate::channel::IpcLog;
use crate::channel::IpcLogService;
use crate::config::Config;
use crate::disc::SplitImage;
use crate::disc::VirtualDisc;
use crate::emu::di::EmuDi;
use crate::emu::es::EmuEs;
use crate::emu::es::TitleContext;
use crate::emu::fs::EmuFs;
use crate::hook::HookError;
use crate::hook::KernelBus;
use crate::hw::aes::AesEngine;
use crate::hw::sha::ShaEngine;
use crate::resource::KernelIpc;
use crate::resource::Router;
use crate::resource::Session;
use crate::storage::devmgr::DeviceManager;
use crate::storage::devmgr::Drive;
use crate::storage::devmgr::MediaSource;
use crate::time::TickSource;
use crate::time::TimeBase;

/// Trusted-mode base of the hardware control registers.
pub const HW_BASE_TRUSTED: u32 = 0x0D80_0000;

/// Video-solid register: painting it is the only output path left when
/// startup dies.
pub const ACR_VISOLID: u32 = 0x24;

/// Solid-fill diagnostic colors, YUV packed.
pub mod panic_color {
    /// Channel registration failed.
    pub const WHITE: u32 = 0xEB80_EB80;
    /// Bootstrap resource allocation failed.
    pub const YELLOW: u32 = 0xD210_D292;
    /// Kernel write failed.
    pub const PINK: u32 = 0x786E_78F0;
}

/// Paint the screen and halt. There is no recovery: the exploit that got
/// us here cannot be replayed.
pub fn fatal(bus: &mut dyn KernelBus, color: u32) -> ! {
    error!("fatal startup error, painting {color:08x}");
    bus.write32(HW_BASE_TRUSTED + ACR_VISOLID, color | 1);
    // On target this parks the thread forever; the hosted build winds up
    // the stack instead so tests can observe it.
    panic!("unrecoverable startup failure");
}

static KOREAN_KEY: OnceLock<[u8; 16]> = OnceLock::new();

/// The imported Korean common key, when the running kernel carries one.
pub(crate) fn korean_key() -> Option<[u8; 16]> {
    KOREAN_KEY.get().copied()
}

/// Read the region common key out of kernel memory. The location varies
/// by kernel version; the loader passes the right one for the image it
/// exploited.
pub fn import_korean_common_key(bus: &dyn KernelBus, addr: u32) {
    let mut key = [0u8; 16];
    for (i, chunk) in key.chunks_mut(4).enumerate() {
        chunk.copy_from_slice(&bus.read32(addr + 4 * i as u32).to_be_bytes());
    }
    let _ = KOREAN_KEY.set(key);
}

/// Everything the environment has to provide for the system to come up.
pub struct SystemDeps {
    /// The real kernel services to forward to.
    pub kernel: Arc<dyn KernelIpc>,
    /// The free-running hardware counter.
    pub ticks: Arc<dyn TickSource>,
    /// Compiled-in policy.
    pub config: Config,
}

impl fmt::Debug for SystemDeps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SystemDeps").finish_non_exhaustive()
    }
}

/// The services arena. Emulator threads hold shared handles to the
/// channel; the channel knows none of them, so notifications flow one way.
pub struct System {
    config: Config,
    kernel: Arc<dyn KernelIpc>,
    router: Arc<Router>,
    channel: Arc<IpcLog>,
    devices: Arc<DeviceManager>,
    time: Arc<TimeBase>,
    aes: Arc<AesEngine>,
    sha: Arc<ShaEngine>,
    title_ctx: Arc<TitleContext>,
}

impl fmt::Debug for System {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("System")
            .field("router", &self.router)
            .finish_non_exhaustive()
    }
}

impl System {
    /// Build the arena and register the notification channel. The channel
    /// must exist before anything can log towards the host.
    pub fn new(deps: SystemDeps) -> Arc<System> {
        let time = TimeBase::new(Arc::clone(&deps.ticks));
        let channel = IpcLog::new(Arc::clone(&time));
        let router = Arc::new(Router::new(Arc::clone(&deps.kernel)));
        let devices = DeviceManager::new(deps.config.clone(), Arc::clone(&time));
        devices.set_event_sink(Arc::clone(&channel));

        let session = Session::new(IpcLogService::new(Arc::clone(&channel)));
        router.register(crate::channel::DEVICE_PATH, session.port());
        let _ = session.spawn("ipclog");

        Arc::new(System {
            config: deps.config,
            kernel: deps.kernel,
            router,
            channel,
            devices,
            time,
            aes: Arc::new(AesEngine::new()),
            sha: Arc::new(ShaEngine::new()),
            title_ctx: TitleContext::new(),
        })
    }

    /// The open-path router, i.e. the resource-manager table.
    pub fn router(&self) -> Arc<Router> {
        Arc::clone(&self.router)
    }

    /// The host notification channel.
    pub fn channel(&self) -> Arc<IpcLog> {
        Arc::clone(&self.channel)
    }

    /// The storage manager.
    pub fn devices(&self) -> Arc<DeviceManager> {
        Arc::clone(&self.devices)
    }

    /// The shared clock.
    pub fn time(&self) -> Arc<TimeBase> {
        Arc::clone(&self.time)
    }

    /// The SHA engine singleton.
    pub fn sha(&self) -> Arc<ShaEngine> {
        Arc::clone(&self.sha)
    }

    /// Attach a physical medium to a drive slot.
    pub fn attach_media(&self, drive: Drive, source: Box<dyn MediaSource>) {
        self.devices.attach(drive, source);
    }

    /// Start the clock updater and the storage poller.
    pub fn spawn_background(&self) {
        let _ = self.time.spawn_updater();
        let _ = self.devices.spawn();
    }

    /// Route every `log` record to the host channel and the log file.
    pub fn install_logger(self: &Arc<Self>) {
        let logger = crate::channel::ChannelLogger::new(Arc::clone(&self.channel))
            .with_file_sink(Arc::clone(&self.devices));
        if log::set_boxed_logger(Box::new(logger)).is_ok() {
            log::set_max_level(log::LevelFilter::Info);
        }
    }

    /// Bring up the three emulated services and register their aliases.
    /// Returns once every alias is visible, which is the precondition for
    /// installing the open hook.
    ///
    /// `disc_paths` names the virtual-disc image part(s) on the SD slot;
    /// empty means no disc emulation and pass-through to the real drive.
    pub fn start_emulators(self: &Arc<Self>, disc_paths: &[&str]) {
        let fs = EmuFs::new(
            self.config.clone(),
            Arc::clone(&self.devices),
            Arc::clone(&self.kernel),
        );
        let fs_session = Session::new(fs);
        self.router
            .register(crate::emu::fs::DIRECT_PATH, fs_session.port());
        self.router.register("$", fs_session.port());
        let _ = fs_session.spawn("emufs");
        self.channel.notify();

        let disc = if disc_paths.is_empty() {
            None
        } else {
            match SplitImage::open(
                Arc::clone(&self.devices),
                Drive::Sd,
                Arc::clone(&self.aes),
                Arc::clone(&self.title_ctx),
                disc_paths,
            ) {
                Ok(image) => Some(VirtualDisc::SplitImage(image)),
                Err(e) => {
                    error!("failed to open the disc image: {e:?}");
                    None
                }
            }
        };
        let di_session = Session::new(EmuDi::new(
            Arc::clone(&self.devices),
            Arc::clone(&self.kernel),
            disc,
        ));
        self.router
            .register(crate::emu::di::ALIAS_PATH, di_session.port());
        let _ = di_session.spawn("emudi");
        self.channel.notify();

        let es_session = Session::new(EmuEs::new(
            Arc::clone(&self.kernel),
            Arc::clone(&self.title_ctx),
        ));
        self.router
            .register(crate::emu::es::ALIAS_PATH, es_session.port());
        let _ = es_session.spawn("emues");
        self.channel.notify();

        info!("emulated services registered");
    }

    /// Patch the kernel's open syscall so host paths route to the
    /// aliases. Every emulator must have registered before this runs.
    pub fn install_open_hook(
        &self,
        bus: &mut dyn KernelBus,
        substitute: u32,
    ) -> Result<u32, HookError> {
        crate::hook::patch_open_syscall(bus, substitute)
    }

    /// The full bring-up: background threads, the start-game rendezvous,
    /// services, kernel patch, then park forever while the handler
    /// threads run.
    pub fn run(self: &Arc<Self>, bus: &mut dyn KernelBus, substitute: u32, disc_paths: &[&str]) -> ! {
        self.spawn_background();

        info!("waiting for the start request");
        self.channel.wait_for_start();
        info!("starting up the game services");

        self.start_emulators(disc_paths);
        if let Err(e) = self.install_open_hook(bus, substitute) {
            error!("open hook installation failed: {e:?}");
            fatal(bus, panic_color::YELLOW);
        }

        loop {
            thread::park();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::LogIoctl;
    use crate::emu::fs::tests::FakeRealFs;
    use crate::hook::tests::FakeKernel;
    use crate::ipc::Caller;
    use crate::ipc::OpenMode;
    use crate::storage::devmgr::tests::manager_with_sd;
    use crate::time::tests::FakeTicks;
    use std::sync::atomic::Ordering;

    fn system_with_sd() -> (Arc<System>, Arc<FakeRealFs>) {
        let kernel = Arc::new(FakeRealFs::default());
        let system = System::new(SystemDeps {
            kernel: Arc::clone(&kernel) as Arc<dyn KernelIpc>,
            ticks: Arc::new(FakeTicks::default()),
            config: Config::default(),
        });

        // Borrow the mounted-SD fixture: move its media into this
        // system's manager.
        let (mgr, present) = manager_with_sd();
        present.store(true, Ordering::Relaxed);
        mgr.poll_once();
        mgr.with_volume(Drive::Sd, |vol| {
            vol.create_dir("/title").ok();
            vol.create_dir("/title/00010004").ok();
            vol.create_dir("/title/00010004/524d4350").ok();
            vol.create_dir("/title/00010004/524d4350/data").ok();
            vol.create_file_new("/title/00010004/524d4350/data/save.bin")?;
            vol.write_at("/title/00010004/524d4350/data/save.bin", 0, b"system test data")?;
            Ok(0)
        })
        .unwrap();
        let device = mgr.cluster_source(Drive::Sd).unwrap().0;
        system.attach_media(
            Drive::Sd,
            Box::new(crate::storage::devmgr::tests::FakeMedia {
                present: Arc::new(std::sync::atomic::AtomicBool::new(true)),
                device,
            }),
        );
        system.devices().poll_once();
        (system, kernel)
    }

    #[test]
    fn aliases_route_after_start() {
        let (system, _kernel) = system_with_sd();
        system.start_emulators(&[]);

        let router = system.router();
        // The drive alias answers.
        let di = router.open("~dev/di", 0, Caller::default()).unwrap();
        assert_eq!(di.fd(), 0);
        // The rewritten filesystem path serves from FAT.
        let file = router
            .open(
                "$title/00010004/524d4350/data/save.bin",
                OpenMode::READ.bits(),
                Caller::default(),
            )
            .unwrap();
        let (n, data) = file.read(16);
        assert_eq!(n, 16);
        assert_eq!(&data, b"system test data");
        assert_eq!(file.close(), 0);
    }

    #[test]
    fn start_game_rendezvous_through_the_channel() {
        let (system, _kernel) = system_with_sd();
        let router = system.router();
        let channel = router.open("/dev/saoirse", 0, Caller::default()).unwrap();
        let (ret, _) = channel.ioctl(LogIoctl::StartGameEvent as u32, &[], 0);
        assert_eq!(ret, 0);
        // Does not block: the token is queued.
        system.channel().wait_for_start();
    }

    #[test]
    fn hook_install_after_registration() {
        let (system, _kernel) = system_with_sd();
        system.start_emulators(&[]);
        let mut bus = FakeKernel::populated(0xFFFF_4000, 0x40);
        let site = system.install_open_hook(&mut bus, 0x13A8_0000).unwrap();
        assert_eq!(site, 0xFFFF_4000 - 0x40 + 2);
    }

    #[test]
    fn korean_key_import_reads_kernel_words() {
        let mut bus = FakeKernel::new();
        for i in 0..4u32 {
            bus.put32(0xFFFF_8000 + i * 4, 0x0101_0101 * (i + 1));
        }
        import_korean_common_key(&bus, 0xFFFF_8000);
        let key = korean_key().unwrap();
        assert_eq!(&key[0..4], &[1, 1, 1, 1]);
        assert_eq!(&key[12..16], &[4, 4, 4, 4]);
    }
}
