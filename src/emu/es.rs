//! Emulated title/entitlement service.
//!
//! Nearly everything forwards to the real service after the same vector
//! validation it would do itself. The interceptions are narrow and
//! deliberate: partition verification caches the running title's identity
//! so `GetTitleID` can answer with it, and a launch of any kernel title
//! other than the system menu is rewritten into a launch of the system
//! menu, which is what keeps the game from rebooting back into the
//! unpatched world.

use std::sync::Arc;

use log::error;
use log::info;
use log::warn;
use num_enum::TryFromPrimitive;
use parking_lot::Mutex;
use zerocopy::FromBytes;
use zerocopy::IntoBytes;

use crate::abi::Ticket;
use crate::abi::TicketInfo;
use crate::abi::TicketView;
use crate::error::EsError;
use crate::error::IosError;
use crate::ipc::MAX_VECTORS;
use crate::ipc::Request;
use crate::ipc::RequestBody;
use crate::ipc::Vectors;
use crate::resource::KernelIpc;
use crate::resource::Resource;

/// Alias the open hook rewrites `/dev/es` onto.
pub const ALIAS_PATH: &str = "~dev/es";

/// The real service's path.
pub const REAL_PATH: &str = "/dev/es";

/// Title the launch policy redirects to: the system menu.
pub const SYSTEM_MENU: u64 = 0x0000_0001_0000_0002;

/// Ioctlv numbers of the title service.
#[derive(Clone, Copy, Debug, Eq, PartialEq, TryFromPrimitive)]
#[repr(u32)]
#[allow(missing_docs)]
pub enum EsIoctl {
    GetDeviceId = 0x07,
    LaunchTitle = 0x08,
    GetOwnedTitlesCount = 0x0C,
    GetTitlesCount = 0x0E,
    GetTitles = 0x0F,
    GetTitleContentsCount = 0x10,
    GetTitleContents = 0x11,
    GetNumTicketViews = 0x12,
    GetTicketViews = 0x13,
    GetTmdViewCount = 0x14,
    GetTmdViews = 0x15,
    GetDataDir = 0x1D,
    GetDeviceCert = 0x1E,
    GetTitleId = 0x20,
}

/// The running title's asserted identity, set when a disc partition is
/// verified and consulted by `GetTitleID`. Shared between the disc layer
/// (writer) and this service (reader).
#[derive(Debug, Default)]
pub struct TitleContext {
    state: Mutex<Option<(u64, TicketInfo)>>,
}

impl TitleContext {
    /// Create an empty context.
    pub fn new() -> Arc<TitleContext> {
        Arc::new(TitleContext::default())
    }

    /// Record the identity a partition open asserts. The ticket must
    /// agree with the claimed title.
    pub fn di_verify(&self, title_id: u64, ticket: &Ticket) -> Result<(), EsError> {
        if ticket.info.title_id.get() != title_id {
            return Err(EsError::InvalidTicket);
        }
        *self.state.lock() = Some((title_id, ticket.info));
        Ok(())
    }

    /// The cached identity, once a partition has been verified.
    pub fn title_id(&self) -> Option<u64> {
        (*self.state.lock()).map(|(id, _)| id)
    }

    /// Minimal ticket view of the verified title.
    pub fn ticket_view(&self) -> Option<TicketView> {
        (*self.state.lock()).map(|(_, info)| TicketView {
            view: 0.into(),
            info,
        })
    }
}

/// The emulated title service.
pub struct EmuEs {
    kernel: Arc<dyn KernelIpc>,
    real_fd: i32,
    title_ctx: Arc<TitleContext>,
}

impl std::fmt::Debug for EmuEs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmuEs").field("real_fd", &self.real_fd).finish_non_exhaustive()
    }
}

fn vec_u64(v: &[u8]) -> Option<u64> {
    (v.len() == 8).then(|| u64::from_be_bytes(v.try_into().unwrap()))
}

fn vec_u32(v: &[u8]) -> Option<u32> {
    (v.len() == 4).then(|| u32::from_be_bytes(v.try_into().unwrap()))
}

impl EmuEs {
    /// Open the real service and stand up the emulator in front of it.
    pub fn new(kernel: Arc<dyn KernelIpc>, title_ctx: Arc<TitleContext>) -> EmuEs {
        let real_fd = kernel.open(REAL_PATH, 0);
        if real_fd < 0 {
            error!("failed to open {REAL_PATH}: {real_fd}");
        }
        EmuEs {
            kernel,
            real_fd,
            title_ctx,
        }
    }

    fn forward(&self, cmd: u32, vectors: Vectors<'_>) -> i32 {
        self.kernel.ioctlv(self.real_fd, cmd, vectors)
    }

    /// Fetch one ticket view for `title_id` from the real service.
    fn fetch_ticket_view(&self, title_id: u64) -> Result<TicketView, i32> {
        let input = [title_id.to_be_bytes().to_vec(), 1u32.to_be_bytes().to_vec()];
        let mut output = [vec![0u8; size_of::<TicketView>()]];
        let ret = self.forward(
            EsIoctl::GetTicketViews as u32,
            Vectors {
                input: &input,
                output: &mut output,
            },
        );
        if ret != 0 {
            return Err(ret);
        }
        TicketView::read_from_bytes(&output[0]).map_err(|_| EsError::Invalid.into())
    }

    fn launch_title(&self, vectors: Vectors<'_>) -> i32 {
        if vectors.input.len() != 2 || !vectors.output.is_empty() {
            warn!("LaunchTitle: wrong vector count");
            return EsError::Invalid.into();
        }
        let Some(title_id) = vec_u64(&vectors.input[0]) else {
            warn!("LaunchTitle: wrong title ID size");
            return EsError::Invalid.into();
        };
        if vectors.input[1].len() != size_of::<TicketView>() {
            warn!("LaunchTitle: wrong ticket view size");
            return EsError::Invalid.into();
        }

        // A reboot into a kernel title would leave the patched world
        // behind; send those launches to the system menu instead.
        let (target, view) = if title_id >> 32 == 1 && title_id & 0xFFFF_FFFF != 2 {
            warn!("LaunchTitle: attempt to launch kernel title {title_id:016x}");
            match self.fetch_ticket_view(SYSTEM_MENU) {
                Ok(view) => (SYSTEM_MENU, view.as_bytes().to_vec()),
                Err(e) => return e,
            }
        } else {
            (title_id, vectors.input[1].clone())
        };

        info!("LaunchTitle: launching {target:016x}");
        let input = [target.to_be_bytes().to_vec(), view];
        self.forward(
            EsIoctl::LaunchTitle as u32,
            Vectors {
                input: &input,
                output: &mut [],
            },
        )
    }

    fn dispatch(&mut self, cmd: u32, vectors: Vectors<'_>) -> i32 {
        if vectors.input.len() > MAX_VECTORS || vectors.output.len() > MAX_VECTORS {
            return EsError::Invalid.into();
        }

        let Ok(ioctl) = EsIoctl::try_from(cmd) else {
            error!("invalid ioctlv {cmd}");
            return EsError::Invalid.into();
        };

        // The counts and sizes below reproduce the real service's own
        // validation; anything that passes is forwarded untouched.
        match ioctl {
            EsIoctl::GetDeviceId | EsIoctl::GetOwnedTitlesCount | EsIoctl::GetTitlesCount => {
                if !vectors.input.is_empty() || vectors.output.len() != 1 {
                    return EsError::Invalid.into();
                }
                if vectors.output[0].len() != 4 {
                    return EsError::Invalid.into();
                }
                self.forward(cmd, vectors)
            }

            EsIoctl::LaunchTitle => self.launch_title(vectors),

            EsIoctl::GetTitles => {
                if vectors.input.len() != 1 || vectors.output.len() != 1 {
                    return EsError::Invalid.into();
                }
                let Some(count) = vec_u32(&vectors.input[0]) else {
                    return EsError::Invalid.into();
                };
                if vectors.output[0].len() as u64 != u64::from(count) * 8 {
                    return EsError::Invalid.into();
                }
                self.forward(cmd, vectors)
            }

            EsIoctl::GetTitleContentsCount => {
                if vectors.input.len() != 1 || vectors.output.len() != 1 {
                    return EsError::Invalid.into();
                }
                if vec_u64(&vectors.input[0]).is_none() || vectors.output[0].len() != 4 {
                    return EsError::Invalid.into();
                }
                self.forward(cmd, vectors)
            }

            EsIoctl::GetTitleContents => {
                if vectors.input.len() != 2 || vectors.output.len() != 1 {
                    return EsError::Invalid.into();
                }
                let count = match (vec_u64(&vectors.input[0]), vec_u32(&vectors.input[1])) {
                    (Some(_), Some(count)) => count,
                    _ => return EsError::Invalid.into(),
                };
                if vectors.output[0].len() as u64 != u64::from(count) * 4 {
                    return EsError::Invalid.into();
                }
                self.forward(cmd, vectors)
            }

            EsIoctl::GetNumTicketViews => {
                if vectors.input.len() != 1 || vectors.output.len() != 1 {
                    return EsError::Invalid.into();
                }
                if vec_u64(&vectors.input[0]).is_none() || vectors.output[0].len() != 4 {
                    return EsError::Invalid.into();
                }
                self.forward(cmd, vectors)
            }

            EsIoctl::GetTicketViews => {
                if vectors.input.len() != 2 || vectors.output.len() != 1 {
                    return EsError::Invalid.into();
                }
                let count = match (vec_u64(&vectors.input[0]), vec_u32(&vectors.input[1])) {
                    (Some(_), Some(count)) => count,
                    _ => return EsError::Invalid.into(),
                };
                if vectors.output[0].len() as u64
                    != u64::from(count) * size_of::<TicketView>() as u64
                {
                    return EsError::Invalid.into();
                }
                self.forward(cmd, vectors)
            }

            EsIoctl::GetTmdViewCount => {
                if vectors.input.len() != 1 || vectors.output.len() != 1 {
                    return EsError::Invalid.into();
                }
                if vec_u64(&vectors.input[0]).is_none() || vectors.output[0].len() != 4 {
                    return EsError::Invalid.into();
                }
                self.forward(cmd, vectors)
            }

            EsIoctl::GetTmdViews => {
                if vectors.input.len() != 1 || vectors.output.len() != 1 {
                    return EsError::Invalid.into();
                }
                if vec_u64(&vectors.input[0]).is_none() {
                    return EsError::Invalid.into();
                }
                self.forward(cmd, vectors)
            }

            EsIoctl::GetDataDir => {
                if vectors.input.len() != 1 || vectors.output.len() != 1 {
                    return EsError::Invalid.into();
                }
                if vec_u64(&vectors.input[0]).is_none() || vectors.output[0].len() != 30 {
                    return EsError::Invalid.into();
                }
                self.forward(cmd, vectors)
            }

            EsIoctl::GetDeviceCert => {
                if !vectors.input.is_empty() || vectors.output.len() != 1 {
                    return EsError::Invalid.into();
                }
                if vectors.output[0].len() != 0x180 {
                    return EsError::Invalid.into();
                }
                self.forward(cmd, vectors)
            }

            EsIoctl::GetTitleId => {
                if !vectors.input.is_empty() || vectors.output.len() != 1 {
                    return EsError::Invalid.into();
                }
                if vectors.output[0].len() != 8 {
                    return EsError::Invalid.into();
                }
                if let Some(title_id) = self.title_ctx.title_id() {
                    vectors.output[0].copy_from_slice(&title_id.to_be_bytes());
                    return 0;
                }
                self.forward(cmd, vectors)
            }
        }
    }
}

impl Resource for EmuEs {
    fn handle_request(&mut self, mut req: Request) {
        let result = match &mut req.body {
            RequestBody::Open { path, .. } => {
                if path == ALIAS_PATH {
                    0
                } else {
                    IosError::NotFound.into()
                }
            }
            RequestBody::Close => 0,
            RequestBody::Ioctlv { cmd, input, output } => {
                self.dispatch(*cmd, Vectors { input, output })
            }
            other => {
                error!("invalid command {:?}", other.command());
                EsError::Invalid.into()
            }
        };
        req.reply(result);
    }
}
