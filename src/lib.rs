//! Emulated-resource layer for the Saoirse boot stack.
//!
//! After the security coprocessor has been exploited, this crate runs as the
//! resident "system process" and impersonates three kernel device services:
//! the internal filesystem (`/dev/fs`), the optical-disc interface
//! (`/dev/di`) and the title service (`/dev/es`). Requests that target
//! replaced content are answered from FAT volumes on external storage or
//! from a virtual disc image; everything else is reissued against the real
//! kernel service and the reply forwarded unchanged.
//!
//! The crate only relies on the host kernel for a handful of primitives,
//! all of which sit behind trait seams ([`KernelIpc`], [`hook::KernelBus`],
//! [`storage::sd::SdioPort`], [`storage::usb::UsbPort`],
//! [`time::TickSource`]) so the full request path can be exercised on a
//! stock toolchain with in-memory fakes.

#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

pub use crate::channel::IpcLog;
pub use crate::channel::LogIoctl;
pub use crate::channel::LogReply;
pub use crate::config::Config;
pub use crate::error::DiError;
pub use crate::error::EsError;
pub use crate::error::FsError;
pub use crate::error::IosError;
pub use crate::ipc::Caller;
pub use crate::ipc::Command;
pub use crate::ipc::OpenMode;
pub use crate::ipc::Reply;
pub use crate::ipc::Request;
pub use crate::ipc::RequestBody;
pub use crate::ipc::SeekOrigin;
pub use crate::ipc::Vectors;
pub use crate::queue::Queue;
pub use crate::resource::KernelIpc;
pub use crate::resource::Resource;
pub use crate::resource::RouteHandle;
pub use crate::resource::Router;
pub use crate::resource::Session;
pub use crate::storage::SectorDevice;
pub use crate::storage::devmgr::DeviceManager;
pub use crate::storage::devmgr::Drive;
pub use crate::system::System;
pub use crate::system::SystemDeps;
pub use crate::time::TimeBase;

pub mod abi;
pub mod channel;
pub mod config;
pub mod disc;
pub mod emu;
pub mod error;
pub mod hook;
pub mod hw;
pub mod ipc;
pub mod queue;
pub mod resource;
pub mod storage;
pub mod system;
pub mod time;
mod util;
