//! Error taxonomy of the impersonated services.
//!
//! Every reply carries its status in the request's result slot as a small
//! integer; negative means failure for the kernel and filesystem services,
//! while the disc interface uses the drive's positive bit codes. The
//! emulators must reproduce these values exactly, because the calling game
//! switches on them.

use std::fmt;

/// Errors returned by the kernel IPC layer itself (open routing, bad
/// descriptors, malformed requests).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(i32)]
pub enum IosError {
    /// Caller identity does not permit the operation.
    NoAccess = -1,
    /// Malformed request.
    Invalid = -4,
    /// No resource manager accepted the path.
    NotFound = -6,
}

impl From<IosError> for i32 {
    fn from(e: IosError) -> i32 {
        e as i32
    }
}

/// Errors of the internal filesystem service, reproduced verbatim by the
/// filesystem emulator.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(i32)]
pub enum FsError {
    /// Malformed ioctl, bad descriptor, bad path, bad whence.
    Invalid = -101,
    /// Operation refused (mode mismatch, Format, rename policy).
    NoAccess = -102,
    /// The backing filesystem is damaged.
    Corrupt = -103,
    /// The backing device is not ready.
    NotReady = -104,
    /// Create target already exists.
    Exists = -105,
    /// Path does not exist.
    NotFound = -106,
    /// No free descriptor slot.
    MaxOpen = -109,
    /// Directory nesting limit exceeded.
    MaxDepth = -110,
    /// Descriptor is in use elsewhere.
    Locked = -111,
    /// Anything the adapter cannot classify.
    Unknown = -117,
}

impl From<FsError> for i32 {
    fn from(e: FsError) -> i32 {
        e as i32
    }
}

impl fmt::Display for FsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Result alias for filesystem-service operations. The `i32` success value
/// is whatever the operation reports through the result slot (descriptor,
/// byte count, file position).
pub type FsResult = Result<i32, FsError>;

/// Collapse an [`FsResult`] into the raw result-slot value.
pub(crate) fn fs_reply(res: FsResult) -> i32 {
    match res {
        Ok(v) => v,
        Err(e) => e.into(),
    }
}

/// Status codes of the disc-drive service. Unlike the other services these
/// are positive bit flags; `Ok` itself is bit 0.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(i32)]
pub enum DiError {
    /// Command completed.
    Ok = 0x1,
    /// Medium or image read failed.
    Drive = 0x2,
    /// Lid state interrupt.
    CoverClosed = 0x4,
    /// Drive timeout.
    Timeout = 0x10,
    /// Rejected by the drive's access policy.
    Security = 0x20,
    /// Partition signature verification failed.
    Verify = 0x40,
    /// Malformed command block.
    Invalid = 0x80,
}

impl From<DiError> for i32 {
    fn from(e: DiError) -> i32 {
        e as i32
    }
}

/// Result alias for drive commands; the success payload is always unit, the
/// reply value [`DiError::Ok`].
pub type DiResult = Result<(), DiError>;

pub(crate) fn di_reply(res: DiResult) -> i32 {
    match res {
        Ok(()) => DiError::Ok.into(),
        Err(e) => e.into(),
    }
}

/// Errors of the title/entitlement service.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(i32)]
pub enum EsError {
    /// Unrecognized public key type in a signature.
    InvalidPubKeyType = -1005,
    /// Read from the title store failed.
    ReadError = -1009,
    /// Write to the title store failed.
    WriteError = -1010,
    /// Unrecognized signature type.
    InvalidSigType = -1012,
    /// Too many open title contexts.
    MaxOpen = -1016,
    /// Malformed ioctlv.
    Invalid = -1017,
    /// Ticket is bound to a different console.
    DeviceIdMatch = -1020,
    /// Content hash mismatch.
    HashMatch = -1022,
    /// Allocation failure inside the service.
    NoMemory = -1024,
    /// Caller identity does not permit the operation.
    NoAccess = -1026,
    /// Certificate issuer not found.
    IssuerNotFound = -1027,
    /// No ticket installed for the title.
    TicketNotFound = -1028,
    /// Ticket failed validation.
    InvalidTicket = -1029,
    /// Boot stage is too old for the title.
    OutdatedBoot2 = -1031,
    /// Per-ticket launch limit reached.
    TicketLimit = -1033,
    /// Title version is below the required minimum.
    OutdatedTitle = -1035,
    /// The title's required kernel version is absent.
    RequiredSystemVersion = -1036,
    /// TMD content count disagrees with the store.
    WrongTmdContentCount = -1037,
    /// No TMD installed for the title.
    NoTmd = -1039,
}

impl From<EsError> for i32 {
    fn from(e: EsError) -> i32 {
        e as i32
    }
}

/// Result alias for title-service commands.
pub type EsResult = Result<(), EsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_slot_values() {
        assert_eq!(i32::from(FsError::Invalid), -101);
        assert_eq!(i32::from(FsError::Unknown), -117);
        assert_eq!(i32::from(DiError::Ok), 1);
        assert_eq!(i32::from(DiError::Security), 0x20);
        assert_eq!(i32::from(EsError::InvalidTicket), -1029);
        assert_eq!(fs_reply(Ok(42)), 42);
        assert_eq!(fs_reply(Err(FsError::NotFound)), -106);
        assert_eq!(di_reply(Ok(())), 1);
    }
}
